/*!
# Stimulation Bridge

Bridges a continuously sampled data-acquisition device to the network
control plane of a closed-loop electrical-stimulation rig.

## Features

- Continuous, hardware-paced acquisition of stimulation current loopback
  and electrode voltage, streamed as JSON data frames
- Serialized application of inbound control commands: amplitude, pulse
  length and channel switching
- Pulse-train synthesis for single-output and dual (switched) devices
- Lock-free publication of the protocol state from the control path to
  the acquisition path
- Simulated device backend with output-to-input loopback

## Usage

### Run the bridge (default)
```bash
stimbridge --config stimbridge.toml
```

### Override the server endpoint
```bash
stimbridge run --server 10.0.0.5 --port 8124
```

### Generate a configuration file
```bash
stimbridge config --output stimbridge.toml
```
*/

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use shared::ChannelConfig;
use stimbridge::applicator::ControlFrameApplicator;
use stimbridge::config::AppConfig;
use stimbridge::control;
use stimbridge::hardware::ChannelSwitch;
use stimbridge::protocol::ProtocolCore;
use stimbridge::simulated::SimulatedDaq;
use stimbridge::transport::TcpTransport;

#[derive(Parser)]
#[command(name = "stimbridge")]
#[command(about = "Acquisition and stimulation-control bridge")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "stimbridge.toml")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the server and start streaming
    Run {
        /// Server address, overrides the configuration file
        #[arg(short, long)]
        server: Option<String>,

        /// Server port, overrides the configuration file
        #[arg(short, long)]
        port: Option<u16>,

        /// Inject a simulated acquisition fault after this many frames
        #[arg(long)]
        fail_after: Option<u64>,
    },

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "stimbridge.toml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Some(Commands::Config { output }) => generate_config_file(output),
        Some(Commands::Run { server, port, fail_after }) => run_bridge(cli.config, server, port, fail_after),
        None => run_bridge(cli.config, None, None, None),
    }
}

/// Load configuration, falling back to defaults when the file is missing
fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        AppConfig::load_from_file(path)
    } else {
        warn!("⚠️ Config file {} not found, using defaults", path.display());
        Ok(AppConfig::new())
    }
}

fn run_bridge(config_path: PathBuf, server: Option<String>, port: Option<u16>, fail_after: Option<u64>) -> Result<()> {
    let mut config = load_config(&config_path)?;
    if let Some(server) = server {
        config.network.server_addr = server;
    }
    if let Some(port) = port {
        config.network.server_port = port;
    }

    let channels = ChannelConfig::load_from_file(&config.paths.channel_config).with_context(|| {
        format!(
            "Failed to load channel configuration: {}",
            config.paths.channel_config.display()
        )
    })?;
    let descriptor = std::fs::read_to_string(&config.paths.device_descriptor).with_context(|| {
        format!(
            "Failed to read device descriptor: {}",
            config.paths.device_descriptor.display()
        )
    })?;

    info!(
        "🚀 Starting stimulation bridge for {} ({:?} switching, protocol v{})",
        channels.device_name,
        channels.switch_channel_method,
        shared::VERSION
    );

    let (inbox, queue) = control::queue();
    let transport = Arc::new(TcpTransport::connect(&config.network, inbox.clone())?);
    let mut core = ProtocolCore::new(channels.clone(), transport.clone(), inbox, queue);
    core.register(&descriptor).context("Device registration failed")?;
    info!("setup complete");

    let (input, output, switch) = SimulatedDaq::new(&channels, &config.acquisition, &config.output).split();
    let input = match fail_after {
        Some(frames) => input.fail_after(frames),
        None => input,
    };
    let applicator = ControlFrameApplicator::new(
        channels,
        Box::new(output),
        switch.map(|s| Box::new(s) as Box<dyn ChannelSwitch>),
        &config.output,
    );

    // Set up Ctrl+C handler
    let running = core.running_flag();
    ctrlc::set_handler(move || {
        info!("🛑 Received Ctrl+C, shutting down gracefully...");
        running.store(false, Ordering::SeqCst);
    })?;

    core.start(Box::new(input), applicator, &config.acquisition)?;

    let running = core.running_flag();
    let mut acquisition_reported = false;
    while running.load(Ordering::SeqCst) {
        if !transport.is_connected() {
            warn!("Connection to server lost");
            break;
        }
        if !acquisition_reported && !core.is_acquiring() {
            warn!("⚠️ Acquisition has stopped; control commands are still served");
            acquisition_reported = true;
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    info!("Final protocol state: {:?} (control {:?})", core.state(), core.control_phase());
    let stats = core.shutdown();
    if let Some(acquisition) = stats.acquisition {
        info!(
            "Acquisition: {} frames sent, fault: {:?}",
            acquisition.frames_sent, acquisition.fault
        );
    }
    if transport.dropped_frames() > 0 {
        warn!("{} data frames dropped on a full send queue", transport.dropped_frames());
    }
    if transport.dropped_reports() > 0 {
        warn!("{} error reports dropped on a full send queue", transport.dropped_reports());
    }

    info!("✅ Stimulation bridge stopped");
    Ok(())
}

/// Generate a default configuration file
fn generate_config_file(output_path: PathBuf) -> Result<()> {
    let config = AppConfig::new();
    config.save_to_file(&output_path)?;

    println!("✅ Generated configuration file: {}", output_path.display());
    println!("📝 Edit the file to customize settings, then run:");
    println!("   stimbridge --config {}", output_path.display());

    Ok(())
}
