/*!
Configuration management for the stimulation bridge.
*/

use serde::{Deserialize, Serialize};
use shared::protocol::DEFAULT_SETTLE_DELAY_MS;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

impl AppConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse config file as TOML")?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Reject values the hardware loop cannot run with
    pub fn validate(&self) -> Result<()> {
        let acq = &self.acquisition;
        if !(acq.sample_rate_hz.is_finite() && acq.sample_rate_hz > 0.0) {
            anyhow::bail!("acquisition.sample_rate_hz must be positive, got {}", acq.sample_rate_hz);
        }
        if acq.samples_per_frame == 0 {
            anyhow::bail!("acquisition.samples_per_frame must be at least 1");
        }
        if acq.buffer_size < acq.samples_per_frame {
            anyhow::bail!(
                "acquisition.buffer_size ({}) must hold at least one frame ({})",
                acq.buffer_size,
                acq.samples_per_frame
            );
        }
        if !(self.output.output_rate_hz.is_finite() && self.output.output_rate_hz > 0.0) {
            anyhow::bail!("output.output_rate_hz must be positive, got {}", self.output.output_rate_hz);
        }
        Ok(())
    }
}

/// Connection to the control-plane server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Server address
    pub server_addr: String,

    /// Server TCP port
    pub server_port: u16,

    /// Give up connecting after this many milliseconds
    pub connect_timeout_ms: u64,

    /// Largest inbound message accepted
    pub max_frame_bytes: usize,

    /// Outbound messages queued before data frames are dropped
    pub send_queue_size: usize,
}

impl NetworkConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.server_addr, self.server_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1".to_string(),
            server_port: 8124,
            connect_timeout_ms: 5000,
            max_frame_bytes: 1024 * 1024,
            send_queue_size: 1000,
        }
    }
}

/// Analog input sampling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Sample clock rate per channel
    pub sample_rate_hz: f64,

    /// Samples per channel in one data frame
    pub samples_per_frame: usize,

    /// Driver-side input buffer per channel
    pub buffer_size: usize,

    /// Input range is [-max_volt, max_volt]
    pub max_volt: f64,

    /// Log throughput every N frames
    pub stats_interval_frames: u64,
}

impl AcquisitionConfig {
    /// Wall-clock time covered by one frame
    pub fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(self.samples_per_frame as f64 / self.sample_rate_hz)
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 1000.0,
            samples_per_frame: 10,
            buffer_size: 1000,
            max_volt: 10.0,
            stats_interval_frames: 1000,
        }
    }
}

/// Stimulation output generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Pause after the output reports completion
    pub settle_delay_ms: u64,

    /// Longest wait for the output to report completion
    pub completion_timeout_ms: u64,

    /// Output sample clock rate
    pub output_rate_hz: f64,
}

impl OutputConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            completion_timeout_ms: 5000,
            output_rate_hz: 1000.0,
        }
    }
}

/// Resource files read at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Channel configuration descriptor (JSON)
    pub channel_config: PathBuf,

    /// Device descriptor sent verbatim on registration
    pub device_descriptor: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            channel_config: PathBuf::from("Resources/channel-config.json"),
            device_descriptor: PathBuf::from("Resources/device-descriptor.json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_roundtrip() {
        let original_config = AppConfig::new();

        let temp_file = NamedTempFile::new().unwrap();
        let temp_path = temp_file.path();

        // Save and load
        original_config.save_to_file(temp_path).unwrap();
        let loaded_config = AppConfig::load_from_file(temp_path).unwrap();

        // Compare (using debug format since we don't have PartialEq)
        assert_eq!(format!("{:?}", original_config), format!("{:?}", loaded_config));
    }

    #[test]
    fn test_default_values() {
        let config = AppConfig::new();

        assert_eq!(config.network.endpoint(), "127.0.0.1:8124");
        assert_eq!(config.acquisition.sample_rate_hz, 1000.0);
        assert_eq!(config.acquisition.samples_per_frame, 10);
        assert_eq!(config.acquisition.buffer_size, 1000);
        assert_eq!(config.acquisition.frame_period(), Duration::from_millis(10));
        assert_eq!(config.output.settle_delay(), Duration::from_millis(500));
        assert_eq!(config.paths.channel_config, PathBuf::from("Resources/channel-config.json"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(
            temp_file.path(),
            "[output]\nsettle_delay_ms = 20\ncompletion_timeout_ms = 100\noutput_rate_hz = 2000.0\n",
        )
        .unwrap();

        let config = AppConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.output.settle_delay_ms, 20);
        assert_eq!(config.network.server_port, 8124);
    }

    #[test]
    fn test_validation() {
        let mut config = AppConfig::new();
        config.acquisition.samples_per_frame = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::new();
        config.acquisition.buffer_size = 5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::new();
        config.acquisition.sample_rate_hz = 0.0;
        assert!(config.validate().is_err());
    }
}
