/*!
Continuous acquisition of loopback current and voltage.

The acquisition loop owns the analog input for its whole life. Each cycle
blocks on the hardware until one frame of samples is in, turns the rows of
the selected stimulation channel into a data frame stamped with the last
shock time, hands it to the transport, and immediately re-arms the read
into the same buffer. A hardware fault ends the loop for good: the input is
released and nothing restarts it.
*/

use crate::config::AcquisitionConfig;
use crate::hardware::{AnalogInput, HardwareError};
use crate::transport::Transport;
use arc_swap::ArcSwap;
use shared::{ChannelConfig, ProtocolState, StimulationDataFrame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Counters reported when the loop exits
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcquisitionStats {
    pub frames_sent: u64,
    pub push_errors: u64,
    pub encode_errors: u64,
    /// Set when the loop ended on a hardware fault
    pub fault: Option<HardwareError>,
}

/// Hardware-paced read loop producing data frames
pub struct AcquisitionLoop {
    input: Box<dyn AnalogInput>,
    channels: ChannelConfig,
    state: Arc<ArcSwap<ProtocolState>>,
    transport: Arc<dyn Transport>,
    running: Arc<AtomicBool>,
    samples_per_frame: usize,
    stats_interval: u64,
}

impl AcquisitionLoop {
    pub fn new(
        input: Box<dyn AnalogInput>,
        channels: ChannelConfig,
        state: Arc<ArcSwap<ProtocolState>>,
        transport: Arc<dyn Transport>,
        running: Arc<AtomicBool>,
        config: &AcquisitionConfig,
    ) -> Self {
        Self {
            input,
            channels,
            state,
            transport,
            running,
            samples_per_frame: config.samples_per_frame,
            stats_interval: config.stats_interval_frames.max(1),
        }
    }

    /// Run until the running flag is cleared or the hardware faults
    pub fn run(mut self) -> AcquisitionStats {
        let mut stats = AcquisitionStats::default();
        let mut buffer = vec![vec![0.0; self.samples_per_frame]; self.input.channel_count()];
        let start_time = Instant::now();

        info!(
            "📡 Acquisition started: {} channels x {} samples per frame",
            buffer.len(),
            self.samples_per_frame
        );

        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.input.read_into(&mut buffer) {
                error!("❌ DAQ fault, stopping acquisition: {}", e);
                stats.fault = Some(e);
                break;
            }

            let bytes = match self.assemble(&buffer) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("Failed to assemble data frame: {}", e);
                    stats.encode_errors += 1;
                    continue;
                }
            };

            match self.transport.push_frame(bytes) {
                Ok(()) => stats.frames_sent += 1,
                Err(e) => {
                    stats.push_errors += 1;
                    debug!("Data frame not sent: {}", e);
                }
            }

            if stats.frames_sent > 0 && stats.frames_sent % self.stats_interval == 0 {
                let elapsed = start_time.elapsed().as_secs_f64();
                info!(
                    "📊 Sent {} frames, {:.1} frames/s, {} push errors",
                    stats.frames_sent,
                    stats.frames_sent as f64 / elapsed.max(f64::EPSILON),
                    stats.push_errors
                );
            }
        }

        self.input.close();

        if stats.fault.is_some() {
            warn!("Acquisition will not restart; resources released");
        }
        info!("📈 Acquisition final stats:");
        info!("   Frames sent: {}", stats.frames_sent);
        info!("   Push errors: {}", stats.push_errors);
        info!("   Encode errors: {}", stats.encode_errors);
        info!("   Duration: {:.1}s", start_time.elapsed().as_secs_f64());

        stats
    }

    /// Build and serialize the frame for the current buffer contents
    fn assemble(&self, buffer: &[Vec<f64>]) -> shared::Result<Vec<u8>> {
        let state = self.state.load();
        let offset = self.channels.data_offset(state.selected_channel);
        StimulationDataFrame::from_buffer(buffer, offset, state.last_timestamp)?.to_bytes()
    }
}
