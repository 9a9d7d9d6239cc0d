/*!
Application of one control command to the stimulation hardware.

The applicator is the only code that touches the stimulator output and
the channel switch. It takes the current protocol state, performs the
requested hardware actions, and returns the next state together with the
timestamp of the pulse train it delivered, if any.
*/

use crate::config::OutputConfig;
use crate::control::ControlError;
use crate::hardware::{one_hot, ChannelSwitch, HardwareError, StimulatorOutput};
use shared::{ChannelConfig, ControlCommand, ProtocolState, PulseWaveformGenerator};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Source of epoch-millisecond timestamps
pub type Clock = Box<dyn Fn() -> i64 + Send>;

/// Result of a successfully applied command
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Applied {
    pub state: ProtocolState,
    /// Time of the delivered pulse train; `None` when nothing was generated
    pub shock_timestamp: Option<i64>,
}

/// Applies control commands against the output hardware
pub struct ControlFrameApplicator {
    channels: ChannelConfig,
    output: Box<dyn StimulatorOutput>,
    switch: Option<Box<dyn ChannelSwitch>>,
    settle_delay: Duration,
    completion_timeout: Duration,
    clock: Clock,
}

impl ControlFrameApplicator {
    pub fn new(
        channels: ChannelConfig,
        output: Box<dyn StimulatorOutput>,
        switch: Option<Box<dyn ChannelSwitch>>,
        config: &OutputConfig,
    ) -> Self {
        Self {
            channels,
            output,
            switch,
            settle_delay: config.settle_delay(),
            completion_timeout: config.completion_timeout(),
            clock: Box::new(|| chrono::Utc::now().timestamp_millis()),
        }
    }

    /// Replace the wall clock, e.g. with a fixed sequence in tests
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Apply one command.
    ///
    /// On a hardware failure the returned error still carries the next
    /// state (pulse length and channel selection are carried over even if
    /// the output write failed) with `output_success` cleared, so the
    /// caller can commit it and reset the flag after reporting.
    pub fn apply(&mut self, command: &ControlCommand, state: &ProtocolState) -> Result<Applied, ControlError> {
        let pulse_length_ms = command
            .stimulation_length_ms
            .map_or(state.pulse_length_ms, ProtocolState::clamp_pulse_length);

        if let Some(channel) = command.switch_channel {
            if self.channels.is_dual() && channel >= self.channels.stimulation_channels() {
                return Err(ControlError::Invalid(format!(
                    "switch_channel {} outside 0..{}",
                    channel,
                    self.channels.stimulation_channels()
                )));
            }
        }

        let mut next = *state;
        let mut failure: Option<HardwareError> = None;

        if let (Some(channel), Some(switch)) = (command.switch_channel, self.switch.as_mut()) {
            debug!("Switching stimulation to channel {}", channel);
            let lines = one_hot(channel, switch.line_count());
            if let Err(e) = switch.write_lines(&lines) {
                warn!("Channel switch write failed: {}", e);
                failure = Some(e);
            }
        }

        let target_channel = if self.channels.is_dual() {
            Some(command.switch_channel.unwrap_or(state.selected_channel))
        } else {
            None
        };

        let mut shock_timestamp = None;
        if let Some(level) = command.current_level {
            match self.stimulate(level, pulse_length_ms, target_channel) {
                Ok(()) => {
                    let timestamp = next.record_shock((self.clock)());
                    info!(
                        "⚡ Delivered pulse train: level {:.3}, {} ms, channel {:?}",
                        level, pulse_length_ms, target_channel
                    );
                    shock_timestamp = Some(timestamp);
                }
                Err(e) => {
                    warn!("Stimulation output failed: {}", e);
                    failure.get_or_insert(e);
                }
            }
        }

        next.pulse_length_ms = pulse_length_ms;
        if self.channels.is_dual() {
            if let Some(channel) = command.switch_channel {
                next.selected_channel = channel;
            }
        }

        match failure {
            None => {
                next.output_success = true;
                Ok(Applied {
                    state: next,
                    shock_timestamp,
                })
            }
            Some(source) => {
                // The caller resets the flag once the failure is reported
                next.output_success = false;
                Err(ControlError::ApplyFailed { state: next, source })
            }
        }
    }

    /// Stop, load, trigger and wait for one pulse train
    fn stimulate(&mut self, level: f64, pulse_length_ms: u32, target_channel: Option<usize>) -> Result<(), HardwareError> {
        let waveform = PulseWaveformGenerator::generate(level, pulse_length_ms, target_channel)
            .map_err(|e| HardwareError::Write(e.to_string()))?;

        self.output.stop()?;
        self.output.write(&waveform)?;
        self.output.start()?;
        self.output.wait_until_done(self.completion_timeout)?;

        // The driver reports completion before the output has settled
        if !self.settle_delay.is_zero() {
            thread::sleep(self.settle_delay);
        }
        Ok(())
    }
}
