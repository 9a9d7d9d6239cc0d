/*!
Pulse-train waveform synthesis.

A pulse train is a run of single-sample pulses, one every
[`PULSE_PERIOD_SAMPLES`] samples, scaled by the requested amplitude factor.
With one output the train is as long as the pulse length (the default
25 ms gives the classic 25-sample template). With a channel switch the
output is a fixed 2 x 500 matrix in which only the targeted row carries
pulses, up to the pulse length; everything else is zero.
*/

use crate::error::{Result, SharedError};
use crate::protocol::{DUAL_CHANNEL_COUNT, MULTI_CHANNEL_SAMPLES, PULSE_PERIOD_SAMPLES};
use crate::state::ProtocolState;

/// Output samples, one row per analog output channel
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    rows: Vec<Vec<f64>>,
}

impl Waveform {
    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn row(&self, channel: usize) -> Option<&[f64]> {
        self.rows.get(channel).map(Vec::as_slice)
    }

    pub fn channel_count(&self) -> usize {
        self.rows.len()
    }

    pub fn samples_per_channel(&self) -> usize {
        self.rows.first().map_or(0, Vec::len)
    }

    /// Number of samples that are not exactly zero, across all rows
    pub fn non_zero_count(&self) -> usize {
        self.rows.iter().flatten().filter(|&&s| s != 0.0).count()
    }
}

/// Builds stimulation pulse trains
pub struct PulseWaveformGenerator;

impl PulseWaveformGenerator {
    /// Generate a pulse train.
    ///
    /// `target_channel` is `None` for single-output devices and the row to
    /// drive on switched devices. The pulse length is clamped into
    /// [1, 500] ms before use.
    pub fn generate(factor: f64, pulse_length_ms: u32, target_channel: Option<usize>) -> Result<Waveform> {
        let length = ProtocolState::clamp_pulse_length(pulse_length_ms) as usize;

        let rows = match target_channel {
            None => vec![Self::pulse_row(factor, length, length)],
            Some(channel) if channel < DUAL_CHANNEL_COUNT => (0..DUAL_CHANNEL_COUNT)
                .map(|row| {
                    if row == channel {
                        Self::pulse_row(factor, length, MULTI_CHANNEL_SAMPLES)
                    } else {
                        vec![0.0; MULTI_CHANNEL_SAMPLES]
                    }
                })
                .collect(),
            Some(channel) => {
                return Err(SharedError::invalid_control_frame(format!(
                    "target channel {} outside 0..{}",
                    channel, DUAL_CHANNEL_COUNT
                )));
            }
        };

        Ok(Waveform { rows })
    }

    fn pulse_row(factor: f64, pulse_length: usize, total: usize) -> Vec<f64> {
        let mut row = vec![0.0; total];
        for sample in row.iter_mut().take(pulse_length).step_by(PULSE_PERIOD_SAMPLES) {
            *sample = factor;
        }
        row
    }
}
