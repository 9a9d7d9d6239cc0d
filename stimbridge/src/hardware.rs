/*!
Hardware seams used by the acquisition and control paths.

The bridge needs three things from the data-acquisition device: a clocked
multi-channel analog input, a triggered analog output that can report when
it has finished, and a set of digital lines driving the channel switch.
Each is a small trait so the loops can be driven by real hardware, by the
[`crate::simulated`] backend, or by test doubles.
*/

use shared::Waveform;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by the hardware layer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HardwareError {
    #[error("analog input read failed: {0}")]
    Read(String),

    #[error("output write failed: {0}")]
    Write(String),

    #[error("output did not complete within {0:?}")]
    Timeout(Duration),

    #[error("device resource already released")]
    Closed,

    #[error("buffer layout mismatch: {0}")]
    InvalidLayout(String),
}

/// Clocked multi-channel analog input
pub trait AnalogInput: Send {
    /// Number of rows a read fills
    fn channel_count(&self) -> usize;

    /// Block until the next frame is acquired and write it into `buffer`.
    ///
    /// `buffer` has one row per channel; every row is overwritten in place
    /// with as many samples as it is long.
    fn read_into(&mut self, buffer: &mut [Vec<f64>]) -> Result<(), HardwareError>;

    /// Release the underlying acquisition task
    fn close(&mut self);
}

/// Triggered analog output generating the stimulation waveform
pub trait StimulatorOutput: Send {
    /// Stop any generation in progress
    fn stop(&mut self) -> Result<(), HardwareError>;

    /// Load a waveform, one row per output channel
    fn write(&mut self, waveform: &Waveform) -> Result<(), HardwareError>;

    /// Start and trigger generation of the loaded waveform
    fn start(&mut self) -> Result<(), HardwareError>;

    /// Block until the device signals that generation has completed
    fn wait_until_done(&mut self, timeout: Duration) -> Result<(), HardwareError>;
}

/// Digital lines selecting the active stimulation channel
pub trait ChannelSwitch: Send {
    fn line_count(&self) -> usize;

    fn write_lines(&mut self, lines: &[bool]) -> Result<(), HardwareError>;
}

/// Line pattern with only `channel` asserted
pub fn one_hot(channel: usize, line_count: usize) -> Vec<bool> {
    (0..line_count).map(|line| line == channel).collect()
}

/// Check that a buffer has the row count a device fills
pub fn check_layout(buffer: &[Vec<f64>], channel_count: usize) -> Result<(), HardwareError> {
    if buffer.len() != channel_count {
        return Err(HardwareError::InvalidLayout(format!(
            "buffer has {} rows, device has {} channels",
            buffer.len(),
            channel_count
        )));
    }
    Ok(())
}
