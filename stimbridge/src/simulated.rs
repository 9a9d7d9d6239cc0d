/*!
Simulated data-acquisition backend.

Stands in for the acquisition card when no hardware is attached. Waveforms
written to the simulated output are played back on the output sample clock
and looped back into the analog inputs: each stimulation channel's current
row sees its output row (gated by the channel switch), and the voltage row
sees the same signal through a fixed load gain, clipped to the input range.
*/

use crate::config::{AcquisitionConfig, OutputConfig};
use crate::hardware::{check_layout, AnalogInput, ChannelSwitch, HardwareError, StimulatorOutput};
use shared::protocol::INPUTS_PER_CHANNEL;
use shared::{ChannelConfig, Waveform};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Volts measured across the electrode per unit of output
const LOAD_GAIN: f64 = 5.0;

/// What the output is currently generating
#[derive(Debug, Default)]
struct Playback {
    rows: Vec<Vec<f64>>,
    started_at: Option<Instant>,
    switch_lines: Vec<bool>,
}

impl Playback {
    fn sample(&self, channel: usize, at: Instant, output_rate_hz: f64) -> f64 {
        let Some(started_at) = self.started_at else {
            return 0.0;
        };
        if !self.switch_lines.is_empty() && !self.switch_lines.get(channel).copied().unwrap_or(false) {
            return 0.0;
        }
        let Some(elapsed) = at.checked_duration_since(started_at) else {
            return 0.0;
        };
        let index = (elapsed.as_secs_f64() * output_rate_hz) as usize;
        self.rows
            .get(channel)
            .and_then(|row| row.get(index))
            .copied()
            .unwrap_or(0.0)
    }
}

fn lock(playback: &Mutex<Playback>) -> MutexGuard<'_, Playback> {
    // A panicked holder cannot leave the playback half-written
    playback.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A simulated acquisition card built from the channel layout
pub struct SimulatedDaq {
    channels: ChannelConfig,
    sample_rate_hz: f64,
    samples_per_frame: usize,
    frame_period: Duration,
    buffer_span: Duration,
    output_rate_hz: f64,
    max_volt: f64,
    playback: Arc<Mutex<Playback>>,
}

impl SimulatedDaq {
    pub fn new(channels: &ChannelConfig, acquisition: &AcquisitionConfig, output: &OutputConfig) -> Self {
        info!("🧪 Simulated device {}", channels.device_name);
        info!("   Analog inputs: {}", channels.analog_input_channels().join(", "));
        info!("   Analog outputs: {}", channels.analog_output_channels().join(", "));
        if let Some(lines) = channels.switch_lines() {
            info!("   Switch lines: {}", lines.join(", "));
        }

        Self {
            channels: channels.clone(),
            sample_rate_hz: acquisition.sample_rate_hz,
            samples_per_frame: acquisition.samples_per_frame,
            frame_period: acquisition.frame_period(),
            buffer_span: Duration::from_secs_f64(acquisition.buffer_size as f64 / acquisition.sample_rate_hz),
            output_rate_hz: output.output_rate_hz,
            max_volt: acquisition.max_volt,
            playback: Arc::new(Mutex::new(Playback::default())),
        }
    }

    /// Split the card into its input, output and optional switch
    pub fn split(self) -> (SimulatedInput, SimulatedOutput, Option<SimulatedSwitch>) {
        let input = SimulatedInput {
            playback: Arc::clone(&self.playback),
            channel_count: self.channels.input_channel_count(),
            sample_rate_hz: self.sample_rate_hz,
            samples_per_frame: self.samples_per_frame,
            frame_period: self.frame_period,
            buffer_span: self.buffer_span,
            output_rate_hz: self.output_rate_hz,
            max_volt: self.max_volt,
            next_deadline: None,
            paced: true,
            closed: false,
            frames_read: 0,
            fail_after: None,
        };

        let output = SimulatedOutput {
            playback: Arc::clone(&self.playback),
            channel_count: self.channels.stimulation_channels(),
            output_rate_hz: self.output_rate_hz,
            pending: None,
            generation_ends: None,
        };

        let switch = self.channels.switch_lines().map(|lines| SimulatedSwitch {
            playback: Arc::clone(&self.playback),
            line_count: lines.len(),
        });

        (input, output, switch)
    }
}

/// Analog input side of the simulated card
pub struct SimulatedInput {
    playback: Arc<Mutex<Playback>>,
    channel_count: usize,
    sample_rate_hz: f64,
    samples_per_frame: usize,
    frame_period: Duration,
    /// Time the driver-side buffer can cover before samples are overwritten
    buffer_span: Duration,
    output_rate_hz: f64,
    max_volt: f64,
    next_deadline: Option<Instant>,
    paced: bool,
    closed: bool,
    frames_read: u64,
    fail_after: Option<u64>,
}

impl SimulatedInput {
    /// Return frames as fast as they are requested instead of on the sample clock
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    /// Report a read fault once `frames` frames have been delivered
    pub fn fail_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// Wait for the next frame on the sample clock and return when it began.
    ///
    /// A reader that falls further behind the clock than the input buffer
    /// can hold gets an overflow fault, as the driver would report.
    fn frame_start(&mut self) -> Result<Instant, HardwareError> {
        let now = Instant::now();
        if !self.paced {
            return Ok(now);
        }

        let deadline = self.next_deadline.unwrap_or(now) + self.frame_period;
        match deadline.checked_duration_since(now) {
            Some(wait) => thread::sleep(wait),
            None => {
                let lag = now.duration_since(deadline);
                if lag > self.buffer_span {
                    return Err(HardwareError::Read(format!(
                        "input buffer overflow: {:?} behind the sample clock, buffer holds {:?}",
                        lag, self.buffer_span
                    )));
                }
            }
        }
        self.next_deadline = Some(deadline);
        Ok(deadline - self.frame_period)
    }
}

impl AnalogInput for SimulatedInput {
    fn channel_count(&self) -> usize {
        self.channel_count
    }

    fn read_into(&mut self, buffer: &mut [Vec<f64>]) -> Result<(), HardwareError> {
        if self.closed {
            return Err(HardwareError::Closed);
        }
        check_layout(buffer, self.channel_count)?;
        if self.fail_after.is_some_and(|limit| self.frames_read >= limit) {
            warn!("🧪 Injecting simulated read fault after {} frames", self.frames_read);
            return Err(HardwareError::Read("simulated device fault".to_string()));
        }

        if let Some(row) = buffer.iter().find(|row| row.len() != self.samples_per_frame) {
            return Err(HardwareError::InvalidLayout(format!(
                "buffer row holds {} samples, task reads {} per frame",
                row.len(),
                self.samples_per_frame
            )));
        }

        let start = self.frame_start()?;
        let sample_period = Duration::from_secs_f64(1.0 / self.sample_rate_hz);
        let playback = lock(&self.playback);

        for (pair, rows) in buffer.chunks_mut(INPUTS_PER_CHANNEL).enumerate() {
            let (current, voltage) = rows.split_at_mut(1);
            for (i, sample) in current[0].iter_mut().enumerate() {
                let at = start + sample_period * i as u32;
                let value = playback.sample(pair, at, self.output_rate_hz);
                *sample = value;
                if let Some(v) = voltage.first_mut().and_then(|row| row.get_mut(i)) {
                    *v = (value * LOAD_GAIN).clamp(-self.max_volt, self.max_volt);
                }
            }
        }

        self.frames_read += 1;
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            debug!("🧪 Simulated input released after {} frames", self.frames_read);
            self.closed = true;
        }
    }
}

/// Analog output side of the simulated card
pub struct SimulatedOutput {
    playback: Arc<Mutex<Playback>>,
    channel_count: usize,
    output_rate_hz: f64,
    pending: Option<Vec<Vec<f64>>>,
    generation_ends: Option<Instant>,
}

impl StimulatorOutput for SimulatedOutput {
    fn stop(&mut self) -> Result<(), HardwareError> {
        let mut playback = lock(&self.playback);
        playback.rows.clear();
        playback.started_at = None;
        self.generation_ends = None;
        Ok(())
    }

    fn write(&mut self, waveform: &Waveform) -> Result<(), HardwareError> {
        if waveform.channel_count() != self.channel_count {
            return Err(HardwareError::InvalidLayout(format!(
                "waveform has {} rows, output has {} channels",
                waveform.channel_count(),
                self.channel_count
            )));
        }
        self.pending = Some(waveform.rows().to_vec());
        Ok(())
    }

    fn start(&mut self) -> Result<(), HardwareError> {
        let rows = self
            .pending
            .take()
            .ok_or_else(|| HardwareError::Write("no waveform loaded".to_string()))?;

        let samples = rows.first().map_or(0, Vec::len);
        let now = Instant::now();
        self.generation_ends = Some(now + Duration::from_secs_f64(samples as f64 / self.output_rate_hz));

        let mut playback = lock(&self.playback);
        playback.rows = rows;
        playback.started_at = Some(now);
        Ok(())
    }

    fn wait_until_done(&mut self, timeout: Duration) -> Result<(), HardwareError> {
        let Some(ends) = self.generation_ends else {
            return Ok(());
        };

        let remaining = ends.saturating_duration_since(Instant::now());
        if remaining > timeout {
            thread::sleep(timeout);
            return Err(HardwareError::Timeout(timeout));
        }

        thread::sleep(remaining);
        self.generation_ends = None;
        Ok(())
    }
}

/// Digital switch lines of the simulated card
pub struct SimulatedSwitch {
    playback: Arc<Mutex<Playback>>,
    line_count: usize,
}

impl ChannelSwitch for SimulatedSwitch {
    fn line_count(&self) -> usize {
        self.line_count
    }

    fn write_lines(&mut self, lines: &[bool]) -> Result<(), HardwareError> {
        if lines.len() != self.line_count {
            return Err(HardwareError::InvalidLayout(format!(
                "{} line values for {} switch lines",
                lines.len(),
                self.line_count
            )));
        }
        lock(&self.playback).switch_lines = lines.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::one_hot;
    use shared::{PulseWaveformGenerator, SwitchChannelMethod};

    fn daq(method: SwitchChannelMethod) -> SimulatedDaq {
        let channels = ChannelConfig::new("Dev1", method);
        SimulatedDaq::new(&channels, &AcquisitionConfig::default(), &OutputConfig::default())
    }

    #[test]
    fn test_split_matches_layout() {
        let (input, _output, switch) = daq(SwitchChannelMethod::Single).split();
        assert_eq!(input.channel_count(), 2);
        assert!(switch.is_none());

        let (input, _output, switch) = daq(SwitchChannelMethod::Dual).split();
        assert_eq!(input.channel_count(), 4);
        assert_eq!(switch.unwrap().line_count(), 2);
    }

    #[test]
    fn test_idle_input_reads_zero() {
        let (input, _output, _switch) = daq(SwitchChannelMethod::Single).split();
        let mut input = input.unpaced();
        let mut buffer = vec![vec![1.0; 10]; 2];

        input.read_into(&mut buffer).unwrap();
        assert!(buffer.iter().flatten().all(|&s| s == 0.0));
    }

    #[test]
    fn test_output_loops_back_into_input() {
        let (input, mut output, _switch) = daq(SwitchChannelMethod::Single).split();
        let mut input = input.unpaced();

        let waveform = PulseWaveformGenerator::generate(1.0, 25, None).unwrap();
        output.write(&waveform).unwrap();
        output.start().unwrap();

        let mut buffer = vec![vec![0.0; 10]; 2];
        input.read_into(&mut buffer).unwrap();

        assert!(buffer[0].iter().any(|&s| s == 1.0));
        for (current, voltage) in buffer[0].iter().zip(&buffer[1]) {
            assert_eq!(*voltage, current * LOAD_GAIN);
        }
    }

    #[test]
    fn test_switch_gates_loopback() {
        let (input, mut output, switch) = daq(SwitchChannelMethod::Dual).split();
        let mut input = input.unpaced();
        let mut switch = switch.unwrap();

        switch.write_lines(&one_hot(1, 2)).unwrap();
        let waveform = PulseWaveformGenerator::generate(1.0, 500, Some(1)).unwrap();
        output.write(&waveform).unwrap();
        output.start().unwrap();

        let mut buffer = vec![vec![0.0; 10]; 4];
        input.read_into(&mut buffer).unwrap();
        assert!(buffer[0].iter().all(|&s| s == 0.0));
        assert!(buffer[2].iter().any(|&s| s == 1.0));

        assert!(matches!(switch.write_lines(&[true]), Err(HardwareError::InvalidLayout(_))));
    }

    #[test]
    fn test_output_rejects_wrong_row_count() {
        let (_input, mut output, _switch) = daq(SwitchChannelMethod::Single).split();
        let waveform = PulseWaveformGenerator::generate(1.0, 25, Some(0)).unwrap();
        assert!(matches!(output.write(&waveform), Err(HardwareError::InvalidLayout(_))));
        assert!(matches!(output.start(), Err(HardwareError::Write(_))));
    }

    #[test]
    fn test_wait_until_done() {
        let (_input, mut output, _switch) = daq(SwitchChannelMethod::Single).split();
        let waveform = PulseWaveformGenerator::generate(0.5, 25, None).unwrap();
        output.write(&waveform).unwrap();
        output.start().unwrap();

        // 25 samples at 1 kHz
        assert_eq!(
            output.wait_until_done(Duration::from_millis(1)),
            Err(HardwareError::Timeout(Duration::from_millis(1)))
        );
        assert!(output.wait_until_done(Duration::from_secs(1)).is_ok());
        assert!(output.wait_until_done(Duration::from_millis(1)).is_ok());
    }

    #[test]
    fn test_rejects_frame_width_mismatch() {
        let (input, _output, _switch) = daq(SwitchChannelMethod::Single).split();
        let mut input = input.unpaced();
        let mut buffer = vec![vec![0.0; 7]; 2];
        assert!(matches!(input.read_into(&mut buffer), Err(HardwareError::InvalidLayout(_))));
    }

    #[test]
    fn test_paced_reads_follow_frame_period() {
        let (mut input, _output, _switch) = daq(SwitchChannelMethod::Single).split();
        let mut buffer = vec![vec![0.0; 10]; 2];

        let started = Instant::now();
        for _ in 0..5 {
            input.read_into(&mut buffer).unwrap();
        }
        // 5 frames of 10 samples at 1 kHz
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_slow_reader_overflows_buffer() {
        let channels = ChannelConfig::new("Dev1", SwitchChannelMethod::Single);
        let acquisition = AcquisitionConfig {
            buffer_size: 20,
            ..AcquisitionConfig::default()
        };
        let (mut input, _output, _switch) =
            SimulatedDaq::new(&channels, &acquisition, &OutputConfig::default()).split();
        let mut buffer = vec![vec![0.0; 10]; 2];

        input.read_into(&mut buffer).unwrap();
        input.read_into(&mut buffer).unwrap();

        // 20 samples of buffer cover 20 ms
        thread::sleep(Duration::from_millis(100));
        let Err(HardwareError::Read(message)) = input.read_into(&mut buffer) else {
            panic!("expected a buffer overflow");
        };
        assert!(message.contains("overflow"));
    }

    #[test]
    fn test_fault_injection_and_close() {
        let (input, _output, _switch) = daq(SwitchChannelMethod::Single).split();
        let mut input = input.unpaced().fail_after(2);
        let mut buffer = vec![vec![0.0; 10]; 2];

        assert!(input.read_into(&mut buffer).is_ok());
        assert!(input.read_into(&mut buffer).is_ok());
        assert!(matches!(input.read_into(&mut buffer), Err(HardwareError::Read(_))));

        input.close();
        assert_eq!(input.read_into(&mut buffer), Err(HardwareError::Closed));
    }
}
