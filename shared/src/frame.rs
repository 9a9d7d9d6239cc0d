/*!
Control and data frame structures.

Control frames arrive as UTF-8 JSON objects whose fields use `-1` to mean
"no change requested". They are decoded into [`ControlCommand`], which
carries the same information as explicit `Option`s so that a genuine zero
can never be mistaken for absence. Data frames are assembled from one
acquisition buffer and serialized as compact JSON.
*/

use crate::error::{Result, SharedError};
use crate::protocol::{LEVEL_SENTINEL, SENTINEL};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

/// Inbound control command, exactly as it appears on the wire
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StimulationControlFrame {
    pub normalised_current_level: f64,
    #[serde(deserialize_with = "saturating_length")]
    pub stimulation_length: i64,
    pub switch_channel: i64,
}

impl Default for StimulationControlFrame {
    fn default() -> Self {
        Self {
            normalised_current_level: LEVEL_SENTINEL,
            stimulation_length: SENTINEL,
            switch_channel: SENTINEL,
        }
    }
}

/// Accept any whole JSON number for the pulse length.
///
/// Integers beyond `i64` and whole floats such as `50.0` or `1e20` saturate
/// instead of failing, so over-long requests still reach the clamp.
fn saturating_length<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let number = serde_json::Number::deserialize(deserializer)?;
    if let Some(length) = number.as_i64() {
        return Ok(length);
    }
    if number.as_u64().is_some() {
        return Ok(i64::MAX);
    }
    match number.as_f64() {
        // Float to int casts saturate at the i64 bounds
        Some(length) if length.fract() == 0.0 => Ok(length as i64),
        _ => Err(de::Error::custom(format!(
            "stimulation_length {} is not a whole number",
            number
        ))),
    }
}

/// Decoded control command; `None` means "keep what is there"
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ControlCommand {
    /// Amplitude factor in (-1, 1]
    pub current_level: Option<f64>,
    /// Requested pulse length in ms, not yet clamped
    pub stimulation_length_ms: Option<u32>,
    /// Stimulation channel to switch to
    pub switch_channel: Option<usize>,
}

impl ControlCommand {
    /// Decode raw control bytes (UTF-8 JSON) into a command
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)?;
        let frame: StimulationControlFrame = serde_json::from_str(text)?;
        Self::try_from(frame)
    }

    /// Encode the command back into its wire form
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&StimulationControlFrame::from(*self))?)
    }

    /// True when no field requests a change
    pub fn is_noop(&self) -> bool {
        self.current_level.is_none() && self.stimulation_length_ms.is_none() && self.switch_channel.is_none()
    }
}

impl TryFrom<StimulationControlFrame> for ControlCommand {
    type Error = SharedError;

    fn try_from(frame: StimulationControlFrame) -> Result<Self> {
        let level = frame.normalised_current_level;
        let current_level = if level == LEVEL_SENTINEL {
            None
        } else if !level.is_finite() || !(-1.0..=1.0).contains(&level) {
            return Err(SharedError::invalid_control_frame(format!(
                "normalised_current_level {} outside [-1, 1]",
                level
            )));
        } else {
            Some(level)
        };

        let stimulation_length_ms = match frame.stimulation_length {
            SENTINEL => None,
            length if length < 0 => {
                return Err(SharedError::invalid_control_frame(format!(
                    "stimulation_length {} is negative",
                    length
                )));
            }
            length => Some(length.min(u32::MAX as i64) as u32),
        };

        let switch_channel = match frame.switch_channel {
            SENTINEL => None,
            channel if channel < 0 => {
                return Err(SharedError::invalid_control_frame(format!(
                    "switch_channel {} is negative",
                    channel
                )));
            }
            channel => Some(channel as usize),
        };

        Ok(Self {
            current_level,
            stimulation_length_ms,
            switch_channel,
        })
    }
}

impl From<ControlCommand> for StimulationControlFrame {
    fn from(command: ControlCommand) -> Self {
        Self {
            normalised_current_level: command.current_level.unwrap_or(LEVEL_SENTINEL),
            stimulation_length: command.stimulation_length_ms.map_or(SENTINEL, i64::from),
            switch_channel: command.switch_channel.map_or(SENTINEL, |c| c as i64),
        }
    }
}

/// Outbound telemetry frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulationDataFrame {
    pub stimulation_current_loopback: Vec<f64>,
    pub stimulation_voltage: Vec<f64>,
    pub last_shock_on_device: i64,
}

impl StimulationDataFrame {
    /// Assemble a frame from an acquisition buffer.
    ///
    /// `buffer` holds one row of samples per analog input; `offset` is the
    /// current-loopback row of the selected channel and the voltage row is
    /// the one after it.
    pub fn from_buffer(buffer: &[Vec<f64>], offset: usize, last_shock_on_device: i64) -> Result<Self> {
        if offset + 1 >= buffer.len() {
            return Err(SharedError::invalid_data_frame(format!(
                "offset {} needs two rows but buffer has {}",
                offset,
                buffer.len()
            )));
        }

        Ok(Self {
            stimulation_current_loopback: buffer[offset].clone(),
            stimulation_voltage: buffer[offset + 1].clone(),
            last_shock_on_device,
        })
    }

    /// Serialize to compact JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a frame from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MAX_PULSE_LENGTH_MS;
    use crate::ProtocolState;
    use approx::assert_relative_eq;

    #[test]
    fn test_missing_fields_mean_no_change() {
        let command = ControlCommand::decode(b"{}").unwrap();
        assert!(command.is_noop());

        let command = ControlCommand::decode(
            br#"{"normalised_current_level": -1, "stimulation_length": -1, "switch_channel": -1}"#,
        )
        .unwrap();
        assert!(command.is_noop());
    }

    #[test]
    fn test_zero_is_not_absence() {
        let command = ControlCommand::decode(
            br#"{"normalised_current_level": 0.0, "stimulation_length": 0, "switch_channel": 0}"#,
        )
        .unwrap();
        assert_eq!(command.current_level, Some(0.0));
        assert_eq!(command.stimulation_length_ms, Some(0));
        assert_eq!(command.switch_channel, Some(0));
        assert!(!command.is_noop());
    }

    #[test]
    fn test_decode_partial_frame() {
        let command = ControlCommand::decode(br#"{"normalised_current_level": 0.5, "stimulation_length": 50}"#).unwrap();
        assert_eq!(command.current_level, Some(0.5));
        assert_eq!(command.stimulation_length_ms, Some(50));
        assert_eq!(command.switch_channel, None);
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert!(matches!(ControlCommand::decode(&[0xff, 0xfe]), Err(SharedError::Encoding(_))));
        assert!(matches!(ControlCommand::decode(b"not json"), Err(SharedError::Serde(_))));
        assert!(matches!(
            ControlCommand::decode(br#"{"normalised_current_level": 1.5}"#),
            Err(SharedError::InvalidControlFrame(_))
        ));
        assert!(matches!(
            ControlCommand::decode(br#"{"stimulation_length": -7}"#),
            Err(SharedError::InvalidControlFrame(_))
        ));
        assert!(matches!(
            ControlCommand::decode(br#"{"switch_channel": -2}"#),
            Err(SharedError::InvalidControlFrame(_))
        ));
    }

    #[test]
    fn test_oversized_lengths_saturate() {
        for message in [
            &br#"{"normalised_current_level":0.5,"stimulation_length":18446744073709551615}"#[..],
            &br#"{"normalised_current_level":0.5,"stimulation_length":100000000000000000000}"#[..],
            &br#"{"stimulation_length":1e20}"#[..],
        ] {
            let command = ControlCommand::decode(message).unwrap();
            assert_eq!(command.stimulation_length_ms, Some(u32::MAX));
            let clamped = command.stimulation_length_ms.map(ProtocolState::clamp_pulse_length);
            assert_eq!(clamped, Some(MAX_PULSE_LENGTH_MS));
        }
    }

    #[test]
    fn test_whole_float_length_accepted() {
        let command = ControlCommand::decode(br#"{"stimulation_length":50.0}"#).unwrap();
        assert_eq!(command.stimulation_length_ms, Some(50));

        let command = ControlCommand::decode(br#"{"stimulation_length":-1.0}"#).unwrap();
        assert!(command.is_noop());

        assert!(matches!(
            ControlCommand::decode(br#"{"stimulation_length":-1e20}"#),
            Err(SharedError::InvalidControlFrame(_))
        ));
        assert!(matches!(
            ControlCommand::decode(br#"{"stimulation_length":12.5}"#),
            Err(SharedError::Serde(_))
        ));
    }

    #[test]
    fn test_encode_restores_sentinels() {
        let command = ControlCommand {
            current_level: Some(0.25),
            stimulation_length_ms: None,
            switch_channel: Some(1),
        };
        let wire: StimulationControlFrame = serde_json::from_slice(&command.encode().unwrap()).unwrap();
        assert_eq!(wire.normalised_current_level, 0.25);
        assert_eq!(wire.stimulation_length, -1);
        assert_eq!(wire.switch_channel, 1);
    }

    #[test]
    fn test_data_frame_from_buffer() {
        let buffer = vec![
            vec![0.0, 0.1],
            vec![1.0, 1.1],
            vec![2.0, 2.1],
            vec![3.0, 3.1],
        ];
        let frame = StimulationDataFrame::from_buffer(&buffer, 2, 1234).unwrap();
        assert_eq!(frame.stimulation_current_loopback, vec![2.0, 2.1]);
        assert_eq!(frame.stimulation_voltage, vec![3.0, 3.1]);
        assert_eq!(frame.last_shock_on_device, 1234);

        assert!(StimulationDataFrame::from_buffer(&buffer, 3, 0).is_err());
    }

    #[test]
    fn test_data_frame_json_roundtrip() {
        let frame = StimulationDataFrame {
            stimulation_current_loopback: vec![0.1, -2.5e-3, 9.87654321, 1.0 / 3.0],
            stimulation_voltage: vec![-10.0, 0.0, 3.3, 7.123456789012],
            last_shock_on_device: 1_700_000_000_123,
        };

        let bytes = frame.to_bytes().unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains("\"last_shock_on_device\":1700000000123"));

        let decoded = StimulationDataFrame::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.last_shock_on_device, frame.last_shock_on_device);
        for (a, b) in decoded.stimulation_current_loopback.iter().zip(&frame.stimulation_current_loopback) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
        for (a, b) in decoded.stimulation_voltage.iter().zip(&frame.stimulation_voltage) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
    }
}
