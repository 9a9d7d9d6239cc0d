/*!
Protocol state shared between the acquisition and control paths.

The control path is the only writer. It publishes whole snapshots, so a
reader always sees a consistent combination of channel, pulse length and
timestamp.
*/

use crate::protocol::{DEFAULT_PULSE_LENGTH_MS, MAX_PULSE_LENGTH_MS, MIN_PULSE_LENGTH_MS, UNSET_TIMESTAMP};
use serde::{Deserialize, Serialize};

/// Mutable protocol state, replaced wholesale on every applied command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolState {
    /// Active stimulation channel; only meaningful in dual mode
    pub selected_channel: usize,
    /// Pulse length in ms, always within [1, 500]
    pub pulse_length_ms: u32,
    /// Epoch-ms time of the most recent pulse, never decreasing
    pub last_timestamp: i64,
    /// False while a failed output write is being reported
    pub output_success: bool,
}

impl ProtocolState {
    /// Clamp a requested pulse length into the supported range
    pub fn clamp_pulse_length(requested_ms: u32) -> u32 {
        requested_ms.clamp(MIN_PULSE_LENGTH_MS, MAX_PULSE_LENGTH_MS)
    }

    /// Record a new shock timestamp without ever moving backwards
    pub fn record_shock(&mut self, timestamp_ms: i64) -> i64 {
        self.last_timestamp = self.last_timestamp.max(timestamp_ms);
        self.last_timestamp
    }

    pub fn has_shocked(&self) -> bool {
        self.last_timestamp != UNSET_TIMESTAMP
    }
}

impl Default for ProtocolState {
    fn default() -> Self {
        Self {
            selected_channel: 0,
            pulse_length_ms: DEFAULT_PULSE_LENGTH_MS,
            last_timestamp: UNSET_TIMESTAMP,
            output_success: true,
        }
    }
}
