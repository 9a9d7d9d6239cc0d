/*!
# Shared Types and Utilities

This crate contains the data model and the pure algorithms shared by the
stimulation bridge runtime: everything that can be reasoned about without
hardware, threads or sockets.

## Core Types

- [`ChannelConfig`] - Device channel layout and switching mode
- [`StimulationControlFrame`] - Inbound control command as it appears on the wire
- [`ControlCommand`] - Decoded control command with explicit absence
- [`StimulationDataFrame`] - Outbound telemetry frame
- [`ProtocolState`] - State shared between the acquisition and control paths
- [`PulseWaveformGenerator`] - Pulse-train synthesis

## Modules

- [`channel`] - Channel configuration and physical channel naming
- [`frame`] - Control and data frame (de)serialization
- [`state`] - Protocol state and its invariants
- [`waveform`] - Pulse-train waveform synthesis
- [`error`] - Common error types
*/

pub mod channel;
pub mod error;
pub mod frame;
pub mod state;
pub mod waveform;

// Re-export commonly used types
pub use channel::{ChannelConfig, SwitchChannelMethod};
pub use error::{SharedError, Result};
pub use frame::{ControlCommand, StimulationControlFrame, StimulationDataFrame};
pub use state::ProtocolState;
pub use waveform::{PulseWaveformGenerator, Waveform};

/// Version information for the shared library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol constants
pub mod protocol {
    /// Sentinel used on the wire for "field absent / no change"
    pub const SENTINEL: i64 = -1;

    /// Sentinel for the normalised current level
    pub const LEVEL_SENTINEL: f64 = -1.0;

    /// Shortest pulse train in milliseconds
    pub const MIN_PULSE_LENGTH_MS: u32 = 1;

    /// Longest pulse train in milliseconds; longer requests are capped
    pub const MAX_PULSE_LENGTH_MS: u32 = 500;

    /// Pulse length used until a control frame sets one
    pub const DEFAULT_PULSE_LENGTH_MS: u32 = 25;

    /// One pulse every N output samples
    pub const PULSE_PERIOD_SAMPLES: usize = 5;

    /// Samples per output row in multi-channel mode
    pub const MULTI_CHANNEL_SAMPLES: usize = 500;

    /// Number of stimulation channels behind the switch in dual mode
    pub const DUAL_CHANNEL_COUNT: usize = 2;

    /// Analog inputs per stimulation channel (current loopback, voltage)
    pub const INPUTS_PER_CHANNEL: usize = 2;

    /// `last_shock_on_device` before any stimulation pulse was delivered
    pub const UNSET_TIMESTAMP: i64 = -1;

    /// Post-completion pause before the output is considered idle again
    pub const DEFAULT_SETTLE_DELAY_MS: u64 = 500;
}
