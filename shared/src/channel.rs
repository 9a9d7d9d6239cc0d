/*!
Channel configuration and physical channel naming.

The channel configuration is loaded once at startup from a small JSON
descriptor and is read-only afterwards. It decides whether the stimulator
drives a single output or two outputs behind a digital switch, and from it
the runtime derives every physical channel name it opens.
*/

use crate::error::{Result, SharedError};
use crate::protocol::{DUAL_CHANNEL_COUNT, INPUTS_PER_CHANNEL};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// How stimulation channels are selected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchChannelMethod {
    /// One stimulation output, no switch
    Single,
    /// Two stimulation outputs selected through digital lines
    Dual,
}

/// Static description of the device channel layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub device_name: String,
    pub switch_channel_method: SwitchChannelMethod,
}

impl ChannelConfig {
    /// Create a new channel configuration
    pub fn new(device_name: impl Into<String>, switch_channel_method: SwitchChannelMethod) -> Self {
        Self {
            device_name: device_name.into(),
            switch_channel_method,
        }
    }

    /// Load the channel configuration descriptor from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json(&content)?;
        debug!(
            "Loaded channel configuration from {}: {:?}",
            path.as_ref().display(),
            config
        );
        Ok(config)
    }

    /// Parse the channel configuration descriptor from JSON text
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ChannelConfig = serde_json::from_str(json)?;
        if config.device_name.trim().is_empty() {
            return Err(SharedError::config("device_name must not be empty"));
        }
        Ok(config)
    }

    pub fn is_dual(&self) -> bool {
        self.switch_channel_method == SwitchChannelMethod::Dual
    }

    /// Number of stimulation channels the device exposes
    pub fn stimulation_channels(&self) -> usize {
        match self.switch_channel_method {
            SwitchChannelMethod::Single => 1,
            SwitchChannelMethod::Dual => DUAL_CHANNEL_COUNT,
        }
    }

    /// Number of analog input channels in one acquisition buffer
    pub fn input_channel_count(&self) -> usize {
        self.stimulation_channels() * INPUTS_PER_CHANNEL
    }

    /// Index of the current-loopback row for the selected channel.
    ///
    /// The voltage row follows immediately after it. Single mode always
    /// reads the first pair.
    pub fn data_offset(&self, selected_channel: usize) -> usize {
        match self.switch_channel_method {
            SwitchChannelMethod::Single => 0,
            SwitchChannelMethod::Dual => INPUTS_PER_CHANNEL * selected_channel,
        }
    }

    /// Physical analog input names, ordered (current, voltage) per channel
    pub fn analog_input_channels(&self) -> Vec<String> {
        (0..self.input_channel_count())
            .map(|i| format!("{}/ai{}", self.device_name, i))
            .collect()
    }

    /// Physical analog output names, one per stimulation channel
    pub fn analog_output_channels(&self) -> Vec<String> {
        (0..self.stimulation_channels())
            .map(|i| format!("{}/ao{}", self.device_name, i))
            .collect()
    }

    /// Digital lines driving the channel switch, if the device has one
    pub fn switch_lines(&self) -> Option<Vec<String>> {
        match self.switch_channel_method {
            SwitchChannelMethod::Single => None,
            SwitchChannelMethod::Dual => Some(
                (0..DUAL_CHANNEL_COUNT)
                    .map(|i| format!("{}/port0/line{}", self.device_name, i))
                    .collect(),
            ),
        }
    }
}
