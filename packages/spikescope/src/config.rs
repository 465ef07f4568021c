// Pipeline configuration
//
// Every option recognised by the pipeline lives in `PipelineConfig`. It is plain
// serde data so it can be loaded from a JSON settings file, and every field has
// a default so partial files are accepted.

use crate::types::{SignalFormat, StreamError, StreamResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What kind of event starts a new averaging segment
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AveragingTriggerType {
    /// Selected channel crosses the averaging threshold
    #[default]
    Threshold,
    /// Every marked event
    AllEvents,
}

/// Byte layout produced by a source
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Encoding {
    /// Interleaved little-endian i16 frames
    #[default]
    Pcm16,
    /// SpikerBox serial framing with escape-delimited messages
    SpikerBox,
}

/// Configuration for the different sample source types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum SourceConfig {
    /// Generated sine waves with periodic event markers
    #[serde(rename = "synthetic")]
    Synthetic {
        sample_rate: u32,
        channel_count: usize,
        #[serde(default = "default_frequency")]
        frequency_hz: f32,
        #[serde(default = "default_amplitude")]
        amplitude: i16,
        /// Emit a named event every N milliseconds (None = no events)
        #[serde(default)]
        event_interval_ms: Option<u64>,
        /// Wall-clock duration of one generated chunk
        #[serde(default = "default_chunk_ms")]
        chunk_ms: u64,
    },

    /// Recorded raw bytes replayed from a file in chunks
    #[serde(rename = "replay")]
    Replay {
        path: String,
        sample_rate: u32,
        channel_count: usize,
        #[serde(default)]
        encoding: Encoding,
        chunk_size: usize,
        /// Delay between chunks in milliseconds (None = as fast as possible)
        #[serde(default)]
        rate_limit_ms: Option<u64>,
        #[serde(default)]
        loop_playback: bool,
    },

    /// Serial device (e.g. /dev/ttyUSB0 on Linux, COM3 on Windows)
    #[serde(rename = "serial")]
    Serial {
        port: String,
        baud_rate: u32,
        #[serde(default = "default_serial_rate")]
        sample_rate: u32,
        #[serde(default = "default_channels")]
        channel_count: usize,
        #[serde(default = "default_serial_encoding")]
        encoding: Encoding,
        /// Written once after opening the port, e.g. a start-streaming command
        #[serde(default)]
        init_command: Option<String>,
    },

    /// Default (or named) audio input device
    #[serde(rename = "audio")]
    Audio {
        #[serde(default)]
        device: Option<String>,
    },
}

fn default_frequency() -> f32 {
    10.0
}

fn default_amplitude() -> i16 {
    8_000
}

fn default_chunk_ms() -> u64 {
    10
}

fn default_serial_rate() -> u32 {
    10_000
}

fn default_channels() -> usize {
    1
}

fn default_serial_encoding() -> Encoding {
    Encoding::SpikerBox
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::Synthetic {
            sample_rate: 10_000,
            channel_count: 1,
            frequency_hz: default_frequency(),
            amplitude: default_amplitude(),
            event_interval_ms: None,
            chunk_ms: default_chunk_ms(),
        }
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Explicit Shared Signal Buffer capacity in samples per channel.
    /// When absent the capacity follows the sample rate (`sample_rate * history_seconds`).
    pub buffer_size: Option<usize>,
    pub history_seconds: f32,
    pub channel_count: usize,
    pub sample_rate: u32,
    pub averaging_enabled: bool,
    pub averaging_trigger_type: AveragingTriggerType,
    pub averaging_threshold: i16,
    pub averaging_window_seconds: f32,
    pub selected_channel: usize,
    /// Initial visible window width in seconds
    pub window_seconds: f32,
    /// Draw frame size in seconds (upper bound for the visible window)
    pub max_window_seconds: f32,
    /// Depth of the Raw Intake Buffer in seconds of device bytes
    pub intake_buffered_seconds: f32,
    pub source: SourceConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_size: None,
            history_seconds: 6.0,
            channel_count: 1,
            sample_rate: 10_000,
            averaging_enabled: false,
            averaging_trigger_type: AveragingTriggerType::Threshold,
            averaging_threshold: 3_000,
            averaging_window_seconds: 1.0,
            selected_channel: 0,
            window_seconds: 1.0,
            max_window_seconds: 6.0,
            intake_buffered_seconds: 2.0,
            source: SourceConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> StreamResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> StreamResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Auto-scale is available unless the signal is being averaged.
    pub fn auto_scale_enabled(&self) -> bool {
        !self.averaging_enabled
    }

    pub fn format(&self) -> SignalFormat {
        SignalFormat::new(self.sample_rate, self.channel_count)
    }

    /// Shared Signal Buffer capacity for `format`.
    pub fn buffer_size_for(&self, format: SignalFormat) -> usize {
        self.buffer_size
            .unwrap_or_else(|| format.samples_for(self.history_seconds))
    }

    pub fn validate(&self) -> StreamResult<()> {
        if self.channel_count == 0 {
            return Err(StreamError::InvalidConfig(
                "channel_count must be at least 1".to_string(),
            ));
        }
        if self.sample_rate == 0 {
            return Err(StreamError::InvalidConfig(
                "sample_rate must be positive".to_string(),
            ));
        }
        if self.selected_channel >= self.channel_count {
            return Err(StreamError::InvalidConfig(format!(
                "selected_channel {} out of range for {} channels",
                self.selected_channel, self.channel_count
            )));
        }
        if self.buffer_size == Some(0) {
            return Err(StreamError::InvalidConfig(
                "buffer_size must be positive".to_string(),
            ));
        }
        let durations = [
            ("history_seconds", self.history_seconds),
            ("averaging_window_seconds", self.averaging_window_seconds),
            ("window_seconds", self.window_seconds),
            ("max_window_seconds", self.max_window_seconds),
            ("intake_buffered_seconds", self.intake_buffered_seconds),
        ];
        for (name, value) in durations {
            if !(value > 0.0) {
                return Err(StreamError::InvalidConfig(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        match &self.source {
            SourceConfig::Synthetic {
                sample_rate,
                channel_count,
                chunk_ms,
                ..
            } => {
                if *sample_rate == 0 || *channel_count == 0 || *chunk_ms == 0 {
                    return Err(StreamError::InvalidConfig(
                        "synthetic source needs a positive rate, channel count and chunk length"
                            .to_string(),
                    ));
                }
            }
            SourceConfig::Replay {
                sample_rate,
                channel_count,
                chunk_size,
                ..
            } => {
                if *sample_rate == 0 || *channel_count == 0 || *chunk_size == 0 {
                    return Err(StreamError::InvalidConfig(
                        "replay source needs a positive rate, channel count and chunk size"
                            .to_string(),
                    ));
                }
            }
            SourceConfig::Serial {
                baud_rate,
                channel_count,
                ..
            } => {
                if *baud_rate == 0 || *channel_count == 0 {
                    return Err(StreamError::InvalidConfig(
                        "serial source needs a positive baud rate and channel count".to_string(),
                    ));
                }
            }
            SourceConfig::Audio { .. } => {}
        }
        Ok(())
    }
}
