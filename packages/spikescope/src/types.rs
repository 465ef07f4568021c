// Common types for the capture pipeline

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One amplitude value for one channel at one time tick.
pub type Sample = i16;

/// Result type for pipeline operations
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors that can occur while capturing, decoding or configuring a stream
#[derive(Debug, Error)]
pub enum StreamError {
    /// Capture could not start (device busy, permission denied, unsupported configuration)
    #[error("Hardware unavailable: {0}")]
    HardwareUnavailable(String),

    /// Decoder found malformed or short data; the batch is dropped
    #[error("Stream desync: {0}")]
    StreamDesync(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config parse error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(String),

    #[error("Audio input error: {0}")]
    Audio(String),

    #[error("Stream already running")]
    AlreadyRunning,

    #[error("Stream not started")]
    NotStarted,

    #[error("Channel closed")]
    ChannelClosed,
}

/// Sample rate and channel layout reported by the hardware collaborator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalFormat {
    pub sample_rate: u32,
    pub channel_count: usize,
}

impl SignalFormat {
    pub fn new(sample_rate: u32, channel_count: usize) -> Self {
        Self {
            sample_rate,
            channel_count,
        }
    }

    /// Number of samples (per channel) covering `seconds` at this rate, at least 1.
    pub fn samples_for(&self, seconds: f32) -> usize {
        ((self.sample_rate as f32 * seconds).round() as usize).max(1)
    }
}

/// Current state of a capture session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum StreamState {
    /// Nothing started yet
    Idle,

    /// Capture and dispatch threads are running
    Running { started_at: f64 },

    /// Capture continues but decoded data is not delivered
    Paused { paused_at: f64 },

    /// Capture ended on a fatal read failure
    Error { message: String },

    /// Stopped by the caller
    Stopped,
}

impl Default for StreamState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Statistics about a capture session
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StreamStats {
    pub bytes_received: u64,
    pub bytes_overwritten: u64,
    pub batches_decoded: u64,
    pub batches_dropped: u64,
    pub samples_decoded: u64,
    pub events_decoded: u64,
    pub format_changes: u64,
}

/// Current wall-clock time as fractional unix seconds
pub(crate) fn unix_now() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + now.timestamp_subsec_millis() as f64 / 1000.0
}
