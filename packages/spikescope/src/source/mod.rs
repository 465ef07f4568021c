// Pluggable sample sources
//
// A `SampleSource` only moves bytes: it acquires its hardware in `open`, then
// `capture` runs on the dedicated capture thread pushing raw device bytes into
// the intake buffer until a stop is requested. Decoding happens elsewhere.
//
// New sources are added by:
// 1. Implementing the SampleSource trait
// 2. Adding a variant to SourceConfig
// 3. Registering it in `create_source`
//
// Current implementations:
// - Synthetic: generated sine waves with optional event markers
// - Replay: recorded raw bytes read back from a file
// - Serial: SpikerBox-style devices on a serial port
// - Audio: default or named audio input device

#[cfg(feature = "audio-input")]
mod audio;
mod replay;
#[cfg(feature = "serial")]
mod serial;
mod synthetic;

use crate::config::{Encoding, SourceConfig};
use crate::intake::RawIntakeBuffer;
use crate::types::{SignalFormat, StreamError, StreamResult};
use crossbeam::channel::Sender;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(feature = "audio-input")]
pub use audio::AudioInputSource;
pub use replay::ReplaySource;
#[cfg(feature = "serial")]
pub use serial::SerialDeviceSource;
pub use synthetic::SyntheticSource;

/// Source variant family
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Continuous audio input
    Audio,
    /// Streamed device input (serial/USB)
    Device,
    /// Generated or replayed data
    Simulated,
}

/// Metadata about a sample source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceMetadata {
    pub kind: SourceKind,
    pub encoding: Encoding,
    /// Known once the source has been opened
    pub format: Option<SignalFormat>,
    /// Source-specific properties (e.g. port name, file path)
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// Write side of the intake buffer handed to the capture thread
#[derive(Clone)]
pub struct IntakeWriter {
    intake: Arc<RawIntakeBuffer>,
    wake_tx: Sender<()>,
    format_tx: Sender<SignalFormat>,
    stop: Arc<AtomicBool>,
}

impl IntakeWriter {
    pub fn new(
        intake: Arc<RawIntakeBuffer>,
        wake_tx: Sender<()>,
        format_tx: Sender<SignalFormat>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            intake,
            wake_tx,
            format_tx,
            stop,
        }
    }

    /// Append raw device bytes and wake the dispatch worker. Never blocks.
    pub fn write_to_buffer(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.intake.write(bytes);
        let _ = self.wake_tx.try_send(());
    }

    /// Report a new device sample rate / channel count.
    pub fn report_format(&self, format: SignalFormat) {
        if self.format_tx.send(format).is_err() {
            log::debug!("Format change reported after dispatch ended");
        }
        let _ = self.wake_tx.try_send(());
    }

    /// True once the controller asked capture to end
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Trait for all sample sources
pub trait SampleSource: Send {
    fn kind(&self) -> SourceKind;

    /// Byte layout written to the intake buffer
    fn encoding(&self) -> Encoding;

    /// Acquire the hardware and return its initial format.
    ///
    /// Errors here mean capture cannot start at all.
    fn open(&mut self) -> StreamResult<SignalFormat>;

    /// Push bytes into `writer` until `writer.stop_requested()` or the data ends.
    ///
    /// Runs on the capture thread. An error ends the session.
    fn capture(&mut self, writer: &IntakeWriter) -> StreamResult<()>;

    /// Release hardware resources. Safe to call more than once.
    fn close(&mut self);

    fn metadata(&self) -> SourceMetadata;
}

/// Factory function to create a SampleSource from configuration
pub fn create_source(config: &SourceConfig) -> StreamResult<Box<dyn SampleSource>> {
    match config.clone() {
        SourceConfig::Synthetic {
            sample_rate,
            channel_count,
            frequency_hz,
            amplitude,
            event_interval_ms,
            chunk_ms,
        } => Ok(Box::new(SyntheticSource::new(
            SignalFormat::new(sample_rate, channel_count),
            frequency_hz,
            amplitude,
            event_interval_ms,
            chunk_ms,
        ))),

        SourceConfig::Replay {
            path,
            sample_rate,
            channel_count,
            encoding,
            chunk_size,
            rate_limit_ms,
            loop_playback,
        } => Ok(Box::new(ReplaySource::new(
            path,
            SignalFormat::new(sample_rate, channel_count),
            encoding,
            chunk_size,
            rate_limit_ms,
            loop_playback,
        ))),

        #[cfg(feature = "serial")]
        SourceConfig::Serial {
            port,
            baud_rate,
            sample_rate,
            channel_count,
            encoding,
            init_command,
        } => Ok(Box::new(SerialDeviceSource::new(
            port,
            baud_rate,
            SignalFormat::new(sample_rate, channel_count),
            encoding,
            init_command,
        ))),

        #[cfg(not(feature = "serial"))]
        SourceConfig::Serial { .. } => Err(StreamError::InvalidConfig(
            "serial support not compiled in (enable the `serial` feature)".to_string(),
        )),

        #[cfg(feature = "audio-input")]
        SourceConfig::Audio { device } => Ok(Box::new(AudioInputSource::new(device))),

        #[cfg(not(feature = "audio-input"))]
        SourceConfig::Audio { .. } => Err(StreamError::InvalidConfig(
            "audio input not compiled in (enable the `audio-input` feature)".to_string(),
        )),
    }
}
