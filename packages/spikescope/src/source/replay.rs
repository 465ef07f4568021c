// File replay source
//
// Reads previously captured raw device bytes back in fixed-size chunks,
// optionally paced and looped. Useful for:
// - Testing the pipeline without hardware
// - Replaying recorded sessions

use super::{IntakeWriter, SampleSource, SourceKind, SourceMetadata};
use crate::config::Encoding;
use crate::types::{SignalFormat, StreamError, StreamResult};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::Duration;

pub struct ReplaySource {
    path: PathBuf,
    format: SignalFormat,
    encoding: Encoding,
    chunk_size: usize,
    rate_limit_ms: Option<u64>,
    loop_playback: bool,
    file: Option<File>,
    bytes_replayed: u64,
}

impl ReplaySource {
    pub fn new(
        path: String,
        format: SignalFormat,
        encoding: Encoding,
        chunk_size: usize,
        rate_limit_ms: Option<u64>,
        loop_playback: bool,
    ) -> Self {
        Self {
            path: PathBuf::from(path),
            format,
            encoding,
            chunk_size: chunk_size.max(1),
            rate_limit_ms,
            loop_playback,
            file: None,
            bytes_replayed: 0,
        }
    }
}

impl SampleSource for ReplaySource {
    fn kind(&self) -> SourceKind {
        SourceKind::Simulated
    }

    fn encoding(&self) -> Encoding {
        self.encoding
    }

    fn open(&mut self) -> StreamResult<SignalFormat> {
        let file = File::open(&self.path).map_err(|e| {
            StreamError::HardwareUnavailable(format!(
                "cannot open {}: {}",
                self.path.display(),
                e
            ))
        })?;
        log::info!("Replaying {} ({:?})", self.path.display(), self.encoding);
        self.file = Some(file);
        Ok(self.format)
    }

    fn capture(&mut self, writer: &IntakeWriter) -> StreamResult<()> {
        let file = self.file.as_mut().ok_or(StreamError::NotStarted)?;
        let mut chunk = vec![0u8; self.chunk_size];

        while !writer.stop_requested() {
            let read = file.read(&mut chunk)?;
            if read == 0 {
                if self.loop_playback && self.bytes_replayed > 0 {
                    file.seek(SeekFrom::Start(0))?;
                    continue;
                }
                log::info!("Replay finished after {} bytes", self.bytes_replayed);
                return Ok(());
            }

            writer.write_to_buffer(&chunk[..read]);
            self.bytes_replayed += read as u64;

            if let Some(ms) = self.rate_limit_ms {
                std::thread::sleep(Duration::from_millis(ms));
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn metadata(&self) -> SourceMetadata {
        let mut properties = std::collections::HashMap::new();
        properties.insert("path".to_string(), self.path.display().to_string());
        properties.insert("bytes_replayed".to_string(), self.bytes_replayed.to_string());
        SourceMetadata {
            kind: self.kind(),
            encoding: self.encoding,
            format: self.file.as_ref().map(|_| self.format),
            properties,
        }
    }
}
