// Serial device source
//
// Opens a serial port (e.g. /dev/ttyACM0, COM3) and forwards every byte the
// device sends. SpikerBox-style boards stream framed samples continuously once
// the optional init command has been written.

use super::{IntakeWriter, SampleSource, SourceKind, SourceMetadata};
use crate::config::Encoding;
use crate::types::{SignalFormat, StreamError, StreamResult};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tokio_serial::SerialPort;

const READ_TIMEOUT: Duration = Duration::from_millis(50);
const READ_CHUNK: usize = 4096;

pub struct SerialDeviceSource {
    port: String,
    baud_rate: u32,
    format: SignalFormat,
    encoding: Encoding,
    init_command: Option<String>,
    handle: Option<Box<dyn SerialPort>>,
}

impl SerialDeviceSource {
    pub fn new(
        port: String,
        baud_rate: u32,
        format: SignalFormat,
        encoding: Encoding,
        init_command: Option<String>,
    ) -> Self {
        Self {
            port,
            baud_rate,
            format,
            encoding,
            init_command,
            handle: None,
        }
    }
}

impl SampleSource for SerialDeviceSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Device
    }

    fn encoding(&self) -> Encoding {
        self.encoding
    }

    fn open(&mut self) -> StreamResult<SignalFormat> {
        if self.handle.is_some() {
            return Ok(self.format);
        }

        log::info!(
            "Opening serial port: {} at {} baud",
            self.port,
            self.baud_rate
        );

        let mut handle = tokio_serial::new(&self.port, self.baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| {
                StreamError::HardwareUnavailable(format!("Failed to open {}: {}", self.port, e))
            })?;

        if let Some(command) = &self.init_command {
            handle.write_all(command.as_bytes()).map_err(|e| {
                StreamError::HardwareUnavailable(format!("Failed to initialise device: {}", e))
            })?;
        }

        self.handle = Some(handle);
        log::info!("Serial port opened successfully");
        Ok(self.format)
    }

    fn capture(&mut self, writer: &IntakeWriter) -> StreamResult<()> {
        let handle = self.handle.as_mut().ok_or(StreamError::NotStarted)?;
        let mut chunk = [0u8; READ_CHUNK];

        while !writer.stop_requested() {
            match handle.read(&mut chunk) {
                Ok(0) => {
                    log::warn!("Serial port closed unexpectedly");
                    return Err(StreamError::Serial("port closed".to_string()));
                }
                Ok(n) => writer.write_to_buffer(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
                Err(e) => {
                    log::error!("Serial read error: {}", e);
                    return Err(StreamError::Serial(format!("Read failed: {}", e)));
                }
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.handle.take().is_some() {
            log::info!("Closed serial port {}", self.port);
        }
    }

    fn metadata(&self) -> SourceMetadata {
        SourceMetadata {
            kind: self.kind(),
            encoding: self.encoding,
            format: self.handle.as_ref().map(|_| self.format),
            properties: [
                ("port".to_string(), self.port.clone()),
                ("baud_rate".to_string(), self.baud_rate.to_string()),
            ]
            .into_iter()
            .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_port_is_hardware_unavailable() {
        let mut source = SerialDeviceSource::new(
            "/dev/spikescope-missing-port".to_string(),
            222_222,
            SignalFormat::new(10_000, 1),
            Encoding::SpikerBox,
            None,
        );
        assert!(matches!(
            source.open(),
            Err(StreamError::HardwareUnavailable(_))
        ));
        assert_eq!(source.metadata().kind, SourceKind::Device);
        assert_eq!(source.metadata().format, None);
    }
}
