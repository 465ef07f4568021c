// Audio input source
//
// Captures from the default (or a named) cpal input device. The cpal stream is
// built on the capture thread and its callback converts every device sample
// format to little-endian i16 before writing to the intake buffer.

use super::{IntakeWriter, SampleSource, SourceKind, SourceMetadata};
use crate::config::Encoding;
use crate::types::{SignalFormat, StreamError, StreamResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct AudioInputSource {
    device_name: Option<String>,
    format: Option<SignalFormat>,
}

impl AudioInputSource {
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            format: None,
        }
    }

    fn find_device(&self) -> StreamResult<cpal::Device> {
        let host = cpal::default_host();
        match &self.device_name {
            None => host.default_input_device().ok_or_else(|| {
                StreamError::HardwareUnavailable("No input device available".to_string())
            }),
            Some(name) => host
                .input_devices()
                .map_err(|e| StreamError::HardwareUnavailable(e.to_string()))?
                .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                .ok_or_else(|| {
                    StreamError::HardwareUnavailable(format!("Input device '{}' not found", name))
                }),
        }
    }
}

fn to_le_bytes(samples: impl Iterator<Item = i16>, scratch: &mut Vec<u8>) {
    scratch.clear();
    for sample in samples {
        scratch.extend_from_slice(&sample.to_le_bytes());
    }
}

fn build_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    writer: IntakeWriter,
    failure: Arc<Mutex<Option<String>>>,
) -> StreamResult<Stream> {
    let err_fn = move |err: cpal::StreamError| {
        log::error!("Input stream error: {}", err);
        *failure.lock() = Some(err.to_string());
    };
    let mut scratch = Vec::new();

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            config,
            move |data: &[f32], _| {
                to_le_bytes(
                    data.iter()
                        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16),
                    &mut scratch,
                );
                writer.write_to_buffer(&scratch);
            },
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            config,
            move |data: &[i16], _| {
                to_le_bytes(data.iter().copied(), &mut scratch);
                writer.write_to_buffer(&scratch);
            },
            err_fn,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            config,
            move |data: &[u16], _| {
                to_le_bytes(data.iter().map(|&s| (s as i32 - 32_768) as i16), &mut scratch);
                writer.write_to_buffer(&scratch);
            },
            err_fn,
            None,
        ),
        other => {
            return Err(StreamError::HardwareUnavailable(format!(
                "Unsupported sample format: {:?}",
                other
            )))
        }
    }
    .map_err(|e| StreamError::HardwareUnavailable(e.to_string()))?;

    stream
        .play()
        .map_err(|e| StreamError::HardwareUnavailable(e.to_string()))?;
    Ok(stream)
}

impl SampleSource for AudioInputSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Audio
    }

    fn encoding(&self) -> Encoding {
        Encoding::Pcm16
    }

    fn open(&mut self) -> StreamResult<SignalFormat> {
        let device = self.find_device()?;
        let supported = device
            .default_input_config()
            .map_err(|e| StreamError::HardwareUnavailable(e.to_string()))?;
        let config: StreamConfig = supported.into();
        let format = SignalFormat::new(config.sample_rate.0, config.channels as usize);
        log::info!(
            "Audio input {}: {} channels @ {} Hz",
            device.name().unwrap_or_else(|_| "<unnamed>".to_string()),
            format.channel_count,
            format.sample_rate
        );
        self.format = Some(format);
        Ok(format)
    }

    fn capture(&mut self, writer: &IntakeWriter) -> StreamResult<()> {
        let device = self.find_device()?;
        let supported = device
            .default_input_config()
            .map_err(|e| StreamError::Audio(e.to_string()))?;
        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();

        let format = SignalFormat::new(config.sample_rate.0, config.channels as usize);
        if self.format != Some(format) {
            self.format = Some(format);
            writer.report_format(format);
        }

        let failure = Arc::new(Mutex::new(None));
        let stream = build_stream(&device, &config, sample_format, writer.clone(), failure.clone())
            .map_err(|e| StreamError::Audio(e.to_string()))?;

        while !writer.stop_requested() {
            let failed = failure.lock().take();
            if let Some(message) = failed {
                drop(stream);
                return Err(StreamError::Audio(message));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        drop(stream);
        Ok(())
    }

    fn close(&mut self) {
        self.format = None;
    }

    fn metadata(&self) -> SourceMetadata {
        let mut properties = std::collections::HashMap::new();
        if let Some(name) = &self.device_name {
            properties.insert("device".to_string(), name.clone());
        }
        SourceMetadata {
            kind: SourceKind::Audio,
            encoding: Encoding::Pcm16,
            format: self.format,
            properties,
        }
    }
}
