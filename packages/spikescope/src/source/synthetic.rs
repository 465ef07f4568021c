// Generated test signal
//
// Produces one sine wave per channel (phase-shifted per channel) in wall-clock
// paced chunks. With an event interval the output is SpikerBox framed so event
// markers can travel in-band; otherwise it is plain PCM.

use super::{IntakeWriter, SampleSource, SourceKind, SourceMetadata};
use crate::config::Encoding;
use crate::decode::SpikerBoxDecoder;
use crate::types::{SignalFormat, StreamError, StreamResult};
use std::f32::consts::TAU;
use std::time::{Duration, Instant};

pub struct SyntheticSource {
    format: SignalFormat,
    frequency_hz: f32,
    amplitude: i16,
    event_interval_ms: Option<u64>,
    chunk_ms: u64,
    generated: u64,
    events_emitted: u64,
    is_open: bool,
}

impl SyntheticSource {
    pub fn new(
        format: SignalFormat,
        frequency_hz: f32,
        amplitude: i16,
        event_interval_ms: Option<u64>,
        chunk_ms: u64,
    ) -> Self {
        Self {
            format,
            frequency_hz,
            amplitude,
            event_interval_ms,
            chunk_ms: chunk_ms.max(1),
            generated: 0,
            events_emitted: 0,
            is_open: false,
        }
    }

    fn sample(&self, index: u64, channel: usize) -> i16 {
        let t = index as f32 / self.format.sample_rate as f32;
        let phase = channel as f32 * TAU / 8.0;
        (self.amplitude as f32 * (TAU * self.frequency_hz * t + phase).sin()) as i16
    }

    fn event_interval_samples(&self) -> Option<u64> {
        self.event_interval_ms
            .map(|ms| (self.format.sample_rate as u64 * ms / 1000).max(1))
    }

    /// Append `count` frames to `out` in this source's encoding.
    pub fn generate(&mut self, count: usize, out: &mut Vec<u8>) {
        let channels = self.format.channel_count;
        let interval = self.event_interval_samples();
        let mut frame = vec![0i16; channels];

        for _ in 0..count {
            let index = self.generated;
            for (channel, value) in frame.iter_mut().enumerate() {
                *value = self.sample(index, channel);
            }
            match interval {
                Some(interval) => {
                    if index > 0 && index % interval == 0 {
                        let name = (self.events_emitted % 9 + 1).to_string();
                        SpikerBoxDecoder::encode_message(&format!("EVNT:{};", name), out);
                        self.events_emitted += 1;
                    }
                    SpikerBoxDecoder::encode_frame(&frame, out);
                }
                None => {
                    for value in &frame {
                        out.extend_from_slice(&value.to_le_bytes());
                    }
                }
            }
            self.generated += 1;
        }
    }
}

impl SampleSource for SyntheticSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Simulated
    }

    fn encoding(&self) -> Encoding {
        if self.event_interval_ms.is_some() {
            Encoding::SpikerBox
        } else {
            Encoding::Pcm16
        }
    }

    fn open(&mut self) -> StreamResult<SignalFormat> {
        if self.format.sample_rate == 0 || self.format.channel_count == 0 {
            return Err(StreamError::HardwareUnavailable(
                "synthetic source needs a positive rate and channel count".to_string(),
            ));
        }
        self.is_open = true;
        log::info!(
            "Synthetic source: {} channels @ {} Hz, {} Hz sine",
            self.format.channel_count,
            self.format.sample_rate,
            self.frequency_hz
        );
        Ok(self.format)
    }

    fn capture(&mut self, writer: &IntakeWriter) -> StreamResult<()> {
        let chunk = Duration::from_millis(self.chunk_ms);
        let per_chunk = (self.format.sample_rate as u64 * self.chunk_ms / 1000).max(1) as usize;
        let mut bytes = Vec::new();
        let mut deadline = Instant::now();

        while !writer.stop_requested() {
            bytes.clear();
            self.generate(per_chunk, &mut bytes);
            writer.write_to_buffer(&bytes);

            deadline += chunk;
            let now = Instant::now();
            if deadline > now {
                std::thread::sleep(deadline - now);
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.is_open = false;
    }

    fn metadata(&self) -> SourceMetadata {
        let mut properties = std::collections::HashMap::new();
        properties.insert("frequency_hz".to_string(), self.frequency_hz.to_string());
        properties.insert("samples_generated".to_string(), self.generated.to_string());
        SourceMetadata {
            kind: self.kind(),
            encoding: self.encoding(),
            format: self.is_open.then_some(self.format),
            properties,
        }
    }
}
