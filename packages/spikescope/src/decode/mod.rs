// Decode strategies
//
// A decoder turns raw device bytes into per-channel sample frames plus any
// event markers embedded in the stream. Decoders keep partial frames between
// calls so batch boundaries never have to line up with frame boundaries.

mod pcm;
mod spikerbox;

use crate::config::Encoding;
use crate::types::{Sample, SignalFormat, StreamResult};

pub use pcm::PcmDecoder;
pub use spikerbox::{SpikerBoxDecoder, ESCAPE_END, ESCAPE_START};

/// One decoded batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SamplesWithEvents {
    /// Per-channel samples; every channel holds the same number of samples
    pub samples: Vec<Vec<Sample>>,
    /// (sample offset within this batch, event name)
    pub events: Vec<(usize, String)>,
    /// Spectrum columns produced upstream, if any
    pub fft: Vec<Vec<f32>>,
    /// Device reported a new sample rate or channel count at the end of this batch
    pub format_change: Option<SignalFormat>,
}

impl SamplesWithEvents {
    pub fn new(channel_count: usize) -> Self {
        Self {
            samples: vec![Vec::new(); channel_count],
            ..Default::default()
        }
    }

    pub fn channel_count(&self) -> usize {
        self.samples.len()
    }

    /// Samples per channel
    pub fn sample_count(&self) -> usize {
        self.samples.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count() == 0 && self.events.is_empty() && self.fft.is_empty()
    }

    /// Empty every channel, keeping allocations and resizing to `channel_count`.
    pub fn reset(&mut self, channel_count: usize) {
        self.samples.resize_with(channel_count, Vec::new);
        for channel in &mut self.samples {
            channel.clear();
        }
        self.events.clear();
        self.fft.clear();
        self.format_change = None;
    }
}

/// Format-specific byte decoder
pub trait Decoder: Send {
    /// Decode `bytes` (appended to any carried partial frame) into `out`.
    ///
    /// `out` is reset first. A `StreamDesync` error means the batch was malformed
    /// and has been dropped; the decoder is resynchronised for the next call.
    fn decode(&mut self, bytes: &[u8], out: &mut SamplesWithEvents) -> StreamResult<()>;

    /// Switch to a new channel layout, discarding any carried bytes.
    fn set_format(&mut self, format: SignalFormat);

    /// Bytes per sample frame (all channels)
    fn bytes_per_frame(&self) -> usize;
}

/// Factory function to create decoders from an encoding
pub fn create_decoder(encoding: Encoding, format: SignalFormat) -> Box<dyn Decoder> {
    match encoding {
        Encoding::Pcm16 => Box::new(PcmDecoder::new(format.channel_count)),
        Encoding::SpikerBox => Box::new(SpikerBoxDecoder::new(format)),
    }
}

/// Bytes per frame for `encoding` without building a decoder
pub fn bytes_per_frame(encoding: Encoding, channel_count: usize) -> usize {
    match encoding {
        Encoding::Pcm16 | Encoding::SpikerBox => 2 * channel_count.max(1),
    }
}
