// Interleaved little-endian i16 frames (audio input, raw recordings)

use super::{Decoder, SamplesWithEvents};
use crate::types::{SignalFormat, StreamResult};

pub struct PcmDecoder {
    channel_count: usize,
    carry: Vec<u8>,
}

impl PcmDecoder {
    pub fn new(channel_count: usize) -> Self {
        Self {
            channel_count: channel_count.max(1),
            carry: Vec::new(),
        }
    }
}

impl Decoder for PcmDecoder {
    fn decode(&mut self, bytes: &[u8], out: &mut SamplesWithEvents) -> StreamResult<()> {
        out.reset(self.channel_count);
        self.carry.extend_from_slice(bytes);

        let frame = self.bytes_per_frame();
        let whole = self.carry.len() / frame * frame;
        for chunk in self.carry[..whole].chunks_exact(frame) {
            for (channel, pair) in chunk.chunks_exact(2).enumerate() {
                out.samples[channel].push(i16::from_le_bytes([pair[0], pair[1]]));
            }
        }
        self.carry.drain(..whole);
        Ok(())
    }

    fn set_format(&mut self, format: SignalFormat) {
        self.channel_count = format.channel_count.max(1);
        self.carry.clear();
    }

    fn bytes_per_frame(&self) -> usize {
        2 * self.channel_count
    }
}
