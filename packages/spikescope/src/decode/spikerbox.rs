// SpikerBox serial framing
//
// A frame carries one 10-bit ADC sample per channel, each split over two bytes
// of seven payload bits. The first byte of a frame has its top bit set and every
// other byte has it clear, which is how frame boundaries are found.
//
// Between frames the device may send an ASCII message wrapped in escape
// sequences, e.g. `EVNT:3;` for a marker or `MSF:10000;MNC:2;` after the
// sample rate or channel count changed.

use super::{Decoder, SamplesWithEvents};
use crate::types::{SignalFormat, StreamError, StreamResult};

pub const ESCAPE_START: [u8; 6] = [0xFF, 0xFF, 0x01, 0x01, 0x80, 0xFF];
pub const ESCAPE_END: [u8; 6] = [0xFF, 0xFF, 0x01, 0x01, 0x81, 0xFF];

const MAX_MESSAGE_LEN: usize = 64;
const ADC_CENTER: i32 = 512;
// 10-bit ADC values widened to the i16 range
const ADC_TO_SAMPLE: i32 = 64;

pub struct SpikerBoxDecoder {
    format: SignalFormat,
    carry: Vec<u8>,
    resyncing: bool,
    // Markers seen after the last decoded sample, attached to the next one
    held_events: Vec<String>,
}

enum Step {
    /// Consumed this many bytes
    Advance(usize),
    /// Not enough bytes yet; keep the rest for the next call
    NeedMore,
    /// Consumed this many bytes and the channel layout changed
    FormatChanged(usize, SignalFormat),
}

impl SpikerBoxDecoder {
    pub fn new(format: SignalFormat) -> Self {
        Self {
            format: SignalFormat::new(format.sample_rate, format.channel_count.max(1)),
            carry: Vec::new(),
            resyncing: false,
            held_events: Vec::new(),
        }
    }

    /// Encode one frame, the inverse of frame decoding. Used by the simulated device.
    pub fn encode_frame(samples: &[i16], out: &mut Vec<u8>) {
        for (i, &sample) in samples.iter().enumerate() {
            let adc = (sample as i32 / ADC_TO_SAMPLE + ADC_CENTER).clamp(0, 1023);
            let hi = ((adc >> 7) & 0x7F) as u8;
            let lo = (adc & 0x7F) as u8;
            out.push(if i == 0 { hi | 0x80 } else { hi });
            out.push(lo);
        }
    }

    /// Wrap `message` in escape sequences.
    pub fn encode_message(message: &str, out: &mut Vec<u8>) {
        out.extend_from_slice(&ESCAPE_START);
        out.extend_from_slice(message.as_bytes());
        out.extend_from_slice(&ESCAPE_END);
    }

    fn step(&self, rest: &[u8], out: &mut SamplesWithEvents) -> StreamResult<Step> {
        if rest[0] == ESCAPE_START[0] {
            let prefix = rest.len().min(ESCAPE_START.len());
            if rest[..prefix] == ESCAPE_START[..prefix] {
                if prefix < ESCAPE_START.len() {
                    return Ok(Step::NeedMore);
                }
                return self.message(rest, out);
            }
        }

        let frame = self.bytes_per_frame();
        if rest.len() < frame {
            return Ok(Step::NeedMore);
        }
        let bytes = &rest[..frame];
        if bytes[0] & 0x80 == 0 || bytes[1..].iter().any(|b| b & 0x80 != 0) {
            return Err(StreamError::StreamDesync(format!(
                "frame boundary violated: {:02x?}",
                bytes
            )));
        }
        for (channel, pair) in bytes.chunks_exact(2).enumerate() {
            let adc = ((pair[0] as i32 & 0x7F) << 7) | (pair[1] as i32 & 0x7F);
            let value = ((adc - ADC_CENTER) * ADC_TO_SAMPLE).clamp(i16::MIN as i32, i16::MAX as i32);
            out.samples[channel].push(value as i16);
        }
        Ok(Step::Advance(frame))
    }

    /// Keep events that no sample of this batch follows for the next batch.
    fn hold_trailing_events(&mut self, out: &mut SamplesWithEvents) {
        let count = out.sample_count();
        let split = out
            .events
            .iter()
            .position(|(offset, _)| *offset >= count)
            .unwrap_or(out.events.len());
        self.held_events
            .extend(out.events.drain(split..).map(|(_, name)| name));
    }

    fn message(&self, rest: &[u8], out: &mut SamplesWithEvents) -> StreamResult<Step> {
        let body = &rest[ESCAPE_START.len()..];
        let Some(end) = body
            .windows(ESCAPE_END.len())
            .position(|w| w == ESCAPE_END)
        else {
            if body.len() > MAX_MESSAGE_LEN + ESCAPE_END.len() {
                return Err(StreamError::StreamDesync(
                    "unterminated device message".to_string(),
                ));
            }
            return Ok(Step::NeedMore);
        };
        if end > MAX_MESSAGE_LEN {
            return Err(StreamError::StreamDesync(format!(
                "device message too long ({} bytes)",
                end
            )));
        }

        let consumed = ESCAPE_START.len() + end + ESCAPE_END.len();
        let text = String::from_utf8_lossy(&body[..end]);
        let mut format = self.format;
        for entry in text.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            match entry.split_once(':') {
                Some(("EVNT", name)) => {
                    out.events.push((out.sample_count(), name.trim().to_string()));
                }
                Some(("MSF", value)) => match value.trim().parse() {
                    Ok(rate) if rate > 0 => format.sample_rate = rate,
                    _ => log::warn!("Ignoring invalid sample rate message: {}", entry),
                },
                Some(("MNC", value)) => match value.trim().parse() {
                    Ok(count) if count > 0 => format.channel_count = count,
                    _ => log::warn!("Ignoring invalid channel count message: {}", entry),
                },
                _ => log::debug!("Unhandled device message: {}", entry),
            }
        }

        if format != self.format {
            Ok(Step::FormatChanged(consumed, format))
        } else {
            Ok(Step::Advance(consumed))
        }
    }
}

impl Decoder for SpikerBoxDecoder {
    fn decode(&mut self, bytes: &[u8], out: &mut SamplesWithEvents) -> StreamResult<()> {
        out.reset(self.format.channel_count);
        out.events
            .extend(self.held_events.drain(..).map(|name| (0, name)));
        self.carry.extend_from_slice(bytes);

        if self.resyncing {
            match self.carry.iter().position(|b| b & 0x80 != 0) {
                Some(start) => {
                    self.carry.drain(..start);
                    self.resyncing = false;
                }
                None => {
                    self.carry.clear();
                    self.hold_trailing_events(out);
                    return Ok(());
                }
            }
        }

        let data = std::mem::take(&mut self.carry);
        let mut pos = 0;
        while pos < data.len() {
            match self.step(&data[pos..], out) {
                Ok(Step::Advance(n)) => pos += n,
                Ok(Step::NeedMore) => break,
                Ok(Step::FormatChanged(n, format)) => {
                    pos += n;
                    log::info!(
                        "Device reported {} channels @ {} Hz",
                        format.channel_count,
                        format.sample_rate
                    );
                    self.format = format;
                    out.format_change = Some(format);
                    break;
                }
                Err(e) => {
                    self.resyncing = true;
                    return Err(e);
                }
            }
        }
        self.carry = data;
        self.carry.drain(..pos);
        self.hold_trailing_events(out);
        Ok(())
    }

    fn set_format(&mut self, format: SignalFormat) {
        self.format = SignalFormat::new(format.sample_rate, format.channel_count.max(1));
        self.carry.clear();
        self.resyncing = false;
        self.held_events.clear();
    }

    fn bytes_per_frame(&self) -> usize {
        2 * self.format.channel_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder(channels: usize) -> SpikerBoxDecoder {
        SpikerBoxDecoder::new(SignalFormat::new(10_000, channels))
    }

    #[test]
    fn test_decodes_frames() {
        let mut bytes = Vec::new();
        SpikerBoxDecoder::encode_frame(&[0, 6_400], &mut bytes);
        SpikerBoxDecoder::encode_frame(&[-6_400, 0], &mut bytes);
        assert_eq!(bytes[0] & 0x80, 0x80);
        assert!(bytes[1..4].iter().all(|b| b & 0x80 == 0));

        let mut out = SamplesWithEvents::default();
        decoder(2).decode(&bytes, &mut out).unwrap();
        assert_eq!(out.samples, vec![vec![0, -6_400], vec![6_400, 0]]);
    }

    #[test]
    fn test_event_attached_to_next_sample() {
        let mut bytes = Vec::new();
        SpikerBoxDecoder::encode_frame(&[64], &mut bytes);
        SpikerBoxDecoder::encode_message("EVNT:3;", &mut bytes);
        SpikerBoxDecoder::encode_frame(&[128], &mut bytes);

        let mut out = SamplesWithEvents::default();
        decoder(1).decode(&bytes, &mut out).unwrap();
        assert_eq!(out.samples, vec![vec![64, 128]]);
        assert_eq!(out.events, vec![(1, "3".to_string())]);
    }

    #[test]
    fn test_trailing_event_waits_for_next_sample() {
        let mut first = Vec::new();
        SpikerBoxDecoder::encode_frame(&[64], &mut first);
        SpikerBoxDecoder::encode_message("EVNT:1;", &mut first);
        let mut second = Vec::new();
        SpikerBoxDecoder::encode_frame(&[128], &mut second);

        let mut dec = decoder(1);
        let mut out = SamplesWithEvents::default();
        dec.decode(&first, &mut out).unwrap();
        assert_eq!(out.samples, vec![vec![64]]);
        assert!(out.events.is_empty());

        // A read with no samples keeps holding the marker.
        dec.decode(&[], &mut out).unwrap();
        assert!(out.is_empty());

        dec.decode(&second, &mut out).unwrap();
        assert_eq!(out.samples, vec![vec![128]]);
        assert_eq!(out.events, vec![(0, "1".to_string())]);
    }

    #[test]
    fn test_set_format_drops_held_events() {
        let mut bytes = Vec::new();
        SpikerBoxDecoder::encode_message("EVNT:1;", &mut bytes);
        let mut dec = decoder(1);
        let mut out = SamplesWithEvents::default();
        dec.decode(&bytes, &mut out).unwrap();

        dec.set_format(SignalFormat::new(10_000, 1));
        let mut frame = Vec::new();
        SpikerBoxDecoder::encode_frame(&[0], &mut frame);
        dec.decode(&frame, &mut out).unwrap();
        assert!(out.events.is_empty());
    }

    #[test]
    fn test_message_split_across_batches() {
        let mut bytes = Vec::new();
        SpikerBoxDecoder::encode_message("EVNT:go;", &mut bytes);
        SpikerBoxDecoder::encode_frame(&[0], &mut bytes);

        let mut dec = decoder(1);
        let mut out = SamplesWithEvents::default();
        dec.decode(&bytes[..3], &mut out).unwrap();
        assert!(out.is_empty());
        dec.decode(&bytes[3..10], &mut out).unwrap();
        assert!(out.is_empty());
        dec.decode(&bytes[10..], &mut out).unwrap();
        assert_eq!(out.events, vec![(0, "go".to_string())]);
        assert_eq!(out.sample_count(), 1);
    }

    #[test]
    fn test_format_message_stops_batch() {
        let mut bytes = Vec::new();
        SpikerBoxDecoder::encode_frame(&[0], &mut bytes);
        SpikerBoxDecoder::encode_message("MSF:5000;MNC:2;", &mut bytes);
        SpikerBoxDecoder::encode_frame(&[64, -64], &mut bytes);

        let mut dec = decoder(1);
        let mut out = SamplesWithEvents::default();
        dec.decode(&bytes, &mut out).unwrap();
        assert_eq!(out.sample_count(), 1);
        assert_eq!(out.format_change, Some(SignalFormat::new(5_000, 2)));
        assert_eq!(dec.bytes_per_frame(), 4);

        // Remaining bytes decode with the new layout.
        dec.decode(&[], &mut out).unwrap();
        assert_eq!(out.samples, vec![vec![64], vec![-64]]);
        assert_eq!(out.format_change, None);
    }

    #[test]
    fn test_desync_then_resync() {
        let mut dec = decoder(1);
        let mut out = SamplesWithEvents::default();
        let result = dec.decode(&[0x01, 0x02, 0x03], &mut out);
        assert!(matches!(result, Err(StreamError::StreamDesync(_))));

        let mut bytes = vec![0x05];
        SpikerBoxDecoder::encode_frame(&[640], &mut bytes);
        dec.decode(&bytes, &mut out).unwrap();
        assert_eq!(out.samples, vec![vec![640]]);
    }

    #[test]
    fn test_unterminated_message_desyncs() {
        let mut bytes = ESCAPE_START.to_vec();
        bytes.extend(std::iter::repeat(b'x').take(MAX_MESSAGE_LEN + 10));
        let mut out = SamplesWithEvents::default();
        assert!(decoder(1).decode(&bytes, &mut out).is_err());
    }
}
