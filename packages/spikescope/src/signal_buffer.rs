// Shared signal buffer
//
// The per-channel sample ring and the event ring live behind one mutex so a
// reader never sees samples and events out of step. Every sample has an
// absolute index (`last_sample_index` counts all samples ever appended); events
// are stored with the absolute index of the sample they belong to and are pruned
// as soon as that sample leaves the ring.
//
// Created once per application and shared by `Arc` between the dispatch worker
// (the only writer) and the frame preparer (the only reader).

use crate::averaging::{AveragingSettings, SignalAverager};
use crate::config::PipelineConfig;
use crate::decode::SamplesWithEvents;
use crate::dispatch::SampleSink;
use crate::draw_buffer::{FftDrawBuffer, MultichannelDrawBuffer};
use crate::types::{Sample, SignalFormat};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;

/// Upper bound on events returned by one snapshot
pub const MAX_SNAPSHOT_EVENTS: usize = 1000;
const FFT_HISTORY_COLUMNS: usize = 128;

/// Notified after the buffer has been resized or reconfigured
pub trait SignalPropertyListener: Send + Sync {
    fn on_format_changed(&self, format: SignalFormat);

    fn on_buffer_size_changed(&self, _buffer_size: usize) {}
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BufferSizing {
    Fixed(usize),
    Seconds(f32),
}

impl BufferSizing {
    fn size_for(self, format: SignalFormat) -> usize {
        match self {
            BufferSizing::Fixed(size) => size,
            BufferSizing::Seconds(seconds) => format.samples_for(seconds),
        }
    }
}

/// State guarded by the buffer lock
pub struct SignalRings {
    format: SignalFormat,
    buffer_size: usize,
    sizing: BufferSizing,
    samples: Vec<Vec<Sample>>,
    stored: usize,
    last_sample_index: u64,
    events: VecDeque<(u64, String)>,
    fft: VecDeque<Vec<f32>>,
    averaging: AveragingSettings,
    averager: SignalAverager,
}

impl SignalRings {
    fn new(format: SignalFormat, sizing: BufferSizing, averaging: AveragingSettings) -> Self {
        let buffer_size = sizing.size_for(format).max(1);
        Self {
            format,
            buffer_size,
            sizing,
            samples: vec![vec![0; buffer_size]; format.channel_count],
            stored: 0,
            last_sample_index: 0,
            events: VecDeque::new(),
            fft: VecDeque::new(),
            averaging,
            averager: SignalAverager::new(
                format.channel_count,
                format.samples_for(averaging.window_seconds),
                &averaging,
            ),
        }
    }

    /// Drop all contents and reallocate for the current format and size.
    fn reallocate(&mut self) {
        self.samples = vec![vec![0; self.buffer_size]; self.format.channel_count];
        self.stored = 0;
        self.events.clear();
        self.fft.clear();
        self.rebuild_averager();
    }

    fn rebuild_averager(&mut self) {
        self.averager = SignalAverager::new(
            self.format.channel_count,
            self.format.samples_for(self.averaging.window_seconds),
            &self.averaging,
        );
    }

    fn oldest_index(&self) -> u64 {
        self.last_sample_index - self.stored as u64
    }

    fn append(&mut self, batch: &SamplesWithEvents) {
        if batch.channel_count() != self.format.channel_count {
            log::debug!(
                "Dropping batch with {} channels, buffer has {}",
                batch.channel_count(),
                self.format.channel_count
            );
            return;
        }

        let count = batch.sample_count();
        let start = self.last_sample_index;
        let size = self.buffer_size as u64;
        // Only the newest `buffer_size` samples of an oversized batch survive.
        let skip = count.saturating_sub(self.buffer_size);
        for (ring, samples) in self.samples.iter_mut().zip(&batch.samples) {
            for (k, &sample) in samples.iter().enumerate().skip(skip) {
                ring[((start + k as u64) % size) as usize] = sample;
            }
        }
        self.last_sample_index += count as u64;
        self.stored = (self.stored + count).min(self.buffer_size);

        for (offset, name) in &batch.events {
            let index = if count > 0 {
                start + (*offset).min(count - 1) as u64
            } else if self.stored > 0 {
                // Marker arrived without samples: attach to the newest sample.
                self.last_sample_index - 1
            } else {
                continue;
            };
            self.events.push_back((index, name.clone()));
        }
        let oldest = self.oldest_index();
        while self
            .events
            .front()
            .is_some_and(|(index, _)| *index < oldest)
        {
            self.events.pop_front();
        }
        while self.events.len() > self.buffer_size {
            self.events.pop_front();
        }

        for column in &batch.fft {
            self.fft.push_back(column.clone());
            if self.fft.len() > FFT_HISTORY_COLUMNS {
                self.fft.pop_front();
            }
        }

        if self.averaging.enabled {
            self.averager.process(batch);
        }
    }

    /// Copy the newest samples (right-aligned, zero-filled) and the events within
    /// that window. Returns the number of events copied.
    pub fn snapshot_into(
        &self,
        samples: &mut MultichannelDrawBuffer,
        averaged: Option<&mut MultichannelDrawBuffer>,
        event_indices: &mut Vec<u64>,
        event_names: &mut Vec<String>,
        fft: Option<&mut FftDrawBuffer>,
    ) -> usize {
        let frame = samples.frame_count();
        let available = self.stored.min(frame);
        let size = self.buffer_size as u64;
        let first = self.last_sample_index - available as u64;
        let channels = samples.channel_count().min(self.samples.len());
        for channel in 0..channels {
            let ring = &self.samples[channel];
            let dest = samples.channel_mut(channel);
            let (pad, tail) = dest.split_at_mut(frame - available);
            pad.fill(0);
            for (j, out) in tail.iter_mut().enumerate() {
                *out = ring[((first + j as u64) % size) as usize];
            }
        }

        if let Some(averaged) = averaged {
            self.averager.snapshot_into(averaged);
        }

        event_indices.clear();
        event_names.clear();
        let window_start = self.last_sample_index.saturating_sub(frame as u64);
        let in_window = self
            .events
            .iter()
            .rev()
            .take_while(|(index, _)| *index >= window_start)
            .take(MAX_SNAPSHOT_EVENTS)
            .count();
        for (index, name) in self.events.iter().skip(self.events.len() - in_window) {
            event_indices.push(*index);
            event_names.push(name.clone());
        }

        if let Some(fft) = fft {
            let columns = fft.column_count().min(self.fft.len());
            let pad = fft.column_count() - columns;
            let bins = fft.bins();
            let source = self.fft.iter().skip(self.fft.len() - columns);
            for column in &mut fft.columns_mut()[..pad] {
                column.fill(0.0);
            }
            for (dest, src) in fft.columns_mut()[pad..].iter_mut().zip(source) {
                let n = bins.min(src.len());
                dest[..n].copy_from_slice(&src[..n]);
                dest[n..].fill(0.0);
            }
        }

        in_window
    }

    pub fn format(&self) -> SignalFormat {
        self.format
    }

    pub fn channel_count(&self) -> usize {
        self.format.channel_count
    }

    pub fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn last_sample_index(&self) -> u64 {
        self.last_sample_index
    }

    /// Samples per channel currently held
    pub fn stored_samples(&self) -> usize {
        self.stored
    }

    pub fn averaging(&self) -> AveragingSettings {
        self.averaging
    }

    /// Length of the averaged waveform in samples
    pub fn averaging_window_len(&self) -> usize {
        self.averager.window_len()
    }
}

/// Lock held while a consumer reads the buffer
pub type SignalBufferGuard<'a> = MutexGuard<'a, SignalRings>;

pub struct SharedSignalBuffer {
    rings: Mutex<SignalRings>,
    listener: RwLock<Option<Arc<dyn SignalPropertyListener>>>,
}

impl SharedSignalBuffer {
    /// Buffer with a fixed capacity of `buffer_size` samples per channel
    pub fn new(format: SignalFormat, buffer_size: usize) -> Self {
        Self::with_sizing(
            format,
            BufferSizing::Fixed(buffer_size.max(1)),
            AveragingSettings::default(),
        )
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        let sizing = match config.buffer_size {
            Some(size) => BufferSizing::Fixed(size.max(1)),
            None => BufferSizing::Seconds(config.history_seconds),
        };
        let averaging = AveragingSettings {
            enabled: config.averaging_enabled,
            trigger_type: config.averaging_trigger_type,
            threshold: config.averaging_threshold,
            window_seconds: config.averaging_window_seconds,
            selected_channel: config.selected_channel,
        };
        Self::with_sizing(config.format(), sizing, averaging)
    }

    fn with_sizing(format: SignalFormat, sizing: BufferSizing, averaging: AveragingSettings) -> Self {
        let format = SignalFormat::new(format.sample_rate, format.channel_count.max(1));
        Self {
            rings: Mutex::new(SignalRings::new(format, sizing, averaging)),
            listener: RwLock::new(None),
        }
    }

    /// Take the buffer lock for a consistent multi-step read.
    pub fn lock(&self) -> SignalBufferGuard<'_> {
        self.rings.lock()
    }

    pub fn set_property_listener(&self, listener: Option<Arc<dyn SignalPropertyListener>>) {
        *self.listener.write() = listener;
    }

    fn listener(&self) -> Option<Arc<dyn SignalPropertyListener>> {
        self.listener.read().clone()
    }

    /// Resize both rings to `buffer_size` samples, clearing them. No-op for 0 or
    /// the current size.
    pub fn set_buffer_size(&self, buffer_size: usize) {
        {
            let mut rings = self.rings.lock();
            if buffer_size == 0 || buffer_size == rings.buffer_size {
                return;
            }
            log::debug!(
                "Signal buffer size {} -> {} samples",
                rings.buffer_size,
                buffer_size
            );
            rings.sizing = BufferSizing::Fixed(buffer_size);
            rings.buffer_size = buffer_size;
            rings.reallocate();
        }
        if let Some(listener) = self.listener() {
            listener.on_buffer_size_changed(buffer_size);
        }
    }

    /// Adopt a new sample rate / channel count. Clears both rings unless nothing changed.
    pub fn reconfigure(&self, format: SignalFormat) {
        let format = SignalFormat::new(format.sample_rate, format.channel_count.max(1));
        let buffer_size = {
            let mut rings = self.rings.lock();
            let buffer_size = rings.sizing.size_for(format).max(1);
            if rings.format == format && rings.buffer_size == buffer_size {
                return;
            }
            log::info!(
                "Signal buffer reconfigured: {} channels @ {} Hz, {} samples",
                format.channel_count,
                format.sample_rate,
                buffer_size
            );
            rings.format = format;
            rings.buffer_size = buffer_size;
            rings.reallocate();
            buffer_size
        };
        if let Some(listener) = self.listener() {
            listener.on_buffer_size_changed(buffer_size);
            listener.on_format_changed(format);
        }
    }

    /// Change averaging options. Accumulation restarts whenever settings change.
    pub fn configure_averaging(&self, settings: AveragingSettings) {
        let mut rings = self.rings.lock();
        let previous = rings.averaging;
        if previous == settings {
            return;
        }
        rings.averaging = settings;
        let toggled = AveragingSettings {
            enabled: settings.enabled,
            ..previous
        };
        if toggled == settings {
            // Only the toggle flipped: the window shape is unchanged.
            rings.averager.reset();
        } else {
            rings.rebuild_averager();
        }
    }

    pub fn add_to_buffer(&self, batch: &SamplesWithEvents) {
        self.rings.lock().append(batch);
    }

    /// See [`SignalRings::snapshot_into`]
    pub fn snapshot_into(
        &self,
        samples: &mut MultichannelDrawBuffer,
        averaged: Option<&mut MultichannelDrawBuffer>,
        event_indices: &mut Vec<u64>,
        event_names: &mut Vec<String>,
        fft: Option<&mut FftDrawBuffer>,
    ) -> usize {
        self.rings
            .lock()
            .snapshot_into(samples, averaged, event_indices, event_names, fft)
    }

    pub fn last_sample_index(&self) -> u64 {
        self.rings.lock().last_sample_index
    }

    pub fn stored_samples(&self) -> usize {
        self.rings.lock().stored
    }

    pub fn buffer_size(&self) -> usize {
        self.rings.lock().buffer_size
    }

    pub fn format(&self) -> SignalFormat {
        self.rings.lock().format
    }

    pub fn channel_count(&self) -> usize {
        self.format().channel_count
    }

    pub fn sample_rate(&self) -> u32 {
        self.format().sample_rate
    }
}

impl SampleSink for SharedSignalBuffer {
    fn on_samples(&self, batch: &SamplesWithEvents) {
        self.add_to_buffer(batch);
    }

    fn on_format_change(&self, format: SignalFormat) {
        self.reconfigure(format);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AveragingTriggerType;

    fn batch(channels: &[Vec<Sample>], events: &[(usize, &str)]) -> SamplesWithEvents {
        SamplesWithEvents {
            samples: channels.to_vec(),
            events: events.iter().map(|(o, n)| (*o, n.to_string())).collect(),
            ..Default::default()
        }
    }

    fn ramp(from: i16, count: usize) -> Vec<Sample> {
        (0..count as i16).map(|i| from + i).collect()
    }

    #[test]
    fn test_last_index_advances_by_batch_size() {
        let buffer = SharedSignalBuffer::new(SignalFormat::new(1_000, 2), 16);
        buffer.add_to_buffer(&batch(&[ramp(0, 5), ramp(100, 5)], &[]));
        assert_eq!(buffer.last_sample_index(), 5);
        buffer.add_to_buffer(&batch(&[ramp(5, 3), ramp(105, 3)], &[]));
        assert_eq!(buffer.last_sample_index(), 8);
        assert_eq!(buffer.stored_samples(), 8);
    }

    #[test]
    fn test_snapshot_right_aligned_and_zero_filled() {
        let buffer = SharedSignalBuffer::new(SignalFormat::new(1_000, 2), 16);
        buffer.add_to_buffer(&batch(&[ramp(1, 3), ramp(11, 3)], &[]));

        let mut dest = MultichannelDrawBuffer::new(2, 5);
        let (mut indices, mut names) = (Vec::new(), Vec::new());
        buffer.snapshot_into(&mut dest, None, &mut indices, &mut names, None);
        assert_eq!(dest.channel(0), &[0, 0, 1, 2, 3]);
        assert_eq!(dest.channel(1), &[0, 0, 11, 12, 13]);
    }

    #[test]
    fn test_ring_wraps_oldest_first() {
        let buffer = SharedSignalBuffer::new(SignalFormat::new(1_000, 1), 4);
        buffer.add_to_buffer(&batch(&[ramp(0, 3)], &[]));
        buffer.add_to_buffer(&batch(&[ramp(3, 3)], &[]));
        assert_eq!(buffer.stored_samples(), 4);

        let mut dest = MultichannelDrawBuffer::new(1, 4);
        let (mut indices, mut names) = (Vec::new(), Vec::new());
        buffer.snapshot_into(&mut dest, None, &mut indices, &mut names, None);
        assert_eq!(dest.channel(0), &[2, 3, 4, 5]);
    }

    #[test]
    fn test_snapshot_is_idempotent() {
        let buffer = SharedSignalBuffer::new(SignalFormat::new(1_000, 1), 32);
        buffer.add_to_buffer(&batch(&[ramp(0, 20)], &[(4, "a"), (15, "b")]));

        let mut first = MultichannelDrawBuffer::new(1, 10);
        let mut second = MultichannelDrawBuffer::new(1, 10);
        let (mut i1, mut n1, mut i2, mut n2) = (Vec::new(), Vec::new(), Vec::new(), Vec::new());
        let c1 = buffer.snapshot_into(&mut first, None, &mut i1, &mut n1, None);
        let c2 = buffer.snapshot_into(&mut second, None, &mut i2, &mut n2, None);
        assert_eq!(first, second);
        assert_eq!((c1, i1, n1), (c2, i2, n2));
    }

    #[test]
    fn test_events_within_snapshot_window() {
        let buffer = SharedSignalBuffer::new(SignalFormat::new(1_000, 1), 64);
        for round in 0..10 {
            let name = format!("r{}", round);
            buffer.add_to_buffer(&batch(&[ramp(0, 7)], &[(0, "start"), (6, name.as_str())]));
        }
        let window = 12;
        let mut dest = MultichannelDrawBuffer::new(1, window);
        let (mut indices, mut names) = (Vec::new(), Vec::new());
        let count = buffer.snapshot_into(&mut dest, None, &mut indices, &mut names, None);

        let last = buffer.last_sample_index();
        assert_eq!(count, indices.len());
        assert_eq!(count, names.len());
        assert!(count > 0);
        assert!(indices
            .iter()
            .all(|&i| i >= last - window as u64 && i <= last));
        assert_eq!(names.last().map(String::as_str), Some("r9"));
    }

    #[test]
    fn test_events_pruned_with_samples() {
        let buffer = SharedSignalBuffer::new(SignalFormat::new(1_000, 1), 4);
        buffer.add_to_buffer(&batch(&[ramp(0, 2)], &[(0, "old")]));
        buffer.add_to_buffer(&batch(&[ramp(2, 4)], &[(1, "new")]));

        let rings = buffer.lock();
        assert_eq!(rings.events.len(), 1);
        assert_eq!(rings.events[0], (3, "new".to_string()));
        assert!(rings.events.iter().all(|(i, _)| *i >= rings.oldest_index()));
    }

    #[test]
    fn test_set_buffer_size_same_is_noop() {
        let buffer = SharedSignalBuffer::new(SignalFormat::new(1_000, 1), 8);
        buffer.add_to_buffer(&batch(&[ramp(1, 4)], &[(2, "e")]));
        let before = buffer.lock().samples.clone();

        buffer.set_buffer_size(8);
        buffer.set_buffer_size(0);
        assert_eq!(buffer.lock().samples, before);
        assert_eq!(buffer.stored_samples(), 4);
        assert_eq!(buffer.lock().events.len(), 1);

        buffer.set_buffer_size(16);
        assert_eq!(buffer.buffer_size(), 16);
        assert_eq!(buffer.stored_samples(), 0);
        assert!(buffer.lock().events.is_empty());
    }

    #[test]
    fn test_channel_mismatch_batch_dropped() {
        let buffer = SharedSignalBuffer::new(SignalFormat::new(1_000, 2), 8);
        buffer.add_to_buffer(&batch(&[ramp(0, 4)], &[]));
        assert_eq!(buffer.last_sample_index(), 0);
    }

    #[test]
    fn test_reconfigure_clears_and_notifies() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        #[derive(Default)]
        struct Counter(AtomicUsize);
        impl SignalPropertyListener for Counter {
            fn on_format_changed(&self, _format: SignalFormat) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let config = PipelineConfig {
            history_seconds: 2.0,
            sample_rate: 100,
            ..Default::default()
        };
        let buffer = SharedSignalBuffer::from_config(&config);
        assert_eq!(buffer.buffer_size(), 200);
        let counter = Arc::new(Counter::default());
        buffer.set_property_listener(Some(counter.clone()));

        buffer.add_to_buffer(&batch(&[ramp(0, 10)], &[(1, "e")]));
        buffer.reconfigure(SignalFormat::new(100, 1));
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
        assert_eq!(buffer.stored_samples(), 10);

        buffer.reconfigure(SignalFormat::new(500, 3));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(buffer.buffer_size(), 1_000);
        assert_eq!(buffer.channel_count(), 3);
        assert_eq!(buffer.stored_samples(), 0);
        assert!(buffer.lock().events.is_empty());
    }

    #[test]
    fn test_averaged_snapshot() {
        let buffer = SharedSignalBuffer::new(SignalFormat::new(4, 1), 64);
        buffer.configure_averaging(AveragingSettings {
            enabled: true,
            trigger_type: AveragingTriggerType::AllEvents,
            threshold: 0,
            window_seconds: 1.0,
            selected_channel: 0,
        });
        assert_eq!(buffer.lock().averaging_window_len(), 4);
        buffer.add_to_buffer(&batch(&[vec![0, 1, 2, 3, 4, 5, 6, 7]], &[(3, "t")]));

        let mut dest = MultichannelDrawBuffer::new(1, 8);
        let mut averaged = MultichannelDrawBuffer::new(1, 4);
        let (mut indices, mut names) = (Vec::new(), Vec::new());
        buffer.snapshot_into(&mut dest, Some(&mut averaged), &mut indices, &mut names, None);
        assert_eq!(averaged.channel(0), &[1, 2, 3, 4]);
    }

    fn all_events_averaging(enabled: bool) -> AveragingSettings {
        AveragingSettings {
            enabled,
            trigger_type: AveragingTriggerType::AllEvents,
            threshold: 0,
            window_seconds: 1.0,
            selected_channel: 0,
        }
    }

    #[test]
    fn test_averaging_restarts_when_toggled() {
        let buffer = SharedSignalBuffer::new(SignalFormat::new(4, 1), 64);
        buffer.configure_averaging(all_events_averaging(true));
        buffer.add_to_buffer(&batch(&[ramp(0, 8)], &[(3, "t")]));
        assert_eq!(buffer.lock().averager.count(), 1);

        buffer.configure_averaging(all_events_averaging(false));
        buffer.configure_averaging(all_events_averaging(true));
        assert_eq!(buffer.lock().averager.count(), 0);

        let mut dest = MultichannelDrawBuffer::new(1, 8);
        let mut averaged = MultichannelDrawBuffer::new(1, 4);
        let (mut indices, mut names) = (Vec::new(), Vec::new());
        buffer.snapshot_into(&mut dest, Some(&mut averaged), &mut indices, &mut names, None);
        assert_eq!(averaged.channel(0), &[0, 0, 0, 0]);

        // Accumulation works again after the restart.
        buffer.add_to_buffer(&batch(&[ramp(0, 8)], &[(3, "t")]));
        assert_eq!(buffer.lock().averager.count(), 1);
    }

    #[test]
    fn test_averaging_restarts_on_reconfigure() {
        let buffer = SharedSignalBuffer::new(SignalFormat::new(4, 1), 64);
        buffer.configure_averaging(all_events_averaging(true));
        buffer.add_to_buffer(&batch(&[ramp(0, 8)], &[(3, "t")]));
        assert_eq!(buffer.lock().averager.count(), 1);

        buffer.reconfigure(SignalFormat::new(4, 2));
        let rings = buffer.lock();
        assert_eq!(rings.averager.count(), 0);
        assert_eq!(rings.averager.channel_count(), 2);
    }

    #[test]
    fn test_fft_columns_right_aligned() {
        let buffer = SharedSignalBuffer::new(SignalFormat::new(1_000, 1), 8);
        let mut input = batch(&[ramp(0, 1)], &[]);
        input.fft = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        buffer.add_to_buffer(&input);

        let mut dest = MultichannelDrawBuffer::new(1, 1);
        let mut fft = FftDrawBuffer::new(3, 2);
        let (mut indices, mut names) = (Vec::new(), Vec::new());
        buffer.snapshot_into(&mut dest, None, &mut indices, &mut names, Some(&mut fft));
        assert_eq!(
            fft.columns(),
            &[vec![0.0, 0.0], vec![1.0, 2.0], vec![3.0, 4.0]]
        );
    }
}
