// Trigger-aligned signal averaging
//
// Every trigger (a threshold crossing on the selected channel, or any marked
// event) selects a window of samples centred on the trigger index. Completed
// windows are summed per channel; the averaged waveform is sum / count.

use crate::config::AveragingTriggerType;
use crate::decode::SamplesWithEvents;
use crate::draw_buffer::MultichannelDrawBuffer;
use crate::types::Sample;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const MAX_PENDING_TRIGGERS: usize = 32;

/// Averaging options as set by the consumer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AveragingSettings {
    pub enabled: bool,
    pub trigger_type: AveragingTriggerType,
    pub threshold: Sample,
    pub window_seconds: f32,
    pub selected_channel: usize,
}

impl Default for AveragingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            trigger_type: AveragingTriggerType::Threshold,
            threshold: 3_000,
            window_seconds: 1.0,
            selected_channel: 0,
        }
    }
}

pub struct SignalAverager {
    trigger_type: AveragingTriggerType,
    threshold: Sample,
    selected_channel: usize,
    window_len: usize,
    // Most recent `window_len` samples per channel, slot = index % window_len
    history: Vec<Vec<Sample>>,
    processed: u64,
    previous: Option<Sample>,
    pending: VecDeque<u64>,
    sums: Vec<Vec<i64>>,
    count: u32,
}

impl SignalAverager {
    pub fn new(channel_count: usize, window_len: usize, settings: &AveragingSettings) -> Self {
        let window_len = window_len.max(2);
        Self {
            trigger_type: settings.trigger_type,
            threshold: settings.threshold,
            selected_channel: settings.selected_channel,
            window_len,
            history: vec![vec![0; window_len]; channel_count],
            processed: 0,
            previous: None,
            pending: VecDeque::new(),
            sums: vec![vec![0; window_len]; channel_count],
            count: 0,
        }
    }

    pub fn window_len(&self) -> usize {
        self.window_len
    }

    pub fn channel_count(&self) -> usize {
        self.sums.len()
    }

    /// Number of segments accumulated so far
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn reset(&mut self) {
        for channel in &mut self.history {
            channel.fill(0);
        }
        for channel in &mut self.sums {
            channel.fill(0);
        }
        self.processed = 0;
        self.previous = None;
        self.pending.clear();
        self.count = 0;
    }

    fn half(&self) -> u64 {
        (self.window_len / 2) as u64
    }

    fn crossed(&self, previous: Sample, current: Sample) -> bool {
        if self.threshold >= 0 {
            previous < self.threshold && current >= self.threshold
        } else {
            previous > self.threshold && current <= self.threshold
        }
    }

    /// Feed one decoded batch through the trigger detector and accumulator.
    pub fn process(&mut self, batch: &SamplesWithEvents) {
        if batch.channel_count() != self.channel_count() {
            return;
        }
        let count = batch.sample_count();
        let w = self.window_len as u64;

        for k in 0..count {
            let index = self.processed;
            let slot = (index % w) as usize;
            for (channel, samples) in batch.samples.iter().enumerate() {
                self.history[channel][slot] = samples[k];
            }
            self.processed += 1;

            match self.trigger_type {
                AveragingTriggerType::Threshold => {
                    let current = batch.samples.get(self.selected_channel).map(|s| s[k]);
                    if let (Some(previous), Some(current)) = (self.previous, current) {
                        if self.pending.is_empty() && self.crossed(previous, current) {
                            self.pending.push_back(index);
                        }
                    }
                    self.previous = current;
                }
                AveragingTriggerType::AllEvents => {
                    let triggered = batch
                        .events
                        .iter()
                        .filter(|(offset, _)| (*offset).min(count - 1) == k)
                        .count();
                    for _ in 0..triggered {
                        if self.pending.len() < MAX_PENDING_TRIGGERS {
                            self.pending.push_back(index);
                        }
                    }
                }
            }

            self.complete_pending();
        }
    }

    fn complete_pending(&mut self) {
        let half = self.half();
        let w = self.window_len as u64;
        while let Some(&trigger) = self.pending.front() {
            if trigger < half {
                // Not enough history before the trigger
                self.pending.pop_front();
                continue;
            }
            let start = trigger - half;
            if self.processed < start + w {
                break;
            }
            self.pending.pop_front();
            for (sums, history) in self.sums.iter_mut().zip(&self.history) {
                for (j, sum) in sums.iter_mut().enumerate() {
                    *sum += history[((start + j as u64) % w) as usize] as i64;
                }
            }
            self.count += 1;
        }
    }

    /// Write the averaged waveform into `dest`, returning the segment count.
    pub fn snapshot_into(&self, dest: &mut MultichannelDrawBuffer) -> u32 {
        let channels = dest.channel_count().min(self.channel_count());
        let frames = dest.frame_count().min(self.window_len);
        for channel in 0..channels {
            let out = dest.channel_mut(channel);
            for (j, value) in out.iter_mut().enumerate() {
                *value = if self.count == 0 || j >= frames {
                    0
                } else {
                    (self.sums[channel][j] / self.count as i64) as Sample
                };
            }
        }
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(trigger_type: AveragingTriggerType, threshold: Sample) -> AveragingSettings {
        AveragingSettings {
            enabled: true,
            trigger_type,
            threshold,
            window_seconds: 1.0,
            selected_channel: 0,
        }
    }

    fn batch(samples: Vec<Sample>, events: Vec<(usize, &str)>) -> SamplesWithEvents {
        SamplesWithEvents {
            samples: vec![samples],
            events: events
                .into_iter()
                .map(|(o, n)| (o, n.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_threshold_crossing_accumulates_centered_window() {
        let mut averager =
            SignalAverager::new(1, 4, &settings(AveragingTriggerType::Threshold, 10));
        // Crossing at index 3, window covers indices 1..5
        averager.process(&batch(vec![0, 1, 2, 20, 3, 4, 0, 0], vec![]));
        assert_eq!(averager.count(), 1);

        let mut dest = MultichannelDrawBuffer::new(1, 4);
        averager.snapshot_into(&mut dest);
        assert_eq!(dest.channel(0), &[1, 2, 20, 3]);
    }

    #[test]
    fn test_average_of_two_segments() {
        let mut averager =
            SignalAverager::new(1, 2, &settings(AveragingTriggerType::AllEvents, 0));
        averager.process(&batch(vec![0, 10, 20, 0, 30, 40], vec![(2, "a"), (5, "b")]));
        assert_eq!(averager.count(), 2);

        let mut dest = MultichannelDrawBuffer::new(1, 2);
        averager.snapshot_into(&mut dest);
        // segments [10, 20] and [30, 40]
        assert_eq!(dest.channel(0), &[20, 30]);
    }

    #[test]
    fn test_negative_threshold_crosses_downward() {
        let mut averager =
            SignalAverager::new(1, 2, &settings(AveragingTriggerType::Threshold, -10));
        averager.process(&batch(vec![0, 0, -20, 0, 5, 0], vec![]));
        assert_eq!(averager.count(), 1);
    }

    #[test]
    fn test_reset_clears_accumulation() {
        let mut averager =
            SignalAverager::new(1, 2, &settings(AveragingTriggerType::AllEvents, 0));
        averager.process(&batch(vec![1, 2, 3, 4], vec![(2, "x")]));
        assert_eq!(averager.count(), 1);
        averager.reset();
        assert_eq!(averager.count(), 0);

        let mut dest = MultichannelDrawBuffer::new(1, 2);
        assert_eq!(averager.snapshot_into(&mut dest), 0);
        assert_eq!(dest.channel(0), &[0, 0]);
    }
}
