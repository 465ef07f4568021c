// Per-frame preparation steps: auto-scale, vertex assembly, event placement

use super::state::MAX_VERTICAL_SIZE;
use crate::types::Sample;
use std::collections::BTreeMap;

pub const AUTO_SCALE_PERCENT: f32 = 0.8;
pub const MIN_DETECTED_PCM_VALUE: i32 = -5_000_000;

/// Scale factor fitting the window's extremes into 80% of the vertical range.
///
/// Returns `None` (leave the scale alone) unless the window has both a positive
/// and a negative excursion; a window whose max or min is exactly zero is skipped.
pub fn auto_scale(samples: &[Sample]) -> Option<f32> {
    let mut max = 0i32;
    let mut min = 0i32;
    for &sample in samples {
        max = max.max(sample as i32);
        min = min.min(sample as i32);
    }

    if max == 0 || min == 0 {
        return None;
    }
    let max_y = 2 * max.abs().max(min.abs());
    if -max_y > MIN_DETECTED_PCM_VALUE {
        Some(MAX_VERTICAL_SIZE / max_y as f32 * AUTO_SCALE_PERCENT)
    } else {
        None
    }
}

/// Turn the `from..to` range of every channel into (x, y) vertex pairs.
///
/// Up to `max_points` samples are emitted one vertex each; longer ranges are
/// reduced to a min/max envelope with two vertices per bucket. Returns the
/// number of points in channel 0.
pub fn prepare_signal_for_drawing(
    samples: &[Vec<Sample>],
    from: usize,
    to: usize,
    max_points: usize,
    vertices: &mut Vec<Vec<f32>>,
) -> usize {
    vertices.resize_with(samples.len(), Vec::new);
    for (channel, out) in samples.iter().zip(vertices.iter_mut()) {
        out.clear();
        let to = to.min(channel.len());
        let from = from.min(to);
        let window = &channel[from..to];

        if max_points == 0 || window.len() <= max_points {
            for (x, &y) in window.iter().enumerate() {
                out.push(x as f32);
                out.push(y as f32);
            }
            continue;
        }

        let buckets = (max_points / 2).max(1);
        let bucket_len = window.len().div_ceil(buckets);
        for (b, bucket) in window.chunks(bucket_len).enumerate() {
            let (lo, hi) = bucket
                .iter()
                .fold((Sample::MAX, Sample::MIN), |(lo, hi), &s| (lo.min(s), hi.max(s)));
            let x = (b * bucket_len) as f32;
            out.push(x);
            out.push(lo as f32);
            out.push(x);
            out.push(hi as f32);
        }
    }
    vertices.first().map_or(0, |v| v.len() / 2)
}

/// Map snapshot events into the visible window, keyed by x position.
///
/// `event_indices` are absolute sample indices; the frame's last sample has index
/// `last_sample_index - 1` and sits at `frame_count - 1`. Names are matched to the
/// in-window events from the tail of `event_names`.
#[allow(clippy::too_many_arguments)]
pub fn add_events_to_draw_buffer(
    event_indices: &[u64],
    event_names: &[String],
    copied_event_count: usize,
    last_sample_index: u64,
    frame_count: usize,
    from: usize,
    to: usize,
    events: &mut BTreeMap<usize, String>,
) {
    events.clear();
    let frame_start = last_sample_index as i64 - frame_count as i64;
    let positions: Vec<usize> = event_indices
        .iter()
        .take(copied_event_count)
        .filter_map(|&index| {
            let position = index as i64 - frame_start;
            (position >= from as i64 && position < to as i64).then(|| position as usize - from)
        })
        .collect();

    let base = copied_event_count as i64 - positions.len() as i64;
    if base < 0 {
        return;
    }
    for (i, position) in positions.into_iter().enumerate() {
        if let Some(name) = event_names.get(base as usize + i) {
            events.insert(position, name.clone());
        }
    }
}
