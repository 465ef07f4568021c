// Per-channel vertical scale and offset
//
// Kept across frames and reconfigurations. Channel 0 doubles as the "global"
// setting: on a channel count change it keeps its values and new channels start
// from its scale.

use serde::{Deserialize, Serialize};

/// Full vertical range of the drawing space
pub const MAX_VERTICAL_SIZE: f32 = i16::MAX as f32 * 40.0;
pub const MAX_VERTICAL_HALF_SIZE: f32 = MAX_VERTICAL_SIZE * 0.5;
pub const MIN_SCALE_FACTOR: f32 = 1.0;
pub const MAX_SCALE_FACTOR: f32 = 5000.0;
pub const DEFAULT_SCALE_FACTOR: f32 = 30.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelRenderState {
    scale_factors: Vec<f32>,
    positions: Vec<f32>,
}

/// Evenly spaced channel offsets over the vertical range
pub fn default_positions(channel_count: usize) -> Vec<f32> {
    let step = MAX_VERTICAL_SIZE / (channel_count + 1) as f32;
    (0..channel_count)
        .map(|i| -MAX_VERTICAL_HALF_SIZE + step * (i + 1) as f32)
        .collect()
}

impl ChannelRenderState {
    pub fn new(channel_count: usize) -> Self {
        let channel_count = channel_count.max(1);
        Self {
            scale_factors: vec![DEFAULT_SCALE_FACTOR; channel_count],
            positions: default_positions(channel_count),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.scale_factors.len()
    }

    pub fn scale_factors(&self) -> &[f32] {
        &self.scale_factors
    }

    pub fn positions(&self) -> &[f32] {
        &self.positions
    }

    pub fn scale_factor(&self, channel: usize) -> Option<f32> {
        self.scale_factors.get(channel).copied()
    }

    pub fn position(&self, channel: usize) -> Option<f32> {
        self.positions.get(channel).copied()
    }

    /// Reallocate for `channel_count` channels.
    ///
    /// Channel 0 keeps its scale and offset, other existing channels keep their
    /// scale, new channels take channel 0's scale, and every channel except 0 is
    /// laid out at its default offset.
    pub fn resize(&mut self, channel_count: usize) {
        let channel_count = channel_count.max(1);
        if channel_count == self.channel_count() {
            return;
        }
        let global_scale = self.scale_factors[0];
        let global_position = self.positions[0];

        let mut scale_factors = vec![global_scale; channel_count];
        let kept = self.channel_count().min(channel_count);
        scale_factors[..kept].copy_from_slice(&self.scale_factors[..kept]);

        let mut positions = default_positions(channel_count);
        positions[0] = global_position;

        self.scale_factors = scale_factors;
        self.positions = positions;
    }

    /// Set a channel's scale as computed (auto-scale). Negative or unchanged values are ignored.
    pub fn set_scale_factor(&mut self, channel: usize, scale: f32) -> bool {
        match self.scale_factors.get_mut(channel) {
            Some(current) if scale >= 0.0 && scale != *current => {
                *current = scale;
                true
            }
            _ => false,
        }
    }

    /// Multiply a channel's scale (zoom gesture), clamped to the manual zoom range.
    pub fn scale_by(&mut self, channel: usize, factor: f32) {
        if let Some(current) = self.scale_factors.get_mut(channel) {
            if factor < 0.0 || factor == 1.0 {
                return;
            }
            *current = (*current * factor).clamp(MIN_SCALE_FACTOR, MAX_SCALE_FACTOR);
        }
    }

    /// Shift a channel's offset by `dy` in drawing-space units.
    pub fn move_by(&mut self, channel: usize, dy: f32) {
        if let Some(position) = self.positions.get_mut(channel) {
            *position -= dy;
        }
    }
}
