// Consumer-owned snapshot buffers
//
// One fixed-size sample window per channel. Reused frame after frame and only
// reallocated (wholesale) when the channel count or frame size changes.

use crate::types::Sample;

/// Per-channel sliding sample windows filled by a snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct MultichannelDrawBuffer {
    channels: Vec<Vec<Sample>>,
    frame_count: usize,
}

impl MultichannelDrawBuffer {
    pub fn new(channel_count: usize, frame_count: usize) -> Self {
        Self {
            channels: vec![vec![0; frame_count]; channel_count],
            frame_count,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Samples per channel
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn channel(&self, index: usize) -> &[Sample] {
        &self.channels[index]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut [Sample] {
        &mut self.channels[index]
    }

    pub fn buffer(&self) -> &[Vec<Sample>] {
        &self.channels
    }

    /// True when this buffer can hold a snapshot of the given shape without reallocating.
    pub fn fits(&self, channel_count: usize, frame_count: usize) -> bool {
        self.channels.len() == channel_count && self.frame_count == frame_count
    }
}

/// Rolling spectrogram columns (one magnitude vector per time slice)
#[derive(Debug, Clone, PartialEq)]
pub struct FftDrawBuffer {
    columns: Vec<Vec<f32>>,
    bins: usize,
}

impl FftDrawBuffer {
    pub fn new(column_count: usize, bins: usize) -> Self {
        Self {
            columns: vec![vec![0.0; bins]; column_count],
            bins,
        }
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn bins(&self) -> usize {
        self.bins
    }

    pub fn columns(&self) -> &[Vec<f32>] {
        &self.columns
    }

    pub(crate) fn columns_mut(&mut self) -> &mut [Vec<f32>] {
        &mut self.columns
    }
}
