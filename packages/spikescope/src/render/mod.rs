// Frame preparation
//
// Runs once per render tick on the render thread. Under the signal buffer lock it
// snapshots the newest window, applies auto-scale, picks raw or averaged data
// and assembles vertices and event positions. The lock is released before the
// prepared frame is handed to the `WaveformRenderer`, which owns everything
// pixel related.
//
// Lifecycle: Idle -> SurfaceReady -> (per tick) Snapshotting -> Preparing ->
// HandedOff -> SurfaceReady. Surface destruction returns to Idle.

mod prepare;
mod state;

pub use prepare::{
    add_events_to_draw_buffer, auto_scale, prepare_signal_for_drawing, AUTO_SCALE_PERCENT,
    MIN_DETECTED_PCM_VALUE,
};
pub use state::{
    default_positions, ChannelRenderState, DEFAULT_SCALE_FACTOR, MAX_SCALE_FACTOR,
    MAX_VERTICAL_HALF_SIZE, MAX_VERTICAL_SIZE, MIN_SCALE_FACTOR,
};

use crate::averaging::AveragingSettings;
use crate::config::{AveragingTriggerType, PipelineConfig};
use crate::draw_buffer::{FftDrawBuffer, MultichannelDrawBuffer};
use crate::signal_buffer::{SharedSignalBuffer, SignalPropertyListener};
use crate::types::SignalFormat;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Narrowest visible window, in seconds
pub const MIN_WINDOW_SECONDS: f32 = 0.0004;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RenderPhase {
    Idle,
    SurfaceReady,
    Snapshotting,
    Preparing,
    HandedOff,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SkipReason {
    /// No drawing surface exists
    NoSurface,
    /// Snapshot channel count disagrees with the draw buffers
    ChannelMismatch,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FrameOutcome {
    HandedOff,
    Skipped(SkipReason),
}

/// Scalar drawing parameters for one frame
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FrameParams {
    pub selected_channel: usize,
    pub surface_width: u32,
    pub surface_height: u32,
    /// Visible window width in samples
    pub window_width: f32,
    pub draw_start: usize,
    pub draw_end: usize,
    pub scale_x: f32,
    pub scale_y: f32,
    /// Window width or surface size changed since the previous frame
    pub projection_changed: bool,
    pub last_sample_index: u64,
    pub signal_averaging: bool,
}

/// Everything the renderer needs for one frame
pub struct PreparedFrame<'a> {
    pub params: FrameParams,
    /// Per-channel (x, y) vertex pairs
    pub vertices: &'a [Vec<f32>],
    /// Raw or averaged samples the vertices were built from
    pub samples: &'a MultichannelDrawBuffer,
    /// x position within the visible window -> event name
    pub events: &'a BTreeMap<usize, String>,
    pub fft: Option<&'a FftDrawBuffer>,
    pub scale_factors: &'a [f32],
    pub positions: &'a [f32],
    /// Name of the event that triggered averaging (all-events averaging only)
    pub averaging_trigger: Option<&'a str>,
}

/// External drawing collaborator
pub trait WaveformRenderer {
    fn draw(&mut self, frame: &PreparedFrame<'_>);
}

/// Edge-triggered auto-scale request, shareable with input handlers
#[derive(Debug, Clone, Default)]
pub struct AutoScaleTrigger(Arc<AtomicBool>);

impl AutoScaleTrigger {
    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Consume a pending request
    fn take(&self) -> bool {
        self.0
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Collects format changes from the signal buffer until the next tick
#[derive(Default)]
struct PendingSignalChanges {
    format: Mutex<Option<SignalFormat>>,
}

impl SignalPropertyListener for PendingSignalChanges {
    fn on_format_changed(&self, format: SignalFormat) {
        *self.format.lock() = Some(format);
    }
}

pub struct FramePreparer {
    signal_buffer: Arc<SharedSignalBuffer>,
    pending: Arc<PendingSignalChanges>,
    phase: RenderPhase,

    format: SignalFormat,
    frame_seconds: f32,
    samples: MultichannelDrawBuffer,
    averaged: MultichannelDrawBuffer,
    fft: Option<FftDrawBuffer>,
    event_indices: Vec<u64>,
    event_names: Vec<String>,
    events: BTreeMap<usize, String>,
    vertices: Vec<Vec<f32>>,

    render_state: ChannelRenderState,
    selected_channel: usize,
    averaging: AveragingSettings,
    auto_scale: AutoScaleTrigger,

    window_width: f32,
    window_dirty: bool,
    surface_width: u32,
    surface_height: u32,
    surface_dirty: bool,
    scale_x: f32,
    scale_y: f32,
}

impl FramePreparer {
    pub fn new(signal_buffer: Arc<SharedSignalBuffer>, config: &PipelineConfig) -> Self {
        let format = signal_buffer.format();
        let frame = format.samples_for(config.max_window_seconds);
        let averaging = AveragingSettings {
            enabled: config.averaging_enabled,
            trigger_type: config.averaging_trigger_type,
            threshold: config.averaging_threshold,
            window_seconds: config.averaging_window_seconds,
            selected_channel: config.selected_channel,
        };
        let averaged_len = signal_buffer.lock().averaging_window_len();

        let mut preparer = Self {
            signal_buffer,
            pending: Arc::new(PendingSignalChanges::default()),
            phase: RenderPhase::Idle,
            format,
            frame_seconds: config.max_window_seconds,
            samples: MultichannelDrawBuffer::new(format.channel_count, frame),
            averaged: MultichannelDrawBuffer::new(format.channel_count, averaged_len),
            fft: None,
            event_indices: Vec::new(),
            event_names: Vec::new(),
            events: BTreeMap::new(),
            vertices: Vec::new(),
            render_state: ChannelRenderState::new(format.channel_count),
            selected_channel: config.selected_channel.min(format.channel_count - 1),
            averaging,
            auto_scale: AutoScaleTrigger::default(),
            window_width: 0.0,
            window_dirty: true,
            surface_width: 0,
            surface_height: 0,
            surface_dirty: true,
            scale_x: 1.0,
            scale_y: 1.0,
        };
        preparer.set_window_width(format.samples_for(config.window_seconds) as f32);
        preparer.signal_buffer.configure_averaging(averaging);
        preparer
    }

    pub fn phase(&self) -> RenderPhase {
        self.phase
    }

    /// Drawing surface exists: start listening for signal changes.
    pub fn surface_created(&mut self) {
        let listener: Arc<dyn SignalPropertyListener> = self.pending.clone();
        self.signal_buffer.set_property_listener(Some(listener));
        // Catch up on anything that changed while no surface existed.
        let format = self.signal_buffer.format();
        if format != self.format {
            *self.pending.format.lock() = Some(format);
        }
        self.phase = RenderPhase::SurfaceReady;
        log::debug!("Render surface created");
    }

    pub fn surface_changed(&mut self, width: u32, height: u32) {
        self.surface_width = width;
        self.surface_height = height;
        self.surface_dirty = true;
    }

    /// Drawing surface is gone: stop listening for signal changes.
    pub fn surface_destroyed(&mut self) {
        self.signal_buffer.set_property_listener(None);
        self.phase = RenderPhase::Idle;
        log::debug!("Render surface destroyed");
    }

    /// Handle for requesting auto-scale from other threads
    pub fn auto_scale_trigger(&self) -> AutoScaleTrigger {
        self.auto_scale.clone()
    }

    /// Auto-scale the selected channel on the next frame (ignored while averaging).
    pub fn request_auto_scale(&self) {
        if self.is_auto_scale_enabled() {
            self.auto_scale.request();
        }
    }

    pub fn is_auto_scale_enabled(&self) -> bool {
        !self.averaging.enabled
    }

    pub fn set_signal_averaging(&mut self, enabled: bool) {
        self.averaging.enabled = enabled;
        self.signal_buffer.configure_averaging(self.averaging);
    }

    pub fn set_averaging_trigger_type(&mut self, trigger_type: AveragingTriggerType) {
        self.averaging.trigger_type = trigger_type;
        self.signal_buffer.configure_averaging(self.averaging);
    }

    pub fn set_averaging_threshold(&mut self, threshold: i16) {
        self.averaging.threshold = threshold;
        self.signal_buffer.configure_averaging(self.averaging);
    }

    /// Select the channel used for auto-scale, zoom and threshold triggering.
    pub fn set_selected_channel(&mut self, channel: usize) {
        if channel >= self.format.channel_count {
            return;
        }
        self.selected_channel = channel;
        self.averaging.selected_channel = channel;
        self.signal_buffer.configure_averaging(self.averaging);
    }

    pub fn selected_channel(&self) -> usize {
        self.selected_channel
    }

    fn window_bounds(&self) -> (f32, f32) {
        let min = (self.format.sample_rate as f32 * MIN_WINDOW_SECONDS).floor();
        let max = self.samples.frame_count() as f32;
        (min.min(max), max)
    }

    /// Set the visible window width in samples, clamped to the allowed range.
    pub fn set_window_width(&mut self, width: f32) {
        if width < 0.0 {
            return;
        }
        let (min, max) = self.window_bounds();
        self.window_width = width.clamp(min, max);
        self.window_dirty = true;
    }

    pub fn window_width(&self) -> f32 {
        self.window_width
    }

    /// Multiply the selected channel's scale (zoom).
    pub fn scale_by(&mut self, factor: f32) {
        self.render_state.scale_by(self.selected_channel, factor);
    }

    /// Move the selected channel by `dy` surface pixels.
    pub fn move_channel(&mut self, dy: f32) {
        if self.surface_height == 0 {
            return;
        }
        let gl_dy = dy * MAX_VERTICAL_SIZE / self.surface_height as f32;
        self.render_state.move_by(self.selected_channel, gl_dy);
    }

    pub fn render_state(&self) -> &ChannelRenderState {
        &self.render_state
    }

    /// Keep spectrum columns in each snapshot
    pub fn enable_fft(&mut self, columns: usize, bins: usize) {
        self.fft = Some(FftDrawBuffer::new(columns, bins));
    }

    fn apply_format(&mut self, format: SignalFormat) {
        log::debug!(
            "Frame preparer adopting {} channels @ {} Hz",
            format.channel_count,
            format.sample_rate
        );
        let frame = format.samples_for(self.frame_seconds);
        if !self.samples.fits(format.channel_count, frame) {
            self.samples = MultichannelDrawBuffer::new(format.channel_count, frame);
        }
        if format.channel_count != self.format.channel_count {
            self.render_state.resize(format.channel_count);
            self.selected_channel = 0;
            self.averaging.selected_channel = 0;
        }
        let rate_changed = format.sample_rate != self.format.sample_rate;
        self.format = format;
        if rate_changed {
            self.set_window_width(self.window_width);
        }
    }

    /// Prepare one frame and hand it to `renderer`.
    pub fn prepare_frame(&mut self, renderer: &mut dyn WaveformRenderer) -> FrameOutcome {
        if self.phase == RenderPhase::Idle {
            return FrameOutcome::Skipped(SkipReason::NoSurface);
        }
        let pending = self.pending.format.lock().take();
        if let Some(format) = pending {
            self.apply_format(format);
            self.signal_buffer.configure_averaging(self.averaging);
        }

        let buffer = self.signal_buffer.clone();
        let rings = buffer.lock();

        self.phase = RenderPhase::Snapshotting;
        if rings.channel_count() != self.samples.channel_count() {
            log::debug!(
                "Skipping frame: buffer has {} channels, draw buffer {}",
                rings.channel_count(),
                self.samples.channel_count()
            );
            self.phase = RenderPhase::SurfaceReady;
            return FrameOutcome::Skipped(SkipReason::ChannelMismatch);
        }
        let averaging = self.averaging.enabled;
        if averaging && !self.averaged.fits(rings.channel_count(), rings.averaging_window_len()) {
            self.averaged =
                MultichannelDrawBuffer::new(rings.channel_count(), rings.averaging_window_len());
        }
        let copied = rings.snapshot_into(
            &mut self.samples,
            averaging.then_some(&mut self.averaged),
            &mut self.event_indices,
            &mut self.event_names,
            self.fft.as_mut(),
        );
        let last_sample_index = rings.last_sample_index();

        self.phase = RenderPhase::Preparing;
        let source = if averaging { &self.averaged } else { &self.samples };
        let frame_count = source.frame_count();
        let window_width = self.window_width.min(frame_count as f32);
        let draw_end = frame_count;
        let draw_start = frame_count - window_width as usize;

        if self.auto_scale.take() && !averaging {
            let selected = &source.channel(self.selected_channel)[draw_start..draw_end];
            if let Some(scale) = auto_scale(selected) {
                self.render_state
                    .set_scale_factor(self.selected_channel, scale);
                log::debug!(
                    "Auto-scaled channel {} to {:.2}",
                    self.selected_channel,
                    scale
                );
            }
        }

        let max_points = self.surface_width.max(self.surface_height) as usize * 4;
        let drawn = prepare_signal_for_drawing(
            source.buffer(),
            draw_start,
            draw_end,
            max_points,
            &mut self.vertices,
        );
        if averaging {
            self.events.clear();
        } else {
            add_events_to_draw_buffer(
                &self.event_indices,
                &self.event_names,
                copied,
                last_sample_index,
                frame_count,
                draw_start,
                draw_end,
                &mut self.events,
            );
        }
        drop(rings);

        let projection_changed = self.surface_dirty || self.window_dirty;
        if projection_changed {
            self.scale_x = if drawn > 0 {
                window_width / drawn as f32
            } else {
                1.0
            };
        }
        if self.surface_dirty {
            self.scale_y = if self.surface_height > 0 {
                MAX_VERTICAL_SIZE / self.surface_height as f32
            } else {
                1.0
            };
        }
        self.surface_dirty = false;
        self.window_dirty = false;

        self.phase = RenderPhase::HandedOff;
        let averaging_trigger = (averaging
            && self.averaging.trigger_type == AveragingTriggerType::AllEvents
            && copied > 0)
            .then(|| self.event_names[copied - 1].as_str());
        let frame = PreparedFrame {
            params: FrameParams {
                selected_channel: self.selected_channel,
                surface_width: self.surface_width,
                surface_height: self.surface_height,
                window_width,
                draw_start,
                draw_end,
                scale_x: self.scale_x,
                scale_y: self.scale_y,
                projection_changed,
                last_sample_index,
                signal_averaging: averaging,
            },
            vertices: &self.vertices,
            samples: if averaging { &self.averaged } else { &self.samples },
            events: &self.events,
            fft: self.fft.as_ref(),
            scale_factors: self.render_state.scale_factors(),
            positions: self.render_state.positions(),
            averaging_trigger,
        };
        renderer.draw(&frame);

        self.phase = RenderPhase::SurfaceReady;
        FrameOutcome::HandedOff
    }
}

impl Drop for FramePreparer {
    fn drop(&mut self) {
        if self.phase != RenderPhase::Idle {
            self.surface_destroyed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::SamplesWithEvents;

    #[derive(Default)]
    struct RecordingRenderer {
        frames: Vec<(FrameParams, Vec<Vec<f32>>, BTreeMap<usize, String>, Vec<f32>)>,
        triggers: Vec<Option<String>>,
    }

    impl WaveformRenderer for RecordingRenderer {
        fn draw(&mut self, frame: &PreparedFrame<'_>) {
            self.frames.push((
                frame.params,
                frame.vertices.to_vec(),
                frame.events.clone(),
                frame.scale_factors.to_vec(),
            ));
            self.triggers.push(frame.averaging_trigger.map(str::to_string));
        }
    }

    fn config(rate: u32, channels: usize) -> PipelineConfig {
        PipelineConfig {
            sample_rate: rate,
            channel_count: channels,
            window_seconds: 1.0,
            max_window_seconds: 2.0,
            ..Default::default()
        }
    }

    fn setup(rate: u32, channels: usize) -> (Arc<SharedSignalBuffer>, FramePreparer) {
        let config = config(rate, channels);
        let buffer = Arc::new(SharedSignalBuffer::from_config(&config));
        let mut preparer = FramePreparer::new(buffer.clone(), &config);
        preparer.surface_created();
        preparer.surface_changed(100, 50);
        (buffer, preparer)
    }

    fn push(buffer: &SharedSignalBuffer, channels: Vec<Vec<i16>>, events: Vec<(usize, &str)>) {
        buffer.add_to_buffer(&SamplesWithEvents {
            samples: channels,
            events: events.into_iter().map(|(o, n)| (o, n.to_string())).collect(),
            ..Default::default()
        });
    }

    #[test]
    fn test_no_surface_skips() {
        let config = config(100, 1);
        let buffer = Arc::new(SharedSignalBuffer::from_config(&config));
        let mut preparer = FramePreparer::new(buffer, &config);
        let mut renderer = RecordingRenderer::default();
        assert_eq!(
            preparer.prepare_frame(&mut renderer),
            FrameOutcome::Skipped(SkipReason::NoSurface)
        );
        assert!(renderer.frames.is_empty());
    }

    #[test]
    fn test_frame_window_and_events() {
        let (buffer, mut preparer) = setup(100, 1);
        assert_eq!(preparer.window_width(), 100.0);
        let samples: Vec<i16> = (0..300).map(|i| i as i16).collect();
        push(&buffer, vec![samples], vec![(50, "early"), (250, "late")]);

        let mut renderer = RecordingRenderer::default();
        assert_eq!(preparer.prepare_frame(&mut renderer), FrameOutcome::HandedOff);
        assert_eq!(preparer.phase(), RenderPhase::SurfaceReady);

        let (params, vertices, events, _) = &renderer.frames[0];
        // frame holds the newest 200 samples (100..299), window is the newest 100
        assert_eq!((params.draw_start, params.draw_end), (100, 200));
        assert_eq!(params.last_sample_index, 300);
        assert!(params.projection_changed);
        assert_eq!(params.scale_x, 1.0);
        assert_eq!(params.scale_y, MAX_VERTICAL_SIZE / 50.0);
        assert_eq!(&vertices[0][..2], &[0.0, 200.0]);
        let expected: BTreeMap<usize, String> = [(50, "late".to_string())].into_iter().collect();
        assert_eq!(*events, expected);

        preparer.prepare_frame(&mut renderer);
        assert!(!renderer.frames[1].0.projection_changed);
    }

    #[test]
    fn test_auto_scale_edge_triggered() {
        let (buffer, mut preparer) = setup(100, 1);
        let mut samples = vec![0i16; 100];
        samples[10] = 100;
        samples[20] = -40;
        push(&buffer, vec![samples], vec![]);

        let trigger = preparer.auto_scale_trigger();
        trigger.request();
        trigger.request();
        let mut renderer = RecordingRenderer::default();
        preparer.prepare_frame(&mut renderer);
        let scaled = preparer.render_state().scale_factor(0).unwrap();
        assert!((scaled - 5_242.72).abs() < 0.01);

        // Manual zoom afterwards is not undone by a stale request.
        preparer.scale_by(0.5);
        let zoomed = preparer.render_state().scale_factor(0).unwrap();
        preparer.prepare_frame(&mut renderer);
        assert_eq!(preparer.render_state().scale_factor(0), Some(zoomed));
    }

    #[test]
    fn test_auto_scale_disabled_while_averaging() {
        let (_buffer, mut preparer) = setup(100, 1);
        preparer.set_signal_averaging(true);
        assert!(!preparer.is_auto_scale_enabled());
        preparer.request_auto_scale();
        assert!(!preparer.auto_scale.take());
    }

    #[test]
    fn test_channel_mismatch_skips_until_notified() {
        let (buffer, mut preparer) = setup(100, 2);
        preparer.surface_destroyed();
        // Reconfigure without the preparer listening.
        buffer.reconfigure(SignalFormat::new(100, 4));
        preparer.phase = RenderPhase::SurfaceReady;

        let mut renderer = RecordingRenderer::default();
        assert_eq!(
            preparer.prepare_frame(&mut renderer),
            FrameOutcome::Skipped(SkipReason::ChannelMismatch)
        );

        preparer.surface_created();
        assert_eq!(preparer.prepare_frame(&mut renderer), FrameOutcome::HandedOff);
        assert_eq!(preparer.render_state().channel_count(), 4);
    }

    #[test]
    fn test_reconfigure_preserves_channel_zero_scale() {
        let (buffer, mut preparer) = setup(100, 2);
        preparer.scale_by(2.0);
        let scale = preparer.render_state().scale_factor(0).unwrap();
        let position = preparer.render_state().position(0).unwrap();

        buffer.reconfigure(SignalFormat::new(100, 4));
        let mut renderer = RecordingRenderer::default();
        assert_eq!(preparer.prepare_frame(&mut renderer), FrameOutcome::HandedOff);

        let state = preparer.render_state();
        assert_eq!(state.scale_factor(0), Some(scale));
        assert_eq!(state.position(0), Some(position));
        let defaults = default_positions(4);
        assert_eq!(state.position(2), Some(defaults[2]));
        assert_eq!(state.position(3), Some(defaults[3]));
    }

    #[test]
    fn test_window_width_clamped() {
        let (_buffer, mut preparer) = setup(10_000, 1);
        preparer.set_window_width(1.0);
        assert_eq!(preparer.window_width(), 4.0);
        preparer.set_window_width(1e9);
        assert_eq!(preparer.window_width(), 20_000.0);
    }

    #[test]
    fn test_averaging_trigger_marker() {
        let (buffer, mut preparer) = setup(4, 1);
        preparer.set_signal_averaging(true);
        preparer.set_averaging_trigger_type(AveragingTriggerType::AllEvents);
        push(&buffer, vec![vec![0, 1, 2, 3, 4, 5, 6, 7]], vec![(3, "7")]);

        let mut renderer = RecordingRenderer::default();
        preparer.prepare_frame(&mut renderer);
        assert_eq!(renderer.triggers[0].as_deref(), Some("7"));
        let (params, vertices, _, _) = &renderer.frames[0];
        assert!(params.signal_averaging);
        // averaged window of 4 samples around index 3
        assert_eq!(vertices[0], vec![0.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0]);
    }
}
