use crate::cli::RunArgs;
use crate::exit_codes;
use crate::output;
use serde::Serialize;
use spikescope::decode::bytes_per_frame;
use spikescope::render::SkipReason;
use spikescope::{
    Encoding, FrameOutcome, FramePreparer, PipelineConfig, PreparedFrame, SignalFormat,
    SourceConfig, StreamController, StreamError, StreamState, StreamStats, WaveformRenderer,
};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

// Replay pacing: one chunk per tick keeps recorded files at real-time speed
const REPLAY_TICK_MS: u64 = 10;

#[derive(Serialize, Default)]
struct FrameSummary {
    handed_off: u64,
    skipped_no_surface: u64,
    skipped_channel_mismatch: u64,
    max_points: usize,
    window_width: f32,
    distinct_events: usize,
    averaging_triggers: Vec<String>,
}

#[derive(Serialize)]
struct RunReport {
    stream_id: String,
    state: StreamState,
    format: SignalFormat,
    stats: StreamStats,
    last_sample_index: u64,
    stored_samples: usize,
    buffer_size: usize,
    frames: FrameSummary,
    scale_factors: Vec<f32>,
    positions: Vec<f32>,
}

/// Renderer stand-in that only records what it was handed
#[derive(Default)]
struct SummaryRenderer {
    summary: FrameSummary,
    events: BTreeSet<(u64, String)>,
}

impl WaveformRenderer for SummaryRenderer {
    fn draw(&mut self, frame: &PreparedFrame<'_>) {
        let params = &frame.params;
        self.summary.handed_off += 1;
        self.summary.window_width = params.window_width;
        let points = frame.vertices.first().map_or(0, |v| v.len() / 2);
        self.summary.max_points = self.summary.max_points.max(points);

        // x is relative to the window start, the window ends at the newest sample
        let window = (params.draw_end - params.draw_start) as u64;
        let window_start = params.last_sample_index.saturating_sub(window);
        for (x, name) in frame.events {
            self.events.insert((window_start + *x as u64, name.clone()));
        }
        if let Some(trigger) = frame.averaging_trigger {
            if self.summary.averaging_triggers.last().map(String::as_str) != Some(trigger) {
                self.summary.averaging_triggers.push(trigger.to_string());
            }
        }
    }
}

/// Load the configuration and apply command-line overrides.
pub(crate) fn build_config(args: &RunArgs) -> Result<PipelineConfig, String> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_path(path)
            .map_err(|e| format!("Failed to load config '{}': {}", path, e))?,
        None => PipelineConfig::default(),
    };
    if let Some(rate) = args.sample_rate {
        config.sample_rate = rate;
    }
    if let Some(channels) = args.channels {
        config.channel_count = channels;
    }
    if let Some(trigger) = args.averaging {
        config.averaging_enabled = true;
        config.averaging_trigger_type = trigger.into();
    }

    let format = config.format();
    if let Some(path) = &args.replay {
        let encoding: Encoding = args.encoding.map(Into::into).unwrap_or_default();
        let per_tick = format.samples_for(REPLAY_TICK_MS as f32 / 1000.0);
        config.source = SourceConfig::Replay {
            path: path.clone(),
            sample_rate: format.sample_rate,
            channel_count: format.channel_count,
            encoding,
            chunk_size: per_tick * bytes_per_frame(encoding, format.channel_count),
            rate_limit_ms: Some(REPLAY_TICK_MS),
            loop_playback: false,
        };
    } else if let Some(port) = &args.port {
        config.source = SourceConfig::Serial {
            port: port.clone(),
            baud_rate: args.baud,
            sample_rate: format.sample_rate,
            channel_count: format.channel_count,
            encoding: args.encoding.map(Into::into).unwrap_or(Encoding::SpikerBox),
            init_command: None,
        };
    } else if args.audio {
        config.source = SourceConfig::Audio { device: None };
    } else if let SourceConfig::Synthetic {
        sample_rate,
        channel_count,
        ..
    } = &mut config.source
    {
        if args.sample_rate.is_some() {
            *sample_rate = format.sample_rate;
        }
        if args.channels.is_some() {
            *channel_count = format.channel_count;
        }
    }

    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

pub fn execute(args: RunArgs) -> i32 {
    let config = match build_config(&args) {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return exit_codes::INPUT_ERROR;
        }
    };
    if args.fps == 0 || !(args.seconds > 0.0) {
        eprintln!("Error: --fps and --seconds must be positive");
        return exit_codes::INPUT_ERROR;
    }

    let controller = match StreamController::new(&config) {
        Ok(controller) => controller,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::INPUT_ERROR;
        }
    };
    let buffer = controller.signal_buffer();
    let mut preparer = FramePreparer::new(buffer.clone(), &config);
    preparer.surface_created();
    preparer.surface_changed(args.width, args.height);
    if args.auto_scale {
        preparer.request_auto_scale();
    }

    if let Err(e) = controller.start() {
        eprintln!("Error: {}", e);
        return match e {
            StreamError::HardwareUnavailable(_) => exit_codes::HARDWARE_UNAVAILABLE,
            _ => exit_codes::EXECUTION_ERROR,
        };
    }
    if !args.quiet {
        eprintln!("Capturing for {:.1}s at {} fps...", args.seconds, args.fps);
    }

    let mut renderer = SummaryRenderer::default();
    let tick = Duration::from_secs_f64(1.0 / args.fps as f64);
    let deadline = Instant::now() + Duration::from_secs_f64(args.seconds);
    let mut next = Instant::now();
    while Instant::now() < deadline {
        match preparer.prepare_frame(&mut renderer) {
            FrameOutcome::HandedOff => {}
            FrameOutcome::Skipped(SkipReason::NoSurface) => {
                renderer.summary.skipped_no_surface += 1
            }
            FrameOutcome::Skipped(SkipReason::ChannelMismatch) => {
                renderer.summary.skipped_channel_mismatch += 1
            }
        }
        if matches!(controller.get_state(), StreamState::Error { .. }) {
            break;
        }
        next += tick;
        if let Some(wait) = next.checked_duration_since(Instant::now()) {
            std::thread::sleep(wait);
        }
    }

    if let Err(e) = controller.stop() {
        log::warn!("Stop failed: {}", e);
    }
    // One last frame so the report reflects everything that was drained.
    preparer.prepare_frame(&mut renderer);
    preparer.surface_destroyed();

    let state = controller.get_state();
    let failed = matches!(state, StreamState::Error { .. });
    let mut frames = renderer.summary;
    frames.distinct_events = renderer.events.len();
    let report = RunReport {
        stream_id: controller.id.clone(),
        state,
        format: buffer.format(),
        stats: controller.get_stats(),
        last_sample_index: buffer.last_sample_index(),
        stored_samples: buffer.stored_samples(),
        buffer_size: buffer.buffer_size(),
        frames,
        scale_factors: preparer.render_state().scale_factors().to_vec(),
        positions: preparer.render_state().positions().to_vec(),
    };

    if !output::emit(&report, args.compact, args.output.as_deref()) {
        return exit_codes::EXECUTION_ERROR;
    }
    if !args.quiet {
        if let Some(ref path) = args.output {
            eprintln!("Report written to {}", path);
        }
    }
    if failed {
        exit_codes::EXECUTION_ERROR
    } else {
        exit_codes::SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{EncodingArg, TriggerArg};
    use spikescope::AveragingTriggerType;

    fn make_test_args() -> RunArgs {
        RunArgs {
            config: None,
            replay: None,
            port: None,
            baud: 230_400,
            audio: false,
            encoding: None,
            sample_rate: None,
            channels: None,
            averaging: None,
            seconds: 1.0,
            fps: 30,
            width: 800,
            height: 600,
            auto_scale: false,
            output: None,
            compact: false,
            quiet: true,
        }
    }

    #[test]
    fn test_defaults_use_synthetic_source() {
        let config = build_config(&make_test_args()).unwrap();
        assert!(matches!(config.source, SourceConfig::Synthetic { .. }));
        assert!(!config.averaging_enabled);
    }

    #[test]
    fn test_overrides_reach_synthetic_source() {
        let mut args = make_test_args();
        args.sample_rate = Some(2_000);
        args.channels = Some(3);
        args.averaging = Some(TriggerArg::AllEvents);
        let config = build_config(&args).unwrap();

        assert_eq!(config.format(), SignalFormat::new(2_000, 3));
        assert!(config.averaging_enabled);
        assert_eq!(config.averaging_trigger_type, AveragingTriggerType::AllEvents);
        match config.source {
            SourceConfig::Synthetic {
                sample_rate,
                channel_count,
                ..
            } => assert_eq!((sample_rate, channel_count), (2_000, 3)),
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[test]
    fn test_replay_chunk_paced_to_tick() {
        let mut args = make_test_args();
        args.replay = Some("/tmp/capture.raw".to_string());
        args.sample_rate = Some(10_000);
        args.channels = Some(2);
        args.encoding = Some(EncodingArg::SpikerBox);
        let config = build_config(&args).unwrap();

        match config.source {
            SourceConfig::Replay {
                chunk_size,
                encoding,
                rate_limit_ms,
                ..
            } => {
                // 100 frames of 4 bytes every 10 ms
                assert_eq!(chunk_size, 400);
                assert_eq!(encoding, Encoding::SpikerBox);
                assert_eq!(rate_limit_ms, Some(REPLAY_TICK_MS));
            }
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[test]
    fn test_invalid_override_rejected() {
        let mut args = make_test_args();
        args.channels = Some(0);
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn test_serial_defaults_to_spikerbox() {
        let mut args = make_test_args();
        args.port = Some("/dev/ttyUSB0".to_string());
        let config = build_config(&args).unwrap();
        assert!(matches!(
            config.source,
            SourceConfig::Serial {
                encoding: Encoding::SpikerBox,
                baud_rate: 230_400,
                ..
            }
        ));
    }
}
