// Stream controller - owns the capture session lifecycle
//
// The controller manages:
// - Source lifecycle (open, capture, close) on a dedicated capture thread
// - The dispatch worker that decodes intake bytes into the signal buffer
// - Pause/resume without tearing down either thread
// - Shutdown order: stop the producer, drain, then stop the consumer
// - State tracking and event emission
//
// Every method takes `&self`, so a controller can be shared across threads and
// control calls may come from anywhere.

use crate::config::PipelineConfig;
use crate::decode::create_decoder;
use crate::dispatch::{
    intake_capacity_for, DispatchContext, DispatchCounters, DispatchWorker, SampleSink, SinkSlot,
};
use crate::intake::RawIntakeBuffer;
use crate::signal_buffer::SharedSignalBuffer;
use crate::source::{create_source, IntakeWriter, SampleSource, SourceMetadata};
use crate::types::{unix_now, SignalFormat, StreamError, StreamResult, StreamState, StreamStats};
use crossbeam::channel::{bounded, unbounded};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

// Intake capacity before the first format is known
const INITIAL_INTAKE_BYTES: usize = 16 * 1024;

/// Events emitted by the stream controller
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    StateChanged {
        stream_id: String,
        state: StreamState,
    },
    FormatChanged {
        stream_id: String,
        format: SignalFormat,
    },
    Error {
        stream_id: String,
        error: String,
    },
}

type EventCallback = Box<dyn Fn(StreamEvent) + Send + Sync>;

/// State and callback shared with the capture thread
struct StatusHub {
    stream_id: String,
    state: RwLock<StreamState>,
    event_callback: RwLock<Option<EventCallback>>,
}

impl StatusHub {
    fn emit_event(&self, event: StreamEvent) {
        if let Some(callback) = self.event_callback.read().as_ref() {
            callback(event);
        }
    }

    /// Record `state` and return the event announcing it
    fn store_state(&self, state: StreamState) -> StreamEvent {
        *self.state.write() = state.clone();
        StreamEvent::StateChanged {
            stream_id: self.stream_id.clone(),
            state,
        }
    }

    fn set_state(&self, state: StreamState) {
        let event = self.store_state(state);
        self.emit_event(event);
    }

    fn emit_all(&self, events: Vec<StreamEvent>) {
        for event in events {
            self.emit_event(event);
        }
    }
}

struct Session {
    stop: Arc<AtomicBool>,
    capture: JoinHandle<Box<dyn SampleSource>>,
    worker: DispatchWorker,
    format: SignalFormat,
}

struct Inner {
    source: Option<Box<dyn SampleSource>>,
    session: Option<Session>,
}

/// Main stream controller
pub struct StreamController {
    pub id: String,
    intake_seconds: f32,
    // Serializes start and stop; `inner` is only held briefly
    lifecycle: Mutex<()>,
    inner: Mutex<Inner>,
    intake: Arc<RawIntakeBuffer>,
    signal_buffer: Arc<SharedSignalBuffer>,
    sink: SinkSlot,
    counters: Arc<DispatchCounters>,
    status: Arc<StatusHub>,
}

impl StreamController {
    /// Create a controller with a new signal buffer sized from `config`
    pub fn new(config: &PipelineConfig) -> StreamResult<Self> {
        config.validate()?;
        let source = create_source(&config.source)?;
        let signal_buffer = Arc::new(SharedSignalBuffer::from_config(config));
        Ok(Self::with_source(
            source,
            signal_buffer,
            config.intake_buffered_seconds,
        ))
    }

    /// Create a controller around an existing source and signal buffer
    pub fn with_source(
        source: Box<dyn SampleSource>,
        signal_buffer: Arc<SharedSignalBuffer>,
        intake_seconds: f32,
    ) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let sink: Arc<dyn SampleSink> = signal_buffer.clone();
        Self {
            id: id.clone(),
            intake_seconds,
            lifecycle: Mutex::new(()),
            inner: Mutex::new(Inner {
                source: Some(source),
                session: None,
            }),
            intake: Arc::new(RawIntakeBuffer::new(INITIAL_INTAKE_BYTES)),
            signal_buffer,
            sink: Arc::new(RwLock::new(Some(sink))),
            counters: Arc::new(DispatchCounters::default()),
            status: Arc::new(StatusHub {
                stream_id: id,
                state: RwLock::new(StreamState::Idle),
                event_callback: RwLock::new(None),
            }),
        }
    }

    /// Set event callback function. Control calls are allowed from the callback,
    /// except `stop` from a capture failure event, which runs on the capture thread.
    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: Fn(StreamEvent) + Send + Sync + 'static,
    {
        *self.status.event_callback.write() = Some(Box::new(callback));
    }

    /// Replace the batch listener. With `None` batches are decoded and discarded.
    pub fn set_sink(&self, sink: Option<Arc<dyn SampleSink>>) {
        *self.sink.write() = sink;
    }

    pub fn signal_buffer(&self) -> Arc<SharedSignalBuffer> {
        self.signal_buffer.clone()
    }

    /// Start capturing. Does nothing if already running.
    pub fn start(&self) -> StreamResult<()> {
        let mut events = Vec::new();
        let result = {
            let _lifecycle = self.lifecycle.lock();
            self.start_session(&mut events)
        };
        // Callbacks run with no controller lock held.
        self.status.emit_all(events);
        result
    }

    fn start_session(&self, events: &mut Vec<StreamEvent>) -> StreamResult<()> {
        let mut source = {
            let mut inner = self.inner.lock();
            if inner.session.is_some() {
                log::debug!("Stream {} already running", self.id);
                return Ok(());
            }
            inner.source.take().ok_or_else(|| {
                StreamError::HardwareUnavailable(
                    "source was lost by a previous session".to_string(),
                )
            })?
        };

        log::info!("Starting stream controller: {}", self.id);
        let encoding = source.encoding();
        let stop = Arc::new(AtomicBool::new(false));
        let (wake_tx, wake_rx) = bounded(1);
        let (format_tx, format_rx) = unbounded();
        let (open_tx, open_rx) = bounded::<StreamResult<SignalFormat>>(1);
        let (go_tx, go_rx) = bounded::<bool>(1);
        let writer = IntakeWriter::new(self.intake.clone(), wake_tx.clone(), format_tx, stop.clone());
        let status = self.status.clone();

        let capture = std::thread::Builder::new()
            .name("spikescope-capture".to_string())
            .spawn(move || {
                let opened = source.open();
                let opened_ok = opened.is_ok();
                if open_tx.send(opened).is_err() || !opened_ok {
                    source.close();
                    return source;
                }
                if !go_rx.recv().unwrap_or(false) {
                    source.close();
                    return source;
                }

                let result = source.capture(&writer);
                source.close();
                match result {
                    Ok(()) => log::info!("Capture finished"),
                    Err(e) => {
                        log::error!("Capture failed, stopping session: {}", e);
                        status.set_state(StreamState::Error {
                            message: e.to_string(),
                        });
                        status.emit_event(StreamEvent::Error {
                            stream_id: status.stream_id.clone(),
                            error: e.to_string(),
                        });
                    }
                }
                source
            })
            .map_err(StreamError::Io)?;

        let format = match open_rx.recv() {
            Ok(Ok(format)) => format,
            Ok(Err(e)) => {
                let error = match e {
                    StreamError::HardwareUnavailable(message) => message,
                    other => other.to_string(),
                };
                log::error!("Failed to start capture: {}", error);
                self.restore_source(capture);
                events.push(self.status.store_state(StreamState::Error {
                    message: error.clone(),
                }));
                return Err(StreamError::HardwareUnavailable(error));
            }
            Err(_) => {
                self.restore_source(capture);
                return Err(StreamError::HardwareUnavailable(
                    "capture thread exited during open".to_string(),
                ));
            }
        };

        let decoder = create_decoder(encoding, format);
        self.intake.set_capacity(intake_capacity_for(
            decoder.bytes_per_frame(),
            format,
            self.intake_seconds,
        ));
        let sink = self.sink.read().clone();
        if let Some(sink) = sink {
            sink.on_format_change(format);
        }
        events.push(StreamEvent::FormatChanged {
            stream_id: self.id.clone(),
            format,
        });

        let worker = match DispatchWorker::spawn(DispatchContext {
            intake: self.intake.clone(),
            decoder,
            sink: self.sink.clone(),
            counters: self.counters.clone(),
            wake_tx,
            wake_rx,
            format_rx,
            format,
            intake_seconds: self.intake_seconds,
        }) {
            Ok(worker) => worker,
            Err(e) => {
                let _ = go_tx.send(false);
                self.restore_source(capture);
                return Err(e);
            }
        };

        // Running must be recorded before capture can fail and report Error.
        events.push(self.status.store_state(StreamState::Running {
            started_at: unix_now(),
        }));
        self.inner.lock().session = Some(Session {
            stop,
            capture,
            worker,
            format,
        });
        if go_tx.send(true).is_err() {
            log::warn!("Capture thread exited before start");
        }

        log::info!(
            "Stream {} started: {} channels @ {} Hz ({:?})",
            self.id,
            format.channel_count,
            format.sample_rate,
            encoding
        );
        Ok(())
    }

    /// Join the capture thread and keep its source for the next session.
    fn restore_source(&self, capture: JoinHandle<Box<dyn SampleSource>>) {
        let source = match capture.join() {
            Ok(source) => Some(source),
            Err(_) => {
                log::error!("Capture thread panicked");
                None
            }
        };
        self.inner.lock().source = source;
    }

    /// Suspend delivery of decoded data. Capture keeps filling the intake buffer.
    pub fn pause(&self) -> StreamResult<()> {
        let event = {
            let inner = self.inner.lock();
            let session = inner.session.as_ref().ok_or(StreamError::NotStarted)?;
            session.worker.pause();
            self.status.store_state(StreamState::Paused {
                paused_at: unix_now(),
            })
        };
        self.status.emit_event(event);
        log::info!("Stream {} paused", self.id);
        Ok(())
    }

    /// Resume delivery after `pause`
    pub fn resume(&self) -> StreamResult<()> {
        let event = {
            let inner = self.inner.lock();
            let session = inner.session.as_ref().ok_or(StreamError::NotStarted)?;
            session.worker.resume();
            self.status.store_state(StreamState::Running {
                started_at: unix_now(),
            })
        };
        self.status.emit_event(event);
        log::info!("Stream {} resumed", self.id);
        Ok(())
    }

    /// Stop capture, decode what is buffered, then stop dispatch. Safe to call when idle.
    pub fn stop(&self) -> StreamResult<()> {
        let lifecycle = self.lifecycle.lock();
        let Some(mut session) = self.inner.lock().session.take() else {
            return Ok(());
        };

        log::info!("Stopping stream controller: {}", self.id);
        session.stop.store(true, Ordering::Release);
        self.restore_source(session.capture);
        session.worker.drain_and_stop();

        let failed = matches!(*self.status.state.read(), StreamState::Error { .. });
        let event = (!failed).then(|| self.status.store_state(StreamState::Stopped));
        drop(lifecycle);

        if let Some(event) = event {
            self.status.emit_event(event);
        }
        log::info!("Stream controller stopped");
        Ok(())
    }

    /// Get current stream state
    pub fn get_state(&self) -> StreamState {
        self.status.state.read().clone()
    }

    /// Check if a capture session is active (running or paused)
    pub fn is_running(&self) -> bool {
        self.inner.lock().session.is_some()
    }

    /// Format of the active session
    pub fn format(&self) -> Option<SignalFormat> {
        self.inner.lock().session.as_ref().map(|s| s.format)
    }

    pub fn source_metadata(&self) -> Option<SourceMetadata> {
        self.inner.lock().source.as_ref().map(|s| s.metadata())
    }

    /// Get current statistics
    pub fn get_stats(&self) -> StreamStats {
        let metrics = self.intake.get_metrics();
        self.counters.snapshot(metrics.total_overwritten)
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("Failed to stop stream {} on drop: {}", self.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Encoding, SourceConfig};
    use crate::source::{SourceKind, SyntheticSource};
    use std::time::Duration;

    fn synthetic_config() -> PipelineConfig {
        PipelineConfig {
            sample_rate: 2_000,
            source: SourceConfig::Synthetic {
                sample_rate: 2_000,
                channel_count: 1,
                frequency_hz: 50.0,
                amplitude: 1_000,
                event_interval_ms: None,
                chunk_ms: 5,
            },
            ..Default::default()
        }
    }

    struct FailingSource {
        fail_open: bool,
    }

    impl SampleSource for FailingSource {
        fn kind(&self) -> SourceKind {
            SourceKind::Device
        }

        fn encoding(&self) -> Encoding {
            Encoding::Pcm16
        }

        fn open(&mut self) -> StreamResult<SignalFormat> {
            if self.fail_open {
                Err(StreamError::HardwareUnavailable("device busy".to_string()))
            } else {
                Ok(SignalFormat::new(1_000, 1))
            }
        }

        fn capture(&mut self, writer: &IntakeWriter) -> StreamResult<()> {
            writer.write_to_buffer(&[1, 0, 2, 0]);
            Err(StreamError::Serial("cable pulled".to_string()))
        }

        fn close(&mut self) {}

        fn metadata(&self) -> SourceMetadata {
            SourceMetadata {
                kind: SourceKind::Device,
                encoding: Encoding::Pcm16,
                format: None,
                properties: Default::default(),
            }
        }
    }

    fn controller_with(source: FailingSource) -> StreamController {
        let buffer = Arc::new(SharedSignalBuffer::new(SignalFormat::new(1_000, 1), 100));
        StreamController::with_source(Box::new(source), buffer, 1.0)
    }

    #[test]
    fn test_stop_without_start_is_safe() {
        let controller = StreamController::new(&synthetic_config()).unwrap();
        assert_eq!(controller.get_state(), StreamState::Idle);
        controller.stop().unwrap();
        assert!(matches!(controller.pause(), Err(StreamError::NotStarted)));
    }

    #[test]
    fn test_start_is_idempotent_and_stop_drains() {
        let controller = StreamController::new(&synthetic_config()).unwrap();
        controller.start().unwrap();
        controller.start().unwrap();
        assert!(controller.is_running());
        assert!(matches!(controller.get_state(), StreamState::Running { .. }));

        std::thread::sleep(Duration::from_millis(50));
        controller.stop().unwrap();
        assert!(!controller.is_running());
        assert_eq!(controller.get_state(), StreamState::Stopped);

        let stats = controller.get_stats();
        assert!(stats.samples_decoded > 0);
        assert_eq!(
            controller.signal_buffer().last_sample_index(),
            stats.samples_decoded
        );
    }

    #[test]
    fn test_restart_after_stop() {
        let controller = StreamController::new(&synthetic_config()).unwrap();
        controller.start().unwrap();
        controller.stop().unwrap();
        controller.start().unwrap();
        assert!(controller.is_running());
        controller.stop().unwrap();
    }

    #[test]
    fn test_open_failure_is_hardware_unavailable() {
        let controller = controller_with(FailingSource { fail_open: true });
        let result = controller.start();
        assert!(matches!(result, Err(StreamError::HardwareUnavailable(_))));
        assert!(!controller.is_running());
        // Source is kept so a later start can retry.
        assert!(controller.source_metadata().is_some());
    }

    #[test]
    fn test_capture_failure_sets_error_state() {
        let controller = controller_with(FailingSource { fail_open: false });
        let errors = Arc::new(Mutex::new(Vec::new()));
        let seen = errors.clone();
        controller.set_event_callback(move |event| {
            if let StreamEvent::Error { error, .. } = event {
                seen.lock().push(error);
            }
        });

        controller.start().unwrap();
        for _ in 0..200 {
            if matches!(controller.get_state(), StreamState::Error { .. }) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(controller.get_state(), StreamState::Error { .. }));
        assert_eq!(errors.lock().len(), 1);

        controller.stop().unwrap();
        // Bytes written before the failure were still decoded.
        assert_eq!(controller.signal_buffer().last_sample_index(), 2);
    }

    #[test]
    fn test_event_callback_may_call_controller() {
        let controller = Arc::new(StreamController::new(&synthetic_config()).unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let weak = Arc::downgrade(&controller);
        let record = seen.clone();
        controller.set_event_callback(move |event| {
            let Some(controller) = weak.upgrade() else {
                return;
            };
            if let StreamEvent::StateChanged { state, .. } = event {
                record.lock()
                    .push((state, controller.is_running(), controller.format().is_some()));
            }
        });

        controller.start().unwrap();
        controller.pause().unwrap();
        controller.resume().unwrap();
        controller.stop().unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 4);
        assert!(matches!(seen[0], (StreamState::Running { .. }, true, true)));
        assert!(matches!(seen[1], (StreamState::Paused { .. }, true, true)));
        assert!(matches!(seen[2], (StreamState::Running { .. }, true, true)));
        assert_eq!(seen[3], (StreamState::Stopped, false, false));
    }

    #[test]
    fn test_capture_failure_callback_may_query_controller() {
        let controller = Arc::new(controller_with(FailingSource { fail_open: false }));
        let running = Arc::new(Mutex::new(Vec::new()));
        let weak = Arc::downgrade(&controller);
        let seen = running.clone();
        controller.set_event_callback(move |event| {
            if let (StreamEvent::Error { .. }, Some(controller)) = (event, weak.upgrade()) {
                seen.lock().push(controller.is_running());
            }
        });

        controller.start().unwrap();
        for _ in 0..200 {
            if !running.lock().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        controller.stop().unwrap();
        assert_eq!(running.lock().len(), 1);
    }

    #[test]
    fn test_synthetic_source_via_with_source() {
        let source = SyntheticSource::new(SignalFormat::new(1_000, 2), 5.0, 500, None, 5);
        let buffer = Arc::new(SharedSignalBuffer::new(SignalFormat::new(1_000, 1), 500));
        let controller = StreamController::with_source(Box::new(source), buffer.clone(), 1.0);
        controller.start().unwrap();
        // Buffer adopted the source's channel layout.
        assert_eq!(buffer.channel_count(), 2);
        assert_eq!(controller.format(), Some(SignalFormat::new(1_000, 2)));
        controller.stop().unwrap();
    }
}
