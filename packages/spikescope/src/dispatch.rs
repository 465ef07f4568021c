// Decode/dispatch worker
//
// A dedicated thread that drains the raw intake buffer, decodes the bytes and
// hands every batch to the registered sink. Decoding continues when no sink is
// registered so the decoder never falls behind the byte stream.
//
// Gate flags are plain atomics checked once per loop iteration:
// - paused: stop reading the intake (bytes stay buffered)
// - draining: leave the loop once the intake is empty
// - working: leave the loop immediately

use crate::decode::{Decoder, SamplesWithEvents};
use crate::intake::RawIntakeBuffer;
use crate::types::{SignalFormat, StreamError, StreamResult, StreamStats};
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const IDLE_WAIT: Duration = Duration::from_millis(10);

/// Receives decoded batches from the dispatch worker
pub trait SampleSink: Send + Sync {
    fn on_samples(&self, batch: &SamplesWithEvents);

    /// The device switched sample rate or channel count. Batches delivered
    /// after this call use the new layout.
    fn on_format_change(&self, _format: SignalFormat) {}
}

/// Optional, replaceable sink shared between the controller and the worker
pub type SinkSlot = Arc<RwLock<Option<Arc<dyn SampleSink>>>>;

/// Raw intake capacity holding `seconds` of device bytes
pub fn intake_capacity_for(bytes_per_frame: usize, format: SignalFormat, seconds: f32) -> usize {
    bytes_per_frame * format.samples_for(seconds)
}

/// Counters shared by the capture and dispatch threads
#[derive(Debug, Default)]
pub struct DispatchCounters {
    pub bytes_received: AtomicU64,
    pub batches_decoded: AtomicU64,
    pub batches_dropped: AtomicU64,
    pub samples_decoded: AtomicU64,
    pub events_decoded: AtomicU64,
    pub format_changes: AtomicU64,
}

impl DispatchCounters {
    pub fn snapshot(&self, bytes_overwritten: u64) -> StreamStats {
        StreamStats {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_overwritten,
            batches_decoded: self.batches_decoded.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            samples_decoded: self.samples_decoded.load(Ordering::Relaxed),
            events_decoded: self.events_decoded.load(Ordering::Relaxed),
            format_changes: self.format_changes.load(Ordering::Relaxed),
        }
    }
}

/// Everything the worker thread owns or shares
pub struct DispatchContext {
    pub intake: Arc<RawIntakeBuffer>,
    pub decoder: Box<dyn Decoder>,
    pub sink: SinkSlot,
    pub counters: Arc<DispatchCounters>,
    /// Wakes the worker when the capture thread wrote bytes
    pub wake_tx: Sender<()>,
    pub wake_rx: Receiver<()>,
    /// Format changes reported out of band by the capture thread
    pub format_rx: Receiver<SignalFormat>,
    pub format: SignalFormat,
    pub intake_seconds: f32,
}

struct DispatchLoop {
    ctx: DispatchContext,
    working: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    draining: Arc<AtomicBool>,
    scratch: Vec<u8>,
    batch: SamplesWithEvents,
}

impl DispatchLoop {
    fn run(mut self) {
        log::debug!("Dispatch worker started");
        while self.working.load(Ordering::Acquire) {
            while let Ok(format) = self.ctx.format_rx.try_recv() {
                self.apply_format(format, true);
            }

            let draining = self.draining.load(Ordering::Acquire);
            if self.paused.load(Ordering::Acquire) {
                if draining {
                    break;
                }
                self.wait();
                continue;
            }

            let available = self.ctx.intake.peek_size();
            if available == 0 {
                if draining {
                    break;
                }
                self.wait();
                continue;
            }

            self.scratch.resize(available, 0);
            let read = self.ctx.intake.read(&mut self.scratch, available, true);
            self.ctx
                .counters
                .bytes_received
                .fetch_add(read as u64, Ordering::Relaxed);
            let bytes = std::mem::take(&mut self.scratch);
            self.decode_and_deliver(&bytes[..read]);
            self.scratch = bytes;
        }
        log::debug!("Dispatch worker exited");
    }

    fn wait(&self) {
        match self.ctx.wake_rx.recv_timeout(IDLE_WAIT) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => std::thread::sleep(IDLE_WAIT),
        }
    }

    fn decode_and_deliver(&mut self, bytes: &[u8]) {
        let mut input = bytes;
        loop {
            if let Err(e) = self.ctx.decoder.decode(input, &mut self.batch) {
                log::warn!("Dropping batch: {}", e);
                self.ctx
                    .counters
                    .batches_dropped
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
            let change = self.batch.format_change.take();

            if !self.batch.is_empty() {
                let counters = &self.ctx.counters;
                counters.batches_decoded.fetch_add(1, Ordering::Relaxed);
                counters
                    .samples_decoded
                    .fetch_add(self.batch.sample_count() as u64, Ordering::Relaxed);
                counters
                    .events_decoded
                    .fetch_add(self.batch.events.len() as u64, Ordering::Relaxed);

                let sink = self.ctx.sink.read().clone();
                if let Some(sink) = sink {
                    sink.on_samples(&self.batch);
                }
            }

            match change {
                Some(format) => {
                    // Decoder already switched layout; decode what it carried.
                    self.apply_format(format, false);
                    input = &[];
                }
                None => return,
            }
        }
    }

    fn apply_format(&mut self, format: SignalFormat, reset_decoder: bool) {
        if reset_decoder {
            if format == self.ctx.format {
                return;
            }
            self.ctx.decoder.set_format(format);
        }
        log::info!(
            "Signal format changed: {} channels @ {} Hz",
            format.channel_count,
            format.sample_rate
        );
        self.ctx.format = format;
        self.ctx
            .counters
            .format_changes
            .fetch_add(1, Ordering::Relaxed);
        self.ctx.intake.set_capacity(intake_capacity_for(
            self.ctx.decoder.bytes_per_frame(),
            format,
            self.ctx.intake_seconds,
        ));

        let sink = self.ctx.sink.read().clone();
        if let Some(sink) = sink {
            sink.on_format_change(format);
        }
    }
}

/// Handle to the running dispatch thread
pub struct DispatchWorker {
    working: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    draining: Arc<AtomicBool>,
    wake_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl DispatchWorker {
    pub fn spawn(ctx: DispatchContext) -> StreamResult<Self> {
        let working = Arc::new(AtomicBool::new(true));
        let paused = Arc::new(AtomicBool::new(false));
        let draining = Arc::new(AtomicBool::new(false));
        let wake_tx = ctx.wake_tx.clone();
        let channel_count = ctx.format.channel_count;

        let worker = DispatchLoop {
            ctx,
            working: working.clone(),
            paused: paused.clone(),
            draining: draining.clone(),
            scratch: Vec::new(),
            batch: SamplesWithEvents::new(channel_count),
        };
        let thread = std::thread::Builder::new()
            .name("spikescope-dispatch".to_string())
            .spawn(move || worker.run())
            .map_err(StreamError::Io)?;

        Ok(Self {
            working,
            paused,
            draining,
            wake_tx,
            thread: Some(thread),
        })
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        let _ = self.wake_tx.try_send(());
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Decode whatever is still buffered, then exit. The producer must be stopped first.
    pub fn drain_and_stop(&mut self) {
        self.draining.store(true, Ordering::Release);
        let _ = self.wake_tx.try_send(());
        self.join();
    }

    /// Exit at the next loop iteration, discarding buffered bytes.
    pub fn stop(&mut self) {
        self.working.store(false, Ordering::Release);
        let _ = self.wake_tx.try_send(());
        self.join();
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Dispatch worker panicked");
            }
        }
    }
}

impl Drop for DispatchWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
