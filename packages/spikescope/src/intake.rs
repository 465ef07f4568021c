// Raw intake buffer for device bytes
//
// A bounded byte ring written by the capture thread and read by the dispatch
// worker. The writer never waits: when the ring is full the oldest unread bytes
// are overwritten. Cursors are monotonically increasing byte counters, so the
// reader can tell when the writer lapped it while it was copying.
//
// Storage sits behind a RwLock that only `set_capacity` takes exclusively;
// `write` and `read` take it shared and therefore never contend with each other.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{fence, AtomicU64, AtomicU8, Ordering};

/// Metrics for intake monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IntakeMetrics {
    pub total_written: u64,
    pub total_read: u64,
    pub total_overwritten: u64,
    pub current_size: usize,
    pub capacity: usize,
}

struct ByteRing {
    data: Box<[AtomicU8]>,
    // Bytes the writer has started storing. Bumped before the slot stores.
    claimed: AtomicU64,
    // Bytes the writer has finished storing.
    committed: AtomicU64,
    // Reader cursor.
    read: AtomicU64,
}

impl ByteRing {
    fn new(capacity: usize) -> Self {
        Self {
            data: (0..capacity).map(|_| AtomicU8::new(0)).collect(),
            claimed: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            read: AtomicU64::new(0),
        }
    }

    fn capacity(&self) -> u64 {
        self.data.len() as u64
    }

    fn slot(&self, pos: u64) -> &AtomicU8 {
        &self.data[(pos % self.capacity()) as usize]
    }

    /// Oldest retrievable position given the writer cursor.
    fn oldest(&self, committed: u64) -> u64 {
        let read = self.read.load(Ordering::Acquire);
        read.max(committed.saturating_sub(self.capacity()))
    }
}

/// Single-producer/single-consumer byte ring that overwrites oldest data
pub struct RawIntakeBuffer {
    ring: RwLock<ByteRing>,
    total_written: AtomicU64,
    total_read: AtomicU64,
    total_overwritten: AtomicU64,
}

impl RawIntakeBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RwLock::new(ByteRing::new(capacity.max(1))),
            total_written: AtomicU64::new(0),
            total_read: AtomicU64::new(0),
            total_overwritten: AtomicU64::new(0),
        }
    }

    /// Copy `bytes` into the ring, overwriting the oldest unread bytes when full.
    ///
    /// Must only be called from the single capture thread.
    pub fn write(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let ring = self.ring.read();
        let cap = ring.capacity();
        let start = ring.committed.load(Ordering::Relaxed);
        let end = start + bytes.len() as u64;

        let unread = start - ring.oldest(start);
        let overflow = (unread + bytes.len() as u64).saturating_sub(cap);
        if overflow > 0 {
            self.total_overwritten.fetch_add(overflow, Ordering::Relaxed);
        }

        // Only the last `cap` bytes of an oversized write can survive.
        let skip = (bytes.len() as u64).saturating_sub(cap);
        ring.claimed.store(end, Ordering::Relaxed);
        fence(Ordering::Release);
        for (i, &b) in bytes.iter().enumerate().skip(skip as usize) {
            ring.slot(start + i as u64).store(b, Ordering::Relaxed);
        }
        ring.committed.store(end, Ordering::Release);

        self.total_written
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
    }

    /// Number of unread bytes currently retrievable (0 if none).
    pub fn peek_size(&self) -> usize {
        let ring = self.ring.read();
        let committed = ring.committed.load(Ordering::Acquire);
        (committed - ring.oldest(committed)) as usize
    }

    /// Copy up to `len` unread bytes into `dst`, returning the number copied.
    ///
    /// With `advance` the bytes are consumed; without it this is a peek and a
    /// later read returns the same bytes (unless overwritten meanwhile).
    /// Must only be called from the single reader thread.
    pub fn read(&self, dst: &mut [u8], len: usize, advance: bool) -> usize {
        let ring = self.ring.read();
        let committed = ring.committed.load(Ordering::Acquire);
        let mut from = ring.oldest(committed);
        let mut n = ((committed - from) as usize).min(len).min(dst.len());

        for (i, out) in dst[..n].iter_mut().enumerate() {
            *out = ring.slot(from + i as u64).load(Ordering::Relaxed);
        }

        // Anything the writer claimed past `from + cap` may have been torn
        // while we copied it: discard that prefix.
        fence(Ordering::Acquire);
        let claimed = ring.claimed.load(Ordering::Relaxed);
        let torn = (claimed.saturating_sub(ring.capacity()).saturating_sub(from) as usize).min(n);
        if torn > 0 {
            dst.copy_within(torn..n, 0);
            n -= torn;
            from += torn as u64;
        }

        if advance {
            ring.read.store(from + n as u64, Ordering::Release);
            self.total_read.fetch_add(n as u64, Ordering::Relaxed);
        }
        n
    }

    pub fn capacity(&self) -> usize {
        self.ring.read().data.len()
    }

    /// Reallocate the ring, discarding current contents.
    pub fn set_capacity(&self, capacity: usize) {
        let mut ring = self.ring.write();
        if ring.data.len() == capacity.max(1) {
            let committed = ring.committed.load(Ordering::Relaxed);
            ring.read.store(committed, Ordering::Relaxed);
            return;
        }
        log::debug!("Raw intake capacity {} -> {} bytes", ring.data.len(), capacity);
        *ring = ByteRing::new(capacity.max(1));
    }

    pub fn get_metrics(&self) -> IntakeMetrics {
        IntakeMetrics {
            total_written: self.total_written.load(Ordering::Relaxed),
            total_read: self.total_read.load(Ordering::Relaxed),
            total_overwritten: self.total_overwritten.load(Ordering::Relaxed),
            current_size: self.peek_size(),
            capacity: self.capacity(),
        }
    }
}
