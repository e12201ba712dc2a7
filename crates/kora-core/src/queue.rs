use crate::tags::Reading;
use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Bounded hand-off between the scan thread and the sync consumer.
///
/// When full, the oldest reading is displaced; the producer never blocks.
#[derive(Debug)]
pub struct ReadingQueue {
    inner: ArrayQueue<Reading>,
    enqueued: AtomicU64,
    dropped: AtomicU64,
}

impl ReadingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: ArrayQueue::new(capacity.max(1)),
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Called by the scan thread. Returns the displaced reading, if any.
    pub fn push(&self, reading: Reading) -> Option<Reading> {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        let displaced = self.inner.force_push(reading);
        if let Some(oldest) = &displaced {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            log::warn!(
                "Reading queue full (capacity {}); dropped oldest reading {}@{} (total dropped {})",
                self.inner.capacity(),
                oldest.tag_id,
                oldest.timestamp_us,
                total
            );
        }
        displaced
    }

    /// Called by the sync consumer.
    pub fn pop(&self) -> Option<Reading> {
        self.inner.pop()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for ReadingQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
