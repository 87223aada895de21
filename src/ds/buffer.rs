//! Bounded event buffers between the hot paths and the maintenance pass.
//!
//! Readers and writers never touch policy state directly; they publish events
//! into one of two bounded buffers and the single-threaded drain applies them
//! under the eviction lock.
//!
//! ## Architecture
//!
//! ```text
//!   reader threads                                  maintenance (1 thread)
//!   ──────────────                                  ──────────────────────
//!   get(k) ──► ReadBuffer::offer ──►┌──────────┐
//!              (lossy: Full drops)  │  ring of │ ──► drain_with(|event| …)
//!                                   │  events  │
//!   put(k,v) ─► WriteBuffer::push ─►└──────────┘ ──► run deferred tasks
//!              (lossless: caller
//!               helps drain when full)
//! ```
//!
//! ## Key Components
//!
//! - [`ReadBuffer`]: fixed-capacity, multi-producer, lossy. A dropped read
//!   event only costs recency precision, so `offer` reports [`OfferResult::Full`]
//!   and moves on. Exposes `reads()`/`writes()` so the quiescent property
//!   "everything offered was drained" can be asserted.
//! - [`WriteBuffer`]: fixed-capacity, multi-producer, lossless. `try_push`
//!   hands the task back on overflow so the producer can run maintenance
//!   itself until space frees; no write event is ever dropped. The
//!   `producer_index` counts accepted tasks, which the write-tolerance
//!   coalescing tests observe.
//!
//! Both buffers ride on a bounded `crossbeam_channel` ring; the consumer side
//! is only polled while holding the eviction lock, preserving the
//! single-consumer discipline.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Outcome of offering an event to a lossy buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferResult {
    /// The event was accepted.
    Success,
    /// The ring was full (or contended); the event was dropped.
    Full,
}

// ---------------------------------------------------------------------------
// ReadBuffer
// ---------------------------------------------------------------------------

/// Lossy bounded multi-producer buffer for read events.
#[derive(Debug)]
pub struct ReadBuffer<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl<T> ReadBuffer<T> {
    /// Creates a buffer holding at most `capacity` events.
    ///
    /// The capacity is rounded up to a power of two with a floor of 4.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(4).next_power_of_two();
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Offers an event; drops it if the ring is full.
    pub fn offer(&self, event: T) -> OfferResult {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                OfferResult::Success
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => OfferResult::Full,
        }
    }

    /// Drains all currently buffered events into `consume`.
    ///
    /// Must only be called by the single maintenance consumer.
    pub fn drain_with(&self, mut consume: impl FnMut(T)) {
        while let Ok(event) = self.rx.try_recv() {
            self.reads.fetch_add(1, Ordering::Relaxed);
            consume(event);
        }
    }

    /// Total events consumed by the drain.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Acquire)
    }

    /// Total events successfully offered.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Acquire)
    }

    /// Returns `true` if no events are waiting.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

// ---------------------------------------------------------------------------
// WriteBuffer
// ---------------------------------------------------------------------------

/// Lossless bounded multi-producer buffer for deferred write tasks.
#[derive(Debug)]
pub struct WriteBuffer<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    producer_index: AtomicUsize,
}

impl<T> WriteBuffer<T> {
    /// Creates a buffer holding at most `capacity` tasks.
    ///
    /// The capacity is rounded up to a power of two with a floor of 4.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(4).next_power_of_two();
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            producer_index: AtomicUsize::new(0),
        }
    }

    /// Attempts to enqueue a task, returning it on overflow.
    ///
    /// The caller must not drop a returned task: write events are lossless.
    /// The expected recovery is to run maintenance and retry.
    pub fn try_push(&self, task: T) -> Result<(), T> {
        match self.tx.try_send(task) {
            Ok(()) => {
                self.producer_index.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(task)) | Err(TrySendError::Disconnected(task)) => Err(task),
        }
    }

    /// Dequeues one task, if available.
    ///
    /// Must only be called by the single maintenance consumer.
    pub fn pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Count of tasks accepted since creation.
    pub fn producer_index(&self) -> usize {
        self.producer_index.load(Ordering::Acquire)
    }

    /// Returns `true` if no tasks are waiting.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
