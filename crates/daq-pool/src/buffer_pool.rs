//! Free/filled buffer pool for the readout pipeline.
//!
//! # Design
//!
//! The pool pre-allocates a fixed number of [`RawBuffer`]s at startup and
//! never allocates again. Ownership of each buffer moves through two FIFO
//! queues:
//!
//! ```text
//! 1. BufferPool::new() puts every buffer into `free`
//! 2. readout thread: acquire_free(timeout) -> fill -> enqueue_filled()
//! 3. consumer thread: dequeue_filled(timeout) -> process -> release()
//! 4. release() puts the buffer back into `free`
//! ```
//!
//! Each queue is a `parking_lot::Mutex<VecDeque>` paired with a `Condvar` so
//! both blocking operations can time out. Nothing in this module waits
//! without a deadline.
//!
//! ## Invariant
//!
//! `available() + filled_len() + in_flight() == size()` holds after every
//! operation: a buffer is either queued or exclusively owned by exactly one
//! thread.
//!
//! # Example
//!
//! ```
//! use daq_pool::BufferPool;
//! use std::time::Duration;
//!
//! let pool = BufferPool::new(4, 1024);
//! let mut buf = pool.acquire_free(Duration::from_millis(10)).unwrap();
//! buf.push_u32(0x8765_4321);
//! pool.enqueue_filled(buf);
//!
//! let filled = pool.dequeue_filled(Duration::from_millis(10)).unwrap();
//! assert_eq!(filled.used(), 4);
//! pool.release(filled);
//! assert_eq!(pool.available(), 4);
//! ```

use crate::raw_buffer::RawBuffer;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// A FIFO of buffers with timed blocking pop.
struct BufferQueue {
    items: Mutex<VecDeque<RawBuffer>>,
    ready: Condvar,
}

impl BufferQueue {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Condvar::new(),
        }
    }

    fn push(&self, buffer: RawBuffer) {
        self.items.lock().push_back(buffer);
        self.ready.notify_one();
    }

    fn try_pop(&self) -> Option<RawBuffer> {
        self.items.lock().pop_front()
    }

    fn pop_timeout(&self, timeout: Duration) -> Option<RawBuffer> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        loop {
            if let Some(buffer) = items.pop_front() {
                return Some(buffer);
            }
            if self.ready.wait_until(&mut items, deadline).timed_out() {
                return items.pop_front();
            }
        }
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }
}

struct BufferPoolInner {
    free: BufferQueue,
    filled: BufferQueue,
    buffer_capacity: usize,
    pool_size: usize,
    /// Buffers currently owned by a thread (in neither queue).
    in_flight: AtomicUsize,
    total_acquires: AtomicU64,
    total_returns: AtomicU64,
}

/// Pool of pre-allocated acquisition buffers with free and filled queues.
///
/// Cheap to clone; clones share the same queues. Intended for one producer
/// (the readout thread) and one consumer (the downstream stage).
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<BufferPoolInner>,
}

impl BufferPool {
    /// Create a pool with `pool_size` buffers of `buffer_capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `pool_size` or `buffer_capacity` is 0.
    #[must_use]
    pub fn new(pool_size: usize, buffer_capacity: usize) -> Self {
        assert!(pool_size > 0, "pool_size must be > 0");
        assert!(buffer_capacity > 0, "buffer_capacity must be > 0");

        let free = BufferQueue::with_capacity(pool_size);
        {
            let mut items = free.items.lock();
            for id in 0..pool_size {
                items.push_back(RawBuffer::new(id, buffer_capacity));
            }
        }

        info!(
            pool_size,
            buffer_capacity_kb = buffer_capacity / 1024,
            total_mb = (pool_size * buffer_capacity) as f64 / (1024.0 * 1024.0),
            "BufferPool created"
        );

        Self {
            inner: Arc::new(BufferPoolInner {
                free,
                filled: BufferQueue::with_capacity(pool_size),
                buffer_capacity,
                pool_size,
                in_flight: AtomicUsize::new(0),
                total_acquires: AtomicU64::new(0),
                total_returns: AtomicU64::new(0),
            }),
        }
    }

    /// Take a free buffer, waiting at most `timeout`.
    ///
    /// Returns `None` when the pool stayed exhausted for the whole timeout
    /// (backpressure: the consumer is not keeping up).
    pub fn acquire_free(&self, timeout: Duration) -> Option<RawBuffer> {
        let buffer = self.inner.free.pop_timeout(timeout)?;
        self.mark_taken();
        Some(buffer)
    }

    /// Take a free buffer without waiting.
    pub fn try_acquire_free(&self) -> Option<RawBuffer> {
        let buffer = self.inner.free.try_pop()?;
        self.mark_taken();
        Some(buffer)
    }

    /// Return a buffer to the free queue. Its contents are discarded.
    pub fn release(&self, mut buffer: RawBuffer) {
        buffer.clear();
        self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.inner.total_returns.fetch_add(1, Ordering::Relaxed);
        self.inner.free.push(buffer);
    }

    /// Hand a filled buffer to the consumer. Order of calls is the order of
    /// delivery.
    pub fn enqueue_filled(&self, buffer: RawBuffer) {
        self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.inner.filled.push(buffer);
    }

    /// Take the oldest filled buffer, waiting at most `timeout`.
    pub fn dequeue_filled(&self, timeout: Duration) -> Option<RawBuffer> {
        let buffer = self.inner.filled.pop_timeout(timeout)?;
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        Some(buffer)
    }

    /// Drop every queued filled buffer back into the free queue. Used when a
    /// run ends without a consumer draining the queue.
    pub fn recycle_filled(&self) -> usize {
        let mut recycled = 0;
        while let Some(mut buffer) = self.inner.filled.try_pop() {
            buffer.clear();
            self.inner.free.push(buffer);
            recycled += 1;
        }
        if recycled > 0 {
            debug!(recycled, "Recycled unconsumed filled buffers");
        }
        recycled
    }

    fn mark_taken(&self) {
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        self.inner.total_acquires.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of buffers in the free queue.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.free.len()
    }

    /// Number of buffers waiting in the filled queue.
    #[must_use]
    pub fn filled_len(&self) -> usize {
        self.inner.filled.len()
    }

    /// Number of buffers currently owned by a thread.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Total number of buffers in the pool.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.pool_size
    }

    /// Capacity of each buffer in bytes.
    #[must_use]
    pub fn buffer_capacity(&self) -> usize {
        self.inner.buffer_capacity
    }

    #[must_use]
    pub fn total_acquires(&self) -> u64 {
        self.inner.total_acquires.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_returns(&self) -> u64 {
        self.inner.total_returns.load(Ordering::Relaxed)
    }
}
