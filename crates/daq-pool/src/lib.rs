//! Fixed-size buffer pool for the VME readout pipeline.
//!
//! Per-event heap allocations are not acceptable in the readout path, so all
//! acquisition buffers are allocated once when the pool is built and then
//! recycled for the whole run:
//!
//! - [`RawBuffer`]: owned byte array with `capacity`, `used` and a
//!   [`BufferFormat`] tag
//! - [`BufferPool`]: `free` and `filled` FIFO queues with timed
//!   acquire/dequeue

pub mod buffer_pool;
pub mod raw_buffer;

pub use buffer_pool::BufferPool;
pub use raw_buffer::{BufferFormat, RawBuffer};
