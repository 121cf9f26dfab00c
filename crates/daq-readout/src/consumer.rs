//! Downstream side of the filled queue.
//!
//! A consumer thread takes filled buffers in enqueue order, hands each to a
//! [`BufferConsumer`] and releases it back to the pool.

use daq_core::listfile::{SectionHeader, SectionType, MAX_EVENT_INDEX};
use daq_core::{DaqError, DaqResult};
use daq_pool::{BufferPool, RawBuffer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Processes normalized listfile buffers.
pub trait BufferConsumer: Send {
    fn process(&mut self, buffer: &RawBuffer);

    /// Called once after the last buffer.
    fn finish(&mut self) {}
}

/// Running consumer thread.
#[derive(Debug)]
pub struct ConsumerHandle<C> {
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<C>,
}

impl<C> ConsumerHandle<C> {
    /// Drain what is still queued, stop the thread and return the consumer.
    pub fn shutdown(self) -> DaqResult<C> {
        self.shutdown.store(true, Ordering::Release);
        self.handle
            .join()
            .map_err(|_| DaqError::ReadoutThread("consumer thread panicked".to_string()))
    }
}

/// Start a thread feeding `consumer` from the pool's filled queue.
pub fn spawn_consumer<C>(pool: BufferPool, mut consumer: C, poll: Duration) -> DaqResult<ConsumerHandle<C>>
where
    C: BufferConsumer + 'static,
{
    let shutdown = Arc::new(AtomicBool::new(false));
    let stop = Arc::clone(&shutdown);
    let handle = thread::Builder::new()
        .name("buffer-consumer".to_string())
        .spawn(move || {
            loop {
                match pool.dequeue_filled(poll) {
                    Some(buffer) => {
                        consumer.process(&buffer);
                        pool.release(buffer);
                    }
                    None if stop.load(Ordering::Acquire) => break,
                    None => {}
                }
            }
            consumer.finish();
            consumer
        })
        .map_err(|e| DaqError::ReadoutThread(e.to_string()))?;
    Ok(ConsumerHandle { shutdown, handle })
}

/// Counts event sections per event index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionCounter {
    pub buffers: u64,
    pub bytes: u64,
    pub events: [u64; MAX_EVENT_INDEX + 1],
    pub other_sections: u64,
    pub malformed_buffers: u64,
    /// Buffers whose number did not increase over the previous one.
    pub out_of_order: u64,
    pub last_buffer_number: Option<u64>,
}

impl SectionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_events(&self) -> u64 {
        self.events.iter().sum()
    }

    /// Count the sections of one buffer. Returns `false` if the framing is
    /// broken.
    pub fn count_sections(&mut self, bytes: &[u8]) -> bool {
        let mut pos = 0;
        while pos + 4 <= bytes.len() {
            let word = u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]]);
            let Some(header) = SectionHeader::decode(word) else {
                return false;
            };
            match header.section_type {
                SectionType::Event => self.events[header.event_index as usize] += 1,
                _ => self.other_sections += 1,
            }
            pos += 4 + header.size_words * 4;
        }
        pos == bytes.len()
    }
}

impl BufferConsumer for SectionCounter {
    fn process(&mut self, buffer: &RawBuffer) {
        self.buffers += 1;
        self.bytes += buffer.used() as u64;
        let number = buffer.buffer_number();
        if self.last_buffer_number.is_some_and(|last| number <= last) {
            self.out_of_order += 1;
            warn!(number, "buffer delivered out of order");
        }
        self.last_buffer_number = Some(number);
        if !self.count_sections(buffer.as_slice()) {
            self.malformed_buffers += 1;
            debug!(number, "malformed section framing");
        }
    }
}
