//! Run statistics.
//!
//! Counters only ever grow during a run. They are written exclusively by the
//! readout thread through [`SharedStats::update`] and read by observers as
//! snapshots under the same lock.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Smoothing factor for the read-rate moving average.
const RATE_ALPHA: f64 = 0.3;

/// Minimum interval between rate samples.
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Exponential moving average of a byte rate.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    window_start: Option<Instant>,
    window_bytes: u64,
    rate: Option<f64>,
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self {
            window_start: None,
            window_bytes: 0,
            rate: None,
        }
    }
}

impl RateEstimator {
    /// Account `bytes` at `now`; folds the window into the average once it
    /// is at least one second long.
    pub fn record(&mut self, bytes: u64, now: Instant) {
        let start = *self.window_start.get_or_insert(now);
        self.window_bytes += bytes;
        let elapsed = now.duration_since(start);
        if elapsed >= RATE_WINDOW {
            let sample = self.window_bytes as f64 / elapsed.as_secs_f64();
            self.rate = Some(match self.rate {
                Some(rate) => RATE_ALPHA * sample + (1.0 - RATE_ALPHA) * rate,
                None => sample,
            });
            self.window_start = Some(now);
            self.window_bytes = 0;
        }
    }

    /// Current estimate in bytes per second (0 before the first window closes).
    pub fn rate(&self) -> f64 {
        self.rate.unwrap_or(0.0)
    }
}

/// Counters for one acquisition run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStatistics {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub bytes_read: u64,
    pub buffers_read: u64,
    pub buffers_with_errors: u64,
    /// Buffers decoded into the local overflow buffer because the pool was
    /// exhausted; persisted but not delivered downstream.
    pub dropped_buffers: u64,
    pub bytes_written: u64,
    pub events_decoded: u64,
    pub skipped_events: u64,
    pub partial_events: u64,
    pub frame_errors: u64,
    pub lost_packets: u64,
    pub system_events: u64,
    /// MVLC stack error notifications seen in the data stream.
    pub stack_errors: u64,
    pub read_timeouts: u64,
    /// Smoothed read rate in bytes per second.
    pub read_rate: f64,
    #[serde(skip)]
    rate: RateEstimator,
}

impl RunStatistics {
    /// Fresh statistics for a run starting now.
    pub fn started() -> Self {
        Self {
            start_time: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn record_read(&mut self, bytes: usize, now: Instant) {
        self.bytes_read += bytes as u64;
        self.buffers_read += 1;
        self.rate.record(bytes as u64, now);
        self.read_rate = self.rate.rate();
    }

    pub fn finalize(&mut self) {
        self.end_time = Some(Utc::now());
    }

    /// Run duration so far (or total once finalized).
    pub fn duration(&self) -> Option<chrono::Duration> {
        let start = self.start_time?;
        Some(self.end_time.unwrap_or_else(Utc::now) - start)
    }
}

/// Handle to the statistics of the current run.
#[derive(Debug, Clone, Default)]
pub struct SharedStats {
    inner: Arc<Mutex<RunStatistics>>,
}

impl SharedStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace with fresh counters (run start).
    pub fn reset(&self) {
        *self.inner.lock() = RunStatistics::started();
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut RunStatistics) -> R) -> R {
        f(&mut self.inner.lock())
    }

    pub fn snapshot(&self) -> RunStatistics {
        self.inner.lock().clone()
    }
}
