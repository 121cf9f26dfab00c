//! Per-run message log.
//!
//! Messages go to three places: `tracing`, an in-memory list that becomes
//! `messages.log` at run end, and an optional callback (UI log panel).

use chrono::Local;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Callback receiving every human-readable run message.
pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct RunLog {
    lines: Arc<Mutex<Vec<String>>>,
    callback: Option<LogCallback>,
}

impl std::fmt::Debug for RunLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLog")
            .field("lines", &self.lines.lock().len())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callback(callback: LogCallback) -> Self {
        Self {
            lines: Arc::default(),
            callback: Some(callback),
        }
    }

    pub fn info(&self, message: impl AsRef<str>) {
        info!("{}", message.as_ref());
        self.append(message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        warn!("{}", message.as_ref());
        self.append(message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        error!("{}", message.as_ref());
        self.append(message.as_ref());
    }

    fn append(&self, message: &str) {
        let line = format!("{}: {}", Local::now().format("%H:%M:%S"), message);
        if let Some(callback) = &self.callback {
            callback(&line);
        }
        self.lines.lock().push(line);
    }

    /// Drop collected lines (run start).
    pub fn clear(&self) {
        self.lines.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    /// Newline-joined contents, as written to `messages.log`.
    pub fn joined(&self) -> String {
        let lines = self.lines.lock();
        let mut out = lines.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }
}

/// Allows at most one message per interval and counts what it suppressed.
#[derive(Debug, Clone)]
pub struct LogThrottle {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            suppressed: 0,
        }
    }

    /// `Some(suppressed_since_last)` if a message may be emitted at `now`.
    pub fn check(&mut self, now: Instant) -> Option<u64> {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }
}
