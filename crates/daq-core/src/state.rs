//! DAQ state machine types and the control handle shared with observers.
//!
//! ```text
//! Idle --start--> Starting --init ok--> Running <--resume-- Paused
//!   ^                 |                    |  \--pause-->----^ |
//!   |                 | init failed        |                   |
//!   +-----------------+                 stop                 stop
//!   |                                      v                   |
//!   +------------------------------- Stopping <----------------+
//! ```
//!
//! Only the readout worker transitions the state. Control requests from
//! other threads are stored in a single "desired state" slot and picked up by
//! the readout loop at the top of each iteration.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DaqState {
    #[default]
    Idle,
    Starting,
    Running,
    Paused,
    Stopping,
}

impl std::fmt::Display for DaqState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DaqState::Idle => "idle",
            DaqState::Starting => "starting",
            DaqState::Running => "running",
            DaqState::Paused => "paused",
            DaqState::Stopping => "stopping",
        };
        write!(f, "{}", label)
    }
}

/// Pending control request, consumed by the readout loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DaqRequest {
    None = 0,
    Pause = 1,
    Resume = 2,
    Stop = 3,
}

impl DaqRequest {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Pause,
            2 => Self::Resume,
            3 => Self::Stop,
            _ => Self::None,
        }
    }
}

/// Shared control block between the readout worker and its observers.
///
/// The current state is published through a `watch` channel so any number of
/// observers (UI, orchestration, tests) get every transition.
#[derive(Debug)]
pub struct DaqControl {
    request: AtomicU8,
    state_tx: watch::Sender<DaqState>,
}

impl Default for DaqControl {
    fn default() -> Self {
        Self::new()
    }
}

impl DaqControl {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(DaqState::Idle);
        Self {
            request: AtomicU8::new(DaqRequest::None as u8),
            state_tx,
        }
    }

    pub fn state(&self) -> DaqState {
        *self.state_tx.borrow()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<DaqState> {
        self.state_tx.subscribe()
    }

    /// Publish a new state. Reserved for the readout worker.
    pub fn set_state(&self, state: DaqState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "DAQ state transition");
        }
    }

    /// Ask a running DAQ to pause. No-op (returns `false`) unless `Running`.
    pub fn request_pause(&self) -> bool {
        self.state() == DaqState::Running && self.store_unless_stop(DaqRequest::Pause)
    }

    /// Ask a paused DAQ to resume. No-op (returns `false`) unless `Paused`.
    pub fn request_resume(&self) -> bool {
        self.state() == DaqState::Paused && self.store_unless_stop(DaqRequest::Resume)
    }

    /// Ask the DAQ to stop. Accepted while `Starting`, `Running` or `Paused`.
    pub fn request_stop(&self) -> bool {
        match self.state() {
            DaqState::Starting | DaqState::Running | DaqState::Paused => {
                self.request.store(DaqRequest::Stop as u8, Ordering::Release);
                true
            }
            DaqState::Idle | DaqState::Stopping => false,
        }
    }

    /// Take the pending request, leaving `None` behind.
    pub fn take_request(&self) -> DaqRequest {
        DaqRequest::from_u8(self.request.swap(DaqRequest::None as u8, Ordering::AcqRel))
    }

    /// Peek without consuming; used by loops that only care about stop.
    pub fn stop_requested(&self) -> bool {
        DaqRequest::from_u8(self.request.load(Ordering::Acquire)) == DaqRequest::Stop
    }

    /// Forget any pending request (run start).
    pub fn clear_request(&self) {
        self.request.store(DaqRequest::None as u8, Ordering::Release);
    }

    // A pending stop is never downgraded to pause/resume.
    fn store_unless_stop(&self, request: DaqRequest) -> bool {
        let mut current = self.request.load(Ordering::Acquire);
        loop {
            if current == DaqRequest::Stop as u8 {
                return false;
            }
            match self.request.compare_exchange(
                current,
                request as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests_ignored_in_wrong_state() {
        let control = DaqControl::new();
        assert!(!control.request_pause());
        assert!(!control.request_resume());
        assert!(!control.request_stop());
        assert_eq!(control.take_request(), DaqRequest::None);

        control.set_state(DaqState::Running);
        assert!(!control.request_resume());
        assert!(control.request_pause());
        assert_eq!(control.take_request(), DaqRequest::Pause);

        control.set_state(DaqState::Paused);
        assert!(!control.request_pause());
        assert!(control.request_resume());
        assert_eq!(control.take_request(), DaqRequest::Resume);
    }

    #[test]
    fn test_stop_is_not_overwritten() {
        let control = DaqControl::new();
        control.set_state(DaqState::Running);
        assert!(control.request_stop());
        assert!(!control.request_pause());
        assert!(control.stop_requested());
        assert_eq!(control.take_request(), DaqRequest::Stop);
        assert_eq!(control.take_request(), DaqRequest::None);
    }

    #[test]
    fn test_state_changes_are_published() {
        let control = DaqControl::new();
        let mut rx = control.subscribe();
        control.set_state(DaqState::Starting);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), DaqState::Starting);
        control.set_state(DaqState::Running);
        assert_eq!(*rx.borrow_and_update(), DaqState::Running);
        assert_eq!(control.state(), DaqState::Running);
    }
}
