//! Controller boundary.
//!
//! The readout worker talks to hardware only through [`VmeController`]. USB
//! and Ethernet transports, register maps and stack encodings live behind
//! it. Command scripts that program modules before a run are run through a
//! [`ScriptExecutor`].

use daq_core::{ControllerKind, HardwareError, HardwareErrorKind};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;

/// Errors reported by a controller implementation.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// No data arrived within the read timeout.
    #[error("Read timed out")]
    Timeout,

    /// Operation issued before `open` (or after `close`).
    #[error("Controller is not open")]
    NotOpen,

    /// Transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The controller answered with something unexpected.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ControllerError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ControllerError::Timeout)
    }

    /// Attach the controller and the failed operation.
    pub fn into_hardware(self, controller: ControllerKind, kind: HardwareErrorKind) -> HardwareError {
        HardwareError::new(controller.name(), kind, self.to_string())
    }
}

/// A VME controller in either register mode or autonomous DAQ mode.
pub trait VmeController: Send {
    fn kind(&self) -> ControllerKind;

    fn open(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    fn read_register(&mut self, address: u16) -> Result<u32>;

    fn write_register(&mut self, address: u16, value: u32) -> Result<()>;

    /// Upload the readout command stack executed when `stack_id` triggers.
    fn upload_stack(&mut self, stack_id: u8, commands: &[u32]) -> Result<()>;

    /// Start autonomous readout. Buffers become available via [`bulk_read`].
    ///
    /// [`bulk_read`]: VmeController::bulk_read
    fn enter_daq_mode(&mut self) -> Result<()>;

    fn leave_daq_mode(&mut self) -> Result<()>;

    /// Read up to `dest.len()` bytes, waiting at most `timeout`.
    ///
    /// Returns the number of bytes read. A timeout with no data is
    /// [`ControllerError::Timeout`]; a timeout after a partial transfer
    /// returns the bytes received.
    fn bulk_read(&mut self, dest: &mut [u8], timeout: Duration) -> Result<usize>;
}

/// Runs named command scripts against a controller.
pub trait ScriptExecutor: Send {
    fn run_script(&mut self, controller: &mut dyn VmeController, name: &str) -> Result<()>;
}

/// Executor for runs without a script layer (replay, tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopScriptExecutor;

impl ScriptExecutor for NoopScriptExecutor {
    fn run_script(&mut self, _controller: &mut dyn VmeController, name: &str) -> Result<()> {
        tracing::debug!(script = name, "no script executor configured, skipping");
        Ok(())
    }
}

/// Read with timeouts mapped to `Ok(0)`.
pub(crate) fn read_or_timeout(
    controller: &mut dyn VmeController,
    dest: &mut [u8],
    timeout: Duration,
) -> Result<usize> {
    match controller.bulk_read(dest, timeout) {
        Err(ControllerError::Timeout) => Ok(0),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardware_error_names_controller() {
        let err = ControllerError::Protocol("bad response".into())
            .into_hardware(ControllerKind::MvlcEth, HardwareErrorKind::Register);
        let msg = err.to_string();
        assert!(msg.contains("mvlc_eth"), "{}", msg);
        assert!(msg.contains("register"));
        assert!(msg.contains("bad response"));
    }

    #[test]
    fn test_timeout_classification() {
        assert!(ControllerError::Timeout.is_timeout());
        assert!(!ControllerError::NotOpen.is_timeout());
    }
}
