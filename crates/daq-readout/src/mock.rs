//! Scripted controller for tests and dry runs.
//!
//! [`MockController`] serves reads from a queue of [`MockRead`]s, can be told
//! to fail individual operations, and records every call so tests can check
//! what reached the hardware and in which order.

use crate::controller::{ControllerError, Result, ScriptExecutor, VmeController};
use daq_core::ControllerKind;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Longest a mock read sleeps when it has nothing to return.
const IDLE_READ_SLEEP: Duration = Duration::from_millis(2);

/// One controller operation, as recorded in the call log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerCall {
    Open,
    Close,
    ReadRegister(u16),
    WriteRegister(u16, u32),
    UploadStack(u8),
    RunScript(String),
    EnterDaqMode,
    LeaveDaqMode,
    BulkRead,
}

impl ControllerCall {
    /// Calls that change controller state.
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            ControllerCall::ReadRegister(_) | ControllerCall::BulkRead
        )
    }
}

/// Operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    Open,
    WriteRegister,
    UploadStack,
    RunScript,
    EnterDaqMode,
    LeaveDaqMode,
}

/// Outcome of one scripted bulk read.
#[derive(Debug, Clone)]
pub enum MockRead {
    Data(Vec<u8>),
    Timeout,
    Error(String),
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<ControllerCall>,
    reads: VecDeque<MockRead>,
    /// Served while in DAQ mode once `reads` is empty.
    streaming: Option<Vec<u8>>,
    failures: HashSet<MockOperation>,
    registers: HashMap<u16, u32>,
    open: bool,
    in_daq_mode: bool,
}

impl MockState {
    fn check(&self, operation: MockOperation) -> Result<()> {
        if self.failures.contains(&operation) {
            return Err(ControllerError::Protocol(format!(
                "injected {:?} failure",
                operation
            )));
        }
        Ok(())
    }
}

/// Shared view of a mock's state, usable after the controller has been
/// handed to a worker.
#[derive(Debug, Clone, Default)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    pub fn calls(&self) -> Vec<ControllerCall> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, call: &ControllerCall) -> usize {
        self.state.lock().calls.iter().filter(|c| *c == call).count()
    }

    pub fn push_read(&self, read: MockRead) {
        self.state.lock().reads.push_back(read);
    }

    pub fn push_data(&self, data: impl Into<Vec<u8>>) {
        self.push_read(MockRead::Data(data.into()));
    }

    pub fn pending_reads(&self) -> usize {
        self.state.lock().reads.len()
    }

    /// Return `data` on every read while in DAQ mode and the queue is empty.
    pub fn set_streaming(&self, data: Option<Vec<u8>>) {
        self.state.lock().streaming = data;
    }

    pub fn fail(&self, operation: MockOperation) {
        self.state.lock().failures.insert(operation);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub fn in_daq_mode(&self) -> bool {
        self.state.lock().in_daq_mode
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn record(&self, call: ControllerCall) {
        self.state.lock().calls.push(call);
    }
}

/// In-memory stand-in for a VMUSB or MVLC controller.
#[derive(Debug)]
pub struct MockController {
    kind: ControllerKind,
    handle: MockHandle,
}

impl MockController {
    pub fn new(kind: ControllerKind) -> Self {
        Self {
            kind,
            handle: MockHandle::default(),
        }
    }

    pub fn handle(&self) -> MockHandle {
        self.handle.clone()
    }

    fn ensure_open(state: &MockState) -> Result<()> {
        if state.open {
            Ok(())
        } else {
            Err(ControllerError::NotOpen)
        }
    }
}

impl VmeController for MockController {
    fn kind(&self) -> ControllerKind {
        self.kind
    }

    fn open(&mut self) -> Result<()> {
        self.handle.record(ControllerCall::Open);
        let mut state = self.handle.state.lock();
        state.check(MockOperation::Open)?;
        state.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.handle.record(ControllerCall::Close);
        let mut state = self.handle.state.lock();
        state.open = false;
        state.in_daq_mode = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    fn read_register(&mut self, address: u16) -> Result<u32> {
        self.handle.record(ControllerCall::ReadRegister(address));
        let state = self.handle.state.lock();
        Self::ensure_open(&state)?;
        Ok(state.registers.get(&address).copied().unwrap_or(0))
    }

    fn write_register(&mut self, address: u16, value: u32) -> Result<()> {
        self.handle.record(ControllerCall::WriteRegister(address, value));
        let mut state = self.handle.state.lock();
        Self::ensure_open(&state)?;
        state.check(MockOperation::WriteRegister)?;
        state.registers.insert(address, value);
        Ok(())
    }

    fn upload_stack(&mut self, stack_id: u8, _commands: &[u32]) -> Result<()> {
        self.handle.record(ControllerCall::UploadStack(stack_id));
        let state = self.handle.state.lock();
        Self::ensure_open(&state)?;
        state.check(MockOperation::UploadStack)
    }

    fn enter_daq_mode(&mut self) -> Result<()> {
        self.handle.record(ControllerCall::EnterDaqMode);
        let mut state = self.handle.state.lock();
        Self::ensure_open(&state)?;
        state.check(MockOperation::EnterDaqMode)?;
        state.in_daq_mode = true;
        Ok(())
    }

    fn leave_daq_mode(&mut self) -> Result<()> {
        self.handle.record(ControllerCall::LeaveDaqMode);
        let mut state = self.handle.state.lock();
        Self::ensure_open(&state)?;
        state.check(MockOperation::LeaveDaqMode)?;
        state.in_daq_mode = false;
        Ok(())
    }

    fn bulk_read(&mut self, dest: &mut [u8], timeout: Duration) -> Result<usize> {
        self.handle.record(ControllerCall::BulkRead);
        let next = {
            let mut state = self.handle.state.lock();
            Self::ensure_open(&state)?;
            match state.reads.pop_front() {
                Some(read) => Some(read),
                None if state.in_daq_mode => state.streaming.clone().map(MockRead::Data),
                None => None,
            }
        };

        match next {
            Some(MockRead::Data(data)) => {
                let n = data.len().min(dest.len());
                dest[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Some(MockRead::Error(message)) => Err(ControllerError::Protocol(message)),
            Some(MockRead::Timeout) | None => {
                std::thread::sleep(timeout.min(IDLE_READ_SLEEP));
                Err(ControllerError::Timeout)
            }
        }
    }
}

/// Script executor recording into a mock's call log.
#[derive(Debug, Clone)]
pub struct MockScriptExecutor {
    handle: MockHandle,
}

impl MockScriptExecutor {
    pub fn new(handle: MockHandle) -> Self {
        Self { handle }
    }
}

impl ScriptExecutor for MockScriptExecutor {
    fn run_script(&mut self, _controller: &mut dyn VmeController, name: &str) -> Result<()> {
        self.handle.record(ControllerCall::RunScript(name.to_string()));
        self.handle.state.lock().check(MockOperation::RunScript)
    }
}
