//! `daq-core`
//!
//! Core types shared by every stage of the VME readout pipeline.
//!
//! ## Key Types
//!
//! - [`DaqError`]: pipeline error type with hardware, decode and listfile
//!   categories
//! - [`DaqState`] / [`DaqControl`]: DAQ state machine and the request/notify
//!   handle shared between the readout thread and its observers
//! - [`RunStatistics`] / [`SharedStats`]: per-run counters and read rate
//! - [`EventConfig`], [`TriggerCondition`], [`StackMap`]: run configuration
//! - [`RunContext`]: everything a run needs, built once at `Starting`
//! - [`listfile`]: the normalized on-disk record layout

pub mod context;
pub mod error;
pub mod listfile;
pub mod run_config;
pub mod run_log;
pub mod state;
pub mod stats;

pub use context::RunContext;
pub use error::{
    DaqError, DaqResult, DecodeError, DecodeErrorKind, HardwareError, HardwareErrorKind,
};
pub use run_config::{
    validate_triggers, ControllerKind, EventConfig, ModuleConfig, ModuleReadoutStructure,
    StackMap, TriggerCondition,
};
pub use run_log::{LogCallback, LogThrottle, RunLog};
pub use state::{DaqControl, DaqRequest, DaqState};
pub use stats::{RunStatistics, SharedStats};
