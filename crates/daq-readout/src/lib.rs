//! `daq-readout`
//!
//! The acquisition side of the pipeline: talks to a VME controller through
//! [`VmeController`], decodes its buffers into normalized listfile sections
//! and drives the DAQ state machine.
//!
//! ## Key Types
//!
//! - [`ReadoutWorker`]: run lifecycle (`start`/`pause`/`resume`/`stop`) and
//!   the readout thread
//! - [`FrameDecoder`]: VMUSB and MVLC (USB/ETH) buffer decoders
//! - [`BufferConsumer`] / [`spawn_consumer`]: downstream stage fed from the
//!   pool's filled queue
//! - [`MockController`]: scripted controller for tests and dry runs

pub mod consumer;
pub mod controller;
pub mod decoder;
pub mod mock;
pub mod worker;

pub use consumer::{spawn_consumer, BufferConsumer, ConsumerHandle, SectionCounter};
pub use controller::{ControllerError, NoopScriptExecutor, ScriptExecutor, VmeController};
pub use decoder::{DecodeSummary, FrameDecoder};
pub use mock::{ControllerCall, MockController, MockHandle, MockOperation, MockRead, MockScriptExecutor};
pub use worker::{ListfileSetup, ReadoutSettings, ReadoutWorker, RunSetup, RunSummary};
