//! `vme_daq`
//!
//! Readout of VME controllers (VMUSB, MVLC over USB or Ethernet) into
//! normalized listfiles.
//!
//! The pipeline lives in the workspace crates:
//!
//! - `daq-pool`: pre-allocated buffers with free/filled queues
//! - `daq-core`: errors, DAQ state, statistics, run configuration, listfile layout
//! - `daq-readout`: controller boundary, frame decoders, readout worker
//! - `daq-storage`: listfile writer and reader
//!
//! This crate adds settings loading, tracing setup and the session glue used
//! by the `vme-daq` binary.

pub mod config;
pub mod inspect;
pub mod logging;
pub mod session;

pub use config::Settings;
pub use inspect::{inspect_listfile, ListfileOverview};
pub use session::{encode_capture, replay_controller, replay_file, run_session, SessionReport};
