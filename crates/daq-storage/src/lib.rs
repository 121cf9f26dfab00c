//! Listfile persistence for the VME readout pipeline.
//!
//! - [`ListfileWriter`]: writes the framed section stream to a plain file or
//!   into a zip archive together with the run log and analysis config
//! - [`ListfileReader`]: reads a listfile (plain or zipped) back section by
//!   section

pub mod error;
pub mod listfile_reader;
pub mod listfile_writer;

pub use error::{ListfileError, Result};
pub use listfile_reader::{ListfileReader, ModuleData, Section};
pub use listfile_writer::{
    ListfileFormat, ListfileSummary, ListfileWriter, ANALYSIS_ENTRY, LISTFILE_ENTRY,
    MESSAGES_ENTRY,
};
