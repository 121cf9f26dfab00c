//! Listfile error types.

use daq_core::DaqError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ListfileError>;

/// Failures of the listfile sink. I/O errors are never retried; the text of
/// the underlying error is always part of the message.
#[derive(Error, Debug)]
pub enum ListfileError {
    #[error("Failed to open listfile '{path}': {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    #[error("Listfile write failed: {0}")]
    Write(#[from] std::io::Error),

    #[error("Zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Listfile has already been finished")]
    Finished,

    #[error("Not a listfile: bad preamble")]
    BadPreamble,

    #[error("Unsupported listfile version {0}")]
    UnsupportedVersion(u32),

    #[error("Malformed section header 0x{word:08x} at byte offset {offset}")]
    BadSection { word: u32, offset: usize },

    #[error("Section at byte offset {offset} is truncated")]
    Truncated { offset: usize },
}

impl From<ListfileError> for DaqError {
    fn from(err: ListfileError) -> Self {
        DaqError::Listfile(err.to_string())
    }
}
