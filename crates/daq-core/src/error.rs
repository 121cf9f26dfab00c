//! Error types for the readout pipeline.
//!
//! `DaqError` is the single error type surfaced by the run-level API. Crates
//! further up the stack (controller access, listfile storage) define their own
//! `thiserror` enums and convert into it, the same way driver errors are
//! folded into the application error.
//!
//! ## Error Categories
//!
//! 1. **Configuration** - `Config`, `Configuration`, `TriggerConflict`,
//!    `DuplicateStackId`. Fatal to starting a run; reported before any
//!    hardware write.
//! 2. **Hardware** - `Hardware`. Read timeouts without data are recovered in
//!    place by the readout worker and never reach this type; everything else
//!    aborts the run.
//! 3. **Protocol framing** - `Decode`. The offending buffer or event is
//!    skipped and counted; the run continues.
//! 4. **I/O** - `Listfile`, `Io`. Fatal to the run.

use crate::state::DaqState;
use thiserror::Error;

/// Convenience alias for results using the pipeline error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

// =============================================================================
// Hardware Errors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareErrorKind {
    Open,
    Register,
    StackUpload,
    InitScript,
    DaqMode,
    Read,
}

impl std::fmt::Display for HardwareErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            HardwareErrorKind::Open => "open",
            HardwareErrorKind::Register => "register",
            HardwareErrorKind::StackUpload => "stack_upload",
            HardwareErrorKind::InitScript => "init_script",
            HardwareErrorKind::DaqMode => "daq_mode",
            HardwareErrorKind::Read => "read",
        };
        write!(f, "{}", label)
    }
}

#[derive(Error, Debug, Clone)]
#[error("Controller '{controller}' {kind} error: {message}")]
pub struct HardwareError {
    pub controller: String,
    pub kind: HardwareErrorKind,
    pub message: String,
}

impl HardwareError {
    pub fn new(
        controller: impl Into<String>,
        kind: HardwareErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            controller: controller.into(),
            kind,
            message: message.into(),
        }
    }
}

// =============================================================================
// Decode Errors
// =============================================================================

/// What went wrong while decoding a controller buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// The cursor would move past `buffer.used`.
    CursorOverrun { needed: usize, available: usize },
    /// Stack id with no event mapped to it.
    UnknownStackId { stack_id: u8 },
    /// VMUSB partial event (continuation mode); reassembly is not supported.
    PartialEventUnsupported { stack_id: u8 },
    /// ETH next header pointer points outside the packet payload.
    MalformedNextHeaderPointer { pointer: u16, data_words: u16 },
    /// A frame header of a type not allowed at this position.
    UnexpectedFrameType { header: u32 },
    /// Module data ran past the end of its event without an end marker.
    ModuleDataOverrun { module_index: usize },
    /// The normalized output did not fit into the output buffer.
    OutputOverflow { needed: usize, available: usize },
    /// An event or module section larger than its header's size field.
    EventTooLarge { words: usize, max_words: usize },
}

impl std::fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CursorOverrun { needed, available } => write!(
                f,
                "cursor overrun (needed {} bytes, {} available)",
                needed, available
            ),
            Self::UnknownStackId { stack_id } => {
                write!(f, "no event mapped to stack id {}", stack_id)
            }
            Self::PartialEventUnsupported { stack_id } => write!(
                f,
                "partial event on stack {} (continuation not supported)",
                stack_id
            ),
            Self::MalformedNextHeaderPointer {
                pointer,
                data_words,
            } => write!(
                f,
                "next header pointer {} outside packet of {} data words",
                pointer, data_words
            ),
            Self::UnexpectedFrameType { header } => {
                write!(f, "unexpected frame header 0x{:08x}", header)
            }
            Self::ModuleDataOverrun { module_index } => write!(
                f,
                "module {} data runs past end of event without end marker",
                module_index
            ),
            Self::OutputOverflow { needed, available } => write!(
                f,
                "output buffer overflow (needed {} bytes, {} available)",
                needed, available
            ),
            Self::EventTooLarge { words, max_words } => write!(
                f,
                "section of {} words exceeds the listfile maximum of {}",
                words, max_words
            ),
        }
    }
}

/// Decode failure with enough context to find it again in a capture.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Decode error in buffer #{buffer_number} at byte offset {offset}: {kind}")]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub buffer_number: u64,
    pub offset: usize,
}

impl DecodeError {
    pub fn new(kind: DecodeErrorKind, buffer_number: u64, offset: usize) -> Self {
        Self {
            kind,
            buffer_number,
            offset,
        }
    }

    pub fn is_cursor_overrun(&self) -> bool {
        matches!(self.kind, DecodeErrorKind::CursorOverrun { .. })
    }
}

// =============================================================================
// Pipeline Error
// =============================================================================

/// Primary error type of the readout pipeline.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Settings file parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Settings or run configuration parsed but are semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Two events share a trigger condition.
    #[error("Trigger conflict: events '{first}' and '{second}' both use trigger {condition}")]
    TriggerConflict {
        first: String,
        second: String,
        condition: String,
    },

    /// Two events are read out by the same controller stack.
    #[error("Stack id {stack_id} used by both '{first}' and '{second}'")]
    DuplicateStackId {
        stack_id: u8,
        first: String,
        second: String,
    },

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Listfile open/write failure. Carries the sink's error text.
    #[error("Listfile error: {0}")]
    Listfile(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A control operation was issued in a state that does not allow it.
    #[error("Cannot {action} while DAQ is {state}")]
    InvalidStateTransition {
        state: DaqState,
        action: &'static str,
    },

    /// The readout thread panicked or could not be spawned.
    #[error("Readout thread failure: {0}")]
    ReadoutThread(String),
}

impl DaqError {
    /// Configuration errors are reported before any hardware mutation.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::Configuration(_)
                | Self::TriggerConflict { .. }
                | Self::DuplicateStackId { .. }
        )
    }
}
