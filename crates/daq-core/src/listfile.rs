//! Listfile binary layout.
//!
//! All words are 32-bit little-endian. A listfile starts with a preamble
//! (`"MVME"` magic followed by the format version word) and is then a
//! sequence of sections, each introduced by one header word:
//!
//! ```text
//!  31  29 28  25 24     20 19                      0
//! +------+------+---------+-------------------------+
//! | type | event| (unused)|  section size (words)   |
//! +------+------+---------+-------------------------+
//! ```
//!
//! Event section bodies consist of module sub-events:
//!
//! ```text
//!  31        24 23     20 19                      0
//! +------------+---------+-------------------------+
//! | module type| (unused)|  sub-event size (words) |
//! +------------+---------+-------------------------+
//! ```
//!
//! followed by the module's raw payload terminated by [`END_MARKER`]. The
//! event body itself ends with one more [`END_MARKER`].

use serde::{Deserialize, Serialize};

/// Listfile format version written to the preamble.
pub const LISTFILE_VERSION: u32 = 1;

/// Preamble magic bytes.
pub const PREAMBLE_MAGIC: &[u8; 4] = b"MVME";

/// Reserved word terminating module payloads and event sections.
pub const END_MARKER: u32 = 0x8765_4321;

pub const SECTION_TYPE_MASK: u32 = 0xe000_0000;
pub const SECTION_TYPE_SHIFT: u32 = 29;
pub const SECTION_SIZE_MASK: u32 = 0x000f_ffff;
pub const SECTION_MAX_WORDS: usize = SECTION_SIZE_MASK as usize;
pub const SECTION_MAX_BYTES: usize = SECTION_MAX_WORDS * 4;
pub const EVENT_TYPE_MASK: u32 = 0x1e00_0000;
pub const EVENT_TYPE_SHIFT: u32 = 25;
/// Highest event index representable in an event section header.
pub const MAX_EVENT_INDEX: usize = (EVENT_TYPE_MASK >> EVENT_TYPE_SHIFT) as usize;

pub const MODULE_TYPE_MASK: u32 = 0xff00_0000;
pub const MODULE_TYPE_SHIFT: u32 = 24;
pub const SUBEVENT_SIZE_MASK: u32 = 0x000f_ffff;
pub const SUBEVENT_MAX_WORDS: usize = SUBEVENT_SIZE_MASK as usize;

/// Pause section body values.
pub const PAUSE_ACTION_PAUSE: u32 = 0;
pub const PAUSE_ACTION_RESUME: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SectionType {
    End = 0,
    Config = 1,
    Event = 2,
    Timetick = 3,
    Pause = 4,
}

impl SectionType {
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(Self::End),
            1 => Some(Self::Config),
            2 => Some(Self::Event),
            3 => Some(Self::Timetick),
            4 => Some(Self::Pause),
            _ => None,
        }
    }
}

/// Decoded section header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    pub section_type: SectionType,
    /// Body size in words, excluding the header itself.
    pub size_words: usize,
    /// Event index; only meaningful for event sections.
    pub event_index: u8,
}

impl SectionHeader {
    pub fn new(section_type: SectionType, size_words: usize) -> Self {
        Self {
            section_type,
            size_words,
            event_index: 0,
        }
    }

    pub fn event(event_index: u8, size_words: usize) -> Self {
        Self {
            section_type: SectionType::Event,
            size_words,
            event_index,
        }
    }

    /// Pack into a header word. Sizes and indexes are masked; callers
    /// validate ranges beforehand.
    pub fn encode(&self) -> u32 {
        let mut word = ((self.section_type as u32) << SECTION_TYPE_SHIFT) & SECTION_TYPE_MASK;
        word |= (self.size_words as u32) & SECTION_SIZE_MASK;
        if self.section_type == SectionType::Event {
            word |= ((self.event_index as u32) << EVENT_TYPE_SHIFT) & EVENT_TYPE_MASK;
        }
        word
    }

    /// Unpack a header word. Returns `None` for unknown section types.
    pub fn decode(word: u32) -> Option<Self> {
        let section_type = SectionType::from_bits((word & SECTION_TYPE_MASK) >> SECTION_TYPE_SHIFT)?;
        let event_index = if section_type == SectionType::Event {
            ((word & EVENT_TYPE_MASK) >> EVENT_TYPE_SHIFT) as u8
        } else {
            0
        };
        Some(Self {
            section_type,
            size_words: (word & SECTION_SIZE_MASK) as usize,
            event_index,
        })
    }
}

/// Decoded module (sub-event) header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleHeader {
    pub module_type: u8,
    /// Body size in words including the trailing end marker.
    pub size_words: usize,
}

impl ModuleHeader {
    pub fn new(module_type: u8, size_words: usize) -> Self {
        Self {
            module_type,
            size_words,
        }
    }

    pub fn encode(&self) -> u32 {
        ((self.module_type as u32) << MODULE_TYPE_SHIFT) | (self.size_words as u32 & SUBEVENT_SIZE_MASK)
    }

    pub fn decode(word: u32) -> Self {
        Self {
            module_type: ((word & MODULE_TYPE_MASK) >> MODULE_TYPE_SHIFT) as u8,
            size_words: (word & SUBEVENT_SIZE_MASK) as usize,
        }
    }
}

/// Bytes of the preamble: magic followed by the version word.
pub fn preamble_bytes() -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(PREAMBLE_MAGIC);
    out[4..].copy_from_slice(&LISTFILE_VERSION.to_le_bytes());
    out
}
