//! VMUSB buffer decoding.
//!
//! A VMUSB buffer is a 16-bit buffer header (optionally followed by a second
//! header word holding the buffer length) and `event_count` events, each a
//! 16-bit event header plus `length` 16-bit words. Module payloads inside an
//! event are 32-bit words terminated by [`END_MARKER`].

use super::{ByteCursor, DecodeSummary, SectionBuilder};
use daq_core::listfile::END_MARKER;
use daq_core::{DecodeError, DecodeErrorKind, EventConfig, StackMap};
use daq_pool::RawBuffer;
use std::sync::Arc;
use tracing::{debug, warn};

mod constants {
    pub mod buffer {
        pub const LAST_BUFFER: u16 = 1 << 15;
        pub const SCALER_BUFFER: u16 = 1 << 14;
        pub const CONTINUATION: u16 = 1 << 13;
        pub const MULTI_BUFFER: u16 = 1 << 12;
        pub const EVENT_COUNT_MASK: u16 = 0x0fff;
        /// Word pair closing a buffer.
        pub const TERMINATOR: u16 = 0xffff;
    }

    pub mod event {
        pub const STACK_ID_SHIFT: u16 = 13;
        pub const STACK_ID_MASK: u16 = 0x7;
        pub const PARTIAL_EVENT: u16 = 1 << 12;
        pub const LENGTH_MASK: u16 = 0x0fff;
    }
}

use constants::{buffer, event};

/// Decoded buffer header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHeader {
    pub last_buffer: bool,
    pub scaler_buffer: bool,
    pub continuation: bool,
    pub multi_buffer: bool,
    pub event_count: u16,
}

impl BufferHeader {
    pub fn decode(word: u16) -> Self {
        Self {
            last_buffer: word & buffer::LAST_BUFFER != 0,
            scaler_buffer: word & buffer::SCALER_BUFFER != 0,
            continuation: word & buffer::CONTINUATION != 0,
            multi_buffer: word & buffer::MULTI_BUFFER != 0,
            event_count: word & buffer::EVENT_COUNT_MASK,
        }
    }
}

/// Decoded event header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub stack_id: u8,
    pub partial: bool,
    /// Event length in 16-bit words, excluding the header.
    pub length: u16,
}

impl EventHeader {
    pub fn decode(word: u16) -> Self {
        Self {
            stack_id: ((word >> event::STACK_ID_SHIFT) & event::STACK_ID_MASK) as u8,
            partial: word & event::PARTIAL_EVENT != 0,
            length: word & event::LENGTH_MASK,
        }
    }

    pub fn encode(&self) -> u16 {
        let mut word = ((self.stack_id as u16) & event::STACK_ID_MASK) << event::STACK_ID_SHIFT;
        if self.partial {
            word |= event::PARTIAL_EVENT;
        }
        word | (self.length & event::LENGTH_MASK)
    }

    fn byte_len(&self) -> usize {
        self.length as usize * 2
    }
}

/// Stateless per-buffer VMUSB decoder.
#[derive(Debug)]
pub struct VmusbDecoder {
    events: Arc<Vec<EventConfig>>,
    stack_map: StackMap,
    header_words: usize,
}

impl VmusbDecoder {
    pub fn new(events: Arc<Vec<EventConfig>>, stack_map: StackMap, header_words: usize) -> Self {
        Self {
            events,
            stack_map,
            header_words: header_words.clamp(1, 2),
        }
    }

    pub fn decode(
        &mut self,
        input: &RawBuffer,
        output: &mut RawBuffer,
    ) -> Result<DecodeSummary, DecodeError> {
        let buffer_number = input.buffer_number();
        let mut cursor = ByteCursor::new(input.as_slice(), buffer_number);
        let mut builder = SectionBuilder::new(output, buffer_number);
        let mut summary = DecodeSummary::default();

        let header = BufferHeader::decode(cursor.read_u16()?);
        if self.header_words == 2 {
            // Buffer length in 16-bit words; the valid byte count is authoritative.
            cursor.read_u16()?;
        }
        if header.scaler_buffer {
            debug!(buffer_number, "VMUSB scaler buffer");
        }

        for index in 0..header.event_count {
            let event_offset = cursor.pos();
            let event_header = EventHeader::decode(cursor.read_u16()?);
            cursor.ensure(event_header.byte_len())?;
            builder.set_input_offset(event_offset);

            if event_header.partial {
                let err = DecodeError::new(
                    DecodeErrorKind::PartialEventUnsupported {
                        stack_id: event_header.stack_id,
                    },
                    buffer_number,
                    event_offset,
                );
                warn!(event = index, %err, "skipping event");
                summary.partial_events += 1;
                cursor.skip(event_header.byte_len())?;
                continue;
            }

            let Some(event_index) = self.stack_map.event_index(event_header.stack_id) else {
                let err = DecodeError::new(
                    DecodeErrorKind::UnknownStackId {
                        stack_id: event_header.stack_id,
                    },
                    buffer_number,
                    event_offset,
                );
                warn!(event = index, %err, "skipping event");
                summary.skipped_events += 1;
                cursor.skip(event_header.byte_len())?;
                continue;
            };

            let body_start = cursor.pos();
            let body = &input.as_slice()[body_start..body_start + event_header.byte_len()];
            match self.copy_event(event_index, body, &mut builder) {
                Ok(0) => summary.events += 1,
                Ok(extra_bytes) => {
                    warn!(
                        buffer_number,
                        offset = event_offset,
                        stack_id = event_header.stack_id,
                        extra_bytes,
                        "event data after the last module ignored"
                    );
                    summary.events += 1;
                    summary.frame_errors += 1;
                }
                Err(EventFault::Decode(err)) => return Err(err),
                Err(EventFault::ModuleOverrun(module_index)) => {
                    builder.abort_event();
                    let err = DecodeError::new(
                        DecodeErrorKind::ModuleDataOverrun { module_index },
                        buffer_number,
                        event_offset,
                    );
                    warn!(event = index, stack_id = event_header.stack_id, %err, "skipping event");
                    summary.frame_errors += 1;
                }
            }
            cursor.skip(event_header.byte_len())?;
        }

        self.check_trailer(&mut cursor, buffer_number);
        if header.last_buffer {
            debug!(buffer_number, "VMUSB last buffer");
        }
        Ok(summary)
    }

    /// Copy one event body into an event section, one module section per
    /// configured module. Returns the number of body bytes left over after
    /// the last module.
    fn copy_event(
        &self,
        event_index: usize,
        body: &[u8],
        builder: &mut SectionBuilder<'_>,
    ) -> Result<usize, EventFault> {
        let modules = self
            .events
            .get(event_index)
            .map(|e| e.modules.as_slice())
            .unwrap_or_default();

        builder.begin_event(event_index as u8)?;
        let mut words = body.chunks_exact(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
        for (module_index, module) in modules.iter().enumerate() {
            builder.begin_module(module.module_type)?;
            loop {
                let Some(word) = words.next() else {
                    return Err(EventFault::ModuleOverrun(module_index));
                };
                builder.push(word)?;
                if word == END_MARKER {
                    break;
                }
            }
            builder.end_module()?;
        }
        builder.end_event()?;
        Ok(words.len() * 4 + body.len() % 4)
    }

    /// Anything after the last event should be terminator words.
    fn check_trailer(&self, cursor: &mut ByteCursor<'_>, buffer_number: u64) {
        let mut extra = 0usize;
        while let Ok(word) = cursor.read_u16() {
            if word != buffer::TERMINATOR {
                extra += 1;
            }
        }
        if extra > 0 {
            debug!(buffer_number, extra, "unexpected words after last VMUSB event");
        }
    }
}

enum EventFault {
    Decode(DecodeError),
    ModuleOverrun(usize),
}

impl From<DecodeError> for EventFault {
    fn from(err: DecodeError) -> Self {
        EventFault::Decode(err)
    }
}
