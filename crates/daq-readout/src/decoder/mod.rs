//! Frame decoders.
//!
//! A decoder turns one raw controller buffer into normalized listfile event
//! sections appended to an output buffer. The controller family is known
//! once per run, so the decoder is a closed enum picked at `Starting`:
//!
//! - [`FrameDecoder::Vmusb`]: legacy 16-bit buffer/event headers
//! - [`FrameDecoder::MvlcUsb`]: MVLC frames back to back
//! - [`FrameDecoder::MvlcEth`]: MVLC frames inside UDP packets
//!
//! Skippable problems (unknown stack, partial event, packet loss) are counted
//! in [`DecodeSummary`]. A returned [`DecodeError`] means the whole buffer is
//! discarded; the output buffer is rolled back to where it was before the
//! call, so no partially decoded buffer ever reaches the listfile.

pub mod mvlc;
pub mod mvlc_frames;
pub mod vmusb;

use daq_core::listfile::{
    ModuleHeader, SectionHeader, END_MARKER, SECTION_MAX_WORDS, SUBEVENT_MAX_WORDS,
};
use daq_core::{DecodeError, DecodeErrorKind, RunContext};
use daq_pool::RawBuffer;

pub use mvlc::MvlcReadoutParser;
pub use vmusb::VmusbDecoder;

/// Per-buffer decode counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeSummary {
    pub events: u64,
    pub skipped_events: u64,
    pub partial_events: u64,
    pub frame_errors: u64,
    pub lost_packets: u64,
    pub system_events: u64,
    pub stack_errors: u64,
}

/// Controller-specific decoder, selected once per run.
#[derive(Debug)]
pub enum FrameDecoder {
    Vmusb(VmusbDecoder),
    MvlcUsb(MvlcReadoutParser),
    MvlcEth(MvlcReadoutParser),
}

impl FrameDecoder {
    /// Build the decoder matching the run's controller.
    pub fn for_run(ctx: &RunContext, vmusb_header_words: usize) -> Self {
        use daq_core::ControllerKind;
        match ctx.controller {
            ControllerKind::Vmusb => FrameDecoder::Vmusb(VmusbDecoder::new(
                ctx.events.clone(),
                ctx.stack_map.clone(),
                vmusb_header_words,
            )),
            ControllerKind::MvlcUsb => FrameDecoder::MvlcUsb(MvlcReadoutParser::new(
                ctx.events.clone(),
                ctx.stack_map.clone(),
            )),
            ControllerKind::MvlcEth => FrameDecoder::MvlcEth(MvlcReadoutParser::new(
                ctx.events.clone(),
                ctx.stack_map.clone(),
            )),
        }
    }

    /// Decode `input` into `output`. On error `output` is unchanged.
    pub fn decode(
        &mut self,
        input: &RawBuffer,
        output: &mut RawBuffer,
    ) -> Result<DecodeSummary, DecodeError> {
        let mark = output.used();
        let result = match self {
            FrameDecoder::Vmusb(decoder) => decoder.decode(input, output),
            FrameDecoder::MvlcUsb(parser) => parser.decode_usb(input, output),
            FrameDecoder::MvlcEth(parser) => parser.decode_eth(input, output),
        };
        if result.is_err() {
            output.truncate(mark);
        }
        result
    }

    /// Forget any state carried between buffers.
    pub fn reset(&mut self) {
        match self {
            FrameDecoder::Vmusb(_) => {}
            FrameDecoder::MvlcUsb(parser) | FrameDecoder::MvlcEth(parser) => parser.reset(),
        }
    }
}

/// Bounds-checked little-endian reader over the valid part of a buffer.
#[derive(Debug)]
pub(crate) struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
    buffer_number: u64,
}

impl<'a> ByteCursor<'a> {
    pub(crate) fn new(data: &'a [u8], buffer_number: u64) -> Self {
        Self {
            data,
            pos: 0,
            buffer_number,
        }
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn overrun(&self, needed: usize) -> DecodeError {
        DecodeError::new(
            DecodeErrorKind::CursorOverrun {
                needed,
                available: self.remaining(),
            },
            self.buffer_number,
            self.pos,
        )
    }

    pub(crate) fn ensure(&self, bytes: usize) -> Result<(), DecodeError> {
        if bytes > self.remaining() {
            return Err(self.overrun(bytes));
        }
        Ok(())
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16, DecodeError> {
        self.ensure(2)?;
        let b = &self.data[self.pos..self.pos + 2];
        self.pos += 2;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, DecodeError> {
        self.ensure(4)?;
        let b = &self.data[self.pos..self.pos + 4];
        self.pos += 4;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn skip(&mut self, bytes: usize) -> Result<(), DecodeError> {
        self.ensure(bytes)?;
        self.pos += bytes;
        Ok(())
    }
}

/// Writes event sections into an output buffer, back-patching the size
/// fields once each section is closed.
pub(crate) struct SectionBuilder<'a> {
    out: &'a mut RawBuffer,
    buffer_number: u64,
    input_offset: usize,
    event: Option<(usize, u8)>,
    module: Option<(usize, u8)>,
}

impl<'a> SectionBuilder<'a> {
    pub(crate) fn new(out: &'a mut RawBuffer, buffer_number: u64) -> Self {
        Self {
            out,
            buffer_number,
            input_offset: 0,
            event: None,
            module: None,
        }
    }

    /// Input offset reported in output overflow errors.
    pub(crate) fn set_input_offset(&mut self, offset: usize) {
        self.input_offset = offset;
    }

    pub(crate) fn used(&self) -> usize {
        self.out.used()
    }

    fn overflow(&self, needed: usize) -> DecodeError {
        DecodeError::new(
            DecodeErrorKind::OutputOverflow {
                needed,
                available: self.out.free_space(),
            },
            self.buffer_number,
            self.input_offset,
        )
    }

    pub(crate) fn push(&mut self, word: u32) -> Result<(), DecodeError> {
        if self.out.push_u32(word) {
            Ok(())
        } else {
            Err(self.overflow(4))
        }
    }

    pub(crate) fn push_words(&mut self, words: &[u32]) -> Result<(), DecodeError> {
        if words.len() * 4 > self.out.free_space() {
            return Err(self.overflow(words.len() * 4));
        }
        for &word in words {
            self.push(word)?;
        }
        Ok(())
    }

    pub(crate) fn begin_event(&mut self, event_index: u8) -> Result<(), DecodeError> {
        let offset = self.out.used();
        self.push(SectionHeader::event(event_index, 0).encode())?;
        self.event = Some((offset, event_index));
        Ok(())
    }

    pub(crate) fn begin_module(&mut self, module_type: u8) -> Result<(), DecodeError> {
        let offset = self.out.used();
        self.push(ModuleHeader::new(module_type, 0).encode())?;
        self.module = Some((offset, module_type));
        Ok(())
    }

    fn too_large(&self, words: usize, max_words: usize) -> DecodeError {
        DecodeError::new(
            DecodeErrorKind::EventTooLarge { words, max_words },
            self.buffer_number,
            self.input_offset,
        )
    }

    /// Patch the open module's size (payload plus end marker, which the
    /// caller has already written). Fails if the size does not fit the
    /// module header; the caller then aborts the event.
    pub(crate) fn end_module(&mut self) -> Result<(), DecodeError> {
        if let Some((offset, module_type)) = self.module.take() {
            let size = (self.out.used() - offset) / 4 - 1;
            if size > SUBEVENT_MAX_WORDS {
                return Err(self.too_large(size, SUBEVENT_MAX_WORDS));
            }
            self.out
                .put_u32_at(offset, ModuleHeader::new(module_type, size).encode());
        }
        Ok(())
    }

    /// Append the event end marker and patch the event header.
    pub(crate) fn end_event(&mut self) -> Result<(), DecodeError> {
        self.push(END_MARKER)?;
        if let Some((offset, event_index)) = self.event {
            let size = (self.out.used() - offset) / 4 - 1;
            if size > SECTION_MAX_WORDS {
                return Err(self.too_large(size, SECTION_MAX_WORDS));
            }
            self.event = None;
            self.out
                .put_u32_at(offset, SectionHeader::event(event_index, size).encode());
        }
        Ok(())
    }

    /// Drop the open event (and module) from the output.
    pub(crate) fn abort_event(&mut self) {
        if let Some((offset, _)) = self.event.take() {
            self.out.truncate(offset);
        }
        self.module = None;
    }

    /// Write a complete event from per-module payloads. Each payload gets its
    /// own end marker.
    #[cfg(test)]
    pub(crate) fn write_event(
        &mut self,
        event_index: u8,
        modules: &[(u8, &[u32])],
    ) -> Result<(), DecodeError> {
        let needed = 8 + modules.iter().map(|(_, p)| (p.len() + 2) * 4).sum::<usize>();
        if needed > self.out.free_space() {
            return Err(self.overflow(needed));
        }
        self.begin_event(event_index)?;
        for (module_type, payload) in modules {
            self.begin_module(*module_type)?;
            self.push_words(payload)?;
            self.push(END_MARKER)?;
            self.end_module()?;
        }
        self.end_event()
    }
}
