//! MVLC readout parser.
//!
//! Readout data arrives as stack frames: one `StackFrame` per triggered
//! event, extended by `StackContinuation` frames while the `Continue` flag is
//! set. Inside the frames each configured module contributes a fixed
//! `Prefix`, an optional `Dynamic` part made of `BlockRead` frames, and a
//! fixed `Suffix`.
//!
//! Frames may straddle buffer boundaries (and, over Ethernet, packet
//! boundaries), so the parser keeps its position in the frame structure and
//! stages module data until the event is complete. Only complete events are
//! written to the output buffer.

use super::mvlc_frames::{EthPacketHeader, FrameHeader, FrameType};
use super::{ByteCursor, DecodeSummary, SectionBuilder};
use daq_core::listfile::END_MARKER;
use daq_core::{DecodeError, DecodeErrorKind, EventConfig, ModuleConfig, StackMap};
use daq_pool::RawBuffer;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModulePhase {
    Prefix(usize),
    Dynamic,
    Suffix(usize),
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    /// Next word is a frame header.
    ExpectHeader,
    /// Inside a stack or continuation frame of the event in progress.
    Stack { remaining: usize, continues: bool },
    /// Discarding the rest of a frame.
    Skip { remaining: usize },
}

#[derive(Debug, Clone, Copy)]
struct BlockState {
    remaining: usize,
    continues: bool,
}

#[derive(Debug)]
struct EventInProgress {
    event_index: usize,
    stack: u8,
    module_index: usize,
    phase: ModulePhase,
    block: Option<BlockState>,
    awaiting_continuation: bool,
}

impl EventInProgress {
    fn new(event_index: usize, stack: u8, modules: &[ModuleConfig]) -> Self {
        let phase = match modules.first() {
            Some(module) => ModulePhase::Prefix(module.readout.prefix_len),
            None => ModulePhase::Done,
        };
        let mut event = Self {
            event_index,
            stack,
            module_index: 0,
            phase,
            block: None,
            awaiting_continuation: false,
        };
        event.settle(modules);
        event
    }

    /// Step past exhausted fixed-size phases.
    fn settle(&mut self, modules: &[ModuleConfig]) {
        loop {
            let Some(module) = modules.get(self.module_index) else {
                self.phase = ModulePhase::Done;
                return;
            };
            self.phase = match self.phase {
                ModulePhase::Prefix(0) if module.readout.has_dynamic => ModulePhase::Dynamic,
                ModulePhase::Prefix(0) => ModulePhase::Suffix(module.readout.suffix_len),
                ModulePhase::Suffix(0) => {
                    self.module_index += 1;
                    match modules.get(self.module_index) {
                        Some(next) => ModulePhase::Prefix(next.readout.prefix_len),
                        None => ModulePhase::Done,
                    }
                }
                _ => return,
            };
        }
    }

    fn is_complete(&self) -> bool {
        self.phase == ModulePhase::Done && self.block.is_none()
    }
}

/// Why an event in progress was thrown away.
enum EventFault {
    /// More data than the configured modules account for, or an event that
    /// ended before every module was complete.
    ModuleData(usize),
    /// A non-block frame where a block read frame was expected.
    BlockHeader(u32),
}

/// Parser for MVLC readout data; shared by the USB and ETH buffer formats.
#[derive(Debug)]
pub struct MvlcReadoutParser {
    events: Arc<Vec<EventConfig>>,
    stack_map: StackMap,
    frame: FrameState,
    event: Option<EventInProgress>,
    /// Per-module staging for the event in progress.
    staging: Vec<Vec<u32>>,
    /// Continuations of an unmapped stack to discard.
    skip_continuation: Option<u8>,
    out_of_sync: bool,
    last_packet: Option<u16>,
    buffer_number: u64,
}

impl MvlcReadoutParser {
    pub fn new(events: Arc<Vec<EventConfig>>, stack_map: StackMap) -> Self {
        let max_modules = events.iter().map(|e| e.modules.len()).max().unwrap_or(0);
        Self {
            events,
            stack_map,
            frame: FrameState::ExpectHeader,
            event: None,
            staging: vec![Vec::new(); max_modules],
            skip_continuation: None,
            out_of_sync: true,
            last_packet: None,
            buffer_number: 0,
        }
    }

    /// Forget all state carried between buffers. Data up to the next frame
    /// start (or ETH header pointer) is skipped afterwards.
    pub fn reset(&mut self) {
        self.resync();
        self.out_of_sync = true;
        self.last_packet = None;
    }

    /// `true` while an event is waiting for data from a later buffer.
    pub fn has_event_in_progress(&self) -> bool {
        self.event.is_some()
    }

    fn resync(&mut self) {
        self.frame = FrameState::ExpectHeader;
        self.event = None;
        self.skip_continuation = None;
        for module in &mut self.staging {
            module.clear();
        }
    }

    fn lose_sync(&mut self) {
        if self.event.is_some() {
            debug!(buffer_number = self.buffer_number, "discarding event in progress");
        }
        self.resync();
        self.out_of_sync = true;
    }

    /// Decode a buffer of back-to-back frames read over USB.
    pub fn decode_usb(
        &mut self,
        input: &RawBuffer,
        output: &mut RawBuffer,
    ) -> Result<DecodeSummary, DecodeError> {
        self.buffer_number = input.buffer_number();
        let result = self.parse_usb(input, output);
        if result.is_err() {
            self.lose_sync();
        }
        result
    }

    /// Decode a buffer of Ethernet packets.
    pub fn decode_eth(
        &mut self,
        input: &RawBuffer,
        output: &mut RawBuffer,
    ) -> Result<DecodeSummary, DecodeError> {
        self.buffer_number = input.buffer_number();
        let result = self.parse_eth(input, output);
        if result.is_err() {
            self.lose_sync();
        }
        result
    }

    fn parse_usb(
        &mut self,
        input: &RawBuffer,
        output: &mut RawBuffer,
    ) -> Result<DecodeSummary, DecodeError> {
        let data = input.as_slice();
        let mut cursor = ByteCursor::new(data, self.buffer_number);
        let tail = data.len() % 4;
        if tail != 0 {
            cursor.skip(data.len() - tail)?;
            return Err(cursor.overrun(4));
        }

        let mut builder = SectionBuilder::new(output, self.buffer_number);
        let mut summary = DecodeSummary::default();
        let mut resync_words = 0usize;

        while cursor.remaining() > 0 {
            let offset = cursor.pos();
            let word = cursor.read_u32()?;
            if self.out_of_sync {
                if !Self::is_frame_start(word) {
                    resync_words += 1;
                    continue;
                }
                self.out_of_sync = false;
            }
            builder.set_input_offset(offset);
            match self.step(word, offset, &mut summary) {
                Ok(true) => self.flush_event(&mut builder, &mut summary)?,
                Ok(false) => {}
                Err(kind) => return Err(DecodeError::new(kind, self.buffer_number, offset)),
            }
        }

        if resync_words > 0 {
            debug!(
                buffer_number = self.buffer_number,
                resync_words, "skipped words while resynchronizing"
            );
        }
        Ok(summary)
    }

    fn parse_eth(
        &mut self,
        input: &RawBuffer,
        output: &mut RawBuffer,
    ) -> Result<DecodeSummary, DecodeError> {
        let data = input.as_slice();
        let mut cursor = ByteCursor::new(data, self.buffer_number);
        let mut builder = SectionBuilder::new(output, self.buffer_number);
        let mut summary = DecodeSummary::default();

        while cursor.remaining() > 0 {
            let packet_offset = cursor.pos();
            let header0 = cursor.read_u32()?;
            let header1 = cursor.read_u32()?;
            let header = EthPacketHeader::decode(header0, header1);
            let payload_offset = cursor.pos();
            cursor.skip(header.data_word_count as usize * 4)?;

            if header.channel != EthPacketHeader::DATA_CHANNEL {
                debug!(
                    buffer_number = self.buffer_number,
                    channel = header.channel,
                    "ignoring non-data packet"
                );
                continue;
            }

            if let Some(previous) = self.last_packet {
                let lost = header.packets_lost_since(previous);
                if lost > 0 {
                    warn!(
                        buffer_number = self.buffer_number,
                        offset = packet_offset,
                        previous,
                        packet_number = header.packet_number,
                        lost,
                        "lost ETH packets"
                    );
                    summary.lost_packets += lost as u64;
                    self.lose_sync();
                }
            }
            self.last_packet = Some(header.packet_number);

            let payload = &data[payload_offset..cursor.pos()];
            self.parse_packet(&header, payload, payload_offset, packet_offset, &mut builder, &mut summary)?;
        }
        Ok(summary)
    }

    /// Feed one data packet's payload. Only output overflow is returned as an
    /// error; framing problems resynchronize via the next header pointer.
    fn parse_packet(
        &mut self,
        header: &EthPacketHeader,
        payload: &[u8],
        payload_offset: usize,
        packet_offset: usize,
        builder: &mut SectionBuilder<'_>,
        summary: &mut DecodeSummary,
    ) -> Result<(), DecodeError> {
        let word_count = header.data_word_count as usize;
        let pointer = header.next_header_pointer as usize;
        let word_at = |i: usize| {
            let b = &payload[i * 4..i * 4 + 4];
            u32::from_le_bytes([b[0], b[1], b[2], b[3]])
        };

        if header.has_header_pointer() && pointer >= word_count {
            let err = DecodeError::new(
                DecodeErrorKind::MalformedNextHeaderPointer {
                    pointer: header.next_header_pointer,
                    data_words: header.data_word_count,
                },
                self.buffer_number,
                packet_offset,
            );
            warn!(%err, "skipping packet");
            summary.frame_errors += 1;
            self.lose_sync();
            return Ok(());
        }

        let mut start = if self.out_of_sync {
            if !header.has_header_pointer() {
                return Ok(());
            }
            pointer
        } else {
            let split = if header.has_header_pointer() {
                pointer
            } else {
                word_count
            };
            let mut consistent = true;
            for i in 0..split {
                // The pointer names the first header in the packet; the frame
                // in progress must not end before it.
                if self.frame == FrameState::ExpectHeader {
                    consistent = false;
                    break;
                }
                let offset = payload_offset + i * 4;
                builder.set_input_offset(offset);
                match self.step(word_at(i), offset, summary) {
                    Ok(true) => self.flush_event(builder, summary)?,
                    Ok(false) => {}
                    Err(_) => {
                        consistent = false;
                        break;
                    }
                }
            }
            if header.has_header_pointer() && self.frame != FrameState::ExpectHeader {
                consistent = false;
            }
            if !consistent {
                warn!(
                    buffer_number = self.buffer_number,
                    offset = packet_offset,
                    pointer = header.next_header_pointer,
                    "frame boundary does not match ETH next header pointer"
                );
                summary.frame_errors += 1;
                self.lose_sync();
                if !header.has_header_pointer() {
                    return Ok(());
                }
            }
            split
        };

        self.out_of_sync = false;
        if self.frame != FrameState::ExpectHeader {
            // Packet fully consumed as continuation data.
            return Ok(());
        }
        while start < word_count {
            let offset = payload_offset + start * 4;
            builder.set_input_offset(offset);
            match self.step(word_at(start), offset, summary) {
                Ok(true) => self.flush_event(builder, summary)?,
                Ok(false) => {}
                Err(kind) => {
                    let err = DecodeError::new(kind, self.buffer_number, offset);
                    warn!(%err, "lost frame sync inside ETH packet");
                    summary.frame_errors += 1;
                    self.lose_sync();
                    return Ok(());
                }
            }
            start += 1;
        }
        Ok(())
    }

    /// Plausible first word after losing sync.
    fn is_frame_start(word: u32) -> bool {
        matches!(
            FrameHeader::decode(word).map(|h| h.frame_type),
            Some(FrameType::StackFrame | FrameType::SystemEvent | FrameType::StackError)
        )
    }

    /// Consume one word. Returns `Ok(true)` when it completed an event and
    /// `Err` only when a frame header was expected and the word is not one.
    fn step(
        &mut self,
        word: u32,
        offset: usize,
        summary: &mut DecodeSummary,
    ) -> Result<bool, DecodeErrorKind> {
        match self.frame {
            FrameState::ExpectHeader => self.on_frame_header(word, offset, summary),
            FrameState::Skip { remaining } => {
                self.frame = Self::skip_state(remaining - 1);
                Ok(false)
            }
            FrameState::Stack {
                remaining,
                continues,
            } => {
                let remaining = remaining - 1;
                if let Err(fault) = self.on_event_data(word) {
                    self.drop_event(fault, offset, continues, summary);
                    self.frame = Self::skip_state(remaining);
                    return Ok(false);
                }
                if remaining > 0 {
                    self.frame = FrameState::Stack {
                        remaining,
                        continues,
                    };
                    return Ok(false);
                }
                self.frame = FrameState::ExpectHeader;
                Ok(self.end_of_stack_frame(continues, offset, summary))
            }
        }
    }

    fn skip_state(remaining: usize) -> FrameState {
        if remaining == 0 {
            FrameState::ExpectHeader
        } else {
            FrameState::Skip { remaining }
        }
    }

    fn on_frame_header(
        &mut self,
        word: u32,
        offset: usize,
        summary: &mut DecodeSummary,
    ) -> Result<bool, DecodeErrorKind> {
        let header = FrameHeader::decode(word)
            .ok_or(DecodeErrorKind::UnexpectedFrameType { header: word })?;

        match header.frame_type {
            FrameType::StackFrame => {
                if let Some(event) = &self.event {
                    warn!(
                        buffer_number = self.buffer_number,
                        offset,
                        stack_id = event.stack,
                        "stack frame started before previous event was complete"
                    );
                    summary.frame_errors += 1;
                    self.discard_event();
                }
                self.skip_continuation = None;
                match self.stack_map.event_index(header.stack) {
                    Some(event_index) => {
                        let modules = match self.events.get(event_index) {
                            Some(config) => config.modules.as_slice(),
                            None => &[],
                        };
                        self.event = Some(EventInProgress::new(event_index, header.stack, modules));
                        Ok(self.enter_stack_frame(&header, offset, summary))
                    }
                    None => {
                        let err = DecodeError::new(
                            DecodeErrorKind::UnknownStackId {
                                stack_id: header.stack,
                            },
                            self.buffer_number,
                            offset,
                        );
                        warn!(%err, "skipping event");
                        summary.skipped_events += 1;
                        if header.continues() {
                            self.skip_continuation = Some(header.stack);
                        }
                        self.frame = Self::skip_state(header.len as usize);
                        Ok(false)
                    }
                }
            }
            FrameType::StackContinuation => {
                let expected = self
                    .event
                    .as_ref()
                    .is_some_and(|e| e.awaiting_continuation && e.stack == header.stack);
                if expected {
                    if let Some(event) = self.event.as_mut() {
                        event.awaiting_continuation = false;
                    }
                    return Ok(self.enter_stack_frame(&header, offset, summary));
                }
                if self.skip_continuation == Some(header.stack) {
                    if !header.continues() {
                        self.skip_continuation = None;
                    }
                } else {
                    debug!(
                        buffer_number = self.buffer_number,
                        offset,
                        stack_id = header.stack,
                        "orphaned stack continuation"
                    );
                    summary.frame_errors += 1;
                }
                self.frame = Self::skip_state(header.len as usize);
                Ok(false)
            }
            FrameType::SystemEvent => {
                summary.system_events += 1;
                self.frame = Self::skip_state(header.len as usize);
                Ok(false)
            }
            FrameType::StackError => {
                summary.stack_errors += 1;
                self.frame = Self::skip_state(header.len as usize);
                Ok(false)
            }
            FrameType::BlockRead => Err(DecodeErrorKind::UnexpectedFrameType { header: word }),
        }
    }

    fn enter_stack_frame(
        &mut self,
        header: &FrameHeader,
        offset: usize,
        summary: &mut DecodeSummary,
    ) -> bool {
        if header.has_error_flags() {
            debug!(
                buffer_number = self.buffer_number,
                offset,
                stack_id = header.stack,
                flags = header.flags,
                "stack frame error flags"
            );
        }
        if header.len == 0 {
            self.frame = FrameState::ExpectHeader;
            return self.end_of_stack_frame(header.continues(), offset, summary);
        }
        self.frame = FrameState::Stack {
            remaining: header.len as usize,
            continues: header.continues(),
        };
        false
    }

    /// The last word of a stack (or continuation) frame has been consumed.
    fn end_of_stack_frame(
        &mut self,
        continues: bool,
        offset: usize,
        summary: &mut DecodeSummary,
    ) -> bool {
        let Some(event) = self.event.as_mut() else {
            return false;
        };
        if continues {
            event.awaiting_continuation = true;
            return false;
        }
        if event.is_complete() {
            return true;
        }
        let module_index = event.module_index;
        self.drop_event(EventFault::ModuleData(module_index), offset, false, summary);
        false
    }

    fn on_event_data(&mut self, word: u32) -> Result<(), EventFault> {
        let Some(event) = self.event.as_mut() else {
            return Ok(());
        };
        let modules = match self.events.get(event.event_index) {
            Some(config) => config.modules.as_slice(),
            None => &[],
        };
        let module_index = event.module_index;

        match event.phase {
            ModulePhase::Done => return Err(EventFault::ModuleData(module_index)),
            ModulePhase::Prefix(left) => {
                self.staging[module_index].push(word);
                event.phase = ModulePhase::Prefix(left - 1);
            }
            ModulePhase::Suffix(left) => {
                self.staging[module_index].push(word);
                event.phase = ModulePhase::Suffix(left - 1);
            }
            ModulePhase::Dynamic => match event.block {
                None => {
                    let header = FrameHeader::decode(word)
                        .filter(|h| h.frame_type == FrameType::BlockRead)
                        .ok_or(EventFault::BlockHeader(word))?;
                    if header.len > 0 {
                        event.block = Some(BlockState {
                            remaining: header.len as usize,
                            continues: header.continues(),
                        });
                    } else if !header.continues() {
                        event.phase = ModulePhase::Suffix(modules[module_index].readout.suffix_len);
                    }
                }
                Some(block) => {
                    self.staging[module_index].push(word);
                    if block.remaining > 1 {
                        event.block = Some(BlockState {
                            remaining: block.remaining - 1,
                            ..block
                        });
                    } else {
                        event.block = None;
                        if !block.continues {
                            event.phase =
                                ModulePhase::Suffix(modules[module_index].readout.suffix_len);
                        }
                    }
                }
            },
        }
        event.settle(modules);
        Ok(())
    }

    /// Count and discard the event in progress. With `continues` set, its
    /// remaining continuation frames are skipped too.
    fn drop_event(
        &mut self,
        fault: EventFault,
        offset: usize,
        continues: bool,
        summary: &mut DecodeSummary,
    ) {
        let Some(event) = self.event.as_ref() else {
            return;
        };
        let kind = match fault {
            EventFault::ModuleData(module_index) => DecodeErrorKind::ModuleDataOverrun { module_index },
            EventFault::BlockHeader(header) => DecodeErrorKind::UnexpectedFrameType { header },
        };
        let err = DecodeError::new(kind, self.buffer_number, offset);
        warn!(event_index = event.event_index, stack_id = event.stack, %err, "skipping event");
        summary.frame_errors += 1;
        self.skip_continuation = continues.then_some(event.stack);
        self.discard_event();
    }

    fn discard_event(&mut self) {
        self.event = None;
        for module in &mut self.staging {
            module.clear();
        }
    }

    fn modules(&self, event_index: usize) -> &[ModuleConfig] {
        self.events
            .get(event_index)
            .map(|e| e.modules.as_slice())
            .unwrap_or_default()
    }

    /// Write the completed event from staging into the output.
    fn flush_event(
        &mut self,
        builder: &mut SectionBuilder<'_>,
        summary: &mut DecodeSummary,
    ) -> Result<(), DecodeError> {
        let Some(event) = self.event.take() else {
            return Ok(());
        };
        let modules = self.modules(event.event_index);
        let result = (|| {
            builder.begin_event(event.event_index as u8)?;
            for (module, payload) in modules.iter().zip(&self.staging) {
                builder.begin_module(module.module_type)?;
                builder.push_words(payload)?;
                builder.push(END_MARKER)?;
                builder.end_module()?;
            }
            builder.end_event()
        })();
        for module in &mut self.staging {
            module.clear();
        }
        match result {
            Ok(()) => {
                summary.events += 1;
                Ok(())
            }
            Err(err) if matches!(err.kind, DecodeErrorKind::EventTooLarge { .. }) => {
                builder.abort_event();
                warn!(event_index = event.event_index, stack_id = event.stack, %err, "skipping event");
                summary.frame_errors += 1;
                Ok(())
            }
            Err(err) => {
                builder.abort_event();
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::FrameDecoder;
    use daq_core::listfile::{ModuleHeader, SectionHeader};
    use daq_core::{ControllerKind, ModuleReadoutStructure, TriggerCondition};

    type DecodedEvent = (u8, Vec<(u8, Vec<u32>)>);

    fn frame(frame_type: FrameType, stack: u8, len: usize, continues: bool) -> u32 {
        FrameHeader::new(frame_type, stack, len as u16)
            .with_continue(continues)
            .encode()
    }

    fn stack(stack_id: u8, len: usize) -> u32 {
        frame(FrameType::StackFrame, stack_id, len, false)
    }

    fn block(len: usize) -> u32 {
        frame(FrameType::BlockRead, 0, len, false)
    }

    fn parser() -> MvlcReadoutParser {
        let events = vec![
            EventConfig::new("trigger", 1, TriggerCondition::Nim1)
                .with_module(ModuleConfig::new("mdpp", 10)),
            EventConfig::new("timed", 2, TriggerCondition::Periodic)
                .with_module(ModuleConfig::new("scaler", 20).with_readout(
                    ModuleReadoutStructure {
                        prefix_len: 2,
                        has_dynamic: false,
                        suffix_len: 0,
                    },
                ))
                .with_module(ModuleConfig::new("qdc", 21).with_readout(
                    ModuleReadoutStructure {
                        prefix_len: 1,
                        has_dynamic: true,
                        suffix_len: 1,
                    },
                )),
        ];
        let map = StackMap::build(ControllerKind::MvlcUsb, &events).unwrap();
        MvlcReadoutParser::new(Arc::new(events), map)
    }

    fn buffer(words: &[u32], number: u64) -> RawBuffer {
        let mut buf = RawBuffer::new(0, words.len() * 4 + 4);
        for &w in words {
            assert!(buf.push_u32(w));
        }
        buf.set_buffer_number(number);
        buf
    }

    fn decoded_events(out: &RawBuffer) -> Vec<DecodedEvent> {
        let words: Vec<u32> = (0..out.word_count()).map(|i| out.u32_at(i * 4).unwrap()).collect();
        let mut events = Vec::new();
        let mut pos = 0;
        while pos < words.len() {
            let header = SectionHeader::decode(words[pos]).unwrap();
            let end = pos + 1 + header.size_words;
            assert_eq!(words[end - 1], END_MARKER);
            let mut modules = Vec::new();
            let mut p = pos + 1;
            while p < end - 1 {
                let mh = ModuleHeader::decode(words[p]);
                assert_eq!(words[p + mh.size_words], END_MARKER);
                modules.push((mh.module_type, words[p + 1..p + mh.size_words].to_vec()));
                p += 1 + mh.size_words;
            }
            events.push((header.event_index, modules));
            pos = end;
        }
        events
    }

    fn usb_stream() -> Vec<u32> {
        vec![
            // event 0: one block of three words
            stack(1, 4),
            block(3),
            0xa1,
            0xa2,
            0xa3,
            // system event between readout events
            frame(FrameType::SystemEvent, 0, 2, false),
            0x55,
            0x66,
            // event 1: prefix 2 | prefix 1, block 2, suffix 1
            stack(2, 7),
            0xb1,
            0xb2,
            0xc0,
            block(2),
            0xc1,
            0xc2,
            0xc9,
            // event 0 split over a continuation and a continued block
            frame(FrameType::StackFrame, 1, 3, true),
            frame(FrameType::BlockRead, 0, 2, true),
            0xd1,
            0xd2,
            frame(FrameType::StackContinuation, 1, 2, false),
            block(1),
            0xd3,
        ]
    }

    fn expected_usb_events() -> Vec<DecodedEvent> {
        vec![
            (0, vec![(10, vec![0xa1, 0xa2, 0xa3])]),
            (
                1,
                vec![(20, vec![0xb1, 0xb2]), (21, vec![0xc0, 0xc1, 0xc2, 0xc9])],
            ),
            (0, vec![(10, vec![0xd1, 0xd2, 0xd3])]),
        ]
    }

    #[test]
    fn test_usb_prefix_dynamic_suffix_and_continuations() {
        let mut parser = parser();
        let mut out = RawBuffer::new(1, 4096);
        let summary = parser.decode_usb(&buffer(&usb_stream(), 1), &mut out).unwrap();
        assert_eq!(summary.events, 3);
        assert_eq!(summary.system_events, 1);
        assert_eq!(summary.frame_errors, 0);
        assert_eq!(decoded_events(&out), expected_usb_events());
        assert!(!parser.has_event_in_progress());
    }

    #[test]
    fn test_usb_frames_straddling_buffers() {
        let stream = usb_stream();
        for split in 0..=stream.len() {
            let mut parser = parser();
            let mut first = RawBuffer::new(1, 4096);
            let mut second = RawBuffer::new(2, 4096);
            let a = parser.decode_usb(&buffer(&stream[..split], 1), &mut first).unwrap();
            let b = parser.decode_usb(&buffer(&stream[split..], 2), &mut second).unwrap();

            let mut events = decoded_events(&first);
            events.extend(decoded_events(&second));
            assert_eq!(events, expected_usb_events(), "split at word {}", split);
            assert_eq!(a.events + b.events, 3);
        }
    }

    #[test]
    fn test_unknown_stack_and_its_continuations_skipped() {
        let words = [
            frame(FrameType::StackFrame, 5, 2, true),
            0x1,
            0x2,
            frame(FrameType::StackContinuation, 5, 1, false),
            0x3,
            stack(1, 2),
            block(1),
            0xee,
        ];
        let mut out = RawBuffer::new(1, 1024);
        let summary = parser().decode_usb(&buffer(&words, 1), &mut out).unwrap();
        assert_eq!(summary.skipped_events, 1);
        assert_eq!(summary.frame_errors, 0);
        assert_eq!(decoded_events(&out), vec![(0, vec![(10, vec![0xee])])]);
    }

    #[test]
    fn test_malformed_events_dropped_and_counted() {
        let words = [
            // no block frame for a dynamic module
            stack(1, 0),
            // data beyond the configured modules
            stack(1, 3),
            block(1),
            0x1,
            0x2,
            // block header expected
            stack(1, 2),
            0x1234,
            0x5,
            stack(1, 2),
            block(1),
            0x7,
        ];
        let mut out = RawBuffer::new(1, 1024);
        let summary = parser().decode_usb(&buffer(&words, 1), &mut out).unwrap();
        assert_eq!(summary.frame_errors, 3);
        assert_eq!(summary.events, 1);
        assert_eq!(decoded_events(&out), vec![(0, vec![(10, vec![0x7])])]);
    }

    #[test]
    fn test_usb_lost_sync_fails_buffer_then_recovers() {
        let ctx_parser = parser();
        let mut decoder = FrameDecoder::MvlcUsb(ctx_parser);

        let bad = [stack(1, 2), block(1), 0x1, 0x1234_5678, stack(1, 2), block(1), 0x2];
        let mut out = RawBuffer::new(1, 1024);
        let err = decoder.decode(&buffer(&bad, 7), &mut out).unwrap_err();
        assert_eq!(err.kind, DecodeErrorKind::UnexpectedFrameType { header: 0x1234_5678 });
        assert_eq!(err.buffer_number, 7);
        assert_eq!(err.offset, 12);
        assert_eq!(out.used(), 0);

        // Resumes at the next plausible frame start.
        let good = [0x3, 0x4, stack(1, 2), block(1), 0x5];
        let summary = decoder.decode(&buffer(&good, 8), &mut out).unwrap();
        assert_eq!(summary.events, 1);
        assert_eq!(decoded_events(&out), vec![(0, vec![(10, vec![0x5])])]);
    }

    #[test]
    fn test_usb_partial_word_is_overrun() {
        let mut parser = parser();
        let mut input = buffer(&[stack(1, 2), block(1), 0x1], 3);
        input.set_used(10);
        let mut out = RawBuffer::new(1, 1024);
        let err = parser.decode_usb(&input, &mut out).unwrap_err();
        assert!(err.is_cursor_overrun());
        assert_eq!(err.offset, 8);
    }

    #[test]
    fn test_event_beyond_section_limit_dropped_and_counted() {
        const FRAMES: usize = 130;
        const BLOCK_WORDS: usize = 8190;
        let mut words = Vec::with_capacity(FRAMES * (BLOCK_WORDS + 2) + 3);
        for i in 0..FRAMES {
            let last = i + 1 == FRAMES;
            let frame_type = if i == 0 {
                FrameType::StackFrame
            } else {
                FrameType::StackContinuation
            };
            words.push(frame(frame_type, 1, BLOCK_WORDS + 1, !last));
            words.push(frame(FrameType::BlockRead, 0, BLOCK_WORDS, !last));
            words.extend(std::iter::repeat(0x1111).take(BLOCK_WORDS));
        }
        words.extend([stack(1, 2), block(1), 0x7]);

        let mut parser = parser();
        let mut out = RawBuffer::new(1, 8 * 1024 * 1024);
        let summary = parser.decode_usb(&buffer(&words, 1), &mut out).unwrap();
        assert_eq!(summary.events, 1);
        assert_eq!(summary.frame_errors, 1);
        // Only the small event is written and its headers describe it exactly.
        assert_eq!(decoded_events(&out), vec![(0, vec![(10, vec![0x7])])]);
        assert_eq!(out.word_count(), 5);
        assert!(!parser.has_event_in_progress());
    }

    fn packet(number: u16, pointer: u16, payload: &[u32]) -> Vec<u32> {
        let header = EthPacketHeader {
            channel: EthPacketHeader::DATA_CHANNEL,
            packet_number: number,
            data_word_count: payload.len() as u16,
            timestamp: 0,
            next_header_pointer: pointer,
        };
        let mut words = header.encode().to_vec();
        words.extend_from_slice(payload);
        words
    }

    const NO_POINTER: u16 = EthPacketHeader::NO_HEADER_POINTER;

    #[test]
    fn test_eth_single_packet_stack_frame() {
        let events = vec![EventConfig::new("eth", 1, TriggerCondition::Nim1).with_module(
            ModuleConfig::new("fixed", 7).with_readout(ModuleReadoutStructure {
                prefix_len: 4,
                has_dynamic: false,
                suffix_len: 0,
            }),
        )];
        let map = StackMap::build(ControllerKind::MvlcEth, &events).unwrap();
        let mut parser = MvlcReadoutParser::new(Arc::new(events), map);

        let words = packet(
            0,
            0,
            &[
                stack(1, 4),
                0x11,
                0x22,
                0x33,
                0x44,
                frame(FrameType::SystemEvent, 0, 0, false),
            ],
        );
        let mut out = RawBuffer::new(1, 1024);
        let summary = parser.decode_eth(&buffer(&words, 1), &mut out).unwrap();
        assert_eq!(summary.events, 1);
        assert_eq!(summary.system_events, 1);

        // event header, module header, then the four payload words
        assert_eq!(ModuleHeader::decode(out.u32_at(4).unwrap()), ModuleHeader::new(7, 5));
        let payload: Vec<u32> = (2..6).map(|i| out.u32_at(i * 4).unwrap()).collect();
        assert_eq!(payload, vec![0x11, 0x22, 0x33, 0x44]);
        assert_eq!(out.u32_at(24), Some(END_MARKER));
        assert_eq!(out.u32_at(28), Some(END_MARKER));
        assert_eq!(out.used(), 32);
    }

    fn eth_stream() -> Vec<Vec<u32>> {
        vec![
            packet(0, 0, &[stack(1, 4), block(3), 0xa]),
            packet(1, NO_POINTER, &[0xb]),
            packet(2, 1, &[0xc, stack(1, 2), block(1), 0xd]),
        ]
    }

    #[test]
    fn test_eth_frames_straddle_packets_and_buffers() {
        let packets = eth_stream();
        let mut parser = parser();
        let first: Vec<u32> = packets[..2].concat();
        let mut out1 = RawBuffer::new(1, 1024);
        let mut out2 = RawBuffer::new(2, 1024);
        let a = parser.decode_eth(&buffer(&first, 1), &mut out1).unwrap();
        assert_eq!(a.events, 0);
        assert!(parser.has_event_in_progress());

        let b = parser.decode_eth(&buffer(&packets[2], 2), &mut out2).unwrap();
        assert_eq!(b.events, 2);
        assert_eq!(b.lost_packets, 0);
        assert_eq!(
            decoded_events(&out2),
            vec![
                (0, vec![(10, vec![0xa, 0xb, 0xc])]),
                (0, vec![(10, vec![0xd])]),
            ]
        );
    }

    #[test]
    fn test_eth_packet_loss_resyncs_at_pointer() {
        let packets = eth_stream();
        let words: Vec<u32> = [packets[0].clone(), packets[2].clone()].concat();
        let mut out = RawBuffer::new(1, 1024);
        let summary = parser().decode_eth(&buffer(&words, 1), &mut out).unwrap();
        assert_eq!(summary.lost_packets, 1);
        assert_eq!(summary.events, 1);
        assert_eq!(decoded_events(&out), vec![(0, vec![(10, vec![0xd])])]);
    }

    #[test]
    fn test_eth_malformed_pointer_skips_packet() {
        let words: Vec<u32> = [
            packet(0, 5, &[stack(1, 2), block(1), 0x1]),
            packet(1, 0, &[stack(1, 2), block(1), 0x2]),
        ]
        .concat();
        let mut out = RawBuffer::new(1, 1024);
        let summary = parser().decode_eth(&buffer(&words, 1), &mut out).unwrap();
        assert_eq!(summary.frame_errors, 1);
        assert_eq!(decoded_events(&out), vec![(0, vec![(10, vec![0x2])])]);
    }

    #[test]
    fn test_eth_pointer_mismatch_counted() {
        let words: Vec<u32> = [
            packet(0, 0, &[stack(1, 2), block(1), 0x1]),
            // claims continuation data but no frame is open
            packet(1, NO_POINTER, &[0x9]),
            packet(2, 0, &[stack(1, 2), block(1), 0x2]),
        ]
        .concat();
        let mut out = RawBuffer::new(1, 1024);
        let summary = parser().decode_eth(&buffer(&words, 1), &mut out).unwrap();
        assert_eq!(summary.frame_errors, 1);
        assert_eq!(summary.events, 2);
    }

    #[test]
    fn test_eth_non_data_channel_ignored() {
        let mut words = packet(0, 0, &[stack(1, 2), block(1), 0x1]);
        let mut header = EthPacketHeader::decode(words[0], words[1]);
        header.channel = EthPacketHeader::COMMAND_CHANNEL;
        let [h0, h1] = header.encode();
        words[0] = h0;
        words[1] = h1;
        let mut out = RawBuffer::new(1, 1024);
        let summary = parser().decode_eth(&buffer(&words, 1), &mut out).unwrap();
        assert_eq!(summary, DecodeSummary::default());
        assert_eq!(out.used(), 0);
    }

    #[test]
    fn test_eth_truncation_inside_packet_is_overrun() {
        let words: Vec<u32> = eth_stream().concat();
        let full = buffer(&words, 1);
        let boundaries = [0usize, 20, 32];
        for len in 1..full.used() {
            if boundaries.contains(&len) {
                continue;
            }
            let mut input = buffer(&words, 1);
            input.set_used(len);
            let mut out = RawBuffer::new(1, 1024);
            let err = parser().decode_eth(&input, &mut out).unwrap_err();
            assert!(err.is_cursor_overrun(), "length {}: {}", len, err);
        }
    }
}
