//! MVLC frame and Ethernet packet headers.

mod constants {
    pub mod frame {
        pub const TYPE_SHIFT: u32 = 24;
        pub const TYPE_MASK: u32 = 0xff;
        pub const FLAGS_SHIFT: u32 = 20;
        pub const FLAGS_MASK: u32 = 0xf;
        pub const STACK_SHIFT: u32 = 16;
        pub const STACK_MASK: u32 = 0xf;
        pub const CTRL_ID_SHIFT: u32 = 13;
        pub const CTRL_ID_MASK: u32 = 0x7;
        pub const LENGTH_MASK: u32 = 0x1fff;
    }

    pub mod flags {
        pub const TIMEOUT: u8 = 1 << 0;
        pub const BUS_ERROR: u8 = 1 << 1;
        pub const SYNTAX_ERROR: u8 = 1 << 2;
        pub const CONTINUE: u8 = 1 << 3;
    }

    pub mod eth {
        pub const CHANNEL_SHIFT: u32 = 28;
        pub const CHANNEL_MASK: u32 = 0x3;
        pub const PACKET_NUMBER_SHIFT: u32 = 16;
        pub const PACKET_NUMBER_MASK: u32 = 0xfff;
        pub const DATA_WORD_COUNT_MASK: u32 = 0x1fff;
        pub const TIMESTAMP_SHIFT: u32 = 12;
        pub const TIMESTAMP_MASK: u32 = 0xfffff;
        pub const NEXT_HEADER_POINTER_MASK: u32 = 0xfff;
    }
}

use constants::{eth, flags, frame};

/// Frame header type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    StackFrame,
    BlockRead,
    StackError,
    StackContinuation,
    SystemEvent,
}

impl FrameType {
    pub const STACK_FRAME: u8 = 0xf3;
    pub const BLOCK_READ: u8 = 0xf5;
    pub const STACK_ERROR: u8 = 0xf7;
    pub const STACK_CONTINUATION: u8 = 0xf9;
    pub const SYSTEM_EVENT: u8 = 0xfa;

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            Self::STACK_FRAME => Some(FrameType::StackFrame),
            Self::BLOCK_READ => Some(FrameType::BlockRead),
            Self::STACK_ERROR => Some(FrameType::StackError),
            Self::STACK_CONTINUATION => Some(FrameType::StackContinuation),
            Self::SYSTEM_EVENT => Some(FrameType::SystemEvent),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            FrameType::StackFrame => Self::STACK_FRAME,
            FrameType::BlockRead => Self::BLOCK_READ,
            FrameType::StackError => Self::STACK_ERROR,
            FrameType::StackContinuation => Self::STACK_CONTINUATION,
            FrameType::SystemEvent => Self::SYSTEM_EVENT,
        }
    }
}

/// A decoded frame header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub flags: u8,
    pub stack: u8,
    pub ctrl_id: u8,
    /// Number of words following the header.
    pub len: u16,
}

impl FrameHeader {
    pub fn new(frame_type: FrameType, stack: u8, len: u16) -> Self {
        Self {
            frame_type,
            flags: 0,
            stack,
            ctrl_id: 0,
            len,
        }
    }

    pub fn with_continue(mut self, continues: bool) -> Self {
        if continues {
            self.flags |= flags::CONTINUE;
        } else {
            self.flags &= !flags::CONTINUE;
        }
        self
    }

    /// Returns `None` if the type byte is not a known frame type.
    pub fn decode(word: u32) -> Option<Self> {
        let frame_type = FrameType::from_byte(((word >> frame::TYPE_SHIFT) & frame::TYPE_MASK) as u8)?;
        Some(Self {
            frame_type,
            flags: ((word >> frame::FLAGS_SHIFT) & frame::FLAGS_MASK) as u8,
            stack: ((word >> frame::STACK_SHIFT) & frame::STACK_MASK) as u8,
            ctrl_id: ((word >> frame::CTRL_ID_SHIFT) & frame::CTRL_ID_MASK) as u8,
            len: (word & frame::LENGTH_MASK) as u16,
        })
    }

    pub fn encode(&self) -> u32 {
        ((self.frame_type.to_byte() as u32) << frame::TYPE_SHIFT)
            | (((self.flags as u32) & frame::FLAGS_MASK) << frame::FLAGS_SHIFT)
            | (((self.stack as u32) & frame::STACK_MASK) << frame::STACK_SHIFT)
            | (((self.ctrl_id as u32) & frame::CTRL_ID_MASK) << frame::CTRL_ID_SHIFT)
            | ((self.len as u32) & frame::LENGTH_MASK)
    }

    pub fn continues(&self) -> bool {
        self.flags & flags::CONTINUE != 0
    }

    /// Timeout, bus error or syntax error reported by the stack.
    pub fn has_error_flags(&self) -> bool {
        self.flags & (flags::TIMEOUT | flags::BUS_ERROR | flags::SYNTAX_ERROR) != 0
    }
}

/// The two header words preceding each Ethernet packet's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthPacketHeader {
    pub channel: u8,
    pub packet_number: u16,
    pub data_word_count: u16,
    pub timestamp: u32,
    pub next_header_pointer: u16,
}

impl EthPacketHeader {
    pub const HEADER_WORDS: usize = 2;
    pub const COMMAND_CHANNEL: u8 = 0;
    pub const DATA_CHANNEL: u8 = 1;
    /// No frame header starts inside this packet.
    pub const NO_HEADER_POINTER: u16 = 0xfff;
    pub const PACKET_NUMBER_MODULUS: u16 = (eth::PACKET_NUMBER_MASK + 1) as u16;

    pub fn decode(header0: u32, header1: u32) -> Self {
        Self {
            channel: ((header0 >> eth::CHANNEL_SHIFT) & eth::CHANNEL_MASK) as u8,
            packet_number: ((header0 >> eth::PACKET_NUMBER_SHIFT) & eth::PACKET_NUMBER_MASK) as u16,
            data_word_count: (header0 & eth::DATA_WORD_COUNT_MASK) as u16,
            timestamp: (header1 >> eth::TIMESTAMP_SHIFT) & eth::TIMESTAMP_MASK,
            next_header_pointer: (header1 & eth::NEXT_HEADER_POINTER_MASK) as u16,
        }
    }

    pub fn encode(&self) -> [u32; 2] {
        let header0 = (((self.channel as u32) & eth::CHANNEL_MASK) << eth::CHANNEL_SHIFT)
            | (((self.packet_number as u32) & eth::PACKET_NUMBER_MASK) << eth::PACKET_NUMBER_SHIFT)
            | ((self.data_word_count as u32) & eth::DATA_WORD_COUNT_MASK);
        let header1 = ((self.timestamp & eth::TIMESTAMP_MASK) << eth::TIMESTAMP_SHIFT)
            | ((self.next_header_pointer as u32) & eth::NEXT_HEADER_POINTER_MASK);
        [header0, header1]
    }

    pub fn has_header_pointer(&self) -> bool {
        self.next_header_pointer != Self::NO_HEADER_POINTER
    }

    /// Packets missing between `previous` and this one (wrapping 12-bit counter).
    pub fn packets_lost_since(&self, previous: u16) -> u16 {
        let expected = (previous + 1) % Self::PACKET_NUMBER_MODULUS;
        (self.packet_number + Self::PACKET_NUMBER_MODULUS - expected) % Self::PACKET_NUMBER_MODULUS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_header_fields() {
        let header = FrameHeader::decode(0xf301_2005).unwrap();
        assert_eq!(header.frame_type, FrameType::StackFrame);
        assert_eq!(header.stack, 1);
        assert_eq!(header.ctrl_id, 1);
        assert_eq!(header.len, 5);
        assert!(!header.continues());
        assert!(!header.has_error_flags());

        let flagged = FrameHeader::decode(0xf382_0003).unwrap();
        assert!(flagged.continues());
        assert!(!flagged.has_error_flags());
        assert_eq!(flagged.stack, 2);
        assert!(FrameHeader::decode(0xf319_0000).unwrap().has_error_flags());

        let cont = FrameHeader::new(FrameType::BlockRead, 0, 0x1fff).with_continue(true);
        let decoded = FrameHeader::decode(cont.encode()).unwrap();
        assert!(decoded.continues());
        assert_eq!(decoded.len, 0x1fff);
        assert_eq!(decoded.frame_type, FrameType::BlockRead);
    }

    #[test]
    fn test_unknown_frame_type() {
        assert!(FrameHeader::decode(0x1234_5678).is_none());
        assert!(FrameHeader::decode(END_OF_BUFFER_WORD).is_none());
    }

    const END_OF_BUFFER_WORD: u32 = 0x8765_4321;

    #[test]
    fn test_eth_header_fields() {
        let header = EthPacketHeader {
            channel: EthPacketHeader::DATA_CHANNEL,
            packet_number: 0xabc,
            data_word_count: 6,
            timestamp: 0x12345,
            next_header_pointer: 0,
        };
        let [h0, h1] = header.encode();
        assert_eq!(EthPacketHeader::decode(h0, h1), header);
        assert!(header.has_header_pointer());

        let none = EthPacketHeader::decode(h0, 0x0000_0fff);
        assert!(!none.has_header_pointer());
    }

    #[test]
    fn test_packet_loss_wraps() {
        let mut header = EthPacketHeader::decode(0, 0);
        header.packet_number = 0;
        assert_eq!(header.packets_lost_since(0xfff), 0);
        header.packet_number = 2;
        assert_eq!(header.packets_lost_since(0xfff), 2);
        header.packet_number = 11;
        assert_eq!(header.packets_lost_since(10), 0);
    }
}
