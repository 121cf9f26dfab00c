//! Owned acquisition byte buffers.
//!
//! A [`RawBuffer`] is allocated once when the pool is created and then moves
//! between the free queue, the readout thread and the filled queue for the
//! lifetime of the pool. All word accessors are little-endian, matching both
//! the controller wire formats and the listfile layout.

/// Format tag of the bytes held by a [`RawBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferFormat {
    /// Legacy VMUSB 16-bit buffer format.
    Vmusb,
    /// MVLC frames read over USB (frames back to back).
    MvlcUsb,
    /// MVLC frames read over Ethernet (packet-prefixed).
    MvlcEth,
    /// Normalized listfile sections.
    #[default]
    Listfile,
}

impl std::fmt::Display for BufferFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            BufferFormat::Vmusb => "vmusb",
            BufferFormat::MvlcUsb => "mvlc_usb",
            BufferFormat::MvlcEth => "mvlc_eth",
            BufferFormat::Listfile => "listfile",
        };
        write!(f, "{}", label)
    }
}

/// Fixed-capacity byte buffer used to move data between pipeline stages.
///
/// `used` tracks how many leading bytes hold valid data; the allocation itself
/// never grows after construction.
#[derive(Debug)]
pub struct RawBuffer {
    id: usize,
    data: Box<[u8]>,
    used: usize,
    format: BufferFormat,
    buffer_number: u64,
}

impl RawBuffer {
    /// Allocate a zeroed buffer. Only the pool and the readout worker's local
    /// buffers call this; everything else reuses pooled buffers.
    pub fn new(id: usize, capacity: usize) -> Self {
        Self {
            id,
            data: vec![0u8; capacity].into_boxed_slice(),
            used: 0,
            format: BufferFormat::default(),
            buffer_number: 0,
        }
    }

    /// Stable identity of this buffer within its pool.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Bytes still available for appending.
    pub fn free_space(&self) -> usize {
        self.data.len() - self.used
    }

    pub fn format(&self) -> BufferFormat {
        self.format
    }

    pub fn set_format(&mut self, format: BufferFormat) {
        self.format = format;
    }

    /// Sequence number assigned by the readout worker.
    pub fn buffer_number(&self) -> u64 {
        self.buffer_number
    }

    pub fn set_buffer_number(&mut self, number: u64) {
        self.buffer_number = number;
    }

    /// Valid bytes (`..used`).
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// The whole allocation, for filling by a hardware read followed by
    /// [`RawBuffer::set_used`].
    pub fn as_mut_capacity(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Set the number of valid bytes.
    ///
    /// # Panics
    ///
    /// Panics if `used` exceeds the buffer capacity.
    pub fn set_used(&mut self, used: usize) {
        assert!(
            used <= self.data.len(),
            "set_used({}) exceeds buffer capacity ({})",
            used,
            self.data.len()
        );
        self.used = used;
    }

    /// Reset to empty. Contents are not zeroed.
    pub fn clear(&mut self) {
        self.used = 0;
        self.buffer_number = 0;
    }

    /// Roll back to a previous length, discarding anything appended since.
    pub fn truncate(&mut self, used: usize) {
        if used < self.used {
            self.used = used;
        }
    }

    /// Replace the contents with `src`. Returns `false` if `src` does not fit.
    pub fn copy_from_slice(&mut self, src: &[u8]) -> bool {
        if src.len() > self.data.len() {
            return false;
        }
        self.data[..src.len()].copy_from_slice(src);
        self.used = src.len();
        true
    }

    /// Append raw bytes. Returns `false` (and appends nothing) if they do not fit.
    pub fn extend_from_slice(&mut self, src: &[u8]) -> bool {
        if src.len() > self.free_space() {
            return false;
        }
        self.data[self.used..self.used + src.len()].copy_from_slice(src);
        self.used += src.len();
        true
    }

    /// Append one little-endian 32-bit word.
    pub fn push_u32(&mut self, value: u32) -> bool {
        self.extend_from_slice(&value.to_le_bytes())
    }

    /// Overwrite a previously written 32-bit word at `offset` (back-patching
    /// section headers). Returns `false` if the word lies outside `..used`.
    pub fn put_u32_at(&mut self, offset: usize, value: u32) -> bool {
        if offset + 4 > self.used {
            return false;
        }
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        true
    }

    /// Read a little-endian 32-bit word from the valid region.
    pub fn u32_at(&self, offset: usize) -> Option<u32> {
        let bytes = self.as_slice().get(offset..offset + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a little-endian 16-bit word from the valid region.
    pub fn u16_at(&self, offset: usize) -> Option<u16> {
        let bytes = self.as_slice().get(offset..offset + 2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Number of complete 32-bit words in the valid region.
    pub fn word_count(&self) -> usize {
        self.used / 4
    }
}
