//! Byte cursors for fixed-layout datagrams
//!
//! ACN/E1.31 fields are big-endian (network order).

/// Largest E1.31 data packet: 126 header bytes plus 512 slots
pub const MAX_DATAGRAM_SIZE: usize = 638;

/// Frame builder for constructing datagrams
pub struct FrameBuilder {
    buffer: Vec<u8>,
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MAX_DATAGRAM_SIZE),
        }
    }

    /// Write raw bytes
    pub fn write(mut self, data: &[u8]) -> Self {
        self.buffer.extend_from_slice(data);
        self
    }

    pub fn write_u8(mut self, value: u8) -> Self {
        self.buffer.push(value);
        self
    }

    /// Write a u16 (big-endian)
    pub fn write_u16(mut self, value: u16) -> Self {
        self.buffer.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Write a u32 (big-endian)
    pub fn write_u32(mut self, value: u32) -> Self {
        self.buffer.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Write `value` as a fixed-width, zero-padded field (truncating if longer)
    pub fn write_padded(mut self, value: &[u8], width: usize) -> Self {
        let take = value.len().min(width);
        self.buffer.extend_from_slice(&value[..take]);
        self.buffer.resize(self.buffer.len() + (width - take), 0);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.buffer
    }
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame reader for parsing datagrams. Every read is bounds-checked.
pub struct FrameReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Read n bytes
    pub fn read(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.position.checked_add(n)?;
        if end > self.data.len() {
            return None;
        }
        let slice = &self.data[self.position..end];
        self.position = end;
        Some(slice)
    }

    /// Read exactly N bytes into an array
    pub fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.read(N).and_then(|b| b.try_into().ok())
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.read(1).map(|b| b[0])
    }

    /// Read a u16 (big-endian)
    pub fn read_u16(&mut self) -> Option<u16> {
        self.read_array::<2>().map(u16::from_be_bytes)
    }

    /// Read a u32 (big-endian)
    pub fn read_u32(&mut self) -> Option<u32> {
        self.read_array::<4>().map(u32::from_be_bytes)
    }

    /// Get remaining bytes
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.position..]
    }
}
