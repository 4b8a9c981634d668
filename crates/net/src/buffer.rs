//! Pooled packet buffers with retroactive length patching.
//!
//! A [`PacketBuffer`] is the write side: [`PacketBuffer::begin_packet`] reserves
//! the 4-byte length slot and writes the type byte, the caller appends the body,
//! and [`PacketBuffer::end_packet`] patches the length once the body size is
//! known. Several packets may be written back to back before the buffer is
//! frozen into a single reference-counted [`Bytes`] frame, which can then be
//! queued to any number of recipients without copying.
//!
//! Switching to reading is explicit and one-way ([`PacketBuffer::begin_reading`])
//! so the two modes can never be mixed on the same buffer.

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Size of the little-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of the frame header (length prefix + packet type byte).
pub const FRAME_HEADER_SIZE: usize = LENGTH_PREFIX_SIZE + 1;

/// Default capacity reserved for a fresh write buffer.
const DEFAULT_CAPACITY: usize = 1024;

/// Errors raised while writing or reading packet buffers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// `end_packet` without a matching `begin_packet`.
    #[error("end_packet called without an open packet")]
    NoOpenPacket,
    /// `begin_packet` while another packet is still open.
    #[error("packet opened at offset {0} has not been ended")]
    PacketAlreadyOpen(usize),
    /// Body does not fit the u32 length field.
    #[error("packet body of {0} bytes does not fit the length field")]
    TooLarge(usize),
    /// A read ran past the end of the data.
    #[error("unexpected end of buffer: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes the read required.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },
    /// A string field held invalid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    /// A boolean or tag byte held an unexpected value.
    #[error("invalid tag byte {0}")]
    InvalidTag(u8),
}

/// Recycles write buffers once every frame frozen out of them has been released.
///
/// Frames are split off the pooled `BytesMut`, so the allocation stays shared
/// with every queued clone; when the last clone drops, the next `reserve` on the
/// pooled buffer reclaims the same allocation instead of allocating again.
#[derive(Clone)]
pub struct BufferPool {
    free: Arc<Mutex<Vec<BytesMut>>>,
    max_pooled: usize,
}

impl BufferPool {
    /// Create a pool retaining at most `max_pooled` idle buffers.
    pub fn new(max_pooled: usize) -> Self {
        Self {
            free: Arc::new(Mutex::new(Vec::new())),
            max_pooled,
        }
    }

    /// Take a buffer in writing mode, reusing an idle one when available.
    pub fn take(&self) -> PacketBuffer {
        let mut data = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(DEFAULT_CAPACITY));
        data.clear();
        PacketBuffer {
            data,
            open_packet: None,
            pool: Some(self.clone()),
        }
    }

    /// Number of idle buffers currently held.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    fn give_back(&self, data: BytesMut) {
        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            free.push(data);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(32)
    }
}

/// Write-mode packet buffer.
pub struct PacketBuffer {
    data: BytesMut,
    open_packet: Option<usize>,
    pool: Option<BufferPool>,
}

impl PacketBuffer {
    /// Create a standalone buffer that is not returned to any pool.
    pub fn new() -> Self {
        Self {
            data: BytesMut::with_capacity(DEFAULT_CAPACITY),
            open_packet: None,
            pool: None,
        }
    }

    /// Start a packet of the given type. The length slot is patched by `end_packet`.
    pub fn begin_packet(&mut self, packet_type: u8) -> Result<(), BufferError> {
        if let Some(offset) = self.open_packet {
            return Err(BufferError::PacketAlreadyOpen(offset));
        }
        self.open_packet = Some(self.data.len());
        self.data.put_u32_le(0);
        self.data.put_u8(packet_type);
        Ok(())
    }

    /// Close the open packet, returning its body length.
    pub fn end_packet(&mut self) -> Result<usize, BufferError> {
        let start = self.open_packet.take().ok_or(BufferError::NoOpenPacket)?;
        let body = self.data.len() - start - FRAME_HEADER_SIZE;
        let len = u32::try_from(body).map_err(|_| BufferError::TooLarge(body))?;
        self.data[start..start + LENGTH_PREFIX_SIZE].copy_from_slice(&len.to_le_bytes());
        Ok(body)
    }

    /// Whether a packet has been begun but not ended.
    pub fn has_open_packet(&self) -> bool {
        self.open_packet.is_some()
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Split the written bytes off as a shareable frame, leaving the buffer empty.
    pub fn freeze(&mut self) -> Bytes {
        debug_assert!(self.open_packet.is_none(), "freezing with an open packet");
        self.data.split().freeze()
    }

    /// Switch to reading mode over everything written so far.
    pub fn begin_reading(mut self) -> PacketReader {
        PacketReader::new(self.freeze())
    }

    /// Append a single byte.
    pub fn write_u8(&mut self, value: u8) {
        self.data.put_u8(value);
    }

    /// Append a little-endian u16.
    pub fn write_u16(&mut self, value: u16) {
        self.data.put_u16_le(value);
    }

    /// Append a little-endian u32.
    pub fn write_u32(&mut self, value: u32) {
        self.data.put_u32_le(value);
    }

    /// Append a little-endian u64.
    pub fn write_u64(&mut self, value: u64) {
        self.data.put_u64_le(value);
    }

    /// Append a boolean as one byte.
    pub fn write_bool(&mut self, value: bool) {
        self.data.put_u8(u8::from(value));
    }

    /// Append raw bytes with no length prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Append a u32-length-prefixed blob.
    pub fn write_blob(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        let len = u32::try_from(bytes.len()).map_err(|_| BufferError::TooLarge(bytes.len()))?;
        self.data.put_u32_le(len);
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Append a u32-length-prefixed UTF-8 string.
    pub fn write_str(&mut self, value: &str) -> Result<(), BufferError> {
        self.write_blob(value.as_bytes())
    }

    /// Append a presence byte followed by the string when present.
    pub fn write_opt_str(&mut self, value: Option<&str>) -> Result<(), BufferError> {
        match value {
            Some(value) => {
                self.write_bool(true);
                self.write_str(value)
            }
            None => {
                self.write_bool(false);
                Ok(())
            }
        }
    }
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.give_back(std::mem::take(&mut self.data));
        }
    }
}

/// Read-mode cursor over a frozen buffer. Blob reads return zero-copy slices.
#[derive(Debug, Clone)]
pub struct PacketReader {
    data: Bytes,
    pos: usize,
}

impl PacketReader {
    /// Start reading `data` from the beginning.
    pub fn new(data: Bytes) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Current read offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Switch back to writing mode with a fresh, empty buffer.
    pub fn begin_writing(self) -> PacketBuffer {
        PacketBuffer::new()
    }

    fn take(&mut self, needed: usize) -> Result<Bytes, BufferError> {
        if self.remaining() < needed {
            return Err(BufferError::Truncated {
                needed,
                remaining: self.remaining(),
            });
        }
        let slice = self.data.slice(self.pos..self.pos + needed);
        self.pos += needed;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], BufferError> {
        let bytes = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&bytes);
        Ok(out)
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> Result<u8, BufferError> {
        Ok(self.take_array::<1>()?[0])
    }

    /// Read a little-endian u16.
    pub fn read_u16(&mut self) -> Result<u16, BufferError> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    /// Read a little-endian u32.
    pub fn read_u32(&mut self) -> Result<u32, BufferError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    /// Read a little-endian u64.
    pub fn read_u64(&mut self) -> Result<u64, BufferError> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    /// Read a boolean byte (0 or 1).
    pub fn read_bool(&mut self) -> Result<bool, BufferError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(BufferError::InvalidTag(other)),
        }
    }

    /// Read `len` raw bytes.
    pub fn read_raw(&mut self, len: usize) -> Result<Bytes, BufferError> {
        self.take(len)
    }

    /// Read a u32-length-prefixed blob.
    pub fn read_blob(&mut self) -> Result<Bytes, BufferError> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    /// Read a u32-length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, BufferError> {
        let bytes = self.read_blob()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| BufferError::InvalidUtf8)
    }

    /// Read an optional string written by [`PacketBuffer::write_opt_str`].
    pub fn read_opt_string(&mut self) -> Result<Option<String>, BufferError> {
        if self.read_bool()? {
            Ok(Some(self.read_string()?))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_packet_patches_length() {
        let mut buffer = PacketBuffer::new();
        buffer.begin_packet(7).expect("begin");
        buffer.write_raw(b"hello");
        let body = buffer.end_packet().expect("end");
        assert_eq!(body, 5);

        let frame = buffer.freeze();
        assert_eq!(&frame[..4], &5u32.to_le_bytes());
        assert_eq!(frame[4], 7);
        assert_eq!(&frame[5..], b"hello");
    }

    #[test]
    fn test_empty_body() {
        let mut buffer = PacketBuffer::new();
        buffer.begin_packet(1).expect("begin");
        assert_eq!(buffer.end_packet().expect("end"), 0);
        assert_eq!(buffer.freeze().as_ref(), &[0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_back_to_back_packets() {
        let mut buffer = PacketBuffer::new();
        for tag in 0..3u8 {
            buffer.begin_packet(tag).expect("begin");
            buffer.write_u32(u32::from(tag) * 10);
            buffer.end_packet().expect("end");
        }
        assert_eq!(buffer.len(), 3 * (FRAME_HEADER_SIZE + 4));
    }

    #[test]
    fn test_nested_begin_rejected() {
        let mut buffer = PacketBuffer::new();
        buffer.begin_packet(1).expect("begin");
        assert_eq!(buffer.begin_packet(2), Err(BufferError::PacketAlreadyOpen(0)));
    }

    #[test]
    fn test_end_without_begin_rejected() {
        let mut buffer = PacketBuffer::new();
        assert_eq!(buffer.end_packet(), Err(BufferError::NoOpenPacket));
    }

    #[test]
    fn test_reader_roundtrip_fields() {
        let mut buffer = PacketBuffer::new();
        buffer.write_u8(9);
        buffer.write_u16(513);
        buffer.write_u32(0xDEAD_BEEF);
        buffer.write_u64(u64::MAX - 1);
        buffer.write_bool(true);
        buffer.write_str("level-1").expect("str");
        buffer.write_opt_str(None).expect("opt");
        buffer.write_opt_str(Some("pw")).expect("opt");
        buffer.write_blob(&[1, 2, 3]).expect("blob");

        let mut reader = buffer.begin_reading();
        assert_eq!(reader.read_u8().expect("u8"), 9);
        assert_eq!(reader.read_u16().expect("u16"), 513);
        assert_eq!(reader.read_u32().expect("u32"), 0xDEAD_BEEF);
        assert_eq!(reader.read_u64().expect("u64"), u64::MAX - 1);
        assert!(reader.read_bool().expect("bool"));
        assert_eq!(reader.read_string().expect("string"), "level-1");
        assert_eq!(reader.read_opt_string().expect("opt"), None);
        assert_eq!(reader.read_opt_string().expect("opt").as_deref(), Some("pw"));
        assert_eq!(reader.read_blob().expect("blob").as_ref(), &[1, 2, 3]);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_reader_truncation() {
        let mut reader = PacketReader::new(Bytes::from_static(&[1, 2]));
        assert_eq!(
            reader.read_u32(),
            Err(BufferError::Truncated {
                needed: 4,
                remaining: 2
            })
        );
    }

    #[test]
    fn test_pool_recycles_buffers() {
        let pool = BufferPool::new(2);
        {
            let mut buffer = pool.take();
            buffer.begin_packet(3).expect("begin");
            buffer.end_packet().expect("end");
            let frame = buffer.freeze();
            let shared = frame.clone();
            assert_eq!(frame, shared);
        }
        assert_eq!(pool.idle(), 1);

        let buffer = pool.take();
        assert!(buffer.is_empty());
        assert_eq!(pool.idle(), 0);
    }
}
