//! Stream defragmentation.
//!
//! Reliable sockets deliver arbitrary slices of the byte stream. The
//! [`Defragmenter`] accumulates them in a rolling buffer and yields complete
//! `[u32 length][u8 type][body]` frames as soon as the whole frame is present.

use crate::buffer::{FRAME_HEADER_SIZE, LENGTH_PREFIX_SIZE};
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Default ceiling on a single packet body (16 MiB).
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 16 * 1024 * 1024;

/// Framing failures. Every variant is a protocol violation for the sender.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The advertised body length exceeds the configured maximum.
    #[error("packet length {len} exceeds maximum {max}")]
    Oversized {
        /// Advertised body length.
        len: u32,
        /// Configured maximum.
        max: u32,
    },
    /// Fewer bytes than a frame header.
    #[error("frame of {0} bytes is shorter than the header")]
    Truncated(usize),
    /// The length field disagrees with the frame size.
    #[error("length field says {declared} body bytes but frame carries {actual}")]
    LengthMismatch {
        /// Body length from the header.
        declared: u32,
        /// Body bytes actually present.
        actual: usize,
    },
}

/// Rolling inbound buffer that slices complete frames out of a byte stream.
pub struct Defragmenter {
    buffer: BytesMut,
    max_body: u32,
}

impl Defragmenter {
    /// Create a defragmenter enforcing `max_body` bytes per packet body.
    pub fn new(max_body: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_body,
        }
    }

    /// Append bytes received from the socket.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Unconsumed bytes held.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Return the next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        if self.buffer.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&self.buffer[..LENGTH_PREFIX_SIZE]);
        let len = u32::from_le_bytes(prefix);
        if len > self.max_body {
            return Err(FrameError::Oversized {
                len,
                max: self.max_body,
            });
        }

        let total = FRAME_HEADER_SIZE + len as usize;
        if self.buffer.len() < total {
            self.buffer.reserve(total - self.buffer.len());
            return Ok(None);
        }
        Ok(Some(self.buffer.split_to(total).freeze()))
    }
}

impl Default for Defragmenter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

/// A validated frame split into its type byte and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw packet type byte.
    pub packet_type: u8,
    /// Body bytes (shares the frame allocation).
    pub body: Bytes,
}

impl Frame {
    /// Validate a single complete frame (e.g. one datagram).
    pub fn parse(frame: &Bytes) -> Result<Self, FrameError> {
        if frame.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::Truncated(frame.len()));
        }
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&frame[..LENGTH_PREFIX_SIZE]);
        let declared = u32::from_le_bytes(prefix);
        let actual = frame.len() - FRAME_HEADER_SIZE;
        if declared as usize != actual {
            return Err(FrameError::LengthMismatch { declared, actual });
        }
        Ok(Self {
            packet_type: frame[LENGTH_PREFIX_SIZE],
            body: frame.slice(FRAME_HEADER_SIZE..),
        })
    }
}
