//! Error types for the broker.

use tether_net::{BufferError, CodecError, PacketType, PlayerId};
use thiserror::Error;

/// Protocol violations. Every variant ends the offending connection.
#[derive(Debug, Error)]
pub enum Violation {
    /// Client and server protocol versions differ.
    #[error("protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        /// Version sent by the client.
        client: u16,
        /// Version spoken by the server.
        server: u16,
    },
    /// First packet after accept was not a handshake.
    #[error("expected Identify, got {0:?}")]
    NotIdentified(PacketType),
    /// Second handshake on a verified connection.
    #[error("handshake repeated")]
    AlreadyIdentified,
    /// Frame or body could not be decoded.
    #[error("malformed packet: {0}")]
    Malformed(#[from] CodecError),
    /// Field bounds check failed.
    #[error("invalid packet: {0}")]
    Invalid(&'static str),
    /// Sender id in a relay request is not the requester's.
    #[error("sender id {claimed} does not match player {actual}")]
    SenderMismatch {
        /// Id carried in the request.
        claimed: PlayerId,
        /// Requester's real id.
        actual: PlayerId,
    },
    /// Privileged request without the admin flag.
    #[error("{0:?} requires admin")]
    Unauthorized(PacketType),
    /// Wrong admin password.
    #[error("admin verification failed")]
    AdminPasswordRejected,
    /// Peer matches a ban entry.
    #[error("banned")]
    Banned,
    /// File name escapes the data directory.
    #[error("unsafe file name {0:?}")]
    UnsafeFileName(String),
    /// File name belongs to the broker's own admin, ban or snapshot files.
    #[error("reserved file name {0:?}")]
    ReservedFileName(String),
    /// Too many rate-limited broadcasts.
    #[error("broadcast spam")]
    Spam,
}

/// Channel block or snapshot (de)serialization failures.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Truncated or malformed field.
    #[error(transparent)]
    Buffer(#[from] BufferError),
    /// Snapshot does not start with the expected magic.
    #[error("bad snapshot magic {0:#010x}")]
    BadMagic(u32),
    /// Format version not understood.
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),
    /// Snapshot body checksum mismatch.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    Checksum {
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },
    /// Unknown object persistence byte.
    #[error("invalid object persistence {0}")]
    InvalidPersistence(u8),
    /// Bytes left over after the last channel.
    #[error("{0} trailing bytes after snapshot")]
    TrailingBytes(usize),
    /// Snapshot shorter than its header or declared payload.
    #[error("snapshot truncated at {0} bytes")]
    Truncated(usize),
    /// Stored object id outside the dynamic range.
    #[error("object id {0} outside the dynamic range")]
    InvalidObjectId(u32),
}

/// File store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Name is absolute, empty or escapes the root.
    #[error("unsafe file name {0:?}")]
    UnsafeName(String),
    /// Underlying filesystem error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
