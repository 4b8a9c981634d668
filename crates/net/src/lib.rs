#![warn(missing_docs)]
//! Wire layer of the session broker: packet buffers, stream framing, the
//! packet catalog and codec, connection state and socket endpoints.

pub mod buffer;
pub mod codec;
pub mod connection;
pub mod delivery;
pub mod framing;
pub mod protocol;
mod transport;

pub use buffer::{BufferError, BufferPool, PacketBuffer, PacketReader, FRAME_HEADER_SIZE};
pub use codec::{
    decode_client_message, decode_server_message, encode_client_message, encode_server_message,
    encode_server_message_pooled, write_client_message, write_server_message, CodecError,
};
pub use connection::{
    dispatch_call, BroadcastVerdict, ClientConnection, ConnectionId, ConnectionState,
    PeerConnection, RemoteCallHandler,
};
pub use delivery::{select_transport, Delivery, Transport};
pub use framing::{Defragmenter, Frame, FrameError, DEFAULT_MAX_PACKET_SIZE};
pub use protocol::*;
pub use transport::ServerEndpoint;
