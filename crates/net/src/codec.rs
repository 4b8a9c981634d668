//! Message encoding and decoding with framing.
//!
//! Frame format: `[length: u32][packet type: u8][body]`, length counting the
//! body only. Bodies are postcard-encoded messages; the decoder insists that
//! the decoded variant agrees with the header's type byte.

use crate::buffer::{BufferError, BufferPool, PacketBuffer};
use crate::framing::{Frame, FrameError};
use crate::protocol::{ClientMessage, PacketType, ServerMessage};
use bytes::Bytes;
use thiserror::Error;

/// Encoding and decoding failures.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame structure is invalid.
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// Buffer write failed.
    #[error(transparent)]
    Buffer(#[from] BufferError),
    /// Body could not be (de)serialized.
    #[error("postcard: {0}")]
    Postcard(#[from] postcard::Error),
    /// Header byte names no known packet type.
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),
    /// Header byte disagrees with the decoded body.
    #[error("header says {header:?} but body decodes as {body:?}")]
    TypeMismatch {
        /// Type from the frame header.
        header: PacketType,
        /// Type of the decoded message.
        body: PacketType,
    },
}

/// Append one postcard-encoded message as a packet to `buffer`.
fn write_message<T: serde::Serialize>(
    buffer: &mut PacketBuffer,
    packet_type: PacketType,
    msg: &T,
) -> Result<(), CodecError> {
    let body = postcard::to_allocvec(msg)?;
    buffer.begin_packet(packet_type as u8)?;
    buffer.write_raw(&body);
    buffer.end_packet()?;
    Ok(())
}

/// Append a server message to an open write buffer (used for coalesced bursts).
pub fn write_server_message(
    buffer: &mut PacketBuffer,
    msg: &ServerMessage,
) -> Result<(), CodecError> {
    write_message(buffer, msg.packet_type(), msg)
}

/// Append a client message to an open write buffer.
pub fn write_client_message(
    buffer: &mut PacketBuffer,
    msg: &ClientMessage,
) -> Result<(), CodecError> {
    write_message(buffer, msg.packet_type(), msg)
}

/// Encode a client message into a standalone frame.
pub fn encode_client_message(msg: &ClientMessage) -> Result<Bytes, CodecError> {
    let mut buffer = PacketBuffer::new();
    write_client_message(&mut buffer, msg)?;
    Ok(buffer.freeze())
}

/// Encode a server message into a standalone frame.
pub fn encode_server_message(msg: &ServerMessage) -> Result<Bytes, CodecError> {
    let mut buffer = PacketBuffer::new();
    write_server_message(&mut buffer, msg)?;
    Ok(buffer.freeze())
}

/// Encode a server message using a pooled buffer.
pub fn encode_server_message_pooled(
    pool: &BufferPool,
    msg: &ServerMessage,
) -> Result<Bytes, CodecError> {
    let mut buffer = pool.take();
    write_server_message(&mut buffer, msg)?;
    Ok(buffer.freeze())
}

fn header_type(frame: &Frame) -> Result<PacketType, CodecError> {
    PacketType::try_from(frame.packet_type).map_err(CodecError::UnknownPacketType)
}

/// Decode a client message from one complete frame.
pub fn decode_client_message(frame: &Bytes) -> Result<ClientMessage, CodecError> {
    let frame = Frame::parse(frame)?;
    let header = header_type(&frame)?;
    let msg: ClientMessage = postcard::from_bytes(&frame.body)?;
    let body = msg.packet_type();
    if body != header {
        return Err(CodecError::TypeMismatch { header, body });
    }
    Ok(msg)
}

/// Decode a server message from one complete frame.
pub fn decode_server_message(frame: &Bytes) -> Result<ServerMessage, CodecError> {
    let frame = Frame::parse(frame)?;
    let header = header_type(&frame)?;
    let msg: ServerMessage = postcard::from_bytes(&frame.body)?;
    let body = msg.packet_type();
    if body != header {
        return Err(CodecError::TypeMismatch { header, body });
    }
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::Defragmenter;
    use crate::protocol::{RemoteCall, RfcKey, PROTOCOL_VERSION};

    #[test]
    fn test_client_message_roundtrip() {
        let msg = ClientMessage::Identify {
            protocol_version: PROTOCOL_VERSION,
            name: "alice".into(),
        };
        let frame = encode_client_message(&msg).expect("encode");
        assert_eq!(frame[4], PacketType::Identify as u8);
        let decoded = decode_client_message(&frame).expect("decode");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_server_message_roundtrip() {
        let msg = ServerMessage::ForwardedCall {
            channel: Some(7),
            sender: 1,
            key: RfcKey::by_name(40_000, "OnMove"),
            payload: Bytes::from_static(b"{x:1}"),
        };
        let frame = encode_server_message(&msg).expect("encode");
        assert_eq!(decode_server_message(&frame).expect("decode"), msg);
    }

    #[test]
    fn test_length_excludes_header() {
        let frame = encode_client_message(&ClientMessage::Disconnect).expect("encode");
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(frame.len(), 5 + len);
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let mut frame = encode_client_message(&ClientMessage::Ping { client_time: 5 })
            .expect("encode")
            .to_vec();
        frame[4] = PacketType::KeepAliveAck as u8;
        let err = decode_client_message(&Bytes::from(frame)).expect_err("mismatch");
        assert!(matches!(err, CodecError::TypeMismatch { .. }));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let frame = Bytes::from_static(&[0, 0, 0, 0, 250]);
        assert!(matches!(
            decode_client_message(&frame),
            Err(CodecError::UnknownPacketType(250))
        ));
    }

    #[test]
    fn test_coalesced_burst_splits_back() {
        let mut buffer = PacketBuffer::new();
        let messages = vec![
            ServerMessage::JoiningChannel {
                channel: 7,
                players: vec![],
            },
            ServerMessage::SetHost {
                channel: 7,
                player: 1,
            },
            ServerMessage::JoinComplete { channel: 7 },
        ];
        for msg in &messages {
            write_server_message(&mut buffer, msg).expect("write");
        }

        let mut defrag = Defragmenter::default();
        defrag.push(&buffer.freeze());
        let mut decoded = Vec::new();
        while let Some(frame) = defrag.next_frame().expect("frame") {
            decoded.push(decode_server_message(&frame).expect("decode"));
        }
        assert_eq!(decoded, messages);
    }

    #[test]
    fn test_pooled_encoding_matches_plain() {
        let pool = BufferPool::new(4);
        let msg = ClientMessage::ForwardToAll {
            channel: 3,
            call: RemoteCall::new(RfcKey::by_id(12, 2), vec![1, 2, 3]),
        };
        let plain = encode_client_message(&msg).expect("encode");
        let mut buffer = pool.take();
        write_client_message(&mut buffer, &msg).expect("write");
        assert_eq!(buffer.freeze(), plain);
    }
}
