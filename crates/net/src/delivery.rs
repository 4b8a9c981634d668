//! Reliable / best-effort delivery selection.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Delivery class requested by the sender of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Delivery {
    /// Ordered, guaranteed delivery over the stream socket.
    Reliable = 0,
    /// May travel as a datagram when the peer's UDP path is confirmed.
    BestEffort = 1,
}

impl Delivery {
    /// Check if this delivery class demands the reliable path.
    pub fn is_reliable(&self) -> bool {
        matches!(self, Delivery::Reliable)
    }
}

impl TryFrom<u8> for Delivery {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(Delivery::Reliable),
            1 => Ok(Delivery::BestEffort),
            other => Err(other),
        }
    }
}

/// Concrete path a frame takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Queue on the stream socket.
    Stream,
    /// Send as a single datagram to this endpoint.
    Datagram(SocketAddr),
}

/// Pick the transport for one frame.
///
/// Datagrams are used only when the caller allows best-effort delivery, the
/// frame fits `max_datagram`, and `udp` holds a confirmed endpoint. Anything
/// else, including oversized best-effort frames, goes over the stream.
pub fn select_transport(
    delivery: Delivery,
    frame_len: usize,
    max_datagram: usize,
    udp: Option<SocketAddr>,
) -> Transport {
    match (delivery, udp) {
        (Delivery::BestEffort, Some(addr)) if frame_len <= max_datagram => {
            Transport::Datagram(addr)
        }
        _ => Transport::Stream,
    }
}
