//! Socket-free harness: feeds encoded frames into a [`Broker`] and decodes
//! what it writes back.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tether_net::{
    decode_server_message, encode_client_message, ClientMessage, ConnectionId, Defragmenter,
    PlayerId, ServerMessage, PROTOCOL_VERSION,
};
use tether_server::{Broker, BrokerConfig, BrokerServices, Outbound};

pub struct Harness {
    pub broker: Broker,
    pub now: Instant,
    inbox: HashMap<ConnectionId, Vec<ServerMessage>>,
    datagrams: Vec<(SocketAddr, ServerMessage)>,
    closed: Vec<ConnectionId>,
    next_port: u16,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(BrokerConfig::default(), BrokerServices::default())
    }

    pub fn with(config: BrokerConfig, services: BrokerServices) -> Self {
        Self {
            broker: Broker::new(config, services),
            now: Instant::now(),
            inbox: HashMap::new(),
            datagrams: Vec::new(),
            closed: Vec::new(),
            next_port: 40_000,
        }
    }

    /// Accept a socket and complete the handshake.
    pub fn connect(&mut self, name: &str) -> (ConnectionId, PlayerId) {
        self.next_port += 1;
        let addr = SocketAddr::from(([127, 0, 0, 1], self.next_port));
        let conn = self.broker.accept(addr, self.now).expect("accept");
        self.send(
            conn,
            ClientMessage::Identify {
                protocol_version: PROTOCOL_VERSION,
                name: name.to_string(),
            },
        );
        self.tick();
        let player = self
            .take(conn)
            .into_iter()
            .find_map(|msg| match msg {
                ServerMessage::IdAssigned { player_id, .. } => Some(player_id),
                _ => None,
            })
            .expect("IdAssigned");
        (conn, player)
    }

    pub fn send(&mut self, conn: ConnectionId, msg: ClientMessage) {
        let frame = encode_client_message(&msg).expect("encode");
        self.broker.enqueue_inbound(conn, frame);
    }

    pub fn send_datagram(&mut self, addr: SocketAddr, msg: ClientMessage) {
        let frame = encode_client_message(&msg).expect("encode");
        self.broker.enqueue_datagram(addr, frame);
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    /// Run one tick and collect its output. Queued store work runs inline.
    pub fn tick(&mut self) {
        self.broker.tick(self.now);
        let io = self.broker.take_io();
        for send in io.sends {
            match send {
                Outbound::Stream { conn, frame } => {
                    let mut defrag = Defragmenter::default();
                    defrag.push(&frame);
                    while let Some(frame) = defrag.next_frame().expect("frame") {
                        let msg = decode_server_message(&frame).expect("decode");
                        self.inbox.entry(conn).or_default().push(msg);
                    }
                }
                Outbound::Datagram { addr, frame } => {
                    let msg = decode_server_message(&frame).expect("decode");
                    self.datagrams.push((addr, msg));
                }
            }
        }
        self.closed.extend(io.closes);
        if let Some(files) = self.broker.files() {
            for request in io.stores {
                if let Some((conn, msg)) = request.execute(files.as_ref()) {
                    self.inbox.entry(conn).or_default().push(msg);
                }
            }
        }
    }

    /// Messages delivered to `conn` over the stream since the last take.
    pub fn take(&mut self, conn: ConnectionId) -> Vec<ServerMessage> {
        self.inbox.remove(&conn).unwrap_or_default()
    }

    pub fn take_datagrams(&mut self) -> Vec<(SocketAddr, ServerMessage)> {
        std::mem::take(&mut self.datagrams)
    }

    pub fn is_closed(&self, conn: ConnectionId) -> bool {
        self.closed.contains(&conn)
    }

    pub fn join(&mut self, conn: ConnectionId, channel: u32, persistent: bool) -> Vec<ServerMessage> {
        self.send(
            conn,
            ClientMessage::JoinChannel {
                channel: Some(channel),
                password: None,
                level: None,
                persistent,
                player_limit: 0,
            },
        );
        self.tick();
        self.take(conn)
    }

    /// Verify `conn` as admin using a seeded password.
    pub fn make_admin(&mut self, conn: ConnectionId, password: &str) {
        self.send(
            conn,
            ClientMessage::VerifyAdmin {
                password: password.to_string(),
            },
        );
        self.tick();
        self.take(conn);
    }
}

pub fn admin_config(password: &str) -> BrokerConfig {
    BrokerConfig {
        admin_passwords: vec![password.to_string()],
        ..BrokerConfig::default()
    }
}

/// The object id announced by the first `ObjectCreated` in `msgs`.
pub fn created_id(msgs: &[ServerMessage]) -> u32 {
    msgs.iter()
        .find_map(|msg| match msg {
            ServerMessage::ObjectCreated { object_id, .. } => Some(*object_id),
            _ => None,
        })
        .expect("ObjectCreated")
}
