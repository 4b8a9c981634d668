//! Session broker: the tables of peers and channels plus the dispatch tick.
//!
//! The broker never touches a socket. Socket tasks push complete frames in
//! with [`Broker::enqueue_inbound`] / [`Broker::enqueue_datagram`], the tick
//! thread calls [`Broker::tick`], and everything the tick wants written comes
//! back out through [`Broker::take_io`]. That keeps all protocol logic
//! deterministic and testable without a runtime.

use crate::admin::EntryList;
use crate::channel::{Channel, ChannelSettings, RfcOutcome};
use crate::config::BrokerConfig;
use crate::directory::{DirectoryLink, NullDirectory, ServerAdvertisement};
use crate::error::{PersistError, StoreError, Violation};
use crate::persist::{decode_snapshot, encode_snapshot};
use crate::store::{is_reserved_name, validate_name, FileStore, StoreRequest};
use anyhow::Context;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_net::{
    decode_client_message, encode_server_message_pooled, write_server_message, BroadcastVerdict,
    BufferPool, ChannelId, ClientMessage, ConnectionId, DataTree, Delivery, JoinRejection,
    ObjectId, ObjectPersistence, PeerConnection, PlayerId, PlayerInfo, PlayerRef, RemoteCall,
    ServerMessage, Transport, PROTOCOL_VERSION,
};
use tracing::{debug, error, info, warn};

/// Store name of the server snapshot.
pub const SNAPSHOT_FILE: &str = "server.dat";

/// External collaborators handed to the broker.
#[derive(Clone)]
pub struct BrokerServices {
    /// Blob storage; `None` disables file packets and snapshots.
    pub files: Option<Arc<dyn FileStore>>,
    /// Directory link notified of player count changes.
    pub directory: Arc<dyn DirectoryLink>,
}

impl Default for BrokerServices {
    fn default() -> Self {
        Self {
            files: None,
            directory: Arc::new(NullDirectory),
        }
    }
}

impl BrokerServices {
    /// Services backed by `files`.
    pub fn with_files(files: Arc<dyn FileStore>) -> Self {
        Self {
            files: Some(files),
            ..Self::default()
        }
    }
}

/// One frame leaving the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Queue on a connection's stream socket.
    Stream {
        /// Target connection.
        conn: ConnectionId,
        /// One or more packets.
        frame: Bytes,
    },
    /// Send as one datagram.
    Datagram {
        /// Target endpoint.
        addr: SocketAddr,
        /// Exactly one packet.
        frame: Bytes,
    },
}

/// Output of one or more ticks. Sends precede closes.
#[derive(Debug, Default)]
pub struct IoBatch {
    /// Frames to write, in order.
    pub sends: Vec<Outbound>,
    /// Connections to close once their queued frames are flushed.
    pub closes: Vec<ConnectionId>,
    /// File store work, to be run in order away from the tick.
    pub stores: Vec<StoreRequest>,
}

impl IoBatch {
    /// Whether there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.sends.is_empty() && self.closes.is_empty() && self.stores.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayScope {
    All,
    Others,
    AllSaved,
    OthersSaved,
    Host,
}

impl RelayScope {
    fn saved(self) -> bool {
        matches!(self, RelayScope::AllSaved | RelayScope::OthersSaved)
    }
}

struct JoinRequest {
    channel: Option<ChannelId>,
    password: Option<String>,
    level: Option<String>,
    persistent: bool,
    player_limit: u16,
}

/// All broker state. Guarded by one coarse lock in the runtime.
pub struct Broker {
    config: BrokerConfig,
    services: BrokerServices,
    started: Instant,
    pool: BufferPool,
    rng: StdRng,
    next_conn_id: ConnectionId,
    next_player_id: PlayerId,
    peers: BTreeMap<ConnectionId, PeerConnection>,
    players: HashMap<PlayerId, ConnectionId>,
    udp_routes: HashMap<SocketAddr, ConnectionId>,
    channels: BTreeMap<ChannelId, Channel>,
    datagrams: VecDeque<(SocketAddr, Bytes)>,
    lost: Vec<(ConnectionId, String)>,
    admins: EntryList,
    bans: EntryList,
    server_data: DataTree,
    io: IoBatch,
    local_addr: Option<SocketAddr>,
    udp_port: u16,
    last_keepalive: Instant,
    last_autosave: Instant,
    advertised_players: Option<usize>,
}

impl Broker {
    /// Create a broker. Admin and ban lists are loaded from the file store.
    pub fn new(config: BrokerConfig, services: BrokerServices) -> Self {
        let now = Instant::now();
        let mut admins = EntryList::admins();
        admins.replace(&config.admin_passwords);
        let mut bans = EntryList::bans();
        if let Some(files) = &services.files {
            if let Err(err) = admins.load(files.as_ref()) {
                warn!(error = %err, "Failed to load admin list");
            }
            if let Err(err) = bans.load(files.as_ref()) {
                warn!(error = %err, "Failed to load ban list");
            }
        }

        Self {
            config,
            services,
            started: now,
            pool: BufferPool::default(),
            rng: StdRng::from_entropy(),
            next_conn_id: 1,
            next_player_id: 1,
            peers: BTreeMap::new(),
            players: HashMap::new(),
            udp_routes: HashMap::new(),
            channels: BTreeMap::new(),
            datagrams: VecDeque::new(),
            lost: Vec::new(),
            admins,
            bans,
            server_data: DataTree::default(),
            io: IoBatch::default(),
            local_addr: None,
            udp_port: 0,
            last_keepalive: now,
            last_autosave: now,
            advertised_players: None,
        }
    }

    /// Record the bound addresses (advertised and answered to `SetUdp`).
    pub fn set_local_addrs(&mut self, tcp: SocketAddr, udp: Option<SocketAddr>) {
        self.local_addr = Some(tcp);
        self.udp_port = udp.map(|addr| addr.port()).unwrap_or(0);
    }

    /// Active configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Handshaken players.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Open connections, handshaken or not.
    pub fn connection_count(&self) -> usize {
        self.peers.len()
    }

    /// Look up a channel.
    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    /// Look up a channel mutably (wakes nothing by itself).
    pub fn channel_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.channels.get_mut(&id)
    }

    /// Ids of every live channel, ascending.
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels.keys().copied().collect()
    }

    /// Look up a connection.
    pub fn peer(&self, conn: ConnectionId) -> Option<&PeerConnection> {
        self.peers.get(&conn)
    }

    /// Look up a connection by player id.
    pub fn peer_for_player(&self, player: PlayerId) -> Option<&PeerConnection> {
        self.players.get(&player).and_then(|conn| self.peers.get(conn))
    }

    /// Admin password list.
    pub fn admins(&self) -> &EntryList {
        &self.admins
    }

    /// Ban list.
    pub fn bans(&self) -> &EntryList {
        &self.bans
    }

    fn server_time(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.started).as_millis() as u64
    }

    // ---------------------------------------------------------------------
    // Socket-facing entry points
    // ---------------------------------------------------------------------

    /// Register an accepted socket. Banned addresses get no peer state.
    pub fn accept(&mut self, addr: SocketAddr, now: Instant) -> Result<ConnectionId, Violation> {
        if self.bans.contains(&addr.ip().to_string()) {
            info!(%addr, "Rejected banned address");
            return Err(Violation::Banned);
        }
        let conn = self.next_conn_id;
        self.next_conn_id += 1;
        self.peers.insert(conn, PeerConnection::new(conn, addr, now));
        debug!(conn, %addr, "Connection accepted");
        Ok(conn)
    }

    /// Queue a complete frame read from a connection's stream.
    pub fn enqueue_inbound(&mut self, conn: ConnectionId, frame: Bytes) {
        if let Some(peer) = self.peers.get_mut(&conn) {
            peer.push_inbound(frame);
        }
    }

    /// Queue a datagram.
    pub fn enqueue_datagram(&mut self, addr: SocketAddr, frame: Bytes) {
        self.datagrams.push_back((addr, frame));
    }

    /// Report a dead socket; the leave cascade runs on the next tick.
    pub fn connection_lost(&mut self, conn: ConnectionId, reason: impl Into<String>) {
        if self.peers.contains_key(&conn) {
            self.lost.push((conn, reason.into()));
        }
    }

    /// Everything queued for the sockets since the last call.
    pub fn take_io(&mut self) -> IoBatch {
        std::mem::take(&mut self.io)
    }

    // ---------------------------------------------------------------------
    // Tick
    // ---------------------------------------------------------------------

    /// Run one tick. Returns true if any work was done.
    pub fn tick(&mut self, now: Instant) -> bool {
        let mut busy = false;

        for (conn, reason) in std::mem::take(&mut self.lost) {
            self.disconnect(conn, &reason);
            busy = true;
        }

        // Same per-peer allowance as the streams; the rest waits a tick.
        let datagram_budget = self.config.max_packets_per_tick * self.peers.len().max(1);
        for _ in 0..datagram_budget {
            let Some((addr, frame)) = self.datagrams.pop_front() else {
                break;
            };
            self.handle_datagram(addr, frame, now);
            busy = true;
        }

        let conns: Vec<ConnectionId> = self.peers.keys().copied().collect();
        for conn in conns {
            for _ in 0..self.config.max_packets_per_tick {
                let Some(frame) = self.peers.get_mut(&conn).and_then(|p| p.pop_inbound()) else {
                    break;
                };
                self.handle_frame(conn, frame, now);
                busy = true;
            }
        }

        let handshake = self.config.handshake_timeout();
        let inactivity = self.config.inactivity_timeout();
        let expired: Vec<ConnectionId> = self
            .peers
            .values()
            .filter(|peer| peer.timed_out(now, handshake, inactivity))
            .map(|peer| peer.id())
            .collect();
        for conn in expired {
            self.disconnect(conn, "timed out");
            busy = true;
        }

        if now.saturating_duration_since(self.last_keepalive) >= self.config.keepalive_interval() {
            self.last_keepalive = now;
            self.send_keepalives(now);
        }

        for channel in self.channels.values_mut() {
            channel.prune_forwards(now);
        }

        if let Some(interval) = self.config.autosave_interval() {
            if now.saturating_duration_since(self.last_autosave) >= interval {
                self.last_autosave = now;
                self.queue_snapshot();
            }
        }

        busy || !self.io.is_empty()
    }

    fn send_keepalives(&mut self, now: Instant) {
        let msg = ServerMessage::KeepAlive {
            server_time: self.server_time(now),
        };
        let Some(frame) = self.encode(&msg) else {
            return;
        };
        let conns: Vec<ConnectionId> = self
            .peers
            .values()
            .filter(|peer| peer.is_verified())
            .map(|peer| peer.id())
            .collect();
        for conn in conns {
            self.send_frame(conn, frame.clone(), Delivery::Reliable);
        }
    }

    // ---------------------------------------------------------------------
    // Outbound helpers
    // ---------------------------------------------------------------------

    fn encode(&self, msg: &ServerMessage) -> Option<Bytes> {
        match encode_server_message_pooled(&self.pool, msg) {
            Ok(frame) => Some(frame),
            Err(err) => {
                error!(packet = ?msg.packet_type(), error = %err, "Failed to encode message");
                None
            }
        }
    }

    fn send_frame(&mut self, conn: ConnectionId, frame: Bytes, delivery: Delivery) {
        let Some(peer) = self.peers.get(&conn) else {
            return;
        };
        let outbound = match peer.route(delivery, frame.len(), self.config.max_datagram_size) {
            Transport::Stream => Outbound::Stream { conn, frame },
            Transport::Datagram(addr) => Outbound::Datagram { addr, frame },
        };
        self.io.sends.push(outbound);
    }

    fn send_msg(&mut self, conn: ConnectionId, msg: &ServerMessage) {
        if let Some(frame) = self.encode(msg) {
            self.send_frame(conn, frame, Delivery::Reliable);
        }
    }

    fn send_datagram(&mut self, addr: SocketAddr, msg: &ServerMessage) {
        if let Some(frame) = self.encode(msg) {
            self.io.sends.push(Outbound::Datagram { addr, frame });
        }
    }

    fn send_to_players(&mut self, players: &[PlayerId], frame: &Bytes, delivery: Delivery) {
        for player in players {
            if let Some(&conn) = self.players.get(player) {
                self.send_frame(conn, frame.clone(), delivery);
            }
        }
    }

    fn broadcast_msg(&mut self, players: &[PlayerId], msg: &ServerMessage) {
        if players.is_empty() {
            return;
        }
        if let Some(frame) = self.encode(msg) {
            self.send_to_players(players, &frame, Delivery::Reliable);
        }
    }

    fn channel_members(&self, channel: ChannelId) -> Vec<PlayerId> {
        self.channels
            .get(&channel)
            .map(|c| c.members().to_vec())
            .unwrap_or_default()
    }

    /// The player plus everyone sharing at least one channel with them.
    fn audience(&self, conn: ConnectionId) -> Vec<PlayerId> {
        let Some(peer) = self.peers.get(&conn) else {
            return Vec::new();
        };
        let mut players = vec![peer.player_id()];
        for channel in peer.channels() {
            for member in self.channel_members(channel) {
                if !players.contains(&member) {
                    players.push(member);
                }
            }
        }
        players
    }

    fn advertise(&mut self) {
        let count = self.player_count();
        if self.advertised_players == Some(count) {
            return;
        }
        self.advertised_players = Some(count);
        self.services.directory.advertise(&ServerAdvertisement {
            name: self.config.server_name.clone(),
            player_count: count,
            internal_address: self.local_addr,
            external_address: self.config.external_address,
        });
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    fn disconnect(&mut self, conn: ConnectionId, reason: &str) {
        let Some(mut peer) = self.peers.remove(&conn) else {
            return;
        };
        peer.close();
        let player = peer.player_id();
        if player != 0 {
            self.players.remove(&player);
        }
        self.udp_routes.retain(|_, routed| *routed != conn);

        let channels: Vec<ChannelId> = peer.channels().collect();
        for channel in channels {
            self.leave_channel(player, channel, false);
        }

        self.io.closes.push(conn);
        info!(conn, player, reason, "Connection closed");
        if player != 0 {
            self.advertise();
        }
    }

    fn kick(&mut self, conn: ConnectionId, reason: &str) {
        self.send_msg(
            conn,
            &ServerMessage::Disconnect {
                reason: reason.to_string(),
            },
        );
        self.disconnect(conn, reason);
    }

    fn violation(&mut self, conn: ConnectionId, violation: Violation) {
        let player = self.peers.get(&conn).map(|p| p.player_id()).unwrap_or(0);
        warn!(conn, player, error = %violation, "Protocol violation, disconnecting");
        self.disconnect(conn, "protocol violation");
    }

    /// Disconnect everyone with `reason` and queue a snapshot of persistent channels.
    pub fn shutdown(&mut self, reason: &str) {
        let conns: Vec<ConnectionId> = self.peers.keys().copied().collect();
        for conn in conns {
            self.kick(conn, reason);
        }
        self.queue_snapshot();
    }

    // ---------------------------------------------------------------------
    // Inbound dispatch
    // ---------------------------------------------------------------------

    fn handle_frame(&mut self, conn: ConnectionId, frame: Bytes, now: Instant) {
        let Some(peer) = self.peers.get_mut(&conn) else {
            return;
        };
        peer.touch(now);
        let verified = peer.is_verified();

        let result = decode_client_message(&frame)
            .map_err(Violation::from)
            .and_then(|msg| {
                msg.verify().map_err(Violation::Invalid)?;
                Ok(msg)
            })
            .and_then(|msg| {
                if verified {
                    self.handle_message(conn, msg, Delivery::Reliable, now)
                } else {
                    self.handle_handshake(conn, msg, now)
                }
            });
        if let Err(violation) = result {
            self.violation(conn, violation);
        }
    }

    fn handle_datagram(&mut self, addr: SocketAddr, frame: Bytes, now: Instant) {
        let msg = match decode_client_message(&frame) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(%addr, error = %err, "Dropping malformed datagram");
                return;
            }
        };

        if let Some(&conn) = self.udp_routes.get(&addr) {
            if let Some(peer) = self.peers.get_mut(&conn) {
                peer.touch(now);
            }
            let result = match msg {
                ClientMessage::ActivateUdp { player_id } => {
                    self.send_datagram(addr, &ServerMessage::UdpActivated { player_id });
                    Ok(())
                }
                ClientMessage::Identify { .. } => Ok(()),
                msg => msg
                    .verify()
                    .map_err(Violation::Invalid)
                    .and_then(|_| self.handle_message(conn, msg, Delivery::BestEffort, now)),
            };
            if let Err(violation) = result {
                self.violation(conn, violation);
            }
            return;
        }

        match msg {
            ClientMessage::Ping { client_time } => {
                let server_time = self.server_time(now);
                self.send_datagram(
                    addr,
                    &ServerMessage::Pong {
                        client_time,
                        server_time,
                    },
                );
            }
            ClientMessage::ActivateUdp { player_id } => self.activate_udp(addr, player_id),
            other => {
                debug!(%addr, packet = ?other.packet_type(), "Dropping datagram from unknown endpoint")
            }
        }
    }

    fn activate_udp(&mut self, addr: SocketAddr, player_id: PlayerId) {
        let Some(&conn) = self.players.get(&player_id) else {
            debug!(%addr, player = player_id, "UDP activation for unknown player");
            return;
        };
        let Some(peer) = self.peers.get_mut(&conn) else {
            return;
        };
        if peer.remote_addr().ip() != addr.ip() {
            warn!(conn, %addr, "UDP activation from a different host ignored");
            return;
        }
        peer.confirm_udp(addr);
        self.udp_routes.retain(|_, routed| *routed != conn);
        self.udp_routes.insert(addr, conn);
        debug!(conn, player = player_id, %addr, "UDP path confirmed");
        self.send_datagram(addr, &ServerMessage::UdpActivated { player_id });
    }

    fn handle_handshake(
        &mut self,
        conn: ConnectionId,
        msg: ClientMessage,
        now: Instant,
    ) -> Result<(), Violation> {
        let ClientMessage::Identify {
            protocol_version,
            name,
        } = msg
        else {
            return Err(Violation::NotIdentified(msg.packet_type()));
        };

        if protocol_version != PROTOCOL_VERSION {
            self.send_msg(
                conn,
                &ServerMessage::Error {
                    message: format!(
                        "Protocol version mismatch: server speaks {}, client sent {}",
                        PROTOCOL_VERSION, protocol_version
                    ),
                },
            );
            return Err(Violation::VersionMismatch {
                client: protocol_version,
                server: PROTOCOL_VERSION,
            });
        }

        let player = self.next_player_id;
        self.next_player_id = self.next_player_id.wrapping_add(1).max(1);
        let Some(peer) = self.peers.get_mut(&conn) else {
            return Ok(());
        };
        peer.promote(player, name, now);
        if self.bans.iter().any(|entry| peer.matches_ban(entry)) {
            return Err(Violation::Banned);
        }
        info!(conn, player, name = %peer.name, addr = %peer.remote_addr(), "Player connected");
        self.players.insert(player, conn);

        let server_time = self.server_time(now);
        self.send_msg(
            conn,
            &ServerMessage::IdAssigned {
                protocol_version: PROTOCOL_VERSION,
                player_id: player,
                server_time,
            },
        );
        if !self.server_data.is_empty() {
            let data = self.server_data.clone();
            self.send_msg(conn, &ServerMessage::ServerData { data });
        }
        self.advertise();
        Ok(())
    }

    fn handle_message(
        &mut self,
        conn: ConnectionId,
        msg: ClientMessage,
        delivery: Delivery,
        now: Instant,
    ) -> Result<(), Violation> {
        let Some(peer) = self.peers.get(&conn) else {
            return Ok(());
        };
        let player = peer.player_id();
        let admin = peer.admin;
        if msg.is_privileged() && !admin {
            return Err(Violation::Unauthorized(msg.packet_type()));
        }

        match msg {
            ClientMessage::Identify { .. } => return Err(Violation::AlreadyIdentified),
            ClientMessage::Ping { client_time } => {
                let server_time = self.server_time(now);
                if let Some(frame) = self.encode(&ServerMessage::Pong {
                    client_time,
                    server_time,
                }) {
                    self.send_frame(conn, frame, delivery);
                }
            }
            ClientMessage::KeepAliveAck { server_time } => {
                let elapsed = self.server_time(now).saturating_sub(server_time);
                if let Some(peer) = self.peers.get_mut(&conn) {
                    peer.record_rtt(Duration::from_millis(elapsed));
                }
            }
            ClientMessage::SetUdp { port } => self.set_udp(conn, port),
            ClientMessage::ActivateUdp { .. } => {
                debug!(conn, "ActivateUdp over the stream ignored");
            }
            ClientMessage::Disconnect => self.disconnect(conn, "client disconnect"),

            ClientMessage::JoinChannel {
                channel,
                password,
                level,
                persistent,
                player_limit,
            } => self.join_channel(
                conn,
                player,
                JoinRequest {
                    channel,
                    password,
                    level,
                    persistent,
                    player_limit,
                },
            ),
            ClientMessage::LeaveChannel { channel } => self.leave_channel(player, channel, true),

            ClientMessage::SetName { name } => return self.set_name(conn, player, name),
            ClientMessage::SetAlias { alias } => {
                if self.bans.contains(&alias) {
                    return Err(Violation::Banned);
                }
                if let Some(peer) = self.peers.get_mut(&conn) {
                    if !peer.aliases.contains(&alias) {
                        peer.aliases.push(alias);
                    }
                }
            }
            ClientMessage::SetPlayerData { data } => {
                if let Some(peer) = self.peers.get_mut(&conn) {
                    peer.data = data.clone();
                }
                let audience = self.audience(conn);
                self.broadcast_msg(&audience, &ServerMessage::PlayerData { player, data });
            }
            ClientMessage::VerifyAdmin { password } => {
                if !self.admins.contains(&password) {
                    return Err(Violation::AdminPasswordRejected);
                }
                if let Some(peer) = self.peers.get_mut(&conn) {
                    peer.admin = true;
                }
                info!(conn, player, "Admin verified");
                let audience = self.audience(conn);
                self.broadcast_msg(&audience, &ServerMessage::AdminVerified { player });
            }
            ClientMessage::CreateAdmin { password } => {
                if self.admins.add(&password) {
                    info!(player, "Admin password added");
                    self.persist_admins();
                }
            }
            ClientMessage::RemoveAdmin { password } => {
                if self.admins.remove(&password) {
                    info!(player, "Admin password removed");
                    self.persist_admins();
                }
            }
            ClientMessage::Ban { entry } => {
                if self.bans.add(&entry) {
                    info!(player, entry = %entry, "Ban added");
                    self.persist_bans();
                }
                self.enforce_bans(conn);
            }
            ClientMessage::Unban { entry } => {
                if self.bans.remove(&entry) {
                    info!(player, entry = %entry, "Ban removed");
                    self.persist_bans();
                }
            }
            ClientMessage::SetBanList { entries } => {
                self.bans.replace(&entries);
                info!(player, entries = self.bans.len(), "Ban list replaced");
                self.persist_bans();
                self.enforce_bans(conn);
            }
            ClientMessage::Kick { target } => {
                let found = match &target {
                    PlayerRef::Id(id) => self.players.get(id).copied(),
                    PlayerRef::Name(name) => self.find_by_name(name),
                };
                match found {
                    Some(target_conn) => {
                        info!(player, target = ?target, "Player kicked");
                        self.kick(target_conn, "kicked");
                    }
                    None => self.send_msg(conn, &ServerMessage::PlayerNotFound { target }),
                }
            }
            ClientMessage::LockChannel { channel, locked } => {
                if let Some(ch) = self.channels.get_mut(&channel) {
                    ch.set_locked(locked);
                    info!(player, channel, locked, "Channel lock changed");
                    let members = ch.members().to_vec();
                    self.broadcast_msg(&members, &ServerMessage::ChannelLocked { channel, locked });
                }
            }
            ClientMessage::CloseChannel { channel } => {
                if let Some(ch) = self.channels.get_mut(&channel) {
                    ch.close();
                    info!(player, channel, "Channel closed");
                    let members = ch.members().to_vec();
                    if members.is_empty() {
                        self.channels.remove(&channel);
                    } else {
                        self.broadcast_msg(&members, &ServerMessage::ChannelClosed { channel });
                    }
                }
            }
            ClientMessage::DeleteChannel {
                channel,
                disconnect,
            } => self.delete_channel(player, channel, disconnect),
            ClientMessage::SetPlayerLimit { channel, limit } => {
                if let Some(ch) = self.channels.get_mut(&channel) {
                    ch.set_player_limit(limit);
                    info!(player, channel, limit, "Channel player limit changed");
                }
            }
            ClientMessage::SetServerData { data } => {
                self.server_data = data.clone();
                let everyone: Vec<PlayerId> = self.players.keys().copied().collect();
                self.broadcast_msg(&everyone, &ServerMessage::ServerData { data });
            }

            ClientMessage::SetChannelData { channel, data } => {
                let Some(ch) = self.member_channel(channel, player) else {
                    return Ok(());
                };
                if ch.is_locked() && !admin {
                    debug!(player, channel, "Channel data change on locked channel dropped");
                    return Ok(());
                }
                ch.set_data(data.clone());
                let members = ch.members().to_vec();
                self.broadcast_msg(&members, &ServerMessage::ChannelData { channel, data });
            }
            ClientMessage::SetHost {
                channel,
                player: new_host,
            } => {
                let Some(ch) = self.member_channel(channel, player) else {
                    return Ok(());
                };
                if ch.host() != Some(player) && !admin {
                    debug!(player, channel, "SetHost from non-host dropped");
                    return Ok(());
                }
                if ch.set_host(new_host) {
                    let members = ch.members().to_vec();
                    self.broadcast_msg(
                        &members,
                        &ServerMessage::SetHost {
                            channel,
                            player: new_host,
                        },
                    );
                }
            }
            ClientMessage::LoadLevel { channel, level } => {
                let Some(ch) = self.member_channel(channel, player) else {
                    return Ok(());
                };
                if (ch.host() != Some(player) || ch.is_locked()) && !admin {
                    debug!(player, channel, "LoadLevel dropped");
                    return Ok(());
                }
                ch.load_level(level.clone());
                info!(player, channel, level = %level, "Level loaded");
                let members = ch.members().to_vec();
                self.broadcast_msg(&members, &ServerMessage::LoadLevel { channel, level });
            }
            ClientMessage::CreateObject {
                channel,
                type_index,
                persistence,
                payload,
            } => self.create_object(player, admin, channel, type_index, persistence, payload),
            ClientMessage::DestroyObjects {
                channel,
                object_ids,
            } => self.destroy_objects(player, admin, channel, &object_ids, now),
            ClientMessage::TransferObject {
                from,
                to,
                object_id,
            } => self.transfer_object(player, admin, from, to, object_id, now),

            ClientMessage::ForwardToAll { channel, call } => {
                self.relay(player, admin, channel, call, RelayScope::All, delivery, now)
            }
            ClientMessage::ForwardToOthers { channel, call } => {
                self.relay(player, admin, channel, call, RelayScope::Others, delivery, now)
            }
            ClientMessage::ForwardToAllSaved { channel, call } => {
                self.relay(player, admin, channel, call, RelayScope::AllSaved, delivery, now)
            }
            ClientMessage::ForwardToOthersSaved { channel, call } => {
                self.relay(player, admin, channel, call, RelayScope::OthersSaved, delivery, now)
            }
            ClientMessage::ForwardToHost { channel, call } => {
                self.relay(player, admin, channel, call, RelayScope::Host, delivery, now)
            }
            ClientMessage::ForwardToPlayer {
                sender,
                target,
                call,
            } => {
                if sender != player {
                    return Err(Violation::SenderMismatch {
                        claimed: sender,
                        actual: player,
                    });
                }
                match self.players.get(&target).copied() {
                    Some(target_conn) => self.relay_direct(target_conn, player, call, delivery),
                    None => self.send_msg(
                        conn,
                        &ServerMessage::PlayerNotFound {
                            target: PlayerRef::Id(target),
                        },
                    ),
                }
            }
            ClientMessage::ForwardByName { sender, name, call } => {
                if sender != player {
                    return Err(Violation::SenderMismatch {
                        claimed: sender,
                        actual: player,
                    });
                }
                match self.find_by_name(&name) {
                    Some(target_conn) => self.relay_direct(target_conn, player, call, delivery),
                    None => self.send_msg(
                        conn,
                        &ServerMessage::PlayerNotFound {
                            target: PlayerRef::Name(name),
                        },
                    ),
                }
            }
            ClientMessage::Broadcast { call } => {
                let window = self.config.broadcast_window();
                let burst = self.config.broadcast_burst;
                let threshold = self.config.broadcast_kick_threshold;
                let verdict = match self.peers.get_mut(&conn) {
                    Some(peer) => peer.check_broadcast(now, window, burst, threshold),
                    None => return Ok(()),
                };
                match verdict {
                    BroadcastVerdict::Allowed => {
                        let everyone: Vec<PlayerId> = self.players.keys().copied().collect();
                        self.relay_to(&everyone, None, player, call, delivery);
                    }
                    BroadcastVerdict::Dropped => {
                        debug!(conn, player, "Broadcast over allowance dropped");
                    }
                    BroadcastVerdict::Kick => return Err(Violation::Spam),
                }
            }
            ClientMessage::BroadcastAdmin { call } => {
                let admins: Vec<PlayerId> = self
                    .peers
                    .values()
                    .filter(|p| p.is_verified() && p.admin)
                    .map(|p| p.player_id())
                    .collect();
                self.relay_to(&admins, None, player, call, delivery);
            }
            ClientMessage::RemoveRfc { channel, key } => {
                let Some(ch) = self.member_channel(channel, player) else {
                    return Ok(());
                };
                let (target, key) = match ch.resolve_forward(key.object_id, now) {
                    Some(forward) => (forward.channel, key.with_object(forward.object_id)),
                    None => (channel, key),
                };
                if let Some(ch) = self.channels.get_mut(&target) {
                    if !ch.remove_rfc(&key, admin) {
                        debug!(player, channel = target, uid = key.uid(), "RemoveRfc had no effect");
                    }
                }
            }
            ClientMessage::GetChannelList => {
                let channels = self
                    .channels
                    .values()
                    .filter(|c| !c.is_closed())
                    .map(|c| c.summary())
                    .collect();
                self.send_msg(conn, &ServerMessage::ChannelList { channels });
            }

            ClientMessage::GetFileList { prefix } => {
                if self.services.files.is_some() {
                    self.io.stores.push(StoreRequest::List { conn, prefix });
                } else {
                    let names = Vec::new();
                    self.send_msg(conn, &ServerMessage::FileList { prefix, names });
                }
            }
            ClientMessage::LoadFile { name } => {
                check_file_name(&name)?;
                if self.services.files.is_some() {
                    self.io.stores.push(StoreRequest::Load { conn, name });
                } else {
                    self.send_msg(conn, &ServerMessage::FileLoaded { name, data: None });
                }
            }
            ClientMessage::SaveFile { name, data } => {
                check_file_name(&name)?;
                debug!(player, file = %name, bytes = data.len(), "Queued file save");
                self.queue_store(StoreRequest::Save { name, data });
            }
            ClientMessage::DeleteFile { name } => {
                check_file_name(&name)?;
                info!(player, file = %name, "Queued file delete");
                self.queue_store(StoreRequest::Delete { name });
            }
        }
        Ok(())
    }

    fn set_udp(&mut self, conn: ConnectionId, port: u16) {
        let Some(peer) = self.peers.get_mut(&conn) else {
            return;
        };
        let endpoint = (port != 0).then(|| SocketAddr::new(peer.remote_addr().ip(), port));
        peer.set_udp_endpoint(endpoint);
        self.udp_routes.retain(|_, routed| *routed != conn);
        let port = self.udp_port;
        self.send_msg(conn, &ServerMessage::UdpSet { port });
    }

    fn set_name(
        &mut self,
        conn: ConnectionId,
        player: PlayerId,
        name: String,
    ) -> Result<(), Violation> {
        if self.bans.contains(&name) {
            return Err(Violation::Banned);
        }
        if let Some(peer) = self.peers.get_mut(&conn) {
            peer.name = name.clone();
        }
        let audience = self.audience(conn);
        self.broadcast_msg(&audience, &ServerMessage::PlayerRenamed { player, name });
        Ok(())
    }

    fn find_by_name(&self, name: &str) -> Option<ConnectionId> {
        self.peers
            .values()
            .find(|p| p.is_verified() && p.name == name)
            .map(|p| p.id())
    }

    fn enforce_bans(&mut self, requester: ConnectionId) {
        let banned: Vec<ConnectionId> = self
            .peers
            .values()
            .filter(|p| p.id() != requester && self.bans.iter().any(|e| p.matches_ban(e)))
            .map(|p| p.id())
            .collect();
        for conn in banned {
            self.kick(conn, "banned");
        }
    }

    fn queue_store(&mut self, request: StoreRequest) {
        if self.services.files.is_some() {
            self.io.stores.push(request);
        }
    }

    fn persist_admins(&mut self) {
        let request = StoreRequest::Save {
            name: self.admins.file().to_string(),
            data: self.admins.to_bytes(),
        };
        self.queue_store(request);
    }

    fn persist_bans(&mut self) {
        let request = StoreRequest::Save {
            name: self.bans.file().to_string(),
            data: self.bans.to_bytes(),
        };
        self.queue_store(request);
    }

    fn member_channel(&mut self, channel: ChannelId, player: PlayerId) -> Option<&mut Channel> {
        match self.channels.get_mut(&channel) {
            Some(ch) if ch.is_member(player) => Some(ch),
            _ => {
                debug!(player, channel, "Request for a channel the player is not in dropped");
                None
            }
        }
    }

    // ---------------------------------------------------------------------
    // Membership
    // ---------------------------------------------------------------------

    fn find_open_channel(&self, level: Option<&str>, password: Option<&str>) -> Option<ChannelId> {
        self.channels
            .values()
            .find(|c| {
                c.admit(password).is_ok()
                    && level.map_or(true, |level| c.settings().level == level)
            })
            .map(|c| c.id())
    }

    fn allocate_channel_id(&mut self) -> ChannelId {
        loop {
            let id = self.rng.gen_range(1..=0x7FFF_FFFF);
            if !self.channels.contains_key(&id) {
                return id;
            }
        }
    }

    fn join_channel(&mut self, conn: ConnectionId, player: PlayerId, request: JoinRequest) {
        let id = match request.channel {
            Some(id) => id,
            None => match self
                .find_open_channel(request.level.as_deref(), request.password.as_deref())
            {
                Some(id) => id,
                None => self.allocate_channel_id(),
            },
        };

        let already = self.peers.get(&conn).is_some_and(|p| p.in_channel(id));
        if already {
            self.send_msg(
                conn,
                &ServerMessage::JoinFailed {
                    channel: Some(id),
                    reason: JoinRejection::AlreadyJoined,
                },
            );
            return;
        }

        if !self.channels.contains_key(&id) {
            let settings = ChannelSettings {
                password: request.password.clone(),
                level: request.level.clone().unwrap_or_default(),
                persistent: request.persistent,
                player_limit: request.player_limit,
                locked: false,
            };
            info!(channel = id, persistent = settings.persistent, "Channel created");
            self.channels.insert(id, Channel::new(id, settings));
        }

        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        if let Err(reason) = channel.admit(request.password.as_deref()) {
            debug!(conn, player, channel = id, ?reason, "Join rejected");
            self.send_msg(
                conn,
                &ServerMessage::JoinFailed {
                    channel: request.channel,
                    reason,
                },
            );
            return;
        }

        let existing = channel.members().to_vec();
        channel.add_member(player);
        let orphans = channel.reassign_orphans();
        let members = channel.members().to_vec();
        if let Some(peer) = self.peers.get_mut(&conn) {
            peer.join_channel(id);
        }

        let roster: Vec<PlayerInfo> = members
            .iter()
            .filter_map(|p| self.players.get(p).and_then(|c| self.peers.get(c)))
            .map(|p| p.info())
            .collect();
        let joiner = roster.iter().find(|info| info.id == player).cloned();

        if let Some(info) = joiner {
            self.broadcast_msg(
                &existing,
                &ServerMessage::PlayerJoined {
                    channel: id,
                    player: info,
                },
            );
        }
        for (object_id, owner) in &orphans {
            self.broadcast_msg(
                &existing,
                &ServerMessage::ObjectOwnerChanged {
                    channel: id,
                    object_id: *object_id,
                    owner: *owner,
                },
            );
        }

        if let Some(frame) = self.join_burst(id, roster) {
            self.send_frame(conn, frame, Delivery::Reliable);
        }
        info!(conn, player, channel = id, members = members.len(), "Player joined channel");
    }

    /// Coalesce the late-joiner state sync into one frame.
    fn join_burst(&mut self, id: ChannelId, players: Vec<PlayerInfo>) -> Option<Bytes> {
        let channel = self.channels.get_mut(&id)?;
        let mut burst = vec![ServerMessage::JoiningChannel {
            channel: id,
            players,
        }];
        if let Some(host) = channel.host() {
            burst.push(ServerMessage::SetHost {
                channel: id,
                player: host,
            });
        }
        let level = channel.settings().level.clone();
        let ledgers = channel.ledgers_mut();
        if !ledgers.data.is_empty() {
            burst.push(ServerMessage::ChannelData {
                channel: id,
                data: ledgers.data.clone(),
            });
        }
        if !level.is_empty() {
            burst.push(ServerMessage::LoadLevel { channel: id, level });
        }
        for object in ledgers.objects.iter() {
            burst.push(ServerMessage::ObjectCreated {
                channel: id,
                owner: object.owner,
                object_id: object.object_id,
                type_index: object.type_index,
                persistence: object.persistence,
                payload: object.payload.clone(),
            });
        }
        let destroyed: Vec<ObjectId> = ledgers.objects.destroyed().collect();
        if !destroyed.is_empty() {
            burst.push(ServerMessage::ObjectsDestroyed {
                channel: id,
                object_ids: destroyed,
            });
        }
        for rfc in ledgers.rfcs.iter() {
            burst.push(ServerMessage::ForwardedCall {
                channel: Some(id),
                sender: 0,
                key: rfc.key.clone(),
                payload: rfc.payload.clone(),
            });
        }
        burst.push(ServerMessage::JoinComplete { channel: id });

        let mut buffer = self.pool.take();
        for msg in &burst {
            if let Err(err) = write_server_message(&mut buffer, msg) {
                error!(channel = id, error = %err, "Failed to encode join burst");
                return None;
            }
        }
        Some(buffer.freeze())
    }

    fn leave_channel(&mut self, player: PlayerId, channel_id: ChannelId, notify_leaver: bool) {
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return;
        };
        let Some(outcome) = channel.remove_member(player) else {
            return;
        };
        let remaining = channel.members().to_vec();
        let teardown = remaining.is_empty() && (!channel.is_persistent() || channel.is_closed());
        if remaining.is_empty() && !teardown && self.config.hibernate_idle_channels {
            if let Err(err) = channel.sleep() {
                warn!(channel = channel_id, error = %err, "Failed to hibernate channel");
            }
        }

        if let Some(peer) = self.players.get(&player).and_then(|c| self.peers.get_mut(c)) {
            peer.leave_channel(channel_id);
        }

        if !outcome.destroyed.is_empty() {
            self.broadcast_msg(
                &remaining,
                &ServerMessage::ObjectsDestroyed {
                    channel: channel_id,
                    object_ids: outcome.destroyed.clone(),
                },
            );
        }
        for (object_id, owner) in &outcome.reassigned {
            self.broadcast_msg(
                &remaining,
                &ServerMessage::ObjectOwnerChanged {
                    channel: channel_id,
                    object_id: *object_id,
                    owner: *owner,
                },
            );
        }
        self.broadcast_msg(
            &remaining,
            &ServerMessage::PlayerLeft {
                channel: channel_id,
                player,
            },
        );
        if let Some(host) = outcome.new_host {
            self.broadcast_msg(
                &remaining,
                &ServerMessage::SetHost {
                    channel: channel_id,
                    player: host,
                },
            );
        }
        if notify_leaver {
            if let Some(&conn) = self.players.get(&player) {
                self.send_msg(
                    conn,
                    &ServerMessage::LeftChannel {
                        channel: channel_id,
                    },
                );
            }
        }
        info!(player, channel = channel_id, remaining = remaining.len(), "Player left channel");

        if teardown {
            self.channels.remove(&channel_id);
            info!(channel = channel_id, "Channel torn down");
        }
    }

    fn delete_channel(&mut self, requester: PlayerId, channel: ChannelId, disconnect: bool) {
        let members = self.channel_members(channel);
        for member in members {
            let Some(&conn) = self.players.get(&member) else {
                continue;
            };
            if disconnect {
                self.kick(conn, "channel deleted");
            } else {
                self.leave_channel(member, channel, true);
            }
        }
        if self.channels.remove(&channel).is_some() {
            info!(player = requester, channel, "Channel deleted");
        }
    }

    // ---------------------------------------------------------------------
    // Objects
    // ---------------------------------------------------------------------

    fn create_object(
        &mut self,
        player: PlayerId,
        admin: bool,
        channel: ChannelId,
        type_index: u32,
        persistence: ObjectPersistence,
        payload: Bytes,
    ) {
        let Some(ch) = self.member_channel(channel, player) else {
            return;
        };
        if ch.is_locked() && !admin {
            debug!(player, channel, "CreateObject on locked channel dropped");
            return;
        }
        let object_id = if persistence == ObjectPersistence::Unsaved {
            0
        } else {
            match ch.create_object(player, persistence, type_index, payload.clone()) {
                Some(object) => object.object_id,
                None => {
                    warn!(channel, "Object id space exhausted");
                    return;
                }
            }
        };
        let members = ch.members().to_vec();
        debug!(player, channel, object_id, type_index, "Object created");
        self.broadcast_msg(
            &members,
            &ServerMessage::ObjectCreated {
                channel,
                owner: player,
                object_id,
                type_index,
                persistence,
                payload,
            },
        );
    }

    fn destroy_objects(
        &mut self,
        player: PlayerId,
        admin: bool,
        channel: ChannelId,
        object_ids: &[ObjectId],
        now: Instant,
    ) {
        let Some(ch) = self.member_channel(channel, player) else {
            return;
        };
        if ch.is_locked() && !admin {
            debug!(player, channel, "DestroyObjects on locked channel dropped");
            return;
        }

        let mut destroyed: BTreeMap<ChannelId, Vec<ObjectId>> = BTreeMap::new();
        for &id in object_ids {
            let (target, target_id) = match self.channels.get_mut(&channel) {
                Some(ch) => match ch.resolve_forward(id, now) {
                    Some(forward) => (forward.channel, forward.object_id),
                    None => (channel, id),
                },
                None => break,
            };
            if let Some(ch) = self.channels.get_mut(&target) {
                if ch.destroy_object(player, target_id, admin) {
                    destroyed.entry(target).or_default().push(target_id);
                }
            }
        }

        for (target, object_ids) in destroyed {
            debug!(player, channel = target, count = object_ids.len(), "Objects destroyed");
            let members = self.channel_members(target);
            self.broadcast_msg(
                &members,
                &ServerMessage::ObjectsDestroyed {
                    channel: target,
                    object_ids,
                },
            );
        }
    }

    fn transfer_object(
        &mut self,
        player: PlayerId,
        admin: bool,
        from: ChannelId,
        to: ChannelId,
        object_id: ObjectId,
        now: Instant,
    ) {
        if from == to {
            return;
        }
        let new_owner = match self.channels.get(&to) {
            Some(dst) if !dst.is_closed() && (admin || !dst.is_locked()) => {
                dst.adoptive_owner(player)
            }
            _ => {
                debug!(player, from, to, "Transfer to missing, closed or locked channel dropped");
                return;
            }
        };
        let Some(src) = self.member_channel(from, player) else {
            return;
        };
        if src.is_locked() && !admin {
            return;
        }
        let is_host = src.host() == Some(player);
        let (old_owner, persistence) = match src.ledgers_mut().objects.get(object_id) {
            Some(o) if o.owner == player || is_host || admin => (o.owner, o.persistence),
            _ => {
                debug!(player, from, object_id, "Transfer of unknown or foreign object dropped");
                return;
            }
        };
        // Nobody in the destination could keep an owner-bound object alive.
        let new_owner = match new_owner {
            Some(owner) => owner,
            None if persistence == ObjectPersistence::OwnerBound => {
                debug!(player, to, object_id, "Owner-bound transfer into empty channel dropped");
                return;
            }
            None => 0,
        };
        let Some((object, rfcs)) = src.take_object(object_id) else {
            return;
        };
        let from_members = src.members().to_vec();

        let Some(dst) = self.channels.get_mut(&to) else {
            return;
        };
        let Some((adopted, moved)) = dst.adopt_object(object.clone(), rfcs.clone(), new_owner) else {
            warn!(channel = to, "Object id space exhausted, transfer reverted");
            if let Some(src) = self.channels.get_mut(&from) {
                let ledgers = src.ledgers_mut();
                ledgers.objects.insert(object);
                for rfc in rfcs {
                    ledgers.rfcs.add(rfc.key, rfc.payload);
                }
            }
            return;
        };
        let to_members = dst.members().to_vec();
        if let Some(src) = self.channels.get_mut(&from) {
            src.record_forward(object_id, to, adopted.object_id, now);
        }
        info!(player, from, to, old_id = object_id, new_id = adopted.object_id, "Object transferred");

        let both: Vec<PlayerId> = from_members
            .iter()
            .copied()
            .filter(|p| to_members.contains(p))
            .collect();
        let source_only: Vec<PlayerId> = from_members
            .iter()
            .copied()
            .filter(|p| !to_members.contains(p))
            .collect();
        let dest_only: Vec<PlayerId> = to_members
            .iter()
            .copied()
            .filter(|p| !from_members.contains(p))
            .collect();

        self.broadcast_msg(
            &both,
            &ServerMessage::ObjectTransferred {
                from,
                to,
                old_id: object_id,
                new_id: adopted.object_id,
            },
        );
        self.broadcast_msg(
            &source_only,
            &ServerMessage::ObjectsDestroyed {
                channel: from,
                object_ids: vec![object_id],
            },
        );
        if adopted.owner != old_owner {
            self.broadcast_msg(
                &both,
                &ServerMessage::ObjectOwnerChanged {
                    channel: to,
                    object_id: adopted.object_id,
                    owner: adopted.owner,
                },
            );
        }
        if dest_only.is_empty() {
            return;
        }
        let mut buffer = self.pool.take();
        let mut notices = vec![ServerMessage::ObjectCreated {
            channel: to,
            owner: adopted.owner,
            object_id: adopted.object_id,
            type_index: adopted.type_index,
            persistence: adopted.persistence,
            payload: adopted.payload.clone(),
        }];
        notices.extend(moved.into_iter().map(|rfc| ServerMessage::ForwardedCall {
            channel: Some(to),
            sender: 0,
            key: rfc.key,
            payload: rfc.payload,
        }));
        for msg in &notices {
            if let Err(err) = write_server_message(&mut buffer, msg) {
                error!(channel = to, error = %err, "Failed to encode transfer notice");
                return;
            }
        }
        let frame = buffer.freeze();
        self.send_to_players(&dest_only, &frame, Delivery::Reliable);
    }

    // ---------------------------------------------------------------------
    // Relay
    // ---------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn relay(
        &mut self,
        player: PlayerId,
        admin: bool,
        channel: ChannelId,
        call: RemoteCall,
        scope: RelayScope,
        delivery: Delivery,
        now: Instant,
    ) {
        let Some(ch) = self.member_channel(channel, player) else {
            return;
        };
        let RemoteCall { mut key, payload } = call;
        let mut target = channel;
        if let Some(forward) = ch.resolve_forward(key.object_id, now) {
            target = forward.channel;
            key = key.with_object(forward.object_id);
            debug!(player, from = channel, to = target, "Call redirected to transferred object");
        }
        let Some(ch) = self.channels.get_mut(&target) else {
            return;
        };

        if scope.saved() {
            match ch.add_rfc(key.clone(), payload.clone(), admin) {
                RfcOutcome::Stored => {}
                RfcOutcome::Locked => {
                    debug!(player, channel = target, "Saved call on locked channel dropped");
                    return;
                }
                RfcOutcome::UnknownObject => {
                    debug!(player, channel = target, object = key.object_id, "Saved call on unknown object dropped");
                    return;
                }
            }
        }

        let recipients: Vec<PlayerId> = match scope {
            RelayScope::All | RelayScope::AllSaved => ch.members().to_vec(),
            RelayScope::Others | RelayScope::OthersSaved => ch
                .members()
                .iter()
                .copied()
                .filter(|p| *p != player)
                .collect(),
            RelayScope::Host => ch.host().into_iter().collect(),
        };
        self.relay_to(
            &recipients,
            Some(target),
            player,
            RemoteCall { key, payload },
            delivery,
        );
    }

    fn relay_to(
        &mut self,
        recipients: &[PlayerId],
        channel: Option<ChannelId>,
        sender: PlayerId,
        call: RemoteCall,
        delivery: Delivery,
    ) {
        if recipients.is_empty() {
            return;
        }
        let msg = ServerMessage::ForwardedCall {
            channel,
            sender,
            key: call.key,
            payload: call.payload,
        };
        if let Some(frame) = self.encode(&msg) {
            self.send_to_players(recipients, &frame, delivery);
        }
    }

    fn relay_direct(
        &mut self,
        target: ConnectionId,
        sender: PlayerId,
        call: RemoteCall,
        delivery: Delivery,
    ) {
        let msg = ServerMessage::ForwardedCall {
            channel: None,
            sender,
            key: call.key,
            payload: call.payload,
        };
        if let Some(frame) = self.encode(&msg) {
            self.send_frame(target, frame, delivery);
        }
    }

    // ---------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------

    /// Snapshot every persistent, open channel that holds data.
    pub fn save_snapshot(&self) -> Result<Bytes, PersistError> {
        let mut blocks = Vec::new();
        for (id, channel) in &self.channels {
            if channel.is_persistent() && !channel.is_closed() && channel.has_data() {
                blocks.push((*id, channel.to_block()?));
            }
        }
        encode_snapshot(&blocks)
    }

    /// Restore channels from a snapshot. Occupied channels are left alone.
    pub fn restore_snapshot(&mut self, snapshot: Bytes) -> Result<usize, PersistError> {
        let mut restored = 0;
        for (id, block) in decode_snapshot(snapshot)? {
            if self.channels.get(&id).is_some_and(|c| !c.is_empty()) {
                warn!(channel = id, "Skipping restore of occupied channel");
                continue;
            }
            let mut channel = match Channel::from_block(id, block) {
                Ok(channel) => channel,
                Err(err) => {
                    warn!(channel = id, error = %err, "Skipping unreadable channel block");
                    continue;
                }
            };
            if self.config.hibernate_idle_channels {
                channel.sleep()?;
            }
            self.channels.insert(id, channel);
            restored += 1;
        }
        Ok(restored)
    }

    /// Queue the snapshot for writing with the next [`IoBatch`].
    pub fn queue_snapshot(&mut self) {
        if self.services.files.is_none() {
            return;
        }
        match self.save_snapshot() {
            Ok(data) => {
                debug!(bytes = data.len(), "Queued server snapshot");
                self.io.stores.push(StoreRequest::Save {
                    name: SNAPSHOT_FILE.to_string(),
                    data,
                });
            }
            Err(err) => error!(error = %err, "Failed to encode snapshot"),
        }
    }

    /// File store the queued [`StoreRequest`]s are meant for.
    pub fn files(&self) -> Option<Arc<dyn FileStore>> {
        self.services.files.clone()
    }

    /// Write the snapshot to the file store now. Returns false without a store.
    pub fn save_to_store(&mut self) -> anyhow::Result<bool> {
        let Some(files) = self.services.files.clone() else {
            return Ok(false);
        };
        let snapshot = self.save_snapshot().context("Failed to encode snapshot")?;
        files
            .save(SNAPSHOT_FILE, &snapshot)
            .context("Failed to write snapshot")?;
        info!(bytes = snapshot.len(), "Saved server snapshot");
        Ok(true)
    }

    /// Restore the snapshot from the file store, if one exists.
    pub fn load_from_store(&mut self) -> anyhow::Result<usize> {
        let Some(files) = self.services.files.clone() else {
            return Ok(0);
        };
        let Some(snapshot) = files.load(SNAPSHOT_FILE).context("Failed to read snapshot")? else {
            return Ok(0);
        };
        let restored = self
            .restore_snapshot(snapshot)
            .context("Failed to restore snapshot")?;
        info!(channels = restored, "Restored server snapshot");
        Ok(restored)
    }
}

fn check_file_name(name: &str) -> Result<(), Violation> {
    validate_name(name).map_err(|err| match err {
        StoreError::UnsafeName(name) => Violation::UnsafeFileName(name),
        StoreError::Io(_) => Violation::UnsafeFileName(name.to_string()),
    })?;
    if is_reserved_name(name) {
        return Err(Violation::ReservedFileName(name.to_string()));
    }
    Ok(())
}
