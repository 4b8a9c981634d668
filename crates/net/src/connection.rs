//! Connection state on both ends of the wire.
//!
//! [`PeerConnection`] is the broker's record of one accepted socket: identity,
//! handshake state, unreliable-path state, liveness timers, spam counters and
//! channel membership. [`ClientConnection`] is the tokio client used by tools
//! and integration tests.

use crate::codec::{decode_server_message, encode_client_message};
use crate::delivery::{select_transport, Delivery, Transport};
use crate::framing::{Defragmenter, DEFAULT_MAX_PACKET_SIZE};
use crate::protocol::{
    ChannelId, ClientMessage, DataTree, PlayerId, PlayerInfo, RfcKey, ServerMessage,
    PROTOCOL_VERSION,
};
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use std::collections::{BTreeSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info, warn};

/// Broker-internal key for an accepted socket, distinct from the player id.
pub type ConnectionId = u64;

/// Handshake state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket.
    NotConnected,
    /// Socket connect in progress (client side).
    Connecting,
    /// Socket open, waiting for the protocol handshake.
    Verifying,
    /// Handshake complete.
    Connected,
}

/// Outcome of a rate-limited broadcast attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastVerdict {
    /// Within the window allowance.
    Allowed,
    /// Over the allowance; the broadcast is dropped.
    Dropped,
    /// Repeat offender; disconnect.
    Kick,
}

/// Per-window broadcast counter.
#[derive(Debug, Default)]
pub struct SpamGuard {
    window_start: Option<Instant>,
    in_window: u32,
    strikes: u32,
}

impl SpamGuard {
    /// Count one broadcast at `now`. A `kick_threshold` of zero never kicks.
    pub fn record(
        &mut self,
        now: Instant,
        window: Duration,
        burst: u32,
        kick_threshold: u32,
    ) -> BroadcastVerdict {
        let expired = match self.window_start {
            Some(start) => now.saturating_duration_since(start) >= window,
            None => true,
        };
        if expired {
            self.window_start = Some(now);
            self.in_window = 0;
        }
        self.in_window += 1;
        if self.in_window <= burst {
            return BroadcastVerdict::Allowed;
        }
        self.strikes += 1;
        if kick_threshold > 0 && self.strikes >= kick_threshold {
            BroadcastVerdict::Kick
        } else {
            BroadcastVerdict::Dropped
        }
    }

    /// Broadcasts dropped so far.
    pub fn strikes(&self) -> u32 {
        self.strikes
    }
}

/// Server-side record of one client connection.
#[derive(Debug)]
pub struct PeerConnection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    state: ConnectionState,
    player_id: PlayerId,
    /// Display name.
    pub name: String,
    /// Set by a successful admin password check.
    pub admin: bool,
    /// Extra identities matched against the ban list.
    pub aliases: Vec<String>,
    /// Player data tree.
    pub data: DataTree,
    udp_endpoint: Option<SocketAddr>,
    udp_confirmed: bool,
    connected_at: Instant,
    last_activity: Instant,
    rtt: Option<Duration>,
    channels: BTreeSet<ChannelId>,
    inbound: VecDeque<Bytes>,
    spam: SpamGuard,
}

impl PeerConnection {
    /// Record a freshly accepted socket; the peer starts in `Verifying`.
    pub fn new(id: ConnectionId, remote_addr: SocketAddr, now: Instant) -> Self {
        Self {
            id,
            remote_addr,
            state: ConnectionState::Verifying,
            player_id: 0,
            name: String::new(),
            admin: false,
            aliases: Vec::new(),
            data: DataTree::default(),
            udp_endpoint: None,
            udp_confirmed: false,
            connected_at: now,
            last_activity: now,
            rtt: None,
            channels: BTreeSet::new(),
            inbound: VecDeque::new(),
            spam: SpamGuard::default(),
        }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address of the stream socket.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Handshake state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Assigned player id (0 before the handshake).
    pub fn player_id(&self) -> PlayerId {
        self.player_id
    }

    /// Whether the handshake has completed.
    pub fn is_verified(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Complete the handshake.
    pub fn promote(&mut self, player_id: PlayerId, name: String, now: Instant) {
        self.player_id = player_id;
        self.name = name;
        self.state = ConnectionState::Connected;
        self.last_activity = now;
    }

    /// Mark the connection as gone.
    pub fn close(&mut self) {
        self.state = ConnectionState::NotConnected;
    }

    /// Note inbound traffic.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Whether the peer has been silent too long for its state.
    pub fn timed_out(
        &self,
        now: Instant,
        handshake_timeout: Duration,
        inactivity_timeout: Duration,
    ) -> bool {
        match self.state {
            ConnectionState::Connected => {
                now.saturating_duration_since(self.last_activity) > inactivity_timeout
            }
            ConnectionState::NotConnected => true,
            _ => now.saturating_duration_since(self.connected_at) > handshake_timeout,
        }
    }

    /// Set or clear the unreliable endpoint. The path is unconfirmed afterwards.
    /// Returns the previously confirmed endpoint, if any.
    pub fn set_udp_endpoint(&mut self, endpoint: Option<SocketAddr>) -> Option<SocketAddr> {
        let previous = self.confirmed_udp();
        self.udp_endpoint = endpoint;
        self.udp_confirmed = false;
        previous
    }

    /// Confirm the unreliable path after a datagram round trip from `endpoint`.
    pub fn confirm_udp(&mut self, endpoint: SocketAddr) {
        self.udp_endpoint = Some(endpoint);
        self.udp_confirmed = true;
    }

    /// Announced unreliable endpoint, confirmed or not.
    pub fn udp_endpoint(&self) -> Option<SocketAddr> {
        self.udp_endpoint
    }

    /// Unreliable endpoint, only once confirmed.
    pub fn confirmed_udp(&self) -> Option<SocketAddr> {
        self.udp_endpoint.filter(|_| self.udp_confirmed)
    }

    /// Pick the transport for a frame bound to this peer.
    pub fn route(&self, delivery: Delivery, frame_len: usize, max_datagram: usize) -> Transport {
        select_transport(delivery, frame_len, max_datagram, self.confirmed_udp())
    }

    /// Queue a complete inbound frame.
    pub fn push_inbound(&mut self, frame: Bytes) {
        self.inbound.push_back(frame);
    }

    /// Take the oldest queued inbound frame.
    pub fn pop_inbound(&mut self) -> Option<Bytes> {
        self.inbound.pop_front()
    }

    /// Number of queued inbound frames.
    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    /// Add a channel membership. Returns false if already a member.
    pub fn join_channel(&mut self, channel: ChannelId) -> bool {
        self.channels.insert(channel)
    }

    /// Drop a channel membership. Returns false if not a member.
    pub fn leave_channel(&mut self, channel: ChannelId) -> bool {
        self.channels.remove(&channel)
    }

    /// Whether the peer is in `channel`.
    pub fn in_channel(&self, channel: ChannelId) -> bool {
        self.channels.contains(&channel)
    }

    /// Channels the peer belongs to, ascending.
    pub fn channels(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.channels.iter().copied()
    }

    /// Record a round-trip measurement.
    pub fn record_rtt(&mut self, rtt: Duration) {
        self.rtt = Some(rtt);
    }

    /// Last measured round-trip time.
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    /// Count a broadcast against the spam window.
    pub fn check_broadcast(
        &mut self,
        now: Instant,
        window: Duration,
        burst: u32,
        kick_threshold: u32,
    ) -> BroadcastVerdict {
        self.spam.record(now, window, burst, kick_threshold)
    }

    /// Whether a ban entry names this peer (name, alias or address).
    pub fn matches_ban(&self, entry: &str) -> bool {
        (!self.name.is_empty() && self.name == entry)
            || self.aliases.iter().any(|alias| alias == entry)
            || self.remote_addr.ip().to_string() == entry
    }

    /// Public view of the player.
    pub fn info(&self) -> PlayerInfo {
        PlayerInfo {
            id: self.player_id,
            name: self.name.clone(),
            data: self.data.clone(),
        }
    }
}

/// Client-side capability invoked for every relayed call.
pub trait RemoteCallHandler {
    /// Run the function addressed by `key` with `payload`.
    fn invoke(&mut self, key: &RfcKey, payload: &[u8]);
}

impl<F: FnMut(&RfcKey, &[u8])> RemoteCallHandler for F {
    fn invoke(&mut self, key: &RfcKey, payload: &[u8]) {
        self(key, payload)
    }
}

/// Hand a relayed call to `handler`. Returns false for any other message.
pub fn dispatch_call<H: RemoteCallHandler + ?Sized>(handler: &mut H, msg: &ServerMessage) -> bool {
    match msg {
        ServerMessage::ForwardedCall { key, payload, .. } => {
            handler.invoke(key, payload);
            true
        }
        _ => false,
    }
}

/// Number of `ActivateUdp` probes sent before giving up.
const UDP_ACTIVATION_ATTEMPTS: u32 = 5;

/// Wait between `ActivateUdp` probes.
const UDP_ACTIVATION_RETRY: Duration = Duration::from_millis(250);

/// Client-side connection speaking the framed protocol over TCP (+ optional UDP).
pub struct ClientConnection {
    stream: TcpStream,
    server_addr: SocketAddr,
    defrag: Defragmenter,
    state: ConnectionState,
    player_id: PlayerId,
    backlog: VecDeque<ServerMessage>,
    udp: Option<UdpSocket>,
    udp_target: Option<SocketAddr>,
    read_buf: Vec<u8>,
}

impl ClientConnection {
    /// Open the stream socket. The connection is `Verifying` on return.
    pub async fn connect(server_addr: SocketAddr) -> Result<Self> {
        debug!(%server_addr, state = ?ConnectionState::Connecting, "Connecting");
        let stream = TcpStream::connect(server_addr)
            .await
            .with_context(|| format!("Failed to connect to {}", server_addr))?;
        stream.set_nodelay(true).context("Failed to set TCP_NODELAY")?;
        Ok(Self {
            stream,
            server_addr,
            defrag: Defragmenter::new(DEFAULT_MAX_PACKET_SIZE),
            state: ConnectionState::Verifying,
            player_id: 0,
            backlog: VecDeque::new(),
            udp: None,
            udp_target: None,
            read_buf: vec![0u8; 8192],
        })
    }

    /// Connect and complete the handshake in one step.
    pub async fn connect_as(server_addr: SocketAddr, name: &str) -> Result<Self> {
        let mut connection = Self::connect(server_addr).await?;
        connection.handshake(name).await?;
        Ok(connection)
    }

    /// Perform the protocol handshake. Returns the assigned player id.
    pub async fn handshake(&mut self, name: &str) -> Result<PlayerId> {
        info!(server = %self.server_addr, "Starting handshake with server");

        self.send(&ClientMessage::Identify {
            protocol_version: PROTOCOL_VERSION,
            name: name.to_string(),
        })
        .await?;

        match self.recv().await? {
            ServerMessage::IdAssigned {
                protocol_version,
                player_id,
                ..
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    self.state = ConnectionState::NotConnected;
                    bail!(
                        "Protocol version mismatch: client {}, server {}",
                        PROTOCOL_VERSION,
                        protocol_version
                    );
                }
                self.player_id = player_id;
                self.state = ConnectionState::Connected;
                info!(player = player_id, "Handshake successful");
                Ok(player_id)
            }
            ServerMessage::Error { message } => {
                self.state = ConnectionState::NotConnected;
                bail!("Handshake rejected: {}", message)
            }
            msg => bail!("Expected IdAssigned, got {:?}", msg),
        }
    }

    /// Current handshake state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Player id assigned by the server (0 before the handshake).
    pub fn player_id(&self) -> PlayerId {
        self.player_id
    }

    /// Send a message over the stream socket.
    pub async fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        let frame = encode_client_message(msg)?;
        self.stream
            .write_all(&frame)
            .await
            .context("Failed to write frame")
    }

    /// Receive the next message from the stream socket.
    pub async fn recv(&mut self) -> Result<ServerMessage> {
        if let Some(msg) = self.backlog.pop_front() {
            return Ok(msg);
        }
        loop {
            if let Some(frame) = self.defrag.next_frame()? {
                return Ok(decode_server_message(&frame)?);
            }
            let read = self
                .stream
                .read(&mut self.read_buf)
                .await
                .context("Failed to read from server")?;
            if read == 0 {
                self.state = ConnectionState::NotConnected;
                bail!("Connection closed by server");
            }
            self.defrag.push(&self.read_buf[..read]);
        }
    }

    /// Receive messages until `done` matches one; returns everything received, inclusive.
    pub async fn recv_until<F>(&mut self, mut done: F) -> Result<Vec<ServerMessage>>
    where
        F: FnMut(&ServerMessage) -> bool,
    {
        let mut received = Vec::new();
        loop {
            let msg = self.recv().await?;
            let finished = done(&msg);
            received.push(msg);
            if finished {
                return Ok(received);
            }
        }
    }

    /// Bind a UDP socket, announce it, and prove the path with `ActivateUdp`.
    pub async fn enable_udp(&mut self) -> Result<()> {
        let local_ip = self.stream.local_addr()?.ip();
        let socket = UdpSocket::bind(SocketAddr::new(local_ip, 0))
            .await
            .context("Failed to bind UDP socket")?;
        let port = socket.local_addr()?.port();
        self.send(&ClientMessage::SetUdp { port }).await?;

        let mut server_port = None;
        while server_port.is_none() {
            match self.recv_direct().await? {
                ServerMessage::UdpSet { port } => server_port = Some(port),
                other => self.backlog.push_back(other),
            }
        }
        let server_port = server_port.unwrap_or(0);
        if server_port == 0 {
            bail!("Server has no UDP endpoint");
        }

        let target = SocketAddr::new(self.server_addr.ip(), server_port);
        let probe = encode_client_message(&ClientMessage::ActivateUdp {
            player_id: self.player_id,
        })?;
        let mut buf = vec![0u8; 2048];
        for attempt in 1..=UDP_ACTIVATION_ATTEMPTS {
            socket.send_to(&probe, target).await?;
            let reply = tokio::time::timeout(UDP_ACTIVATION_RETRY, socket.recv_from(&mut buf)).await;
            if let Ok(Ok((len, _))) = reply {
                let frame = Bytes::copy_from_slice(&buf[..len]);
                if let Ok(ServerMessage::UdpActivated { .. }) = decode_server_message(&frame) {
                    info!(%target, "UDP path confirmed");
                    self.udp = Some(socket);
                    self.udp_target = Some(target);
                    return Ok(());
                }
            }
            debug!(attempt, "No UDP activation reply yet");
        }
        warn!(%target, "UDP activation failed");
        bail!("UDP activation failed after {} attempts", UDP_ACTIVATION_ATTEMPTS)
    }

    async fn recv_direct(&mut self) -> Result<ServerMessage> {
        loop {
            if let Some(frame) = self.defrag.next_frame()? {
                return Ok(decode_server_message(&frame)?);
            }
            let read = self.stream.read(&mut self.read_buf).await?;
            if read == 0 {
                self.state = ConnectionState::NotConnected;
                bail!("Connection closed by server");
            }
            self.defrag.push(&self.read_buf[..read]);
        }
    }

    /// Whether the UDP path has been confirmed.
    pub fn udp_enabled(&self) -> bool {
        self.udp.is_some()
    }

    /// Send a message as a datagram. Requires [`ClientConnection::enable_udp`].
    pub async fn send_datagram(&self, msg: &ClientMessage) -> Result<()> {
        let (Some(socket), Some(target)) = (&self.udp, self.udp_target) else {
            bail!("UDP path not enabled");
        };
        let frame = encode_client_message(msg)?;
        socket.send_to(&frame, target).await?;
        Ok(())
    }

    /// Receive one datagram message.
    pub async fn recv_datagram(&self) -> Result<ServerMessage> {
        let Some(socket) = &self.udp else {
            bail!("UDP path not enabled");
        };
        let mut buf = vec![0u8; 2048];
        let (len, _) = socket.recv_from(&mut buf).await?;
        Ok(decode_server_message(&Bytes::copy_from_slice(&buf[..len]))?)
    }

    /// Say goodbye and shut the socket down.
    pub async fn close(&mut self) -> Result<()> {
        info!(player = self.player_id, "Closing connection");
        let result = self.send(&ClientMessage::Disconnect).await;
        let _ = self.stream.shutdown().await;
        self.state = ConnectionState::NotConnected;
        result
    }
}
