//! Packet catalog and typed message definitions.
//!
//! Every frame on the wire is `[u32 length][u8 packet type][body]`, where the
//! body is the postcard encoding of a [`ClientMessage`] or [`ServerMessage`].
//! Request/response pairs that carry the same meaning in both directions share
//! one [`PacketType`] value.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Protocol version exchanged in the handshake. A mismatch is fatal.
pub const PROTOCOL_VERSION: u16 = 1;

/// Server-assigned player identifier. Zero means "not yet assigned".
pub type PlayerId = u32;

/// Channel (room) identifier.
pub type ChannelId = u32;

/// Object identifier (24 significant bits).
pub type ObjectId = u32;

/// Lowest dynamically allocated object id. Ids below this are static.
pub const FIRST_DYNAMIC_OBJECT_ID: ObjectId = 32_768;

/// Highest representable object id.
pub const MAX_OBJECT_ID: ObjectId = 0x00FF_FFFF;

/// Largest frame sent over the unreliable path.
pub const MAX_DATAGRAM_SIZE: usize = 1200;

/// Maximum player or alias name length (bytes).
pub const MAX_NAME_LEN: usize = 64;

/// Maximum password length (bytes).
pub const MAX_PASSWORD_LEN: usize = 128;

/// Maximum level name length (bytes).
pub const MAX_LEVEL_LEN: usize = 256;

/// Maximum remote function name length (bytes).
pub const MAX_FUNCTION_NAME_LEN: usize = 64;

/// Maximum file name or prefix length (bytes).
pub const MAX_FILE_NAME_LEN: usize = 256;

/// Maximum objects destroyed by a single request.
pub const MAX_DESTROY_BATCH: usize = 1024;

/// Maximum entries in a replacement ban list.
pub const MAX_BAN_ENTRIES: usize = 4096;

/// Maximum length of error and disconnect reasons.
pub const MAX_REASON_LEN: usize = 256;

macro_rules! packet_types {
    ($($(#[$doc:meta])* $name:ident = $value:literal,)*) => {
        /// Packet type byte carried in every frame header.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum PacketType {
            $($(#[$doc])* $name = $value,)*
        }

        impl TryFrom<u8> for PacketType {
            type Error = u8;

            fn try_from(value: u8) -> Result<Self, u8> {
                match value {
                    $($value => Ok(PacketType::$name),)*
                    other => Err(other),
                }
            }
        }
    };
}

packet_types! {
    /// Client handshake.
    Identify = 1,
    /// Handshake accepted; carries the player id.
    IdAssigned = 2,
    /// Error report (fatal on handshake).
    Error = 3,
    /// Orderly teardown, either direction.
    Disconnect = 4,
    /// Latency probe.
    Ping = 5,
    /// Latency probe answer.
    Pong = 6,
    /// Server keep-alive.
    KeepAlive = 7,
    /// Client keep-alive echo.
    KeepAliveAck = 8,
    /// Announce or clear the client's UDP port.
    SetUdp = 9,
    /// Server answer to `SetUdp` with its own UDP port.
    UdpSet = 10,
    /// Datagram probe proving the UDP path.
    ActivateUdp = 11,
    /// Datagram answer confirming the UDP path.
    UdpActivated = 12,
    /// Join request.
    JoinChannel = 20,
    /// Start of a join burst with the channel roster.
    JoiningChannel = 21,
    /// Join rejected.
    JoinFailed = 22,
    /// End of a join burst.
    JoinComplete = 23,
    /// Leave request.
    LeaveChannel = 24,
    /// Leave acknowledged.
    LeftChannel = 25,
    /// Another player entered a channel.
    PlayerJoined = 26,
    /// Another player left a channel.
    PlayerLeft = 27,
    /// Channel host change.
    SetHost = 28,
    /// Channel data tree.
    ChannelData = 29,
    /// Channel level change.
    LoadLevel = 30,
    /// Channel listing.
    ChannelList = 31,
    /// Player display name.
    PlayerName = 40,
    /// Ban alias.
    SetAlias = 41,
    /// Per-player data tree.
    PlayerData = 42,
    /// Admin password check.
    VerifyAdmin = 43,
    /// Admin status granted.
    AdminVerified = 44,
    /// Add an admin password.
    CreateAdmin = 45,
    /// Remove an admin password.
    RemoveAdmin = 46,
    /// Add a ban entry.
    Ban = 47,
    /// Remove a ban entry.
    Unban = 48,
    /// Replace the ban list.
    SetBanList = 49,
    /// Disconnect a player.
    Kick = 50,
    /// Lock or unlock a channel.
    LockChannel = 51,
    /// Close a channel to new joins.
    CloseChannel = 52,
    /// Delete a channel.
    DeleteChannel = 53,
    /// Change a channel's player limit.
    SetPlayerLimit = 54,
    /// Server-wide data tree.
    ServerData = 55,
    /// Create a dynamic object.
    CreateObject = 60,
    /// Object created.
    ObjectCreated = 61,
    /// Destroy objects.
    DestroyObjects = 62,
    /// Objects destroyed.
    ObjectsDestroyed = 63,
    /// Object ownership changed.
    ObjectOwnerChanged = 64,
    /// Move an object between channels.
    TransferObject = 65,
    /// Object moved between channels.
    ObjectTransferred = 66,
    /// Relay to every channel member.
    ForwardToAll = 70,
    /// Relay to every member except the sender.
    ForwardToOthers = 71,
    /// Store then relay to every member.
    ForwardToAllSaved = 72,
    /// Store then relay to every member except the sender.
    ForwardToOthersSaved = 73,
    /// Relay to the channel host.
    ForwardToHost = 74,
    /// Relay to one player by id.
    ForwardToPlayer = 75,
    /// Relay to one player by name.
    ForwardByName = 76,
    /// Relay to every connected player.
    Broadcast = 77,
    /// Relay to every connected admin.
    BroadcastAdmin = 78,
    /// A relayed call.
    ForwardedCall = 79,
    /// Relay target does not exist.
    PlayerNotFound = 80,
    /// Remove a buffered call.
    RemoveRfc = 81,
    /// List stored files.
    FileList = 90,
    /// Load a stored file.
    LoadFile = 91,
    /// Store a file.
    SaveFile = 92,
    /// Delete a stored file.
    DeleteFile = 93,
}

/// Key of a remote function call: target object plus function id or name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RfcKey {
    /// Target object (static or dynamic).
    pub object_id: ObjectId,
    /// Function id; zero means "identified by name".
    pub function_id: u8,
    /// Function name, meaningful when `function_id` is zero.
    pub function_name: Option<String>,
}

impl RfcKey {
    /// Key addressing a function by numeric id.
    pub fn by_id(object_id: ObjectId, function_id: u8) -> Self {
        Self {
            object_id,
            function_id,
            function_name: None,
        }
    }

    /// Key addressing a function by name.
    pub fn by_name(object_id: ObjectId, name: impl Into<String>) -> Self {
        Self {
            object_id,
            function_id: 0,
            function_name: Some(name.into()),
        }
    }

    /// Packed identifier: `object_id << 8 | function_id`.
    pub fn uid(&self) -> u32 {
        (self.object_id << 8) | u32::from(self.function_id)
    }

    /// Split a packed identifier back into `(object_id, function_id)`.
    pub fn split_uid(uid: u32) -> (ObjectId, u8) {
        (uid >> 8, (uid & 0xFF) as u8)
    }

    /// Whether two keys address the same stored call.
    pub fn matches(&self, other: &RfcKey) -> bool {
        self.uid() == other.uid()
            && (self.function_id != 0 || self.function_name == other.function_name)
    }

    /// Same function on another object.
    pub fn with_object(&self, object_id: ObjectId) -> Self {
        Self {
            object_id,
            ..self.clone()
        }
    }

    /// Check bounds of the key.
    pub fn verify(&self) -> Result<(), &'static str> {
        if self.object_id > MAX_OBJECT_ID {
            return Err("Object id out of range");
        }
        if self.function_id == 0 {
            match &self.function_name {
                None => return Err("Call needs a function id or name"),
                Some(name) if name.is_empty() => return Err("Empty function name"),
                _ => {}
            }
        }
        if let Some(name) = &self.function_name {
            if name.len() > MAX_FUNCTION_NAME_LEN {
                return Err("Function name too long");
            }
        }
        Ok(())
    }
}

/// A remote call as sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCall {
    /// Target key.
    pub key: RfcKey,
    /// Opaque argument bytes.
    pub payload: Bytes,
}

impl RemoteCall {
    /// Build a call from key and payload.
    pub fn new(key: RfcKey, payload: impl Into<Bytes>) -> Self {
        Self {
            key,
            payload: payload.into(),
        }
    }
}

/// Opaque structured data carried verbatim by the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataTree(pub Bytes);

impl DataTree {
    /// Wrap raw bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Whether the tree carries no data.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }
}

/// Lifetime class of a dynamic object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ObjectPersistence {
    /// Not recorded by the broker; announced once with id 0.
    Unsaved = 0,
    /// Survives its owner leaving; ownership is reassigned.
    Persistent = 1,
    /// Destroyed when its owner leaves the channel.
    OwnerBound = 2,
}

impl ObjectPersistence {
    /// Stable byte used in channel blocks.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse the channel-block byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Unsaved),
            1 => Some(Self::Persistent),
            2 => Some(Self::OwnerBound),
            _ => None,
        }
    }
}

/// Public view of a player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    /// Player id.
    pub id: PlayerId,
    /// Display name.
    pub name: String,
    /// Player data tree.
    pub data: DataTree,
}

/// Reasons a join request can be refused. The connection stays open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinRejection {
    /// Channel is closed to new members.
    Closed,
    /// Channel is at its player limit.
    Full,
    /// Password missing or wrong.
    WrongPassword,
    /// Requester is already a member.
    AlreadyJoined,
}

/// Player addressed by id or name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerRef {
    /// By id.
    Id(PlayerId),
    /// By display name.
    Name(String),
}

/// Entry in a channel listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    /// Channel id.
    pub id: ChannelId,
    /// Current member count.
    pub players: u16,
    /// Player limit (0 = unlimited).
    pub limit: u16,
    /// Whether a password is required.
    pub has_password: bool,
    /// Whether the channel survives having no members.
    pub persistent: bool,
    /// Whether state changes are restricted to admins.
    pub locked: bool,
    /// Current level name.
    pub level: String,
}

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Handshake; must be the first packet.
    Identify {
        /// Client protocol version.
        protocol_version: u16,
        /// Requested display name.
        name: String,
    },
    /// Latency probe.
    Ping {
        /// Client clock, echoed back.
        client_time: u64,
    },
    /// Echo of a server keep-alive.
    KeepAliveAck {
        /// Server clock from the keep-alive.
        server_time: u64,
    },
    /// Announce (non-zero) or clear (zero) the client's UDP port.
    SetUdp {
        /// Local UDP port.
        port: u16,
    },
    /// Sent as a datagram to prove the UDP path.
    ActivateUdp {
        /// Player id assigned at handshake.
        player_id: PlayerId,
    },
    /// Join a channel, creating it if needed.
    JoinChannel {
        /// Requested channel, or `None` for any open channel.
        channel: Option<ChannelId>,
        /// Password for protected channels.
        password: Option<String>,
        /// Level hint when joining any channel; level of a new channel.
        level: Option<String>,
        /// Persistence of a newly created channel.
        persistent: bool,
        /// Player limit of a newly created channel.
        player_limit: u16,
    },
    /// Leave a channel.
    LeaveChannel {
        /// Channel to leave.
        channel: ChannelId,
    },
    /// Change display name.
    SetName {
        /// New name.
        name: String,
    },
    /// Register an alias used for ban matching.
    SetAlias {
        /// Alias.
        alias: String,
    },
    /// Replace the player's data tree.
    SetPlayerData {
        /// New data.
        data: DataTree,
    },
    /// Request admin status.
    VerifyAdmin {
        /// Admin password.
        password: String,
    },
    /// Add an admin password (admin only).
    CreateAdmin {
        /// Password to add.
        password: String,
    },
    /// Remove an admin password (admin only).
    RemoveAdmin {
        /// Password to remove.
        password: String,
    },
    /// Ban a name, alias or address (admin only).
    Ban {
        /// Ban entry.
        entry: String,
    },
    /// Lift a ban (admin only).
    Unban {
        /// Ban entry.
        entry: String,
    },
    /// Replace the ban list (admin only).
    SetBanList {
        /// New entries.
        entries: Vec<String>,
    },
    /// Disconnect a player (admin only).
    Kick {
        /// Player to kick.
        target: PlayerRef,
    },
    /// Lock or unlock a channel (admin only).
    LockChannel {
        /// Channel.
        channel: ChannelId,
        /// New lock state.
        locked: bool,
    },
    /// Close a channel to new joins (admin only).
    CloseChannel {
        /// Channel.
        channel: ChannelId,
    },
    /// Delete a channel (admin only).
    DeleteChannel {
        /// Channel.
        channel: ChannelId,
        /// Disconnect members instead of removing them from the channel.
        disconnect: bool,
    },
    /// Change a channel's player limit (admin only).
    SetPlayerLimit {
        /// Channel.
        channel: ChannelId,
        /// New limit (0 = unlimited).
        limit: u16,
    },
    /// Replace the server data tree (admin only).
    SetServerData {
        /// New data.
        data: DataTree,
    },
    /// Replace a channel's data tree.
    SetChannelData {
        /// Channel.
        channel: ChannelId,
        /// New data.
        data: DataTree,
    },
    /// Hand the host role to another member (host only).
    SetHost {
        /// Channel.
        channel: ChannelId,
        /// New host.
        player: PlayerId,
    },
    /// Change the channel level, clearing its ledgers (host only).
    LoadLevel {
        /// Channel.
        channel: ChannelId,
        /// Level name.
        level: String,
    },
    /// Create a dynamic object.
    CreateObject {
        /// Channel.
        channel: ChannelId,
        /// Application type index.
        type_index: u32,
        /// Lifetime class.
        persistence: ObjectPersistence,
        /// Creation arguments.
        payload: Bytes,
    },
    /// Destroy objects.
    DestroyObjects {
        /// Channel.
        channel: ChannelId,
        /// Objects to destroy.
        object_ids: Vec<ObjectId>,
    },
    /// Move a dynamic object to another channel.
    TransferObject {
        /// Source channel.
        from: ChannelId,
        /// Destination channel.
        to: ChannelId,
        /// Object in the source channel.
        object_id: ObjectId,
    },
    /// Relay to every member.
    ForwardToAll {
        /// Channel.
        channel: ChannelId,
        /// Call.
        call: RemoteCall,
    },
    /// Relay to every member except the sender.
    ForwardToOthers {
        /// Channel.
        channel: ChannelId,
        /// Call.
        call: RemoteCall,
    },
    /// Store, then relay to every member.
    ForwardToAllSaved {
        /// Channel.
        channel: ChannelId,
        /// Call.
        call: RemoteCall,
    },
    /// Store, then relay to every member except the sender.
    ForwardToOthersSaved {
        /// Channel.
        channel: ChannelId,
        /// Call.
        call: RemoteCall,
    },
    /// Relay to the channel host.
    ForwardToHost {
        /// Channel.
        channel: ChannelId,
        /// Call.
        call: RemoteCall,
    },
    /// Relay to one player by id.
    ForwardToPlayer {
        /// Requester's own id.
        sender: PlayerId,
        /// Target player.
        target: PlayerId,
        /// Call.
        call: RemoteCall,
    },
    /// Relay to one player by name.
    ForwardByName {
        /// Requester's own id.
        sender: PlayerId,
        /// Target name.
        name: String,
        /// Call.
        call: RemoteCall,
    },
    /// Relay to every connected player.
    Broadcast {
        /// Call.
        call: RemoteCall,
    },
    /// Relay to every connected admin (admin only).
    BroadcastAdmin {
        /// Call.
        call: RemoteCall,
    },
    /// Remove a buffered call.
    RemoveRfc {
        /// Channel.
        channel: ChannelId,
        /// Key of the call.
        key: RfcKey,
    },
    /// Request the channel listing.
    GetChannelList,
    /// List stored files under a prefix.
    GetFileList {
        /// Name prefix.
        prefix: String,
    },
    /// Load a stored file.
    LoadFile {
        /// File name.
        name: String,
    },
    /// Store a file.
    SaveFile {
        /// File name.
        name: String,
        /// Contents.
        data: Bytes,
    },
    /// Delete a stored file (admin only).
    DeleteFile {
        /// File name.
        name: String,
    },
    /// Orderly disconnect.
    Disconnect,
}

fn check_len(value: &str, max: usize, err: &'static str) -> Result<(), &'static str> {
    if value.len() > max {
        Err(err)
    } else {
        Ok(())
    }
}

impl ClientMessage {
    /// Packet type byte for this message.
    pub fn packet_type(&self) -> PacketType {
        match self {
            ClientMessage::Identify { .. } => PacketType::Identify,
            ClientMessage::Ping { .. } => PacketType::Ping,
            ClientMessage::KeepAliveAck { .. } => PacketType::KeepAliveAck,
            ClientMessage::SetUdp { .. } => PacketType::SetUdp,
            ClientMessage::ActivateUdp { .. } => PacketType::ActivateUdp,
            ClientMessage::JoinChannel { .. } => PacketType::JoinChannel,
            ClientMessage::LeaveChannel { .. } => PacketType::LeaveChannel,
            ClientMessage::SetName { .. } => PacketType::PlayerName,
            ClientMessage::SetAlias { .. } => PacketType::SetAlias,
            ClientMessage::SetPlayerData { .. } => PacketType::PlayerData,
            ClientMessage::VerifyAdmin { .. } => PacketType::VerifyAdmin,
            ClientMessage::CreateAdmin { .. } => PacketType::CreateAdmin,
            ClientMessage::RemoveAdmin { .. } => PacketType::RemoveAdmin,
            ClientMessage::Ban { .. } => PacketType::Ban,
            ClientMessage::Unban { .. } => PacketType::Unban,
            ClientMessage::SetBanList { .. } => PacketType::SetBanList,
            ClientMessage::Kick { .. } => PacketType::Kick,
            ClientMessage::LockChannel { .. } => PacketType::LockChannel,
            ClientMessage::CloseChannel { .. } => PacketType::CloseChannel,
            ClientMessage::DeleteChannel { .. } => PacketType::DeleteChannel,
            ClientMessage::SetPlayerLimit { .. } => PacketType::SetPlayerLimit,
            ClientMessage::SetServerData { .. } => PacketType::ServerData,
            ClientMessage::SetChannelData { .. } => PacketType::ChannelData,
            ClientMessage::SetHost { .. } => PacketType::SetHost,
            ClientMessage::LoadLevel { .. } => PacketType::LoadLevel,
            ClientMessage::CreateObject { .. } => PacketType::CreateObject,
            ClientMessage::DestroyObjects { .. } => PacketType::DestroyObjects,
            ClientMessage::TransferObject { .. } => PacketType::TransferObject,
            ClientMessage::ForwardToAll { .. } => PacketType::ForwardToAll,
            ClientMessage::ForwardToOthers { .. } => PacketType::ForwardToOthers,
            ClientMessage::ForwardToAllSaved { .. } => PacketType::ForwardToAllSaved,
            ClientMessage::ForwardToOthersSaved { .. } => PacketType::ForwardToOthersSaved,
            ClientMessage::ForwardToHost { .. } => PacketType::ForwardToHost,
            ClientMessage::ForwardToPlayer { .. } => PacketType::ForwardToPlayer,
            ClientMessage::ForwardByName { .. } => PacketType::ForwardByName,
            ClientMessage::Broadcast { .. } => PacketType::Broadcast,
            ClientMessage::BroadcastAdmin { .. } => PacketType::BroadcastAdmin,
            ClientMessage::RemoveRfc { .. } => PacketType::RemoveRfc,
            ClientMessage::GetChannelList => PacketType::ChannelList,
            ClientMessage::GetFileList { .. } => PacketType::FileList,
            ClientMessage::LoadFile { .. } => PacketType::LoadFile,
            ClientMessage::SaveFile { .. } => PacketType::SaveFile,
            ClientMessage::DeleteFile { .. } => PacketType::DeleteFile,
            ClientMessage::Disconnect => PacketType::Disconnect,
        }
    }

    /// Whether this request needs the admin flag.
    pub fn is_privileged(&self) -> bool {
        matches!(
            self,
            ClientMessage::CreateAdmin { .. }
                | ClientMessage::RemoveAdmin { .. }
                | ClientMessage::Ban { .. }
                | ClientMessage::Unban { .. }
                | ClientMessage::SetBanList { .. }
                | ClientMessage::Kick { .. }
                | ClientMessage::LockChannel { .. }
                | ClientMessage::CloseChannel { .. }
                | ClientMessage::DeleteChannel { .. }
                | ClientMessage::SetPlayerLimit { .. }
                | ClientMessage::SetServerData { .. }
                | ClientMessage::BroadcastAdmin { .. }
                | ClientMessage::DeleteFile { .. }
        )
    }

    /// Validate field bounds. Failures are protocol violations.
    pub fn verify(&self) -> Result<(), &'static str> {
        match self {
            ClientMessage::Identify { name, .. } | ClientMessage::SetName { name } => {
                if name.is_empty() {
                    return Err("Player name is empty");
                }
                check_len(name, MAX_NAME_LEN, "Player name too long")
            }
            ClientMessage::SetAlias { alias } => check_len(alias, MAX_NAME_LEN, "Alias too long"),
            ClientMessage::JoinChannel {
                password, level, ..
            } => {
                if let Some(password) = password {
                    check_len(password, MAX_PASSWORD_LEN, "Password too long")?;
                }
                if let Some(level) = level {
                    check_len(level, MAX_LEVEL_LEN, "Level name too long")?;
                }
                Ok(())
            }
            ClientMessage::VerifyAdmin { password }
            | ClientMessage::CreateAdmin { password }
            | ClientMessage::RemoveAdmin { password } => {
                check_len(password, MAX_PASSWORD_LEN, "Password too long")
            }
            ClientMessage::Ban { entry } | ClientMessage::Unban { entry } => {
                check_len(entry, MAX_NAME_LEN, "Ban entry too long")
            }
            ClientMessage::SetBanList { entries } => {
                if entries.len() > MAX_BAN_ENTRIES {
                    return Err("Too many ban entries");
                }
                for entry in entries {
                    check_len(entry, MAX_NAME_LEN, "Ban entry too long")?;
                }
                Ok(())
            }
            ClientMessage::Kick {
                target: PlayerRef::Name(name),
            } => check_len(name, MAX_NAME_LEN, "Player name too long"),
            ClientMessage::LoadLevel { level, .. } => {
                check_len(level, MAX_LEVEL_LEN, "Level name too long")
            }
            ClientMessage::DestroyObjects { object_ids, .. } => {
                if object_ids.len() > MAX_DESTROY_BATCH {
                    return Err("Too many objects in destroy request");
                }
                if object_ids.iter().any(|id| *id > MAX_OBJECT_ID) {
                    return Err("Object id out of range");
                }
                Ok(())
            }
            ClientMessage::TransferObject { object_id, .. } => {
                if *object_id > MAX_OBJECT_ID {
                    return Err("Object id out of range");
                }
                Ok(())
            }
            ClientMessage::ForwardToAll { call, .. }
            | ClientMessage::ForwardToOthers { call, .. }
            | ClientMessage::ForwardToAllSaved { call, .. }
            | ClientMessage::ForwardToOthersSaved { call, .. }
            | ClientMessage::ForwardToHost { call, .. }
            | ClientMessage::ForwardToPlayer { call, .. }
            | ClientMessage::Broadcast { call }
            | ClientMessage::BroadcastAdmin { call } => call.key.verify(),
            ClientMessage::ForwardByName { name, call, .. } => {
                check_len(name, MAX_NAME_LEN, "Player name too long")?;
                call.key.verify()
            }
            ClientMessage::RemoveRfc { key, .. } => key.verify(),
            ClientMessage::GetFileList { prefix: name }
            | ClientMessage::LoadFile { name }
            | ClientMessage::SaveFile { name, .. }
            | ClientMessage::DeleteFile { name } => {
                check_len(name, MAX_FILE_NAME_LEN, "File name too long")
            }
            _ => Ok(()),
        }
    }
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Handshake accepted.
    IdAssigned {
        /// Server protocol version.
        protocol_version: u16,
        /// Assigned player id.
        player_id: PlayerId,
        /// Server clock (ms since start).
        server_time: u64,
    },
    /// Error report.
    Error {
        /// Human-readable message.
        message: String,
    },
    /// Server is closing the connection.
    Disconnect {
        /// Reason.
        reason: String,
    },
    /// Latency probe answer.
    Pong {
        /// Echoed client clock.
        client_time: u64,
        /// Server clock.
        server_time: u64,
    },
    /// Keep-alive; echo with `KeepAliveAck`.
    KeepAlive {
        /// Server clock.
        server_time: u64,
    },
    /// Answer to `SetUdp`.
    UdpSet {
        /// Server UDP port (0 when unavailable).
        port: u16,
    },
    /// UDP path confirmed (sent as a datagram).
    UdpActivated {
        /// Player id.
        player_id: PlayerId,
    },
    /// Start of a join burst.
    JoiningChannel {
        /// Channel.
        channel: ChannelId,
        /// Members, including the joiner.
        players: Vec<PlayerInfo>,
    },
    /// Join refused.
    JoinFailed {
        /// Requested channel, if one was named.
        channel: Option<ChannelId>,
        /// Reason.
        reason: JoinRejection,
    },
    /// End of a join burst.
    JoinComplete {
        /// Channel.
        channel: ChannelId,
    },
    /// A player joined a channel you are in.
    PlayerJoined {
        /// Channel.
        channel: ChannelId,
        /// Player.
        player: PlayerInfo,
    },
    /// A player left a channel you are in.
    PlayerLeft {
        /// Channel.
        channel: ChannelId,
        /// Player.
        player: PlayerId,
    },
    /// You left a channel.
    LeftChannel {
        /// Channel.
        channel: ChannelId,
    },
    /// Channel host.
    SetHost {
        /// Channel.
        channel: ChannelId,
        /// Host.
        player: PlayerId,
    },
    /// Channel data tree.
    ChannelData {
        /// Channel.
        channel: ChannelId,
        /// Data.
        data: DataTree,
    },
    /// Channel level.
    LoadLevel {
        /// Channel.
        channel: ChannelId,
        /// Level name.
        level: String,
    },
    /// Object created.
    ObjectCreated {
        /// Channel.
        channel: ChannelId,
        /// Owner.
        owner: PlayerId,
        /// Object id (0 for unsaved objects).
        object_id: ObjectId,
        /// Application type index.
        type_index: u32,
        /// Lifetime class.
        persistence: ObjectPersistence,
        /// Creation arguments.
        payload: Bytes,
    },
    /// Objects destroyed.
    ObjectsDestroyed {
        /// Channel.
        channel: ChannelId,
        /// Destroyed ids.
        object_ids: Vec<ObjectId>,
    },
    /// Object owner changed.
    ObjectOwnerChanged {
        /// Channel.
        channel: ChannelId,
        /// Object.
        object_id: ObjectId,
        /// New owner.
        owner: PlayerId,
    },
    /// Object moved between two channels you are in.
    ObjectTransferred {
        /// Source channel.
        from: ChannelId,
        /// Destination channel.
        to: ChannelId,
        /// Id in the source channel.
        old_id: ObjectId,
        /// Id in the destination channel.
        new_id: ObjectId,
    },
    /// A relayed call.
    ForwardedCall {
        /// Channel, or `None` for player-targeted and server-wide calls.
        channel: Option<ChannelId>,
        /// Sending player (0 for buffered replays).
        sender: PlayerId,
        /// Call key.
        key: RfcKey,
        /// Arguments.
        payload: Bytes,
    },
    /// Relay target not found.
    PlayerNotFound {
        /// Requested target.
        target: PlayerRef,
    },
    /// A player changed name.
    PlayerRenamed {
        /// Player.
        player: PlayerId,
        /// New name.
        name: String,
    },
    /// A player's data tree.
    PlayerData {
        /// Player.
        player: PlayerId,
        /// Data.
        data: DataTree,
    },
    /// A player gained admin status.
    AdminVerified {
        /// Player.
        player: PlayerId,
    },
    /// Channel lock state.
    ChannelLocked {
        /// Channel.
        channel: ChannelId,
        /// Lock state.
        locked: bool,
    },
    /// Channel closed to new joins.
    ChannelClosed {
        /// Channel.
        channel: ChannelId,
    },
    /// Server data tree.
    ServerData {
        /// Data.
        data: DataTree,
    },
    /// Channel listing.
    ChannelList {
        /// Open channels.
        channels: Vec<ChannelSummary>,
    },
    /// Stored file names.
    FileList {
        /// Requested prefix.
        prefix: String,
        /// Matching names.
        names: Vec<String>,
    },
    /// Stored file contents.
    FileLoaded {
        /// File name.
        name: String,
        /// Contents, `None` if missing.
        data: Option<Bytes>,
    },
}

impl ServerMessage {
    /// Packet type byte for this message.
    pub fn packet_type(&self) -> PacketType {
        match self {
            ServerMessage::IdAssigned { .. } => PacketType::IdAssigned,
            ServerMessage::Error { .. } => PacketType::Error,
            ServerMessage::Disconnect { .. } => PacketType::Disconnect,
            ServerMessage::Pong { .. } => PacketType::Pong,
            ServerMessage::KeepAlive { .. } => PacketType::KeepAlive,
            ServerMessage::UdpSet { .. } => PacketType::UdpSet,
            ServerMessage::UdpActivated { .. } => PacketType::UdpActivated,
            ServerMessage::JoiningChannel { .. } => PacketType::JoiningChannel,
            ServerMessage::JoinFailed { .. } => PacketType::JoinFailed,
            ServerMessage::JoinComplete { .. } => PacketType::JoinComplete,
            ServerMessage::PlayerJoined { .. } => PacketType::PlayerJoined,
            ServerMessage::PlayerLeft { .. } => PacketType::PlayerLeft,
            ServerMessage::LeftChannel { .. } => PacketType::LeftChannel,
            ServerMessage::SetHost { .. } => PacketType::SetHost,
            ServerMessage::ChannelData { .. } => PacketType::ChannelData,
            ServerMessage::LoadLevel { .. } => PacketType::LoadLevel,
            ServerMessage::ObjectCreated { .. } => PacketType::ObjectCreated,
            ServerMessage::ObjectsDestroyed { .. } => PacketType::ObjectsDestroyed,
            ServerMessage::ObjectOwnerChanged { .. } => PacketType::ObjectOwnerChanged,
            ServerMessage::ObjectTransferred { .. } => PacketType::ObjectTransferred,
            ServerMessage::ForwardedCall { .. } => PacketType::ForwardedCall,
            ServerMessage::PlayerNotFound { .. } => PacketType::PlayerNotFound,
            ServerMessage::PlayerRenamed { .. } => PacketType::PlayerName,
            ServerMessage::PlayerData { .. } => PacketType::PlayerData,
            ServerMessage::AdminVerified { .. } => PacketType::AdminVerified,
            ServerMessage::ChannelLocked { .. } => PacketType::LockChannel,
            ServerMessage::ChannelClosed { .. } => PacketType::CloseChannel,
            ServerMessage::ServerData { .. } => PacketType::ServerData,
            ServerMessage::ChannelList { .. } => PacketType::ChannelList,
            ServerMessage::FileList { .. } => PacketType::FileList,
            ServerMessage::FileLoaded { .. } => PacketType::LoadFile,
        }
    }

    /// Validate field bounds.
    pub fn verify(&self) -> Result<(), &'static str> {
        match self {
            ServerMessage::Error { message } => {
                check_len(message, MAX_REASON_LEN, "Error message too long")
            }
            ServerMessage::Disconnect { reason } => {
                check_len(reason, MAX_REASON_LEN, "Disconnect reason too long")
            }
            ServerMessage::ForwardedCall { key, .. } => key.verify(),
            _ => Ok(()),
        }
    }
}
