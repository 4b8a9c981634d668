//! Channels: membership, host, buffered calls, objects and hibernation.
//!
//! Settings (password, level, flags) stay resident at all times so listings
//! and join checks never need to wake a channel. The data tree and both
//! ledgers live in [`ChannelLedgers`], which an empty channel may serialize
//! into a block and drop until the next access.

use crate::error::PersistError;
use crate::objects::{is_static, CreatedObject, Forward, ObjectLedger};
use crate::persist::{decode_channel_block, encode_channel_block};
use crate::rfc::{BufferedRfc, RfcLedger};
use bytes::Bytes;
use std::time::Instant;
use tether_net::{
    ChannelId, ChannelSummary, DataTree, JoinRejection, ObjectId, ObjectPersistence, PlayerId,
    RfcKey,
};
use tracing::{debug, warn};

/// Resident channel settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelSettings {
    /// Join password.
    pub password: Option<String>,
    /// Level name.
    pub level: String,
    /// Survives having no members.
    pub persistent: bool,
    /// Maximum members (0 = unlimited).
    pub player_limit: u16,
    /// State changes restricted to admins.
    pub locked: bool,
}

/// The hibernatable part of a channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelLedgers {
    /// Channel data tree.
    pub data: DataTree,
    /// Buffered calls.
    pub rfcs: RfcLedger,
    /// Dynamic objects and destroyed static ids.
    pub objects: ObjectLedger,
}

impl ChannelLedgers {
    fn is_empty(&self) -> bool {
        self.data.is_empty() && self.rfcs.is_empty() && self.objects.is_empty()
    }
}

#[derive(Debug)]
struct Hibernated {
    block: Bytes,
    has_data: bool,
}

/// Result of trying to store a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfcOutcome {
    /// Stored (or replaced).
    Stored,
    /// Channel is locked and the caller is not an admin.
    Locked,
    /// Target object does not exist.
    UnknownObject,
}

/// Side effects of a member leaving.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// Owner-bound objects removed with their calls.
    pub destroyed: Vec<ObjectId>,
    /// Persistent objects handed to another member.
    pub reassigned: Vec<(ObjectId, PlayerId)>,
    /// New host, if the leaver was host and someone remains.
    pub new_host: Option<PlayerId>,
}

/// A room of players.
#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    settings: ChannelSettings,
    closed: bool,
    members: Vec<PlayerId>,
    host: Option<PlayerId>,
    // Exactly one of `awake` / `asleep` is set.
    awake: Option<Box<ChannelLedgers>>,
    asleep: Option<Hibernated>,
}

impl Channel {
    /// New empty, awake channel.
    pub fn new(id: ChannelId, settings: ChannelSettings) -> Self {
        Self {
            id,
            settings,
            closed: false,
            members: Vec::new(),
            host: None,
            awake: Some(Box::default()),
            asleep: None,
        }
    }

    /// Rebuild a channel from a block.
    pub fn from_block(id: ChannelId, block: Bytes) -> Result<Self, PersistError> {
        let (settings, ledgers) = decode_channel_block(block)?;
        Ok(Self {
            id,
            settings,
            closed: false,
            members: Vec::new(),
            host: None,
            awake: Some(Box::new(ledgers)),
            asleep: None,
        })
    }

    /// Serialize settings and ledgers. Resident settings always win over the
    /// ones captured in a sleeping channel's block.
    pub fn to_block(&self) -> Result<Bytes, PersistError> {
        if let Some(ledgers) = &self.awake {
            return encode_channel_block(&self.settings, ledgers);
        }
        match &self.asleep {
            Some(hibernated) => {
                let (_, ledgers) = decode_channel_block(hibernated.block.clone())?;
                encode_channel_block(&self.settings, &ledgers)
            }
            None => encode_channel_block(&self.settings, &ChannelLedgers::default()),
        }
    }

    /// Channel id.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Resident settings, authoritative even while asleep.
    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    /// Locked channels admit admins only.
    pub fn is_locked(&self) -> bool {
        self.settings.locked
    }

    /// Lock or unlock. A sleeping channel's block is refreshed on next sleep.
    pub fn set_locked(&mut self, locked: bool) {
        self.settings.locked = locked;
    }

    /// Change the member cap (0 is unlimited).
    pub fn set_player_limit(&mut self, limit: u16) {
        self.settings.player_limit = limit;
    }

    /// Whether the channel outlives its last member.
    pub fn is_persistent(&self) -> bool {
        self.settings.persistent
    }

    /// Closed channels refuse every join.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Refuse all further joins.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Members in join order.
    pub fn members(&self) -> &[PlayerId] {
        &self.members
    }

    /// Whether `player` is in this channel.
    pub fn is_member(&self, player: PlayerId) -> bool {
        self.members.contains(&player)
    }

    /// No members left.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Current host, `None` only when empty.
    pub fn host(&self) -> Option<PlayerId> {
        self.host
    }

    /// Whether a new member would exceed the limit.
    pub fn is_full(&self) -> bool {
        self.settings.player_limit != 0 && self.members.len() >= self.settings.player_limit as usize
    }

    /// Check whether a join with `password` would be accepted.
    pub fn admit(&self, password: Option<&str>) -> Result<(), JoinRejection> {
        if self.closed {
            return Err(JoinRejection::Closed);
        }
        if self.is_full() {
            return Err(JoinRejection::Full);
        }
        match &self.settings.password {
            Some(expected) if password != Some(expected.as_str()) => {
                Err(JoinRejection::WrongPassword)
            }
            _ => Ok(()),
        }
    }

    /// Add a member. The first member of a hostless channel becomes host.
    pub fn add_member(&mut self, player: PlayerId) -> bool {
        if self.is_member(player) {
            return false;
        }
        self.members.push(player);
        if self.host.is_none() {
            self.host = Some(player);
        }
        true
    }

    /// Remove a member and clean up what it owned. `None` if not a member.
    pub fn remove_member(&mut self, player: PlayerId) -> Option<LeaveOutcome> {
        let index = self.members.iter().position(|m| *m == player)?;
        self.members.remove(index);

        let mut outcome = LeaveOutcome::default();
        let heir = self.members.first().copied();
        if self.host == Some(player) {
            self.host = heir;
            outcome.new_host = heir;
        }

        let ledgers = self.ledgers_mut();
        let bound: Vec<ObjectId> = ledgers
            .objects
            .iter()
            .filter(|o| o.owner == player && o.persistence == ObjectPersistence::OwnerBound)
            .map(|o| o.object_id)
            .collect();
        for id in bound {
            ledgers.objects.remove(id);
            ledgers.rfcs.take_object(id);
            outcome.destroyed.push(id);
        }
        if let Some(heir) = heir {
            for object in ledgers.objects.iter_mut().filter(|o| o.owner == player) {
                object.owner = heir;
                outcome.reassigned.push((object.object_id, heir));
            }
        }
        Some(outcome)
    }

    /// Hand the host role to a member.
    pub fn set_host(&mut self, player: PlayerId) -> bool {
        if !self.is_member(player) {
            return false;
        }
        self.host = Some(player);
        true
    }

    /// Give objects whose owner is no longer a member to the host.
    pub fn reassign_orphans(&mut self) -> Vec<(ObjectId, PlayerId)> {
        let Some(host) = self.host else {
            return Vec::new();
        };
        let members = self.members.clone();
        let mut changed = Vec::new();
        for object in self
            .ledgers_mut()
            .objects
            .iter_mut()
            .filter(|o| !members.contains(&o.owner))
        {
            object.owner = host;
            changed.push((object.object_id, host));
        }
        changed
    }

    /// Whether the ledgers are serialized away.
    pub fn is_asleep(&self) -> bool {
        self.asleep.is_some()
    }

    /// Serialize and drop the ledgers. Only empty, unlocked channels sleep.
    pub fn sleep(&mut self) -> Result<bool, PersistError> {
        if !self.members.is_empty() || self.settings.locked {
            return Ok(false);
        }
        let Some(ledgers) = &self.awake else {
            return Ok(false);
        };
        let has_data = !ledgers.is_empty() || !self.settings.level.is_empty();
        let block = encode_channel_block(&self.settings, ledgers)?;
        debug!(channel = self.id, bytes = block.len(), "Channel hibernated");
        self.awake = None;
        self.asleep = Some(Hibernated { block, has_data });
        Ok(true)
    }

    /// Restore the ledgers of a sleeping channel.
    pub fn wake(&mut self) -> Result<bool, PersistError> {
        let Some(hibernated) = &self.asleep else {
            return Ok(false);
        };
        let (_, ledgers) = decode_channel_block(hibernated.block.clone())?;
        self.asleep = None;
        self.awake = Some(Box::new(ledgers));
        debug!(channel = self.id, "Channel woken");
        Ok(true)
    }

    /// Ledgers, waking the channel if needed. An unreadable block is discarded.
    pub fn ledgers_mut(&mut self) -> &mut ChannelLedgers {
        if let Err(err) = self.wake() {
            warn!(channel = self.id, error = %err, "Discarding unreadable channel block");
            self.asleep = None;
        }
        self.awake.get_or_insert_with(Box::default)
    }

    /// Whether the channel holds anything worth saving.
    pub fn has_data(&self) -> bool {
        match (&self.awake, &self.asleep) {
            (Some(ledgers), _) => !ledgers.is_empty() || !self.settings.level.is_empty(),
            (None, Some(hibernated)) => hibernated.has_data,
            (None, None) => !self.settings.level.is_empty(),
        }
    }

    /// Listing entry.
    pub fn summary(&self) -> ChannelSummary {
        ChannelSummary {
            id: self.id,
            players: self.members.len().min(u16::MAX as usize) as u16,
            limit: self.settings.player_limit,
            has_password: self.settings.password.is_some(),
            persistent: self.settings.persistent,
            locked: self.settings.locked,
            level: self.settings.level.clone(),
        }
    }

    /// Change level, clearing the data tree, calls and objects.
    pub fn load_level(&mut self, level: String) {
        self.settings.level = level;
        let ledgers = self.ledgers_mut();
        ledgers.data = DataTree::default();
        ledgers.rfcs.clear();
        ledgers.objects.clear();
    }

    /// Replace the channel data tree.
    pub fn set_data(&mut self, data: DataTree) {
        self.ledgers_mut().data = data;
    }

    /// Redirect for a call on a transferred object, if still live.
    pub fn resolve_forward(&mut self, id: ObjectId, now: Instant) -> Option<Forward> {
        let ledgers = self.ledgers_mut();
        if ledgers.objects.contains(id) {
            return None;
        }
        ledgers.objects.resolve_forward(id, now)
    }

    /// Drop expired redirects. Sleeping channels are skipped.
    pub fn prune_forwards(&mut self, now: Instant) -> usize {
        match &mut self.awake {
            Some(ledgers) => ledgers.objects.prune_forwards(now),
            None => 0,
        }
    }

    /// Store a call for replay.
    pub fn add_rfc(&mut self, key: RfcKey, payload: Bytes, privileged: bool) -> RfcOutcome {
        if self.settings.locked && !privileged {
            return RfcOutcome::Locked;
        }
        let ledgers = self.ledgers_mut();
        if !ledgers.objects.is_known(key.object_id) {
            return RfcOutcome::UnknownObject;
        }
        ledgers.rfcs.add(key, payload);
        RfcOutcome::Stored
    }

    /// Remove a stored call.
    pub fn remove_rfc(&mut self, key: &RfcKey, privileged: bool) -> bool {
        if self.settings.locked && !privileged {
            return false;
        }
        self.ledgers_mut().rfcs.remove(key)
    }

    /// Record a new saved object. `None` when the id space is exhausted.
    pub fn create_object(
        &mut self,
        owner: PlayerId,
        persistence: ObjectPersistence,
        type_index: u32,
        payload: Bytes,
    ) -> Option<CreatedObject> {
        let objects = &mut self.ledgers_mut().objects;
        let object_id = objects.allocate_id()?;
        let object = CreatedObject {
            owner,
            object_id,
            persistence,
            type_index,
            payload,
        };
        objects.insert(object.clone());
        Some(object)
    }

    /// Destroy one object on behalf of `requester`. Dynamic objects may be
    /// destroyed by their owner, the host or an admin.
    pub fn destroy_object(&mut self, requester: PlayerId, id: ObjectId, privileged: bool) -> bool {
        let is_host = self.host == Some(requester);
        let ledgers = self.ledgers_mut();
        if is_static(id) {
            if !ledgers.objects.mark_destroyed(id) {
                return false;
            }
            ledgers.rfcs.take_object(id);
            return true;
        }
        let allowed = match ledgers.objects.get(id) {
            Some(object) => object.owner == requester || is_host || privileged,
            None => false,
        };
        if allowed {
            ledgers.objects.remove(id);
            ledgers.rfcs.take_object(id);
        }
        allowed
    }

    /// Detach a dynamic object and its calls for a transfer.
    pub fn take_object(&mut self, id: ObjectId) -> Option<(CreatedObject, Vec<BufferedRfc>)> {
        let ledgers = self.ledgers_mut();
        let object = ledgers.objects.remove(id)?;
        let rfcs = ledgers.rfcs.take_object(id);
        Some((object, rfcs))
    }

    /// Owner a transferred object takes on here: `requester` if a member,
    /// otherwise the host. `None` for an empty channel.
    pub fn adoptive_owner(&self, requester: PlayerId) -> Option<PlayerId> {
        if self.is_member(requester) {
            Some(requester)
        } else {
            self.host
        }
    }

    /// Attach a transferred object under a fresh id and `owner`, rewriting
    /// its call keys. Returns the object and calls as stored here.
    pub fn adopt_object(
        &mut self,
        mut object: CreatedObject,
        rfcs: Vec<BufferedRfc>,
        owner: PlayerId,
    ) -> Option<(CreatedObject, Vec<BufferedRfc>)> {
        let ledgers = self.ledgers_mut();
        let new_id = ledgers.objects.allocate_id()?;
        object.object_id = new_id;
        object.owner = owner;
        ledgers.objects.insert(object.clone());
        let mut adopted = Vec::with_capacity(rfcs.len());
        for rfc in rfcs {
            let key = rfc.key.with_object(new_id);
            ledgers.rfcs.add(key.clone(), rfc.payload.clone());
            adopted.push(BufferedRfc {
                key,
                payload: rfc.payload,
            });
        }
        Some((object, adopted))
    }

    /// Leave a redirect from `old_id` to the object's new home.
    pub fn record_forward(&mut self, old_id: ObjectId, to: ChannelId, new_id: ObjectId, now: Instant) {
        self.ledgers_mut()
            .objects
            .record_forward(old_id, to, new_id, now);
    }
}
