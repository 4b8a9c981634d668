//! Dynamic object ledger, id allocation and transfer forwarding.

use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};
use tether_net::{
    ChannelId, ObjectId, ObjectPersistence, PlayerId, FIRST_DYNAMIC_OBJECT_ID, MAX_OBJECT_ID,
};

/// How long calls on a transferred object keep being redirected.
pub const TRANSFER_GRACE: Duration = Duration::from_secs(2);

/// A dynamic object recorded by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedObject {
    /// Owning player.
    pub owner: PlayerId,
    /// Dynamic id (>= [`FIRST_DYNAMIC_OBJECT_ID`]).
    pub object_id: ObjectId,
    /// Lifetime class.
    pub persistence: ObjectPersistence,
    /// Application type index.
    pub type_index: u32,
    /// Creation arguments.
    pub payload: Bytes,
}

/// Redirect left behind by a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Forward {
    /// Destination channel.
    pub channel: ChannelId,
    /// Id in the destination channel.
    pub object_id: ObjectId,
    /// When the redirect stops applying.
    pub expires: Instant,
}

/// Whether `id` lies in the static range.
pub fn is_static(id: ObjectId) -> bool {
    id < FIRST_DYNAMIC_OBJECT_ID
}

/// Objects of one channel, in creation order.
#[derive(Debug, Clone)]
pub struct ObjectLedger {
    objects: Vec<CreatedObject>,
    next_id: ObjectId,
    destroyed: BTreeSet<ObjectId>,
    forwards: HashMap<ObjectId, Forward>,
}

impl Default for ObjectLedger {
    fn default() -> Self {
        Self {
            objects: Vec::new(),
            next_id: MAX_OBJECT_ID,
            destroyed: BTreeSet::new(),
            forwards: HashMap::new(),
        }
    }
}

impl ObjectLedger {
    /// Empty ledger with the counter at its starting value.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next value the allocator will try.
    pub fn next_id(&self) -> ObjectId {
        self.next_id
    }

    /// Restore the allocator position (from a channel block).
    pub fn set_next_id(&mut self, next_id: ObjectId) {
        self.next_id = if (FIRST_DYNAMIC_OBJECT_ID..=MAX_OBJECT_ID).contains(&next_id) {
            next_id
        } else {
            MAX_OBJECT_ID
        };
    }

    /// Hand out a fresh dynamic id: counting down from `0xFFFFFF`, wrapping at
    /// [`FIRST_DYNAMIC_OBJECT_ID`] and skipping ids still in use.
    pub fn allocate_id(&mut self) -> Option<ObjectId> {
        let space = (MAX_OBJECT_ID - FIRST_DYNAMIC_OBJECT_ID + 1) as usize;
        if self.objects.len() >= space {
            return None;
        }
        loop {
            let id = self.next_id;
            self.next_id = if id <= FIRST_DYNAMIC_OBJECT_ID {
                MAX_OBJECT_ID
            } else {
                id - 1
            };
            if !self.contains(id) {
                return Some(id);
            }
        }
    }

    /// Record an object.
    pub fn insert(&mut self, object: CreatedObject) {
        self.objects.push(object);
    }

    /// Whether a dynamic object with this id exists.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.iter().any(|o| o.object_id == id)
    }

    /// Look up an object.
    pub fn get(&self, id: ObjectId) -> Option<&CreatedObject> {
        self.objects.iter().find(|o| o.object_id == id)
    }

    /// Look up an object mutably.
    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut CreatedObject> {
        self.objects.iter_mut().find(|o| o.object_id == id)
    }

    /// Remove an object, keeping the order of the rest.
    pub fn remove(&mut self, id: ObjectId) -> Option<CreatedObject> {
        let index = self.objects.iter().position(|o| o.object_id == id)?;
        Some(self.objects.remove(index))
    }

    /// Whether calls and records may reference `id`: a live static id or a
    /// recorded dynamic one.
    pub fn is_known(&self, id: ObjectId) -> bool {
        if is_static(id) {
            !self.destroyed.contains(&id)
        } else {
            self.contains(id)
        }
    }

    /// Record the removal of a static object.
    pub fn mark_destroyed(&mut self, id: ObjectId) -> bool {
        is_static(id) && self.destroyed.insert(id)
    }

    /// Destroyed static ids, ascending.
    pub fn destroyed(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.destroyed.iter().copied()
    }

    /// Objects in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &CreatedObject> {
        self.objects.iter()
    }

    /// Objects in creation order, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut CreatedObject> {
        self.objects.iter_mut()
    }

    /// Number of dynamic objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether there are no dynamic objects and no destroyed static ids.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.destroyed.is_empty()
    }

    /// Leave a redirect for `old_id` pointing at its new home.
    pub fn record_forward(
        &mut self,
        old_id: ObjectId,
        channel: ChannelId,
        new_id: ObjectId,
        now: Instant,
    ) {
        self.forwards.insert(
            old_id,
            Forward {
                channel,
                object_id: new_id,
                expires: now + TRANSFER_GRACE,
            },
        );
    }

    /// Live redirect for `id`, dropping it if expired.
    pub fn resolve_forward(&mut self, id: ObjectId, now: Instant) -> Option<Forward> {
        let forward = *self.forwards.get(&id)?;
        if now >= forward.expires {
            self.forwards.remove(&id);
            return None;
        }
        Some(forward)
    }

    /// Drop expired redirects. Returns how many were removed.
    pub fn prune_forwards(&mut self, now: Instant) -> usize {
        let before = self.forwards.len();
        self.forwards.retain(|_, forward| now < forward.expires);
        before - self.forwards.len()
    }

    /// Number of live redirects.
    pub fn forward_count(&self) -> usize {
        self.forwards.len()
    }

    /// Forget every object, destroyed id and redirect. The counter is kept.
    pub fn clear(&mut self) {
        self.objects.clear();
        self.destroyed.clear();
        self.forwards.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(owner: PlayerId, object_id: ObjectId) -> CreatedObject {
        CreatedObject {
            owner,
            object_id,
            persistence: ObjectPersistence::Persistent,
            type_index: 1,
            payload: Bytes::new(),
        }
    }

    #[test]
    fn test_allocation_counts_down_from_max() {
        let mut ledger = ObjectLedger::new();
        assert_eq!(ledger.allocate_id(), Some(MAX_OBJECT_ID));
        assert_eq!(ledger.allocate_id(), Some(MAX_OBJECT_ID - 1));
    }

    #[test]
    fn test_allocation_wraps_and_skips_used() {
        let mut ledger = ObjectLedger::new();
        ledger.insert(object(1, MAX_OBJECT_ID));
        ledger.set_next_id(FIRST_DYNAMIC_OBJECT_ID);
        assert_eq!(ledger.allocate_id(), Some(FIRST_DYNAMIC_OBJECT_ID));
        // Wraps to the top, where MAX_OBJECT_ID is taken.
        assert_eq!(ledger.allocate_id(), Some(MAX_OBJECT_ID - 1));
    }

    #[test]
    fn test_static_ids_known_until_destroyed() {
        let mut ledger = ObjectLedger::new();
        assert!(ledger.is_known(10));
        assert!(!ledger.is_known(40_000));
        assert!(ledger.mark_destroyed(10));
        assert!(!ledger.mark_destroyed(10));
        assert!(!ledger.mark_destroyed(40_000));
        assert!(!ledger.is_known(10));
        assert_eq!(ledger.destroyed().collect::<Vec<_>>(), vec![10]);
    }

    #[test]
    fn test_remove_keeps_order() {
        let mut ledger = ObjectLedger::new();
        ledger.insert(object(1, 50_000));
        ledger.insert(object(1, 50_001));
        ledger.insert(object(2, 50_002));
        assert_eq!(ledger.remove(50_001).map(|o| o.object_id), Some(50_001));
        let ids: Vec<_> = ledger.iter().map(|o| o.object_id).collect();
        assert_eq!(ids, vec![50_000, 50_002]);
    }

    #[test]
    fn test_forward_expires_after_grace() {
        let mut ledger = ObjectLedger::new();
        let now = Instant::now();
        ledger.record_forward(50_000, 9, 70_000, now);
        assert_eq!(
            ledger.resolve_forward(50_000, now + Duration::from_secs(1)),
            Some(Forward {
                channel: 9,
                object_id: 70_000,
                expires: now + TRANSFER_GRACE
            })
        );
        assert_eq!(ledger.resolve_forward(50_000, now + TRANSFER_GRACE), None);
        assert_eq!(ledger.forward_count(), 0);
    }

    #[test]
    fn test_prune_forwards() {
        let mut ledger = ObjectLedger::new();
        let now = Instant::now();
        ledger.record_forward(50_000, 9, 70_000, now);
        ledger.record_forward(50_001, 9, 70_001, now + Duration::from_secs(1));
        assert_eq!(ledger.prune_forwards(now + TRANSFER_GRACE), 1);
        assert_eq!(ledger.forward_count(), 1);
    }
}
