//! Buffered remote calls replayed to late joiners.

use bytes::Bytes;
use tether_net::{ObjectId, RfcKey};

/// One stored call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedRfc {
    /// Target key.
    pub key: RfcKey,
    /// Latest payload for the key.
    pub payload: Bytes,
}

/// Ordered ledger holding at most one call per key.
///
/// Updating a key replaces its payload and moves it to the end, so replay
/// order reflects when each key last changed.
#[derive(Debug, Clone, Default)]
pub struct RfcLedger {
    entries: Vec<BufferedRfc>,
}

impl RfcLedger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `payload` under `key`. Returns true if an older entry was replaced.
    pub fn add(&mut self, key: RfcKey, payload: Bytes) -> bool {
        let replaced = self.remove(&key);
        self.entries.push(BufferedRfc { key, payload });
        replaced
    }

    /// Remove the entry matching `key`.
    pub fn remove(&mut self, key: &RfcKey) -> bool {
        match self.entries.iter().position(|entry| entry.key.matches(key)) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Remove and return every entry targeting `object_id`, in ledger order.
    pub fn take_object(&mut self, object_id: ObjectId) -> Vec<BufferedRfc> {
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|entry| entry.key.object_id == object_id);
        self.entries = kept;
        taken
    }

    /// Entry matching `key`.
    pub fn get(&self, key: &RfcKey) -> Option<&BufferedRfc> {
        self.entries.iter().find(|entry| entry.key.matches(key))
    }

    /// Entries in replay order.
    pub fn iter(&self) -> impl Iterator<Item = &BufferedRfc> {
        self.entries.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ledger is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
