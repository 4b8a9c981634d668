//! Admin password and ban lists, stored as one entry per line.

use crate::error::StoreError;
use crate::store::FileStore;
use bytes::Bytes;
use std::collections::BTreeSet;
use tracing::info;

/// File holding admin passwords.
pub const ADMIN_FILE: &str = "admin.txt";

/// File holding ban entries.
pub const BAN_FILE: &str = "ban.txt";

/// A persisted set of text entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryList {
    file: &'static str,
    entries: BTreeSet<String>,
}

impl EntryList {
    /// Empty list persisted to `file`.
    pub fn new(file: &'static str) -> Self {
        Self {
            file,
            entries: BTreeSet::new(),
        }
    }

    /// Admin password list.
    pub fn admins() -> Self {
        Self::new(ADMIN_FILE)
    }

    /// Ban list.
    pub fn bans() -> Self {
        Self::new(BAN_FILE)
    }

    /// Merge entries from the store. Blank lines and `#` comments are skipped.
    pub fn load(&mut self, store: &dyn FileStore) -> Result<usize, StoreError> {
        let Some(bytes) = store.load(self.file)? else {
            return Ok(0);
        };
        let text = String::from_utf8_lossy(&bytes);
        let before = self.entries.len();
        for line in text.lines() {
            let line = line.trim();
            if !line.is_empty() && !line.starts_with('#') {
                self.entries.insert(line.to_string());
            }
        }
        let added = self.entries.len() - before;
        info!(file = self.file, entries = self.entries.len(), "Loaded entry list");
        Ok(added)
    }

    /// Store name this list persists to.
    pub fn file(&self) -> &'static str {
        self.file
    }

    /// Every entry, one per line.
    pub fn to_bytes(&self) -> Bytes {
        let mut text = String::new();
        for entry in &self.entries {
            text.push_str(entry);
            text.push('\n');
        }
        Bytes::from(text)
    }

    /// Write every entry to the store.
    pub fn save(&self, store: &dyn FileStore) -> Result<(), StoreError> {
        store.save(self.file, &self.to_bytes())
    }

    /// Add an entry. Returns false if already present.
    pub fn add(&mut self, entry: &str) -> bool {
        let entry = entry.trim();
        !entry.is_empty() && self.entries.insert(entry.to_string())
    }

    /// Remove an entry.
    pub fn remove(&mut self, entry: &str) -> bool {
        self.entries.remove(entry.trim())
    }

    /// Replace every entry.
    pub fn replace<I, S>(&mut self, entries: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.entries.clear();
        for entry in entries {
            self.add(entry.as_ref());
        }
    }

    /// Whether `entry` is listed.
    pub fn contains(&self, entry: &str) -> bool {
        self.entries.contains(entry)
    }

    /// Entries, sorted.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
