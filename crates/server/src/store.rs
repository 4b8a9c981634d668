//! Named blob storage used for bulk-data packets, admin/ban lists and snapshots.

use crate::admin::{ADMIN_FILE, BAN_FILE};
use crate::broker::SNAPSHOT_FILE;
use crate::error::StoreError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tether_net::{ConnectionId, ServerMessage};
use tracing::{debug, info, warn};

/// Names the broker keeps for itself; file packets may not touch them.
pub const RESERVED_FILES: [&str; 3] = [ADMIN_FILE, BAN_FILE, SNAPSHOT_FILE];

/// Storage for opaque named blobs.
pub trait FileStore: Send + Sync {
    /// Read a blob; `Ok(None)` if it does not exist.
    fn load(&self, name: &str) -> Result<Option<Bytes>, StoreError>;
    /// Write a blob, replacing any previous contents.
    fn save(&self, name: &str, data: &[u8]) -> Result<(), StoreError>;
    /// Remove a blob. Returns false if it did not exist.
    fn delete(&self, name: &str) -> Result<bool, StoreError>;
    /// Names starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Reject empty, absolute and parent-escaping names.
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    let unsafe_name = || StoreError::UnsafeName(name.to_string());
    if name.is_empty() || name.contains('\\') || name.contains('\0') {
        return Err(unsafe_name());
    }
    for component in Path::new(name).components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(unsafe_name()),
        }
    }
    Ok(())
}

/// Whether `name` resolves to one of [`RESERVED_FILES`].
///
/// Compared on normalized components and without case, so `admin.txt/.` or
/// `ADMIN.TXT` on a case-insensitive filesystem are caught too.
pub fn is_reserved_name(name: &str) -> bool {
    let normalized: Vec<_> = Path::new(name)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    let normalized = normalized.join("/");
    RESERVED_FILES
        .iter()
        .any(|reserved| normalized.eq_ignore_ascii_case(reserved))
}

/// A store operation queued by the broker tick and carried out off-tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreRequest {
    /// Write `data` under `name`.
    Save {
        /// Store name.
        name: String,
        /// Contents.
        data: Bytes,
    },
    /// Remove `name`.
    Delete {
        /// Store name.
        name: String,
    },
    /// Read `name` and answer `conn` with `FileLoaded`.
    Load {
        /// Requesting connection.
        conn: ConnectionId,
        /// Store name.
        name: String,
    },
    /// List names under `prefix` and answer `conn` with `FileList`.
    List {
        /// Requesting connection.
        conn: ConnectionId,
        /// Name prefix.
        prefix: String,
    },
}

impl StoreRequest {
    /// Run against `store`. Returns the reply owed to a connection, if any.
    pub fn execute(self, store: &dyn FileStore) -> Option<(ConnectionId, ServerMessage)> {
        match self {
            StoreRequest::Save { name, data } => {
                match store.save(&name, &data) {
                    Ok(()) => debug!(file = %name, bytes = data.len(), "File saved"),
                    Err(err) => warn!(file = %name, error = %err, "Failed to save file"),
                }
                None
            }
            StoreRequest::Delete { name } => {
                match store.delete(&name) {
                    Ok(true) => info!(file = %name, "File deleted"),
                    Ok(false) => debug!(file = %name, "Deleted file did not exist"),
                    Err(err) => warn!(file = %name, error = %err, "Failed to delete file"),
                }
                None
            }
            StoreRequest::Load { conn, name } => {
                let data = store.load(&name).unwrap_or_else(|err| {
                    warn!(conn, file = %name, error = %err, "Failed to load file");
                    None
                });
                Some((conn, ServerMessage::FileLoaded { name, data }))
            }
            StoreRequest::List { conn, prefix } => {
                let names = match store.list(&prefix) {
                    Ok(mut names) => {
                        names.retain(|name| !is_reserved_name(name));
                        names
                    }
                    Err(err) => {
                        warn!(conn, error = %err, "Failed to list files");
                        Vec::new()
                    }
                };
                Some((conn, ServerMessage::FileList { prefix, names }))
            }
        }
    }
}

/// Filesystem store rooted at a data directory.
pub struct FsFileStore {
    root: PathBuf,
}

impl FsFileStore {
    /// Use `root`, creating it if needed.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    fn collect(&self, dir: &Path, names: &mut Vec<String>) -> Result<(), StoreError> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                self.collect(&path, names)?;
            } else if let Ok(relative) = path.strip_prefix(&self.root) {
                let parts: Vec<_> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                names.push(parts.join("/"));
            }
        }
        Ok(())
    }
}

impl FileStore for FsFileStore {
    fn load(&self, name: &str) -> Result<Option<Bytes>, StoreError> {
        match fs::read(self.path(name)?) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, name: &str, data: &[u8]) -> Result<(), StoreError> {
        let path = self.path(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Readers never observe a partially written file.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<bool, StoreError> {
        match fs::remove_file(self.path(name)?) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        self.collect(&self.root, &mut names)?;
        names.retain(|name| name.starts_with(prefix));
        names.sort();
        Ok(names)
    }
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryFileStore {
    files: Mutex<BTreeMap<String, Bytes>>,
}

impl MemoryFileStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileStore for MemoryFileStore {
    fn load(&self, name: &str) -> Result<Option<Bytes>, StoreError> {
        validate_name(name)?;
        Ok(self.files.lock().get(name).cloned())
    }

    fn save(&self, name: &str, data: &[u8]) -> Result<(), StoreError> {
        validate_name(name)?;
        self.files
            .lock()
            .insert(name.to_string(), Bytes::copy_from_slice(data));
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<bool, StoreError> {
        validate_name(name)?;
        Ok(self.files.lock().remove(name).is_some())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .files
            .lock()
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("save/slot1.dat").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("../etc/passwd").is_err());
        assert!(validate_name("a/../../b").is_err());
        assert!(validate_name("/etc/passwd").is_err());
        assert!(validate_name("a\\b").is_err());
    }

    #[test]
    fn test_fs_store_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsFileStore::new(dir.path()).expect("store");
        store.save("maps/one.bin", b"1").expect("save");
        store.save("maps/two.bin", b"22").expect("save");
        store.save("other.txt", b"x").expect("save");

        assert_eq!(
            store.load("maps/two.bin").expect("load"),
            Some(Bytes::from_static(b"22"))
        );
        assert_eq!(store.load("missing").expect("load"), None);
        assert_eq!(
            store.list("maps/").expect("list"),
            vec!["maps/one.bin".to_string(), "maps/two.bin".to_string()]
        );
        assert!(store.delete("maps/one.bin").expect("delete"));
        assert!(!store.delete("maps/one.bin").expect("delete"));
    }

    #[test]
    fn test_fs_store_rejects_escape() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsFileStore::new(dir.path().join("data")).expect("store");
        assert!(matches!(
            store.save("../outside", b"x"),
            Err(StoreError::UnsafeName(_))
        ));
    }

    #[test]
    fn test_reserved_names() {
        assert!(is_reserved_name("admin.txt"));
        assert!(is_reserved_name("BAN.TXT"));
        assert!(is_reserved_name("server.dat/."));
        assert!(!is_reserved_name("saves/admin.txt"));
        assert!(!is_reserved_name("server.dat.bak"));
    }

    #[test]
    fn test_requests_reply_and_hide_reserved() {
        let store = MemoryFileStore::new();
        store.save(ADMIN_FILE, b"hunter2\n").expect("save");

        let save = StoreRequest::Save {
            name: "notes.txt".into(),
            data: Bytes::from_static(b"hi"),
        };
        assert_eq!(save.execute(&store), None);

        let reply = StoreRequest::Load {
            conn: 4,
            name: "notes.txt".into(),
        }
        .execute(&store);
        assert_eq!(
            reply,
            Some((
                4,
                ServerMessage::FileLoaded {
                    name: "notes.txt".into(),
                    data: Some(Bytes::from_static(b"hi")),
                }
            ))
        );

        let reply = StoreRequest::List {
            conn: 4,
            prefix: String::new(),
        }
        .execute(&store);
        assert_eq!(
            reply,
            Some((
                4,
                ServerMessage::FileList {
                    prefix: String::new(),
                    names: vec!["notes.txt".to_string()],
                }
            ))
        );

        StoreRequest::Delete {
            name: "notes.txt".into(),
        }
        .execute(&store);
        assert_eq!(store.load("notes.txt").expect("load"), None);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryFileStore::new();
        store.save("a", b"1").expect("save");
        store.save("ab", b"2").expect("save");
        store.save("b", b"3").expect("save");
        assert_eq!(store.list("a").expect("list"), vec!["a", "ab"]);
        assert!(store.delete("a").expect("delete"));
        assert_eq!(store.load("a").expect("load"), None);
    }
}
