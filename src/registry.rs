//! Durable peer registry
//!
//! The registry is the authority on which peers exist. It is kept in memory
//! and mirrored to a single JSON document in the data directory:
//!
//! ```json
//! {
//!   "schema_version": 1,
//!   "peers": [
//!     { "id": "alice", "name": "Alice", "address": "10.8.0.2", ... }
//!   ]
//! }
//! ```
//!
//! Every mutation rewrites the document through a temp file and a rename, so
//! a reader (or a restart after a crash) sees either the old or the new
//! version, never a torn write. If the write fails the in-memory change is
//! undone before the error is returned.

use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::crypto::Key;
use crate::error::{RegistryError, StorageError};

/// File name of the registry document inside the data directory
pub const REGISTRY_FILE: &str = "peers.json";

const SCHEMA_VERSION: u32 = 1;

/// One provisioned peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: String,
    pub name: String,
    pub address: Ipv4Addr,
    pub public_key: Key,
    /// Kept so the client document can be rendered again later
    pub private_key: Key,
    /// Unix epoch seconds
    pub created_at: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    schema_version: u32,
    #[serde(default)]
    peers: Vec<PeerRecord>,
}

/// File-backed peer registry
#[derive(Debug)]
pub struct PeerRegistry {
    path: PathBuf,
    /// Insertion order is the listing order
    records: Vec<PeerRecord>,
}

impl PeerRegistry {
    /// Open the registry stored under `data_dir`, creating the directory if needed
    pub fn open(data_dir: &Path) -> Result<Self, StorageError> {
        ensure_dir(data_dir)?;
        let path = data_dir.join(REGISTRY_FILE);

        let records = match std::fs::read_to_string(&path) {
            Ok(json) => parse_registry(&path, &json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No registry file at {:?}, starting empty", path);
                Vec::new()
            }
            Err(source) => return Err(StorageError::Io { path, source }),
        };

        tracing::info!("Loaded {} peer(s) from {:?}", records.len(), path);
        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.iter().any(|r| r.id == id)
    }

    pub fn get(&self, id: &str) -> Result<&PeerRecord, RegistryError> {
        self.records
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })
    }

    pub fn list(&self) -> &[PeerRecord] {
        &self.records
    }

    /// Insert a new record, enforcing id and address uniqueness
    pub fn create(&mut self, record: PeerRecord) -> Result<(), RegistryError> {
        if self.contains(&record.id) {
            return Err(RegistryError::DuplicateId { id: record.id });
        }
        if let Some(owner) = self.records.iter().find(|r| r.address == record.address) {
            return Err(RegistryError::DuplicateAddress {
                address: record.address,
                owner: owner.id.clone(),
            });
        }

        self.records.push(record);
        if let Err(e) = self.persist() {
            self.records.pop();
            return Err(e.into());
        }
        Ok(())
    }

    /// Remove a record and return it
    pub fn delete(&mut self, id: &str) -> Result<PeerRecord, RegistryError> {
        let index = self
            .records
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })?;

        let record = self.records.remove(index);
        if let Err(e) = self.persist() {
            self.records.insert(index, record);
            return Err(e.into());
        }
        Ok(record)
    }

    /// Write the whole registry atomically
    fn persist(&self) -> Result<(), StorageError> {
        let file = RegistryFile {
            schema_version: SCHEMA_VERSION,
            peers: self.records.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        write_atomic(&self.path, json.as_bytes())?;
        tracing::debug!("Saved {} peer(s) to {:?}", self.records.len(), self.path);
        Ok(())
    }
}

fn parse_registry(path: &Path, json: &str) -> Result<Vec<PeerRecord>, StorageError> {
    let corrupt = |reason: String| StorageError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let file: RegistryFile = serde_json::from_str(json).map_err(|e| corrupt(e.to_string()))?;
    if file.schema_version != SCHEMA_VERSION {
        return Err(corrupt(format!(
            "unsupported schema version {}",
            file.schema_version
        )));
    }

    for (i, record) in file.peers.iter().enumerate() {
        for other in &file.peers[..i] {
            if other.id == record.id {
                return Err(corrupt(format!("duplicate peer id {}", record.id)));
            }
            if other.address == record.address {
                return Err(corrupt(format!(
                    "address {} assigned to both {} and {}",
                    record.address, other.id, record.id
                )));
            }
        }
    }

    Ok(file.peers)
}

/// Ensure the data directory exists with restricted permissions
fn ensure_dir(dir: &Path) -> Result<(), StorageError> {
    if dir.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dir).map_err(|source| StorageError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o750)).ok();
    }
    Ok(())
}

/// Write `contents` to `path` via a temp file in the same directory
///
/// The temp file is removed again when any step fails.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    let tmp = path.with_extension("json.tmp");

    write_and_rename(&tmp, path, contents).map_err(|source| {
        std::fs::remove_file(&tmp).ok();
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

fn write_and_rename(tmp: &Path, path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    // Private keys live in this file
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    {
        let mut file = options.open(tmp)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(contents)?;
        file.sync_all()?;
    }

    std::fs::rename(tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyProvider, OsKeyProvider};
    use tempfile::TempDir;

    fn record(id: &str, last_octet: u8) -> PeerRecord {
        let pair = OsKeyProvider.generate().unwrap();
        PeerRecord {
            id: id.to_string(),
            name: id.to_uppercase(),
            address: Ipv4Addr::new(10, 8, 0, last_octet),
            public_key: pair.public_key,
            private_key: pair.private_key,
            created_at: 1_706_600_000,
        }
    }

    #[test]
    fn test_create_get_list_in_insertion_order() {
        let dir = TempDir::new().unwrap();
        let mut registry = PeerRegistry::open(dir.path()).unwrap();
        assert!(registry.is_empty());

        registry.create(record("carol", 4)).unwrap();
        registry.create(record("alice", 2)).unwrap();
        registry.create(record("bob", 3)).unwrap();

        let ids: Vec<_> = registry.list().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["carol", "alice", "bob"]);
        assert_eq!(registry.get("alice").unwrap().address, Ipv4Addr::new(10, 8, 0, 2));
        assert!(matches!(
            registry.get("dave"),
            Err(RegistryError::NotFound { .. })
        ));
    }

    #[test]
    fn test_uniqueness_is_enforced() {
        let dir = TempDir::new().unwrap();
        let mut registry = PeerRegistry::open(dir.path()).unwrap();
        registry.create(record("alice", 2)).unwrap();

        let err = registry.create(record("alice", 3)).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateId { ref id } if id == "alice"));

        let err = registry.create(record("bob", 2)).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateAddress { ref owner, .. } if owner == "alice"));

        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let alice = record("alice", 2);
        {
            let mut registry = PeerRegistry::open(dir.path()).unwrap();
            registry.create(alice.clone()).unwrap();
            registry.create(record("bob", 3)).unwrap();
            registry.delete("bob").unwrap();
        }

        let registry = PeerRegistry::open(dir.path()).unwrap();
        assert_eq!(registry.list(), &[alice]);
    }

    #[test]
    fn test_delete_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let mut registry = PeerRegistry::open(dir.path()).unwrap();
        registry.create(record("alice", 2)).unwrap();

        let removed = registry.delete("alice").unwrap();
        assert_eq!(removed.id, "alice");
        assert!(matches!(
            registry.delete("alice"),
            Err(RegistryError::NotFound { .. })
        ));
    }

    #[test]
    fn test_open_missing_dir_creates_it() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("state").join("peers");
        let registry = PeerRegistry::open(&nested).unwrap();
        assert!(nested.is_dir());
        assert_eq!(registry.path(), nested.join(REGISTRY_FILE));
    }

    #[test]
    fn test_corrupted_json_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(REGISTRY_FILE),
            b"{ invalid json without closing brace",
        )
        .unwrap();

        let err = PeerRegistry::open(dir.path()).unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }

    #[test]
    fn test_duplicate_addresses_on_disk_are_rejected() {
        let dir = TempDir::new().unwrap();
        let file = RegistryFile {
            schema_version: SCHEMA_VERSION,
            peers: vec![record("alice", 2), record("bob", 2)],
        };
        std::fs::write(
            dir.path().join(REGISTRY_FILE),
            serde_json::to_string(&file).unwrap(),
        )
        .unwrap();

        let err = PeerRegistry::open(dir.path()).unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { ref reason, .. } if reason.contains("10.8.0.2")));
    }

    #[test]
    fn test_unknown_schema_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(REGISTRY_FILE),
            r#"{"schema_version": 7, "peers": []}"#,
        )
        .unwrap();
        assert!(PeerRegistry::open(dir.path()).is_err());
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let mut registry = PeerRegistry::open(dir.path()).unwrap();
        registry.create(record("alice", 2)).unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![REGISTRY_FILE.to_string()]);
    }

    #[test]
    fn test_failed_rename_removes_temp_file() {
        let dir = TempDir::new().unwrap();
        let mut registry = PeerRegistry::open(dir.path()).unwrap();

        // A directory in the registry's place makes the rename fail, even as root
        std::fs::create_dir(dir.path().join(REGISTRY_FILE)).unwrap();

        let err = registry.create(record("alice", 2)).unwrap_err();
        assert!(matches!(err, RegistryError::Storage(_)));
        assert!(registry.is_empty());
        assert!(!dir.path().join("peers.json.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_registry_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let mut registry = PeerRegistry::open(dir.path()).unwrap();
        registry.create(record("alice", 2)).unwrap();

        let mode = std::fs::metadata(registry.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_write_rolls_back_memory() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let mut registry = PeerRegistry::open(dir.path()).unwrap();
        registry.create(record("alice", 2)).unwrap();

        // Read-only directory: the temp file cannot be created
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o500)).unwrap();
        let scratch = dir.path().join("scratch");
        let writable = std::fs::write(&scratch, b"x").is_ok();
        if writable {
            // Running as root ignores directory permissions
            std::fs::remove_file(&scratch).ok();
            std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let err = registry.create(record("bob", 3)).unwrap_err();
        assert!(matches!(err, RegistryError::Storage(_)));
        assert_eq!(registry.len(), 1);

        let err = registry.delete("alice").unwrap_err();
        assert!(matches!(err, RegistryError::Storage(_)));
        assert!(registry.contains("alice"));

        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}
