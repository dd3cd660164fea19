//! Secure storage abstraction and the built-in backends.
//!
//! Records are opaque byte blobs to the storage layer; the manager and trust
//! store decide on JSON encodings. Platform integrations (keychain, keystore)
//! implement [`SecureStorage`] behind the same trait.

use crate::error::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Persistent storage for identity material and trust records.
#[async_trait]
pub trait SecureStorage: Send + Sync {
    /// Reads a record, `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Writes a record, replacing any previous value.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Deletes a record. Deleting an absent key is a no-op.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Lists keys with the given prefix.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-memory storage for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// Creates empty storage.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecureStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.records.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.records.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.records.write().remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .records
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// File-backed storage: one file per record under a directory.
///
/// Record keys may contain `/` separators; they are flattened into file
/// names. The directory is expected to live inside an OS-protected location
/// (app container, encrypted home).
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Opens (and creates if needed) storage rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Flatten the logical key into a single file name so record keys can
        // never escape the storage root.
        let file = key.replace('/', "__");
        self.root.join(format!("{file}.rec"))
    }

    fn key_for(file_name: &str) -> Option<String> {
        file_name
            .strip_suffix(".rec")
            .map(|stem| stem.replace("__", "/"))
    }
}

#[async_trait]
impl SecureStorage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(key) = Self::key_for(name) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Serde helpers for hex-encoded byte fields in persisted records.
pub(crate) mod serde_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(&text).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            let text: Option<String> = Option::deserialize(deserializer)?;
            text.map(|t| hex::decode(&t).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        storage.put("identity/signing/ed25519", vec![1, 2, 3]).await.unwrap();
        assert_eq!(
            storage.get("identity/signing/ed25519").await.unwrap(),
            Some(vec![1, 2, 3])
        );
        assert_eq!(storage.get("missing").await.unwrap(), None);

        storage.delete("identity/signing/ed25519").await.unwrap();
        assert_eq!(storage.get("identity/signing/ed25519").await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_storage_roundtrip_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        storage.put("identity/kem/0101/pqc", b"record-a".to_vec()).await.unwrap();
        storage.put("identity/kem/0001/hybrid", b"record-b".to_vec()).await.unwrap();
        storage.put("trust/device-1", b"record-c".to_vec()).await.unwrap();

        assert_eq!(
            storage.get("identity/kem/0101/pqc").await.unwrap(),
            Some(b"record-a".to_vec())
        );
        let keys = storage.keys("identity/kem/").await.unwrap();
        assert_eq!(keys, vec!["identity/kem/0001/hybrid", "identity/kem/0101/pqc"]);

        // Survives a reopen.
        drop(storage);
        let storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(
            storage.get("trust/device-1").await.unwrap(),
            Some(b"record-c".to_vec())
        );
    }

    #[tokio::test]
    async fn delete_missing_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        storage.delete("never-existed").await.unwrap();
    }
}
