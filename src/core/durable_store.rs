/*
 * Durable, cross-session storage. The engine only needs a key/value blob store
 * (`BlobStoreOperations`); `CoreBlobStore` implements it with one file per key
 * inside a storage directory. On top of the raw blobs this module defines the
 * two persisted documents: the per-root token cache (with 7-day pruning of
 * entries that were not used) and the checked-paths list of a session.
 *
 * Decoding failures are reported as `StoreError::Serde`; the token cache treats
 * any such error as a cache miss and rebuilds from scratch.
 */
use crate::core::path_utils;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

pub const TOKEN_CACHE_FORMAT_VERSION: u32 = 2;
pub const SELECTION_FORMAT_VERSION: u32 = 1;

// Entries not used for this long are dropped when the cache is loaded.
pub const PRUNE_AFTER_SECS: i64 = 7 * 24 * 60 * 60;

const STORAGE_SUBFOLDER_NAME: &str = "token_cache";
const BLOB_FILE_EXTENSION: &str = "json";

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    Serde(serde_json::Error),
    NoStorageDirectory,
    InvalidKey(String),
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serde(err)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "Storage I/O error: {e}"),
            StoreError::Serde(e) => write!(f, "Stored document is malformed: {e}"),
            StoreError::NoStorageDirectory => {
                write!(f, "Could not determine a directory for durable storage")
            }
            StoreError::InvalidKey(key) => write!(f, "Invalid storage key: {key}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(e) => Some(e),
            StoreError::Serde(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

pub fn now_unix_seconds() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/*
 * Key/value blob storage consumed by the engine. `load_blob` returns
 * `Ok(None)` for a key that was never written.
 */
pub trait BlobStoreOperations: Send + Sync {
    fn load_blob(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn save_blob(&self, key: &str, blob: &[u8]) -> Result<()>;
}

pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/*
 * File-backed blob store: every key maps to `<dir>/<key>.json`. Writes go to a
 * temporary sibling first and are renamed into place, so a crash mid-write
 * leaves the previous blob intact.
 */
pub struct CoreBlobStore {
    storage_dir: PathBuf,
}

impl CoreBlobStore {
    pub fn new(storage_dir: PathBuf) -> Self {
        CoreBlobStore { storage_dir }
    }

    pub fn for_app(app_name: &str) -> Result<Self> {
        let base = path_utils::get_base_app_config_local_dir(app_name)
            .ok_or(StoreError::NoStorageDirectory)?;
        Ok(CoreBlobStore::new(base.join(STORAGE_SUBFOLDER_NAME)))
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf> {
        if !is_valid_key(key) {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self
            .storage_dir
            .join(format!("{key}.{BLOB_FILE_EXTENSION}")))
    }
}

impl BlobStoreOperations for CoreBlobStore {
    fn load_blob(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(key)?;
        match fs::read(&path) {
            Ok(bytes) => {
                log::trace!("CoreBlobStore: Loaded {} bytes from {path:?}.", bytes.len());
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    fn save_blob(&self, key: &str, blob: &[u8]) -> Result<()> {
        let path = self.blob_path(key)?;
        if !self.storage_dir.exists() {
            fs::create_dir_all(&self.storage_dir)?;
            log::debug!("CoreBlobStore: Created storage directory {:?}.", self.storage_dir);
        }
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, blob)?;
        fs::rename(&temp_path, &path)?;
        log::trace!("CoreBlobStore: Saved {} bytes to {path:?}.", blob.len());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedTokenEntry {
    pub modified_at: u64,
    pub token_count: usize,
    pub last_used: i64,
}

/*
 * Token cache document of one workspace root. Entries are keyed by the path
 * relative to the root, using '/' separators. `estimator` records which
 * counting scheme produced the entries.
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedTokenCache {
    pub version: u32,
    pub root: PathBuf,
    pub estimator: String,
    pub entries: HashMap<String, PersistedTokenEntry>,
}

impl PersistedTokenCache {
    pub fn new(root: PathBuf, estimator: &str) -> Self {
        PersistedTokenCache {
            version: TOKEN_CACHE_FORMAT_VERSION,
            root,
            estimator: estimator.to_string(),
            entries: HashMap::new(),
        }
    }

    // Drops entries unused for longer than `PRUNE_AFTER_SECS`; returns how many.
    pub fn prune_inactive(&mut self, now_unix: i64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now_unix - entry.last_used <= PRUNE_AFTER_SECS);
        before - self.entries.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /*
     * Decodes a stored document. A document written by a different format
     * version is rejected like a corrupted one.
     */
    pub fn decode(blob: &[u8]) -> Result<Self> {
        let cache: PersistedTokenCache = serde_json::from_slice(blob)?;
        if cache.version != TOKEN_CACHE_FORMAT_VERSION {
            return Err(StoreError::Serde(serde::de::Error::custom(format!(
                "unsupported token cache version {}",
                cache.version
            ))));
        }
        Ok(cache)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersistedSelection {
    pub version: u32,
    pub checked_paths: Vec<PathBuf>,
}

impl PersistedSelection {
    pub fn new(checked_paths: Vec<PathBuf>) -> Self {
        PersistedSelection {
            version: SELECTION_FORMAT_VERSION,
            checked_paths,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn decode(blob: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(blob)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(last_used: i64) -> PersistedTokenEntry {
        PersistedTokenEntry {
            modified_at: 42,
            token_count: 7,
            last_used,
        }
    }

    #[test]
    fn test_core_blob_store_save_and_load() {
        // Arrange
        let dir = tempdir().unwrap();
        let store = CoreBlobStore::new(dir.path().join("blobs"));

        // Act
        store.save_blob("tokens-abc", b"payload").unwrap();
        let loaded = store.load_blob("tokens-abc").unwrap();

        // Assert
        assert_eq!(loaded.as_deref(), Some(&b"payload"[..]));
        assert!(!dir.path().join("blobs").join("tokens-abc.tmp").exists());
    }

    #[test]
    fn test_core_blob_store_missing_key_is_none() {
        let dir = tempdir().unwrap();
        let store = CoreBlobStore::new(dir.path().to_path_buf());
        assert!(store.load_blob("never-written").unwrap().is_none());
    }

    #[test]
    fn test_core_blob_store_rejects_path_like_keys() {
        let dir = tempdir().unwrap();
        let store = CoreBlobStore::new(dir.path().to_path_buf());
        let result = store.save_blob("../escape", b"x");
        assert!(matches!(result, Err(StoreError::InvalidKey(_))));
    }

    #[test]
    fn test_prune_inactive_drops_entries_older_than_seven_days() {
        // Arrange
        let now = 1_700_000_000;
        let mut cache = PersistedTokenCache::new(PathBuf::from("/ws"), "byte-ratio-4");
        cache.entries.insert("fresh.rs".into(), entry(now - 60));
        cache.entries.insert("edge.rs".into(), entry(now - PRUNE_AFTER_SECS));
        cache
            .entries
            .insert("stale.rs".into(), entry(now - PRUNE_AFTER_SECS - 1));

        // Act
        let pruned = cache.prune_inactive(now);

        // Assert
        assert_eq!(pruned, 1);
        assert!(cache.entries.contains_key("fresh.rs"));
        assert!(cache.entries.contains_key("edge.rs"));
        assert!(!cache.entries.contains_key("stale.rs"));
    }

    #[test]
    fn test_token_cache_document_round_trips_and_rejects_garbage() {
        let mut cache = PersistedTokenCache::new(PathBuf::from("/ws"), "byte-ratio-4");
        cache.entries.insert("src/a.rs".into(), entry(5));

        let decoded = PersistedTokenCache::decode(&cache.encode().unwrap()).unwrap();
        assert_eq!(decoded, cache);

        assert!(matches!(
            PersistedTokenCache::decode(b"{ truncated"),
            Err(StoreError::Serde(_))
        ));
    }

    #[test]
    fn test_token_cache_document_rejects_other_versions() {
        let mut cache = PersistedTokenCache::new(PathBuf::from("/ws"), "byte-ratio-4");
        cache.version = TOKEN_CACHE_FORMAT_VERSION + 1;
        let blob = cache.encode().unwrap();
        assert!(PersistedTokenCache::decode(&blob).is_err());
    }
}
