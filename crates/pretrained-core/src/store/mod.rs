//! On-disk artifact cache.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/index                                  JSON metadata index
//! <root>/index.lock                             cross-process index lock
//! <root>/<name>/<language>/<version>/artifact   committed artifact
//! <root>/<name>/<language>/<version>/artifact.part
//! <root>/<name>/<language>/<version>/.lock
//! ```
//!
//! Artifact files are written under a temporary name, verified, synced and
//! renamed into place, and only then recorded in the index. The index itself
//! is replaced atomically, so neither readers in this process nor other
//! processes sharing the root ever observe a partially written artifact or
//! an index entry without its file.

mod atomic;
mod lock;

pub use atomic::{atomic_read_json, atomic_write_json};
pub use lock::FileLock;

use crate::config::PathsConfig;
use crate::error::{PretrainedError, Result};
use crate::hashing::{compute_sha256, RollingChecksum};
use crate::types::{ArtifactKey, ArtifactKind, ArtifactRecord};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// Current on-disk index format.
const INDEX_FORMAT_VERSION: u32 = 1;

/// Serialized form of the index file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexData {
    version: u32,
    records: Vec<ArtifactRecord>,
}

/// Artifact cache rooted at a fixed directory.
///
/// A handle keeps the root it was opened with for its whole lifetime.
pub struct ArtifactStore {
    root: PathBuf,
    index_path: PathBuf,
    index_lock_path: PathBuf,
    records: RwLock<HashMap<ArtifactKey, ArtifactRecord>>,
}

impl std::fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl ArtifactStore {
    /// Open (creating if needed) the store at `root` and load its index.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| PretrainedError::InvalidPath {
            path: root.clone(),
            message: format!("cannot create cache root: {}", e),
        })?;

        let store = Self {
            index_path: root.join(PathsConfig::INDEX_FILE_NAME),
            index_lock_path: root.join(PathsConfig::INDEX_LOCK_FILE_NAME),
            root,
            records: RwLock::new(HashMap::new()),
        };
        store.refresh()?;
        info!(
            "Opened artifact store at {} ({} records)",
            store.root.display(),
            store.len()
        );
        Ok(store)
    }

    /// The cache root of this handle.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding everything for one resolved key.
    pub fn artifact_dir(&self, key: &ArtifactKey) -> PathBuf {
        self.root
            .join(&key.name)
            .join(&key.language)
            .join(&key.version)
    }

    /// Final path of a committed artifact.
    pub fn artifact_path(&self, key: &ArtifactKey) -> PathBuf {
        self.artifact_dir(key).join(PathsConfig::ARTIFACT_FILE_NAME)
    }

    /// Path downloads stream into before commit.
    pub fn partial_path(&self, key: &ArtifactKey) -> PathBuf {
        self.artifact_dir(key).join(format!(
            "{}{}",
            PathsConfig::ARTIFACT_FILE_NAME,
            PathsConfig::PARTIAL_SUFFIX
        ))
    }

    /// Cross-process lock file guarding downloads of one key.
    pub fn lock_path(&self, key: &ArtifactKey) -> PathBuf {
        self.artifact_dir(key).join(PathsConfig::ARTIFACT_LOCK_FILE_NAME)
    }

    /// Take the cross-process download lock for `key`. Blocks.
    pub fn lock_artifact(&self, key: &ArtifactKey) -> Result<FileLock> {
        ensure_concrete(key)?;
        FileLock::acquire(&self.lock_path(key))
    }

    /// Number of records in the in-memory index.
    pub fn len(&self) -> usize {
        self.read_records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a resolved key.
    ///
    /// A record whose artifact file has disappeared is treated as a miss and
    /// removed from the index.
    pub fn lookup(&self, key: &ArtifactKey) -> Result<Option<ArtifactRecord>> {
        ensure_concrete(key)?;
        let record = match self.read_records().get(key) {
            Some(record) => record.clone(),
            None => return Ok(None),
        };

        if record.local_path.is_file() {
            return Ok(Some(record));
        }

        warn!(
            "Artifact file for {} is missing at {}, dropping index entry",
            key,
            record.local_path.display()
        );
        self.update_index(|records| {
            if records
                .get(key)
                .is_some_and(|r| !r.local_path.is_file())
            {
                records.remove(key);
            }
        })?;
        Ok(None)
    }

    /// Update `last_used_at` of a record. Returns the updated record.
    pub fn touch(&self, key: &ArtifactKey) -> Result<Option<ArtifactRecord>> {
        ensure_concrete(key)?;
        if !self.read_records().contains_key(key) {
            return Ok(None);
        }

        let now = Utc::now();
        let mut touched = None;
        self.update_index(|records| {
            if let Some(record) = records.get_mut(key) {
                record.last_used_at = now;
                touched = Some(record.clone());
            }
        })?;
        debug!("Touched {}", key);
        Ok(touched)
    }

    /// Commit a fully written file as the artifact for `key`.
    ///
    /// `staged` must live on the same filesystem as the cache root (the
    /// partial path does). Its checksum is verified before it is renamed into
    /// place; on mismatch the staged file is removed and `CorruptArtifact` is
    /// returned without touching the index.
    pub fn commit_staged(
        &self,
        kind: ArtifactKind,
        key: &ArtifactKey,
        staged: &Path,
        expected_checksum: &str,
    ) -> Result<ArtifactRecord> {
        ensure_concrete(key)?;
        key.validate()?;

        let actual = compute_sha256(staged)?;
        if actual != expected_checksum {
            remove_quietly(staged);
            return Err(PretrainedError::CorruptArtifact {
                url: staged.display().to_string(),
                expected: expected_checksum.to_string(),
                actual,
            });
        }

        let file = fs::File::open(staged).map_err(|e| PretrainedError::disk_with_path(e, staged))?;
        let size_bytes = file
            .metadata()
            .map_err(|e| PretrainedError::disk_with_path(e, staged))?
            .len();
        file.sync_all()
            .map_err(|e| PretrainedError::disk("Failed to sync staged artifact", staged, e))?;
        drop(file);

        let target = self.artifact_path(key);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| PretrainedError::disk("Failed to create artifact directory", parent, e))?;
        }
        fs::rename(staged, &target).map_err(|e| {
            remove_quietly(staged);
            PretrainedError::disk(
                format!("Failed to move {} into place", staged.display()),
                &target,
                e,
            )
        })?;

        self.record_commit(kind, key, actual, target, size_bytes)
    }

    /// Commit an artifact from a byte reader.
    ///
    /// Bytes are written to a temporary file in the artifact directory while
    /// being hashed, then verified, synced and renamed into place.
    pub fn commit_reader<R: Read>(
        &self,
        kind: ArtifactKind,
        key: &ArtifactKey,
        mut reader: R,
        expected_checksum: &str,
    ) -> Result<ArtifactRecord> {
        ensure_concrete(key)?;
        key.validate()?;

        let dir = self.artifact_dir(key);
        fs::create_dir_all(&dir)
            .map_err(|e| PretrainedError::disk("Failed to create artifact directory", &dir, e))?;

        let mut temp = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|e| PretrainedError::disk("Failed to create temp file", &dir, e))?;
        let mut checksum = RollingChecksum::new();
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let read = reader
                .read(&mut buffer)
                .map_err(|e| PretrainedError::disk("Failed to read artifact source", temp.path(), e))?;
            if read == 0 {
                break;
            }
            temp.write_all(&buffer[..read])
                .map_err(|e| PretrainedError::disk("Failed to write temp file", temp.path(), e))?;
            checksum.update(&buffer[..read]);
        }

        let size_bytes = checksum.bytes();
        let actual = checksum.finalize_hex();
        if actual != expected_checksum {
            return Err(PretrainedError::CorruptArtifact {
                url: key.to_string(),
                expected: expected_checksum.to_string(),
                actual,
            });
        }

        temp.as_file()
            .sync_all()
            .map_err(|e| PretrainedError::disk("Failed to sync temp file", temp.path(), e))?;
        let target = self.artifact_path(key);
        temp.persist(&target).map_err(|e| {
            PretrainedError::disk(
                "Failed to move artifact into place",
                &target,
                e.error,
            )
        })?;

        self.record_commit(kind, key, actual, target, size_bytes)
    }

    /// Remove an artifact and its index entry. Absent keys are a no-op.
    ///
    /// Returns whether a record existed.
    pub fn evict(&self, key: &ArtifactKey) -> Result<bool> {
        ensure_concrete(key)?;

        let mut existed = false;
        self.update_index(|records| {
            existed = records.remove(key).is_some();
        })?;

        let artifact = self.artifact_path(key);
        match fs::remove_file(&artifact) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(PretrainedError::disk("Failed to remove artifact", &artifact, e)),
        }
        remove_quietly(&self.partial_path(key));
        remove_empty_dirs(&self.root, &self.artifact_dir(key));

        if existed {
            info!("Evicted {}", key);
        }
        Ok(existed)
    }

    /// Reload the in-memory index from disk.
    ///
    /// Picks up commits and evictions made by other processes.
    pub fn refresh(&self) -> Result<()> {
        let loaded = self.load_index()?;
        let mut records = self.write_records()?;
        *records = loaded;
        Ok(())
    }

    /// All records, least recently used first.
    pub fn list(&self) -> Vec<ArtifactRecord> {
        let mut records: Vec<ArtifactRecord> = self.read_records().values().cloned().collect();
        records.sort_by(|a, b| {
            a.last_used_at
                .cmp(&b.last_used_at)
                .then_with(|| a.key.cmp(&b.key))
        });
        records
    }

    /// Sum of the sizes of all committed artifacts.
    pub fn total_size(&self) -> u64 {
        self.read_records().values().map(|r| r.size_bytes).sum()
    }

    /// Evict least-recently-used artifacts until the cache fits in `max_bytes`.
    ///
    /// Returns the evicted keys in eviction order.
    pub fn evict_lru(&self, max_bytes: u64) -> Result<Vec<ArtifactKey>> {
        let mut total = self.total_size();
        let mut evicted = Vec::new();
        for record in self.list() {
            if total <= max_bytes {
                break;
            }
            self.evict(&record.key)?;
            total = total.saturating_sub(record.size_bytes);
            evicted.push(record.key);
        }
        if !evicted.is_empty() {
            info!(
                "Pruned {} artifacts, cache now {} bytes (limit {})",
                evicted.len(),
                total,
                max_bytes
            );
        }
        Ok(evicted)
    }

    fn record_commit(
        &self,
        kind: ArtifactKind,
        key: &ArtifactKey,
        checksum: String,
        local_path: PathBuf,
        size_bytes: u64,
    ) -> Result<ArtifactRecord> {
        let now = Utc::now();
        let record = ArtifactRecord {
            key: key.clone(),
            kind,
            resolved_version: key.version.clone(),
            checksum,
            local_path,
            size_bytes,
            downloaded_at: now,
            last_used_at: now,
        };

        let inserted = record.clone();
        self.update_index(move |records| {
            records.insert(inserted.key.clone(), inserted);
        })?;
        info!("Committed {} ({} bytes)", key, size_bytes);
        Ok(record)
    }

    /// Read-modify-write the index under the cross-process index lock.
    ///
    /// The on-disk index is re-read under the lock so concurrent writers in
    /// other processes are merged rather than overwritten.
    fn update_index<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut HashMap<ArtifactKey, ArtifactRecord>),
    {
        let _lock = FileLock::acquire(&self.index_lock_path)?;
        let loaded = self.load_index()?;
        let mut records = self.write_records()?;
        *records = loaded;
        mutate(&mut *records);

        let mut data = IndexData {
            version: INDEX_FORMAT_VERSION,
            records: records.values().cloned().collect(),
        };
        data.records.sort_by(|a, b| a.key.cmp(&b.key));
        atomic_write_json(&self.index_path, &data)
    }

    /// Read the on-disk index.
    ///
    /// A missing or unparsable index reads as empty; I/O failures propagate
    /// so a transient read error never overwrites existing records.
    fn load_index(&self) -> Result<HashMap<ArtifactKey, ArtifactRecord>> {
        match atomic_read_json::<IndexData>(&self.index_path) {
            Ok(Some(data)) => {
                if data.version != INDEX_FORMAT_VERSION {
                    warn!(
                        "Index {} has format version {}, expected {}",
                        self.index_path.display(),
                        data.version,
                        INDEX_FORMAT_VERSION
                    );
                }
                Ok(data
                    .records
                    .into_iter()
                    .map(|record| (record.key.clone(), record))
                    .collect())
            }
            Ok(None) => Ok(HashMap::new()),
            Err(e @ PretrainedError::Json { .. }) => {
                warn!("Ignoring corrupt index at {}: {}", self.index_path.display(), e);
                Ok(HashMap::new())
            }
            Err(e) => Err(e),
        }
    }

    fn read_records(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ArtifactKey, ArtifactRecord>> {
        match self.records.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_records(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<ArtifactKey, ArtifactRecord>>> {
        self.records.write().map_err(|_| PretrainedError::Other(
            "Artifact index lock poisoned".to_string(),
        ))
    }
}

fn ensure_concrete(key: &ArtifactKey) -> Result<()> {
    if key.is_latest() {
        return Err(PretrainedError::Validation {
            field: "version".to_string(),
            message: format!("{} must be resolved to a concrete version first", key),
        });
    }
    Ok(())
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

/// Remove `dir` and its empty parents up to (not including) `root`.
///
/// The download lock file is never removed, so a directory that ever held a
/// download keeps existing.
fn remove_empty_dirs(root: &Path, dir: &Path) {
    let mut current = Some(dir);
    while let Some(path) = current {
        if path == root || !path.starts_with(root) {
            break;
        }
        if fs::remove_dir(path).is_err() {
            break;
        }
        current = path.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::sha256_hex;
    use tempfile::TempDir;

    fn key(version: &str) -> ArtifactKey {
        ArtifactKey::new("pos_tagger", "en", Some(version))
    }

    fn commit(store: &ArtifactStore, key: &ArtifactKey, body: &[u8]) -> ArtifactRecord {
        store
            .commit_reader(ArtifactKind::Model, key, body, &sha256_hex(body))
            .unwrap()
    }

    #[test]
    fn test_commit_then_lookup_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp_dir.path()).unwrap();
        let key = key("2.3.0");

        let committed = commit(&store, &key, b"model weights");
        let found = store.lookup(&key).unwrap().unwrap();

        assert_eq!(found, committed);
        assert_eq!(found.local_path, temp_dir.path().join("pos_tagger/en/2.3.0/artifact"));
        assert_eq!(compute_sha256(&found.local_path).unwrap(), found.checksum);
        assert_eq!(found.size_bytes, 13);
        assert_eq!(found.resolved_version, "2.3.0");
    }

    #[test]
    fn test_commit_staged_moves_file_into_place() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp_dir.path()).unwrap();
        let key = key("1.0.0");

        let staged = store.partial_path(&key);
        fs::create_dir_all(staged.parent().unwrap()).unwrap();
        fs::write(&staged, b"pipeline").unwrap();

        let record = store
            .commit_staged(ArtifactKind::Pipeline, &key, &staged, &sha256_hex(b"pipeline"))
            .unwrap();

        assert!(!staged.exists());
        assert_eq!(fs::read(&record.local_path).unwrap(), b"pipeline");
        assert_eq!(record.kind, ArtifactKind::Pipeline);
    }

    #[test]
    fn test_commit_checksum_mismatch_leaves_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp_dir.path()).unwrap();
        let key = key("1.0.0");

        let staged = store.partial_path(&key);
        fs::create_dir_all(staged.parent().unwrap()).unwrap();
        fs::write(&staged, b"tampered").unwrap();

        let err = store
            .commit_staged(ArtifactKind::Model, &key, &staged, &sha256_hex(b"original"))
            .unwrap_err();
        assert!(matches!(err, PretrainedError::CorruptArtifact { .. }));
        assert!(!staged.exists());
        assert!(store.lookup(&key).unwrap().is_none());

        let err = store
            .commit_reader(ArtifactKind::Model, &key, &b"tampered"[..], &sha256_hex(b"original"))
            .unwrap_err();
        assert!(matches!(err, PretrainedError::CorruptArtifact { .. }));
        assert!(!store.artifact_path(&key).exists());
        assert!(store.is_empty());
    }

    #[test]
    fn test_index_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let key = key("2.3.0");
        {
            let store = ArtifactStore::open(temp_dir.path()).unwrap();
            commit(&store, &key, b"persisted");
        }

        let reopened = ArtifactStore::open(temp_dir.path()).unwrap();
        let record = reopened.lookup(&key).unwrap().unwrap();
        assert_eq!(record.checksum, sha256_hex(b"persisted"));
    }

    #[test]
    fn test_refresh_sees_other_handle_commits() {
        let temp_dir = TempDir::new().unwrap();
        let first = ArtifactStore::open(temp_dir.path()).unwrap();
        let second = ArtifactStore::open(temp_dir.path()).unwrap();

        commit(&first, &key("1.0.0"), b"one");
        assert!(second.lookup(&key("1.0.0")).unwrap().is_none());

        second.refresh().unwrap();
        assert!(second.lookup(&key("1.0.0")).unwrap().is_some());

        // Writers merge rather than overwrite each other's entries.
        commit(&second, &key("2.0.0"), b"two");
        first.refresh().unwrap();
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn test_touch_updates_last_used() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp_dir.path()).unwrap();
        let key = key("2.3.0");
        let committed = commit(&store, &key, b"data");

        std::thread::sleep(std::time::Duration::from_millis(5));
        let touched = store.touch(&key).unwrap().unwrap();
        assert!(touched.last_used_at > committed.last_used_at);
        assert_eq!(touched.downloaded_at, committed.downloaded_at);

        assert!(store.touch(&ArtifactKey::new("absent", "en", Some("1.0.0"))).unwrap().is_none());
    }

    #[test]
    fn test_evict_then_lookup_and_idempotence() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp_dir.path()).unwrap();
        let key = key("2.3.0");
        let record = commit(&store, &key, b"data");

        assert!(store.evict(&key).unwrap());
        assert!(store.lookup(&key).unwrap().is_none());
        assert!(!record.local_path.exists());
        assert!(!temp_dir.path().join("pos_tagger").exists());

        assert!(!store.evict(&key).unwrap());
    }

    #[test]
    fn test_missing_file_is_a_miss() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp_dir.path()).unwrap();
        let key = key("2.3.0");
        let record = commit(&store, &key, b"data");

        fs::remove_file(&record.local_path).unwrap();
        assert!(store.lookup(&key).unwrap().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_lookup_rejects_latest() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp_dir.path()).unwrap();
        let err = store
            .lookup(&ArtifactKey::new("pos_tagger", "en", None))
            .unwrap_err();
        assert!(matches!(err, PretrainedError::Validation { .. }));
    }

    #[test]
    fn test_evict_lru_keeps_recent() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp_dir.path()).unwrap();

        commit(&store, &key("1.0.0"), &[0u8; 100]);
        std::thread::sleep(std::time::Duration::from_millis(5));
        commit(&store, &key("2.0.0"), &[1u8; 100]);
        std::thread::sleep(std::time::Duration::from_millis(5));
        commit(&store, &key("3.0.0"), &[2u8; 100]);
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.touch(&key("1.0.0")).unwrap();

        assert_eq!(store.total_size(), 300);
        let evicted = store.evict_lru(150).unwrap();

        assert_eq!(evicted, vec![key("2.0.0"), key("3.0.0")]);
        assert_eq!(store.total_size(), 100);
        assert!(store.lookup(&key("1.0.0")).unwrap().is_some());
    }

    #[test]
    fn test_open_with_corrupt_index_starts_empty() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("index"), "{ not json").unwrap();

        let store = ArtifactStore::open(temp_dir.path()).unwrap();
        assert!(store.is_empty());
        commit(&store, &key("1.0.0"), b"fresh");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_unreadable_index_keeps_records() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp_dir.path()).unwrap();
        commit(&store, &key("1.0.0"), b"kept");

        // A directory in place of the index fails to read with an I/O error.
        let index = temp_dir.path().join("index");
        fs::remove_file(&index).unwrap();
        fs::create_dir(&index).unwrap();

        let err = store.refresh().unwrap_err();
        assert!(matches!(err, PretrainedError::Disk { .. }));
        assert!(store.touch(&key("1.0.0")).is_err());
        assert_eq!(store.len(), 1);

        fs::remove_dir(&index).unwrap();
        assert!(ArtifactStore::open(temp_dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_evict_keeps_download_lock_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp_dir.path()).unwrap();
        let key = key("2.3.0");

        let held = store.lock_artifact(&key).unwrap();
        commit(&store, &key, b"data");
        drop(held);

        assert!(store.evict(&key).unwrap());
        let lock_path = store.lock_path(&key);
        assert!(lock_path.exists());

        // Lockers before and after the eviction contend on the same file.
        let _held = store.lock_artifact(&key).unwrap();
        assert!(FileLock::try_acquire(&lock_path).unwrap().is_none());
    }
}
