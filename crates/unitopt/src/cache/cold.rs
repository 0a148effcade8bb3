//! L3: durable index plus one artifact file per unit.
//!
//! Layout under the cache directory:
//!
//! ```text
//! index.bin        encoded CacheIndex, replaced by rename
//! wal.log          BEGIN/COMMIT records
//! artifacts/*.bin  optimized unit bytes
//! ```
//!
//! Stores are serialized by `writer`. Readers snapshot the entry and the
//! index generation, read the artifact without holding a lock, then check
//! the generation again; a concurrent store forces a retry under `writer`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use bytes::Bytes;
use tracing::{info, warn};

use crate::cache::index::{CacheEntry, CacheIndex, encode_index, load_index};
use crate::cache::wal::{Wal, is_loggable_key};
use crate::error::StorageError;
use crate::passes::PASS_SET_VERSION;
use crate::persist;
use crate::unit::digest::{StrongHash, artifact_name};

pub const INDEX_FILE: &str = "index.bin";
pub const WAL_FILE: &str = "wal.log";
pub const ARTIFACT_DIR: &str = "artifacts";

/// Versions an entry must match to be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerVersions {
    pub producer: String,
    pub pass_set: u32,
    pub analyzer: u32,
}

impl ProducerVersions {
    pub fn new(producer: &str, analyzer: u32) -> Self {
        Self {
            producer: producer.to_string(),
            pass_set: PASS_SET_VERSION,
            analyzer,
        }
    }

    fn matches(&self, entry: &CacheEntry) -> bool {
        entry.pass_set_version == self.pass_set && entry.analyzer_version == self.analyzer
    }
}

/// What the startup self-heal found and repaired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealReport {
    pub index_discarded: bool,
    pub wal_rolled_back: usize,
    pub missing_artifacts: usize,
    pub size_mismatches: usize,
    pub version_mismatches: usize,
    pub orphans_deleted: usize,
}

impl HealReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

/// Result of an L3 lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColdLookup {
    Hit(CacheEntry, Bytes),
    /// An entry exists but was built from other source bytes.
    Stale,
    Miss,
}

#[derive(Debug, Default)]
struct ColdState {
    entries: BTreeMap<String, CacheEntry>,
    /// Bumped on every index mutation.
    generation: u64,
}

#[derive(Debug)]
pub struct ColdStore {
    artifacts: PathBuf,
    index_path: PathBuf,
    wal: Wal,
    versions: ProducerVersions,
    checkpoint_bytes: u64,
    state: RwLock<ColdState>,
    writer: Mutex<()>,
}

impl ColdStore {
    /// Open the store in `dir`, creating it if needed, and self-heal.
    pub fn open(
        dir: &Path,
        versions: ProducerVersions,
        checkpoint_bytes: u64,
    ) -> Result<(Self, HealReport), StorageError> {
        let artifacts = dir.join(ARTIFACT_DIR);
        fs::create_dir_all(&artifacts)?;
        let store = Self {
            index_path: dir.join(INDEX_FILE),
            wal: Wal::new(dir.join(WAL_FILE)),
            artifacts,
            versions,
            checkpoint_bytes,
            state: RwLock::new(ColdState::default()),
            writer: Mutex::new(()),
        };
        let report = store.self_heal()?;
        if report.is_clean() {
            info!(dir = %dir.display(), entries = store.len(), "cold cache opened");
        } else {
            warn!(?report, entries = store.len(), "cold cache repaired at startup");
        }
        Ok((store, report))
    }

    fn self_heal(&self) -> Result<HealReport, StorageError> {
        let mut report = HealReport::default();
        let mut dirty = false;

        let mut index = match load_index(&self.index_path) {
            Ok(Some(index)) => index,
            Ok(None) => CacheIndex::new(&self.versions.producer),
            Err(StorageError::BadHeader(reason)) => {
                warn!(%reason, "discarding cache index with unrecognized header");
                report.index_discarded = true;
                dirty = true;
                self.clear_artifacts()?;
                CacheIndex::new(&self.versions.producer)
            }
            Err(err @ StorageError::Corrupt { .. }) => {
                warn!(error = %err, "discarding corrupt cache index");
                report.index_discarded = true;
                dirty = true;
                CacheIndex::new(&self.versions.producer)
            }
            Err(err) => return Err(err),
        };

        // Roll back stores that never committed.
        for pending in self.wal.pending()? {
            persist::remove_if_exists(&self.artifacts.join(&pending.artifact))?;
            if index
                .entries
                .get(&pending.unit_key)
                .is_some_and(|entry| entry.artifact == pending.artifact)
            {
                index.entries.remove(&pending.unit_key);
            }
            report.wal_rolled_back = report.wal_rolled_back.saturating_add(1);
            dirty = true;
        }
        self.wal.truncate()?;

        // Entries from another producer are all stale.
        if index.producer_version != self.versions.producer {
            report.version_mismatches = report
                .version_mismatches
                .saturating_add(index.entries.len());
            index = CacheIndex::new(&self.versions.producer);
            dirty = true;
        }

        let mut purged = Vec::new();
        for (key, entry) in &index.entries {
            if !self.versions.matches(entry) {
                report.version_mismatches = report.version_mismatches.saturating_add(1);
                purged.push(key.clone());
                continue;
            }
            match fs::metadata(self.artifacts.join(&entry.artifact)) {
                Ok(meta) if meta.len() == entry.optimized_size => {}
                Ok(_) => {
                    report.size_mismatches = report.size_mismatches.saturating_add(1);
                    purged.push(key.clone());
                }
                Err(_) => {
                    report.missing_artifacts = report.missing_artifacts.saturating_add(1);
                    purged.push(key.clone());
                }
            }
        }
        for key in purged {
            if let Some(entry) = index.entries.remove(&key) {
                persist::remove_if_exists(&self.artifacts.join(&entry.artifact))?;
            }
            dirty = true;
        }

        // Artifacts no entry points at.
        for dir_entry in fs::read_dir(&self.artifacts)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            let referenced = index.entries.values().any(|entry| entry.artifact == name);
            if !referenced {
                fs::remove_file(dir_entry.path())?;
                report.orphans_deleted = report.orphans_deleted.saturating_add(1);
            }
        }

        if dirty {
            persist::write_atomic(&self.index_path, &encode_index(&index)?)?;
        }
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.entries = index.entries;
        state.generation = state.generation.wrapping_add(1);
        Ok(report)
    }

    fn clear_artifacts(&self) -> Result<(), StorageError> {
        for dir_entry in fs::read_dir(&self.artifacts)? {
            fs::remove_file(dir_entry?.path())?;
        }
        Ok(())
    }

    /// Look up `unit_key` for the given source version.
    pub fn get(&self, unit_key: &str, source: &StrongHash) -> ColdLookup {
        let (entry, generation) = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            match state.entries.get(unit_key) {
                Some(entry) => (entry.clone(), state.generation),
                None => return ColdLookup::Miss,
            }
        };
        if entry.source_hash.as_slice() != source.as_slice() {
            return ColdLookup::Stale;
        }

        let read = fs::read(self.artifacts.join(&entry.artifact));
        let unchanged = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .generation
            == generation;
        match read {
            Ok(bytes) if unchanged && bytes.len() as u64 == entry.optimized_size => {
                ColdLookup::Hit(entry, Bytes::from(bytes))
            }
            _ => self.get_exclusive(unit_key, source),
        }
    }

    /// Slow path: hold the writer lock so no store can interleave.
    fn get_exclusive(&self, unit_key: &str, source: &StrongHash) -> ColdLookup {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(unit_key)
            .cloned()
        else {
            return ColdLookup::Miss;
        };
        if entry.source_hash.as_slice() != source.as_slice() {
            return ColdLookup::Stale;
        }
        match fs::read(self.artifacts.join(&entry.artifact)) {
            Ok(bytes) if bytes.len() as u64 == entry.optimized_size => {
                ColdLookup::Hit(entry, Bytes::from(bytes))
            }
            _ => {
                warn!(unit = %unit_key, artifact = %entry.artifact, "purging cache entry with unreadable artifact");
                if let Err(err) = self.remove_locked(unit_key) {
                    warn!(unit = %unit_key, error = %err, "failed to purge cache entry");
                }
                ColdLookup::Miss
            }
        }
    }

    /// Durably store `bytes` as the optimized form of `unit_key` at `source`.
    pub fn store(&self, unit_key: &str, source: &StrongHash, bytes: &[u8]) -> Result<(), StorageError> {
        self.store_inner(unit_key, source, bytes, true)
    }

    /// Run a store up to the index update and stop before COMMIT, as a crash would.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn store_uncommitted(
        &self,
        unit_key: &str,
        source: &StrongHash,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        self.store_inner(unit_key, source, bytes, false)
    }

    fn store_inner(
        &self,
        unit_key: &str,
        source: &StrongHash,
        bytes: &[u8],
        commit: bool,
    ) -> Result<(), StorageError> {
        if !is_loggable_key(unit_key) {
            return Err(StorageError::Corrupt {
                file: "wal",
                reason: format!("unit key {unit_key:?} cannot be logged"),
            });
        }
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let artifact = artifact_name(unit_key, source);
        let now = persist::now_millis();

        persist::write_atomic(&self.artifacts.join(&artifact), bytes)?;
        self.wal.begin(unit_key, &artifact)?;

        let entry = CacheEntry {
            unit_key: unit_key.to_string(),
            source_hash: source.to_vec(),
            modified_at: now,
            optimized_size: bytes.len() as u64,
            artifact: artifact.clone(),
            cached_at: now,
            pass_set_version: self.versions.pass_set,
            analyzer_version: self.versions.analyzer,
        };
        let previous = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let previous = state.entries.insert(unit_key.to_string(), entry);
            state.generation = state.generation.wrapping_add(1);
            previous
        };
        self.persist_locked()?;

        if !commit {
            return Ok(());
        }
        self.wal.commit(unit_key)?;

        if let Some(previous) = previous
            && previous.artifact != artifact
        {
            persist::remove_if_exists(&self.artifacts.join(&previous.artifact))?;
        }
        if self.wal.size() > self.checkpoint_bytes {
            self.wal.truncate()?;
        }
        Ok(())
    }

    /// Remove `unit_key` and its artifact. Returns whether an entry existed.
    pub fn invalidate(&self, unit_key: &str) -> Result<bool, StorageError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.remove_locked(unit_key)
    }

    fn remove_locked(&self, unit_key: &str) -> Result<bool, StorageError> {
        let removed = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let removed = state.entries.remove(unit_key);
            if removed.is_some() {
                state.generation = state.generation.wrapping_add(1);
            }
            removed
        };
        let Some(entry) = removed else {
            return Ok(false);
        };
        self.persist_locked()?;
        persist::remove_if_exists(&self.artifacts.join(&entry.artifact))?;
        Ok(true)
    }

    /// Write the index to disk.
    pub fn persist(&self) -> Result<(), StorageError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.persist_locked()
    }

    fn persist_locked(&self) -> Result<(), StorageError> {
        let index = CacheIndex {
            producer_version: self.versions.producer.clone(),
            entries: self
                .state
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .entries
                .clone(),
        };
        persist::write_atomic(&self.index_path, &encode_index(&index)?)?;
        Ok(())
    }

    pub fn entry(&self, unit_key: &str) -> Option<CacheEntry> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(unit_key)
            .cloned()
    }

    pub fn entries(&self) -> Vec<CacheEntry> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .values()
            .cloned()
            .collect()
    }

    pub fn artifact_path(&self, entry: &CacheEntry) -> PathBuf {
        self.artifacts.join(&entry.artifact)
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn wal(&self) -> &Wal {
        &self.wal
    }
}

/// Read the index of a cache directory without opening (and healing) it.
pub fn read_entries(dir: &Path) -> Result<Vec<CacheEntry>, StorageError> {
    Ok(load_index(&dir.join(INDEX_FILE))?
        .map(|index| index.entries.into_values().collect())
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::digest::strong_hash;

    fn versions() -> ProducerVersions {
        ProducerVersions::new("test-producer", 1)
    }

    fn open(dir: &Path) -> (ColdStore, HealReport) {
        ColdStore::open(dir, versions(), 1 << 20).unwrap()
    }

    #[test]
    fn store_then_get_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let source = strong_hash(b"source-v1");
        {
            let (cold, report) = open(dir.path());
            assert!(report.is_clean());
            cold.store("com/acme/Foo", &source, b"optimized").unwrap();
        }
        let (cold, report) = open(dir.path());
        assert!(report.is_clean(), "{report:?}");
        match cold.get("com/acme/Foo", &source) {
            ColdLookup::Hit(entry, bytes) => {
                assert_eq!(bytes.as_ref(), b"optimized");
                assert_eq!(entry.optimized_size, 9);
                assert_eq!(entry.pass_set_version, PASS_SET_VERSION);
            }
            other => panic!("expected hit, got {other:?}"),
        }
        assert_eq!(cold.wal().size(), 0, "WAL truncated after replay");
    }

    #[test]
    fn other_source_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let (cold, _) = open(dir.path());
        cold.store("k", &strong_hash(b"v1"), b"x").unwrap();
        assert_eq!(cold.get("k", &strong_hash(b"v2")), ColdLookup::Stale);
        assert_eq!(cold.get("other", &strong_hash(b"v1")), ColdLookup::Miss);
    }

    #[test]
    fn restore_replaces_old_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let (cold, _) = open(dir.path());
        cold.store("k", &strong_hash(b"v1"), b"one").unwrap();
        let old = cold.artifact_path(&cold.entry("k").unwrap());
        cold.store("k", &strong_hash(b"v2"), b"two").unwrap();
        assert!(!old.exists());
        assert_eq!(cold.len(), 1);
    }

    #[test]
    fn uncommitted_store_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let source = strong_hash(b"v1");
        let artifact = {
            let (cold, _) = open(dir.path());
            cold.store_uncommitted("k", &source, b"partial").unwrap();
            cold.artifact_path(&cold.entry("k").unwrap())
        };
        assert!(artifact.exists());

        let (cold, report) = open(dir.path());
        assert_eq!(report.wal_rolled_back, 1);
        assert!(!artifact.exists());
        assert_eq!(cold.get("k", &source), ColdLookup::Miss);
    }

    #[test]
    fn heal_purges_size_mismatch_and_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let source = strong_hash(b"v1");
        {
            let (cold, _) = open(dir.path());
            cold.store("a", &source, b"aaaa").unwrap();
            cold.store("b", &source, b"bbbb").unwrap();
            fs::write(cold.artifact_path(&cold.entry("a").unwrap()), b"a").unwrap();
            fs::remove_file(cold.artifact_path(&cold.entry("b").unwrap())).unwrap();
        }
        fs::write(dir.path().join(ARTIFACT_DIR).join("stray.bin"), b"?").unwrap();

        let (cold, report) = open(dir.path());
        assert_eq!(report.size_mismatches, 1);
        assert_eq!(report.missing_artifacts, 1);
        assert_eq!(report.orphans_deleted, 1);
        assert!(cold.is_empty());
        assert_eq!(fs::read_dir(dir.path().join(ARTIFACT_DIR)).unwrap().count(), 0);
    }

    #[test]
    fn bad_header_discards_everything() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (cold, _) = open(dir.path());
            cold.store("a", &strong_hash(b"v1"), b"aaaa").unwrap();
        }
        fs::write(dir.path().join(INDEX_FILE), b"GARBAGE!\x01\0\0\0").unwrap();
        let (cold, report) = open(dir.path());
        assert!(report.index_discarded);
        assert!(cold.is_empty());
        assert_eq!(fs::read_dir(dir.path().join(ARTIFACT_DIR)).unwrap().count(), 0);
    }

    #[test]
    fn other_producer_version_is_purged() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (cold, _) = open(dir.path());
            cold.store("a", &strong_hash(b"v1"), b"aaaa").unwrap();
        }
        let (cold, report) =
            ColdStore::open(dir.path(), ProducerVersions::new("next-producer", 1), 1 << 20).unwrap();
        assert_eq!(report.version_mismatches, 1);
        assert!(cold.is_empty());

        drop(cold);
        let (cold, report) =
            ColdStore::open(dir.path(), ProducerVersions::new("next-producer", 2), 1 << 20).unwrap();
        assert!(report.is_clean());
        assert!(cold.is_empty());
    }

    #[test]
    fn invalidate_removes_entry_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let (cold, _) = open(dir.path());
        let source = strong_hash(b"v1");
        cold.store("a", &source, b"aaaa").unwrap();
        let path = cold.artifact_path(&cold.entry("a").unwrap());
        assert!(cold.invalidate("a").unwrap());
        assert!(!path.exists());
        assert!(!cold.invalidate("a").unwrap());
        assert!(read_entries(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn deleted_artifact_purges_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let (cold, _) = open(dir.path());
        let source = strong_hash(b"v1");
        cold.store("a", &source, b"aaaa").unwrap();
        fs::remove_file(cold.artifact_path(&cold.entry("a").unwrap())).unwrap();
        assert_eq!(cold.get("a", &source), ColdLookup::Miss);
        assert!(cold.entry("a").is_none());
    }

    #[test]
    fn wal_checkpoints_past_limit() {
        let dir = tempfile::tempdir().unwrap();
        let (cold, _) = ColdStore::open(dir.path(), versions(), 64).unwrap();
        for i in 0..4 {
            cold.store(&format!("unit-{i}"), &strong_hash(b"v"), b"x").unwrap();
        }
        assert!(cold.wal().size() <= 64 + 128);
        assert_eq!(cold.len(), 4);
    }
}
