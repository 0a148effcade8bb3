//! L2: memory-mapped views of cold-tier artifacts.
//!
//! Capacity-bounded with FIFO eviction. A mapping is released the moment
//! its entry is dropped, whether by eviction, invalidation or `clear`.

use std::collections::VecDeque;
use std::fs::File;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use memmap2::Mmap;
use rustc_hash::FxHashMap;

use crate::error::StorageError;
use crate::unit::digest::StrongHash;

struct WarmEntry {
    source: StrongHash,
    map: Mmap,
}

#[derive(Default)]
struct WarmInner {
    maps: FxHashMap<String, WarmEntry>,
    insertion_order: VecDeque<String>,
}

pub struct WarmTier {
    max_entries: usize,
    inner: Mutex<WarmInner>,
}

impl std::fmt::Debug for WarmTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmTier")
            .field("max_entries", &self.max_entries)
            .field("len", &self.len())
            .finish()
    }
}

impl WarmTier {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            inner: Mutex::new(WarmInner::default()),
        }
    }

    /// Copy of the mapped artifact, if mapped for this source version.
    pub fn get(&self, unit_key: &str, source: &StrongHash) -> Option<Bytes> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .maps
            .get(unit_key)
            .filter(|entry| &entry.source == source)
            .map(|entry| Bytes::copy_from_slice(&entry.map))
    }

    /// Map `path` for `unit_key`. Returns the key evicted to make room, if any.
    pub fn insert(
        &self,
        unit_key: &str,
        source: StrongHash,
        path: &Path,
    ) -> Result<Option<String>, StorageError> {
        if self.max_entries == 0 {
            return Ok(None);
        }
        let file = File::open(path)?;
        // SAFETY: artifacts are written once under a unique name and only
        // ever deleted, never rewritten in place.
        #[allow(unsafe_code)]
        let map = unsafe { Mmap::map(&file)? };

        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.maps.contains_key(unit_key) {
            inner.maps.insert(unit_key.to_string(), WarmEntry { source, map });
            return Ok(None);
        }

        let mut evicted = None;
        if inner.maps.len() >= self.max_entries
            && let Some(oldest) = inner.insertion_order.pop_front()
        {
            inner.maps.remove(&oldest);
            evicted = Some(oldest);
        }
        inner.maps.insert(unit_key.to_string(), WarmEntry { source, map });
        inner.insertion_order.push_back(unit_key.to_string());
        Ok(evicted)
    }

    pub fn remove(&self, unit_key: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = inner.maps.remove(unit_key).is_some();
        if removed {
            inner.insertion_order.retain(|k| k != unit_key);
        }
        removed
    }

    /// Drop every mapping.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.maps.clear();
        inner.insertion_order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .maps
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, unit_key: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .maps
            .contains_key(unit_key)
    }
}
