//! L1: in-memory map from content hash to optimized bytes.
//!
//! Fixed capacity; an insert into a full map is dropped. Each entry carries
//! the SHA-256 of its source, so a fast-hash collision reads as a miss.

use std::sync::{PoisonError, RwLock};

use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::unit::digest::{StrongHash, UnitDigest};

#[derive(Debug, Clone)]
struct HotEntry {
    strong: StrongHash,
    bytes: Bytes,
    unit_key: String,
}

#[derive(Debug, Default)]
struct HotInner {
    by_hash: FxHashMap<u64, HotEntry>,
    /// Unit key -> fast hash, for invalidation by key.
    by_key: FxHashMap<String, u64>,
}

#[derive(Debug)]
pub struct HotTier {
    max_entries: usize,
    inner: RwLock<HotInner>,
}

impl HotTier {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            inner: RwLock::new(HotInner::default()),
        }
    }

    pub fn get(&self, digest: &UnitDigest) -> Option<Bytes> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .by_hash
            .get(&digest.fast)
            .filter(|entry| entry.strong == digest.strong)
            .map(|entry| entry.bytes.clone())
    }

    /// Insert unless full. Returns whether the entry is now cached.
    pub fn insert(&self, unit_key: &str, digest: &UnitDigest, bytes: Bytes) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        // A new source version of the same key replaces the old entry.
        if let Some(old) = inner.by_key.get(unit_key).copied()
            && old != digest.fast
        {
            inner.by_hash.remove(&old);
        }
        if !inner.by_hash.contains_key(&digest.fast) && inner.by_hash.len() >= self.max_entries {
            inner.by_key.remove(unit_key);
            return false;
        }
        inner.by_hash.insert(
            digest.fast,
            HotEntry {
                strong: digest.strong,
                bytes,
                unit_key: unit_key.to_string(),
            },
        );
        inner.by_key.insert(unit_key.to_string(), digest.fast);
        true
    }

    pub fn remove_key(&self, unit_key: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match inner.by_key.remove(unit_key) {
            Some(fast) => {
                // The slot may have been taken over by another key with identical bytes.
                let owned = inner
                    .by_hash
                    .get(&fast)
                    .is_some_and(|entry| entry.unit_key == unit_key);
                if owned {
                    inner.by_hash.remove(&fast);
                }
                owned
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.by_hash.clear();
        inner.by_key.clear();
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_hash
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let hot = HotTier::new(4);
        let digest = UnitDigest::of(b"source");
        assert!(hot.insert("k", &digest, Bytes::from_static(b"opt")));
        assert_eq!(hot.get(&digest), Some(Bytes::from_static(b"opt")));
        assert_eq!(hot.get(&UnitDigest::of(b"other")), None);
    }

    #[test]
    fn strong_hash_mismatch_is_a_miss() {
        let hot = HotTier::new(4);
        let digest = UnitDigest::of(b"source");
        hot.insert("k", &digest, Bytes::from_static(b"opt"));
        let collided = UnitDigest {
            fast: digest.fast,
            strong: [0; 32],
        };
        assert_eq!(hot.get(&collided), None);
    }

    #[test]
    fn full_map_drops_insert() {
        let hot = HotTier::new(1);
        assert!(hot.insert("a", &UnitDigest::of(b"a"), Bytes::new()));
        assert!(!hot.insert("b", &UnitDigest::of(b"b"), Bytes::new()));
        assert_eq!(hot.len(), 1);
        assert_eq!(hot.get(&UnitDigest::of(b"b")), None);
    }

    #[test]
    fn new_version_replaces_and_remove_by_key() {
        let hot = HotTier::new(4);
        let v1 = UnitDigest::of(b"v1");
        let v2 = UnitDigest::of(b"v2");
        hot.insert("k", &v1, Bytes::from_static(b"1"));
        hot.insert("k", &v2, Bytes::from_static(b"2"));
        assert_eq!(hot.len(), 1);
        assert_eq!(hot.get(&v1), None);

        assert!(hot.remove_key("k"));
        assert!(hot.is_empty());
        assert!(!hot.remove_key("k"));
    }
}
