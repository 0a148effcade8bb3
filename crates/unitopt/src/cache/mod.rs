//! Three-tier cache of optimized units.
//!
//! - L1 [`HotTier`]: in-memory, keyed by content hash.
//! - L2 [`WarmTier`]: memory-mapped artifacts, keyed by unit key.
//! - L3 [`ColdStore`]: durable index and artifacts with a write-ahead log.
//!
//! A hit in a slower tier is promoted into every faster one.

pub mod cold;
pub mod hot;
pub mod index;
pub mod wal;
pub mod warm;

pub use cold::{ColdLookup, ColdStore, HealReport, ProducerVersions};
pub use hot::HotTier;
pub use index::CacheEntry;
pub use warm::WarmTier;

use std::path::Path;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::StorageError;
use crate::unit::digest::{StrongHash, UnitDigest};

/// Which tier served a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHit {
    pub bytes: Bytes,
    pub tier: Tier,
}

#[derive(Debug)]
pub struct TieredCache {
    hot: HotTier,
    warm: WarmTier,
    cold: ColdStore,
}

impl TieredCache {
    pub fn open(
        dir: &Path,
        config: &CacheConfig,
        versions: ProducerVersions,
    ) -> Result<(Self, HealReport), StorageError> {
        let (cold, report) = ColdStore::open(dir, versions, config.wal_checkpoint_bytes)?;
        Ok((
            Self {
                hot: HotTier::new(config.l1_max_entries),
                warm: WarmTier::new(config.l2_max_entries),
                cold,
            },
            report,
        ))
    }

    /// L1, then L2, then L3.
    pub fn lookup(&self, unit_key: &str, digest: &UnitDigest) -> Option<CacheHit> {
        if let Some(bytes) = self.hot.get(digest) {
            return Some(CacheHit {
                bytes,
                tier: Tier::Hot,
            });
        }
        if let Some(bytes) = self.warm.get(unit_key, &digest.strong) {
            self.hot.insert(unit_key, digest, bytes.clone());
            return Some(CacheHit {
                bytes,
                tier: Tier::Warm,
            });
        }
        match self.cold.get(unit_key, &digest.strong) {
            ColdLookup::Hit(entry, bytes) => {
                self.map_warm(unit_key, digest.strong, &entry);
                self.hot.insert(unit_key, digest, bytes.clone());
                Some(CacheHit {
                    bytes,
                    tier: Tier::Cold,
                })
            }
            ColdLookup::Stale => {
                debug!(unit = %unit_key, "cached artifact built from other source, dropping");
                self.invalidate(unit_key);
                None
            }
            ColdLookup::Miss => None,
        }
    }

    fn map_warm(&self, unit_key: &str, source: StrongHash, entry: &CacheEntry) -> bool {
        match self.warm.insert(unit_key, source, &self.cold.artifact_path(entry)) {
            Ok(_) => true,
            Err(err) => {
                warn!(unit = %unit_key, error = %err, "failed to map artifact into L2");
                false
            }
        }
    }

    /// Put a fresh result in L1. Returns false when L1 is full.
    pub fn store_hot(&self, unit_key: &str, digest: &UnitDigest, bytes: Bytes) -> bool {
        self.hot.insert(unit_key, digest, bytes)
    }

    /// Durably store a result. Blocking; run off the transform path.
    pub fn store_cold(&self, unit_key: &str, source: &StrongHash, bytes: &[u8]) -> Result<(), StorageError> {
        // A mapping of the previous artifact must not outlive it.
        self.warm.remove(unit_key);
        self.cold.store(unit_key, source, bytes)
    }

    /// Drop `unit_key` from every tier. Returns whether anything was cached.
    pub fn invalidate(&self, unit_key: &str) -> bool {
        let hot = self.hot.remove_key(unit_key);
        let warm = self.warm.remove(unit_key);
        let cold = match self.cold.invalidate(unit_key) {
            Ok(removed) => removed,
            Err(err) => {
                warn!(unit = %unit_key, error = %err, "failed to invalidate cold entry");
                false
            }
        };
        hot || warm || cold
    }

    /// Promote an L3 entry into L2 ahead of demand.
    pub fn prewarm(&self, unit_key: &str) -> bool {
        if self.warm.contains(unit_key) {
            return false;
        }
        let Some(entry) = self.cold.entry(unit_key) else {
            return false;
        };
        let Ok(source) = StrongHash::try_from(entry.source_hash.as_slice()) else {
            return false;
        };
        self.map_warm(unit_key, source, &entry)
    }

    /// Clear L1 and release every L2 mapping.
    pub fn flush_hot(&self) {
        self.hot.clear();
        self.warm.clear();
    }

    pub fn persist(&self) -> Result<(), StorageError> {
        self.cold.persist()
    }

    pub fn hot(&self) -> &HotTier {
        &self.hot
    }

    pub fn warm(&self) -> &WarmTier {
        &self.warm
    }

    pub fn cold(&self) -> &ColdStore {
        &self.cold
    }
}
