//! Content hashes for units.
//!
//! The 64-bit fast hash indexes the hot tier; SHA-256 guards every tier
//! against fast-hash collisions and source changes.

use rustc_hash::FxHasher;
use sha2::{Digest, Sha256};
use std::hash::Hasher;

/// SHA-256 of a unit's bytes.
pub type StrongHash = [u8; 32];

/// Both hashes of a unit's bytes, computed once per transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitDigest {
    pub fast: u64,
    pub strong: StrongHash,
}

impl UnitDigest {
    pub fn of(bytes: &[u8]) -> Self {
        Self {
            fast: fast_hash(bytes),
            strong: strong_hash(bytes),
        }
    }

    pub fn strong_hex(&self) -> String {
        hex::encode(self.strong)
    }
}

pub fn fast_hash(bytes: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write_usize(bytes.len());
    hasher.write(bytes);
    hasher.finish()
}

pub fn strong_hash(bytes: &[u8]) -> StrongHash {
    Sha256::digest(bytes).into()
}

/// Artifact file name for a unit key and source hash.
///
/// A new source version never overwrites the artifact an index entry still
/// points at; the old file is deleted only after the new entry commits.
pub fn artifact_name(unit_key: &str, source: &StrongHash) -> String {
    let key = Sha256::digest(unit_key.as_bytes());
    format!(
        "{}-{}.bin",
        hex::encode(&key[..12]),
        hex::encode(&source[..8])
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_deterministic() {
        let a = UnitDigest::of(b"BUNT unit bytes");
        let b = UnitDigest::of(b"BUNT unit bytes");
        assert_eq!(a, b);
        assert_ne!(a, UnitDigest::of(b"BUNT unit bytez"));
    }

    #[test]
    fn test_strong_hash_known_vector() {
        assert_eq!(
            hex::encode(strong_hash(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_artifact_name_shape() {
        let source = strong_hash(b"v1");
        let name = artifact_name("com/example/Foo", &source);
        assert_eq!(name.len(), 24 + 1 + 16 + 4);
        assert!(name.ends_with(".bin"));
        assert_eq!(name, artifact_name("com/example/Foo", &source));
        assert_ne!(name, artifact_name("com/example/Bar", &source));
        assert_ne!(name, artifact_name("com/example/Foo", &strong_hash(b"v2")));
    }
}
