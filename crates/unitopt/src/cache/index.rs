//! Binary format of the cold-tier index.
//!
//! ```text
//! magic            8 bytes  "UOPTIDX\0"
//! format version   u32
//! producer version u32 len + UTF-8
//! entry count      u32
//! entries:
//!   unit key         u32 len + UTF-8
//!   source hash      u32 len + bytes
//!   modified at      u64 (ms)
//!   optimized size   u64
//!   artifact file    u32 len + UTF-8
//!   cached at        u64 (ms)
//!   pass-set version u32
//!   analyzer version u32
//! ```
//!
//! All integers little-endian.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{StorageError, UnitError};
use crate::unit::codec::Reader;

pub const INDEX_MAGIC: [u8; 8] = *b"UOPTIDX\0";
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// One cached unit in the cold tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub unit_key: String,
    /// SHA-256 of the source bytes the artifact was built from.
    pub source_hash: Vec<u8>,
    /// Artifact write time, ms since the epoch.
    pub modified_at: u64,
    /// Artifact length in bytes.
    pub optimized_size: u64,
    /// File name under the artifacts directory.
    pub artifact: String,
    /// Index insertion time, ms since the epoch.
    pub cached_at: u64,
    pub pass_set_version: u32,
    pub analyzer_version: u32,
}

/// Decoded index file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheIndex {
    pub producer_version: String,
    pub entries: BTreeMap<String, CacheEntry>,
}

impl CacheIndex {
    pub fn new(producer_version: &str) -> Self {
        Self {
            producer_version: producer_version.to_string(),
            entries: BTreeMap::new(),
        }
    }
}

pub fn encode_index(index: &CacheIndex) -> Result<Vec<u8>, StorageError> {
    let mut out = Vec::with_capacity(64usize.saturating_add(index.entries.len().saturating_mul(128)));
    out.extend_from_slice(&INDEX_MAGIC);
    out.extend_from_slice(&INDEX_FORMAT_VERSION.to_le_bytes());
    put_bytes(&mut out, index.producer_version.as_bytes())?;
    put_u32(&mut out, index.entries.len())?;
    for entry in index.entries.values() {
        put_bytes(&mut out, entry.unit_key.as_bytes())?;
        put_bytes(&mut out, &entry.source_hash)?;
        out.extend_from_slice(&entry.modified_at.to_le_bytes());
        out.extend_from_slice(&entry.optimized_size.to_le_bytes());
        put_bytes(&mut out, entry.artifact.as_bytes())?;
        out.extend_from_slice(&entry.cached_at.to_le_bytes());
        out.extend_from_slice(&entry.pass_set_version.to_le_bytes());
        out.extend_from_slice(&entry.analyzer_version.to_le_bytes());
    }
    Ok(out)
}

pub fn decode_index(bytes: &[u8]) -> Result<CacheIndex, StorageError> {
    let mut reader = Reader::new(bytes);
    let magic = reader
        .take(INDEX_MAGIC.len())
        .map_err(|_| StorageError::BadHeader("file shorter than magic".to_string()))?;
    if magic != INDEX_MAGIC {
        return Err(StorageError::BadHeader("bad magic".to_string()));
    }
    let format = reader.u32().map_err(corrupt)?;
    if format != INDEX_FORMAT_VERSION {
        return Err(StorageError::BadHeader(format!(
            "unsupported format version {format}"
        )));
    }
    let producer_version = read_string(&mut reader)?;

    let count = reader.u32().map_err(corrupt)?;
    let mut entries = BTreeMap::new();
    for _ in 0..count {
        let unit_key = read_string(&mut reader)?;
        let source_hash = read_bytes(&mut reader)?.to_vec();
        let entry = CacheEntry {
            unit_key: unit_key.clone(),
            source_hash,
            modified_at: reader.u64().map_err(corrupt)?,
            optimized_size: reader.u64().map_err(corrupt)?,
            artifact: read_string(&mut reader)?,
            cached_at: reader.u64().map_err(corrupt)?,
            pass_set_version: reader.u32().map_err(corrupt)?,
            analyzer_version: reader.u32().map_err(corrupt)?,
        };
        entries.insert(unit_key, entry);
    }
    if reader.remaining() != 0 {
        return Err(StorageError::Corrupt {
            file: "index",
            reason: format!("{} trailing bytes", reader.remaining()),
        });
    }
    Ok(CacheIndex {
        producer_version,
        entries,
    })
}

/// Load the index with one bulk read through a memory map.
///
/// `Ok(None)` when the file does not exist or is empty.
pub fn load_index(path: &Path) -> Result<Option<CacheIndex>, StorageError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if file.metadata()?.len() == 0 {
        return Ok(None);
    }
    // SAFETY: the index is only replaced by rename, never modified in place,
    // so the mapped file cannot change under us while we decode it.
    #[allow(unsafe_code)]
    let map = unsafe { Mmap::map(&file)? };
    decode_index(&map).map(Some)
}

fn corrupt(err: UnitError) -> StorageError {
    StorageError::Corrupt {
        file: "index",
        reason: err.to_string(),
    }
}

fn read_bytes<'a>(reader: &mut Reader<'a>) -> Result<&'a [u8], StorageError> {
    let len = reader.u32().map_err(corrupt)?;
    let len = usize::try_from(len).map_err(|_| StorageError::Corrupt {
        file: "index",
        reason: "length overflow".to_string(),
    })?;
    reader.take(len).map_err(corrupt)
}

fn read_string(reader: &mut Reader<'_>) -> Result<String, StorageError> {
    let raw = read_bytes(reader)?;
    String::from_utf8(raw.to_vec()).map_err(|_| StorageError::Corrupt {
        file: "index",
        reason: "string is not UTF-8".to_string(),
    })
}

fn put_u32(out: &mut Vec<u8>, value: usize) -> Result<(), StorageError> {
    let value = u32::try_from(value).map_err(|_| StorageError::Corrupt {
        file: "index",
        reason: format!("length {value} exceeds u32"),
    })?;
    out.extend_from_slice(&value.to_le_bytes());
    Ok(())
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), StorageError> {
    put_u32(out, bytes.len())?;
    out.extend_from_slice(bytes);
    Ok(())
}
