//! Write-ahead log for cold-tier stores.
//!
//! Text lines, one record each:
//!
//! ```text
//! BEGIN:<unit key>:<artifact file>
//! COMMIT:<unit key>
//! ```
//!
//! A BEGIN without a later COMMIT for the same key marks a store that may
//! have been interrupted. A torn final line is ignored.

use std::fs;
use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;

use crate::persist;

/// A store that began but never committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingStore {
    pub unit_key: String,
    pub artifact: String,
}

#[derive(Debug)]
pub struct Wal {
    path: PathBuf,
}

impl Wal {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn begin(&self, unit_key: &str, artifact: &str) -> std::io::Result<()> {
        persist::append_line(&self.path, &format!("BEGIN:{unit_key}:{artifact}"))
    }

    pub fn commit(&self, unit_key: &str) -> std::io::Result<()> {
        persist::append_line(&self.path, &format!("COMMIT:{unit_key}"))
    }

    /// Current size in bytes, 0 if missing.
    pub fn size(&self) -> u64 {
        fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    pub fn truncate(&self) -> std::io::Result<()> {
        fs::write(&self.path, b"")
    }

    /// Stores left uncommitted, in the order they began.
    pub fn pending(&self) -> std::io::Result<Vec<PendingStore>> {
        let Some(bytes) = persist::read_optional(&self.path)? else {
            return Ok(Vec::new());
        };
        Ok(parse_pending(&String::from_utf8_lossy(&bytes)))
    }
}

fn parse_pending(text: &str) -> Vec<PendingStore> {
    let mut open: FxHashMap<&str, (usize, &str)> = FxHashMap::default();
    for (line_no, line) in text.lines().enumerate() {
        if let Some(rest) = line.strip_prefix("BEGIN:") {
            if let Some((key, artifact)) = rest.rsplit_once(':')
                && !key.is_empty()
                && !artifact.is_empty()
            {
                open.insert(key, (line_no, artifact));
            }
        } else if let Some(key) = line.strip_prefix("COMMIT:") {
            open.remove(key);
        }
    }
    let mut pending: Vec<(usize, PendingStore)> = open
        .into_iter()
        .map(|(key, (line_no, artifact))| {
            (
                line_no,
                PendingStore {
                    unit_key: key.to_string(),
                    artifact: artifact.to_string(),
                },
            )
        })
        .collect();
    pending.sort_by_key(|(line_no, _)| *line_no);
    pending.into_iter().map(|(_, store)| store).collect()
}

/// Keys that cannot be written as a single WAL line.
pub fn is_loggable_key(unit_key: &str) -> bool {
    !unit_key.is_empty() && !unit_key.contains(['\n', '\r'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn committed_stores_are_not_pending() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::new(dir.path().join("wal.log"));
        wal.begin("a", "a.bin").unwrap();
        wal.commit("a").unwrap();
        wal.begin("b::c", "b.bin").unwrap();
        assert_eq!(
            wal.pending().unwrap(),
            vec![PendingStore {
                unit_key: "b::c".into(),
                artifact: "b.bin".into()
            }]
        );

        wal.truncate().unwrap();
        assert_eq!(wal.size(), 0);
        assert!(wal.pending().unwrap().is_empty());
    }

    #[test]
    fn torn_tail_is_ignored() {
        let pending = parse_pending("BEGIN:a:a.bin\nCOMMIT:a\nBEGIN:b");
        assert!(pending.is_empty());
        let pending = parse_pending("BEGIN:a:a.bin\nCOMM");
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn rebegin_after_commit_is_pending_again() {
        let pending = parse_pending("BEGIN:a:1.bin\nCOMMIT:a\nBEGIN:a:2.bin\n");
        assert_eq!(pending[0].artifact, "2.bin");
    }

    #[test]
    fn loggable_keys() {
        assert!(is_loggable_key("com/acme/Foo"));
        assert!(!is_loggable_key(""));
        assert!(!is_loggable_key("bad\nkey"));
    }
}
