//! Cross-unit dependency graph.
//!
//! An edge `A -> B` means A's optimized output relies on a fact about B
//! (B is sealed, B::m returns a constant). When B changes, A and everything
//! that transitively depends on A must be re-optimized.
//!
//! Persisted as `dependencies.bin`:
//!
//! ```text
//! unit count u32
//! repeated:  unit key (u32 len + UTF-8), dependency count u32,
//!            dependency keys (u32 len + UTF-8 each)
//! ```

use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{StorageError, UnitError};
use crate::persist;
use crate::unit::codec::Reader;

pub const DEPENDENCY_FILE: &str = "dependencies.bin";

#[derive(Debug, Default)]
struct Graph {
    /// unit -> units it depends on
    forward: FxHashMap<String, FxHashSet<String>>,
    /// unit -> units depending on it
    reverse: FxHashMap<String, FxHashSet<String>>,
}

impl Graph {
    fn unlink(&mut self, unit: &str) {
        if let Some(old) = self.forward.remove(unit) {
            for dep in old {
                if let Some(dependents) = self.reverse.get_mut(&dep) {
                    dependents.remove(unit);
                    if dependents.is_empty() {
                        self.reverse.remove(&dep);
                    }
                }
            }
        }
    }

    fn link(&mut self, unit: &str, deps: impl IntoIterator<Item = String>) {
        let deps: FxHashSet<String> = deps.into_iter().filter(|d| d != unit).collect();
        if deps.is_empty() {
            return;
        }
        for dep in &deps {
            self.reverse
                .entry(dep.clone())
                .or_default()
                .insert(unit.to_string());
        }
        self.forward.insert(unit.to_string(), deps);
    }
}

#[derive(Debug, Default)]
pub struct DependencyTracker {
    graph: RwLock<Graph>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every edge out of `unit` with `deps`.
    pub fn set_dependencies(&self, unit: &str, deps: impl IntoIterator<Item = String>) {
        let mut graph = self.graph.write().unwrap_or_else(PoisonError::into_inner);
        graph.unlink(unit);
        graph.link(unit, deps);
    }

    /// Drop `unit` as a dependent. Units depending on it keep their edges.
    pub fn remove_unit(&self, unit: &str) {
        self.graph
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .unlink(unit);
    }

    pub fn dependencies_of(&self, unit: &str) -> BTreeSet<String> {
        self.graph
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .forward
            .get(unit)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every unit that depends on `changed`, directly or through other units.
    /// `changed` itself is not included unless it sits on a cycle.
    pub fn dependents_transitive(&self, changed: &str) -> BTreeSet<String> {
        let graph = self.graph.read().unwrap_or_else(PoisonError::into_inner);
        let mut found = BTreeSet::new();
        let mut queue = VecDeque::from([changed.to_string()]);
        while let Some(unit) = queue.pop_front() {
            let Some(dependents) = graph.reverse.get(&unit) else {
                continue;
            };
            for dependent in dependents {
                if found.insert(dependent.clone()) {
                    queue.push_back(dependent.clone());
                }
            }
        }
        found
    }

    pub fn len(&self) -> usize {
        self.graph
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .forward
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        let graph = self.graph.read().unwrap_or_else(PoisonError::into_inner);
        // Sorted so the file is stable across runs.
        let mut units: Vec<(&String, &FxHashSet<String>)> = graph.forward.iter().collect();
        units.sort_by(|a, b| a.0.cmp(b.0));

        let mut out = Vec::new();
        put_len(&mut out, units.len())?;
        for (unit, deps) in units {
            put_str(&mut out, unit)?;
            let mut deps: Vec<&String> = deps.iter().collect();
            deps.sort();
            put_len(&mut out, deps.len())?;
            for dep in deps {
                put_str(&mut out, dep)?;
            }
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let mut reader = Reader::new(bytes);
        let mut graph = Graph::default();
        let units = reader.u32().map_err(corrupt)?;
        for _ in 0..units {
            let unit = read_str(&mut reader)?;
            let count = reader.u32().map_err(corrupt)?;
            let mut deps = Vec::new();
            for _ in 0..count {
                deps.push(read_str(&mut reader)?);
            }
            graph.unlink(&unit);
            graph.link(&unit, deps);
        }
        if reader.remaining() != 0 {
            return Err(StorageError::Corrupt {
                file: "dependencies",
                reason: format!("{} trailing bytes", reader.remaining()),
            });
        }
        Ok(Self {
            graph: RwLock::new(graph),
        })
    }

    /// Load from `path`; a missing file is an empty graph.
    pub fn load(path: &Path) -> Result<Self, StorageError> {
        match persist::read_optional(path)? {
            Some(bytes) if !bytes.is_empty() => Self::decode(&bytes),
            _ => Ok(Self::new()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), StorageError> {
        persist::write_atomic(path, &self.encode()?)?;
        Ok(())
    }
}

fn corrupt(err: UnitError) -> StorageError {
    StorageError::Corrupt {
        file: "dependencies",
        reason: err.to_string(),
    }
}

fn read_str(reader: &mut Reader<'_>) -> Result<String, StorageError> {
    let len = reader.u32().map_err(corrupt)?;
    let len = usize::try_from(len).map_err(|_| StorageError::Corrupt {
        file: "dependencies",
        reason: "length overflow".to_string(),
    })?;
    let raw = reader.take(len).map_err(corrupt)?;
    String::from_utf8(raw.to_vec()).map_err(|_| StorageError::Corrupt {
        file: "dependencies",
        reason: "key is not UTF-8".to_string(),
    })
}

fn put_len(out: &mut Vec<u8>, len: usize) -> Result<(), StorageError> {
    let len = u32::try_from(len).map_err(|_| StorageError::Corrupt {
        file: "dependencies",
        reason: format!("length {len} exceeds u32"),
    })?;
    out.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

fn put_str(out: &mut Vec<u8>, value: &str) -> Result<(), StorageError> {
    put_len(out, value.len())?;
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn transitive_dependents() {
        let tracker = DependencyTracker::new();
        tracker.set_dependencies("A", deps(&["B"]));
        tracker.set_dependencies("C", deps(&["A"]));
        tracker.set_dependencies("D", deps(&["X"]));

        let hit = tracker.dependents_transitive("B");
        assert_eq!(hit, BTreeSet::from(["A".to_string(), "C".to_string()]));
        assert!(tracker.dependents_transitive("C").is_empty());
    }

    #[test]
    fn reoptimizing_replaces_edges() {
        let tracker = DependencyTracker::new();
        tracker.set_dependencies("A", deps(&["B", "A"]));
        tracker.set_dependencies("A", deps(&["C"]));
        assert!(tracker.dependents_transitive("B").is_empty());
        assert_eq!(tracker.dependencies_of("A"), BTreeSet::from(["C".to_string()]));

        tracker.set_dependencies("A", Vec::new());
        assert!(tracker.is_empty());
    }

    #[test]
    fn cycles_terminate() {
        let tracker = DependencyTracker::new();
        tracker.set_dependencies("A", deps(&["B"]));
        tracker.set_dependencies("B", deps(&["A"]));
        let hit = tracker.dependents_transitive("A");
        assert_eq!(hit, BTreeSet::from(["A".to_string(), "B".to_string()]));
    }

    #[test]
    fn graph_survives_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEPENDENCY_FILE);
        assert!(DependencyTracker::load(&path).unwrap().is_empty());

        let tracker = DependencyTracker::new();
        tracker.set_dependencies("com/acme/A", deps(&["com/acme/B", "com/acme/C"]));
        tracker.set_dependencies("com/acme/D", deps(&["com/acme/B"]));
        tracker.save(&path).unwrap();

        let loaded = DependencyTracker::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(
            loaded.dependents_transitive("com/acme/B"),
            BTreeSet::from(["com/acme/A".to_string(), "com/acme/D".to_string()])
        );
        assert_eq!(loaded.encode().unwrap(), tracker.encode().unwrap());
    }

    #[test]
    fn truncated_file_is_corrupt() {
        let tracker = DependencyTracker::new();
        tracker.set_dependencies("A", deps(&["B"]));
        let bytes = tracker.encode().unwrap();
        let err = DependencyTracker::decode(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { file: "dependencies", .. }));
    }
}
