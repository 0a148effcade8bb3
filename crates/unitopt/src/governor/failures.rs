//! Failure bookkeeping persisted across restarts as `governor.json`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::persist;

/// Failures attributed to one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassRecord {
    /// Distinct units the pass has failed on.
    pub units: BTreeSet<String>,
    /// All failures, including repeats on the same unit.
    pub total: u64,
    /// Set once the pass has been removed from the pipeline.
    pub disabled_reason: Option<String>,
}

impl PassRecord {
    pub fn is_disabled(&self) -> bool {
        self.disabled_reason.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureLedger {
    pub passes: BTreeMap<String, PassRecord>,
    pub unit_failures: BTreeMap<String, u32>,
    pub blacklist: BTreeSet<String>,
}

impl FailureLedger {
    pub fn load(path: &Path) -> Result<Self, StorageError> {
        match persist::read_optional(path)? {
            Some(bytes) if !bytes.is_empty() => Ok(serde_json::from_slice(&bytes)?),
            _ => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(self)?;
        persist::write_atomic(path, &bytes)?;
        Ok(())
    }

    /// Count a failure of `pass` on `unit_key`.
    ///
    /// Returns true when this failure newly disables the pass.
    pub fn record_pass(&mut self, pass: &str, unit_key: &str, threshold: u32) -> bool {
        let record = self.passes.entry(pass.to_string()).or_default();
        record.total = record.total.saturating_add(1);
        record.units.insert(unit_key.to_string());
        if record.is_disabled() || record.units.len() < threshold as usize {
            return false;
        }
        record.disabled_reason = Some(format!(
            "failed on {} distinct units (threshold {threshold})",
            record.units.len()
        ));
        true
    }

    /// Count a failure on `unit_key`. Returns true when this failure blacklists it.
    ///
    /// A blacklisted unit keeps no failure count.
    pub fn record_unit(&mut self, unit_key: &str, threshold: u32) -> bool {
        if self.blacklist.contains(unit_key) {
            return false;
        }
        let count = self.unit_failures.entry(unit_key.to_string()).or_default();
        *count = count.saturating_add(1);
        if *count < threshold {
            return false;
        }
        self.unit_failures.remove(unit_key);
        self.blacklist.insert(unit_key.to_string())
    }

    pub fn is_pass_disabled(&self, pass: &str) -> bool {
        self.passes.get(pass).is_some_and(PassRecord::is_disabled)
    }

    pub fn disabled_passes(&self) -> Vec<String> {
        self.passes
            .iter()
            .filter(|(_, record)| record.is_disabled())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn disabled_count(&self) -> usize {
        self.passes.values().filter(|r| r.is_disabled()).count()
    }

    /// Forget pass failures. The blacklist and unit counts survive.
    pub fn clear_pass_records(&mut self) {
        self.passes.clear();
    }
}

/// Sliding window of recent failures for cascade detection.
#[derive(Debug)]
pub struct CascadeWindow {
    window: Duration,
    events: VecDeque<(Instant, String)>,
}

impl CascadeWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            events: VecDeque::new(),
        }
    }

    /// Record a failure at `now` and return how many fall inside the window.
    pub fn record(&mut self, now: Instant, what: String) -> usize {
        self.events.push_back((now, what));
        self.expire(now);
        self.events.len()
    }

    fn expire(&mut self, now: Instant) {
        while let Some((at, _)) = self.events.front() {
            if now.saturating_duration_since(*at) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Events in the window, oldest first, as (age, description).
    pub fn contents(&self, now: Instant) -> Vec<(Duration, String)> {
        self.events
            .iter()
            .map(|(at, what)| (now.saturating_duration_since(*at), what.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_disables_at_distinct_unit_threshold() {
        let mut ledger = FailureLedger::default();
        for _ in 0..4 {
            assert!(!ledger.record_pass("inlining", "same-unit", 3));
        }
        assert!(!ledger.record_pass("inlining", "u2", 3));
        assert!(ledger.record_pass("inlining", "u3", 3));
        assert!(!ledger.record_pass("inlining", "u4", 3), "already disabled");
        assert!(ledger.is_pass_disabled("inlining"));
        assert_eq!(ledger.passes["inlining"].total, 7);
        assert_eq!(ledger.disabled_passes(), vec!["inlining".to_string()]);
    }

    #[test]
    fn unit_blacklisted_once() {
        let mut ledger = FailureLedger::default();
        assert!(!ledger.record_unit("u", 3));
        assert!(!ledger.record_unit("u", 3));
        assert!(ledger.record_unit("u", 3));
        assert!(!ledger.record_unit("u", 3));
        assert!(ledger.blacklist.contains("u"));
        assert!(ledger.unit_failures.is_empty(), "count dropped once blacklisted");
    }

    #[test]
    fn ledger_round_trips_through_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("governor.json");
        assert_eq!(FailureLedger::load(&path).unwrap(), FailureLedger::default());

        let mut ledger = FailureLedger::default();
        ledger.record_pass("dead_code", "a", 1);
        ledger.record_unit("b", 1);
        ledger.save(&path).unwrap();
        let loaded = FailureLedger::load(&path).unwrap();
        assert_eq!(loaded, ledger);

        let mut cleared = loaded;
        cleared.clear_pass_records();
        assert_eq!(cleared.disabled_count(), 0);
        assert!(cleared.blacklist.contains("b"));
    }

    #[test]
    fn window_expires_old_events() {
        let start = Instant::now();
        let mut window = CascadeWindow::new(Duration::from_secs(5));
        assert_eq!(window.record(start, "a".into()), 1);
        assert_eq!(window.record(start + Duration::from_secs(3), "b".into()), 2);
        assert_eq!(window.record(start + Duration::from_secs(7), "c".into()), 2);
        let contents = window.contents(start + Duration::from_secs(7));
        assert_eq!(contents[0].1, "b");
        assert_eq!(contents[0].0, Duration::from_secs(4));
    }
}
