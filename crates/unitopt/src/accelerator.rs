//! Startup accelerator: remembers which units a session asked for first,
//! and on the next start promotes those units from L3 into L2 ahead of
//! demand.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::persist;

pub const LOAD_ORDER_FILE: &str = "load_order.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOrder {
    pub recorded_at_ms: u64,
    pub units: Vec<String>,
}

impl LoadOrder {
    pub fn load(path: &Path) -> Result<Self, StorageError> {
        match persist::read_optional(path)? {
            Some(bytes) if !bytes.is_empty() => Ok(serde_json::from_slice(&bytes)?),
            _ => Ok(Self::default()),
        }
    }
}

#[derive(Debug, Default)]
struct Recording {
    seen: FxHashSet<String>,
    order: Vec<String>,
}

#[derive(Debug)]
pub struct StartupAccelerator {
    max_recorded: usize,
    prewarm_limit: usize,
    previous: LoadOrder,
    recording: Mutex<Recording>,
}

impl StartupAccelerator {
    pub fn new(max_recorded: usize, prewarm_limit: usize, previous: LoadOrder) -> Self {
        Self {
            max_recorded,
            prewarm_limit,
            previous,
            recording: Mutex::new(Recording::default()),
        }
    }

    /// Note that `unit_key` was requested. Only the first request counts.
    pub fn record(&self, unit_key: &str) {
        let mut recording = self.recording.lock().unwrap_or_else(PoisonError::into_inner);
        if recording.order.len() >= self.max_recorded || recording.seen.contains(unit_key) {
            return;
        }
        recording.seen.insert(unit_key.to_string());
        recording.order.push(unit_key.to_string());
    }

    /// Units from the previous session to prewarm, in first-seen order.
    pub fn prewarm_candidates(&self) -> Vec<String> {
        self.previous
            .units
            .iter()
            .take(self.prewarm_limit)
            .cloned()
            .collect()
    }

    pub fn current_order(&self) -> LoadOrder {
        let recording = self.recording.lock().unwrap_or_else(PoisonError::into_inner);
        LoadOrder {
            recorded_at_ms: persist::now_millis(),
            units: recording.order.clone(),
        }
    }

    /// Persist this session's order. An empty session keeps the previous file.
    pub fn save(&self, path: &Path) -> Result<(), StorageError> {
        let order = self.current_order();
        if order.units.is_empty() {
            return Ok(());
        }
        persist::write_atomic(path, &serde_json::to_vec_pretty(&order)?)?;
        Ok(())
    }
}
