//! Stability governor: lifecycle state machine, failure accounting,
//! cascade containment and heap backpressure.
//!
//! Files under the data directory:
//!
//! ```text
//! state               current state name, rewritten on every transition
//! recovery_requested  marker; consumed at startup for a fresh start
//! governor.json       pass failure records, unit failure counts, blacklist
//! crash-reports/      diagnostic dumps from emergency shutdowns
//! ```

pub mod canary;
pub mod failures;
pub mod heap;
pub mod report;
pub mod state;

pub use canary::{CanaryFailure, run_canaries};
pub use failures::{CascadeWindow, FailureLedger, PassRecord};
pub use heap::{HeapGauge, HeapMonitor, MemoryProbe, PressureChange, ProcStatm};
pub use report::DiagnosticReport;
pub use state::OptimizerState;

use std::backtrace::Backtrace;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::config::GovernorConfig;
use crate::error::{GovernorError, Rejection};
use crate::metrics::MetricsSnapshot;
use crate::persist;

pub const STATE_FILE: &str = "state";
pub const RECOVERY_MARKER: &str = "recovery_requested";
pub const LEDGER_FILE: &str = "governor.json";

/// How the governor found its data directory at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Startup {
    Fresh,
    /// The recovery marker was present and consumed.
    Recovered,
    /// A persisted DISABLED state was kept.
    StillDisabled,
}

#[derive(Debug)]
struct Timing {
    /// When the current state was entered.
    entered_at: Instant,
    last_pass_failure: Option<Instant>,
}

#[derive(Debug)]
pub struct StabilityGovernor {
    data_dir: PathBuf,
    config: GovernorConfig,
    state: AtomicU8,
    /// Held across a state change and the write of the state file, so the
    /// file always ends up holding the latest state.
    state_io: Mutex<()>,
    ledger: RwLock<FailureLedger>,
    /// Set when `ledger` has changes not yet written to `governor.json`.
    ledger_dirty: AtomicBool,
    cascade: Mutex<CascadeWindow>,
    timing: Mutex<Timing>,
    heap: Arc<HeapGauge>,
    started_at_ms: u64,
}

impl StabilityGovernor {
    /// Load persisted records and state from `data_dir`.
    pub fn open(
        data_dir: &Path,
        config: GovernorConfig,
        heap: Arc<HeapGauge>,
    ) -> Result<(Self, Startup), GovernorError> {
        fs::create_dir_all(data_dir)?;
        let mut ledger = FailureLedger::load(&data_dir.join(LEDGER_FILE))?;
        let marker = data_dir.join(RECOVERY_MARKER);

        let (state, startup) = if persist::remove_if_exists(&marker)? {
            ledger.clear_pass_records();
            ledger.save(&data_dir.join(LEDGER_FILE))?;
            info!("Recovery marker consumed, starting fresh");
            (OptimizerState::Uninitialized, Startup::Recovered)
        } else {
            match read_state(data_dir) {
                Ok(Some(OptimizerState::Disabled)) => {
                    warn!("Optimizer was DISABLED in a previous run and stays disabled");
                    (OptimizerState::Disabled, Startup::StillDisabled)
                }
                Ok(_) => (OptimizerState::Uninitialized, Startup::Fresh),
                Err(err) => {
                    warn!(error = %err, "Ignoring unreadable persisted state");
                    (OptimizerState::Uninitialized, Startup::Fresh)
                }
            }
        };

        let governor = Self {
            data_dir: data_dir.to_path_buf(),
            cascade: Mutex::new(CascadeWindow::new(config.cascade_window())),
            config,
            state: AtomicU8::new(state as u8),
            state_io: Mutex::new(()),
            ledger: RwLock::new(ledger),
            ledger_dirty: AtomicBool::new(false),
            timing: Mutex::new(Timing {
                entered_at: Instant::now(),
                last_pass_failure: None,
            }),
            heap,
            started_at_ms: persist::now_millis(),
        };
        governor.persist_state();
        Ok((governor, startup))
    }

    pub fn state(&self) -> OptimizerState {
        OptimizerState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(OptimizerState::Disabled)
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Move to `to` if the transition table allows it from the current state.
    pub fn transition(&self, to: OptimizerState) -> Result<(), GovernorError> {
        let _io = self.lock_state_io();
        let mut current = self.state();
        loop {
            if !current.can_transition_to(to) {
                warn!(from = %current, to = %to, "Rejected illegal state transition");
                return Err(GovernorError::IllegalTransition { from: current, to });
            }
            match self.state.compare_exchange(
                current as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => {
                    current = OptimizerState::from_u8(actual).unwrap_or(OptimizerState::Disabled);
                }
            }
        }
        self.lock_timing().entered_at = Instant::now();
        self.persist_state();
        info!(from = %current, to = %to, "Optimizer state transition");
        Ok(())
    }

    /// Enter DISABLED from wherever we are. No-op if already disabled.
    pub fn force_disable(&self, reason: &str) {
        if self.state() == OptimizerState::Disabled {
            return;
        }
        if self.transition(OptimizerState::Disabled).is_ok() {
            error!(%reason, "Optimizer disabled");
        }
    }

    /// The only way out of DISABLED. Clears pass records and the cascade window.
    pub fn manual_reset(&self) -> Result<(), GovernorError> {
        let from = OptimizerState::Disabled;
        let to = OptimizerState::Uninitialized;
        let _io = self.lock_state_io();
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|actual| GovernorError::IllegalTransition {
                from: OptimizerState::from_u8(actual).unwrap_or(from),
                to,
            })?;
        {
            let mut ledger = self.write_ledger();
            ledger.clear_pass_records();
            ledger.save(&self.data_dir.join(LEDGER_FILE))?;
        }
        self.lock_cascade().clear();
        self.lock_timing().entered_at = Instant::now();
        self.persist_state();
        info!("Optimizer manually reset");
        Ok(())
    }

    /// UNINITIALIZED -> BOOTSTRAPPING -> canaries -> WARMING.
    ///
    /// A failing canary disables the optimizer. A persisted DISABLED state
    /// is left alone.
    pub fn bootstrap(
        &self,
        canaries: impl FnOnce() -> Result<(), CanaryFailure>,
    ) -> Result<OptimizerState, GovernorError> {
        if self.state() == OptimizerState::Disabled {
            return Ok(OptimizerState::Disabled);
        }
        self.transition(OptimizerState::Bootstrapping)?;
        if self.config.run_canaries
            && let Err(failure) = canaries()
        {
            self.force_disable(&failure.to_string());
            return Ok(OptimizerState::Disabled);
        }
        self.transition(OptimizerState::Warming)?;
        Ok(OptimizerState::Warming)
    }

    /// Governor-side admission: state, heap backpressure, blacklist.
    pub fn admit(&self, unit_key: &str) -> Result<(), Rejection> {
        let state = self.state();
        if !state.permits_optimization() {
            return Err(Rejection::NotPermitted(state));
        }
        if self.heap.is_paused() {
            return Err(Rejection::HeapPressure);
        }
        if self.is_blacklisted(unit_key) {
            return Err(Rejection::Blacklisted);
        }
        Ok(())
    }

    pub fn is_blacklisted(&self, unit_key: &str) -> bool {
        self.read_ledger().blacklist.contains(unit_key)
    }

    pub fn is_pass_disabled(&self, pass: &str) -> bool {
        self.read_ledger().is_pass_disabled(pass)
    }

    pub fn disabled_passes(&self) -> Vec<String> {
        self.read_ledger().disabled_passes()
    }

    pub fn blacklist(&self) -> Vec<String> {
        self.read_ledger().blacklist.iter().cloned().collect()
    }

    pub fn ledger(&self) -> FailureLedger {
        self.read_ledger().clone()
    }

    pub fn heap(&self) -> &Arc<HeapGauge> {
        &self.heap
    }

    /// Count a failure of `pass` on `unit_key`.
    ///
    /// Disabling a pass degrades the optimizer; too many disabled passes
    /// disable it. Returns true when this call disabled the pass.
    pub fn record_pass_failure(&self, pass: &str, unit_key: &str) -> bool {
        self.lock_timing().last_pass_failure = Some(Instant::now());
        let (newly_disabled, disabled_count) = {
            let mut ledger = self.write_ledger();
            let newly = ledger.record_pass(pass, unit_key, self.config.pass_failure_threshold);
            self.ledger_dirty.store(true, Ordering::Release);
            (newly, ledger.disabled_count())
        };
        if !newly_disabled {
            return false;
        }
        warn!(pass, unit = %unit_key, disabled = disabled_count, "Pass disabled after repeated failures");

        if disabled_count > self.config.max_disabled_passes {
            self.force_disable(&format!(
                "{disabled_count} passes disabled (max {})",
                self.config.max_disabled_passes
            ));
        } else if matches!(
            self.state(),
            OptimizerState::Active | OptimizerState::Warming
        ) {
            // Losing a race with another transition is fine.
            let _ = self.transition(OptimizerState::Degraded);
        }
        true
    }

    /// Count a failure against `unit_key`. Returns true when it got blacklisted.
    ///
    /// Only memory is updated; [`Self::save_records`] writes the file.
    pub fn record_unit_failure(&self, unit_key: &str) -> bool {
        let blacklisted = {
            let mut ledger = self.write_ledger();
            let blacklisted = ledger.record_unit(unit_key, self.config.unit_failure_threshold);
            self.ledger_dirty.store(true, Ordering::Release);
            blacklisted
        };
        if blacklisted {
            warn!(unit = %unit_key, "Unit blacklisted after repeated failures");
        }
        blacklisted
    }

    /// Forget earlier failures of a unit that has since transformed cleanly.
    pub fn record_unit_success(&self, unit_key: &str) {
        if !self.read_ledger().unit_failures.contains_key(unit_key) {
            return;
        }
        if self.write_ledger().unit_failures.remove(unit_key).is_some() {
            self.ledger_dirty.store(true, Ordering::Release);
        }
    }

    /// Add a failure to the cascade window. Returns true when the window
    /// has reached the cascade threshold.
    pub fn record_cascade_failure(&self, what: String) -> bool {
        let in_window = self.lock_cascade().record(Instant::now(), what);
        in_window >= self.config.cascade_threshold
    }

    /// Capture a diagnostic report, set the recovery marker and disable.
    ///
    /// Writing the report and flushing the cache tiers is the caller's job,
    /// off the loader thread.
    pub fn emergency_shutdown(
        &self,
        reason: &str,
        metrics: Option<MetricsSnapshot>,
        threads: Vec<String>,
    ) -> DiagnosticReport {
        let report = DiagnosticReport {
            reason: reason.to_string(),
            state: self.state(),
            written_at_ms: persist::now_millis(),
            started_at_ms: self.started_at_ms,
            metrics,
            disabled_passes: self.disabled_passes(),
            blacklist: self.blacklist(),
            cascade_window: self.lock_cascade().contents(Instant::now()),
            resident_bytes: report::resident_bytes(),
            threads,
            backtrace: Arc::new(Backtrace::force_capture()),
        };
        if let Err(err) = request_recovery(&self.data_dir) {
            error!(error = %err, "Failed to write recovery marker");
        }
        self.lock_cascade().clear();
        self.force_disable(reason);
        error!(%reason, "Emergency shutdown");
        report
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Time-driven transitions: WARMING settles into ACTIVE, and DEGRADED
    /// recovers after a quiet window.
    pub fn tick(&self, now: Instant) {
        let (in_state, quiet) = {
            let timing = self.lock_timing();
            let in_state = now.saturating_duration_since(timing.entered_at);
            let quiet = timing
                .last_pass_failure
                .map_or(in_state, |at| now.saturating_duration_since(at).min(in_state));
            (in_state, quiet)
        };
        match self.state() {
            OptimizerState::Warming if in_state >= self.config.warming_settle() => {
                let _ = self.transition(OptimizerState::Active);
            }
            OptimizerState::Degraded if quiet >= self.config.degraded_recovery() => {
                let _ = self.transition(OptimizerState::Active);
            }
            _ => {}
        }
    }

    /// Persist state and records.
    pub fn save(&self) -> Result<(), GovernorError> {
        self.ledger_dirty.store(true, Ordering::Release);
        self.save_records()?;
        let _io = self.lock_state_io();
        persist::write_atomic(&self.data_dir.join(STATE_FILE), self.state().as_str().as_bytes())?;
        Ok(())
    }

    /// Write `governor.json` if the records changed since the last write.
    ///
    /// The file is written from a snapshot, outside the ledger lock.
    pub fn save_records(&self) -> Result<bool, GovernorError> {
        if !self.ledger_dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        let snapshot = self.read_ledger().clone();
        if let Err(err) = snapshot.save(&self.data_dir.join(LEDGER_FILE)) {
            self.ledger_dirty.store(true, Ordering::Release);
            return Err(err.into());
        }
        Ok(true)
    }

    pub fn records_dirty(&self) -> bool {
        self.ledger_dirty.load(Ordering::Acquire)
    }

    pub fn uptime(&self) -> Duration {
        Duration::from_millis(persist::now_millis().saturating_sub(self.started_at_ms))
    }

    /// Write the current state. Callers hold `state_io`.
    fn persist_state(&self) {
        let state = self.state();
        let path = self.data_dir.join(STATE_FILE);
        if let Err(err) = persist::write_atomic(&path, state.as_str().as_bytes()) {
            warn!(error = %err, %state, "Failed to persist optimizer state");
        }
    }

    fn read_ledger(&self) -> std::sync::RwLockReadGuard<'_, FailureLedger> {
        self.ledger.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_ledger(&self) -> std::sync::RwLockWriteGuard<'_, FailureLedger> {
        self.ledger.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cascade(&self) -> std::sync::MutexGuard<'_, CascadeWindow> {
        self.cascade.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_state_io(&self) -> std::sync::MutexGuard<'_, ()> {
        self.state_io.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_timing(&self) -> std::sync::MutexGuard<'_, Timing> {
        self.timing.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// State persisted in `data_dir`, if any.
pub fn read_state(data_dir: &Path) -> Result<Option<OptimizerState>, GovernorError> {
    match persist::read_optional(&data_dir.join(STATE_FILE))? {
        Some(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).parse()?)),
        None => Ok(None),
    }
}

/// Ask the next startup to begin fresh.
pub fn request_recovery(data_dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(data_dir)?;
    persist::write_atomic(&data_dir.join(RECOVERY_MARKER), b"")
}
