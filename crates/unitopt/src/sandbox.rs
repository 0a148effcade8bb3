//! Per-thread resource accounting for transforms.
//!
//! Each worker thread owns one [`SandboxContext`], reused across calls and
//! reset at the start of every transform. Passes charge it as they visit
//! instructions; the analyzer charges it and tracks nesting depth. A shared
//! [`JobControl`] lets the watchdog cancel a running job and learn which pass
//! was executing when it gave up.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{AnalysisError, PassError};

/// Ceilings enforced by a sandbox.
#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub max_pass_instructions: u64,
    pub max_analysis_depth: u32,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_pass_instructions: 500_000,
            max_analysis_depth: 32,
        }
    }
}

/// Cancellation flag and progress marker shared between a job and its watchdog.
#[derive(Debug, Default)]
pub struct JobControl {
    cancelled: AtomicBool,
    current_pass: Mutex<Option<&'static str>>,
}

impl JobControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Pass that was running most recently, if any.
    pub fn current_pass(&self) -> Option<&'static str> {
        *self
            .current_pass
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_current_pass(&self, pass: Option<&'static str>) {
        *self
            .current_pass
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = pass;
    }
}

/// Resource accounting for one transform on one thread.
#[derive(Debug, Default)]
pub struct SandboxContext {
    /// Current analyzer nesting depth.
    pub analysis_depth: u32,
    /// Instructions visited by every pass and analysis of this transform.
    pub instructions_processed: u64,
    /// Instructions visited by the current pass only.
    pub pass_instructions: u64,
    /// Analyzer invocations during this transform.
    pub analyses: u32,
    pub start_time: Option<Instant>,
    pub current_unit: Option<String>,
    pub current_pass: Option<&'static str>,
    /// Set once a ceiling is hit; cleared only by [`SandboxContext::reset`].
    pub aborted: bool,
    limits: SandboxLimits,
    job: Option<Arc<JobControl>>,
}

impl SandboxContext {
    pub fn new(limits: SandboxLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    /// Prepare for a new transform of `unit_key`.
    pub fn reset(&mut self, unit_key: &str, limits: SandboxLimits, job: Option<Arc<JobControl>>) {
        self.analysis_depth = 0;
        self.instructions_processed = 0;
        self.pass_instructions = 0;
        self.analyses = 0;
        self.start_time = Some(Instant::now());
        self.current_unit = Some(unit_key.to_string());
        self.current_pass = None;
        self.aborted = false;
        self.limits = limits;
        self.job = job;
    }

    pub fn limits(&self) -> SandboxLimits {
        self.limits
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.map(|t| t.elapsed()).unwrap_or_default()
    }

    /// Mark the start of a pass; resets the per-pass budget.
    pub fn begin_pass(&mut self, pass: &'static str) {
        self.current_pass = Some(pass);
        self.pass_instructions = 0;
        if let Some(job) = &self.job {
            job.set_current_pass(Some(pass));
        }
    }

    pub fn end_pass(&mut self) {
        self.current_pass = None;
    }

    /// Charge `count` visited instructions against the current pass.
    ///
    /// Fails when the pass budget is exhausted or the job was cancelled.
    pub fn charge(&mut self, count: usize) -> Result<(), PassError> {
        let count = u64::try_from(count).unwrap_or(u64::MAX);
        self.instructions_processed = self.instructions_processed.saturating_add(count);
        self.pass_instructions = self.pass_instructions.saturating_add(count);
        self.check()
    }

    /// Fail if a ceiling has been crossed or the job was cancelled.
    pub fn check(&mut self) -> Result<(), PassError> {
        if self.job.as_ref().is_some_and(|job| job.is_cancelled()) {
            self.aborted = true;
            return Err(PassError::Cancelled);
        }
        if self.pass_instructions > self.limits.max_pass_instructions {
            self.aborted = true;
            return Err(PassError::BudgetExceeded {
                pass: self.current_pass.unwrap_or("analysis"),
                processed: self.pass_instructions,
                limit: self.limits.max_pass_instructions,
            });
        }
        Ok(())
    }

    /// Enter a nested analysis. Pair with [`SandboxContext::exit_analysis`].
    pub fn enter_analysis(&mut self, instructions: usize) -> Result<(), AnalysisError> {
        let depth = self.analysis_depth.saturating_add(1);
        if depth > self.limits.max_analysis_depth {
            self.aborted = true;
            return Err(AnalysisError::DepthExceeded {
                depth,
                max: self.limits.max_analysis_depth,
            });
        }
        self.analysis_depth = depth;
        self.analyses = self.analyses.saturating_add(1);
        self.instructions_processed = self
            .instructions_processed
            .saturating_add(u64::try_from(instructions).unwrap_or(u64::MAX));
        Ok(())
    }

    pub fn exit_analysis(&mut self) {
        self.analysis_depth = self.analysis_depth.saturating_sub(1);
    }

    pub fn is_cancelled(&self) -> bool {
        self.job.as_ref().is_some_and(|job| job.is_cancelled())
    }
}

thread_local! {
    static SANDBOX: RefCell<SandboxContext> = RefCell::new(SandboxContext::default());
}

/// Run `f` with this thread's sandbox, reset for `unit_key`.
///
/// A re-entrant call (the thread's sandbox already borrowed) gets a fresh
/// temporary context instead.
pub fn with_thread_sandbox<R>(
    unit_key: &str,
    limits: SandboxLimits,
    job: Option<Arc<JobControl>>,
    f: impl FnOnce(&mut SandboxContext) -> R,
) -> R {
    SANDBOX.with(|cell| match cell.try_borrow_mut() {
        Ok(mut sandbox) => {
            sandbox.reset(unit_key, limits, job);
            let result = f(&mut sandbox);
            // Drop the job handle so the watchdog's Arc is not kept alive.
            sandbox.job = None;
            result
        }
        Err(_) => {
            let mut sandbox = SandboxContext::new(limits);
            sandbox.reset(unit_key, limits, job);
            f(&mut sandbox)
        }
    })
}
