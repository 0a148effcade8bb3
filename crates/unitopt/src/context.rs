//! The owned pipeline: one value constructed at startup and shared by
//! reference with every loader thread.
//!
//! ```text
//! transform(key, bytes)
//!   -> pre-validate + governor admission     (reject: passthrough)
//!   -> L1 / L2 / L3 lookup                   (hit: cached bytes)
//!   -> worker pool: sandbox, passes, verify  (failure: passthrough + accounting)
//!   -> L1 insert, background L3 store
//! ```

use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::accelerator::{LOAD_ORDER_FILE, LoadOrder, StartupAccelerator};
use crate::cache::{HealReport, ProducerVersions, Tier, TieredCache};
use crate::config::PipelineConfig;
use crate::dependency::{DEPENDENCY_FILE, DependencyTracker};
use crate::error::{ConfigError, OptimizerError, Rejection, StorageError, TransformError};
use crate::governor::{
    HeapGauge, HeapMonitor, OptimizerState, PressureChange, ProcStatm, StabilityGovernor, Startup,
    run_canaries,
};
use crate::integrity::IntegrityGate;
use crate::loader::LoaderContext;
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::passes::{PassPipeline, PipelineReport, panic_message};
use crate::pool::{BackgroundTask, BackgroundWorker, TransformJob, TransformPool};
use crate::sandbox::with_thread_sandbox;
use crate::transform::{TransformOutcome, Transformer};
use crate::unit::digest::UnitDigest;

/// Written into the L3 index; a different producer invalidates every entry.
pub const PRODUCER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ANALYZER_VERSION: u32 = 1;
/// L3 lives under this subdirectory of the data dir.
pub const CACHE_DIR: &str = "cache";

/// State shared between the caller-facing context and its worker threads.
struct Shared {
    data_dir: PathBuf,
    transformer: Transformer,
    cache: TieredCache,
    governor: StabilityGovernor,
    dependencies: DependencyTracker,
    accelerator: StartupAccelerator,
    metrics: PipelineMetrics,
}

impl Shared {
    fn run_job(&self, job: &TransformJob) -> TransformOutcome {
        let is_disabled = |pass: &str| self.governor.is_pass_disabled(pass);
        with_thread_sandbox(
            &job.unit_key,
            self.transformer.sandbox_limits(),
            Some(Arc::clone(&job.control)),
            |sandbox| {
                self.transformer.optimize(
                    &job.unit_key,
                    &job.bytes,
                    job.loader.facts(),
                    &is_disabled,
                    &self.metrics,
                    sandbox,
                )
            },
        )
    }

    fn run_background(&self, task: BackgroundTask) {
        match task {
            BackgroundTask::Store {
                unit_key,
                source,
                bytes,
            } => match self.cache.store_cold(&unit_key, &source, &bytes) {
                Ok(()) => PipelineMetrics::incr(&self.metrics.stores),
                Err(err) => warn!(unit = %unit_key, error = %err, "Failed to store artifact"),
            },
            BackgroundTask::Prewarm(units) => {
                let mut promoted = 0u64;
                for unit in &units {
                    if self.cache.prewarm(unit) {
                        promoted += 1;
                    }
                }
                PipelineMetrics::add(&self.metrics.prewarmed, promoted);
                debug!(requested = units.len(), promoted, "Prewarm finished");
            }
            BackgroundTask::Persist => {
                if let Err(err) = self.persist() {
                    warn!(error = %err, "Failed to persist pipeline state");
                }
            }
            BackgroundTask::SaveRecords => {
                if let Err(err) = self.governor.save_records() {
                    warn!(error = %err, "Failed to persist governor records");
                }
            }
            BackgroundTask::WriteReport(report) => match report.write(&self.data_dir) {
                Ok(path) => error!(report = %path.display(), "Diagnostic report written"),
                Err(err) => error!(error = %err, "Failed to write diagnostic report"),
            },
            // Acknowledged by the worker loop.
            BackgroundTask::Flush(_) => {}
        }
    }

    fn persist(&self) -> Result<(), OptimizerError> {
        self.cache.persist()?;
        self.dependencies.save(&self.data_dir.join(DEPENDENCY_FILE))?;
        self.governor.save()?;
        self.accelerator.save(&self.data_dir.join(LOAD_ORDER_FILE))?;
        Ok(())
    }
}

/// Entry point for the host loader.
///
/// Field order matters: the worker threads hold clones of `shared` and are
/// joined when `pool`, `background` and `heap_monitor` drop.
pub struct PipelineContext {
    shared: Arc<Shared>,
    pool: TransformPool,
    background: BackgroundWorker,
    heap_monitor: Option<HeapMonitor>,
    startup: Startup,
    heal_report: HealReport,
}

impl PipelineContext {
    /// Open the data directory with the standard pass pipeline.
    pub fn open(config: PipelineConfig) -> Result<Self, OptimizerError> {
        Self::with_pipeline(config, PassPipeline::standard())
    }

    /// Open the data directory, self-heal L3, run the canaries and start the
    /// worker threads.
    pub fn with_pipeline(
        config: PipelineConfig,
        pipeline: PassPipeline,
    ) -> Result<Self, OptimizerError> {
        config.validate().map_err(ConfigError::Invalid)?;
        let data_dir = config.data_dir.clone();
        fs::create_dir_all(&data_dir).map_err(StorageError::from)?;

        let heap = Arc::new(HeapGauge::from_config(&config.heap));
        let (governor, startup) =
            StabilityGovernor::open(&data_dir, config.governor.clone(), Arc::clone(&heap))?;

        let (cache, heal_report) = TieredCache::open(
            &data_dir.join(CACHE_DIR),
            &config.cache,
            ProducerVersions::new(PRODUCER_VERSION, ANALYZER_VERSION),
        )?;

        let dependencies = DependencyTracker::load(&data_dir.join(DEPENDENCY_FILE))
            .unwrap_or_else(|err| {
                warn!(error = %err, "Discarding unreadable dependency graph");
                DependencyTracker::new()
            });
        let previous = LoadOrder::load(&data_dir.join(LOAD_ORDER_FILE)).unwrap_or_else(|err| {
            warn!(error = %err, "Discarding unreadable load order");
            LoadOrder::default()
        });
        let accelerator = StartupAccelerator::new(
            config.accelerator.max_recorded,
            config.accelerator.prewarm_limit,
            previous,
        );

        let transformer = Transformer::new(pipeline, IntegrityGate::new(config.limits.clone()));
        let shared = Arc::new(Shared {
            data_dir,
            transformer,
            cache,
            governor,
            dependencies,
            accelerator,
            metrics: PipelineMetrics::new(),
        });

        // Canaries run before any worker exists, so no real unit can reach
        // the pipeline ahead of them.
        let state = shared
            .governor
            .bootstrap(|| run_canaries(&shared.transformer))?;

        let pool = {
            let shared = Arc::clone(&shared);
            TransformPool::start(
                config.pool.workers,
                config.pool.queue_capacity,
                config.pool.watchdog(),
                move |job: &TransformJob| shared.run_job(job),
            )
            .map_err(OptimizerError::Spawn)?
        };
        let background = {
            let shared = Arc::clone(&shared);
            BackgroundWorker::start(move |task| shared.run_background(task))
                .map_err(OptimizerError::Spawn)?
        };
        let heap_monitor = if config.heap.enabled {
            let shared = Arc::clone(&shared);
            let monitor = HeapMonitor::start(
                config.heap.sample_interval(),
                Box::new(ProcStatm),
                heap,
                move |change| {
                    if change == PressureChange::Engaged {
                        shared.cache.flush_hot();
                    }
                },
            )
            .map_err(OptimizerError::Spawn)?;
            Some(monitor)
        } else {
            None
        };

        let context = Self {
            shared,
            pool,
            background,
            heap_monitor,
            startup,
            heal_report,
        };

        if config.accelerator.enabled && state.permits_optimization() {
            let candidates = context.shared.accelerator.prewarm_candidates();
            if !candidates.is_empty() {
                context.background.submit(BackgroundTask::Prewarm(candidates));
            }
        }

        info!(
            state = %context.state(),
            startup = ?context.startup,
            passes = context.shared.transformer.pipeline().len(),
            cached = context.shared.cache.cold().len(),
            "Optimization pipeline ready"
        );
        Ok(context)
    }

    /// Optimize one unit. Never panics; every failure path returns `raw`.
    pub fn transform(&self, unit_key: &str, raw: Bytes, loader: &LoaderContext) -> Bytes {
        PipelineMetrics::incr(&self.shared.metrics.transforms);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.transform_inner(unit_key, &raw, loader)
        }));
        let output = match result {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                PipelineMetrics::incr(&self.shared.metrics.passthroughs);
                raw
            }
            Err(payload) => {
                warn!(unit = %unit_key, panic = %panic_message(&payload), "Transform panicked");
                PipelineMetrics::incr(&self.shared.metrics.passthroughs);
                raw
            }
        };
        self.shared.governor.tick(Instant::now());
        output
    }

    fn transform_inner(&self, unit_key: &str, raw: &Bytes, loader: &LoaderContext) -> Option<Bytes> {
        let shared = &self.shared;
        if let Err(rejection) = self.admit(unit_key, raw) {
            PipelineMetrics::incr(&shared.metrics.rejections);
            debug!(unit = %unit_key, reason = %rejection, "Passthrough");
            return None;
        }

        let digest = UnitDigest::of(raw);
        shared.accelerator.record(unit_key);
        if let Some(hit) = shared.cache.lookup(unit_key, &digest) {
            let counter = match hit.tier {
                Tier::Hot => &shared.metrics.l1_hits,
                Tier::Warm => &shared.metrics.l2_hits,
                Tier::Cold => &shared.metrics.l3_hits,
            };
            PipelineMetrics::incr(counter);
            return Some(hit.bytes);
        }
        PipelineMetrics::incr(&shared.metrics.cache_misses);

        let outcome = match self.pool.run(unit_key, raw.clone(), loader.clone()) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.account_failure(unit_key, None, &err);
                return None;
            }
        };
        self.account_pass_failures(unit_key, &outcome.report);

        match outcome.output {
            Ok(optimized) => {
                shared
                    .dependencies
                    .set_dependencies(unit_key, outcome.report.dependencies.iter().cloned());
                shared.governor.record_unit_success(unit_key);
                self.save_records_later();
                shared
                    .cache
                    .store_hot(unit_key, &digest, optimized.bytes.clone());
                self.background.submit(BackgroundTask::Store {
                    unit_key: unit_key.to_string(),
                    source: digest.strong,
                    bytes: optimized.bytes.clone(),
                });
                if optimized.changed {
                    debug!(
                        unit = %unit_key,
                        before = raw.len(),
                        after = optimized.bytes.len(),
                        "Unit optimized"
                    );
                }
                Some(optimized.bytes)
            }
            Err(err) => {
                self.account_failure(unit_key, outcome.report.last_modifying_pass, &err);
                None
            }
        }
    }

    fn admit(&self, unit_key: &str, raw: &[u8]) -> Result<(), Rejection> {
        self.shared.transformer.gate().pre_validate(raw)?;
        self.shared.governor.admit(unit_key)
    }

    fn account_pass_failures(&self, unit_key: &str, report: &PipelineReport) {
        let governor = &self.shared.governor;
        if report.failures.is_empty() {
            return;
        }
        for (pass, err) in &report.failures {
            governor.record_pass_failure(pass, unit_key);
            if err.is_resource_exhaustion()
                && governor.record_cascade_failure(format!("{unit_key}: {pass}: {err}"))
            {
                self.emergency_shutdown(&format!("cascading failures, last in pass {pass}"));
            }
        }
        self.save_records_later();
    }

    fn account_failure(&self, unit_key: &str, last_pass: Option<&'static str>, err: &TransformError) {
        let shared = &self.shared;
        match err {
            TransformError::QueueFull => {
                PipelineMetrics::incr(&shared.metrics.queue_full);
                debug!(unit = %unit_key, "Transform queue full, passthrough");
                return;
            }
            TransformError::PoolClosed => return,
            err if err.is_input_error() => {
                PipelineMetrics::incr(&shared.metrics.rejections);
                debug!(unit = %unit_key, error = %err, "Passthrough");
                return;
            }
            _ => {}
        }

        let pass = match err {
            TransformError::Timeout { pass } => {
                PipelineMetrics::incr(&shared.metrics.watchdog_timeouts);
                *pass
            }
            TransformError::Cancelled { pass } => *pass,
            _ => last_pass,
        };
        warn!(unit = %unit_key, pass = ?pass, error = %err, "Transform failed, returning original bytes");

        shared.governor.record_unit_failure(unit_key);
        if let Some(pass) = pass {
            shared.governor.record_pass_failure(pass, unit_key);
        }
        if (err.is_verification_failure() || err.is_resource_exhaustion())
            && shared
                .governor
                .record_cascade_failure(format!("{unit_key}: {err}"))
        {
            self.emergency_shutdown(&format!("cascading failures, last: {err}"));
        }
        self.save_records_later();
    }

    fn save_records_later(&self) {
        if self.shared.governor.records_dirty() {
            self.background.submit(BackgroundTask::SaveRecords);
        }
    }

    /// Disable on the calling thread; the report and every cache tier are
    /// written by the background worker.
    fn emergency_shutdown(&self, reason: &str) {
        self.shared.cache.flush_hot();
        let mut threads = self.pool.worker_names();
        threads.extend(self.background.thread_name());
        let report = self.shared.governor.emergency_shutdown(
            reason,
            Some(self.shared.metrics.snapshot()),
            threads,
        );
        self.background
            .submit(BackgroundTask::WriteReport(Box::new(report)));
        self.background.submit(BackgroundTask::Persist);
    }

    /// Report that `changed` was redefined. Purges it and every unit that
    /// transitively relied on it; returns the purged dependents.
    pub fn invalidate_changed(&self, changed: &str) -> Vec<String> {
        // A queued store for a purged unit would otherwise land afterwards.
        self.background.flush();
        let shared = &self.shared;
        let dependents = shared.dependencies.dependents_transitive(changed);
        for unit in std::iter::once(changed).chain(dependents.iter().map(String::as_str)) {
            if shared.cache.invalidate(unit) {
                PipelineMetrics::incr(&shared.metrics.invalidations);
            }
            shared.dependencies.remove_unit(unit);
        }
        if !dependents.is_empty() {
            info!(unit = %changed, dependents = dependents.len(), "Invalidated dependents");
        }
        dependents.into_iter().collect()
    }

    /// Wait until every queued background task has run.
    pub fn flush(&self) -> bool {
        self.background.flush()
    }

    /// Drain background work and write every persisted structure.
    pub fn persist(&self) -> Result<(), OptimizerError> {
        self.background.flush();
        self.shared.persist()
    }

    /// Persist, release L1/L2 and stop the worker threads.
    pub fn shutdown(self) -> Result<(), OptimizerError> {
        let persisted = self.persist();
        self.shared.cache.flush_hot();
        info!(state = %self.state(), "Optimization pipeline stopped");
        persisted
    }

    /// Operator reset: leave DISABLED and run the canaries again.
    pub fn manual_reset(&self) -> Result<OptimizerState, OptimizerError> {
        self.shared.governor.manual_reset()?;
        Ok(self
            .shared
            .governor
            .bootstrap(|| run_canaries(&self.shared.transformer))?)
    }

    pub fn state(&self) -> OptimizerState {
        self.shared.governor.state()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn pass_invocations(&self, pass: &str) -> u64 {
        self.shared.metrics.pass_invocations(pass)
    }

    pub fn governor(&self) -> &StabilityGovernor {
        &self.shared.governor
    }

    pub fn cache(&self) -> &TieredCache {
        &self.shared.cache
    }

    pub fn dependencies(&self) -> &DependencyTracker {
        &self.shared.dependencies
    }

    pub fn startup(&self) -> Startup {
        self.startup
    }

    pub fn heal_report(&self) -> &HealReport {
        &self.heal_report
    }

    pub fn data_dir(&self) -> &Path {
        &self.shared.data_dir
    }

    pub fn heap_monitor_running(&self) -> bool {
        self.heap_monitor.is_some()
    }

    /// Zero the counters and drop L1/L2 so a test starts from a cold cache.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn reset_for_testing(&self) {
        self.background.flush();
        self.shared.metrics.reset();
        self.shared.cache.flush_hot();
    }
}

impl Drop for PipelineContext {
    fn drop(&mut self) {
        // Stores still queued must land before the index is written.
        self.background.flush();
        if let Err(err) = self.shared.persist() {
            warn!(error = %err, "Failed to persist pipeline state on drop");
        }
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("data_dir", &self.shared.data_dir)
            .field("state", &self.state())
            .field("pool", &self.pool)
            .field("startup", &self.startup)
            .finish()
    }
}
