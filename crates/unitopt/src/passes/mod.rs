//! Optimization passes and the pipeline that isolates them.
//!
//! Every pass implements [`Pass`]. The pipeline runs them strictly in order
//! on one unit, snapshots the unit before each pass, catches errors and
//! panics, and restores the snapshot whenever a pass fails or leaves the
//! unit in a shape the analyzer rejects. A failing pass never stops the
//! passes after it.
//!
//! Peephole passes rewrite a matched window in place: the window is filled
//! with NOPs and the result goes in its last slot, then the pass compacts
//! the NOPs away. Windows never straddle a block leader, so the only branch
//! target a window can contain is its first slot, which compaction
//! redirects to the result.

use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, warn};

use crate::analyzer::{self, Analysis};
use crate::error::{AnalysisError, PassError};
use crate::loader::FactProvider;
use crate::metrics::PipelineMetrics;
use crate::sandbox::SandboxContext;
use crate::unit::UnitIr;

pub mod arithmetic;
pub mod block_layout;
pub mod branch;
pub mod constant_folding;
pub mod constant_propagation;
pub mod dead_code;
pub mod devirtualize;
pub mod exception_pruning;
pub mod field_access;
pub mod inlining;
pub mod lock_elision;
pub mod loop_hoisting;
pub mod string_concat;
#[cfg(any(test, feature = "test-utils"))]
pub mod synthetic;

pub use arithmetic::ArithmeticSimplification;
pub use block_layout::BlockLayout;
pub use branch::BranchSimplification;
pub use constant_folding::ConstantFolding;
pub use constant_propagation::ConstantPropagation;
pub use dead_code::DeadCodeElimination;
pub use devirtualize::Devirtualization;
pub use exception_pruning::ExceptionPruning;
pub use field_access::FieldAccess;
pub use inlining::Inlining;
pub use lock_elision::LockElision;
pub use loop_hoisting::LoopInvariantHoisting;
pub use string_concat::StringConcat;

/// Bumped whenever a pass changes what it emits; cached entries built by
/// another pass-set version are discarded at startup.
pub const PASS_SET_VERSION: u32 = 1;

/// A single isolated transformation step.
pub trait Pass: Send + Sync {
    /// Stable name used in logs, metrics and failure records.
    fn name(&self) -> &'static str;

    /// Rewrite `unit` in place. Returns the number of rewrites applied.
    fn run(&self, unit: &mut UnitIr, cx: &mut PassContext<'_>) -> Result<usize, PassError>;
}

/// Options that change what passes are allowed to do.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassOptions {
    /// Fold integer division and remainder by zero to `0`.
    pub fold_division_by_zero: bool,
}

/// Everything a pass may read or charge while it runs.
pub struct PassContext<'a> {
    pub unit_key: &'a str,
    pub sandbox: &'a mut SandboxContext,
    pub facts: Option<&'a dyn FactProvider>,
    pub options: PassOptions,
    dependencies: Vec<String>,
}

impl<'a> PassContext<'a> {
    pub fn new(
        unit_key: &'a str,
        sandbox: &'a mut SandboxContext,
        facts: Option<&'a dyn FactProvider>,
        options: PassOptions,
    ) -> Self {
        Self {
            unit_key,
            sandbox,
            facts,
            options,
            dependencies: Vec::new(),
        }
    }

    /// Analyze the unit in its current shape.
    pub fn analyze(&mut self, unit: &UnitIr) -> Result<Analysis, PassError> {
        Ok(analyzer::analyze(unit, self.sandbox)?)
    }

    /// Charge visited instructions against the current pass budget.
    pub fn charge(&mut self, count: usize) -> Result<(), PassError> {
        self.sandbox.charge(count)
    }

    /// Record that this unit's output relies on a fact about `unit_key`.
    pub fn record_dependency(&mut self, unit_key: &str) {
        if unit_key != self.unit_key {
            self.dependencies.push(unit_key.to_string());
        }
    }
}

/// Outcome of one pipeline run over one unit.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub changed: bool,
    /// `(pass, rewrites)` for every pass that ran successfully.
    pub rewrites: Vec<(&'static str, usize)>,
    /// `(pass, error)` for every pass that failed and was rolled back.
    pub failures: Vec<(&'static str, PassError)>,
    /// Units whose facts this unit's output relies on.
    pub dependencies: BTreeSet<String>,
    /// Last pass that changed the unit.
    pub last_modifying_pass: Option<&'static str>,
    /// Passes skipped because they are disabled.
    pub skipped: Vec<&'static str>,
    /// Set when the run stopped early because the job was cancelled.
    pub cancelled: bool,
}

impl PipelineReport {
    pub fn rewrites_for(&self, pass: &str) -> usize {
        self.rewrites
            .iter()
            .filter(|(name, _)| *name == pass)
            .map(|(_, n)| *n)
            .sum()
    }
}

/// Fixed, ordered list of passes.
pub struct PassPipeline {
    passes: Vec<Box<dyn Pass>>,
}

impl std::fmt::Debug for PassPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl Default for PassPipeline {
    fn default() -> Self {
        Self::standard()
    }
}

impl PassPipeline {
    /// The production pass order: shrink first, then the expensive
    /// passes, then layout.
    pub fn standard() -> Self {
        Self::with_passes(vec![
            Box::new(DeadCodeElimination),
            Box::new(ConstantFolding),
            Box::new(ConstantPropagation),
            Box::new(ArithmeticSimplification),
            Box::new(BranchSimplification),
            Box::new(Inlining),
            Box::new(LoopInvariantHoisting),
            Box::new(Devirtualization),
            Box::new(LockElision),
            Box::new(StringConcat),
            Box::new(FieldAccess),
            Box::new(ExceptionPruning),
            Box::new(BlockLayout),
        ])
    }

    /// A custom pass list, run in the given order.
    pub fn with_passes(passes: Vec<Box<dyn Pass>>) -> Self {
        Self { passes }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Run every enabled pass over `unit`.
    ///
    /// Fails only if `unit` is malformed before any pass runs, or (which a
    /// correct rollback makes impossible) after the last one. On success
    /// `unit.max_stack` reflects the final analysis.
    pub fn run(
        &self,
        unit: &mut UnitIr,
        cx: &mut PassContext<'_>,
        is_disabled: &dyn Fn(&str) -> bool,
        metrics: &PipelineMetrics,
    ) -> Result<PipelineReport, AnalysisError> {
        let mut report = PipelineReport::default();
        analyzer::analyze(unit, cx.sandbox)?;

        for pass in &self.passes {
            let name = pass.name();
            if is_disabled(name) {
                report.skipped.push(name);
                continue;
            }
            if cx.sandbox.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let snapshot = unit.clone();
            let deps_before = cx.dependencies.len();
            cx.sandbox.begin_pass(name);
            metrics.record_pass(name);

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| pass.run(unit, cx)))
                .unwrap_or_else(|payload| Err(PassError::Panicked(panic_message(&payload))))
                .and_then(|rewrites| {
                    if *unit != snapshot {
                        analyzer::analyze(unit, cx.sandbox)?;
                    }
                    Ok(rewrites)
                });
            cx.sandbox.end_pass();

            match outcome {
                Ok(rewrites) => {
                    if *unit != snapshot {
                        report.changed = true;
                        report.last_modifying_pass = Some(name);
                    }
                    report.rewrites.push((name, rewrites));
                }
                Err(err) => {
                    *unit = snapshot;
                    cx.dependencies.truncate(deps_before);
                    warn!(unit = %cx.unit_key, pass = name, error = %err, "Pass failed, unit restored");
                    PipelineMetrics::incr(&metrics.pass_failures);
                    let cancelled = err == PassError::Cancelled;
                    report.failures.push((name, err));
                    if cancelled {
                        report.cancelled = true;
                        break;
                    }
                }
            }
        }

        let analysis = analyzer::analyze(unit, cx.sandbox)?;
        unit.max_stack = u16::try_from(analysis.max_stack).unwrap_or(u16::MAX);
        report.dependencies = cx.dependencies.drain(..).collect();
        debug!(
            unit = %cx.unit_key,
            changed = report.changed,
            failures = report.failures.len(),
            "Pipeline finished"
        );
        Ok(report)
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Window `start..start + len` if it lies inside one basic block.
pub(crate) fn block_window(analysis: &Analysis, start: usize, len: usize) -> bool {
    len > 0 && analysis.same_block(start, start.saturating_add(len).saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{BinOp, Insn};

    fn sandbox() -> SandboxContext {
        let mut sandbox = SandboxContext::default();
        sandbox.reset("unit", Default::default(), None);
        sandbox
    }

    fn add_unit() -> UnitIr {
        let mut unit = UnitIr::new(0);
        unit.code = vec![
            Insn::Const(2),
            Insn::Const(3),
            Insn::Binary(BinOp::Add),
            Insn::Return,
        ];
        unit
    }

    struct Panicking;
    impl Pass for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }
        fn run(&self, unit: &mut UnitIr, _cx: &mut PassContext<'_>) -> Result<usize, PassError> {
            unit.code.clear();
            panic!("boom");
        }
    }

    struct Breaking;
    impl Pass for Breaking {
        fn name(&self) -> &'static str {
            "breaking"
        }
        fn run(&self, unit: &mut UnitIr, cx: &mut PassContext<'_>) -> Result<usize, PassError> {
            cx.record_dependency("Other");
            unit.code.insert(0, Insn::Pop);
            Ok(1)
        }
    }

    struct Hungry;
    impl Pass for Hungry {
        fn name(&self) -> &'static str {
            "hungry"
        }
        fn run(&self, _unit: &mut UnitIr, cx: &mut PassContext<'_>) -> Result<usize, PassError> {
            loop {
                cx.charge(1000)?;
            }
        }
    }

    #[test]
    fn standard_order_is_fixed() {
        let names = PassPipeline::standard().names();
        assert_eq!(names.first(), Some(&"dead_code"));
        assert_eq!(names.get(1), Some(&"constant_folding"));
        assert_eq!(names.last(), Some(&"block_layout"));
        assert_eq!(names.len(), 13);
    }

    #[test]
    fn failing_passes_are_isolated_and_rolled_back() {
        let pipeline = PassPipeline::with_passes(vec![
            Box::new(Panicking),
            Box::new(Breaking),
            Box::new(Hungry),
            Box::new(ConstantFolding),
            Box::new(BlockLayout),
        ]);
        let metrics = PipelineMetrics::new();
        let mut sb = sandbox();
        let mut cx = PassContext::new("unit", &mut sb, None, PassOptions::default());
        let mut unit = add_unit();

        let report = pipeline.run(&mut unit, &mut cx, &|_| false, &metrics).unwrap();

        assert_eq!(unit.code, vec![Insn::Const(5), Insn::Return]);
        assert_eq!(unit.max_stack, 1);
        let failed: Vec<_> = report.failures.iter().map(|(n, _)| *n).collect();
        assert_eq!(failed, vec!["panicking", "breaking", "hungry"]);
        assert!(matches!(report.failures[0].1, PassError::Panicked(ref m) if m == "boom"));
        assert!(matches!(report.failures[1].1, PassError::Analysis(_)));
        assert!(matches!(report.failures[2].1, PassError::BudgetExceeded { pass: "hungry", .. }));
        assert!(report.dependencies.is_empty(), "failed pass dependencies are discarded");
        assert_eq!(report.last_modifying_pass, Some("constant_folding"));
        assert_eq!(metrics.pass_invocations("constant_folding"), 1);
        assert_eq!(metrics.snapshot().pass_failures, 3);
    }

    #[test]
    fn disabled_passes_are_skipped() {
        let pipeline = PassPipeline::standard();
        let metrics = PipelineMetrics::new();
        let mut sb = sandbox();
        let mut cx = PassContext::new("unit", &mut sb, None, PassOptions::default());
        let mut unit = add_unit();

        let report = pipeline
            .run(&mut unit, &mut cx, &|name| name == "constant_folding", &metrics)
            .unwrap();

        assert_eq!(report.skipped, vec!["constant_folding"]);
        assert_eq!(metrics.pass_invocations("constant_folding"), 0);
        assert_eq!(unit.code.len(), 4);
    }

    #[test]
    fn malformed_input_is_rejected_before_passes() {
        let pipeline = PassPipeline::standard();
        let metrics = PipelineMetrics::new();
        let mut sb = sandbox();
        let mut cx = PassContext::new("unit", &mut sb, None, PassOptions::default());
        let mut unit = UnitIr::new(0);
        unit.code = vec![Insn::Goto(9)];

        assert!(pipeline.run(&mut unit, &mut cx, &|_| false, &metrics).is_err());
        assert_eq!(metrics.snapshot().pass_invocations, Vec::new());
    }
}
