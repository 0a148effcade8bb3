//! One unit through decode, the pass pipeline, encode and verification.
//!
//! Shared by the worker pool and the bootstrap canaries. Pure CPU work;
//! touches no cache or governor state.

use bytes::Bytes;

use crate::config::LimitsConfig;
use crate::error::TransformError;
use crate::integrity::IntegrityGate;
use crate::loader::FactProvider;
use crate::metrics::PipelineMetrics;
use crate::passes::{PassContext, PassOptions, PassPipeline, PipelineReport};
use crate::sandbox::{SandboxContext, SandboxLimits};
use crate::unit::codec;

/// Output of a successful transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Optimized {
    pub bytes: Bytes,
    /// False when no pass changed the unit; `bytes` is then the input.
    pub changed: bool,
}

/// Pipeline report plus the result. The report is empty when the
/// pipeline never started.
#[derive(Debug, Clone)]
pub struct TransformOutcome {
    pub report: PipelineReport,
    pub output: Result<Optimized, TransformError>,
}

impl TransformOutcome {
    pub(crate) fn failed(error: TransformError) -> Self {
        Self {
            report: PipelineReport::default(),
            output: Err(error),
        }
    }
}

#[derive(Debug)]
pub struct Transformer {
    pipeline: PassPipeline,
    gate: IntegrityGate,
    options: PassOptions,
}

impl Transformer {
    pub fn new(pipeline: PassPipeline, gate: IntegrityGate) -> Self {
        let options = PassOptions {
            fold_division_by_zero: gate.limits().fold_division_by_zero,
        };
        Self {
            pipeline,
            gate,
            options,
        }
    }

    pub fn pipeline(&self) -> &PassPipeline {
        &self.pipeline
    }

    pub fn gate(&self) -> &IntegrityGate {
        &self.gate
    }

    pub fn sandbox_limits(&self) -> SandboxLimits {
        sandbox_limits(self.gate.limits())
    }

    /// Optimize `original`, which has already passed pre-validation.
    pub fn optimize(
        &self,
        unit_key: &str,
        original: &Bytes,
        facts: Option<&dyn FactProvider>,
        is_disabled: &dyn Fn(&str) -> bool,
        metrics: &PipelineMetrics,
        sandbox: &mut SandboxContext,
    ) -> TransformOutcome {
        PipelineMetrics::incr(&metrics.pipeline_runs);
        let analyses_before = sandbox.analyses;
        let outcome = self.optimize_inner(unit_key, original, facts, is_disabled, metrics, sandbox);
        PipelineMetrics::add(
            &metrics.analyzer_invocations,
            u64::from(sandbox.analyses.saturating_sub(analyses_before)),
        );
        outcome
    }

    fn optimize_inner(
        &self,
        unit_key: &str,
        original: &Bytes,
        facts: Option<&dyn FactProvider>,
        is_disabled: &dyn Fn(&str) -> bool,
        metrics: &PipelineMetrics,
        sandbox: &mut SandboxContext,
    ) -> TransformOutcome {
        let mut unit = match codec::decode(original) {
            Ok(unit) => unit,
            Err(err) => return TransformOutcome::failed(TransformError::Decode(err)),
        };

        let report = {
            let mut cx = PassContext::new(unit_key, sandbox, facts, self.options);
            match self.pipeline.run(&mut unit, &mut cx, is_disabled, metrics) {
                Ok(report) => report,
                Err(err) => return TransformOutcome::failed(TransformError::Malformed(err)),
            }
        };

        if report.cancelled {
            let pass = report.failures.last().map(|(pass, _)| *pass);
            return TransformOutcome {
                report,
                output: Err(TransformError::Cancelled { pass }),
            };
        }
        if !report.changed {
            return TransformOutcome {
                report,
                output: Ok(Optimized {
                    bytes: original.clone(),
                    changed: false,
                }),
            };
        }

        let output = codec::encode(&unit)
            .map_err(TransformError::Encode)
            .and_then(|encoded| {
                self.gate
                    .double_verify(original, &encoded, sandbox)
                    .map_err(TransformError::Verify)?;
                Ok(Optimized {
                    bytes: Bytes::from(encoded),
                    changed: true,
                })
            });
        if output.is_err() {
            PipelineMetrics::incr(&metrics.verification_failures);
        }
        TransformOutcome { report, output }
    }
}

pub fn sandbox_limits(limits: &LimitsConfig) -> SandboxLimits {
    SandboxLimits {
        max_pass_instructions: limits.max_pass_instructions,
        max_analysis_depth: limits.max_analysis_depth,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{BinOp, Insn, UnitIr};

    fn transformer() -> Transformer {
        Transformer::new(
            PassPipeline::standard(),
            IntegrityGate::new(LimitsConfig::default()),
        )
    }

    fn run(transformer: &Transformer, bytes: Vec<u8>, metrics: &PipelineMetrics) -> TransformOutcome {
        let mut sandbox = SandboxContext::default();
        sandbox.reset("t", transformer.sandbox_limits(), None);
        transformer.optimize("t", &Bytes::from(bytes), None, &|_| false, metrics, &mut sandbox)
    }

    #[test]
    fn folds_and_verifies() {
        let mut unit = UnitIr::new(0);
        unit.max_stack = 2;
        unit.code = vec![
            Insn::Const(2),
            Insn::Const(3),
            Insn::Binary(BinOp::Add),
            Insn::Return,
        ];
        let metrics = PipelineMetrics::new();
        let outcome = run(&transformer(), codec::encode(&unit).unwrap(), &metrics);
        let optimized = outcome.output.unwrap();
        assert!(optimized.changed);
        assert_eq!(
            codec::decode(&optimized.bytes).unwrap().code,
            vec![Insn::Const(5), Insn::Return]
        );
        assert_eq!(outcome.report.last_modifying_pass, Some("constant_folding"));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pipeline_runs, 1);
        assert!(snapshot.analyzer_invocations > 0);
    }

    #[test]
    fn unchanged_unit_returns_input_bytes() {
        let mut unit = UnitIr::new(1);
        unit.max_stack = 1;
        unit.code = vec![Insn::Load(0), Insn::Return];
        let bytes = codec::encode(&unit).unwrap();
        let outcome = run(&transformer(), bytes.clone(), &PipelineMetrics::new());
        let optimized = outcome.output.unwrap();
        assert!(!optimized.changed);
        assert_eq!(optimized.bytes.as_ref(), bytes.as_slice());
    }

    #[test]
    fn malformed_input_is_an_input_error() {
        let mut unit = UnitIr::new(0);
        unit.code = vec![Insn::Goto(9)];
        let outcome = run(&transformer(), codec::encode(&unit).unwrap(), &PipelineMetrics::new());
        let err = outcome.output.unwrap_err();
        assert!(err.is_input_error(), "{err}");

        let outcome = run(&transformer(), b"BUNT\x00\x01".to_vec(), &PipelineMetrics::new());
        assert!(matches!(outcome.output, Err(TransformError::Decode(_))));
    }
}
