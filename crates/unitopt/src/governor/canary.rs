//! Known-answer units run through the full pipeline at bootstrap.
//!
//! A canary that fails means the pipeline itself is broken; the governor
//! goes straight to DISABLED before any real unit is touched.

use bytes::Bytes;
use tracing::{error, info};

use crate::analyzer;
use crate::metrics::PipelineMetrics;
use crate::sandbox::SandboxContext;
use crate::transform::Transformer;
use crate::unit::codec;
use crate::unit::{BinOp, Cond, Insn, UnitIr};

/// What a canary's optimized output must look like.
#[derive(Debug, Clone)]
enum Expect {
    Code(Vec<Insn>),
    /// Output bytes identical to the input.
    Unchanged,
    /// Output still contains a loop.
    HasLoop,
}

#[derive(Debug, Clone)]
pub struct Canary {
    pub name: &'static str,
    unit: UnitIr,
    expect: Expect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanaryFailure {
    pub canary: &'static str,
    pub reason: String,
}

impl std::fmt::Display for CanaryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "canary {} failed: {}", self.canary, self.reason)
    }
}

pub fn canaries() -> Vec<Canary> {
    let mut folding = UnitIr::new(0);
    folding.max_stack = 2;
    folding.code = vec![
        Insn::Const(2),
        Insn::Const(3),
        Insn::Binary(BinOp::Add),
        Insn::Return,
    ];

    let mut dead_code = UnitIr::new(0);
    dead_code.max_stack = 1;
    dead_code.code = vec![
        Insn::Const(1),
        Insn::Return,
        Insn::Const(2),
        Insn::Return,
    ];

    let mut passthrough = UnitIr::new(1);
    passthrough.max_stack = 1;
    passthrough.code = vec![Insn::Load(0), Insn::Return];

    // i = 0; do { i = i + 1 } while (i < 10)
    let mut counting_loop = UnitIr::new(1);
    counting_loop.max_stack = 2;
    counting_loop.code = vec![
        Insn::Const(0),
        Insn::Store(0),
        Insn::Load(0),
        Insn::Const(1),
        Insn::Binary(BinOp::Add),
        Insn::Dup,
        Insn::Store(0),
        Insn::Const(10),
        Insn::Branch {
            cond: Cond::Lt,
            target: 2,
        },
        Insn::ReturnVoid,
    ];

    vec![
        Canary {
            name: "constant_folding",
            unit: folding,
            expect: Expect::Code(vec![Insn::Const(5), Insn::Return]),
        },
        Canary {
            name: "dead_code",
            unit: dead_code,
            expect: Expect::Code(vec![Insn::Const(1), Insn::Return]),
        },
        Canary {
            name: "passthrough",
            unit: passthrough,
            expect: Expect::Unchanged,
        },
        Canary {
            name: "loop",
            unit: counting_loop,
            expect: Expect::HasLoop,
        },
    ]
}

impl Canary {
    fn run(&self, transformer: &Transformer) -> Result<(), String> {
        let input = codec::encode(&self.unit).map_err(|err| format!("encode: {err}"))?;
        let input = Bytes::from(input);
        // Canary work must not show up in the real counters.
        let metrics = PipelineMetrics::new();
        let mut sandbox = SandboxContext::new(transformer.sandbox_limits());
        sandbox.reset(self.name, transformer.sandbox_limits(), None);

        let outcome =
            transformer.optimize(self.name, &input, None, &|_| false, &metrics, &mut sandbox);
        if let Some((pass, err)) = outcome.report.failures.first() {
            return Err(format!("pass {pass} failed: {err}"));
        }
        let optimized = outcome.output.map_err(|err| err.to_string())?;
        let unit = transformer
            .gate()
            .double_verify(&input, &optimized.bytes, &mut sandbox)
            .map_err(|err| err.to_string())?;

        match &self.expect {
            Expect::Code(code) if unit.code != *code => {
                Err(format!("expected {code:?}, got {:?}", unit.code))
            }
            Expect::Unchanged if optimized.bytes != input => {
                Err("output differs from input".to_string())
            }
            Expect::HasLoop => {
                let analysis =
                    analyzer::analyze(&unit, &mut sandbox).map_err(|err| err.to_string())?;
                if analysis.loops.is_empty() {
                    Err("loop disappeared".to_string())
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }
}

/// Run every canary. Stops at the first failure.
pub fn run_canaries(transformer: &Transformer) -> Result<(), CanaryFailure> {
    for canary in canaries() {
        if let Err(reason) = canary.run(transformer) {
            error!(canary = canary.name, %reason, "Canary failed");
            return Err(CanaryFailure {
                canary: canary.name,
                reason,
            });
        }
    }
    info!("Canary suite passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use crate::integrity::IntegrityGate;
    use crate::passes::PassPipeline;

    #[test]
    fn standard_pipeline_passes_every_canary() {
        let transformer = Transformer::new(
            PassPipeline::standard(),
            IntegrityGate::new(LimitsConfig::default()),
        );
        run_canaries(&transformer).unwrap();
    }

    #[test]
    fn empty_pipeline_fails_folding_canary() {
        let transformer = Transformer::new(
            PassPipeline::with_passes(Vec::new()),
            IntegrityGate::new(LimitsConfig::default()),
        );
        let failure = run_canaries(&transformer).unwrap_err();
        assert_eq!(failure.canary, "constant_folding");
    }
}
