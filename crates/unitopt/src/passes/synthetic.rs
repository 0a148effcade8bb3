//! Misbehaving passes for failure-path tests.

use super::{Pass, PassContext};
use crate::error::PassError;
use crate::unit::UnitIr;

/// Pads the constant pool until the encoded unit is many times its input.
/// Always reports a change, so the expansion guard has something to reject.
pub struct InflatingPass {
    pub entries: usize,
    /// Only units whose key starts with this are inflated.
    pub only_prefix: Option<&'static str>,
}

impl Default for InflatingPass {
    fn default() -> Self {
        Self {
            entries: 64,
            only_prefix: None,
        }
    }
}

impl InflatingPass {
    pub fn only(prefix: &'static str) -> Self {
        Self {
            only_prefix: Some(prefix),
            ..Self::default()
        }
    }
}

impl Pass for InflatingPass {
    fn name(&self) -> &'static str {
        "inflating"
    }

    fn run(&self, unit: &mut UnitIr, cx: &mut PassContext<'_>) -> Result<usize, PassError> {
        if let Some(prefix) = self.only_prefix
            && !cx.unit_key.starts_with(prefix)
        {
            return Ok(0);
        }
        let base = unit.pool.len();
        for n in 0..self.entries {
            let padding = format!("inflate-{:08}-{}", base + n, "x".repeat(48));
            if unit.intern(&padding).is_none() {
                break;
            }
        }
        Ok(unit.pool.len() - base)
    }
}

/// Panics on every unit.
pub struct PanickingPass;

impl Pass for PanickingPass {
    fn name(&self) -> &'static str {
        "panicking"
    }

    #[allow(clippy::panic)]
    fn run(&self, _unit: &mut UnitIr, _cx: &mut PassContext<'_>) -> Result<usize, PassError> {
        panic!("synthetic pass failure")
    }
}

/// Spins, charging its budget, until the job is cancelled.
pub struct SpinningPass;

impl Pass for SpinningPass {
    fn name(&self) -> &'static str {
        "spinning"
    }

    fn run(&self, _unit: &mut UnitIr, cx: &mut PassContext<'_>) -> Result<usize, PassError> {
        loop {
            cx.sandbox.check()?;
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }
}
