//! Drops exception handlers that can never fire.

use super::{Pass, PassContext};
use crate::analyzer::to_index;
use crate::error::PassError;
use crate::unit::UnitIr;

pub struct ExceptionPruning;

impl Pass for ExceptionPruning {
    fn name(&self) -> &'static str {
        "exception_pruning"
    }

    fn run(&self, unit: &mut UnitIr, cx: &mut PassContext<'_>) -> Result<usize, PassError> {
        let before = unit.handlers.len();
        let mut kept = Vec::with_capacity(before);
        for handler in &unit.handlers {
            let start = to_index(handler.start);
            let end = to_index(handler.end).min(unit.code.len());
            cx.charge(end.saturating_sub(start))?;
            let can_throw = unit
                .code
                .get(start..end)
                .is_some_and(|range| range.iter().any(|insn| insn.can_throw()));
            if start < end && can_throw {
                kept.push(*handler);
            }
        }
        unit.handlers = kept;
        Ok(before.saturating_sub(unit.handlers.len()))
    }
}
