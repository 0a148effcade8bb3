//! Removes empty synchronized regions.
//!
//! `LOAD x; MONITOR_ENTER; LOAD x; MONITOR_EXIT` guards nothing and is
//! dropped when all four instructions sit in one block.

use super::{block_window, Pass, PassContext};
use crate::error::PassError;
use crate::unit::{Insn, UnitIr};

pub struct LockElision;

impl Pass for LockElision {
    fn name(&self) -> &'static str {
        "lock_elision"
    }

    fn run(&self, unit: &mut UnitIr, cx: &mut PassContext<'_>) -> Result<usize, PassError> {
        let analysis = cx.analyze(unit)?;
        let mut elided = 0usize;

        for i in 0..unit.code.len() {
            cx.charge(1)?;
            let matched = matches!(
                unit.code.get(i..i.saturating_add(4)),
                Some([Insn::Load(a), Insn::MonitorEnter, Insn::Load(b), Insn::MonitorExit]) if a == b
            );
            if matched && block_window(&analysis, i, 4) {
                for slot in unit.code.iter_mut().skip(i).take(4) {
                    *slot = Insn::Nop;
                }
                elided = elided.saturating_add(1);
            }
        }

        if elided > 0 {
            unit.remove_nops();
        }
        Ok(elided)
    }
}
