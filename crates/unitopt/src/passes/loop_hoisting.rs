//! Loop-invariant hoisting.
//!
//! A loop whose header starts with `CONST c; STORE s`, where `s` is stored
//! nowhere else, has its back-edges retargeted past that prefix so the
//! store runs once on entry. The loop body must only be enterable through
//! its header; otherwise the loop is left alone.

use super::{Pass, PassContext};
use crate::analyzer::{to_index, LoopRegion};
use crate::error::PassError;
use crate::unit::{Insn, UnitIr};

pub struct LoopInvariantHoisting;

impl Pass for LoopInvariantHoisting {
    fn name(&self) -> &'static str {
        "loop_invariant_hoisting"
    }

    fn run(&self, unit: &mut UnitIr, cx: &mut PassContext<'_>) -> Result<usize, PassError> {
        let analysis = cx.analyze(unit)?;
        let mut rewrites = 0usize;

        for region in &analysis.loops {
            cx.charge(region.latch.saturating_sub(region.header).saturating_add(1))?;
            let header = region.header;
            let Some([Insn::Const(_), Insn::Store(slot)]) =
                unit.code.get(header..header.saturating_add(2))
            else {
                continue;
            };
            let slot = *slot;
            let body_start = header.saturating_add(2);
            if body_start > region.latch || analysis.is_leader(header.saturating_add(1)) {
                continue;
            }
            let stores = unit
                .code
                .iter()
                .filter(|insn| **insn == Insn::Store(slot))
                .count();
            if stores != 1 || !single_entry(unit, region) {
                continue;
            }

            let new_target = u32::try_from(body_start).unwrap_or(u32::MAX);
            for index in header..=region.latch {
                if let Some(insn) = unit.code.get_mut(index) {
                    insn.for_each_target_mut(|target| {
                        if to_index(*target) == header {
                            *target = new_target;
                            rewrites = rewrites.saturating_add(1);
                        }
                    });
                }
            }
        }
        Ok(rewrites)
    }
}

/// No jump or handler from outside `region` lands inside it past the header.
fn single_entry(unit: &UnitIr, region: &LoopRegion) -> bool {
    let inside_past_header =
        |target: u32| to_index(target) > region.header && to_index(target) <= region.latch;
    let jumps_ok = unit
        .code
        .iter()
        .enumerate()
        .filter(|(index, _)| !region.contains(*index))
        .all(|(_, insn)| !insn.targets().into_iter().any(inside_past_header));
    let handlers_ok = unit.handlers.iter().all(|h| !inside_past_header(h.target));
    jumps_ok && handlers_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::PassOptions;
    use crate::sandbox::SandboxContext;
    use crate::unit::{BinOp, Cond};

    fn run(unit: &mut UnitIr) -> usize {
        let mut sandbox = SandboxContext::default();
        sandbox.reset("t", Default::default(), None);
        let mut cx = PassContext::new("t", &mut sandbox, None, PassOptions::default());
        LoopInvariantHoisting.run(unit, &mut cx).unwrap()
    }

    /// counter in slot 0, step in slot 1 (set at the top of every iteration).
    fn counting_loop() -> UnitIr {
        let mut unit = UnitIr::new(2);
        unit.code = vec![
            Insn::Const(10),
            Insn::Store(0),
            Insn::Const(1), // 2: loop header
            Insn::Store(1),
            Insn::Load(0),
            Insn::Branch { cond: Cond::Zero, target: 11 },
            Insn::Load(0),
            Insn::Load(1),
            Insn::Binary(BinOp::Sub),
            Insn::Store(0),
            Insn::Goto(2), // 10: back-edge
            Insn::ReturnVoid,
        ];
        unit
    }

    #[test]
    fn invariant_store_is_hoisted_out_of_loop() {
        let mut unit = counting_loop();
        assert_eq!(run(&mut unit), 1);
        assert_eq!(unit.code[10], Insn::Goto(4));
    }

    #[test]
    fn slot_stored_in_body_is_not_hoisted() {
        let mut unit = counting_loop();
        unit.code[9] = Insn::Store(1);
        assert_eq!(run(&mut unit), 0);
        assert_eq!(unit.code[10], Insn::Goto(2));
    }

    #[test]
    fn side_entry_blocks_hoisting() {
        let mut unit = counting_loop();
        // Enter the body directly, skipping the header.
        unit.code[0] = Insn::Goto(4);
        unit.code[1] = Insn::Nop;
        assert_eq!(run(&mut unit), 0);
    }
}
