//! Dead-code elimination.
//!
//! Removes instructions unreachable from the entry and turns stores to slots
//! that are never loaded into plain POPs.

use super::{Pass, PassContext};
use crate::error::PassError;
use crate::unit::{Insn, UnitIr};

pub struct DeadCodeElimination;

impl Pass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dead_code"
    }

    fn run(&self, unit: &mut UnitIr, cx: &mut PassContext<'_>) -> Result<usize, PassError> {
        let analysis = cx.analyze(unit)?;
        cx.charge(unit.code.len())?;

        let dead_slots = analysis.dead_store_slots();
        let mut rewrites = 0usize;
        if !dead_slots.is_empty() {
            for insn in unit.code.iter_mut() {
                if let Insn::Store(slot) = insn
                    && dead_slots.contains(slot)
                {
                    *insn = Insn::Pop;
                    rewrites = rewrites.saturating_add(1);
                }
            }
        }

        let removed = unit.compact(&analysis.reachable);
        let shrunk = shrink_locals(unit);
        Ok(rewrites.saturating_add(removed).saturating_add(shrunk))
    }
}

/// Lower `max_locals` to one past the highest slot still referenced.
/// Returns 1 if it changed.
fn shrink_locals(unit: &mut UnitIr) -> usize {
    let needed = unit
        .code
        .iter()
        .filter_map(Insn::slot)
        .max()
        .map_or(0, |slot| slot.saturating_add(1));
    if needed < unit.max_locals {
        unit.max_locals = needed;
        1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::PassOptions;
    use crate::sandbox::SandboxContext;
    use crate::unit::{Cond, Handler};

    fn run(unit: &mut UnitIr) -> usize {
        let mut sandbox = SandboxContext::default();
        sandbox.reset("t", Default::default(), None);
        let mut cx = PassContext::new("t", &mut sandbox, None, PassOptions::default());
        DeadCodeElimination.run(unit, &mut cx).unwrap()
    }

    #[test]
    fn removes_code_after_return() {
        let mut unit = UnitIr::new(0);
        unit.code = vec![
            Insn::Const(1),
            Insn::Return,
            Insn::Const(9),
            Insn::Return,
        ];
        assert_eq!(run(&mut unit), 2);
        assert_eq!(unit.code, vec![Insn::Const(1), Insn::Return]);
    }

    #[test]
    fn never_loaded_store_becomes_pop() {
        let mut unit = UnitIr::new(2);
        unit.code = vec![
            Insn::Const(1),
            Insn::Store(0),
            Insn::Const(2),
            Insn::Store(1),
            Insn::Load(1),
            Insn::Return,
        ];
        assert_eq!(run(&mut unit), 1);
        assert_eq!(unit.code[1], Insn::Pop);
        assert_eq!(unit.code[3], Insn::Store(1));
        assert_eq!(unit.max_locals, 2, "slot 1 is still in use");
    }

    #[test]
    fn unused_trailing_slots_are_released() {
        let mut unit = UnitIr::new(3);
        unit.code = vec![
            Insn::Const(1),
            Insn::Store(0),
            Insn::Load(0),
            Insn::Const(2),
            Insn::Store(2),
            Insn::Return,
        ];
        // Store(2) becomes POP, leaving slot 0 as the only one in use.
        assert_eq!(run(&mut unit), 2);
        assert_eq!(unit.code[4], Insn::Pop);
        assert_eq!(unit.max_locals, 1);

        let mut stateless = UnitIr::new(4);
        stateless.code = vec![Insn::Const(1), Insn::Return];
        assert_eq!(run(&mut stateless), 1);
        assert_eq!(stateless.max_locals, 0);
        assert_eq!(run(&mut stateless), 0, "nothing left to release");
    }

    #[test]
    fn skipped_block_is_removed_and_targets_remapped() {
        let mut unit = UnitIr::new(0);
        unit.code = vec![
            Insn::Goto(3),
            Insn::Const(7), // unreachable
            Insn::Pop,      // unreachable
            Insn::Const(0),
            Insn::Branch { cond: Cond::Zero, target: 6 },
            Insn::ReturnVoid,
            Insn::ReturnVoid,
        ];
        run(&mut unit);
        assert_eq!(
            unit.code,
            vec![
                Insn::Goto(1),
                Insn::Const(0),
                Insn::Branch { cond: Cond::Zero, target: 4 },
                Insn::ReturnVoid,
                Insn::ReturnVoid,
            ]
        );
    }

    #[test]
    fn handler_over_dead_code_is_dropped() {
        let mut unit = UnitIr::new(0);
        unit.code = vec![
            Insn::ReturnVoid,
            Insn::Const(1), // dead, covered
            Insn::Throw,    // dead, covered
            Insn::Pop,      // handler target, only reachable from dead code
            Insn::ReturnVoid,
        ];
        unit.handlers = vec![Handler { start: 1, end: 3, target: 3 }];
        run(&mut unit);
        assert_eq!(unit.code, vec![Insn::ReturnVoid]);
        assert!(unit.handlers.is_empty());
    }
}
