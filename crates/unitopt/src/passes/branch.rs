//! Branch simplification.
//!
//! Resolves conditions on constants, threads jumps through GOTO chains and
//! drops jumps to the next instruction.

use super::constant_folding::replace_window;
use super::{block_window, Pass, PassContext};
use crate::analyzer::to_index;
use crate::error::PassError;
use crate::unit::{Cond, Insn, UnitIr};

pub struct BranchSimplification;

impl Pass for BranchSimplification {
    fn name(&self) -> &'static str {
        "branch_simplification"
    }

    fn run(&self, unit: &mut UnitIr, cx: &mut PassContext<'_>) -> Result<usize, PassError> {
        let analysis = cx.analyze(unit)?;
        let mut rewrites = resolve_constant_conditions(unit, cx, &analysis)?;
        rewrites = rewrites.saturating_add(thread_jumps(unit, cx)?);
        rewrites = rewrites.saturating_add(drop_jumps_to_next(unit, cx)?);

        if unit.code.contains(&Insn::Nop) {
            unit.remove_nops();
        }
        Ok(rewrites)
    }
}

fn resolve_constant_conditions(
    unit: &mut UnitIr,
    cx: &mut PassContext<'_>,
    analysis: &crate::analyzer::Analysis,
) -> Result<usize, PassError> {
    let mut rewrites = 0usize;
    for i in 0..unit.code.len() {
        cx.charge(1)?;
        let window = unit.code.get(i..).unwrap_or_default();
        let (len, taken, target) = match window {
            [Insn::Const(v), Insn::Branch { cond, target }, ..] if cond.arity() == 1 => {
                match cond.eval_unary(*v) {
                    Some(taken) => (2, taken, *target),
                    None => continue,
                }
            }
            [
                Insn::Const(a),
                Insn::Const(b),
                Insn::Branch { cond, target },
                ..,
            ] if cond.arity() == 2 => {
                let taken = match cond {
                    Cond::Eq => a == b,
                    Cond::Lt => a < b,
                    Cond::Zero | Cond::NonZero => continue,
                };
                (3, taken, *target)
            }
            _ => continue,
        };
        if !block_window(analysis, i, len) {
            continue;
        }
        let result = if taken { Insn::Goto(target) } else { Insn::Nop };
        replace_window(unit, i, len, result);
        rewrites = rewrites.saturating_add(1);
    }
    Ok(rewrites)
}

/// Point every jump at the end of the GOTO chain it lands on.
fn thread_jumps(unit: &mut UnitIr, cx: &mut PassContext<'_>) -> Result<usize, PassError> {
    let goto_target: Vec<Option<u32>> = unit
        .code
        .iter()
        .map(|insn| match insn {
            Insn::Goto(t) => Some(*t),
            _ => None,
        })
        .collect();
    let max_hops = unit.code.len();
    let mut rewrites = 0usize;

    for insn in unit.code.iter_mut() {
        cx.charge(1)?;
        insn.for_each_target_mut(|target| {
            let mut current = *target;
            let mut hops = 0usize;
            while let Some(Some(next)) = goto_target.get(to_index(current)) {
                if *next == current || hops >= max_hops {
                    break;
                }
                current = *next;
                hops = hops.saturating_add(1);
            }
            if current != *target {
                *target = current;
                rewrites = rewrites.saturating_add(1);
            }
        });
    }
    Ok(rewrites)
}

fn drop_jumps_to_next(unit: &mut UnitIr, cx: &mut PassContext<'_>) -> Result<usize, PassError> {
    let mut rewrites = 0usize;
    for (index, insn) in unit.code.iter_mut().enumerate() {
        cx.charge(1)?;
        let next = index.saturating_add(1);
        match insn {
            Insn::Goto(target) if to_index(*target) == next => {
                *insn = Insn::Nop;
                rewrites = rewrites.saturating_add(1);
            }
            Insn::Branch { cond, target } if to_index(*target) == next && cond.arity() == 1 => {
                *insn = Insn::Pop;
                rewrites = rewrites.saturating_add(1);
            }
            _ => {}
        }
    }
    Ok(rewrites)
}
