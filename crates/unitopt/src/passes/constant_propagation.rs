//! Block-local constant propagation.
//!
//! After `CONST c; STORE s`, later `LOAD s` in the same block become
//! `CONST c` until `s` is stored again. Knowledge is dropped at every block
//! leader.

use rustc_hash::FxHashMap;

use super::{Pass, PassContext};
use crate::error::PassError;
use crate::unit::{Insn, UnitIr};

pub struct ConstantPropagation;

impl Pass for ConstantPropagation {
    fn name(&self) -> &'static str {
        "constant_propagation"
    }

    fn run(&self, unit: &mut UnitIr, cx: &mut PassContext<'_>) -> Result<usize, PassError> {
        let analysis = cx.analyze(unit)?;
        let mut known: FxHashMap<u16, i64> = FxHashMap::default();
        let mut previous_const: Option<i64> = None;
        let mut rewrites = 0usize;

        for (index, insn) in unit.code.iter_mut().enumerate() {
            cx.charge(1)?;
            if analysis.is_leader(index) {
                known.clear();
                previous_const = None;
            }
            match insn {
                Insn::Store(slot) => match previous_const {
                    Some(value) => {
                        known.insert(*slot, value);
                    }
                    None => {
                        known.remove(slot);
                    }
                },
                Insn::Load(slot) => {
                    if let Some(value) = known.get(slot).copied() {
                        *insn = Insn::Const(value);
                        rewrites = rewrites.saturating_add(1);
                    }
                }
                _ => {}
            }
            previous_const = match insn {
                Insn::Const(value) => Some(*value),
                _ => None,
            };
        }
        Ok(rewrites)
    }
}
