//! Folds concatenation of two string literals.
//!
//! `LDC_STR a; LDC_STR b; CONCAT` becomes `LDC_STR ab`, reusing a pool entry
//! when one already holds `ab`.

use super::constant_folding::replace_window;
use super::{block_window, Pass, PassContext};
use crate::error::PassError;
use crate::unit::{Insn, UnitIr};

pub struct StringConcat;

impl Pass for StringConcat {
    fn name(&self) -> &'static str {
        "string_concat"
    }

    fn run(&self, unit: &mut UnitIr, cx: &mut PassContext<'_>) -> Result<usize, PassError> {
        let analysis = cx.analyze(unit)?;
        let mut folded = 0usize;
        let mut i = 0usize;

        while i < unit.code.len() {
            cx.charge(1)?;
            let operands = match unit.code.get(i..i.saturating_add(3)) {
                Some([Insn::LdcStr(a), Insn::LdcStr(b), Insn::Concat]) => Some((*a, *b)),
                _ => None,
            };
            if let Some((a, b)) = operands
                && block_window(&analysis, i, 3)
            {
                let joined = match (unit.pool_str(a), unit.pool_str(b)) {
                    (Some(a), Some(b)) => format!("{a}{b}"),
                    _ => return Err(PassError::Internal("string pool index out of range".into())),
                };
                if let Some(index) = unit.intern(&joined) {
                    replace_window(unit, i, 3, Insn::LdcStr(index));
                    folded = folded.saturating_add(1);
                    i = i.saturating_add(2);
                    continue;
                }
            }
            i = i.saturating_add(1);
        }

        if folded > 0 {
            unit.remove_nops();
        }
        Ok(folded)
    }
}
