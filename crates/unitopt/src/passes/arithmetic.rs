//! Arithmetic identities and strength reduction.

use super::constant_folding::replace_window;
use super::{block_window, Pass, PassContext};
use crate::error::PassError;
use crate::unit::{BinOp, Insn, UnitIr};

pub struct ArithmeticSimplification;

/// `x op k` is `x` for this right operand.
fn is_identity(op: BinOp, k: i64) -> bool {
    match op {
        BinOp::Add | BinOp::Sub | BinOp::Or | BinOp::Xor => k == 0,
        BinOp::Shl | BinOp::Shr => k & 0x3f == 0,
        BinOp::Mul | BinOp::Div => k == 1,
        BinOp::And => k == -1,
        BinOp::Rem => false,
    }
}

impl Pass for ArithmeticSimplification {
    fn name(&self) -> &'static str {
        "arithmetic_simplification"
    }

    fn run(&self, unit: &mut UnitIr, cx: &mut PassContext<'_>) -> Result<usize, PassError> {
        let analysis = cx.analyze(unit)?;
        let mut rewrites = 0usize;
        let mut identities = false;

        for i in 0..unit.code.len() {
            cx.charge(1)?;
            let Some([Insn::Const(k), Insn::Binary(op)]) = unit.code.get(i..i.saturating_add(2))
            else {
                continue;
            };
            if !block_window(&analysis, i, 2) {
                continue;
            }
            let (k, op) = (*k, *op);
            if is_identity(op, k) {
                replace_window(unit, i, 2, Insn::Nop);
                identities = true;
                rewrites = rewrites.saturating_add(1);
            } else if op == BinOp::Mul && k > 1 && k.count_ones() == 1 {
                let shift = i64::from(k.trailing_zeros());
                if let Some(slot) = unit.code.get_mut(i) {
                    *slot = Insn::Const(shift);
                }
                if let Some(slot) = unit.code.get_mut(i.saturating_add(1)) {
                    *slot = Insn::Binary(BinOp::Shl);
                }
                rewrites = rewrites.saturating_add(1);
            }
        }

        if identities {
            unit.remove_nops();
        }
        Ok(rewrites)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::PassOptions;
    use crate::sandbox::SandboxContext;

    fn run(unit: &mut UnitIr) -> usize {
        let mut sandbox = SandboxContext::default();
        sandbox.reset("t", Default::default(), None);
        let mut cx = PassContext::new("t", &mut sandbox, None, PassOptions::default());
        ArithmeticSimplification.run(unit, &mut cx).unwrap()
    }

    fn with_op(k: i64, op: BinOp) -> UnitIr {
        let mut unit = UnitIr::new(1);
        unit.code = vec![Insn::Load(0), Insn::Const(k), Insn::Binary(op), Insn::Return];
        unit
    }

    #[test]
    fn identities_are_removed() {
        for (k, op) in [
            (0, BinOp::Add),
            (0, BinOp::Sub),
            (1, BinOp::Mul),
            (1, BinOp::Div),
            (0, BinOp::Or),
            (0, BinOp::Xor),
            (64, BinOp::Shl),
            (0, BinOp::Shr),
            (-1, BinOp::And),
        ] {
            let mut unit = with_op(k, op);
            assert_eq!(run(&mut unit), 1, "{op:?} {k}");
            assert_eq!(unit.code, vec![Insn::Load(0), Insn::Return], "{op:?} {k}");
        }
    }

    #[test]
    fn non_identities_are_kept() {
        for (k, op) in [(1, BinOp::Add), (0, BinOp::Mul), (1, BinOp::Rem), (2, BinOp::Div)] {
            let mut unit = with_op(k, op);
            assert_eq!(run(&mut unit), 0, "{op:?} {k}");
            assert_eq!(unit.code.len(), 4);
        }
    }

    #[test]
    fn multiply_by_power_of_two_becomes_shift() {
        let mut unit = with_op(8, BinOp::Mul);
        assert_eq!(run(&mut unit), 1);
        assert_eq!(
            unit.code,
            vec![
                Insn::Load(0),
                Insn::Const(3),
                Insn::Binary(BinOp::Shl),
                Insn::Return
            ]
        );
        let mut unit = with_op(6, BinOp::Mul);
        assert_eq!(run(&mut unit), 0);
    }
}
