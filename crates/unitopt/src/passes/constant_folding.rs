//! Constant folding.
//!
//! Folds `CONST a; CONST b; <binop>` into `CONST r` and `CONST a; NEG` into
//! `CONST -a`. Arithmetic wraps on overflow and shift amounts are masked to
//! six bits. Division and remainder by zero are left in place unless
//! [`PassOptions::fold_division_by_zero`](super::PassOptions) is set.
//!
//! ```text
//! Before: CONST 2, CONST 3, ADD   (3 instructions)
//! After:  CONST 5                  (1 instruction)
//! ```

use super::{block_window, Pass, PassContext};
use crate::error::PassError;
use crate::unit::{Insn, UnitIr};

pub struct ConstantFolding;

impl Pass for ConstantFolding {
    fn name(&self) -> &'static str {
        "constant_folding"
    }

    fn run(&self, unit: &mut UnitIr, cx: &mut PassContext<'_>) -> Result<usize, PassError> {
        let analysis = cx.analyze(unit)?;
        let fold_div_zero = cx.options.fold_division_by_zero;
        let mut folded = 0usize;
        let mut i = 0usize;

        while i < unit.code.len() {
            cx.charge(1)?;
            let window = unit.code.get(i..).unwrap_or_default();
            match window {
                [Insn::Const(a), Insn::Const(b), Insn::Binary(op), ..]
                    if block_window(&analysis, i, 3) =>
                {
                    if let Some(result) = op.eval(*a, *b, fold_div_zero) {
                        replace_window(unit, i, 3, Insn::Const(result));
                        folded = folded.saturating_add(1);
                        // The result may start another foldable window.
                        i = i.saturating_add(2);
                        continue;
                    }
                }
                [Insn::Const(a), Insn::Neg, ..] if block_window(&analysis, i, 2) => {
                    let result = a.wrapping_neg();
                    replace_window(unit, i, 2, Insn::Const(result));
                    folded = folded.saturating_add(1);
                    i = i.saturating_add(1);
                    continue;
                }
                _ => {}
            }
            i = i.saturating_add(1);
        }

        if folded > 0 {
            unit.remove_nops();
        }
        Ok(folded)
    }
}

/// Fill `start..start + len` with NOPs and put `result` in the last slot.
pub(crate) fn replace_window(unit: &mut UnitIr, start: usize, len: usize, result: Insn) {
    let end = start.saturating_add(len);
    for index in start..end {
        if let Some(slot) = unit.code.get_mut(index) {
            *slot = if index.saturating_add(1) == end {
                result.clone()
            } else {
                Insn::Nop
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::PassOptions;
    use crate::sandbox::SandboxContext;
    use crate::unit::{BinOp, Cond};

    fn run_with(unit: &mut UnitIr, options: PassOptions) -> usize {
        let mut sandbox = SandboxContext::default();
        sandbox.reset("t", Default::default(), None);
        let mut cx = PassContext::new("t", &mut sandbox, None, options);
        ConstantFolding.run(unit, &mut cx).unwrap()
    }

    fn run(unit: &mut UnitIr) -> usize {
        run_with(unit, PassOptions::default())
    }

    fn unit(code: Vec<Insn>) -> UnitIr {
        let mut unit = UnitIr::new(1);
        unit.code = code;
        unit
    }

    #[test]
    fn folds_two_plus_three() {
        let mut u = unit(vec![
            Insn::Const(2),
            Insn::Const(3),
            Insn::Binary(BinOp::Add),
            Insn::Return,
        ]);
        assert_eq!(run(&mut u), 1);
        assert_eq!(u.code, vec![Insn::Const(5), Insn::Return]);
    }

    #[test]
    fn folds_chains_left_to_right() {
        // (2 + 3) * 4 - 1
        let mut u = unit(vec![
            Insn::Const(2),
            Insn::Const(3),
            Insn::Binary(BinOp::Add),
            Insn::Const(4),
            Insn::Binary(BinOp::Mul),
            Insn::Const(1),
            Insn::Binary(BinOp::Sub),
            Insn::Neg,
            Insn::Return,
        ]);
        assert_eq!(run(&mut u), 4);
        assert_eq!(u.code, vec![Insn::Const(-19), Insn::Return]);
    }

    #[test]
    fn operand_order_is_lhs_then_rhs() {
        let mut u = unit(vec![
            Insn::Const(10),
            Insn::Const(3),
            Insn::Binary(BinOp::Sub),
            Insn::Return,
        ]);
        run(&mut u);
        assert_eq!(u.code[0], Insn::Const(7));
    }

    #[test]
    fn wrapping_and_shift_masking() {
        let mut u = unit(vec![
            Insn::Const(i64::MAX),
            Insn::Const(1),
            Insn::Binary(BinOp::Add),
            Insn::Return,
        ]);
        run(&mut u);
        assert_eq!(u.code[0], Insn::Const(i64::MIN));

        let mut u = unit(vec![
            Insn::Const(1),
            Insn::Const(64),
            Insn::Binary(BinOp::Shl),
            Insn::Return,
        ]);
        run(&mut u);
        assert_eq!(u.code[0], Insn::Const(1));
    }

    #[test]
    fn division_by_zero_is_kept_by_default() {
        let code = vec![
            Insn::Const(7),
            Insn::Const(0),
            Insn::Binary(BinOp::Div),
            Insn::Return,
        ];
        let mut u = unit(code.clone());
        assert_eq!(run(&mut u), 0);
        assert_eq!(u.code, code);

        let mut u = unit(code);
        let folded = run_with(
            &mut u,
            PassOptions {
                fold_division_by_zero: true,
            },
        );
        assert_eq!(folded, 1);
        assert_eq!(u.code, vec![Insn::Const(0), Insn::Return]);
    }

    #[test]
    fn does_not_fold_across_block_leader() {
        // The dead GOTO makes index 1 a leader, so the window spans two blocks.
        let code = vec![
            Insn::Const(2),
            Insn::Const(3),
            Insn::Binary(BinOp::Add),
            Insn::Return,
            Insn::Goto(1),
        ];
        let mut u = unit(code.clone());
        assert_eq!(run(&mut u), 0);
        assert_eq!(u.code, code);
    }

    #[test]
    fn folds_inside_a_branch_arm() {
        let mut u = unit(vec![
            Insn::Load(0),
            Insn::Branch { cond: Cond::Zero, target: 6 },
            Insn::Const(4),
            Insn::Const(5),
            Insn::Binary(BinOp::Mul),
            Insn::Return,
            Insn::Const(0),
            Insn::Return,
        ]);
        assert_eq!(run(&mut u), 1);
        assert_eq!(
            u.code,
            vec![
                Insn::Load(0),
                Insn::Branch { cond: Cond::Zero, target: 4 },
                Insn::Const(20),
                Insn::Return,
                Insn::Const(0),
                Insn::Return,
            ]
        );
    }
}
