//! Redundant local reloads.
//!
//! `LOAD s; LOAD s` becomes `LOAD s; DUP`. Field reads on the duplicated
//! receiver are left as they are.

use super::{block_window, Pass, PassContext};
use crate::error::PassError;
use crate::unit::{Insn, UnitIr};

pub struct FieldAccess;

impl Pass for FieldAccess {
    fn name(&self) -> &'static str {
        "field_access"
    }

    fn run(&self, unit: &mut UnitIr, cx: &mut PassContext<'_>) -> Result<usize, PassError> {
        let analysis = cx.analyze(unit)?;
        let mut rewrites = 0usize;

        for i in 0..unit.code.len() {
            cx.charge(1)?;
            let reload = matches!(
                unit.code.get(i..i.saturating_add(2)),
                Some([Insn::Load(a), Insn::Load(b)]) if a == b
            );
            if reload && block_window(&analysis, i, 2) {
                if let Some(slot) = unit.code.get_mut(i.saturating_add(1)) {
                    *slot = Insn::Dup;
                }
                rewrites = rewrites.saturating_add(1);
            }
        }
        Ok(rewrites)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::PassOptions;
    use crate::sandbox::SandboxContext;

    #[test]
    fn reload_becomes_dup() {
        let mut sandbox = SandboxContext::default();
        sandbox.reset("t", Default::default(), None);
        let mut cx = PassContext::new("t", &mut sandbox, None, PassOptions::default());

        let mut unit = UnitIr::new(1);
        unit.pool = vec!["x".to_string()];
        unit.code = vec![
            Insn::Load(0),
            Insn::Load(0),
            Insn::GetField(0),
            Insn::Swap,
            Insn::Pop,
            Insn::Return,
        ];
        assert_eq!(FieldAccess.run(&mut unit, &mut cx).unwrap(), 1);
        assert_eq!(unit.code[1], Insn::Dup);
        assert_eq!(unit.code[2], Insn::GetField(0));
    }
}
