//! Inlining of constant-returning static calls.
//!
//! `INVOKE_STATIC Owner::m` with no arguments becomes `CONST c` when the
//! loader reports that `Owner::m` always returns `c`. The rewrite depends on
//! `Owner`, so it is recorded.

use super::{Pass, PassContext};
use crate::error::PassError;
use crate::loader::split_method_ref;
use crate::unit::{Insn, InvokeKind, UnitIr};

pub struct Inlining;

impl Pass for Inlining {
    fn name(&self) -> &'static str {
        "inlining"
    }

    fn run(&self, unit: &mut UnitIr, cx: &mut PassContext<'_>) -> Result<usize, PassError> {
        let Some(facts) = cx.facts else {
            return Ok(0);
        };
        let mut owners = Vec::new();
        let mut rewrites = 0usize;

        for index in 0..unit.code.len() {
            cx.charge(1)?;
            let Some(Insn::Invoke {
                kind: InvokeKind::Static,
                method,
                argc: 0,
            }) = unit.code.get(index)
            else {
                continue;
            };
            let Some((owner, name)) = unit.pool_str(*method).and_then(split_method_ref) else {
                continue;
            };
            let Some(value) = facts.constant_result(owner, name) else {
                continue;
            };
            owners.push(owner.to_string());
            if let Some(slot) = unit.code.get_mut(index) {
                *slot = Insn::Const(value);
            }
            rewrites = rewrites.saturating_add(1);
        }

        for owner in &owners {
            cx.record_dependency(owner);
        }
        Ok(rewrites)
    }
}
