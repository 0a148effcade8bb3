//! Devirtualization of calls on sealed types.
//!
//! `INVOKE_VIRTUAL Owner::m` becomes `INVOKE_DIRECT Owner::m` when the
//! loader reports `Owner` sealed. The rewrite depends on `Owner`.

use super::{Pass, PassContext};
use crate::error::PassError;
use crate::loader::split_method_ref;
use crate::unit::{Insn, InvokeKind, UnitIr};

pub struct Devirtualization;

impl Pass for Devirtualization {
    fn name(&self) -> &'static str {
        "devirtualization"
    }

    fn run(&self, unit: &mut UnitIr, cx: &mut PassContext<'_>) -> Result<usize, PassError> {
        let Some(facts) = cx.facts else {
            return Ok(0);
        };
        let mut owners = Vec::new();
        let pool = &unit.pool;

        for insn in unit.code.iter_mut() {
            cx.charge(1)?;
            let Insn::Invoke { kind, method, .. } = insn else {
                continue;
            };
            if *kind != InvokeKind::Virtual {
                continue;
            }
            let owner = pool
                .get(usize::from(*method))
                .and_then(|reference| split_method_ref(reference))
                .map(|(owner, _)| owner);
            if let Some(owner) = owner
                && facts.is_sealed(owner)
            {
                *kind = InvokeKind::Direct;
                owners.push(owner.to_string());
            }
        }

        let rewrites = owners.len();
        for owner in &owners {
            cx.record_dependency(owner);
        }
        Ok(rewrites)
    }
}
