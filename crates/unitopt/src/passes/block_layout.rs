//! Final layout: compacts NOPs and orders the handler table.
//!
//! Handlers are sorted by `(start, end)`, but two handlers whose ranges
//! overlap never swap: the first matching handler wins at runtime, so their
//! relative order is semantic.

use super::{Pass, PassContext};
use crate::error::PassError;
use crate::unit::{Handler, Insn, UnitIr};

pub struct BlockLayout;

fn overlaps(a: &Handler, b: &Handler) -> bool {
    a.start < b.end && b.start < a.end
}

impl Pass for BlockLayout {
    fn name(&self) -> &'static str {
        "block_layout"
    }

    fn run(&self, unit: &mut UnitIr, cx: &mut PassContext<'_>) -> Result<usize, PassError> {
        cx.charge(unit.code.len())?;
        let mut rewrites = if unit.code.contains(&Insn::Nop) {
            unit.remove_nops()
        } else {
            0
        };

        // Bubble sort swapping only adjacent, disjoint handlers.
        let handlers = &mut unit.handlers;
        let mut swapped = true;
        while swapped {
            swapped = false;
            cx.charge(handlers.len())?;
            for j in 1..handlers.len() {
                let (Some(a), Some(b)) = (handlers.get(j - 1), handlers.get(j)) else {
                    continue;
                };
                if (a.start, a.end) > (b.start, b.end) && !overlaps(a, b) {
                    handlers.swap(j - 1, j);
                    swapped = true;
                    rewrites = rewrites.saturating_add(1);
                }
            }
        }
        Ok(rewrites)
    }
}
