//! Control-flow analysis over a unit's instruction list.
//!
//! Builds the successor graph (fall-through, branch and switch targets,
//! exception handlers), then derives block leaders, reachability, stack
//! depths, slot usage and loop regions. Analysis never mutates the unit and
//! fails closed on any structural defect.
//!
//! Loop detection is approximate: any jump whose target is at or before the
//! jump itself is treated as a back-edge. No dominator tree is built.

use std::collections::{BTreeSet, VecDeque};

use crate::error::AnalysisError;
use crate::sandbox::SandboxContext;
use crate::unit::{Insn, UnitIr};

/// A back-edge and the instruction range it spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopRegion {
    /// Target of the back-edge.
    pub header: usize,
    /// Instruction holding the back-edge.
    pub latch: usize,
}

impl LoopRegion {
    pub fn contains(&self, index: usize) -> bool {
        self.header <= index && index <= self.latch
    }
}

/// Result of analyzing a unit.
#[derive(Debug, Clone, Default)]
pub struct Analysis {
    /// Successor indices per instruction, handlers included.
    pub successors: Vec<Vec<usize>>,
    /// First instruction of each basic block.
    pub leaders: Vec<bool>,
    /// Reachable from the entry.
    pub reachable: Vec<bool>,
    /// Stack depth before each reachable instruction.
    pub stack_depth: Vec<Option<u32>>,
    pub max_stack: u32,
    /// Slots read by LOAD.
    pub loaded_slots: BTreeSet<u16>,
    /// Slots written by STORE.
    pub stored_slots: BTreeSet<u16>,
    /// Back-edges in reachable code.
    pub loops: Vec<LoopRegion>,
    /// Covered by at least one handler.
    pub covered: Vec<bool>,
}

impl Analysis {
    pub fn len(&self) -> usize {
        self.leaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaders.is_empty()
    }

    pub fn is_leader(&self, index: usize) -> bool {
        self.leaders.get(index).copied().unwrap_or(false)
    }

    pub fn is_reachable(&self, index: usize) -> bool {
        self.reachable.get(index).copied().unwrap_or(false)
    }

    /// Whether `start..=end` lies in a single basic block.
    pub fn same_block(&self, start: usize, end: usize) -> bool {
        start <= end
            && end < self.len()
            && (start.saturating_add(1)..=end).all(|i| !self.is_leader(i))
    }

    /// Every slot touched by LOAD or STORE.
    pub fn used_slots(&self) -> BTreeSet<u16> {
        self.loaded_slots.union(&self.stored_slots).copied().collect()
    }

    /// Slots that are stored but never loaded.
    pub fn dead_store_slots(&self) -> BTreeSet<u16> {
        self.stored_slots
            .difference(&self.loaded_slots)
            .copied()
            .collect()
    }

    pub fn unreachable_count(&self) -> usize {
        self.reachable.iter().filter(|r| !**r).count()
    }
}

/// Analyze `unit`, charging `sandbox`.
pub fn analyze(unit: &UnitIr, sandbox: &mut SandboxContext) -> Result<Analysis, AnalysisError> {
    sandbox.enter_analysis(unit.code.len())?;
    let result = analyze_inner(unit);
    sandbox.exit_analysis();
    result
}

fn analyze_inner(unit: &UnitIr) -> Result<Analysis, AnalysisError> {
    let len = unit.code.len();
    if len == 0 {
        return Err(AnalysisError::Empty);
    }
    check_operands(unit)?;
    check_handlers(unit)?;

    let mut analysis = Analysis {
        successors: Vec::with_capacity(len),
        leaders: vec![false; len],
        reachable: vec![false; len],
        stack_depth: vec![None; len],
        covered: vec![false; len],
        ..Analysis::default()
    };

    // Successors and leaders.
    mark(&mut analysis.leaders, 0);
    for handler in &unit.handlers {
        mark(&mut analysis.leaders, to_index(handler.start));
        mark(&mut analysis.leaders, to_index(handler.end));
        mark(&mut analysis.leaders, to_index(handler.target));
    }
    for (index, insn) in unit.code.iter().enumerate() {
        let mut succ: Vec<usize> = insn.targets().into_iter().map(to_index).collect();
        for target in &succ {
            mark(&mut analysis.leaders, *target);
        }
        if insn.ends_block() {
            mark(&mut analysis.leaders, index.saturating_add(1));
        }
        if insn.falls_through() {
            succ.push(index.saturating_add(1));
        }
        for handler in &unit.handlers {
            if handler.covers(index) {
                if let Some(flag) = analysis.covered.get_mut(index) {
                    *flag = true;
                }
                succ.push(to_index(handler.target));
            }
        }
        succ.sort_unstable();
        succ.dedup();
        analysis.successors.push(succ);
    }

    // Reachability and stack depth in one breadth-first walk.
    let mut queue = VecDeque::from([0usize]);
    set_depth(&mut analysis.stack_depth, 0, 0, 0)?;
    while let Some(index) = queue.pop_front() {
        let Some(insn) = unit.code.get(index) else {
            continue;
        };
        if analysis.reachable.get(index).copied().unwrap_or(true) {
            continue;
        }
        if let Some(flag) = analysis.reachable.get_mut(index) {
            *flag = true;
        }

        let depth = analysis
            .stack_depth
            .get(index)
            .copied()
            .flatten()
            .unwrap_or(0);
        let (pops, pushes) = insn.stack_effect();
        if pops > depth {
            return Err(AnalysisError::StackUnderflow { at: index });
        }
        let after = depth.saturating_sub(pops).saturating_add(pushes);
        analysis.max_stack = analysis.max_stack.max(depth).max(after);

        if insn.falls_through() && index.saturating_add(1) >= len {
            return Err(AnalysisError::FallsOffEnd { at: index });
        }

        let handler_targets: Vec<usize> = unit
            .handlers
            .iter()
            .filter(|h| h.covers(index))
            .map(|h| to_index(h.target))
            .collect();
        let successors = analysis.successors.get(index).cloned().unwrap_or_default();
        for succ in successors {
            // A handler target reached only through the handler edge starts
            // with the thrown value on the stack.
            let is_normal_edge = (insn.falls_through() && succ == index.saturating_add(1))
                || insn.targets().iter().any(|t| to_index(*t) == succ);
            if is_normal_edge {
                set_depth(&mut analysis.stack_depth, succ, after, index)?;
            }
            if handler_targets.contains(&succ) {
                set_depth(&mut analysis.stack_depth, succ, 1, index)?;
                analysis.max_stack = analysis.max_stack.max(1);
            }
            if !analysis.reachable.get(succ).copied().unwrap_or(true) {
                queue.push_back(succ);
            }
        }

        match insn {
            Insn::Load(slot) => {
                analysis.loaded_slots.insert(*slot);
            }
            Insn::Store(slot) => {
                analysis.stored_slots.insert(*slot);
            }
            _ => {}
        }
        for target in insn.targets() {
            let target = to_index(target);
            if target <= index {
                analysis.loops.push(LoopRegion {
                    header: target,
                    latch: index,
                });
            }
        }
    }
    analysis.loops.sort_by_key(|l| (l.header, l.latch));

    Ok(analysis)
}

fn check_operands(unit: &UnitIr) -> Result<(), AnalysisError> {
    let len = unit.code.len();
    for (at, insn) in unit.code.iter().enumerate() {
        for target in insn.targets() {
            if to_index(target) >= len {
                return Err(AnalysisError::DanglingTarget { at, target });
            }
        }
        if let Some(slot) = insn.slot()
            && slot >= unit.max_locals
        {
            return Err(AnalysisError::SlotOutOfRange {
                at,
                slot,
                max_locals: unit.max_locals,
            });
        }
        if let Some(index) = insn.pool_ref()
            && usize::from(index) >= unit.pool.len()
        {
            return Err(AnalysisError::PoolOutOfRange { at, index });
        }
    }
    Ok(())
}

fn check_handlers(unit: &UnitIr) -> Result<(), AnalysisError> {
    let len = unit.code.len();
    for (index, handler) in unit.handlers.iter().enumerate() {
        let start = to_index(handler.start);
        let end = to_index(handler.end);
        let target = to_index(handler.target);
        if start >= end || end > len || target >= len {
            return Err(AnalysisError::BadHandler {
                index,
                start: handler.start,
                end: handler.end,
                target: handler.target,
            });
        }
    }
    Ok(())
}

fn set_depth(
    depths: &mut [Option<u32>],
    index: usize,
    depth: u32,
    from: usize,
) -> Result<(), AnalysisError> {
    let Some(slot) = depths.get_mut(index) else {
        return Err(AnalysisError::FallsOffEnd { at: from });
    };
    match slot {
        Some(existing) if *existing != depth => Err(AnalysisError::InconsistentStack {
            at: index,
            expected: *existing,
            found: depth,
        }),
        Some(_) => Ok(()),
        None => {
            *slot = Some(depth);
            Ok(())
        }
    }
}

fn mark(flags: &mut [bool], index: usize) {
    if let Some(flag) = flags.get_mut(index) {
        *flag = true;
    }
}

pub(crate) fn to_index(value: u32) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}
