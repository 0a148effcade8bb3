//! In-memory representation of a program unit.
//!
//! A unit is a flat instruction list plus a string pool and an exception
//! handler table. Branch and handler operands address instructions by index,
//! so structural edits go through [`UnitIr::compact`], which remaps every
//! reference in one place.

pub mod codec;
pub mod digest;

/// Magic bytes at the start of every encoded unit.
pub const UNIT_MAGIC: [u8; 4] = *b"BUNT";

/// Fixed header: magic, version, flags, max_locals, max_stack.
pub const UNIT_HEADER_SIZE: usize = 12;

/// Smallest well-formed unit: header + empty pool, code and handler tables.
pub const MIN_UNIT_SIZE: usize = UNIT_HEADER_SIZE + 2 + 4 + 2;

// ─── Opcode constants ────────────────────────────────────────────────

pub const NOP: u8 = 0x00;
pub const CONST: u8 = 0x01;
pub const LOAD: u8 = 0x02;
pub const STORE: u8 = 0x03;
pub const ADD: u8 = 0x04;
pub const SUB: u8 = 0x05;
pub const MUL: u8 = 0x06;
pub const DIV: u8 = 0x07;
pub const REM: u8 = 0x08;
pub const AND: u8 = 0x09;
pub const OR: u8 = 0x0a;
pub const XOR: u8 = 0x0b;
pub const SHL: u8 = 0x0c;
pub const SHR: u8 = 0x0d;
pub const NEG: u8 = 0x0e;
pub const POP: u8 = 0x10;
pub const DUP: u8 = 0x11;
pub const SWAP: u8 = 0x12;
pub const GOTO: u8 = 0x20;
pub const IF_ZERO: u8 = 0x21;
pub const IF_NONZERO: u8 = 0x22;
pub const IF_EQ: u8 = 0x23;
pub const IF_LT: u8 = 0x24;
pub const SWITCH: u8 = 0x25;
pub const INVOKE_STATIC: u8 = 0x30;
pub const INVOKE_VIRTUAL: u8 = 0x31;
pub const INVOKE_DIRECT: u8 = 0x32;
pub const MONITOR_ENTER: u8 = 0x38;
pub const MONITOR_EXIT: u8 = 0x39;
pub const LDC_STR: u8 = 0x40;
pub const CONCAT: u8 = 0x41;
pub const GET_FIELD: u8 = 0x48;
pub const PUT_FIELD: u8 = 0x49;
pub const THROW: u8 = 0x50;
pub const RETURN: u8 = 0x60;
pub const RETURN_VOID: u8 = 0x61;

/// Two-operand integer arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

impl BinOp {
    pub fn opcode(self) -> u8 {
        match self {
            BinOp::Add => ADD,
            BinOp::Sub => SUB,
            BinOp::Mul => MUL,
            BinOp::Div => DIV,
            BinOp::Rem => REM,
            BinOp::And => AND,
            BinOp::Or => OR,
            BinOp::Xor => XOR,
            BinOp::Shl => SHL,
            BinOp::Shr => SHR,
        }
    }

    pub fn from_opcode(opcode: u8) -> Option<Self> {
        Some(match opcode {
            ADD => BinOp::Add,
            SUB => BinOp::Sub,
            MUL => BinOp::Mul,
            DIV => BinOp::Div,
            REM => BinOp::Rem,
            AND => BinOp::And,
            OR => BinOp::Or,
            XOR => BinOp::Xor,
            SHL => BinOp::Shl,
            SHR => BinOp::Shr,
            _ => return None,
        })
    }

    /// Evaluate `lhs op rhs` with wrapping semantics.
    ///
    /// `lhs` is the value pushed first (below the top of stack). Shift
    /// amounts are masked to 6 bits. Division and remainder by zero return
    /// `None` unless `fold_division_by_zero` is set, in which case they
    /// evaluate to `0`.
    pub fn eval(self, lhs: i64, rhs: i64, fold_division_by_zero: bool) -> Option<i64> {
        match self {
            BinOp::Add => Some(lhs.wrapping_add(rhs)),
            BinOp::Sub => Some(lhs.wrapping_sub(rhs)),
            BinOp::Mul => Some(lhs.wrapping_mul(rhs)),
            BinOp::Div | BinOp::Rem if rhs == 0 => fold_division_by_zero.then_some(0),
            BinOp::Div => Some(lhs.wrapping_div(rhs)),
            BinOp::Rem => Some(lhs.wrapping_rem(rhs)),
            BinOp::And => Some(lhs & rhs),
            BinOp::Or => Some(lhs | rhs),
            BinOp::Xor => Some(lhs ^ rhs),
            BinOp::Shl => Some(lhs.wrapping_shl(shift_amount(rhs))),
            BinOp::Shr => Some(lhs.wrapping_shr(shift_amount(rhs))),
        }
    }
}

fn shift_amount(rhs: i64) -> u32 {
    // Masked to 0..=63, so the conversion cannot fail.
    u32::try_from(rhs & 0x3f).unwrap_or(0)
}

/// Branch condition for conditional jumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    /// Pops one value, jumps if it is zero.
    Zero,
    /// Pops one value, jumps if it is non-zero.
    NonZero,
    /// Pops `rhs` then `lhs`, jumps if `lhs == rhs`.
    Eq,
    /// Pops `rhs` then `lhs`, jumps if `lhs < rhs`.
    Lt,
}

impl Cond {
    pub fn opcode(self) -> u8 {
        match self {
            Cond::Zero => IF_ZERO,
            Cond::NonZero => IF_NONZERO,
            Cond::Eq => IF_EQ,
            Cond::Lt => IF_LT,
        }
    }

    /// Number of operands popped by the comparison.
    pub fn arity(self) -> u32 {
        match self {
            Cond::Zero | Cond::NonZero => 1,
            Cond::Eq | Cond::Lt => 2,
        }
    }

    /// Decide a unary condition on a known value.
    pub fn eval_unary(self, value: i64) -> Option<bool> {
        match self {
            Cond::Zero => Some(value == 0),
            Cond::NonZero => Some(value != 0),
            Cond::Eq | Cond::Lt => None,
        }
    }
}

/// Dispatch flavour of a call instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvokeKind {
    /// No receiver; target resolved by name.
    Static,
    /// Receiver on the stack; target resolved by the receiver's runtime type.
    Virtual,
    /// Receiver on the stack; target fixed at link time.
    Direct,
}

impl InvokeKind {
    pub fn opcode(self) -> u8 {
        match self {
            InvokeKind::Static => INVOKE_STATIC,
            InvokeKind::Virtual => INVOKE_VIRTUAL,
            InvokeKind::Direct => INVOKE_DIRECT,
        }
    }

    pub fn has_receiver(self) -> bool {
        !matches!(self, InvokeKind::Static)
    }
}

/// A single decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insn {
    Nop,
    Const(i64),
    Load(u16),
    Store(u16),
    Binary(BinOp),
    Neg,
    Pop,
    Dup,
    Swap,
    Goto(u32),
    Branch { cond: Cond, target: u32 },
    Switch { default: u32, cases: Vec<(i64, u32)> },
    Invoke { kind: InvokeKind, method: u16, argc: u8 },
    MonitorEnter,
    MonitorExit,
    LdcStr(u16),
    Concat,
    GetField(u16),
    PutField(u16),
    Throw,
    Return,
    ReturnVoid,
}

impl Insn {
    /// Explicit branch targets (not including fall-through).
    pub fn targets(&self) -> Vec<u32> {
        match self {
            Insn::Goto(target) | Insn::Branch { target, .. } => vec![*target],
            Insn::Switch { default, cases } => {
                let mut targets = Vec::with_capacity(cases.len().saturating_add(1));
                targets.push(*default);
                targets.extend(cases.iter().map(|(_, target)| *target));
                targets
            }
            _ => Vec::new(),
        }
    }

    /// Apply `f` to every branch target operand.
    pub fn for_each_target_mut(&mut self, mut f: impl FnMut(&mut u32)) {
        match self {
            Insn::Goto(target) | Insn::Branch { target, .. } => f(target),
            Insn::Switch { default, cases } => {
                f(default);
                for (_, target) in cases.iter_mut() {
                    f(target);
                }
            }
            _ => {}
        }
    }

    /// Whether control can continue to the next instruction.
    pub fn falls_through(&self) -> bool {
        !matches!(
            self,
            Insn::Goto(_) | Insn::Switch { .. } | Insn::Throw | Insn::Return | Insn::ReturnVoid
        )
    }

    /// Whether this instruction ends a basic block.
    pub fn ends_block(&self) -> bool {
        !self.falls_through() || matches!(self, Insn::Branch { .. })
    }

    /// Stack effect as `(pops, pushes)`.
    pub fn stack_effect(&self) -> (u32, u32) {
        match self {
            Insn::Nop | Insn::Goto(_) | Insn::ReturnVoid => (0, 0),
            Insn::Const(_) | Insn::Load(_) | Insn::LdcStr(_) => (0, 1),
            Insn::Store(_) | Insn::Pop | Insn::MonitorEnter | Insn::MonitorExit => (1, 0),
            Insn::Throw | Insn::Return | Insn::Switch { .. } => (1, 0),
            Insn::Binary(_) | Insn::Concat => (2, 1),
            Insn::Neg | Insn::GetField(_) => (1, 1),
            Insn::Dup => (1, 2),
            Insn::Swap => (2, 2),
            Insn::PutField(_) => (2, 0),
            Insn::Branch { cond, .. } => (cond.arity(), 0),
            Insn::Invoke { kind, argc, .. } => {
                let receiver = u32::from(kind.has_receiver());
                (u32::from(*argc).saturating_add(receiver), 1)
            }
        }
    }

    /// Conservative: whether executing this instruction may raise.
    pub fn can_throw(&self) -> bool {
        matches!(
            self,
            Insn::Binary(BinOp::Div | BinOp::Rem)
                | Insn::Invoke { .. }
                | Insn::MonitorEnter
                | Insn::MonitorExit
                | Insn::GetField(_)
                | Insn::PutField(_)
                | Insn::Concat
                | Insn::Throw
        )
    }

    /// Local slot referenced by a LOAD/STORE.
    pub fn slot(&self) -> Option<u16> {
        match self {
            Insn::Load(slot) | Insn::Store(slot) => Some(*slot),
            _ => None,
        }
    }

    /// String pool index referenced by this instruction, if any.
    pub fn pool_ref(&self) -> Option<u16> {
        match self {
            Insn::Invoke { method, .. } => Some(*method),
            Insn::LdcStr(index) | Insn::GetField(index) | Insn::PutField(index) => Some(*index),
            _ => None,
        }
    }

    /// Size of this instruction in the binary encoding.
    pub fn encoded_len(&self) -> usize {
        match self {
            Insn::Const(_) => 9,
            Insn::Load(_) | Insn::Store(_) | Insn::LdcStr(_) => 3,
            Insn::GetField(_) | Insn::PutField(_) => 3,
            Insn::Goto(_) | Insn::Branch { .. } => 5,
            Insn::Invoke { .. } => 4,
            Insn::Switch { cases, .. } => 7_usize.saturating_add(cases.len().saturating_mul(12)),
            _ => 1,
        }
    }
}

/// Exception handler covering instructions `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handler {
    pub start: u32,
    pub end: u32,
    pub target: u32,
}

impl Handler {
    pub fn covers(&self, index: usize) -> bool {
        let index = u64::try_from(index).unwrap_or(u64::MAX);
        u64::from(self.start) <= index && index < u64::from(self.end)
    }
}

/// Decoded program unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitIr {
    pub version: u16,
    pub flags: u16,
    pub max_locals: u16,
    pub max_stack: u16,
    pub pool: Vec<String>,
    pub code: Vec<Insn>,
    pub handlers: Vec<Handler>,
}

impl UnitIr {
    /// Empty unit at format version 1.
    pub fn new(max_locals: u16) -> Self {
        Self {
            version: 1,
            flags: 0,
            max_locals,
            max_stack: 0,
            pool: Vec::new(),
            code: Vec::new(),
            handlers: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Pool string at `index`.
    pub fn pool_str(&self, index: u16) -> Option<&str> {
        self.pool.get(usize::from(index)).map(String::as_str)
    }

    /// Index of `value` in the pool, appending it if absent.
    ///
    /// Returns `None` if the pool is full.
    pub fn intern(&mut self, value: &str) -> Option<u16> {
        if let Some(pos) = self.pool.iter().position(|s| s == value) {
            return u16::try_from(pos).ok();
        }
        let index = u16::try_from(self.pool.len()).ok()?;
        self.pool.push(value.to_string());
        Some(index)
    }

    /// Remove every instruction whose `keep` flag is false.
    ///
    /// References to a removed instruction are redirected to the next
    /// surviving one. Handler ranges shrink accordingly and handlers left
    /// with an empty range are dropped. Returns the number of instructions
    /// removed.
    pub fn compact(&mut self, keep: &[bool]) -> usize {
        let len = self.code.len();
        if keep.len() != len || keep.iter().all(|k| *k) {
            return 0;
        }

        // new_index[i] = number of kept instructions before i, for i in 0..=len.
        let mut new_index = Vec::with_capacity(len.saturating_add(1));
        let mut kept: u32 = 0;
        for flag in keep {
            new_index.push(kept);
            if *flag {
                kept = kept.saturating_add(1);
            }
        }
        new_index.push(kept);

        let remap = |target: u32| -> u32 {
            usize::try_from(target)
                .ok()
                .and_then(|t| new_index.get(t).copied())
                // Already dangling; keep it dangling past the new end.
                .unwrap_or_else(|| kept.saturating_add(target.saturating_sub(u32::try_from(len).unwrap_or(u32::MAX))))
        };

        let old_code = std::mem::take(&mut self.code);
        self.code = old_code
            .into_iter()
            .zip(keep.iter())
            .filter_map(|(insn, flag)| flag.then_some(insn))
            .collect();
        for insn in &mut self.code {
            insn.for_each_target_mut(|target| *target = remap(*target));
        }

        self.handlers = self
            .handlers
            .iter()
            .filter_map(|handler| {
                let start = remap(handler.start);
                let end = remap(handler.end);
                (start < end).then(|| Handler {
                    start,
                    end,
                    target: remap(handler.target),
                })
            })
            .collect();

        len.saturating_sub(self.code.len())
    }

    /// Drop every NOP. Returns the number removed.
    pub fn remove_nops(&mut self) -> usize {
        let keep: Vec<bool> = self.code.iter().map(|insn| *insn != Insn::Nop).collect();
        self.compact(&keep)
    }

    /// Length of the binary encoding of this unit.
    pub fn encoded_len(&self) -> usize {
        let pool: usize = self
            .pool
            .iter()
            .map(|s| s.len().saturating_add(2))
            .sum();
        let code: usize = self.code.iter().map(Insn::encoded_len).sum();
        MIN_UNIT_SIZE
            .saturating_add(pool)
            .saturating_add(code)
            .saturating_add(self.handlers.len().saturating_mul(12))
    }
}

#[cfg(test)]
#[allow(clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_binop_eval_wrapping() {
        assert_eq!(BinOp::Add.eval(2, 3, false), Some(5));
        assert_eq!(BinOp::Sub.eval(2, 3, false), Some(-1));
        assert_eq!(BinOp::Add.eval(i64::MAX, 1, false), Some(i64::MIN));
        assert_eq!(BinOp::Div.eval(i64::MIN, -1, false), Some(i64::MIN));
        assert_eq!(BinOp::Shl.eval(1, 65, false), Some(2), "shift masked to 6 bits");
        assert_eq!(BinOp::Shr.eval(-8, 1, false), Some(-4), "arithmetic shift");
    }

    #[test]
    fn test_division_by_zero_policy() {
        assert_eq!(BinOp::Div.eval(7, 0, false), None);
        assert_eq!(BinOp::Rem.eval(7, 0, false), None);
        assert_eq!(BinOp::Div.eval(7, 0, true), Some(0));
        assert_eq!(BinOp::Rem.eval(7, 0, true), Some(0));
    }

    #[test]
    fn test_stack_effects() {
        assert_eq!(Insn::Const(1).stack_effect(), (0, 1));
        assert_eq!(Insn::Binary(BinOp::Add).stack_effect(), (2, 1));
        assert_eq!(
            Insn::Invoke {
                kind: InvokeKind::Virtual,
                method: 0,
                argc: 2
            }
            .stack_effect(),
            (3, 1)
        );
        assert_eq!(
            Insn::Branch {
                cond: Cond::Lt,
                target: 0
            }
            .stack_effect(),
            (2, 0)
        );
    }

    #[test]
    fn test_compact_remaps_targets_to_next_survivor() {
        let mut unit = UnitIr::new(0);
        unit.code = vec![
            Insn::Goto(2),       // 0
            Insn::Const(9),      // 1 (removed)
            Insn::Nop,           // 2 (removed) - target of goto
            Insn::Const(1),      // 3
            Insn::Return,        // 4
        ];
        let removed = unit.compact(&[true, false, false, true, true]);

        assert_eq!(removed, 2);
        assert_eq!(unit.code, vec![Insn::Goto(1), Insn::Const(1), Insn::Return]);
    }

    #[test]
    fn test_compact_shrinks_and_drops_handlers() {
        let mut unit = UnitIr::new(0);
        unit.code = vec![
            Insn::Nop,
            Insn::Const(1),
            Insn::Return,
            Insn::Pop,
            Insn::ReturnVoid,
        ];
        unit.handlers = vec![
            Handler { start: 0, end: 1, target: 3 },
            Handler { start: 0, end: 3, target: 3 },
        ];
        unit.remove_nops();

        assert_eq!(unit.handlers, vec![Handler { start: 0, end: 2, target: 2 }]);
    }

    #[test]
    fn test_intern_reuses_existing() {
        let mut unit = UnitIr::new(0);
        assert_eq!(unit.intern("a"), Some(0));
        assert_eq!(unit.intern("b"), Some(1));
        assert_eq!(unit.intern("a"), Some(0));
        assert_eq!(unit.pool.len(), 2);
    }

    #[test]
    fn test_handler_covers() {
        let handler = Handler { start: 2, end: 4, target: 9 };
        assert!(!handler.covers(1));
        assert!(handler.covers(2));
        assert!(handler.covers(3));
        assert!(!handler.covers(4));
    }
}
