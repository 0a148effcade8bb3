//! Little-endian binary codec for [`UnitIr`].

use super::{
    BinOp, Cond, Handler, Insn, InvokeKind, UnitIr, CONCAT, CONST, DUP, GET_FIELD, GOTO, IF_EQ,
    IF_LT, IF_NONZERO, IF_ZERO, INVOKE_DIRECT, INVOKE_STATIC, INVOKE_VIRTUAL, LDC_STR, LOAD,
    MONITOR_ENTER, MONITOR_EXIT, NEG, NOP, POP, PUT_FIELD, RETURN, RETURN_VOID, STORE, SWAP,
    SWITCH, THROW, UNIT_HEADER_SIZE, UNIT_MAGIC,
};
use crate::error::UnitError;

/// Fixed header fields, readable without decoding the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitHeader {
    pub version: u16,
    pub flags: u16,
    pub max_locals: u16,
    pub max_stack: u16,
}

/// Read only the fixed header.
pub fn read_header(bytes: &[u8]) -> Result<UnitHeader, UnitError> {
    if bytes.len() < UNIT_HEADER_SIZE {
        return Err(UnitError::TooShort { len: bytes.len() });
    }
    let mut reader = Reader::new(bytes);
    if reader.take(4)? != UNIT_MAGIC {
        return Err(UnitError::BadMagic);
    }
    Ok(UnitHeader {
        version: reader.u16()?,
        flags: reader.u16()?,
        max_locals: reader.u16()?,
        max_stack: reader.u16()?,
    })
}

/// Decode a complete unit. Trailing bytes are an error.
pub fn decode(bytes: &[u8]) -> Result<UnitIr, UnitError> {
    let header = read_header(bytes)?;
    let mut reader = Reader::new(bytes);
    reader.pos = UNIT_HEADER_SIZE;

    let pool_count = usize::from(reader.u16()?);
    let mut pool = Vec::with_capacity(pool_count);
    for index in 0..pool_count {
        let len = usize::from(reader.u16()?);
        let raw = reader.take(len)?;
        let value = std::str::from_utf8(raw).map_err(|_| UnitError::InvalidUtf8 { index })?;
        pool.push(value.to_string());
    }

    let insn_count = reader.u32()?;
    // Every instruction is at least one byte; don't trust the count for allocation.
    let capacity = usize::try_from(insn_count)
        .unwrap_or(usize::MAX)
        .min(reader.remaining());
    let mut code = Vec::with_capacity(capacity);
    for index in 0..usize::try_from(insn_count).unwrap_or(usize::MAX) {
        code.push(decode_insn(&mut reader, index)?);
    }

    let handler_count = reader.u16()?;
    let mut handlers = Vec::with_capacity(usize::from(handler_count));
    for _ in 0..handler_count {
        handlers.push(Handler {
            start: reader.u32()?,
            end: reader.u32()?,
            target: reader.u32()?,
        });
    }

    if reader.remaining() != 0 {
        return Err(UnitError::TrailingBytes {
            count: reader.remaining(),
        });
    }

    Ok(UnitIr {
        version: header.version,
        flags: header.flags,
        max_locals: header.max_locals,
        max_stack: header.max_stack,
        pool,
        code,
        handlers,
    })
}

fn decode_insn(reader: &mut Reader<'_>, index: usize) -> Result<Insn, UnitError> {
    let opcode = reader.u8()?;
    if let Some(op) = BinOp::from_opcode(opcode) {
        return Ok(Insn::Binary(op));
    }
    let insn = match opcode {
        NOP => Insn::Nop,
        CONST => Insn::Const(reader.i64()?),
        LOAD => Insn::Load(reader.u16()?),
        STORE => Insn::Store(reader.u16()?),
        NEG => Insn::Neg,
        POP => Insn::Pop,
        DUP => Insn::Dup,
        SWAP => Insn::Swap,
        GOTO => Insn::Goto(reader.u32()?),
        IF_ZERO => branch(reader, Cond::Zero)?,
        IF_NONZERO => branch(reader, Cond::NonZero)?,
        IF_EQ => branch(reader, Cond::Eq)?,
        IF_LT => branch(reader, Cond::Lt)?,
        SWITCH => {
            let default = reader.u32()?;
            let count = reader.u16()?;
            let mut cases = Vec::with_capacity(usize::from(count));
            for _ in 0..count {
                cases.push((reader.i64()?, reader.u32()?));
            }
            Insn::Switch { default, cases }
        }
        INVOKE_STATIC => invoke(reader, InvokeKind::Static)?,
        INVOKE_VIRTUAL => invoke(reader, InvokeKind::Virtual)?,
        INVOKE_DIRECT => invoke(reader, InvokeKind::Direct)?,
        MONITOR_ENTER => Insn::MonitorEnter,
        MONITOR_EXIT => Insn::MonitorExit,
        LDC_STR => Insn::LdcStr(reader.u16()?),
        CONCAT => Insn::Concat,
        GET_FIELD => Insn::GetField(reader.u16()?),
        PUT_FIELD => Insn::PutField(reader.u16()?),
        THROW => Insn::Throw,
        RETURN => Insn::Return,
        RETURN_VOID => Insn::ReturnVoid,
        _ => return Err(UnitError::UnknownOpcode { opcode, index }),
    };
    Ok(insn)
}

fn branch(reader: &mut Reader<'_>, cond: Cond) -> Result<Insn, UnitError> {
    Ok(Insn::Branch {
        cond,
        target: reader.u32()?,
    })
}

fn invoke(reader: &mut Reader<'_>, kind: InvokeKind) -> Result<Insn, UnitError> {
    Ok(Insn::Invoke {
        kind,
        method: reader.u16()?,
        argc: reader.u8()?,
    })
}

/// Encode a unit into its binary form.
pub fn encode(unit: &UnitIr) -> Result<Vec<u8>, UnitError> {
    let mut out = Vec::with_capacity(unit.encoded_len());
    out.extend_from_slice(&UNIT_MAGIC);
    out.extend_from_slice(&unit.version.to_le_bytes());
    out.extend_from_slice(&unit.flags.to_le_bytes());
    out.extend_from_slice(&unit.max_locals.to_le_bytes());
    out.extend_from_slice(&unit.max_stack.to_le_bytes());

    put_len_u16(&mut out, "pool", unit.pool.len())?;
    for value in &unit.pool {
        put_len_u16(&mut out, "pool entry", value.len())?;
        out.extend_from_slice(value.as_bytes());
    }

    let insn_count = u32::try_from(unit.code.len()).map_err(|_| UnitError::TooLarge {
        what: "instruction list",
        len: unit.code.len(),
    })?;
    out.extend_from_slice(&insn_count.to_le_bytes());
    for insn in &unit.code {
        encode_insn(&mut out, insn)?;
    }

    put_len_u16(&mut out, "handler table", unit.handlers.len())?;
    for handler in &unit.handlers {
        out.extend_from_slice(&handler.start.to_le_bytes());
        out.extend_from_slice(&handler.end.to_le_bytes());
        out.extend_from_slice(&handler.target.to_le_bytes());
    }
    Ok(out)
}

fn encode_insn(out: &mut Vec<u8>, insn: &Insn) -> Result<(), UnitError> {
    match insn {
        Insn::Nop => out.push(NOP),
        Insn::Const(value) => {
            out.push(CONST);
            out.extend_from_slice(&value.to_le_bytes());
        }
        Insn::Load(slot) => put_u16_op(out, LOAD, *slot),
        Insn::Store(slot) => put_u16_op(out, STORE, *slot),
        Insn::Binary(op) => out.push(op.opcode()),
        Insn::Neg => out.push(NEG),
        Insn::Pop => out.push(POP),
        Insn::Dup => out.push(DUP),
        Insn::Swap => out.push(SWAP),
        Insn::Goto(target) => {
            out.push(GOTO);
            out.extend_from_slice(&target.to_le_bytes());
        }
        Insn::Branch { cond, target } => {
            out.push(cond.opcode());
            out.extend_from_slice(&target.to_le_bytes());
        }
        Insn::Switch { default, cases } => {
            out.push(SWITCH);
            out.extend_from_slice(&default.to_le_bytes());
            put_len_u16(out, "switch table", cases.len())?;
            for (key, target) in cases {
                out.extend_from_slice(&key.to_le_bytes());
                out.extend_from_slice(&target.to_le_bytes());
            }
        }
        Insn::Invoke { kind, method, argc } => {
            put_u16_op(out, kind.opcode(), *method);
            out.push(*argc);
        }
        Insn::MonitorEnter => out.push(MONITOR_ENTER),
        Insn::MonitorExit => out.push(MONITOR_EXIT),
        Insn::LdcStr(index) => put_u16_op(out, LDC_STR, *index),
        Insn::Concat => out.push(CONCAT),
        Insn::GetField(index) => put_u16_op(out, GET_FIELD, *index),
        Insn::PutField(index) => put_u16_op(out, PUT_FIELD, *index),
        Insn::Throw => out.push(THROW),
        Insn::Return => out.push(RETURN),
        Insn::ReturnVoid => out.push(RETURN_VOID),
    }
    Ok(())
}

fn put_u16_op(out: &mut Vec<u8>, opcode: u8, operand: u16) {
    out.push(opcode);
    out.extend_from_slice(&operand.to_le_bytes());
}

fn put_len_u16(out: &mut Vec<u8>, what: &'static str, len: usize) -> Result<(), UnitError> {
    let len16 = u16::try_from(len).map_err(|_| UnitError::TooLarge { what, len })?;
    out.extend_from_slice(&len16.to_le_bytes());
    Ok(())
}

/// Bounds-checked cursor over a byte slice.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    pub(crate) pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8], UnitError> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.bytes.len());
        let Some(end) = end else {
            return Err(UnitError::Truncated {
                offset: self.pos,
                needed: len.saturating_sub(self.remaining()),
            });
        };
        let slice = self.bytes.get(self.pos..end).ok_or(UnitError::Truncated {
            offset: self.pos,
            needed: len,
        })?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], UnitError> {
        let slice = self.take(N)?;
        let mut buf = [0u8; N];
        buf.copy_from_slice(slice);
        Ok(buf)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, UnitError> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, UnitError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, UnitError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, UnitError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub(crate) fn i64(&mut self) -> Result<i64, UnitError> {
        Ok(i64::from_le_bytes(self.array()?))
    }
}
