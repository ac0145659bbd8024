use crate::instruction::Instruction;
use crate::op::Op;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid opcode {opcode:#04x} at offset {offset}")]
    InvalidOpcode { opcode: u8, offset: usize },
    #[error("instruction at offset {offset} is truncated")]
    Truncated { offset: usize },
}

/// Decode the single instruction at the start of `bytes`, returning it with
/// its encoded length.
pub fn decode(bytes: &[u8]) -> Result<(Instruction, usize), DecodeError> {
    let mut decoder = BytecodeDecoder::new(bytes);
    match decoder.decode_next()? {
        Some(insn) => Ok((insn, decoder.offset())),
        None => Err(DecodeError::Truncated { offset: 0 }),
    }
}

/// Decodes a bytecode byte slice into [`Instruction`]s.
///
/// Bytecode comes from an untrusted image, so every read is bounds checked
/// and unknown opcodes are reported rather than assumed away.
pub struct BytecodeDecoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BytecodeDecoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Current byte offset in the stream.
    #[inline(always)]
    pub fn offset(&self) -> usize {
        self.pos
    }

    #[inline(always)]
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Decode the next instruction, or `None` at end-of-stream.
    pub fn decode_next(&mut self) -> Result<Option<Instruction>, DecodeError> {
        if self.is_at_end() {
            return Ok(None);
        }
        let start = self.pos;
        let byte = self.read_u8(start)?;
        let op = Op::try_from(byte).map_err(|opcode| DecodeError::InvalidOpcode {
            opcode,
            offset: start,
        })?;
        if self.bytes.len() - self.pos < op.operand_len() {
            return Err(DecodeError::Truncated { offset: start });
        }
        Ok(Some(self.decode_op(op, start)?))
    }

    fn decode_op(&mut self, op: Op, at: usize) -> Result<Instruction, DecodeError> {
        Ok(match op {
            Op::Nop => Instruction::Nop,
            Op::PushNil => Instruction::PushNil,
            Op::PushTrue => Instruction::PushTrue,
            Op::PushInt8 => Instruction::PushInt {
                value: self.read_u8(at)? as i8 as i32,
            },
            Op::PushInt => Instruction::PushInt {
                value: self.read_u32(at)? as i32,
            },
            Op::PushStr => Instruction::PushStr {
                ofs: self.read_u32(at)?,
            },
            Op::PushList => Instruction::PushList {
                ofs: self.read_u32(at)?,
            },
            Op::PushObj => Instruction::PushObj {
                id: self.read_u32(at)?,
            },
            Op::PushProp => Instruction::PushProp {
                prop: self.read_u16(at)?,
            },
            Op::PushFnPtr => Instruction::PushFnPtr {
                ofs: self.read_u32(at)?,
            },
            Op::PushSelf => Instruction::PushSelf,
            Op::GetArg => Instruction::GetArg {
                idx: self.read_u8(at)?,
            },
            Op::GetLocal => Instruction::GetLocal {
                idx: self.read_u16(at)?,
            },
            Op::SetLocal => Instruction::SetLocal {
                idx: self.read_u16(at)?,
            },
            Op::GetGlobal => Instruction::GetGlobal {
                idx: self.read_u16(at)?,
            },
            Op::SetGlobal => Instruction::SetGlobal {
                idx: self.read_u16(at)?,
            },
            Op::Dup => Instruction::Dup,
            Op::Discard => Instruction::Discard,
            Op::Swap => Instruction::Swap,
            Op::Add => Instruction::Add,
            Op::Sub => Instruction::Sub,
            Op::Mul => Instruction::Mul,
            Op::Div => Instruction::Div,
            Op::Mod => Instruction::Mod,
            Op::Neg => Instruction::Neg,
            Op::Not => Instruction::Not,
            Op::Eq => Instruction::Eq,
            Op::Ne => Instruction::Ne,
            Op::Lt => Instruction::Lt,
            Op::Le => Instruction::Le,
            Op::Gt => Instruction::Gt,
            Op::Ge => Instruction::Ge,
            Op::Jmp => Instruction::Jmp {
                offset: self.read_u16(at)? as i16,
            },
            Op::Jt => Instruction::Jt {
                offset: self.read_u16(at)? as i16,
            },
            Op::Jf => Instruction::Jf {
                offset: self.read_u16(at)? as i16,
            },
            Op::GetProp => Instruction::GetProp {
                prop: self.read_u16(at)?,
            },
            Op::GetPropSelf => Instruction::GetPropSelf {
                prop: self.read_u16(at)?,
            },
            Op::SetProp => Instruction::SetProp {
                prop: self.read_u16(at)?,
            },
            Op::SetPropSelf => Instruction::SetPropSelf {
                prop: self.read_u16(at)?,
            },
            Op::CallProp => {
                let argc = self.read_u8(at)?;
                let prop = self.read_u16(at)?;
                Instruction::CallProp { argc, prop }
            }
            Op::CallPropSelf => {
                let argc = self.read_u8(at)?;
                let prop = self.read_u16(at)?;
                Instruction::CallPropSelf { argc, prop }
            }
            Op::Inherited => {
                let argc = self.read_u8(at)?;
                let prop = self.read_u16(at)?;
                Instruction::Inherited { argc, prop }
            }
            Op::Call => {
                let argc = self.read_u8(at)?;
                let ofs = self.read_u32(at)?;
                Instruction::Call { argc, ofs }
            }
            Op::PtrCall => Instruction::PtrCall {
                argc: self.read_u8(at)?,
            },
            Op::Builtin => {
                let argc = self.read_u8(at)?;
                let func = self.read_u16(at)?;
                let set = self.read_u8(at)?;
                Instruction::Builtin { argc, func, set }
            }
            Op::New => {
                let argc = self.read_u8(at)?;
                let meta = self.read_u16(at)?;
                Instruction::New { argc, meta }
            }
            Op::Index => Instruction::Index,
            Op::SetIndex => Instruction::SetIndex,
            Op::Return => Instruction::Return,
            Op::RetNil => Instruction::RetNil,
            Op::RetTrue => Instruction::RetTrue,
            Op::Throw => Instruction::Throw,
        })
    }

    // ── read helpers ───────────────────────────────────────────────

    fn take<const N: usize>(&mut self, at: usize) -> Result<[u8; N], DecodeError> {
        let bytes = self
            .bytes
            .get(self.pos..self.pos + N)
            .ok_or(DecodeError::Truncated { offset: at })?;
        self.pos += N;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    #[inline(always)]
    fn read_u8(&mut self, at: usize) -> Result<u8, DecodeError> {
        Ok(self.take::<1>(at)?[0])
    }

    #[inline(always)]
    fn read_u16(&mut self, at: usize) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take(at)?))
    }

    #[inline(always)]
    fn read_u32(&mut self, at: usize) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take(at)?))
    }
}

impl Iterator for BytecodeDecoder<'_> {
    type Item = Result<Instruction, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.decode_next() {
            Ok(Some(insn)) => Some(Ok(insn)),
            Ok(None) => None,
            Err(e) => {
                // Stop after the first error.
                self.pos = self.bytes.len();
                Some(Err(e))
            }
        }
    }
}
