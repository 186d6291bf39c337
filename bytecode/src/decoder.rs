use core::fmt;

use crate::instruction::Instruction;
use crate::op::Op;

/// Malformed bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The byte at `offset` is not an opcode.
    UnknownOpcode { offset: usize, byte: u8 },
    /// The instruction at `offset` runs past the end of the stream.
    Truncated { offset: usize },
    /// `Wide` prefixes an opcode without register operands.
    InvalidPrefix { offset: usize, op: Op },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOpcode { offset, byte } => {
                write!(f, "unknown opcode 0x{byte:02x} at {offset}")
            }
            Self::Truncated { offset } => {
                write!(f, "truncated instruction at {offset}")
            }
            Self::InvalidPrefix { offset, op } => {
                write!(f, "Wide prefix before {op:?} at {offset}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decodes a bytecode byte slice into [`Instruction`]s.
///
/// Every read is bounds checked, so arbitrary bytes may be fed in; the first
/// malformed instruction yields an error and ends the stream.
pub struct BytecodeDecoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    start: usize,
    failed: bool,
}

impl<'a> BytecodeDecoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            start: 0,
            failed: false,
        }
    }

    /// Current byte offset in the stream.
    #[inline(always)]
    pub fn offset(&self) -> usize {
        self.pos
    }

    /// Whether the decoder has reached the end of the bytecode.
    #[inline(always)]
    pub fn is_at_end(&self) -> bool {
        self.failed || self.pos >= self.bytes.len()
    }

    /// Decode the next instruction, or `None` at end-of-stream.
    pub fn decode_next(&mut self) -> Option<Result<Instruction, DecodeError>> {
        if self.is_at_end() {
            return None;
        }
        self.start = self.pos;
        let result = self.decode();
        if result.is_err() {
            self.failed = true;
        }
        Some(result)
    }

    /// Like [`decode_next`](Self::decode_next), but also reports the byte
    /// offset and encoded length of the instruction.
    pub fn decode_with_offset(&mut self) -> Option<Result<(usize, usize, Instruction), DecodeError>> {
        let start = self.pos;
        let inst = self.decode_next()?;
        Some(inst.map(|inst| (start, self.pos - start, inst)))
    }

    fn decode(&mut self) -> Result<Instruction, DecodeError> {
        let op = self.read_op()?;
        if op != Op::Wide {
            return self.decode_op(op, false);
        }
        let next = self.read_op()?;
        if !next.has_scalable_operands() {
            return Err(DecodeError::InvalidPrefix {
                offset: self.start,
                op: next,
            });
        }
        self.decode_op(next, true)
    }

    fn decode_op(&mut self, op: Op, wide: bool) -> Result<Instruction, DecodeError> {
        let inst = match op {
            Op::Wide => {
                return Err(DecodeError::InvalidPrefix {
                    offset: self.start,
                    op,
                });
            }
            Op::LoadConstant => Instruction::LoadConstant {
                idx: self.read_u16()?,
            },
            Op::LoadSmi => Instruction::LoadSmi {
                value: self.read_u32()? as i32,
            },
            Op::LoadUndefined => Instruction::LoadUndefined,
            Op::LoadReg => Instruction::LoadReg {
                reg: self.read_reg(wide)?,
            },
            Op::StoreReg => Instruction::StoreReg {
                reg: self.read_reg(wide)?,
            },
            Op::Mov => {
                let dst = self.read_reg(wide)?;
                let src = self.read_reg(wide)?;
                Instruction::Mov { dst, src }
            }
            Op::Add => Instruction::Add {
                reg: self.read_reg(wide)?,
            },
            Op::Sub => Instruction::Sub {
                reg: self.read_reg(wide)?,
            },
            Op::Less => Instruction::Less {
                reg: self.read_reg(wide)?,
            },
            Op::Equal => Instruction::Equal {
                reg: self.read_reg(wide)?,
            },
            Op::Send => {
                let message_idx = self.read_u16()?;
                let reg = self.read_reg(wide)?;
                let argc = self.read_u8()?;
                Instruction::Send {
                    message_idx,
                    reg,
                    argc,
                }
            }
            Op::CreateObject => {
                let shape_idx = self.read_u16()?;
                let values_reg = self.read_reg(wide)?;
                let count = self.read_u8()?;
                Instruction::CreateObject {
                    shape_idx,
                    values_reg,
                    count,
                }
            }
            Op::Jump => Instruction::Jump {
                offset: self.read_u16()? as i16,
            },
            Op::JumpIfTrue => Instruction::JumpIfTrue {
                offset: self.read_u16()? as i16,
            },
            Op::JumpIfFalse => Instruction::JumpIfFalse {
                offset: self.read_u16()? as i16,
            },
            Op::Return => Instruction::Return,
            Op::ReturnUndefined => Instruction::ReturnUndefined,
            Op::Throw => Instruction::Throw,
        };
        Ok(inst)
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let truncated = DecodeError::Truncated { offset: self.start };
        let bytes = self
            .bytes
            .get(self.pos..self.pos + N)
            .ok_or(truncated)?;
        self.pos += N;
        bytes.try_into().map_err(|_| truncated)
    }

    fn read_op(&mut self) -> Result<Op, DecodeError> {
        let offset = self.pos;
        let byte = self.read_u8()?;
        Op::try_from(byte).map_err(|byte| DecodeError::UnknownOpcode { offset, byte })
    }

    #[inline(always)]
    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take::<1>()?[0])
    }

    #[inline(always)]
    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    #[inline(always)]
    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    #[inline(always)]
    fn read_reg(&mut self, wide: bool) -> Result<u16, DecodeError> {
        if wide {
            self.read_u16()
        } else {
            self.read_u8().map(u16::from)
        }
    }
}

impl<'a> Iterator for BytecodeDecoder<'a> {
    type Item = Result<Instruction, DecodeError>;

    #[inline(always)]
    fn next(&mut self) -> Option<Self::Item> {
        self.decode_next()
    }
}
