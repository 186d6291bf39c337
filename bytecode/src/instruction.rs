use core::fmt;

use crate::op::Op;

/// A decoded instruction with all operands resolved to their widest types.
///
/// Register operands are always `u16` regardless of whether the instruction
/// was encoded in narrow or wide form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    LoadConstant {
        idx: u16,
    },
    LoadSmi {
        value: i32,
    },
    LoadUndefined,
    LoadReg {
        reg: u16,
    },
    StoreReg {
        reg: u16,
    },
    Mov {
        dst: u16,
        src: u16,
    },
    Add {
        reg: u16,
    },
    Sub {
        reg: u16,
    },
    Less {
        reg: u16,
    },
    Equal {
        reg: u16,
    },
    Send {
        message_idx: u16,
        reg: u16,
        argc: u8,
    },
    CreateObject {
        shape_idx: u16,
        values_reg: u16,
        count: u8,
    },
    Jump {
        offset: i16,
    },
    JumpIfTrue {
        offset: i16,
    },
    JumpIfFalse {
        offset: i16,
    },
    Return,
    ReturnUndefined,
    Throw,
}

/// How an instruction takes part in control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionKind {
    /// May throw; control continues with the next instruction otherwise.
    General,
    /// Cannot throw and produces a value.
    NoThrow,
    /// Only copies a value between the accumulator and registers.
    Mov,
    Jump,
    ConditionalJump,
    Return,
    ReturnUndefined,
    Throw,
}

impl InstructionKind {
    /// Whether the instruction can transfer control to an exception handler.
    pub const fn may_throw(self) -> bool {
        matches!(self, Self::General | Self::Throw)
    }
}

/// Data flow summary of one instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionInfo {
    pub acc_in: bool,
    pub acc_out: bool,
    pub vregs_in: Vec<u16>,
    pub vregs_out: Vec<u16>,
    pub kind: InstructionKind,
}

impl InstructionInfo {
    fn new(kind: InstructionKind) -> Self {
        Self {
            acc_in: false,
            acc_out: false,
            vregs_in: Vec::new(),
            vregs_out: Vec::new(),
            kind,
        }
    }

    fn acc_in(mut self) -> Self {
        self.acc_in = true;
        self
    }

    fn acc_out(mut self) -> Self {
        self.acc_out = true;
        self
    }

    fn reads(mut self, regs: impl IntoIterator<Item = u16>) -> Self {
        self.vregs_in.extend(regs);
        self
    }

    fn writes(mut self, reg: u16) -> Self {
        self.vregs_out.push(reg);
        self
    }

    /// Number of value inputs a gate for this instruction takes.
    pub fn value_count(&self) -> usize {
        self.vregs_in.len() + usize::from(self.acc_in)
    }
}

impl Instruction {
    pub fn op(&self) -> Op {
        match self {
            Self::LoadConstant { .. } => Op::LoadConstant,
            Self::LoadSmi { .. } => Op::LoadSmi,
            Self::LoadUndefined => Op::LoadUndefined,
            Self::LoadReg { .. } => Op::LoadReg,
            Self::StoreReg { .. } => Op::StoreReg,
            Self::Mov { .. } => Op::Mov,
            Self::Add { .. } => Op::Add,
            Self::Sub { .. } => Op::Sub,
            Self::Less { .. } => Op::Less,
            Self::Equal { .. } => Op::Equal,
            Self::Send { .. } => Op::Send,
            Self::CreateObject { .. } => Op::CreateObject,
            Self::Jump { .. } => Op::Jump,
            Self::JumpIfTrue { .. } => Op::JumpIfTrue,
            Self::JumpIfFalse { .. } => Op::JumpIfFalse,
            Self::Return => Op::Return,
            Self::ReturnUndefined => Op::ReturnUndefined,
            Self::Throw => Op::Throw,
        }
    }

    /// Relative jump offset, if this is a jump.
    pub fn jump_offset(&self) -> Option<i16> {
        match *self {
            Self::Jump { offset }
            | Self::JumpIfTrue { offset }
            | Self::JumpIfFalse { offset } => Some(offset),
            _ => None,
        }
    }

    pub fn info(&self) -> InstructionInfo {
        use InstructionKind as K;
        match *self {
            Self::LoadConstant { .. } | Self::LoadSmi { .. } | Self::LoadUndefined => {
                InstructionInfo::new(K::NoThrow).acc_out()
            }
            Self::LoadReg { reg } => InstructionInfo::new(K::Mov).acc_out().reads([reg]),
            Self::StoreReg { reg } => InstructionInfo::new(K::Mov).acc_in().writes(reg),
            Self::Mov { dst, src } => InstructionInfo::new(K::Mov).reads([src]).writes(dst),
            Self::Add { reg } | Self::Sub { reg } | Self::Less { reg } | Self::Equal { reg } => {
                InstructionInfo::new(K::General).acc_in().acc_out().reads([reg])
            }
            Self::Send { reg, argc, .. } => InstructionInfo::new(K::General)
                .acc_out()
                .reads(reg..=reg.saturating_add(argc as u16)),
            Self::CreateObject {
                values_reg, count, ..
            } => InstructionInfo::new(K::General)
                .acc_out()
                .reads(values_reg..values_reg.saturating_add(count as u16)),
            Self::Jump { .. } => InstructionInfo::new(K::Jump),
            Self::JumpIfTrue { .. } | Self::JumpIfFalse { .. } => {
                InstructionInfo::new(K::ConditionalJump).acc_in()
            }
            Self::Return => InstructionInfo::new(K::Return).acc_in(),
            Self::ReturnUndefined => InstructionInfo::new(K::ReturnUndefined),
            Self::Throw => InstructionInfo::new(K::Throw).acc_in(),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoadConstant { idx } => write!(f, "LoadConstant #{idx}"),
            Self::LoadSmi { value } => write!(f, "LoadSmi {value}"),
            Self::LoadUndefined => write!(f, "LoadUndefined"),
            Self::LoadReg { reg } => write!(f, "LoadReg r{reg}"),
            Self::StoreReg { reg } => write!(f, "StoreReg r{reg}"),
            Self::Mov { dst, src } => write!(f, "Mov r{dst} r{src}"),
            Self::Add { reg } => write!(f, "Add r{reg}"),
            Self::Sub { reg } => write!(f, "Sub r{reg}"),
            Self::Less { reg } => write!(f, "Less r{reg}"),
            Self::Equal { reg } => write!(f, "Equal r{reg}"),
            Self::Send {
                message_idx,
                reg,
                argc,
            } => write!(f, "Send #{message_idx} r{reg} {argc}"),
            Self::CreateObject {
                shape_idx,
                values_reg,
                count,
            } => write!(f, "CreateObject #{shape_idx} r{values_reg} {count}"),
            Self::Jump { offset } => write!(f, "Jump {offset:+}"),
            Self::JumpIfTrue { offset } => write!(f, "JumpIfTrue {offset:+}"),
            Self::JumpIfFalse { offset } => write!(f, "JumpIfFalse {offset:+}"),
            Self::Return => write!(f, "Return"),
            Self::ReturnUndefined => write!(f, "ReturnUndefined"),
            Self::Throw => write!(f, "Throw"),
        }
    }
}
