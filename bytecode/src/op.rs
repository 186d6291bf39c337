/// Bytecode opcodes.
///
/// Register operands are 8-bit by default. The [`Wide`](Op::Wide) prefix
/// promotes register operands to 16-bit. Constant pool indices are always
/// 16-bit, small integers 32-bit and jump offsets 16-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    /// Prefix: the next instruction uses 16-bit register operands.
    Wide = 0x00,

    /// Load a constant pool entry into the accumulator.
    /// Operands: `idx:u16`
    LoadConstant,

    /// Load a small integer literal into the accumulator.
    /// Operands: `value:i32`
    LoadSmi,

    /// Load `undefined` into the accumulator.
    LoadUndefined,

    /// Load a register into the accumulator.
    /// Operands: `reg:u8` (wide: `u16`)
    LoadReg,

    /// Store the accumulator into a register.
    /// Operands: `reg:u8` (wide: `u16`)
    StoreReg,

    /// Move between registers (does not touch the accumulator).
    /// Operands: `dst:u8` (wide: `u16`), `src:u8` (wide: `u16`)
    Mov,

    /// `acc = reg + acc`.
    /// Operands: `reg:u8` (wide: `u16`)
    Add,

    /// `acc = reg - acc`.
    /// Operands: `reg:u8` (wide: `u16`)
    Sub,

    /// `acc = reg < acc`.
    /// Operands: `reg:u8` (wide: `u16`)
    Less,

    /// `acc = reg == acc`.
    /// Operands: `reg:u8` (wide: `u16`)
    Equal,

    /// Send a message. The receiver is in `reg`, arguments follow it.
    /// Operands: `message_idx:u16`, `reg:u8` (wide: `u16`), `argc:u8`
    Send,

    /// Create an object from a shape and a range of value registers.
    /// Operands: `shape_idx:u16`, `values_reg:u8` (wide: `u16`), `count:u8`
    CreateObject,

    /// Unconditional relative jump.
    /// Operands: `offset:i16` (relative to end of instruction)
    Jump,

    /// Jump if the accumulator is truthy.
    /// Operands: `offset:i16`
    JumpIfTrue,

    /// Jump if the accumulator is falsy.
    /// Operands: `offset:i16`
    JumpIfFalse,

    /// Return the accumulator.
    Return,

    /// Return `undefined`.
    ReturnUndefined,

    /// Throw the accumulator.
    Throw,
}

impl Op {
    pub const COUNT: usize = Op::Throw as usize + 1;

    /// Convert a raw byte to an opcode without a bounds check.
    ///
    /// # Safety
    ///
    /// `byte` must be a valid opcode value (`< Op::COUNT`).
    #[inline(always)]
    pub unsafe fn from_u8_unchecked(byte: u8) -> Self {
        debug_assert!(
            (byte as usize) < Self::COUNT,
            "invalid opcode: 0x{byte:02x}"
        );
        unsafe { core::mem::transmute::<u8, Op>(byte) }
    }

    /// Whether this opcode has register operands affected by the `Wide`
    /// prefix.
    pub const fn has_scalable_operands(self) -> bool {
        matches!(
            self,
            Op::LoadReg
                | Op::StoreReg
                | Op::Mov
                | Op::Add
                | Op::Sub
                | Op::Less
                | Op::Equal
                | Op::Send
                | Op::CreateObject
        )
    }

    /// Whether this opcode ends a basic block.
    pub const fn is_terminator(self) -> bool {
        matches!(
            self,
            Op::Jump
                | Op::JumpIfTrue
                | Op::JumpIfFalse
                | Op::Return
                | Op::ReturnUndefined
                | Op::Throw
        )
    }
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if byte < Self::COUNT as u8 {
            // SAFETY: Op is repr(u8) with contiguous variants starting at 0.
            Ok(unsafe { core::mem::transmute::<u8, Op>(byte) })
        } else {
            Err(byte)
        }
    }
}
