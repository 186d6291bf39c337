use crate::op::Op;

/// Pending forward jump, patched by [`BytecodeBuilder::bind`].
#[derive(Debug)]
#[must_use = "an unbound label leaves a zero jump offset"]
pub struct Label {
    patch_at: usize,
    /// End of the jump; offsets count from here.
    base: usize,
}

/// Assembles method bytecode. Registers above `u8::MAX` get a `Wide`
/// prefix on their instruction.
#[derive(Debug)]
pub struct BytecodeBuilder {
    code: Vec<u8>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self { code: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
        }
    }

    /// Offset of the next instruction; the target for `jump_back*`.
    pub fn current_offset(&self) -> usize {
        self.code.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.code
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.code
    }

    // ── encoding ───────────────────────────────────────────────────

    fn byte(&mut self, byte: u8) {
        self.code.push(byte);
    }

    fn bytes<const N: usize>(&mut self, bytes: [u8; N]) {
        self.code.extend_from_slice(&bytes);
    }

    fn opcode(&mut self, op: Op) {
        self.byte(op as u8);
    }

    /// Emits the opcode, preceded by `Wide` when any register needs it.
    /// Returns whether registers are encoded wide.
    fn scaled_opcode(&mut self, op: Op, regs: &[u16]) -> bool {
        let wide = regs.iter().any(|&reg| reg > u8::MAX as u16);
        if wide {
            self.opcode(Op::Wide);
        }
        self.opcode(op);
        wide
    }

    fn reg(&mut self, reg: u16, wide: bool) {
        if wide {
            self.bytes(reg.to_le_bytes());
        } else {
            self.byte(reg as u8);
        }
    }

    fn single_reg(&mut self, op: Op, reg: u16) {
        let wide = self.scaled_opcode(op, &[reg]);
        self.reg(reg, wide);
    }

    // ── instructions ───────────────────────────────────────────────

    pub fn load_constant(&mut self, index: u16) {
        self.opcode(Op::LoadConstant);
        self.bytes(index.to_le_bytes());
    }

    pub fn load_smi(&mut self, value: i32) {
        self.opcode(Op::LoadSmi);
        self.bytes(value.to_le_bytes());
    }

    pub fn load_undefined(&mut self) {
        self.opcode(Op::LoadUndefined);
    }

    pub fn load_reg(&mut self, reg: u16) {
        self.single_reg(Op::LoadReg, reg);
    }

    pub fn store_reg(&mut self, reg: u16) {
        self.single_reg(Op::StoreReg, reg);
    }

    pub fn mov(&mut self, dst: u16, src: u16) {
        let wide = self.scaled_opcode(Op::Mov, &[dst, src]);
        self.reg(dst, wide);
        self.reg(src, wide);
    }

    pub fn add(&mut self, reg: u16) {
        self.single_reg(Op::Add, reg);
    }

    pub fn sub(&mut self, reg: u16) {
        self.single_reg(Op::Sub, reg);
    }

    pub fn less(&mut self, reg: u16) {
        self.single_reg(Op::Less, reg);
    }

    pub fn equal(&mut self, reg: u16) {
        self.single_reg(Op::Equal, reg);
    }

    /// Receiver in `reg`, arguments in the `argc` registers after it.
    pub fn send(&mut self, message: u16, reg: u16, argc: u8) {
        let wide = self.scaled_opcode(Op::Send, &[reg]);
        self.bytes(message.to_le_bytes());
        self.reg(reg, wide);
        self.byte(argc);
    }

    /// Builds an object of `shape` from `count` consecutive registers.
    pub fn create_object(&mut self, shape: u16, values_reg: u16, count: u8) {
        let wide = self.scaled_opcode(Op::CreateObject, &[values_reg]);
        self.bytes(shape.to_le_bytes());
        self.reg(values_reg, wide);
        self.byte(count);
    }

    pub fn return_(&mut self) {
        self.opcode(Op::Return);
    }

    pub fn return_undefined(&mut self) {
        self.opcode(Op::ReturnUndefined);
    }

    pub fn throw(&mut self) {
        self.opcode(Op::Throw);
    }

    // ── jumps ──────────────────────────────────────────────────────

    pub fn jump(&mut self) -> Label {
        self.forward_jump(Op::Jump)
    }

    pub fn jump_if_true(&mut self) -> Label {
        self.forward_jump(Op::JumpIfTrue)
    }

    /// Taken when the accumulator is falsy.
    pub fn jump_if_false(&mut self) -> Label {
        self.forward_jump(Op::JumpIfFalse)
    }

    /// Points `label` at the next instruction.
    pub fn bind(&mut self, label: Label) {
        let offset = relative_offset(label.base, self.code.len());
        self.code[label.patch_at..label.patch_at + 2].copy_from_slice(&offset.to_le_bytes());
    }

    /// `target` must come from an earlier [`current_offset`](Self::current_offset).
    pub fn jump_back(&mut self, target: usize) {
        self.backward_jump(Op::Jump, target);
    }

    pub fn jump_back_if_true(&mut self, target: usize) {
        self.backward_jump(Op::JumpIfTrue, target);
    }

    pub fn jump_back_if_false(&mut self, target: usize) {
        self.backward_jump(Op::JumpIfFalse, target);
    }

    fn backward_jump(&mut self, op: Op, target: usize) {
        self.opcode(op);
        let offset = relative_offset(self.code.len() + 2, target);
        self.bytes(offset.to_le_bytes());
    }

    fn forward_jump(&mut self, op: Op) -> Label {
        self.opcode(op);
        let patch_at = self.code.len();
        self.bytes([0, 0]);
        Label {
            patch_at,
            base: self.code.len(),
        }
    }
}

fn relative_offset(base: usize, target: usize) -> i16 {
    let offset = target as isize - base as isize;
    debug_assert!(i16::try_from(offset).is_ok(), "jump offset {offset} out of range");
    offset as i16
}

impl Default for BytecodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
