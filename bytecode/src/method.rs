/// A protected range `[start, end)` of byte offsets and the handler entry
/// offsets it transfers to when an instruction inside it throws.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TryBlock {
    pub start: u32,
    pub end: u32,
    pub handlers: Vec<u32>,
}

/// A compiled method body.
///
/// Registers `0..num_vregs` are locals; the `num_args` arguments live in
/// the registers right after them.
#[derive(Debug, Clone, Default)]
pub struct MethodInfo {
    pub name: String,
    pub bytecode: Vec<u8>,
    pub num_vregs: u16,
    pub num_args: u16,
    pub try_blocks: Vec<TryBlock>,
}

impl MethodInfo {
    pub fn new(name: impl Into<String>, bytecode: Vec<u8>, num_vregs: u16, num_args: u16) -> Self {
        Self {
            name: name.into(),
            bytecode,
            num_vregs,
            num_args,
            try_blocks: Vec::new(),
        }
    }

    pub fn with_try_block(mut self, start: u32, end: u32, handlers: Vec<u32>) -> Self {
        self.try_blocks.push(TryBlock {
            start,
            end,
            handlers,
        });
        self
    }

    /// Total number of addressable registers.
    pub fn register_count(&self) -> u32 {
        self.num_vregs as u32 + self.num_args as u32
    }

    /// Register holding argument `index`.
    pub fn arg_register(&self, index: u16) -> u16 {
        self.num_vregs + index
    }
}
