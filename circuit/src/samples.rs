//! Small hand-assembled methods covering the common control flow shapes.

use bytecode::{BytecodeBuilder, MethodInfo};

pub const NAMES: [&str; 4] = ["diamond", "loop", "switch", "try-catch"];

pub fn by_name(name: &str) -> Option<MethodInfo> {
    match name {
        "diamond" => Some(diamond()),
        "loop" => Some(counting_loop()),
        "switch" => Some(switch()),
        "try-catch" => Some(try_catch()),
        _ => None,
    }
}

/// `r0 = if a0 { 1 } else { 2 }; return r0`
pub fn diamond() -> MethodInfo {
    let mut b = BytecodeBuilder::new();
    b.load_reg(1);
    let else_ = b.jump_if_false();
    b.load_smi(1);
    b.store_reg(0);
    let join = b.jump();
    b.bind(else_);
    b.load_smi(2);
    b.store_reg(0);
    b.bind(join);
    b.load_reg(0);
    b.return_();
    MethodInfo::new("diamond", b.into_bytes(), 1, 1)
}

/// `r0 = 0; while r0 < a0 { r0 = r0 + 1 }; return r0`
pub fn counting_loop() -> MethodInfo {
    let mut b = BytecodeBuilder::new();
    b.load_smi(0);
    b.store_reg(0);
    let head = b.current_offset();
    b.load_reg(0);
    b.less(1);
    let exit = b.jump_if_false();
    b.load_smi(1);
    b.add(0);
    b.store_reg(0);
    b.jump_back(head);
    b.bind(exit);
    b.load_reg(0);
    b.return_();
    MethodInfo::new("loop", b.into_bytes(), 1, 1)
}

/// Three-way dispatch on `a0` as a chain of two equality tests, joining
/// with the chosen value in the accumulator.
pub fn switch() -> MethodInfo {
    let mut b = BytecodeBuilder::new();
    b.load_smi(0);
    b.equal(0);
    let case0 = b.jump_if_true();
    b.load_smi(1);
    b.equal(0);
    let case1 = b.jump_if_true();
    b.load_smi(30);
    let join_default = b.jump();
    b.bind(case0);
    b.load_smi(10);
    let join_case0 = b.jump();
    b.bind(case1);
    b.load_smi(20);
    b.bind(join_default);
    b.bind(join_case0);
    b.return_();
    MethodInfo::new("switch", b.into_bytes(), 0, 1)
}

/// A send protected by a handler that returns the exception.
pub fn try_catch() -> MethodInfo {
    let mut b = BytecodeBuilder::new();
    b.load_reg(1);
    let try_start = b.current_offset() as u32;
    b.send(0, 1, 0);
    let try_end = b.current_offset() as u32;
    b.return_();
    let handler = b.current_offset() as u32;
    b.store_reg(0);
    b.load_reg(0);
    b.return_();
    MethodInfo::new("try-catch", b.into_bytes(), 1, 1).with_try_block(try_start, try_end, vec![handler])
}
