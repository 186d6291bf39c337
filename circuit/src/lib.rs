//! Bytecode to sea-of-nodes translation.
//!
//! [`CircuitBuilder::translate`] splits a method into basic blocks, computes
//! dominators, dominance frontiers and phi placement, and lowers the result
//! into a [`Circuit`] of state, depend and value gates.

mod builder;
mod error;
mod gate;
mod graph;
mod lower;
pub mod samples;

pub use builder::{CircuitBuilder, Translation};
pub use error::TranslateError;
pub use gate::{CONSTANT_UNDEFINED, Circuit, Gate, GateRef, InputLayout, OpCode, VerifyError};
pub use graph::{
    BasicBlock, BlockId, BytecodeGraph, CfgInfo, DecodedInstruction, ExceptionRange, SplitKind,
};
