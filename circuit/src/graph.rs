//! Basic blocks of one method.

use std::collections::BTreeSet;
use std::ops::Range;

use bytecode::{Instruction, InstructionInfo};

pub type BlockId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SplitKind {
    Start,
    End,
}

/// A block boundary: the instruction at `offset` starts or ends a block.
/// Ends list the start offsets of their successors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfgInfo {
    pub offset: u32,
    pub kind: SplitKind,
    pub succs: Vec<u32>,
}

impl CfgInfo {
    pub fn start(offset: u32) -> Self {
        Self {
            offset,
            kind: SplitKind::Start,
            succs: Vec::new(),
        }
    }

    pub fn end(offset: u32, succs: Vec<u32>) -> Self {
        Self {
            offset,
            kind: SplitKind::End,
            succs,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecodedInstruction {
    pub offset: u32,
    pub len: u32,
    pub inst: Instruction,
    pub info: InstructionInfo,
}

impl DecodedInstruction {
    pub fn next_offset(&self) -> u32 {
        self.offset + self.len
    }

    /// Absolute target of a jump, which may lie outside the method.
    pub fn jump_target(&self) -> Option<i64> {
        self.inst
            .jump_offset()
            .map(|rel| self.next_offset() as i64 + rel as i64)
    }
}

/// A protected range with its handler entry offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionRange {
    pub start: u32,
    pub end: u32,
    pub handlers: Vec<u32>,
}

impl ExceptionRange {
    pub fn covers(&self, offset: u32) -> bool {
        (self.start..self.end).contains(&offset)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    pub id: BlockId,
    /// Offset of the first instruction.
    pub start: u32,
    /// Offset of the last instruction.
    pub end: u32,
    /// Indices into [`BytecodeGraph::insts`].
    pub insts: Range<usize>,
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
    /// Handlers of the try ranges covering this block, innermost first.
    pub catches: Vec<BlockId>,
    /// For handler blocks, the blocks whose exceptions land here.
    pub trys: Vec<BlockId>,
    pub idom: Option<BlockId>,
    pub dom_children: Vec<BlockId>,
    pub dom_frontiers: BTreeSet<BlockId>,
    /// Registers that need a phi at block entry.
    pub phis: BTreeSet<u16>,
    pub is_dead: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BytecodeGraph {
    pub insts: Vec<DecodedInstruction>,
    pub blocks: Vec<BasicBlock>,
    pub exceptions: Vec<ExceptionRange>,
}

impl BytecodeGraph {
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id]
    }

    pub fn instructions(&self, id: BlockId) -> &[DecodedInstruction] {
        &self.insts[self.blocks[id].insts.clone()]
    }

    pub fn live_blocks(&self) -> impl Iterator<Item = &BasicBlock> + '_ {
        self.blocks.iter().filter(|b| !b.is_dead)
    }

    /// The block whose first instruction is at `offset`.
    pub fn block_starting_at(&self, offset: u32) -> Option<BlockId> {
        self.blocks
            .binary_search_by_key(&offset, |b| b.start)
            .ok()
    }

    /// The block containing the instruction at `offset`.
    pub fn block_containing(&self, offset: u32) -> Option<BlockId> {
        let index = self.blocks.partition_point(|b| b.start <= offset);
        let id = index.checked_sub(1)?;
        (offset <= self.blocks[id].end).then_some(id)
    }

    /// Whether `a` dominates `b`. Every block dominates itself.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut cursor = Some(b);
        while let Some(id) = cursor {
            if id == a {
                return true;
            }
            cursor = self.blocks[id].idom;
        }
        false
    }
}
