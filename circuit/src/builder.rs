//! Control flow analysis: block discovery, dominators, frontiers and phi
//! placement. The last stage, lowering into gates, lives in `lower`.

use bytecode::{BytecodeDecoder, InstructionKind, MethodInfo};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    BasicBlock, BlockId, BytecodeGraph, Circuit, CfgInfo, DecodedInstruction, ExceptionRange,
    GateRef, SplitKind, TranslateError,
};

/// A translated method.
#[derive(Debug, Clone)]
pub struct Translation {
    pub graph: BytecodeGraph,
    pub circuit: Circuit,
    /// Gate emitted for each instruction, by instruction index.
    pub bytecode_gates: FxHashMap<usize, GateRef>,
}

impl Translation {
    /// The gate of the instruction at byte `offset`, if it emitted one.
    pub fn gate_at(&self, offset: u32) -> Option<GateRef> {
        let index = self
            .graph
            .insts
            .binary_search_by_key(&offset, |inst| inst.offset)
            .ok()?;
        self.bytecode_gates.get(&index).copied()
    }
}

/// Translates one method into a [`Circuit`], one stage at a time.
pub struct CircuitBuilder<'m> {
    pub(crate) method: &'m MethodInfo,
    pub(crate) insts: Vec<DecodedInstruction>,
    index_of: FxHashMap<u32, usize>,
}

impl<'m> CircuitBuilder<'m> {
    /// Decodes the method and checks every register it names.
    pub fn new(method: &'m MethodInfo) -> Result<Self, TranslateError> {
        let mut insts = Vec::new();
        let mut decoder = BytecodeDecoder::new(&method.bytecode);
        while let Some(decoded) = decoder.decode_with_offset() {
            let (offset, len, inst) = decoded?;
            let info = inst.info();
            let offset = offset as u32;
            let limit = method.register_count();
            if let Some(&reg) = info
                .vregs_in
                .iter()
                .chain(&info.vregs_out)
                .find(|&&reg| reg as u32 >= limit)
            {
                return Err(TranslateError::InvalidRegister { offset, reg });
            }
            insts.push(DecodedInstruction {
                offset,
                len: len as u32,
                inst,
                info,
            });
        }
        if insts.is_empty() {
            return Err(TranslateError::EmptyMethod);
        }
        let index_of = insts
            .iter()
            .enumerate()
            .map(|(i, inst)| (inst.offset, i))
            .collect();
        Ok(Self {
            method,
            insts,
            index_of,
        })
    }

    pub fn instructions(&self) -> &[DecodedInstruction] {
        &self.insts
    }

    fn code_len(&self) -> u32 {
        self.method.bytecode.len() as u32
    }

    fn is_instruction(&self, offset: u32) -> bool {
        self.index_of.contains_key(&offset)
    }

    fn jump_target(&self, inst: &DecodedInstruction) -> Result<u32, TranslateError> {
        let target = inst.jump_target().unwrap_or(-1);
        match u32::try_from(target) {
            Ok(t) if self.is_instruction(t) => Ok(t),
            _ => Err(TranslateError::InvalidJumpTarget {
                offset: inst.offset,
                target,
            }),
        }
    }

    // ── block discovery ───────────────────────────────────────────

    /// Scans the instructions once and records where blocks start and end.
    /// Terminators end a block; their targets and the instruction after
    /// them start one.
    pub fn collect_block_info(&self) -> Result<(Vec<CfgInfo>, Vec<ExceptionRange>), TranslateError> {
        let mut infos = vec![CfgInfo::start(0)];
        for inst in &self.insts {
            let next = inst.next_offset();
            match inst.info.kind {
                InstructionKind::Jump => {
                    let target = self.jump_target(inst)?;
                    infos.push(CfgInfo::end(inst.offset, vec![target]));
                    infos.push(CfgInfo::start(target));
                }
                InstructionKind::ConditionalJump => {
                    let target = self.jump_target(inst)?;
                    if !self.is_instruction(next) {
                        return Err(TranslateError::FallThroughEnd {
                            offset: inst.offset,
                        });
                    }
                    infos.push(CfgInfo::end(inst.offset, vec![next, target]));
                    infos.push(CfgInfo::start(target));
                }
                InstructionKind::Return | InstructionKind::ReturnUndefined | InstructionKind::Throw => {
                    infos.push(CfgInfo::end(inst.offset, Vec::new()));
                }
                _ => continue,
            }
            if self.is_instruction(next) {
                infos.push(CfgInfo::start(next));
            }
        }
        let exceptions = self.collect_try_catch_block_info(&mut infos)?;
        log::trace!(
            "{}: {} boundaries, {} try blocks",
            self.method.name,
            infos.len(),
            exceptions.len()
        );
        Ok((infos, exceptions))
    }

    /// Splits blocks at try boundaries and handler entries.
    pub fn collect_try_catch_block_info(
        &self,
        infos: &mut Vec<CfgInfo>,
    ) -> Result<Vec<ExceptionRange>, TranslateError> {
        let mut exceptions = Vec::with_capacity(self.method.try_blocks.len());
        for try_block in &self.method.try_blocks {
            let (start, end) = (try_block.start, try_block.end);
            let valid = start < end
                && self.is_instruction(start)
                && (end == self.code_len() || self.is_instruction(end))
                && try_block.handlers.iter().all(|&h| self.is_instruction(h));
            if !valid {
                return Err(TranslateError::InvalidTryBlock { start, end });
            }
            infos.push(CfgInfo::start(start));
            if end < self.code_len() {
                infos.push(CfgInfo::start(end));
            }
            infos.extend(try_block.handlers.iter().map(|&h| CfgInfo::start(h)));
            exceptions.push(ExceptionRange {
                start,
                end,
                handlers: try_block.handlers.clone(),
            });
        }
        Ok(exceptions)
    }

    /// Sorts the boundaries and adds the ones implied by their neighbours:
    /// the instruction before a start ends a block falling into it, and the
    /// instruction after an end starts one. The result alternates start and
    /// end markers.
    pub fn complete_block_info(&self, mut infos: Vec<CfgInfo>) -> Result<Vec<CfgInfo>, TranslateError> {
        let ends: FxHashSet<u32> = infos
            .iter()
            .filter(|i| i.kind == SplitKind::End)
            .map(|i| i.offset)
            .collect();
        let starts: FxHashSet<u32> = infos
            .iter()
            .filter(|i| i.kind == SplitKind::Start)
            .map(|i| i.offset)
            .collect();

        let mut implied = Vec::new();
        for &start in &starts {
            let Some(index) = self.index_of.get(&start).copied().filter(|&i| i > 0) else {
                continue;
            };
            let prev = &self.insts[index - 1];
            if !ends.contains(&prev.offset) {
                implied.push(CfgInfo::end(prev.offset, vec![start]));
            }
        }
        for &end in &ends {
            let next = self.insts[self.index_of[&end]].next_offset();
            if self.is_instruction(next) && !starts.contains(&next) {
                implied.push(CfgInfo::start(next));
            }
        }
        infos.extend(implied);

        infos.sort_by_key(|i| (i.offset, i.kind));
        infos.dedup_by(|later, earlier| {
            if later.offset != earlier.offset || later.kind != earlier.kind {
                return false;
            }
            for succ in later.succs.drain(..) {
                if !earlier.succs.contains(&succ) {
                    earlier.succs.push(succ);
                }
            }
            true
        });

        let last = &self.insts[self.insts.len() - 1];
        for (i, info) in infos.iter().enumerate() {
            let expected = if i % 2 == 0 { SplitKind::Start } else { SplitKind::End };
            if info.kind != expected {
                return Err(TranslateError::FallThroughEnd { offset: info.offset });
            }
        }
        if infos.len() % 2 != 0 {
            return Err(TranslateError::FallThroughEnd { offset: last.offset });
        }
        Ok(infos)
    }

    // ── graph ─────────────────────────────────────────────────────

    /// Pairs the markers into blocks and wires successor, predecessor and
    /// catch edges.
    pub fn build_basic_blocks(&self, infos: &[CfgInfo], exceptions: Vec<ExceptionRange>) -> BytecodeGraph {
        let mut blocks: Vec<BasicBlock> = infos
            .chunks_exact(2)
            .enumerate()
            .map(|(id, pair)| BasicBlock {
                id,
                start: pair[0].offset,
                end: pair[1].offset,
                insts: self.index_of[&pair[0].offset]..self.index_of[&pair[1].offset] + 1,
                ..BasicBlock::default()
            })
            .collect();
        let id_of: FxHashMap<u32, BlockId> = blocks.iter().map(|b| (b.start, b.id)).collect();

        for (id, pair) in infos.chunks_exact(2).enumerate() {
            for succ in &pair[1].succs {
                let succ = id_of[succ];
                if !blocks[id].succs.contains(&succ) {
                    blocks[id].succs.push(succ);
                    blocks[succ].preds.push(id);
                }
            }
        }

        for range in &exceptions {
            for id in 0..blocks.len() {
                if !range.covers(blocks[id].start) {
                    continue;
                }
                for handler in &range.handlers {
                    let handler = id_of[handler];
                    if !blocks[id].catches.contains(&handler) {
                        blocks[id].catches.push(handler);
                    }
                    if !blocks[id].succs.contains(&handler) {
                        blocks[id].succs.push(handler);
                        blocks[handler].preds.push(id);
                    }
                }
            }
        }

        BytecodeGraph {
            insts: self.insts.clone(),
            blocks,
            exceptions,
        }
    }

    // ── dominators ────────────────────────────────────────────────

    /// Marks unreachable blocks dead, solves the dominator sets by fixpoint
    /// iteration and returns each block's immediate dominator.
    pub fn compute_dominator_tree(graph: &mut BytecodeGraph) -> Vec<Option<BlockId>> {
        let n = graph.blocks.len();

        // Visit order from the entry; a block is stamped when it is popped,
        // after the block that discovered it.
        let mut timestamp = vec![None; n];
        let mut visited = vec![false; n];
        let mut stack = vec![0];
        visited[0] = true;
        let mut clock = 0usize;
        while let Some(id) = stack.pop() {
            timestamp[id] = Some(clock);
            clock += 1;
            for &succ in &graph.blocks[id].succs {
                if !visited[succ] {
                    visited[succ] = true;
                    stack.push(succ);
                }
            }
        }

        for id in 0..n {
            if timestamp[id].is_none() {
                let block = &mut graph.blocks[id];
                block.is_dead = true;
                block.succs.clear();
                block.preds.clear();
                block.catches.clear();
            }
        }
        for id in 0..n {
            let preds = std::mem::take(&mut graph.blocks[id].preds);
            graph.blocks[id].preds = preds.into_iter().filter(|&p| timestamp[p].is_some()).collect();
        }

        let live: Vec<BlockId> = (0..n).filter(|&id| timestamp[id].is_some()).collect();
        let mut doms: Vec<Vec<BlockId>> = vec![live.clone(); n];
        doms[0] = vec![0];
        let mut changed = true;
        while changed {
            changed = false;
            for &id in live.iter().skip_while(|&&id| id == 0) {
                let mut preds = graph.blocks[id].preds.iter();
                let Some(&first) = preds.next() else {
                    continue;
                };
                let mut dom = doms[first].clone();
                for &pred in preds {
                    dom.retain(|d| doms[pred].binary_search(d).is_ok());
                }
                if let Err(pos) = dom.binary_search(&id) {
                    dom.insert(pos, id);
                }
                if dom != doms[id] {
                    doms[id] = dom;
                    changed = true;
                }
            }
        }

        (0..n)
            .map(|id| {
                if id == 0 || timestamp[id].is_none() {
                    return None;
                }
                doms[id]
                    .iter()
                    .copied()
                    .filter(|&d| d != id)
                    .max_by_key(|&d| timestamp[d])
            })
            .collect()
    }

    pub fn build_immediate_dominators(graph: &mut BytecodeGraph, idoms: &[Option<BlockId>]) {
        for block in &mut graph.blocks {
            block.dom_children.clear();
        }
        for (id, &idom) in idoms.iter().enumerate() {
            graph.blocks[id].idom = idom;
            if let Some(parent) = idom {
                graph.blocks[parent].dom_children.push(id);
            }
        }
    }

    /// A block with several predecessors is in the frontier of every block
    /// on the dominator tree path from each predecessor up to, but not
    /// including, its own immediate dominator. The method entry is an extra
    /// predecessor of block 0.
    pub fn compute_dom_frontiers(graph: &mut BytecodeGraph) {
        for id in 0..graph.blocks.len() {
            let block = &graph.blocks[id];
            let entry = usize::from(id == 0);
            if block.is_dead || block.preds.len() + entry < 2 {
                continue;
            }
            let stop = block.idom;
            let preds = block.preds.clone();
            for pred in preds {
                let mut runner = Some(pred);
                while let Some(r) = runner {
                    if Some(r) == stop {
                        break;
                    }
                    graph.blocks[r].dom_frontiers.insert(id);
                    runner = graph.blocks[r].idom;
                }
            }
        }
    }

    /// Places a phi for a register in every block of the iterated frontier
    /// of its definitions. The method entry defines every register with its
    /// argument or `undefined`, so block 0 is a definition site of each.
    pub fn insert_phi(graph: &mut BytecodeGraph) {
        let mut defsites: FxHashMap<u16, Vec<BlockId>> = FxHashMap::default();
        for block in graph.live_blocks() {
            for inst in graph.instructions(block.id) {
                for &reg in &inst.info.vregs_out {
                    let sites = defsites.entry(reg).or_insert_with(|| vec![0]);
                    if sites.last() != Some(&block.id) {
                        sites.push(block.id);
                    }
                }
            }
        }

        let mut regs: Vec<u16> = defsites.keys().copied().collect();
        regs.sort_unstable();
        for reg in regs {
            let sites = &defsites[&reg];
            let mut worklist = sites.clone();
            while let Some(id) = worklist.pop() {
                let frontier: Vec<BlockId> = graph.blocks[id].dom_frontiers.iter().copied().collect();
                for f in frontier {
                    if graph.blocks[f].phis.insert(reg) && !sites.contains(&f) {
                        worklist.push(f);
                    }
                }
            }
        }
    }

    /// Drops catch edges from the successor lists, which from here on only
    /// hold normal control flow, and records on each handler the blocks it
    /// catches for.
    pub fn update_cfg(graph: &mut BytecodeGraph) {
        for id in 0..graph.blocks.len() {
            if graph.blocks[id].is_dead {
                continue;
            }
            let succs = normal_successors(graph, id);
            graph.blocks[id].succs = succs;
        }
        for block in &mut graph.blocks {
            block.preds.clear();
            block.trys.clear();
        }
        for id in 0..graph.blocks.len() {
            for i in 0..graph.blocks[id].succs.len() {
                let succ = graph.blocks[id].succs[i];
                graph.blocks[succ].preds.push(id);
            }
            for i in 0..graph.blocks[id].catches.len() {
                let handler = graph.blocks[id].catches[i];
                graph.blocks[handler].trys.push(id);
            }
        }
    }

    /// Runs every stage.
    pub fn translate(method: &MethodInfo) -> Result<Translation, TranslateError> {
        let builder = CircuitBuilder::new(method)?;
        let (infos, exceptions) = builder.collect_block_info()?;
        let infos = builder.complete_block_info(infos)?;
        let mut graph = builder.build_basic_blocks(&infos, exceptions);
        let idoms = Self::compute_dominator_tree(&mut graph);
        Self::build_immediate_dominators(&mut graph, &idoms);
        Self::compute_dom_frontiers(&mut graph);
        Self::insert_phi(&mut graph);
        Self::update_cfg(&mut graph);
        let (circuit, bytecode_gates) = builder.build_circuit(&graph)?;
        log::debug!(
            "translated {}: {} blocks ({} dead), {} gates",
            method.name,
            graph.blocks.len(),
            graph.blocks.iter().filter(|b| b.is_dead).count(),
            circuit.len()
        );
        Ok(Translation {
            graph,
            circuit,
            bytecode_gates,
        })
    }
}

/// Successors of `id` by its terminator alone.
fn normal_successors(graph: &BytecodeGraph, id: BlockId) -> Vec<BlockId> {
    let Some(last) = graph.instructions(id).last() else {
        return Vec::new();
    };
    let fall_through = graph.block_starting_at(last.next_offset());
    let target = last
        .jump_target()
        .and_then(|t| u32::try_from(t).ok())
        .and_then(|t| graph.block_starting_at(t));
    let mut succs: Vec<BlockId> = match last.info.kind {
        InstructionKind::Jump => target.into_iter().collect(),
        InstructionKind::ConditionalJump => fall_through.into_iter().chain(target).collect(),
        InstructionKind::Return | InstructionKind::ReturnUndefined | InstructionKind::Throw => Vec::new(),
        _ => fall_through.into_iter().collect(),
    };
    succs.dedup();
    succs
}

#[cfg(test)]
mod tests {
    use bytecode::{BytecodeBuilder, DecodeError, MethodInfo};

    use super::*;
    use crate::samples;

    fn analyse(method: &MethodInfo) -> BytecodeGraph {
        let builder = CircuitBuilder::new(method).unwrap();
        let (infos, exceptions) = builder.collect_block_info().unwrap();
        let infos = builder.complete_block_info(infos).unwrap();
        let mut graph = builder.build_basic_blocks(&infos, exceptions);
        let idoms = CircuitBuilder::compute_dominator_tree(&mut graph);
        CircuitBuilder::build_immediate_dominators(&mut graph, &idoms);
        CircuitBuilder::compute_dom_frontiers(&mut graph);
        CircuitBuilder::insert_phi(&mut graph);
        graph
    }

    fn starts(graph: &BytecodeGraph) -> Vec<u32> {
        graph.blocks.iter().map(|b| b.start).collect()
    }

    /// Whether every path from the entry to `b` passes through `d`.
    fn brute_dominates(graph: &BytecodeGraph, d: BlockId, b: BlockId) -> bool {
        if d == b || d == 0 {
            return true;
        }
        let mut seen = vec![false; graph.blocks.len()];
        let mut stack = vec![0];
        seen[0] = true;
        while let Some(id) = stack.pop() {
            if id == b {
                return false;
            }
            for &succ in &graph.blocks[id].succs {
                if succ != d && !seen[succ] {
                    seen[succ] = true;
                    stack.push(succ);
                }
            }
        }
        true
    }

    fn assert_dominators_match_brute_force(graph: &BytecodeGraph) {
        let live: Vec<BlockId> = graph.live_blocks().map(|b| b.id).collect();
        for &b in &live {
            for &d in &live {
                assert_eq!(
                    graph.dominates(d, b),
                    brute_dominates(graph, d, b),
                    "dominates({d}, {b})"
                );
            }
        }
    }

    // ── block discovery ───────────────────────────────────────────

    #[test]
    fn completion_adds_implied_ends() {
        let method = samples::diamond();
        let builder = CircuitBuilder::new(&method).unwrap();
        let (infos, _) = builder.collect_block_info().unwrap();
        // The else branch falls into the join without a recorded end.
        assert!(!infos.iter().any(|i| i.offset == 20));
        let infos = builder.complete_block_info(infos).unwrap();
        let markers: Vec<(u32, SplitKind)> = infos.iter().map(|i| (i.offset, i.kind)).collect();
        assert_eq!(markers, vec![
            (0, SplitKind::Start),
            (2, SplitKind::End),
            (5, SplitKind::Start),
            (12, SplitKind::End),
            (15, SplitKind::Start),
            (20, SplitKind::End),
            (22, SplitKind::Start),
            (24, SplitKind::End),
        ]);
        assert_eq!(infos[5].succs, vec![22]);
        assert_eq!(infos[1].succs, vec![5, 15]);
    }

    #[test]
    fn duplicate_boundaries_are_merged() {
        let method = samples::counting_loop();
        let builder = CircuitBuilder::new(&method).unwrap();
        let (infos, _) = builder.collect_block_info().unwrap();
        assert_eq!(infos.iter().filter(|i| i.offset == 26).count(), 2);
        let infos = builder.complete_block_info(infos).unwrap();
        assert_eq!(infos.iter().filter(|i| i.offset == 26).count(), 1);
    }

    // ── scenario: diamond ─────────────────────────────────────────

    #[test]
    fn diamond_has_four_blocks_joined_under_the_entry() {
        let graph = analyse(&samples::diamond());
        assert_eq!(starts(&graph), vec![0, 5, 15, 22]);
        assert_eq!(graph.live_blocks().count(), 4);
        assert_eq!(graph.block(0).succs, vec![1, 2]);
        assert_eq!(graph.block(3).preds, vec![1, 2]);
        assert_eq!(graph.block(3).idom, Some(0));
        assert_eq!(graph.block(1).dom_frontiers.iter().copied().collect::<Vec<_>>(), vec![3]);
        assert_eq!(graph.block(0).dom_children, vec![1, 2, 3]);
        assert_dominators_match_brute_force(&graph);
    }

    #[test]
    fn both_branches_writing_a_register_need_one_phi() {
        let graph = analyse(&samples::diamond());
        assert_eq!(graph.block(3).phis.iter().copied().collect::<Vec<_>>(), vec![0]);
        assert!(graph.blocks[..3].iter().all(|b| b.phis.is_empty()));
    }

    #[test]
    fn one_branch_writing_an_argument_merges_with_the_entry() {
        // `if a0 { a0 = 5 }; return a0`
        let mut b = BytecodeBuilder::new();
        b.load_reg(0);
        let skip = b.jump_if_false();
        b.load_smi(5);
        b.store_reg(0);
        b.bind(skip);
        b.load_reg(0);
        b.return_();
        let graph = analyse(&MethodInfo::new("m", b.into_bytes(), 0, 1));
        assert_eq!(starts(&graph), vec![0, 5, 12]);
        assert_eq!(graph.block(2).preds, vec![0, 1]);
        assert_eq!(graph.block(2).phis.iter().copied().collect::<Vec<_>>(), vec![0]);
        assert!(graph.blocks[..2].iter().all(|b| b.phis.is_empty()));
    }

    // ── scenario: loop ────────────────────────────────────────────

    #[test]
    fn loop_header_gets_a_phi_for_the_counter() {
        let graph = analyse(&samples::counting_loop());
        assert_eq!(starts(&graph), vec![0, 7, 14, 26]);
        assert_eq!(graph.block(1).preds, vec![0, 2]);
        assert_eq!(graph.block(2).succs, vec![1]);
        assert_eq!(graph.block(2).idom, Some(1));
        assert_eq!(graph.block(3).idom, Some(1));
        assert!(graph.block(2).dom_frontiers.contains(&1));
        assert!(graph.block(1).dom_frontiers.contains(&1));
        assert_eq!(graph.block(1).phis.iter().copied().collect::<Vec<_>>(), vec![0]);
        assert!(graph.block(3).phis.is_empty());
        assert_dominators_match_brute_force(&graph);
    }

    #[test]
    fn loop_at_the_entry_updating_an_argument_gets_an_entry_phi() {
        // `while a0 { a0 = 1 + a0 }; return a0`
        let mut b = BytecodeBuilder::new();
        let head = b.current_offset();
        b.load_reg(0);
        let exit = b.jump_if_false();
        b.load_smi(1);
        b.add(0);
        b.store_reg(0);
        b.jump_back(head);
        b.bind(exit);
        b.load_reg(0);
        b.return_();
        let graph = analyse(&MethodInfo::new("m", b.into_bytes(), 0, 1));
        assert_eq!(starts(&graph), vec![0, 5, 17]);
        assert_eq!(graph.block(0).preds, vec![1]);
        assert!(graph.block(1).dom_frontiers.contains(&0));
        assert!(graph.block(0).dom_frontiers.contains(&0));
        assert_eq!(graph.block(0).phis.iter().copied().collect::<Vec<_>>(), vec![0]);
        assert!(graph.blocks[1..].iter().all(|b| b.phis.is_empty()));
        assert_dominators_match_brute_force(&graph);
    }

    // ── scenario: switch ──────────────────────────────────────────

    #[test]
    fn chained_switch_cases_are_dominated_by_their_tests() {
        let graph = analyse(&samples::switch());
        assert_eq!(starts(&graph), vec![0, 10, 20, 28, 36, 41]);
        let idoms: Vec<Option<BlockId>> = graph.blocks.iter().map(|b| b.idom).collect();
        assert_eq!(idoms, vec![None, Some(0), Some(1), Some(0), Some(1), Some(0)]);
        assert_eq!(graph.block(5).preds, vec![2, 3, 4]);
        for id in 1..graph.blocks.len() {
            assert!(graph.dominates(0, id));
        }
        assert_dominators_match_brute_force(&graph);
    }

    // ── scenario: try/catch ───────────────────────────────────────

    #[test]
    fn handler_is_an_extra_successor_of_the_protected_block() {
        let method = samples::try_catch();
        let mut graph = analyse(&method);
        assert_eq!(starts(&graph), vec![0, 2, 7, 8]);
        let protected = graph.block_containing(2).unwrap();
        let handler = graph.block_starting_at(8).unwrap();
        assert_eq!(graph.block(protected).succs, vec![2, handler]);
        assert_eq!(graph.block(protected).catches, vec![handler]);
        assert_eq!(graph.block(handler).preds, vec![protected]);
        assert_eq!(graph.block(handler).idom, Some(protected));

        CircuitBuilder::update_cfg(&mut graph);
        assert_eq!(graph.block(protected).succs, vec![2]);
        assert!(graph.block(handler).preds.is_empty());
        assert_eq!(graph.block(handler).trys, vec![protected]);
    }

    #[test]
    fn handler_reached_by_fall_through_keeps_the_normal_edge() {
        let mut b = BytecodeBuilder::new();
        b.send(0, 0, 0);
        b.store_reg(0);
        let handler = b.current_offset() as u32;
        b.return_();
        let method = MethodInfo::new("m", b.into_bytes(), 0, 1).with_try_block(0, handler, vec![handler]);
        let mut graph = analyse(&method);
        CircuitBuilder::update_cfg(&mut graph);
        assert_eq!(graph.block(0).succs, vec![1]);
        assert_eq!(graph.block(1).preds, vec![0]);
        assert_eq!(graph.block(1).trys, vec![0]);
    }

    // ── dead code ─────────────────────────────────────────────────

    #[test]
    fn unreachable_blocks_are_dead() {
        let mut b = BytecodeBuilder::new();
        b.load_smi(1);
        b.return_();
        b.load_smi(2);
        b.jump_back(0);
        let graph = analyse(&MethodInfo::new("m", b.into_bytes(), 0, 0));
        assert_eq!(graph.blocks.len(), 2);
        assert!(!graph.block(0).is_dead);
        assert!(graph.block(1).is_dead);
        assert!(graph.block(1).succs.is_empty());
        assert!(graph.block(0).preds.is_empty());
        assert_eq!(graph.block(1).idom, None);
    }

    // ── errors ────────────────────────────────────────────────────

    #[test]
    fn unknown_opcodes_are_errors() {
        let method = MethodInfo::new("m", vec![0xEE], 0, 0);
        assert!(matches!(
            CircuitBuilder::translate(&method),
            Err(TranslateError::Decode(DecodeError::UnknownOpcode { offset: 0, byte: 0xEE }))
        ));
    }

    #[test]
    fn empty_methods_are_errors() {
        let method = MethodInfo::new("m", Vec::new(), 0, 0);
        assert!(matches!(CircuitBuilder::translate(&method), Err(TranslateError::EmptyMethod)));
    }

    #[test]
    fn running_off_the_end_is_an_error() {
        let mut b = BytecodeBuilder::new();
        b.load_smi(1);
        let method = MethodInfo::new("m", b.into_bytes(), 0, 0);
        assert!(matches!(
            CircuitBuilder::translate(&method),
            Err(TranslateError::FallThroughEnd { offset: 0 })
        ));

        let mut b = BytecodeBuilder::new();
        b.load_undefined();
        b.jump_back_if_true(0);
        let method = MethodInfo::new("m", b.into_bytes(), 0, 0);
        assert!(matches!(
            CircuitBuilder::translate(&method),
            Err(TranslateError::FallThroughEnd { offset: 1 })
        ));
    }

    #[test]
    fn jumps_must_land_on_instructions() {
        let mut b = BytecodeBuilder::new();
        b.jump_back(100);
        let method = MethodInfo::new("m", b.into_bytes(), 0, 0);
        assert!(matches!(
            CircuitBuilder::translate(&method),
            Err(TranslateError::InvalidJumpTarget { offset: 0, target: 100 })
        ));
    }

    #[test]
    fn registers_must_be_declared() {
        let mut b = BytecodeBuilder::new();
        b.load_reg(5);
        b.return_();
        let method = MethodInfo::new("m", b.into_bytes(), 1, 1);
        assert!(matches!(
            CircuitBuilder::translate(&method),
            Err(TranslateError::InvalidRegister { offset: 0, reg: 5 })
        ));
    }

    #[test]
    fn try_blocks_must_cover_whole_instructions() {
        let mut b = BytecodeBuilder::new();
        b.load_smi(1);
        b.return_();
        let method = MethodInfo::new("m", b.into_bytes(), 0, 0).with_try_block(1, 5, vec![0]);
        assert!(matches!(
            CircuitBuilder::translate(&method),
            Err(TranslateError::InvalidTryBlock { start: 1, end: 5 })
        ));
    }
}
