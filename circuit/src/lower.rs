//! Lowering of an analysed [`BytecodeGraph`] into gates.
//!
//! Every block gets a head: the state entry for a block nobody jumps to, an
//! `OrdinaryBlock`/`DependRelay` pair for one incoming edge, and a
//! `Merge`/`DependSelector` pair otherwise. Instructions are then chained
//! through state and depend edges, and value inputs are resolved last by
//! walking back from each use to its definition.

use bytecode::{Instruction, InstructionKind, MethodInfo};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    BlockId, BytecodeGraph, CONSTANT_UNDEFINED, Circuit, CircuitBuilder, GateRef, OpCode,
    TranslateError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeKind {
    /// Method entry into block 0.
    Entry,
    Normal,
    /// From an instruction that threw.
    Exception,
}

/// One incoming state edge of a block head.
#[derive(Debug, Clone, Copy)]
struct ExpandedPred {
    block: BlockId,
    /// The instruction that left `block` along this edge.
    inst: usize,
    kind: EdgeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Operand {
    Acc,
    Reg(u16),
}

impl Operand {
    fn reg(self) -> Option<u16> {
        match self {
            Self::Acc => None,
            Self::Reg(reg) => Some(reg),
        }
    }
}

#[derive(Debug)]
struct BlockHead {
    state: GateRef,
    depend: GateRef,
    expected: usize,
    preds: Vec<ExpandedPred>,
}

struct Lowering<'a> {
    method: &'a MethodInfo,
    graph: &'a BytecodeGraph,
    circuit: Circuit,
    heads: Vec<Option<BlockHead>>,
    args: Vec<GateRef>,
    undefined: Option<GateRef>,
    bytecode_gates: FxHashMap<usize, GateRef>,
    selectors: FxHashMap<(BlockId, Operand), GateRef>,
    resolving: FxHashSet<(BlockId, Operand)>,
    /// Gates whose value inputs are filled once every block is emitted.
    pending: Vec<(GateRef, BlockId, usize)>,
}

impl CircuitBuilder<'_> {
    /// Emits the gates of every live block. Expects a graph that went
    /// through [`update_cfg`](Self::update_cfg).
    pub fn build_circuit(
        &self,
        graph: &BytecodeGraph,
    ) -> Result<(Circuit, FxHashMap<usize, GateRef>), TranslateError> {
        let mut lowering = Lowering {
            method: self.method,
            graph,
            circuit: Circuit::new(),
            heads: Vec::new(),
            args: Vec::new(),
            undefined: None,
            bytecode_gates: FxHashMap::default(),
            selectors: FxHashMap::default(),
            resolving: FxHashSet::default(),
            pending: Vec::new(),
        };
        lowering.create_args();
        lowering.create_heads()?;
        for block in graph.live_blocks() {
            lowering.emit_block(block.id)?;
        }
        lowering.check_heads()?;
        lowering.resolve_values()?;
        lowering.circuit.verify()?;
        Ok((lowering.circuit, lowering.bytecode_gates))
    }
}

impl Lowering<'_> {
    fn create_args(&mut self) {
        for index in 0..self.method.num_args {
            let arg = self
                .circuit
                .new_gate_with_null_ins(OpCode::Arg, index as u64);
            self.args.push(arg);
        }
    }

    fn fall_through(&self, inst: usize) -> Result<BlockId, TranslateError> {
        let inst = &self.graph.insts[inst];
        self.graph
            .block_starting_at(inst.next_offset())
            .filter(|&next| !self.graph.block(next).is_dead)
            .ok_or(TranslateError::FallThroughEnd {
                offset: inst.offset,
            })
    }

    fn jump_target(&self, inst: usize) -> Result<BlockId, TranslateError> {
        let inst = &self.graph.insts[inst];
        let target = inst.jump_target().unwrap_or(-1);
        u32::try_from(target)
            .ok()
            .and_then(|t| self.graph.block_starting_at(t))
            .ok_or(TranslateError::InvalidJumpTarget {
                offset: inst.offset,
                target,
            })
    }

    /// Blocks receiving a state edge out of `block`, in emission order.
    fn state_edge_targets(&self, id: BlockId) -> Result<Vec<BlockId>, TranslateError> {
        let block = self.graph.block(id);
        let mut targets = Vec::new();
        let catch = block.catches.first().copied();
        for index in block.insts.clone() {
            let kind = self.graph.insts[index].info.kind;
            if kind.may_throw() {
                targets.extend(catch);
            }
        }
        let last = block.insts.end - 1;
        match self.graph.insts[last].info.kind {
            InstructionKind::Jump => targets.push(self.jump_target(last)?),
            InstructionKind::ConditionalJump => {
                targets.push(self.fall_through(last)?);
                targets.push(self.jump_target(last)?);
            }
            InstructionKind::Return | InstructionKind::ReturnUndefined | InstructionKind::Throw => {}
            _ => targets.push(self.fall_through(last)?),
        }
        Ok(targets)
    }

    fn create_heads(&mut self) -> Result<(), TranslateError> {
        let n = self.graph.blocks.len();
        let mut counts = vec![0usize; n];
        for block in self.graph.live_blocks() {
            for target in self.state_edge_targets(block.id)? {
                counts[target] += 1;
            }
        }
        // Block 0 is also entered from the method entry.
        if counts[0] > 0 {
            counts[0] += 1;
        }

        self.heads = (0..n).map(|_| None).collect();
        for id in 0..n {
            if self.graph.block(id).is_dead {
                continue;
            }
            let expected = counts[id];
            let (state, depend) = match expected {
                0 => (
                    self.circuit.root(OpCode::StateEntry),
                    self.circuit.root(OpCode::DependEntry),
                ),
                1 => {
                    let block = self.circuit.new_gate_with_null_ins(OpCode::OrdinaryBlock, 0);
                    let relay = self.circuit.new_gate_with_null_ins(OpCode::DependRelay, 0);
                    self.circuit.set_in(relay, 0, block);
                    (block, relay)
                }
                count => {
                    let merge = self.circuit.new_gate_with_null_ins(OpCode::Merge, count as u64);
                    let selector = self
                        .circuit
                        .new_gate_with_null_ins(OpCode::DependSelector, count as u64);
                    self.circuit.set_in(selector, 0, merge);
                    (merge, selector)
                }
            };
            self.heads[id] = Some(BlockHead {
                state,
                depend,
                expected,
                preds: Vec::new(),
            });
        }
        if counts[0] > 0 {
            let state = self.circuit.root(OpCode::StateEntry);
            let depend = self.circuit.root(OpCode::DependEntry);
            self.connect(0, state, depend, ExpandedPred {
                block: 0,
                inst: 0,
                kind: EdgeKind::Entry,
            });
        }
        Ok(())
    }

    fn head(&self, id: BlockId) -> Result<&BlockHead, TranslateError> {
        self.heads[id]
            .as_ref()
            .ok_or(TranslateError::UnresolvedValue { block: id, reg: None })
    }

    /// Wires one incoming edge into the head of `target`.
    fn connect(&mut self, target: BlockId, state: GateRef, depend: GateRef, pred: ExpandedPred) {
        let Some(head) = self.heads[target].as_mut() else {
            log::error!("edge into dead block {target}");
            return;
        };
        let index = head.preds.len();
        debug_assert!(index < head.expected, "too many edges into block {target}");
        if head.expected > 1 {
            self.circuit.set_in(head.state, index, state);
            self.circuit.set_in(head.depend, 1 + index, depend);
        } else {
            self.circuit.set_in(head.state, 0, state);
            self.circuit.set_in(head.depend, 1, depend);
        }
        head.preds.push(pred);
    }

    fn new_bytecode_gate(&mut self, block: BlockId, index: usize, state: GateRef, depend: GateRef) -> GateRef {
        let values = self.graph.insts[index].info.value_count();
        let gate = self
            .circuit
            .new_gate_with_null_ins(OpCode::JsBytecode, values as u64);
        self.circuit.set_in(gate, 0, state);
        self.circuit.set_in(gate, 1, depend);
        self.bytecode_gates.insert(index, gate);
        if values > 0 {
            self.pending.push((gate, block, index));
        }
        gate
    }

    /// Routes the exception edge of `gate` to the block's handler, or out
    /// of the method.
    fn emit_exception(&mut self, block: BlockId, index: usize, gate: GateRef) {
        let exception = self.circuit.new_gate(OpCode::IfException, 0, vec![gate]);
        match self.graph.block(block).catches.first().copied() {
            Some(handler) => self.connect(handler, exception, gate, ExpandedPred {
                block,
                inst: index,
                kind: EdgeKind::Exception,
            }),
            None => {
                let list = self.circuit.root(OpCode::ThrowList);
                self.circuit
                    .new_gate(OpCode::Throw, 0, vec![exception, gate, gate, list]);
            }
        }
    }

    fn emit_block(&mut self, id: BlockId) -> Result<(), TranslateError> {
        let graph = self.graph;
        let head = self.head(id)?;
        let (mut state, mut depend) = (head.state, head.depend);
        let block = graph.block(id);
        for index in block.insts.clone() {
            let inst = &graph.insts[index];
            let normal = ExpandedPred {
                block: id,
                inst: index,
                kind: EdgeKind::Normal,
            };
            match inst.info.kind {
                InstructionKind::Mov => {}
                InstructionKind::NoThrow => {
                    let gate = self.new_bytecode_gate(id, index, state, depend);
                    state = gate;
                    depend = gate;
                }
                InstructionKind::General => {
                    let gate = self.new_bytecode_gate(id, index, state, depend);
                    let success = self.circuit.new_gate(OpCode::IfSuccess, 0, vec![gate]);
                    self.emit_exception(id, index, gate);
                    state = success;
                    depend = gate;
                }
                InstructionKind::Throw => {
                    let gate = self.new_bytecode_gate(id, index, state, depend);
                    self.emit_exception(id, index, gate);
                    return Ok(());
                }
                InstructionKind::ConditionalJump => {
                    let gate = self.new_bytecode_gate(id, index, state, depend);
                    let if_true = self.circuit.new_gate(OpCode::IfTrue, 0, vec![gate]);
                    let if_false = self.circuit.new_gate(OpCode::IfFalse, 0, vec![gate]);
                    let next = self.fall_through(index)?;
                    let target = self.jump_target(index)?;
                    let (on_true, on_false) = match inst.inst {
                        Instruction::JumpIfFalse { .. } => (next, target),
                        _ => (target, next),
                    };
                    self.connect(on_true, if_true, gate, normal);
                    self.connect(on_false, if_false, gate, normal);
                    return Ok(());
                }
                InstructionKind::Jump => {
                    let target = self.jump_target(index)?;
                    self.connect(target, state, depend, normal);
                    return Ok(());
                }
                InstructionKind::Return => {
                    let list = self.circuit.root(OpCode::ReturnList);
                    let ret = self
                        .circuit
                        .new_gate(OpCode::Return, 0, vec![state, depend, GateRef::NULL, list]);
                    self.pending.push((ret, id, index));
                    return Ok(());
                }
                InstructionKind::ReturnUndefined => {
                    let value = self.undefined();
                    let list = self.circuit.root(OpCode::ReturnList);
                    self.circuit
                        .new_gate(OpCode::Return, 0, vec![state, depend, value, list]);
                    return Ok(());
                }
            }
        }
        let last = block.insts.end - 1;
        let next = self.fall_through(last)?;
        self.connect(next, state, depend, ExpandedPred {
            block: id,
            inst: last,
            kind: EdgeKind::Normal,
        });
        Ok(())
    }

    fn check_heads(&self) -> Result<(), TranslateError> {
        for (id, head) in self.heads.iter().enumerate() {
            if let Some(head) = head
                && head.preds.len() != head.expected
            {
                log::error!(
                    "block {id} expected {} incoming edges, got {}",
                    head.expected,
                    head.preds.len()
                );
                return Err(TranslateError::UnresolvedValue { block: id, reg: None });
            }
        }
        Ok(())
    }

    // ── values ────────────────────────────────────────────────────

    fn undefined(&mut self) -> GateRef {
        if let Some(gate) = self.undefined {
            return gate;
        }
        let gate = self
            .circuit
            .new_gate_with_null_ins(OpCode::Constant, CONSTANT_UNDEFINED);
        self.undefined = Some(gate);
        gate
    }

    /// Value of `operand` on method entry: an argument, or `undefined`.
    fn entry_value(&mut self, operand: Operand) -> GateRef {
        let method = self.method;
        if let Operand::Reg(reg) = operand
            && reg >= method.num_vregs
            && let Some(&arg) = self.args.get((reg - method.num_vregs) as usize)
        {
            return arg;
        }
        self.undefined()
    }

    fn resolve_values(&mut self) -> Result<(), TranslateError> {
        let graph = self.graph;
        while let Some((gate, block, index)) = self.pending.pop() {
            let info = &graph.insts[index].info;
            let base = self.circuit.gate(gate).layout().value_start();
            let mut operands: Vec<Operand> = info.vregs_in.iter().map(|&r| Operand::Reg(r)).collect();
            if info.acc_in {
                operands.push(Operand::Acc);
            }
            for (i, operand) in operands.into_iter().enumerate() {
                let value = self.def_site(block, index, operand)?;
                self.circuit.set_in(gate, base + i, value);
            }
        }
        Ok(())
    }

    /// The gate defining `operand` just before instruction `upto` of
    /// `block` (exclusive).
    fn def_site(&mut self, block: BlockId, upto: usize, operand: Operand) -> Result<GateRef, TranslateError> {
        let graph = self.graph;
        let mut operand = operand;
        let start = graph.block(block).insts.start;
        for index in (start..upto).rev() {
            let inst = &graph.insts[index];
            let info = &inst.info;
            match operand {
                Operand::Acc if info.acc_out => match inst.inst {
                    Instruction::LoadReg { reg } => operand = Operand::Reg(reg),
                    _ => {
                        return self
                            .bytecode_gates
                            .get(&index)
                            .copied()
                            .ok_or(TranslateError::UnresolvedValue { block, reg: None });
                    }
                },
                Operand::Reg(reg) if info.vregs_out.contains(&reg) => match inst.inst {
                    Instruction::StoreReg { .. } => operand = Operand::Acc,
                    Instruction::Mov { src, .. } => operand = Operand::Reg(src),
                    _ => return Err(TranslateError::UnresolvedValue { block, reg: Some(reg) }),
                },
                _ => {}
            }
        }
        self.block_entry_value(block, operand)
    }

    /// The value of `operand` on entry to `block`.
    fn block_entry_value(&mut self, block: BlockId, operand: Operand) -> Result<GateRef, TranslateError> {
        if let Some(&selector) = self.selectors.get(&(block, operand)) {
            return Ok(selector);
        }
        let graph = self.graph;
        let b = graph.block(block);
        let head = self.head(block)?;
        let preds = head.preds.clone();
        let head_state = head.state;
        let wants_phi = match operand {
            Operand::Reg(reg) => b.phis.contains(&reg),
            Operand::Acc => preds.len() > 1 || !b.trys.is_empty(),
        };
        if wants_phi && !preds.is_empty() {
            let selector = self
                .circuit
                .new_gate_with_null_ins(OpCode::ValueSelector, preds.len() as u64);
            self.circuit.set_in(selector, 0, head_state);
            self.selectors.insert((block, operand), selector);
            for (i, pred) in preds.iter().enumerate() {
                let value = self.pred_value(*pred, operand)?;
                self.circuit.set_in(selector, 1 + i, value);
            }
            return Ok(selector);
        }

        let Some(idom) = b.idom else {
            return Ok(self.entry_value(operand));
        };
        if !self.resolving.insert((block, operand)) {
            return Err(TranslateError::UnresolvedValue {
                block,
                reg: operand.reg(),
            });
        }
        let end = graph.block(idom).insts.end;
        let value = self.def_site(idom, end, operand);
        self.resolving.remove(&(block, operand));
        value
    }

    fn pred_value(&mut self, pred: ExpandedPred, operand: Operand) -> Result<GateRef, TranslateError> {
        match (pred.kind, operand) {
            (EdgeKind::Entry, _) => Ok(self.entry_value(operand)),
            (EdgeKind::Exception, Operand::Acc) => self
                .bytecode_gates
                .get(&pred.inst)
                .copied()
                .ok_or(TranslateError::UnresolvedValue {
                    block: pred.block,
                    reg: None,
                }),
            (EdgeKind::Exception, Operand::Reg(_)) => self.def_site(pred.block, pred.inst, operand),
            (EdgeKind::Normal, _) => self.def_site(pred.block, pred.inst + 1, operand),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytecode::{BytecodeBuilder, MethodInfo};

    use crate::{CircuitBuilder, CONSTANT_UNDEFINED, GateRef, OpCode, Translation, samples};

    fn translate(method: &MethodInfo) -> Translation {
        CircuitBuilder::translate(method).unwrap()
    }

    fn value_inputs(t: &Translation, gate: GateRef) -> Vec<GateRef> {
        let g = t.circuit.gate(gate);
        let layout = g.layout();
        g.ins()[layout.value_start()..layout.value_start() + layout.value].to_vec()
    }

    fn only(t: &Translation, opcode: OpCode) -> GateRef {
        let gates: Vec<GateRef> = t.circuit.gates_with(opcode).collect();
        assert_eq!(gates.len(), 1, "expected one {opcode:?}");
        gates[0]
    }

    #[test]
    fn diamond_merges_the_branch_values() {
        let t = translate(&samples::diamond());
        assert_eq!(t.circuit.count(OpCode::Merge), 1);
        let phi = only(&t, OpCode::ValueSelector);
        assert_eq!(t.circuit.opcode(t.circuit.in_at(phi, 0)), OpCode::Merge);
        assert_eq!(value_inputs(&t, phi), vec![
            t.gate_at(5).unwrap(),
            t.gate_at(15).unwrap()
        ]);
        let ret = only(&t, OpCode::Return);
        assert_eq!(value_inputs(&t, ret), vec![phi]);
    }

    #[test]
    fn branches_read_the_argument() {
        let t = translate(&samples::diamond());
        let branch = t.gate_at(2).unwrap();
        let arg = only(&t, OpCode::Arg);
        assert_eq!(value_inputs(&t, branch), vec![arg]);
        assert_eq!(t.circuit.count(OpCode::IfTrue), 1);
        assert_eq!(t.circuit.count(OpCode::IfFalse), 1);
        // Register moves emit no gates.
        assert_eq!(t.gate_at(0), None);
        assert_eq!(t.gate_at(10), None);
    }

    #[test]
    fn one_sided_write_merges_with_the_argument() {
        // `if a0 { a0 = 5 }; return a0`
        let mut b = BytecodeBuilder::new();
        b.load_reg(0);
        let skip = b.jump_if_false();
        b.load_smi(5);
        b.store_reg(0);
        b.bind(skip);
        b.load_reg(0);
        b.return_();
        let t = translate(&MethodInfo::new("m", b.into_bytes(), 0, 1));
        let arg = only(&t, OpCode::Arg);
        let phi = only(&t, OpCode::ValueSelector);
        assert_eq!(value_inputs(&t, phi), vec![arg, t.gate_at(5).unwrap()]);
        let ret = only(&t, OpCode::Return);
        assert_eq!(value_inputs(&t, ret), vec![phi]);
    }

    #[test]
    fn local_written_on_one_path_merges_with_undefined() {
        let mut b = BytecodeBuilder::new();
        b.load_reg(1);
        let else_ = b.jump_if_false();
        b.load_smi(1);
        b.store_reg(0);
        b.bind(else_);
        b.load_reg(0);
        b.return_();
        let t = translate(&MethodInfo::new("m", b.into_bytes(), 1, 1));
        let phi = only(&t, OpCode::ValueSelector);
        let inputs = value_inputs(&t, phi);
        assert_eq!(t.circuit.opcode(inputs[0]), OpCode::Constant);
        assert_eq!(t.circuit.bitfield(inputs[0]), CONSTANT_UNDEFINED);
        assert_eq!(inputs[1], t.gate_at(5).unwrap());
    }

    #[test]
    fn loop_updating_an_argument_reads_the_entry_phi() {
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
        let t = translate(&MethodInfo::new("m", b.into_bytes(), 0, 1));
        let arg = only(&t, OpCode::Arg);
        let add = t.gate_at(10).unwrap();
        let phi = only(&t, OpCode::ValueSelector);
        assert_eq!(value_inputs(&t, phi), vec![arg, add]);
        assert_eq!(value_inputs(&t, t.gate_at(2).unwrap()), vec![phi]);
        assert_eq!(value_inputs(&t, add), vec![phi, t.gate_at(5).unwrap()]);
        let ret = only(&t, OpCode::Return);
        assert_eq!(value_inputs(&t, ret), vec![phi]);
    }

    #[test]
    fn loop_phi_takes_the_initial_and_the_updated_value() {
        let t = translate(&samples::counting_loop());
        let phi = only(&t, OpCode::ValueSelector);
        assert_eq!(value_inputs(&t, phi), vec![
            t.gate_at(0).unwrap(),
            t.gate_at(19).unwrap()
        ]);
        let less = t.gate_at(9).unwrap();
        let arg = only(&t, OpCode::Arg);
        assert_eq!(value_inputs(&t, less), vec![arg, phi]);
        let add = t.gate_at(19).unwrap();
        assert_eq!(value_inputs(&t, add), vec![phi, t.gate_at(14).unwrap()]);
        let ret = only(&t, OpCode::Return);
        assert_eq!(value_inputs(&t, ret), vec![phi]);
    }

    #[test]
    fn uncaught_exceptions_leave_through_throw_gates() {
        let t = translate(&samples::counting_loop());
        // `Less` and `Add` may throw.
        assert_eq!(t.circuit.count(OpCode::IfSuccess), 2);
        assert_eq!(t.circuit.count(OpCode::IfException), 2);
        assert_eq!(t.circuit.count(OpCode::Throw), 2);
    }

    #[test]
    fn switch_join_selects_one_value_per_case() {
        let t = translate(&samples::switch());
        let merge = only(&t, OpCode::Merge);
        assert_eq!(t.circuit.bitfield(merge), 3);
        let phi = only(&t, OpCode::ValueSelector);
        assert_eq!(value_inputs(&t, phi), vec![
            t.gate_at(20).unwrap(),
            t.gate_at(28).unwrap(),
            t.gate_at(36).unwrap()
        ]);
    }

    #[test]
    fn switch_tests_compare_the_argument() {
        let t = translate(&samples::switch());
        let arg = only(&t, OpCode::Arg);
        assert_eq!(value_inputs(&t, t.gate_at(5).unwrap()), vec![arg, t.gate_at(0).unwrap()]);
        assert_eq!(value_inputs(&t, t.gate_at(15).unwrap()), vec![arg, t.gate_at(10).unwrap()]);
        assert!(t.circuit.gates_with(OpCode::Constant).all(|g| t.circuit.bitfield(g) != CONSTANT_UNDEFINED));
    }

    #[test]
    fn handler_receives_the_thrown_value() {
        let t = translate(&samples::try_catch());
        let send = t.gate_at(2).unwrap();
        assert_eq!(t.circuit.count(OpCode::Throw), 0);
        assert_eq!(t.circuit.count(OpCode::Return), 2);
        let exception = only(&t, OpCode::IfException);
        assert_eq!(t.circuit.in_at(exception, 0), send);

        let phi = only(&t, OpCode::ValueSelector);
        assert_eq!(t.circuit.opcode(t.circuit.in_at(phi, 0)), OpCode::OrdinaryBlock);
        assert_eq!(value_inputs(&t, phi), vec![send]);

        let handler_head = t.circuit.in_at(phi, 0);
        assert_eq!(t.circuit.in_at(handler_head, 0), exception);
    }

    #[test]
    fn explicit_throw_without_handler() {
        let mut b = BytecodeBuilder::new();
        b.load_smi(7);
        b.throw();
        let t = translate(&MethodInfo::new("m", b.into_bytes(), 0, 0));
        let throw = only(&t, OpCode::Throw);
        let thrown = t.gate_at(5).unwrap();
        assert_eq!(value_inputs(&t, throw), vec![thrown]);
        assert_eq!(value_inputs(&t, thrown), vec![t.gate_at(0).unwrap()]);
        assert_eq!(t.circuit.count(OpCode::IfSuccess), 0);
    }

    #[test]
    fn return_undefined_uses_the_shared_constant() {
        let mut b = BytecodeBuilder::new();
        b.load_reg(0);
        let skip = b.jump_if_true();
        b.return_undefined();
        b.bind(skip);
        b.return_undefined();
        let t = translate(&MethodInfo::new("m", b.into_bytes(), 0, 1));
        assert_eq!(t.circuit.count(OpCode::Return), 2);
        assert_eq!(t.circuit.count(OpCode::Constant), 1);
    }

    #[test]
    fn loop_back_to_the_entry_keeps_the_method_entry_edge() {
        let mut b = BytecodeBuilder::new();
        b.load_reg(0);
        b.jump_back_if_true(0);
        b.return_();
        let t = translate(&MethodInfo::new("m", b.into_bytes(), 0, 1));
        let merge = only(&t, OpCode::Merge);
        assert_eq!(t.circuit.bitfield(merge), 2);
        assert_eq!(t.circuit.in_at(merge, 0), t.circuit.root(OpCode::StateEntry));
    }

    #[test]
    fn dead_blocks_emit_nothing() {
        let mut b = BytecodeBuilder::new();
        b.load_smi(1);
        b.return_();
        b.load_smi(2);
        b.return_();
        let t = translate(&MethodInfo::new("m", b.into_bytes(), 0, 0));
        assert_eq!(t.circuit.count(OpCode::Return), 1);
        assert_eq!(t.gate_at(6), None);
    }
}
