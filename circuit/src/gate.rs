//! The gate arena.
//!
//! A [`Circuit`] is a sea-of-nodes graph: every gate has an [`OpCode`], a
//! 64-bit immediate and an ordered input list laid out as state inputs,
//! then depend inputs, then value inputs, then at most one root input.

use core::fmt;

/// Index of a gate in its [`Circuit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GateRef(u32);

impl GateRef {
    /// Placeholder for an input that is filled in later.
    pub const NULL: GateRef = GateRef(u32::MAX);

    #[inline(always)]
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    #[inline(always)]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for GateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "g{}", self.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    CircuitRoot,
    StateEntry,
    DependEntry,
    ReturnList,
    ThrowList,
    ConstantList,
    ArgList,
    /// Leaves the method with a value. Inputs: state, depend, value, root.
    Return,
    /// Leaves the method with an exception. Inputs: state, depend, value, root.
    Throw,
    /// Head of a block with one predecessor.
    OrdinaryBlock,
    IfTrue,
    IfFalse,
    /// Head of a block with `bitfield` predecessors.
    Merge,
    /// Phi: one value per input of its merge.
    ValueSelector,
    DependSelector,
    DependRelay,
    /// One bytecode instruction with `bitfield` value inputs.
    JsBytecode,
    IfSuccess,
    IfException,
    /// Constant whose raw bits are the bitfield.
    Constant,
    /// Method argument number `bitfield`.
    Arg,
}

/// Raw bits of the `undefined` constant.
pub const CONSTANT_UNDEFINED: u64 = u64::MAX;

/// How many inputs of each class a gate takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputLayout {
    pub state: usize,
    pub depend: usize,
    pub value: usize,
    /// The root gate the trailing input must be, if any.
    pub root: Option<OpCode>,
}

impl InputLayout {
    const NONE: Self = Self::new(0, 0, 0, None);

    const fn new(state: usize, depend: usize, value: usize, root: Option<OpCode>) -> Self {
        Self {
            state,
            depend,
            value,
            root,
        }
    }

    pub fn total(&self) -> usize {
        self.state + self.depend + self.value + usize::from(self.root.is_some())
    }

    pub fn value_start(&self) -> usize {
        self.state + self.depend
    }
}

impl OpCode {
    pub fn layout(self, bitfield: u64) -> InputLayout {
        let n = bitfield as usize;
        match self {
            Self::CircuitRoot => InputLayout::NONE,
            Self::StateEntry
            | Self::DependEntry
            | Self::ReturnList
            | Self::ThrowList
            | Self::ConstantList
            | Self::ArgList => InputLayout::new(0, 0, 0, Some(Self::CircuitRoot)),
            Self::Return => InputLayout::new(1, 1, 1, Some(Self::ReturnList)),
            Self::Throw => InputLayout::new(1, 1, 1, Some(Self::ThrowList)),
            Self::OrdinaryBlock | Self::IfTrue | Self::IfFalse | Self::IfSuccess | Self::IfException => {
                InputLayout::new(1, 0, 0, None)
            }
            Self::Merge => InputLayout::new(n, 0, 0, None),
            Self::ValueSelector => InputLayout::new(1, 0, n, None),
            Self::DependSelector => InputLayout::new(1, n, 0, None),
            Self::DependRelay => InputLayout::new(1, 1, 0, None),
            Self::JsBytecode => InputLayout::new(1, 1, n, None),
            Self::Constant => InputLayout::new(0, 0, 0, Some(Self::ConstantList)),
            Self::Arg => InputLayout::new(0, 0, 0, Some(Self::ArgList)),
        }
    }

    pub fn is_root(self) -> bool {
        matches!(
            self,
            Self::CircuitRoot
                | Self::StateEntry
                | Self::DependEntry
                | Self::ReturnList
                | Self::ThrowList
                | Self::ConstantList
                | Self::ArgList
        )
    }

    /// Whether the gate can feed a state input.
    pub fn is_state(self) -> bool {
        matches!(
            self,
            Self::StateEntry
                | Self::OrdinaryBlock
                | Self::Merge
                | Self::IfTrue
                | Self::IfFalse
                | Self::IfSuccess
                | Self::IfException
                | Self::JsBytecode
        )
    }

    /// Whether the gate can feed a depend input.
    pub fn is_depend(self) -> bool {
        matches!(
            self,
            Self::DependEntry | Self::DependRelay | Self::DependSelector | Self::JsBytecode
        )
    }

    /// Whether the gate can feed a value input.
    pub fn is_value(self) -> bool {
        matches!(
            self,
            Self::JsBytecode | Self::ValueSelector | Self::Constant | Self::Arg
        )
    }
}

#[derive(Debug, Clone)]
pub struct Gate {
    opcode: OpCode,
    bitfield: u64,
    ins: Vec<GateRef>,
}

impl Gate {
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    pub fn bitfield(&self) -> u64 {
        self.bitfield
    }

    pub fn ins(&self) -> &[GateRef] {
        &self.ins
    }

    pub fn layout(&self) -> InputLayout {
        self.opcode.layout(self.bitfield)
    }
}

/// A malformed gate found by [`Circuit::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyError {
    pub gate: GateRef,
    pub opcode: OpCode,
    pub reason: String,
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}): {}", self.gate, self.opcode, self.reason)
    }
}

impl std::error::Error for VerifyError {}

const ROOTS: [OpCode; 7] = [
    OpCode::CircuitRoot,
    OpCode::StateEntry,
    OpCode::DependEntry,
    OpCode::ReturnList,
    OpCode::ThrowList,
    OpCode::ConstantList,
    OpCode::ArgList,
];

#[derive(Debug, Clone)]
pub struct Circuit {
    gates: Vec<Gate>,
}

impl Default for Circuit {
    fn default() -> Self {
        Self::new()
    }
}

impl Circuit {
    /// An empty circuit holding only the root gates.
    pub fn new() -> Self {
        let mut circuit = Self { gates: Vec::new() };
        circuit.gates.push(Gate {
            opcode: OpCode::CircuitRoot,
            bitfield: 0,
            ins: Vec::new(),
        });
        let root = GateRef(0);
        for opcode in &ROOTS[1..] {
            circuit.new_gate(*opcode, 0, vec![root]);
        }
        circuit
    }

    /// One of the fixed root gates.
    pub fn root(&self, opcode: OpCode) -> GateRef {
        let index = ROOTS.iter().position(|&r| r == opcode);
        debug_assert!(index.is_some(), "{opcode:?} is not a root");
        GateRef(index.unwrap_or(0) as u32)
    }

    pub fn new_gate(&mut self, opcode: OpCode, bitfield: u64, ins: Vec<GateRef>) -> GateRef {
        debug_assert_eq!(
            ins.len(),
            opcode.layout(bitfield).total(),
            "wrong input count for {opcode:?}"
        );
        let gate = GateRef(self.gates.len() as u32);
        self.gates.push(Gate {
            opcode,
            bitfield,
            ins,
        });
        gate
    }

    /// A gate whose non-root inputs are all [`GateRef::NULL`].
    pub fn new_gate_with_null_ins(&mut self, opcode: OpCode, bitfield: u64) -> GateRef {
        let layout = opcode.layout(bitfield);
        let mut ins = vec![GateRef::NULL; layout.total()];
        if let Some(root) = layout.root {
            let root = self.root(root);
            if let Some(last) = ins.last_mut() {
                *last = root;
            }
        }
        self.new_gate(opcode, bitfield, ins)
    }

    pub fn gate(&self, gate: GateRef) -> &Gate {
        &self.gates[gate.index()]
    }

    pub fn opcode(&self, gate: GateRef) -> OpCode {
        self.gate(gate).opcode
    }

    pub fn bitfield(&self, gate: GateRef) -> u64 {
        self.gate(gate).bitfield
    }

    pub fn in_at(&self, gate: GateRef, index: usize) -> GateRef {
        self.gate(gate).ins[index]
    }

    pub fn set_in(&mut self, gate: GateRef, index: usize, input: GateRef) {
        self.gates[gate.index()].ins[index] = input;
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    pub fn gate_refs(&self) -> impl Iterator<Item = GateRef> + '_ {
        (0..self.gates.len() as u32).map(GateRef)
    }

    /// Gates with the given opcode, in creation order.
    pub fn gates_with(&self, opcode: OpCode) -> impl Iterator<Item = GateRef> + '_ {
        self.gate_refs().filter(move |&g| self.opcode(g) == opcode)
    }

    pub fn count(&self, opcode: OpCode) -> usize {
        self.gates_with(opcode).count()
    }

    /// Gates that take `gate` as an input.
    pub fn uses(&self, gate: GateRef) -> Vec<GateRef> {
        self.gate_refs()
            .filter(|&g| self.gate(g).ins.contains(&gate))
            .collect()
    }

    /// Checks input counts, null inputs and the class of every input.
    pub fn verify(&self) -> Result<(), VerifyError> {
        for gate in self.gate_refs() {
            self.verify_gate(gate)?;
        }
        Ok(())
    }

    fn verify_gate(&self, gate: GateRef) -> Result<(), VerifyError> {
        let g = self.gate(gate);
        let fail = |reason: String| VerifyError {
            gate,
            opcode: g.opcode,
            reason,
        };
        let layout = g.layout();
        if g.ins.len() != layout.total() {
            return Err(fail(format!(
                "has {} inputs, expected {}",
                g.ins.len(),
                layout.total()
            )));
        }
        for (index, &input) in g.ins.iter().enumerate() {
            if input.is_null() {
                return Err(fail(format!("input {index} is null")));
            }
            if input.index() >= self.gates.len() {
                return Err(fail(format!("input {index} is out of range")));
            }
            let opcode = self.opcode(input);
            let (class, ok) = if index < layout.state {
                ("state", opcode.is_state())
            } else if index < layout.value_start() {
                ("depend", opcode.is_depend())
            } else if index < layout.value_start() + layout.value {
                ("value", opcode.is_value())
            } else {
                ("root", Some(opcode) == layout.root)
            };
            if !ok {
                return Err(fail(format!("input {index} ({input}, {opcode:?}) is not a {class} gate")));
            }
        }
        if matches!(g.opcode, OpCode::ValueSelector | OpCode::DependSelector) {
            let head = g.ins[0];
            let arity = (layout.depend + layout.value) as u64;
            match self.opcode(head) {
                OpCode::Merge if self.bitfield(head) != arity => {
                    return Err(fail(format!(
                        "has {arity} inputs but its merge has {}",
                        self.bitfield(head)
                    )));
                }
                OpCode::Merge => {}
                OpCode::OrdinaryBlock if arity == 1 => {}
                other => return Err(fail(format!("is controlled by {other:?}"))),
            }
        }
        Ok(())
    }
}

impl fmt::Display for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for gate in self.gate_refs() {
            let g = self.gate(gate);
            write!(f, "{gate} = {:?}", g.opcode)?;
            match g.opcode {
                OpCode::Constant if g.bitfield == CONSTANT_UNDEFINED => write!(f, "(undefined)")?,
                OpCode::Constant | OpCode::Arg | OpCode::Merge | OpCode::JsBytecode => {
                    write!(f, "({})", g.bitfield)?
                }
                _ => {}
            }
            if !g.ins.is_empty() {
                write!(f, " [")?;
                for (i, input) in g.ins.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{input}")?;
                }
                write!(f, "]")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_circuit_has_the_roots() {
        let circuit = Circuit::new();
        assert_eq!(circuit.len(), ROOTS.len());
        for opcode in ROOTS {
            assert_eq!(circuit.opcode(circuit.root(opcode)), opcode);
        }
        assert_eq!(circuit.verify(), Ok(()));
    }

    #[test]
    fn null_inputs_fail_verification() {
        let mut circuit = Circuit::new();
        let block = circuit.new_gate_with_null_ins(OpCode::OrdinaryBlock, 0);
        let err = circuit.verify().unwrap_err();
        assert_eq!(err.gate, block);

        let entry = circuit.root(OpCode::StateEntry);
        circuit.set_in(block, 0, entry);
        assert_eq!(circuit.verify(), Ok(()));
    }

    #[test]
    fn inputs_must_have_the_right_class() {
        let mut circuit = Circuit::new();
        let state = circuit.root(OpCode::StateEntry);
        let depend = circuit.root(OpCode::DependEntry);
        let list = circuit.root(OpCode::ReturnList);
        // A depend gate in the value position.
        let ret = circuit.new_gate(OpCode::Return, 0, vec![state, depend, depend, list]);
        let err = circuit.verify().unwrap_err();
        assert_eq!(err.gate, ret);
        assert!(err.reason.contains("value"), "{err}");
    }

    #[test]
    fn selectors_match_their_merge() {
        let mut circuit = Circuit::new();
        let state = circuit.root(OpCode::StateEntry);
        let merge = circuit.new_gate(OpCode::Merge, 2, vec![state, state]);
        let arg = circuit.new_gate_with_null_ins(OpCode::Arg, 0);
        circuit.new_gate(OpCode::ValueSelector, 1, vec![merge, arg]);
        assert!(circuit.verify().is_err());

        let mut circuit = Circuit::new();
        let merge = circuit.new_gate(OpCode::Merge, 2, vec![state, state]);
        let arg = circuit.new_gate_with_null_ins(OpCode::Arg, 0);
        let phi = circuit.new_gate(OpCode::ValueSelector, 2, vec![merge, arg, arg]);
        assert_eq!(circuit.verify(), Ok(()));
        assert_eq!(circuit.uses(arg), vec![phi]);
        assert_eq!(circuit.count(OpCode::Merge), 1);
    }

    #[test]
    fn display_lists_inputs() {
        let mut circuit = Circuit::new();
        let c = circuit.new_gate_with_null_ins(OpCode::Constant, CONSTANT_UNDEFINED);
        let text = circuit.to_string();
        assert!(text.contains(&format!("{c} = Constant(undefined) [g5]")), "{text}");
    }
}
