//! Register-machine bytecode with an accumulator: opcodes, an encoder, a
//! checked decoder and per-instruction data flow summaries.

mod builder;
mod decoder;
mod instruction;
mod method;
mod op;

pub use builder::{BytecodeBuilder, Label};
pub use decoder::{BytecodeDecoder, DecodeError};
pub use instruction::{Instruction, InstructionInfo, InstructionKind};
pub use method::{MethodInfo, TryBlock};
pub use op::Op;

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Instruction> {
        BytecodeDecoder::new(bytes)
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn round_trip_narrow() {
        let mut b = BytecodeBuilder::new();
        b.load_constant(42);
        b.load_smi(-7);
        b.load_undefined();
        b.load_reg(5);
        b.store_reg(10);
        b.mov(1, 2);
        b.add(3);
        b.sub(4);
        b.less(5);
        b.equal(6);
        b.send(100, 3, 2);
        b.create_object(7, 1, 3);
        b.throw();
        b.return_undefined();
        b.return_();

        assert_eq!(decode_all(&b.into_bytes()), vec![
            Instruction::LoadConstant { idx: 42 },
            Instruction::LoadSmi { value: -7 },
            Instruction::LoadUndefined,
            Instruction::LoadReg { reg: 5 },
            Instruction::StoreReg { reg: 10 },
            Instruction::Mov { dst: 1, src: 2 },
            Instruction::Add { reg: 3 },
            Instruction::Sub { reg: 4 },
            Instruction::Less { reg: 5 },
            Instruction::Equal { reg: 6 },
            Instruction::Send { message_idx: 100, reg: 3, argc: 2 },
            Instruction::CreateObject { shape_idx: 7, values_reg: 1, count: 3 },
            Instruction::Throw,
            Instruction::ReturnUndefined,
            Instruction::Return,
        ]);
    }

    #[test]
    fn round_trip_wide() {
        let mut b = BytecodeBuilder::new();
        b.load_reg(300);
        b.store_reg(1000);
        b.send(1, 500, 4);
        b.create_object(2, 256, 1);
        b.mov(3, 700);

        assert_eq!(decode_all(&b.into_bytes()), vec![
            Instruction::LoadReg { reg: 300 },
            Instruction::StoreReg { reg: 1000 },
            Instruction::Send { message_idx: 1, reg: 500, argc: 4 },
            Instruction::CreateObject { shape_idx: 2, values_reg: 256, count: 1 },
            Instruction::Mov { dst: 3, src: 700 },
        ]);
    }

    #[test]
    fn wide_prefix_sizes() {
        let mut b = BytecodeBuilder::new();
        b.mov(1, 2);
        assert_eq!(b.as_bytes().len(), 3);

        let mut b = BytecodeBuilder::new();
        b.mov(1, 256);
        assert_eq!(b.as_bytes().len(), 6);
        assert_eq!(b.as_bytes()[0], Op::Wide as u8);
        assert_eq!(b.as_bytes()[1], Op::Mov as u8);
    }

    // ── jumps ──────────────────────────────────────────────────────

    #[test]
    fn forward_jump() {
        let mut b = BytecodeBuilder::new();
        let label = b.jump_if_false();
        b.load_smi(1);
        b.bind(label);
        b.return_();

        assert_eq!(decode_all(&b.into_bytes()), vec![
            Instruction::JumpIfFalse { offset: 5 },
            Instruction::LoadSmi { value: 1 },
            Instruction::Return,
        ]);
    }

    #[test]
    fn backward_jump() {
        let mut b = BytecodeBuilder::new();
        let top = b.current_offset();
        b.load_undefined();
        b.jump_back(top);

        assert_eq!(decode_all(&b.into_bytes()), vec![
            Instruction::LoadUndefined,
            Instruction::Jump { offset: -4 },
        ]);
    }

    #[test]
    fn decode_reports_offsets_and_lengths() {
        let mut b = BytecodeBuilder::new();
        b.load_smi(1);
        b.store_reg(300);
        b.return_();
        let bytes = b.into_bytes();
        let mut decoder = BytecodeDecoder::new(&bytes);
        let mut seen = Vec::new();
        while let Some(inst) = decoder.decode_with_offset() {
            let (offset, len, _) = inst.unwrap();
            seen.push((offset, len));
        }
        assert_eq!(seen, vec![(0, 5), (5, 4), (9, 1)]);
    }

    // ── malformed input ────────────────────────────────────────────

    #[test]
    fn unknown_opcode_is_reported() {
        let bytes = [Op::LoadUndefined as u8, 0xEE, Op::Return as u8];
        let decoded: Vec<_> = BytecodeDecoder::new(&bytes).collect();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1], Err(DecodeError::UnknownOpcode { offset: 1, byte: 0xEE }));
    }

    #[test]
    fn truncated_operand_is_reported() {
        let bytes = [Op::LoadConstant as u8, 0x01];
        let decoded: Vec<_> = BytecodeDecoder::new(&bytes).collect();
        assert_eq!(decoded, vec![Err(DecodeError::Truncated { offset: 0 })]);
    }

    #[test]
    fn wide_needs_register_operands() {
        let bytes = [Op::Wide as u8, Op::Return as u8];
        let decoded: Vec<_> = BytecodeDecoder::new(&bytes).collect();
        assert_eq!(decoded, vec![Err(DecodeError::InvalidPrefix { offset: 0, op: Op::Return })]);
    }

    #[test]
    fn try_from_rejects_out_of_range() {
        assert_eq!(Op::try_from(Op::Throw as u8), Ok(Op::Throw));
        assert_eq!(Op::try_from(Op::COUNT as u8), Err(Op::COUNT as u8));
    }

    // ── instruction info ───────────────────────────────────────────

    #[test]
    fn info_of_register_moves() {
        let load = Instruction::LoadReg { reg: 2 }.info();
        assert_eq!(load.kind, InstructionKind::Mov);
        assert!(load.acc_out && !load.acc_in);
        assert_eq!(load.vregs_in, vec![2]);

        let store = Instruction::StoreReg { reg: 4 }.info();
        assert!(store.acc_in && !store.acc_out);
        assert_eq!(store.vregs_out, vec![4]);

        let mov = Instruction::Mov { dst: 1, src: 0 }.info();
        assert_eq!((mov.vregs_in, mov.vregs_out), (vec![0], vec![1]));
    }

    #[test]
    fn info_of_sends_covers_receiver_and_arguments() {
        let info = Instruction::Send { message_idx: 0, reg: 3, argc: 2 }.info();
        assert_eq!(info.kind, InstructionKind::General);
        assert_eq!(info.vregs_in, vec![3, 4, 5]);
        assert!(info.acc_out);
        assert_eq!(info.value_count(), 3);

        let info = Instruction::CreateObject { shape_idx: 0, values_reg: 1, count: 2 }.info();
        assert_eq!(info.vregs_in, vec![1, 2]);
    }

    #[test]
    fn info_kinds_of_control_flow() {
        assert_eq!(Instruction::Jump { offset: 0 }.info().kind, InstructionKind::Jump);
        let cond = Instruction::JumpIfTrue { offset: 0 }.info();
        assert_eq!(cond.kind, InstructionKind::ConditionalJump);
        assert!(cond.acc_in);
        assert_eq!(Instruction::Return.info().kind, InstructionKind::Return);
        assert_eq!(Instruction::ReturnUndefined.info().kind, InstructionKind::ReturnUndefined);
        assert!(Instruction::Throw.info().kind.may_throw());
        assert!(!Instruction::LoadSmi { value: 0 }.info().kind.may_throw());
        assert!(Instruction::Add { reg: 0 }.info().kind.may_throw());
    }

    #[test]
    fn display_instructions() {
        assert_eq!(Instruction::LoadSmi { value: 42 }.to_string(), "LoadSmi 42");
        assert_eq!(
            Instruction::Send { message_idx: 3, reg: 1, argc: 2 }.to_string(),
            "Send #3 r1 2"
        );
        assert_eq!(Instruction::Jump { offset: -4 }.to_string(), "Jump -4");
        assert_eq!(Instruction::JumpIfFalse { offset: 5 }.to_string(), "JumpIfFalse +5");
    }

    #[test]
    fn method_arguments_follow_locals() {
        let method = MethodInfo::new("m", Vec::new(), 3, 2).with_try_block(0, 4, vec![8]);
        assert_eq!(method.register_count(), 5);
        assert_eq!(method.arg_register(1), 4);
        assert_eq!(method.try_blocks[0].handlers, vec![8]);
    }
}
