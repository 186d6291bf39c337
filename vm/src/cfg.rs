//! Text dump of a translated method.

use std::fmt::Write;

use bytecode::MethodInfo;
use circuit::{CircuitBuilder, OpCode, TranslateError, Translation};

const GATE_SUMMARY: [OpCode; 10] = [
    OpCode::OrdinaryBlock,
    OpCode::Merge,
    OpCode::IfTrue,
    OpCode::IfFalse,
    OpCode::ValueSelector,
    OpCode::DependSelector,
    OpCode::JsBytecode,
    OpCode::IfException,
    OpCode::Return,
    OpCode::Throw,
];

fn id_list(ids: impl IntoIterator<Item = usize>) -> String {
    let ids: Vec<String> = ids.into_iter().map(|id| format!("b{id}")).collect();
    format!("[{}]", ids.join(", "))
}

pub fn dump_method(method: &MethodInfo) -> Result<String, TranslateError> {
    let translation = CircuitBuilder::translate(method)?;
    Ok(render(method, &translation))
}

fn render(method: &MethodInfo, translation: &Translation) -> String {
    let graph = &translation.graph;
    let circuit = &translation.circuit;
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = writeln!(
        out,
        "method {} ({} vregs, {} args, {} bytes)",
        method.name,
        method.num_vregs,
        method.num_args,
        method.bytecode.len()
    );
    for block in &graph.blocks {
        let _ = write!(out, "b{} [{}, {})", block.id, block.start, block.end);
        if block.is_dead {
            let _ = writeln!(out, " dead");
            continue;
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "  preds {} succs {}", id_list(block.preds.iter().copied()), id_list(block.succs.iter().copied()));
        if !block.catches.is_empty() {
            let _ = writeln!(out, "  catches {}", id_list(block.catches.iter().copied()));
        }
        let idom = block.idom.map_or_else(|| "-".to_string(), |d| format!("b{d}"));
        let _ = writeln!(
            out,
            "  idom {idom} frontier {}",
            id_list(block.dom_frontiers.iter().copied())
        );
        if !block.phis.is_empty() {
            let regs: Vec<String> = block.phis.iter().map(|r| format!("r{r}")).collect();
            let _ = writeln!(out, "  phis [{}]", regs.join(", "));
        }
        for inst in graph.instructions(block.id) {
            let gate = translation
                .gate_at(inst.offset)
                .map_or_else(String::new, |g| format!("  -> {g}"));
            let _ = writeln!(out, "  {:4}: {}{gate}", inst.offset, inst.inst);
        }
    }
    let _ = writeln!(out, "circuit: {} gates", circuit.len());
    for opcode in GATE_SUMMARY {
        let count = circuit.count(opcode);
        if count > 0 {
            let _ = writeln!(out, "  {opcode:?}: {count}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use circuit::samples;

    #[test]
    fn every_sample_dumps() {
        for name in samples::NAMES {
            let method = samples::by_name(name).unwrap();
            let text = dump_method(&method).unwrap();
            assert!(text.starts_with("method "), "{name}: {text}");
            assert!(text.contains("b0 [0, "), "{name}: {text}");
            assert!(text.contains("circuit: "), "{name}: {text}");
        }
    }

    #[test]
    fn diamond_dump_shows_join() {
        let text = dump_method(&samples::diamond()).unwrap();
        assert!(text.contains("phis [r0]"), "{text}");
        assert!(text.contains("Merge: 1"), "{text}");
        assert!(text.contains("ValueSelector"), "{text}");
        assert!(text.contains("idom b0"), "{text}");
    }

    #[test]
    fn try_catch_dump_lists_handler() {
        let text = dump_method(&samples::try_catch()).unwrap();
        assert!(text.contains("catches [b"), "{text}");
        assert!(text.contains("IfException"), "{text}");
    }
}
