//! Human readable renderings of an analysis.
//!
//! [`AbstractInterpreter::dump`] prints one line per instruction with the
//! state recorded before it, and [`AbstractInterpreter::to_dot`] renders the
//! analysed offsets and their successor edges in Graphviz DOT format.

use std::fmt::Write;

use crate::{
    analysis::{AbstractInterpreter, EdgeKind, SourceId, SourceKind},
    utils::escape_dot,
};

impl AbstractInterpreter {
    /// A textual listing of the analysis.
    ///
    /// Each instruction line shows its offset, mnemonic, the stack bottom
    /// first, and the locals, with `?` marking a maybe-undefined local and `-`
    /// a definitely unassigned one. Unreachable instructions are listed
    /// without a state. A trailing section lists every source with its
    /// representation.
    #[must_use]
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}:", self.code().name);

        for instr in self.instructions() {
            let Some(state) = self.states.get(instr.offset).and_then(Option::as_ref) else {
                let _ = writeln!(out, "  {:>5} {:<24} <unreachable>", instr.offset, instr.to_string());
                continue;
            };

            let stack: Vec<String> = state.stack().iter().map(ToString::to_string).collect();
            let locals: Vec<String> = state
                .locals()
                .iter()
                .map(|l| {
                    if l.is_definitely_unassigned() {
                        "-".to_string()
                    } else {
                        l.to_string()
                    }
                })
                .collect();

            let _ = write!(
                out,
                "  {:>5} {:<24} [{}] ({})",
                instr.offset,
                instr.to_string(),
                stack.join(", "),
                locals.join(", ")
            );
            if self.can_raise.contains(instr.offset) {
                out.push_str(" raises");
            }
            out.push('\n');
        }

        if !self.sources.is_empty() {
            out.push_str("sources:\n");
            for (id, source) in self.sources.iter() {
                let what = match source.kind {
                    SourceKind::Local { index } => format!("local {index}"),
                    SourceKind::Const { index } => format!("const {index}"),
                    SourceKind::Intermediate => "intermediate".to_string(),
                };
                let _ = writeln!(
                    out,
                    "  {:>3} @{:<5} {:<14} {}",
                    id.0,
                    source.offset,
                    what,
                    if self.sources.escapes(id) { "boxed" } else { "unboxed" }
                );
            }
        }
        out
    }

    /// Renders the analysed offsets as a Graphviz graph.
    ///
    /// Nodes carry the instruction and its entry stack; error edges are red
    /// and finally edges blue.
    #[must_use]
    pub fn to_dot(&self) -> String {
        let mut dot = String::new();
        dot.push_str("digraph AbsInt {\n");
        let _ = writeln!(dot, "    label=\"{}\";", escape_dot(&self.code().name));
        dot.push_str("    labelloc=t;\n");
        dot.push_str("    node [shape=box, fontname=\"Courier\", fontsize=10];\n");
        dot.push_str("    edge [fontname=\"Courier\", fontsize=9];\n\n");

        for offset in self.analyzed_offsets() {
            let Some(instr) = self.instructions().get(offset) else {
                continue;
            };
            let stack = self.get_stack_info(offset).unwrap_or_default();
            let stack: Vec<String> = stack.iter().map(ToString::to_string).collect();
            let label = format!("{offset}: {instr}\\l[{}]\\l", escape_dot(&stack.join(", ")));

            let style = if offset == 0 {
                ", style=filled, fillcolor=lightgreen"
            } else if self.successors(offset).is_empty() {
                ", style=filled, fillcolor=lightcoral"
            } else {
                ""
            };
            let _ = writeln!(dot, "    n{offset} [label=\"{label}\"{style}];");
        }

        dot.push('\n');

        for offset in self.analyzed_offsets() {
            for succ in self.successors(offset) {
                let (label, color) = match succ.kind {
                    EdgeKind::Normal => ("", "black"),
                    EdgeKind::Error => ("error", "red"),
                    EdgeKind::Finally => ("finally", "blue"),
                };
                let _ = writeln!(
                    dot,
                    "    n{offset} -> n{} [label=\"{label}\", color={color}];",
                    succ.target
                );
            }
        }

        dot.push_str("}\n");
        dot
    }

    /// Every source in the representation group of the value produced at
    /// `offset`.
    #[must_use]
    pub fn source_group(&self, offset: usize) -> Vec<SourceId> {
        self.offset_sources
            .get(offset)
            .copied()
            .flatten()
            .map(|id| self.sources.group(id))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        analysis::AbstractInterpreter,
        backend::SymbolicBackend,
        bytecode::{Assembler, CodeObject, Constant, Opcode},
        config::AnalysisConfig,
        Result,
    };

    fn guarded() -> Result<AbstractInterpreter> {
        // try: x = 1.0 except: pass; return None
        let mut asm = Assembler::new();
        asm.emit_jump(Opcode::SetupExcept, "handler")?;
        asm.emit(Opcode::LoadConst, 0)?;
        asm.emit(Opcode::StoreFast, 0)?;
        asm.emit(Opcode::PopBlock, 0)?;
        asm.emit_jump(Opcode::JumpForward, "done")?;
        asm.define_label("handler")?;
        asm.emit(Opcode::PopTop, 0)?;
        asm.emit(Opcode::PopTop, 0)?;
        asm.emit(Opcode::PopTop, 0)?;
        asm.emit(Opcode::PopExcept, 0)?;
        asm.emit_jump(Opcode::JumpForward, "done")?;
        asm.emit(Opcode::EndFinally, 0)?;
        asm.define_label("done")?;
        asm.emit(Opcode::LoadConst, 1)?;
        asm.emit(Opcode::ReturnValue, 0)?;

        let code = CodeObject::new(
            "guarded",
            asm.finalize()?,
            vec![Constant::Float(1.0), Constant::None],
            1,
        );
        let mut interp = AbstractInterpreter::new(code, AnalysisConfig::default())?;
        interp.interpret(&mut SymbolicBackend::new())?;
        Ok(interp)
    }

    #[test]
    fn test_dump_lists_states() -> Result<()> {
        let interp = guarded()?;
        let dump = interp.dump();

        assert!(dump.starts_with("guarded:\n"));
        assert!(dump.contains("LOAD_CONST 0"));
        // the trailing END_FINALLY is never reached
        assert!(dump.contains("<unreachable>"));
        assert!(dump.contains("sources:"));
        assert!(dump.contains("const 1"));
        Ok(())
    }

    #[test]
    fn test_to_dot_edges() -> Result<()> {
        let interp = guarded()?;
        let dot = interp.to_dot();

        assert!(dot.starts_with("digraph AbsInt {\n"));
        assert!(dot.contains("label=\"guarded\""));
        assert!(dot.contains("fillcolor=lightgreen"));
        // SETUP_EXCEPT reaches the handler at offset 10
        assert!(dot.contains("n0 -> n10 [label=\"error\", color=red];"));
        assert!(dot.contains("n0 -> n2 [label=\"\", color=black];"));
        assert!(dot.ends_with("}\n"));
        Ok(())
    }

    #[test]
    fn test_source_group() -> Result<()> {
        let interp = guarded()?;
        assert_eq!(interp.source_group(2).len(), 1);
        assert!(interp.source_group(4).is_empty());
        Ok(())
    }
}
