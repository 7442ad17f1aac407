//! Symbolic wordcode assembler.
//!
//! The [`Assembler`] collects instructions whose jump operands name labels instead
//! of offsets, then lays the code out in a final pass. Because an operand wider
//! than one byte needs `EXTENDED_ARG` prefixes, the size of a jump depends on the
//! distance it spans, which in turn depends on the size of the jumps in between.
//! Layout therefore iterates until the instruction sizes stop growing.
//!
//! # Example
//!
//! ```rust
//! use jitscope::bytecode::{Assembler, Opcode};
//!
//! let mut asm = Assembler::new();
//! asm.emit(Opcode::LoadFast, 0)?;
//! asm.emit_jump(Opcode::PopJumpIfFalse, "else")?;
//! asm.emit(Opcode::LoadConst, 0)?;
//! asm.emit(Opcode::ReturnValue, 0)?;
//! asm.define_label("else")?;
//! asm.emit(Opcode::LoadConst, 1)?;
//! asm.emit(Opcode::ReturnValue, 0)?;
//!
//! let code = asm.finalize()?;
//! assert_eq!(code, vec![124, 0, 114, 8, 100, 0, 83, 0, 100, 1, 83, 0]);
//! # Ok::<(), jitscope::Error>(())
//! ```

use std::collections::HashMap;

use crate::{
    bytecode::{JumpKind, Opcode},
    Result,
};

/// Operand of an assembled instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AsmOperand {
    Value(u32),
    Label(String),
}

#[derive(Debug, Clone)]
struct AsmInstruction {
    opcode: Opcode,
    operand: AsmOperand,
}

/// Builds wordcode from instructions with symbolic jump labels.
#[derive(Debug, Default)]
pub struct Assembler {
    instructions: Vec<AsmInstruction>,
    /// Label name to the index of the instruction it precedes
    labels: HashMap<String, usize>,
}

impl Assembler {
    /// Creates an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an instruction with a literal operand.
    ///
    /// Jump opcodes may be emitted this way too; the operand is then used as
    /// is, exactly as it will appear in the output.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] for `EXTENDED_ARG` (prefixes are
    /// produced by layout) or a non-zero operand on an opcode without one.
    pub fn emit(&mut self, opcode: Opcode, oparg: u32) -> Result<()> {
        if opcode == Opcode::ExtendedArg {
            return Err(malformed_error!("EXTENDED_ARG is emitted by layout"));
        }
        if !opcode.has_arg() && oparg != 0 {
            return Err(malformed_error!("{} takes no operand", opcode));
        }

        self.instructions.push(AsmInstruction {
            opcode,
            operand: AsmOperand::Value(oparg),
        });
        Ok(())
    }

    /// Appends a jump whose target is the label `label`.
    ///
    /// The label may be defined before or after the jump.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if `opcode` is not a jump.
    pub fn emit_jump(&mut self, opcode: Opcode, label: &str) -> Result<()> {
        if opcode.jump_kind() == JumpKind::None {
            return Err(malformed_error!("{} is not a jump", opcode));
        }

        self.instructions.push(AsmInstruction {
            opcode,
            operand: AsmOperand::Label(label.to_string()),
        });
        Ok(())
    }

    /// Binds `name` to the position of the next emitted instruction.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if the label is already defined.
    pub fn define_label(&mut self, name: &str) -> Result<()> {
        if self.labels.contains_key(name) {
            return Err(malformed_error!("Label '{}' defined twice", name));
        }
        self.labels.insert(name.to_string(), self.instructions.len());
        Ok(())
    }

    /// Number of instructions emitted so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Returns `true` if nothing was emitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Lays out the code and resolves every label.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] for an undefined label or a relative
    /// jump that points backwards.
    pub fn finalize(self) -> Result<Vec<u8>> {
        let offsets = self.layout()?;

        let mut code = Vec::with_capacity(offsets.last().copied().unwrap_or(0));
        for (i, instr) in self.instructions.iter().enumerate() {
            let oparg = self.resolve(i, &offsets)?;
            let units = Self::units(oparg);
            for shift in (1..units).rev() {
                code.push(Opcode::ExtendedArg.byte());
                code.push(((oparg >> (8 * shift)) & 0xFF) as u8);
            }
            code.push(instr.opcode.byte());
            code.push((oparg & 0xFF) as u8);
        }

        Ok(code)
    }

    /// Computes the start offset of every instruction, plus the end offset.
    fn layout(&self) -> Result<Vec<usize>> {
        let mut sizes = vec![1usize; self.instructions.len()];
        loop {
            let offsets = Self::offsets(&sizes);
            let mut changed = false;
            for i in 0..self.instructions.len() {
                let units = Self::units(self.resolve(i, &offsets)?);
                if units > sizes[i] {
                    sizes[i] = units;
                    changed = true;
                }
            }
            if !changed {
                return Ok(offsets);
            }
        }
    }

    fn offsets(sizes: &[usize]) -> Vec<usize> {
        let mut offsets = Vec::with_capacity(sizes.len() + 1);
        let mut offset = 0;
        for size in sizes {
            offsets.push(offset);
            offset += size * 2;
        }
        offsets.push(offset);
        offsets
    }

    /// Number of code units needed to carry `oparg`.
    fn units(oparg: u32) -> usize {
        match oparg {
            0..=0xFF => 1,
            0x100..=0xFFFF => 2,
            0x1_0000..=0xFF_FFFF => 3,
            _ => 4,
        }
    }

    fn resolve(&self, index: usize, offsets: &[usize]) -> Result<u32> {
        let instr = &self.instructions[index];
        let name = match &instr.operand {
            AsmOperand::Value(v) => return Ok(*v),
            AsmOperand::Label(name) => name,
        };

        let target_index = *self
            .labels
            .get(name)
            .ok_or_else(|| malformed_error!("Undefined label '{}'", name))?;
        let target = offsets[target_index];

        let value = match instr.opcode.jump_kind() {
            JumpKind::Relative => {
                let next = offsets[index + 1];
                target.checked_sub(next).ok_or_else(|| {
                    malformed_error!("{} to '{}' jumps backwards", instr.opcode, name)
                })?
            }
            _ => target,
        };

        u32::try_from(value).map_err(|_| malformed_error!("Jump to '{}' out of range", name))
    }
}
