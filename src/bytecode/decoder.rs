//! Wordcode decoding.
//!
//! This module turns a raw wordcode buffer into [`Instruction`]s. Each decoded
//! instruction starts at the offset of its first code unit, which is the first
//! `EXTENDED_ARG` prefix when the operand needed one; prefixes are folded into the
//! operand and never appear as instructions of their own. Jump targets point at
//! these start offsets.
//!
//! # Example: Decoding a Stream of Instructions
//!
//! ```rust
//! use jitscope::bytecode::{decode_stream, Opcode};
//!
//! // LOAD_CONST 0; EXTENDED_ARG 1; LOAD_FAST 2; RETURN_VALUE
//! let code = [100, 0, 144, 1, 124, 2, 83, 0];
//! let instrs = decode_stream(&code)?;
//! assert_eq!(instrs.len(), 3);
//! assert_eq!(instrs[1].offset, 2);
//! assert_eq!(instrs[1].opcode, Opcode::LoadFast);
//! assert_eq!(instrs[1].oparg, 0x102);
//! assert_eq!(instrs[1].next, 6);
//! # Ok::<(), jitscope::Error>(())
//! ```

use std::ops::Index;

use crate::{
    bytecode::{JumpKind, Opcode},
    Error, Result,
};

/// A decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// Offset of the first code unit, including `EXTENDED_ARG` prefixes
    pub offset: usize,
    /// The opcode
    pub opcode: Opcode,
    /// The full operand with all prefixes folded in
    pub oparg: u32,
    /// Offset of the following instruction
    pub next: usize,
}

impl Instruction {
    /// The byte offset this instruction jumps to, if it is a jump.
    #[must_use]
    pub fn jump_target(&self) -> Option<usize> {
        match self.opcode.jump_kind() {
            JumpKind::None => None,
            JumpKind::Relative => Some(self.next + self.oparg as usize),
            JumpKind::Absolute => Some(self.oparg as usize),
        }
    }

    /// Returns the operand as an index.
    #[must_use]
    pub fn arg(&self) -> usize {
        self.oparg as usize
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.opcode.has_arg() {
            write!(f, "{} {}", self.opcode, self.oparg)
        } else {
            write!(f, "{}", self.opcode)
        }
    }
}

/// Decodes the instruction starting at `offset`.
///
/// # Arguments
///
/// * `code` - The wordcode buffer
/// * `offset` - Offset of the first code unit of the instruction
///
/// # Errors
///
/// Returns [`Error::UnknownOpcode`] for a byte that is not an opcode, and
/// [`Error::Malformed`] when the buffer ends inside an instruction or the
/// offset is not code-unit aligned.
pub fn decode_instruction(code: &[u8], offset: usize) -> Result<Instruction> {
    if offset % 2 != 0 {
        return Err(malformed_error!("Instruction offset {} is not aligned", offset));
    }

    let mut pos = offset;
    let mut oparg: u32 = 0;
    loop {
        let (Some(&byte), Some(&arg)) = (code.get(pos), code.get(pos + 1)) else {
            return Err(malformed_error!(
                "Code ends inside the instruction at offset {}",
                offset
            ));
        };
        let opcode = Opcode::from_byte(byte).ok_or(Error::UnknownOpcode { offset: pos, byte })?;

        oparg = oparg
            .checked_shl(8)
            .filter(|_| oparg <= 0x00FF_FFFF)
            .ok_or_else(|| malformed_error!("Operand overflow at offset {}", offset))?
            | u32::from(arg);
        pos += 2;

        if opcode != Opcode::ExtendedArg {
            return Ok(Instruction {
                offset,
                opcode,
                oparg: if opcode.has_arg() { oparg } else { 0 },
                next: pos,
            });
        }
    }
}

/// Decodes a whole wordcode buffer.
///
/// # Errors
///
/// Returns [`Error::Empty`] for an empty buffer, and any error of
/// [`decode_instruction`].
pub fn decode_stream(code: &[u8]) -> Result<Vec<Instruction>> {
    if code.is_empty() {
        return Err(Error::Empty);
    }
    if code.len() % 2 != 0 {
        return Err(malformed_error!(
            "Code length {} is not a multiple of the code unit size",
            code.len()
        ));
    }

    let mut instructions = Vec::new();
    let mut offset = 0;
    while offset < code.len() {
        let instruction = decode_instruction(code, offset)?;
        offset = instruction.next;
        instructions.push(instruction);
    }

    Ok(instructions)
}

/// Decoded instructions indexed by start offset.
///
/// Construction validates that every jump lands on an instruction start.
#[derive(Debug, Clone)]
pub struct Instructions {
    list: Vec<Instruction>,
    /// Maps a byte offset to the position in `list` of the instruction starting there
    by_offset: Vec<Option<usize>>,
}

impl Instructions {
    /// Decodes and indexes `code`.
    ///
    /// # Errors
    ///
    /// Any decoding error, or [`Error::InvalidJumpTarget`] for a jump that does
    /// not land on an instruction start.
    pub fn decode(code: &[u8]) -> Result<Self> {
        let list = decode_stream(code)?;
        let mut by_offset = vec![None; code.len()];
        for (i, instr) in list.iter().enumerate() {
            by_offset[instr.offset] = Some(i);
        }

        let instructions = Instructions { list, by_offset };
        for instr in &instructions.list {
            if let Some(target) = instr.jump_target() {
                if !instructions.contains(target) {
                    return Err(Error::InvalidJumpTarget {
                        offset: instr.offset,
                        target,
                    });
                }
            }
        }

        Ok(instructions)
    }

    /// The instruction starting at `offset`.
    #[must_use]
    pub fn get(&self, offset: usize) -> Option<&Instruction> {
        self.by_offset
            .get(offset)
            .copied()
            .flatten()
            .map(|i| &self.list[i])
    }

    /// Returns `true` if an instruction starts at `offset`.
    #[must_use]
    pub fn contains(&self, offset: usize) -> bool {
        self.get(offset).is_some()
    }

    /// Number of instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Returns `true` if there are no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Size of the code in bytes.
    #[must_use]
    pub fn code_len(&self) -> usize {
        self.by_offset.len()
    }

    /// Iterates the instructions in offset order.
    pub fn iter(&self) -> std::slice::Iter<'_, Instruction> {
        self.list.iter()
    }
}

impl Index<usize> for Instructions {
    type Output = Instruction;

    fn index(&self, index: usize) -> &Instruction {
        &self.list[index]
    }
}

impl<'a> IntoIterator for &'a Instructions {
    type Item = &'a Instruction;
    type IntoIter = std::slice::Iter<'a, Instruction>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
