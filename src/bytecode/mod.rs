//! Source program representation.
//!
//! The analysis consumes a function body as a [`CodeObject`]: a wordcode buffer, its
//! constant pool, and the shape of its locals. This module also holds the opcode
//! table, the decoder that folds `EXTENDED_ARG` prefixes, and the [`Assembler`]
//! used to produce wordcode with symbolic labels.
//!
//! # Key Components
//!
//! - [`Opcode`] - Opcode numbers, names and static metadata
//! - [`Instruction`] / [`Instructions`] - Decoded instructions indexed by offset
//! - [`Assembler`] - Label-resolving wordcode builder
//! - [`CodeObject`] / [`Constant`] - The function being compiled

mod assembler;
mod decoder;
mod opcodes;

pub use assembler::Assembler;
pub use decoder::{decode_instruction, decode_stream, Instruction, Instructions};
pub use opcodes::{BinaryOperator, CompareOp, JumpKind, Opcode, HAVE_ARGUMENT};

use crate::analysis::AbstractValueKind;

/// An entry of a function's constant pool.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// `None`
    None,
    /// `True` / `False`
    Bool(bool),
    /// An integer that fits a machine word
    Int(i64),
    /// A float
    Float(f64),
    /// A complex number as (real, imaginary)
    Complex(f64, f64),
    /// A text string
    Str(String),
    /// A byte string
    Bytes(Vec<u8>),
    /// A tuple of constants
    Tuple(Vec<Constant>),
    /// A frozenset of constants
    FrozenSet(Vec<Constant>),
    /// A nested code object, by name
    Code(String),
    /// `...`
    Ellipsis,
}

impl Constant {
    /// The abstract kind a `LOAD_CONST` of this constant pushes.
    #[must_use]
    pub fn kind(&self) -> AbstractValueKind {
        match self {
            Constant::None => AbstractValueKind::None,
            Constant::Bool(_) => AbstractValueKind::Bool,
            Constant::Int(_) => AbstractValueKind::Integer,
            Constant::Float(_) => AbstractValueKind::Float,
            Constant::Complex(..) => AbstractValueKind::Complex,
            Constant::Str(_) => AbstractValueKind::String,
            Constant::Bytes(_) => AbstractValueKind::Bytes,
            Constant::Tuple(_) => AbstractValueKind::Tuple,
            Constant::FrozenSet(_) | Constant::Code(_) | Constant::Ellipsis => {
                AbstractValueKind::Any
            }
        }
    }
}

/// A function body to analyse.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeObject {
    /// Function name, used in diagnostics
    pub name: String,
    /// Wordcode
    pub bytecode: Vec<u8>,
    /// Constant pool
    pub consts: Vec<Constant>,
    /// Number of fast locals, parameters included
    pub local_count: usize,
    /// Number of parameters; they occupy the first local slots
    pub arg_count: usize,
    /// Declared kind of each parameter; missing entries are [`AbstractValueKind::Any`]
    pub param_kinds: Vec<AbstractValueKind>,
}

impl CodeObject {
    /// Creates a code object without parameters.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        bytecode: Vec<u8>,
        consts: Vec<Constant>,
        local_count: usize,
    ) -> Self {
        Self {
            name: name.into(),
            bytecode,
            consts,
            local_count,
            arg_count: 0,
            param_kinds: Vec::new(),
        }
    }

    /// Declares the first `kinds.len()` locals as parameters of the given kinds.
    #[must_use]
    pub fn with_params(mut self, kinds: Vec<AbstractValueKind>) -> Self {
        self.arg_count = kinds.len();
        self.param_kinds = kinds;
        self
    }

    /// The declared kind of parameter `index`.
    #[must_use]
    pub fn param_kind(&self, index: usize) -> AbstractValueKind {
        self.param_kinds
            .get(index)
            .copied()
            .unwrap_or(AbstractValueKind::Any)
    }
}
