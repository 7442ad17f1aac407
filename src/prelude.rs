//! # jitscope Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the jitscope library. Import this module to get quick access to everything
//! needed to assemble a function, analyse it and query the result.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all jitscope operations
pub use crate::Error;

/// The result type used throughout jitscope
pub use crate::Result;

/// Analysis knobs
pub use crate::config::AnalysisConfig;

// ================================================================================================
// Bytecode
// ================================================================================================

/// Functions, constants and opcodes
pub use crate::bytecode::{Assembler, CodeObject, CompareOp, Constant, Instruction, Instructions, Opcode};

// ================================================================================================
// Analysis
// ================================================================================================

/// Main entry point
pub use crate::analysis::{analyze_batch, AbstractInterpreter, EdgeKind, Successor};

/// Abstract values and states
pub use crate::analysis::{
    AbstractLocalInfo, AbstractValue, AbstractValueKind, AbstractValueWithSources,
    JoinSemiLattice, StackKind, Truthiness,
};

/// Regions and handlers
pub use crate::analysis::{BlockKind, BlockModel, ExceptionHandler, HandlerId};

// ================================================================================================
// Code Generation Interface
// ================================================================================================

/// Label and local allocation
pub use crate::backend::{Backend, Label, Local, LocalKind, Method, SymbolicBackend};
