//! Abstract interpretation of wordcode functions.
//!
//! This module computes, for every reachable instruction of a function, what
//! the evaluation stack and the fast locals may hold just before it runs. A
//! code generator uses the result to keep float arithmetic unboxed, to drop
//! bookkeeping before instructions that cannot fail, and to lay out the
//! cleanup paths taken when an instruction raises.
//!
//! # Architecture
//!
//! The analysis module is organized into focused sub-modules:
//!
//! - [`value`] - The kind lattice and the per-operation transfer rules
//! - [`lattice`] - The join semilattice abstraction shared by the domains
//! - [`sources`] - Value provenance and shared representation groups
//! - [`state`] - Stack slots, locals and whole interpreter states
//! - [`blocks`] - Loop and exception regions, handlers and unwinding
//! - [`raise`] - Raise-and-free cleanup chains
//! - [`interpreter`] - The worklist fixed point and transfer functions
//!
//! Read-only queries over a finished analysis and its text and DOT renderings
//! are implemented on [`AbstractInterpreter`] directly.
//!
//! # Usage
//!
//! ```rust
//! use jitscope::prelude::*;
//!
//! let mut asm = Assembler::new();
//! asm.emit(Opcode::LoadConst, 0)?;
//! asm.emit(Opcode::LoadConst, 0)?;
//! asm.emit(Opcode::BinaryAdd, 0)?;
//! asm.emit(Opcode::StoreFast, 0)?;
//! asm.emit(Opcode::LoadConst, 1)?;
//! asm.emit(Opcode::ReturnValue, 0)?;
//! let code = CodeObject::new("f", asm.finalize()?, vec![Constant::Float(0.5), Constant::None], 1);
//!
//! let mut interp = AbstractInterpreter::new(code, AnalysisConfig::default())?;
//! interp.interpret(&mut SymbolicBackend::new())?;
//!
//! assert!(!interp.should_box(4));
//! assert!(interp.can_skip_lasti_update(4));
//! # Ok::<(), jitscope::Error>(())
//! ```

pub mod blocks;
mod dump;
pub mod interpreter;
pub mod lattice;
mod query;
pub mod raise;
pub mod sources;
pub mod state;
pub mod value;

// Re-export primary types at module level
pub use blocks::{
    AbsIntBlockInfo, BlockId, BlockInfo, BlockKind, BlockModel, BranchKind, EhFlags,
    ExceptionHandler, ExceptionVars, HandlerChain, HandlerId, HandlerLabels, RegionState,
    UnwindPlan, UnwindStep,
};
pub use interpreter::{analyze_batch, AbstractInterpreter, EdgeKind, Successor};
pub use lattice::JoinSemiLattice;
pub use raise::{ChainStep, RaiseAndFreeChains, RaiseSite};
pub use sources::{AbstractSource, SourceId, SourceKind, SourceTable};
pub use state::{AbstractLocalInfo, AbstractValueWithSources, InterpreterState, StackKind};
pub use value::{AbstractValue, AbstractValueKind, Truthiness};
