// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]

//! # jitscope
//!
//! The analysis front end of a method-at-a-time JIT for a stack-based bytecode
//! (CPython 3.6 wordcode). Before a function is compiled, `jitscope` runs an
//! abstract interpreter over it and records, for every reachable instruction:
//!
//! - the abstract kind of every evaluation stack slot and fast local
//! - whether each local may be unassigned
//! - which values may stay unboxed and which must be materialized as objects
//! - whether the instruction can raise at all
//!
//! It also models loop and exception regions, so `break`, `continue`,
//! `return` and raised errors reach the right handler with the right stack,
//! and it lays out the shared cleanup chains that release live values when an
//! instruction fails.
//!
//! ## Features
//!
//! - **Monotone fixed point** - Every domain is a finite-height lattice, so the
//!   worklist always drains
//! - **Escape analysis** - Unboxed floats stay unboxed until something forces
//!   them into an object
//! - **Exception regions** - try/except, try/finally and loops, including
//!   `break` and `return` through finally bodies
//! - **Pluggable code generation** - Labels and locals are allocated through the
//!   [`backend::Backend`] trait
//! - **Parallel batches** - [`analysis::analyze_batch`] analyses many functions on
//!   the rayon thread pool
//!
//! ## Quick Start
//!
//! ```rust
//! use jitscope::prelude::*;
//!
//! // def f(): x = 2.0; y = x + x; return None
//! let mut asm = Assembler::new();
//! asm.emit(Opcode::LoadConst, 0)?;
//! asm.emit(Opcode::StoreFast, 0)?;
//! asm.emit(Opcode::LoadFast, 0)?;
//! asm.emit(Opcode::LoadFast, 0)?;
//! asm.emit(Opcode::BinaryAdd, 0)?;
//! asm.emit(Opcode::StoreFast, 1)?;
//! asm.emit(Opcode::LoadConst, 1)?;
//! asm.emit(Opcode::ReturnValue, 0)?;
//! let code = CodeObject::new("f", asm.finalize()?, vec![Constant::Float(2.0), Constant::None], 2);
//!
//! let mut backend = SymbolicBackend::new();
//! let mut interp = AbstractInterpreter::new(code, AnalysisConfig::default())?;
//! interp.interpret(&mut backend)?;
//!
//! assert_eq!(interp.get_local_info(12, 1).map(|l| l.kind()), Some(AbstractValue::FLOAT));
//! assert!(!interp.should_box(8));
//! # Ok::<(), jitscope::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`bytecode`] - Opcodes, the wordcode decoder and a small assembler
//! - [`analysis`] - Abstract values, states, regions and the interpreter
//! - [`backend`] - The code generator facing allocation interface
//! - [`config`] - Analysis knobs
//! - [`prelude`] - Convenient re-exports of commonly used types
//! - [`Error`] and [`Result`] - Error handling
//!
//! ## Logging
//!
//! The crate logs through the [`log`] facade: one `debug` line per analysed
//! function, `trace` lines per worklist step, `warn` when a function is given
//! up on and `error` on internal invariant violations. Install any `log`
//! compatible logger to see them.

#[macro_use]
pub(crate) mod error;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust
/// use jitscope::prelude::*;
///
/// let code = CodeObject::new("f", vec![100, 0, 83, 0], vec![Constant::None], 0);
/// let mut interp = AbstractInterpreter::new(code, AnalysisConfig::default())?;
/// interp.interpret(&mut SymbolicBackend::new())?;
/// # Ok::<(), jitscope::Error>(())
/// ```
pub mod prelude;

pub mod analysis;
pub mod backend;
pub mod bytecode;
pub mod config;
pub mod utils;

/// `jitscope` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
/// This is used consistently throughout the crate for all fallible operations.
pub type Result<T> = std::result::Result<T, Error>;

/// `jitscope` Error type
///
/// The main error type for all operations in this crate. Clean failures mean
/// the function should run uncompiled; see [`Error::is_invariant_violation`].
///
/// # Examples
///
/// ```rust
/// use jitscope::prelude::*;
///
/// let code = CodeObject::new("f", vec![1, 0], vec![], 0);
/// let mut interp = AbstractInterpreter::new(code, AnalysisConfig::default())?;
/// match interp.interpret(&mut SymbolicBackend::new()) {
///     Err(Error::StackUnderflow { offset }) => assert_eq!(offset, 0),
///     other => panic!("unexpected {other:?}"),
/// }
/// # Ok::<(), jitscope::Error>(())
/// ```
pub use error::Error;
