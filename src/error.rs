use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! invariant_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Invariant {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Invariant {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Errors fall into two families that callers are expected to treat differently:
///
/// ## Clean failures
///
/// The function body uses something the analysis does not model, or the bytecode is not
/// well formed. The compiler driver is expected to fall back to running the function
/// without native code. Nothing about the process is wrong.
///
/// - [`Error::Malformed`] - Structurally invalid bytecode (unbalanced blocks, bad operands)
/// - [`Error::UnsupportedOpcode`] - Generators, `with` statements, coroutines
/// - [`Error::UnknownOpcode`] - A byte that is not a known opcode
/// - [`Error::InvalidJumpTarget`] - A jump that does not land on an instruction start
/// - [`Error::InvalidLocal`] / [`Error::InvalidConst`] - Operand out of range
/// - [`Error::StackUnderflow`] - An instruction pops more values than are live
/// - [`Error::UnbalancedBlocks`] - Block stack underflow or leftover regions
/// - [`Error::IterationLimit`] - The configured iteration guard was exceeded
/// - [`Error::Empty`] - No bytecode at all
///
/// ## Invariant violations
///
/// The transfer functions and the block/exception model disagree about reachable control
/// flow, or the code generation capabilities were misused. These are internal defects;
/// compilation of the function is aborted and the state is discarded.
///
/// - [`Error::StackDepthMismatch`] - Different stack depths merge at one offset
/// - [`Error::StackKindMismatch`] - A slot is boxed on one path and unboxed on another
/// - [`Error::LocalDoubleFree`] - A backend local slot was released twice
/// - [`Error::LabelAlreadyMarked`] - A label was bound to two positions
/// - [`Error::Invariant`] - Any other broken internal invariant
///
/// Use [`Error::is_invariant_violation`] to tell them apart.
///
/// # Examples
///
/// ```rust
/// use jitscope::Error;
///
/// let err = Error::StackDepthMismatch { offset: 12, expected: 1, found: 2 };
/// assert!(err.is_invariant_violation());
///
/// let err = Error::UnsupportedOpcode { offset: 0, opcode: "YIELD_VALUE" };
/// assert!(!err.is_invariant_violation());
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The bytecode is damaged and could not be analysed.
    ///
    /// The error includes the source location where the malformation was detected for
    /// debugging purposes.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// Provided bytecode was empty.
    #[error("Provided bytecode was empty")]
    Empty,

    /// The opcode is known but not handled by the analysis.
    #[error("Unsupported opcode {opcode} at offset {offset}")]
    UnsupportedOpcode {
        /// Offset of the instruction
        offset: usize,
        /// Name of the opcode
        opcode: &'static str,
    },

    /// The byte at `offset` is not a known opcode.
    #[error("Unknown opcode byte {byte:#04x} at offset {offset}")]
    UnknownOpcode {
        /// Offset of the instruction
        offset: usize,
        /// The raw opcode byte
        byte: u8,
    },

    /// A jump lands outside the code or in the middle of an instruction.
    #[error("Invalid jump target {target} at offset {offset}")]
    InvalidJumpTarget {
        /// Offset of the jumping instruction
        offset: usize,
        /// The computed target offset
        target: usize,
    },

    /// A local slot operand is out of range.
    #[error("Invalid local index {index} at offset {offset}")]
    InvalidLocal {
        /// Offset of the instruction
        offset: usize,
        /// The local index operand
        index: usize,
    },

    /// A constant pool operand is out of range.
    #[error("Invalid constant index {index} at offset {offset}")]
    InvalidConst {
        /// Offset of the instruction
        offset: usize,
        /// The constant index operand
        index: usize,
    },

    /// An instruction popped more values than the abstract stack holds.
    #[error("Stack underflow at offset {offset}")]
    StackUnderflow {
        /// Offset of the instruction
        offset: usize,
    },

    /// A block-closing instruction had no matching block, or a region was never closed.
    #[error("Unbalanced block structure at offset {offset}")]
    UnbalancedBlocks {
        /// Offset where the imbalance was detected
        offset: usize,
    },

    /// The fixed point was not reached within the configured iteration guard.
    #[error("Analysis exceeded {0} iterations")]
    IterationLimit(usize),

    /// Two states with different stack depths merge at the same offset.
    #[error("Stack depth mismatch at offset {offset}: expected {expected}, found {found}")]
    StackDepthMismatch {
        /// The merge point
        offset: usize,
        /// Depth of the state already recorded
        expected: usize,
        /// Depth of the incoming state
        found: usize,
    },

    /// A stack slot is boxed on one incoming path and unboxed on another.
    #[error("Stack kind mismatch at offset {offset}, slot {slot}")]
    StackKindMismatch {
        /// The merge point
        offset: usize,
        /// Stack slot index, counted from the bottom
        slot: usize,
    },

    /// A backend local slot was released twice.
    #[error("Local slot {0} released twice")]
    LocalDoubleFree(u32),

    /// A backend label was bound twice.
    #[error("Label {0} bound twice")]
    LabelAlreadyMarked(u32),

    /// Any other broken internal invariant.
    #[error("Invariant violated - {file}:{line}: {message}")]
    Invariant {
        /// The message to be printed for the Invariant error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },
}

impl Error {
    /// Returns `true` for internal defects that must abort compilation of the function.
    ///
    /// Everything else is a clean failure: the caller should simply not compile the
    /// function and run it unoptimized.
    #[must_use]
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Error::StackDepthMismatch { .. }
                | Error::StackKindMismatch { .. }
                | Error::LocalDoubleFree(_)
                | Error::LabelAlreadyMarked(_)
                | Error::Invariant { .. }
        )
    }
}
