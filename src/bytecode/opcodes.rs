//! Wordcode opcode table.
//!
//! Every instruction is one or more 2-byte code units: an opcode byte followed by
//! an operand byte. Opcodes below [`HAVE_ARGUMENT`] ignore their operand byte.
//! Operands wider than a byte are spelled with [`Opcode::ExtendedArg`] prefixes
//! that each contribute 8 more high bits.
//!
//! Besides the numeric values this module carries the static facts the analysis
//! needs about each opcode: whether it carries an operand, how its jump target is
//! computed ([`JumpKind`]), and whether it may raise at run time.

use strum::{Display, EnumCount, EnumIter, FromRepr, IntoStaticStr};

/// Opcodes at or above this value use their operand byte.
pub const HAVE_ARGUMENT: u8 = 90;

/// A wordcode opcode.
///
/// The `Display` and `Into<&'static str>` forms yield the canonical upper-case
/// mnemonic (`LOAD_FAST`, `POP_JUMP_IF_FALSE`, ...).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount, FromRepr, IntoStaticStr, Display,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Opcode {
    PopTop = 1,
    RotTwo = 2,
    RotThree = 3,
    DupTop = 4,
    DupTopTwo = 5,
    Nop = 9,
    UnaryPositive = 10,
    UnaryNegative = 11,
    UnaryNot = 12,
    UnaryInvert = 15,
    BinaryMatrixMultiply = 16,
    InplaceMatrixMultiply = 17,
    BinaryPower = 19,
    BinaryMultiply = 20,
    BinaryModulo = 22,
    BinaryAdd = 23,
    BinarySubtract = 24,
    BinarySubscr = 25,
    BinaryFloorDivide = 26,
    BinaryTrueDivide = 27,
    InplaceFloorDivide = 28,
    InplaceTrueDivide = 29,
    GetAiter = 50,
    GetAnext = 51,
    BeforeAsyncWith = 52,
    InplaceAdd = 55,
    InplaceSubtract = 56,
    InplaceMultiply = 57,
    InplaceModulo = 59,
    StoreSubscr = 60,
    DeleteSubscr = 61,
    BinaryLshift = 62,
    BinaryRshift = 63,
    BinaryAnd = 64,
    BinaryXor = 65,
    BinaryOr = 66,
    InplacePower = 67,
    GetIter = 68,
    GetYieldFromIter = 69,
    PrintExpr = 70,
    LoadBuildClass = 71,
    YieldFrom = 72,
    GetAwaitable = 73,
    InplaceLshift = 75,
    InplaceRshift = 76,
    InplaceAnd = 77,
    InplaceXor = 78,
    InplaceOr = 79,
    BreakLoop = 80,
    WithCleanupStart = 81,
    WithCleanupFinish = 82,
    ReturnValue = 83,
    ImportStar = 84,
    SetupAnnotations = 85,
    YieldValue = 86,
    PopBlock = 87,
    EndFinally = 88,
    PopExcept = 89,
    StoreName = 90,
    DeleteName = 91,
    UnpackSequence = 92,
    ForIter = 93,
    UnpackEx = 94,
    StoreAttr = 95,
    DeleteAttr = 96,
    StoreGlobal = 97,
    DeleteGlobal = 98,
    LoadConst = 100,
    LoadName = 101,
    BuildTuple = 102,
    BuildList = 103,
    BuildSet = 104,
    BuildMap = 105,
    LoadAttr = 106,
    CompareOp = 107,
    ImportName = 108,
    ImportFrom = 109,
    JumpForward = 110,
    JumpIfFalseOrPop = 111,
    JumpIfTrueOrPop = 112,
    JumpAbsolute = 113,
    PopJumpIfFalse = 114,
    PopJumpIfTrue = 115,
    LoadGlobal = 116,
    ContinueLoop = 119,
    SetupLoop = 120,
    SetupExcept = 121,
    SetupFinally = 122,
    LoadFast = 124,
    StoreFast = 125,
    DeleteFast = 126,
    StoreAnnotation = 127,
    RaiseVarargs = 130,
    CallFunction = 131,
    MakeFunction = 132,
    BuildSlice = 133,
    LoadClosure = 135,
    LoadDeref = 136,
    StoreDeref = 137,
    DeleteDeref = 138,
    CallFunctionKw = 141,
    CallFunctionEx = 142,
    SetupWith = 143,
    ExtendedArg = 144,
    ListAppend = 145,
    SetAdd = 146,
    MapAdd = 147,
    LoadClassderef = 148,
    BuildListUnpack = 149,
    BuildMapUnpack = 150,
    BuildMapUnpackWithCall = 151,
    BuildTupleUnpack = 152,
    BuildSetUnpack = 153,
    SetupAsyncWith = 154,
    FormatValue = 155,
    BuildConstKeyMap = 156,
    BuildString = 157,
    BuildTupleUnpackWithCall = 158,
}

/// How an instruction's operand names its jump target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    /// Not a jump.
    None,
    /// Target is the byte offset of the next instruction plus the operand.
    Relative,
    /// Target is the operand itself, as a byte offset.
    Absolute,
}

/// The arithmetic operator behind a `BINARY_*` or `INPLACE_*` opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    MatrixMultiply,
    TrueDivide,
    FloorDivide,
    Modulo,
    Power,
    LShift,
    RShift,
    And,
    Or,
    Xor,
    Subscr,
}

/// The operand of `COMPARE_OP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, Display)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum CompareOp {
    #[strum(serialize = "<")]
    Lt = 0,
    #[strum(serialize = "<=")]
    Le = 1,
    #[strum(serialize = "==")]
    Eq = 2,
    #[strum(serialize = "!=")]
    Ne = 3,
    #[strum(serialize = ">")]
    Gt = 4,
    #[strum(serialize = ">=")]
    Ge = 5,
    #[strum(serialize = "in")]
    In = 6,
    #[strum(serialize = "not in")]
    NotIn = 7,
    #[strum(serialize = "is")]
    Is = 8,
    #[strum(serialize = "is not")]
    IsNot = 9,
    #[strum(serialize = "exception match")]
    ExceptionMatch = 10,
}

impl CompareOp {
    /// Decodes a `COMPARE_OP` operand.
    #[must_use]
    pub fn from_oparg(oparg: u32) -> Option<Self> {
        u8::try_from(oparg).ok().and_then(Self::from_repr)
    }

    /// Returns `true` for the ordering comparisons (`<`, `<=`, `==`, `!=`, `>`, `>=`).
    #[must_use]
    pub fn is_rich(self) -> bool {
        (self as u8) <= (CompareOp::Ge as u8)
    }
}

impl Opcode {
    /// Decodes an opcode byte.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::from_repr(byte)
    }

    /// The opcode byte.
    #[must_use]
    pub fn byte(self) -> u8 {
        self as u8
    }

    /// The canonical mnemonic.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Returns `true` if the operand byte is meaningful.
    #[must_use]
    pub fn has_arg(self) -> bool {
        self.byte() >= HAVE_ARGUMENT
    }

    /// How the operand encodes a jump target, if at all.
    #[must_use]
    pub fn jump_kind(self) -> JumpKind {
        match self {
            Opcode::JumpForward
            | Opcode::ForIter
            | Opcode::SetupLoop
            | Opcode::SetupExcept
            | Opcode::SetupFinally
            | Opcode::SetupWith
            | Opcode::SetupAsyncWith => JumpKind::Relative,
            Opcode::JumpAbsolute
            | Opcode::PopJumpIfFalse
            | Opcode::PopJumpIfTrue
            | Opcode::JumpIfFalseOrPop
            | Opcode::JumpIfTrueOrPop
            | Opcode::ContinueLoop => JumpKind::Absolute,
            _ => JumpKind::None,
        }
    }

    /// Returns `true` if control never falls through to the next instruction.
    #[must_use]
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Opcode::JumpForward
                | Opcode::JumpAbsolute
                | Opcode::ReturnValue
                | Opcode::RaiseVarargs
                | Opcode::BreakLoop
                | Opcode::ContinueLoop
        )
    }

    /// Returns `true` if the instruction may raise for some operand.
    ///
    /// This is the static, type-agnostic answer; the interpreter refines it with
    /// the abstract values on the stack (float addition cannot raise, loading a
    /// definitely assigned local cannot raise).
    #[must_use]
    pub fn can_raise(self) -> bool {
        !matches!(
            self,
            Opcode::PopTop
                | Opcode::RotTwo
                | Opcode::RotThree
                | Opcode::DupTop
                | Opcode::DupTopTwo
                | Opcode::Nop
                | Opcode::LoadConst
                | Opcode::StoreFast
                | Opcode::JumpForward
                | Opcode::JumpAbsolute
                | Opcode::SetupLoop
                | Opcode::SetupExcept
                | Opcode::SetupFinally
                | Opcode::PopBlock
                | Opcode::PopExcept
                | Opcode::BreakLoop
                | Opcode::ContinueLoop
                | Opcode::ReturnValue
                | Opcode::LoadClosure
                | Opcode::ExtendedArg
        )
    }

    /// Returns `true` for opcodes the abstract interpreter does not model:
    /// generators, coroutines, context managers and variable annotations.
    #[must_use]
    pub fn is_unsupported(self) -> bool {
        matches!(
            self,
            Opcode::YieldValue
                | Opcode::YieldFrom
                | Opcode::GetYieldFromIter
                | Opcode::GetAwaitable
                | Opcode::GetAiter
                | Opcode::GetAnext
                | Opcode::BeforeAsyncWith
                | Opcode::SetupAsyncWith
                | Opcode::SetupWith
                | Opcode::WithCleanupStart
                | Opcode::WithCleanupFinish
                | Opcode::StoreAnnotation
        )
    }

    /// The arithmetic operator of a `BINARY_*` / `INPLACE_*` opcode.
    #[must_use]
    pub fn binary_operator(self) -> Option<BinaryOperator> {
        let op = match self {
            Opcode::BinaryAdd | Opcode::InplaceAdd => BinaryOperator::Add,
            Opcode::BinarySubtract | Opcode::InplaceSubtract => BinaryOperator::Subtract,
            Opcode::BinaryMultiply | Opcode::InplaceMultiply => BinaryOperator::Multiply,
            Opcode::BinaryMatrixMultiply | Opcode::InplaceMatrixMultiply => {
                BinaryOperator::MatrixMultiply
            }
            Opcode::BinaryTrueDivide | Opcode::InplaceTrueDivide => BinaryOperator::TrueDivide,
            Opcode::BinaryFloorDivide | Opcode::InplaceFloorDivide => BinaryOperator::FloorDivide,
            Opcode::BinaryModulo | Opcode::InplaceModulo => BinaryOperator::Modulo,
            Opcode::BinaryPower | Opcode::InplacePower => BinaryOperator::Power,
            Opcode::BinaryLshift | Opcode::InplaceLshift => BinaryOperator::LShift,
            Opcode::BinaryRshift | Opcode::InplaceRshift => BinaryOperator::RShift,
            Opcode::BinaryAnd | Opcode::InplaceAnd => BinaryOperator::And,
            Opcode::BinaryOr | Opcode::InplaceOr => BinaryOperator::Or,
            Opcode::BinaryXor | Opcode::InplaceXor => BinaryOperator::Xor,
            Opcode::BinarySubscr => BinaryOperator::Subscr,
            _ => return None,
        };
        Some(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_opcode_names() {
        assert_eq!(Opcode::LoadFast.name(), "LOAD_FAST");
        assert_eq!(Opcode::PopJumpIfFalse.to_string(), "POP_JUMP_IF_FALSE");
        assert_eq!(Opcode::BinaryTrueDivide.name(), "BINARY_TRUE_DIVIDE");
        assert_eq!(Opcode::DupTopTwo.name(), "DUP_TOP_TWO");
    }

    #[test]
    fn test_opcode_roundtrip_bytes() {
        for op in Opcode::iter() {
            assert_eq!(Opcode::from_byte(op.byte()), Some(op));
        }
        assert_eq!(Opcode::from_byte(0), None);
        assert_eq!(Opcode::from_byte(255), None);
    }

    #[test]
    fn test_opcode_arguments() {
        assert!(!Opcode::PopTop.has_arg());
        assert!(!Opcode::ReturnValue.has_arg());
        assert!(Opcode::StoreName.has_arg());
        assert!(Opcode::ExtendedArg.has_arg());
    }

    #[test]
    fn test_jump_kinds() {
        assert_eq!(Opcode::JumpForward.jump_kind(), JumpKind::Relative);
        assert_eq!(Opcode::SetupFinally.jump_kind(), JumpKind::Relative);
        assert_eq!(Opcode::PopJumpIfTrue.jump_kind(), JumpKind::Absolute);
        assert_eq!(Opcode::ContinueLoop.jump_kind(), JumpKind::Absolute);
        assert_eq!(Opcode::LoadFast.jump_kind(), JumpKind::None);
    }

    #[test]
    fn test_binary_operators() {
        assert_eq!(
            Opcode::InplaceAdd.binary_operator(),
            Some(BinaryOperator::Add)
        );
        assert_eq!(
            Opcode::BinarySubscr.binary_operator(),
            Some(BinaryOperator::Subscr)
        );
        assert_eq!(Opcode::CompareOp.binary_operator(), None);
    }

    #[test]
    fn test_compare_ops() {
        assert_eq!(CompareOp::from_oparg(0), Some(CompareOp::Lt));
        assert_eq!(CompareOp::from_oparg(10), Some(CompareOp::ExceptionMatch));
        assert_eq!(CompareOp::from_oparg(11), None);
        assert_eq!(CompareOp::from_oparg(1 << 20), None);
        assert!(CompareOp::Ge.is_rich());
        assert!(!CompareOp::Is.is_rich());
        assert_eq!(CompareOp::NotIn.to_string(), "not in");
    }

    #[test]
    fn test_unsupported() {
        assert!(Opcode::YieldValue.is_unsupported());
        assert!(Opcode::SetupWith.is_unsupported());
        assert!(!Opcode::SetupFinally.is_unsupported());
    }
}
