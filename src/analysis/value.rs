//! The abstract value domain.
//!
//! An [`AbstractValue`] is one of a small closed set of kinds. Values are
//! flyweights: the type is a `Copy` tag, and everything the analysis knows about a
//! kind lives in a static table indexed by that tag, so comparing two values is a
//! tag comparison and no value is ever allocated.
//!
//! # Lattice
//!
//! The kinds form a lattice of height two:
//!
//! ```text
//!                 Any
//!   /    /    /    |    \    \     \
//! Bool Integer Float None String ... Iterable
//!   \    \    \    |    /    /     /
//!               Undefined
//! ```
//!
//! `Undefined` only appears in locals that were never assigned; joining it
//! with any kind yields that kind. Joining two different specific kinds widens
//! to `Any`.
//!
//! # Transfer helpers
//!
//! [`AbstractValue::binary`], [`AbstractValue::unary`] and
//! [`AbstractValue::compare`] give the result kind of the corresponding
//! operation. They are deliberately conservative: whenever the language allows a
//! user type or an overflow to change the result type the answer is `Any`.

use strum::{Display, EnumCount, EnumIter, IntoStaticStr};

use crate::bytecode::{BinaryOperator, CompareOp, Opcode};

/// The closed set of abstract value kinds.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    EnumIter,
    EnumCount,
    IntoStaticStr,
    Display,
)]
pub enum AbstractValueKind {
    /// Never assigned (locals only)
    Undefined,
    /// Any object; nothing is known
    Any,
    /// `int`
    Integer,
    /// `float`
    Float,
    /// `bool`
    Bool,
    /// `None`
    None,
    /// `str`
    String,
    /// `bytes`
    Bytes,
    /// `list`
    List,
    /// `tuple`
    Tuple,
    /// `dict`
    Dict,
    /// `set`
    Set,
    /// A function object
    Function,
    /// `slice`
    Slice,
    /// `complex`
    Complex,
    /// An iterator returned by `GET_ITER`
    Iterable,
}

/// What is statically known about the truth value of a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truthiness {
    /// Depends on the value
    Unknown,
    /// Every value of the kind is truthy
    AlwaysTrue,
    /// Every value of the kind is falsy
    AlwaysFalse,
}

struct KindInfo {
    unboxable: bool,
    truthiness: Truthiness,
}

const fn info(unboxable: bool, truthiness: Truthiness) -> KindInfo {
    KindInfo {
        unboxable,
        truthiness,
    }
}

/// Indexed by `AbstractValueKind as usize`; order must match the enum.
static KIND_INFO: [KindInfo; AbstractValueKind::COUNT] = [
    info(false, Truthiness::Unknown),     // Undefined
    info(false, Truthiness::Unknown),     // Any
    info(false, Truthiness::Unknown),     // Integer
    info(true, Truthiness::Unknown),      // Float
    info(true, Truthiness::Unknown),      // Bool
    info(false, Truthiness::AlwaysFalse), // None
    info(false, Truthiness::Unknown),     // String
    info(false, Truthiness::Unknown),     // Bytes
    info(false, Truthiness::Unknown),     // List
    info(false, Truthiness::Unknown),     // Tuple
    info(false, Truthiness::Unknown),     // Dict
    info(false, Truthiness::Unknown),     // Set
    info(false, Truthiness::AlwaysTrue),  // Function
    info(false, Truthiness::AlwaysTrue),  // Slice
    info(false, Truthiness::Unknown),     // Complex
    info(false, Truthiness::AlwaysTrue),  // Iterable
];

/// An interned abstract value.
///
/// # Examples
///
/// ```rust
/// use jitscope::analysis::{AbstractValue, AbstractValueKind, JoinSemiLattice};
/// use jitscope::bytecode::Opcode;
///
/// let f = AbstractValue::FLOAT;
/// assert_eq!(f.binary(Opcode::BinaryAdd, AbstractValue::INTEGER), AbstractValue::FLOAT);
/// assert_eq!(f.join(&AbstractValue::INTEGER), AbstractValue::ANY);
/// assert_eq!(AbstractValue::UNDEFINED.join(&f), f);
/// assert_eq!(f.kind(), AbstractValueKind::Float);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AbstractValue(AbstractValueKind);

impl AbstractValue {
    /// Never assigned.
    pub const UNDEFINED: Self = Self(AbstractValueKind::Undefined);
    /// Unknown object.
    pub const ANY: Self = Self(AbstractValueKind::Any);
    /// `int`.
    pub const INTEGER: Self = Self(AbstractValueKind::Integer);
    /// `float`.
    pub const FLOAT: Self = Self(AbstractValueKind::Float);
    /// `bool`.
    pub const BOOL: Self = Self(AbstractValueKind::Bool);
    /// `None`.
    pub const NONE: Self = Self(AbstractValueKind::None);
    /// `str`.
    pub const STRING: Self = Self(AbstractValueKind::String);

    /// The value of the given kind.
    #[must_use]
    pub const fn of(kind: AbstractValueKind) -> Self {
        Self(kind)
    }

    /// The kind tag.
    #[must_use]
    pub const fn kind(self) -> AbstractValueKind {
        self.0
    }

    fn info(self) -> &'static KindInfo {
        &KIND_INFO[self.0 as usize]
    }

    /// Display name of the kind.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.0.into()
    }

    /// Returns `true` for `Undefined`.
    #[must_use]
    pub fn is_undefined(self) -> bool {
        self.0 == AbstractValueKind::Undefined
    }

    /// Returns `true` for `Any`.
    #[must_use]
    pub fn is_any(self) -> bool {
        self.0 == AbstractValueKind::Any
    }

    /// Returns `true` if values of this kind can live outside a boxed object.
    #[must_use]
    pub fn is_unboxable(self) -> bool {
        self.info().unboxable
    }

    /// What is known about the truth value.
    #[must_use]
    pub fn truthiness(self) -> Truthiness {
        self.info().truthiness
    }

    /// Returns `true` if every value of this kind is truthy.
    #[must_use]
    pub fn is_always_true(self) -> bool {
        self.truthiness() == Truthiness::AlwaysTrue
    }

    /// Returns `true` if every value of this kind is falsy.
    #[must_use]
    pub fn is_always_false(self) -> bool {
        self.truthiness() == Truthiness::AlwaysFalse
    }

    /// Returns `true` if a truth test of this value may run user code and raise.
    #[must_use]
    pub fn truth_test_can_raise(self) -> bool {
        matches!(
            self.0,
            AbstractValueKind::Any | AbstractValueKind::Undefined
        )
    }

    /// Numeric tower rank: `Bool < Integer < Float < Complex`.
    fn numeric_rank(self) -> Option<u8> {
        match self.0 {
            AbstractValueKind::Bool => Some(0),
            AbstractValueKind::Integer => Some(1),
            AbstractValueKind::Float => Some(2),
            AbstractValueKind::Complex => Some(3),
            _ => None,
        }
    }

    fn is_int_like(self) -> bool {
        matches!(
            self.0,
            AbstractValueKind::Integer | AbstractValueKind::Bool
        )
    }

    /// Result of a `BINARY_*` / `INPLACE_*` opcode with `self` on the left.
    #[must_use]
    pub fn binary(self, op: Opcode, rhs: Self) -> Self {
        match op.binary_operator() {
            Some(op) => self.binary_op(op, rhs),
            None => Self::ANY,
        }
    }

    /// Result of a binary arithmetic operator with `self` on the left.
    #[must_use]
    pub fn binary_op(self, op: BinaryOperator, rhs: Self) -> Self {
        use AbstractValueKind as K;
        use BinaryOperator as B;

        if let (Some(l), Some(r)) = (self.numeric_rank(), rhs.numeric_rank()) {
            return Self::numeric_binary(op, l, r);
        }

        let kind = match (self.0, op, rhs.0) {
            (K::String, B::Add, K::String) => K::String,
            (K::String, B::Modulo, _) => K::String,
            (K::Bytes, B::Add, K::Bytes) => K::Bytes,
            (K::Bytes, B::Modulo, _) => K::Bytes,
            (K::List, B::Add, K::List) => K::List,
            (K::Tuple, B::Add, K::Tuple) => K::Tuple,
            (K::Set, B::Subtract | B::And | B::Or | B::Xor, K::Set) => K::Set,
            (K::String | K::Bytes | K::List | K::Tuple, B::Multiply, _) if rhs.is_int_like() => {
                self.0
            }
            (_, B::Multiply, K::String | K::Bytes | K::List | K::Tuple) if self.is_int_like() => {
                rhs.0
            }
            (K::String, B::Subscr, K::Integer | K::Bool | K::Slice) => K::String,
            (K::Bytes, B::Subscr, K::Integer | K::Bool) => K::Integer,
            (K::Bytes | K::List | K::Tuple, B::Subscr, K::Slice) => self.0,
            _ => K::Any,
        };
        Self(kind)
    }

    fn numeric_binary(op: BinaryOperator, l: u8, r: u8) -> Self {
        use BinaryOperator as B;

        let hi = l.max(r);
        let at_least_int = |rank: u8| if rank == 0 { 1 } else { rank };
        let rank = match op {
            B::Add | B::Subtract | B::Multiply => Some(at_least_int(hi)),
            B::FloorDivide | B::Modulo => (hi < 3).then(|| at_least_int(hi)),
            B::TrueDivide => Some(hi.max(2)),
            B::Power => (hi == 3).then_some(3),
            B::LShift | B::RShift => (hi <= 1).then_some(1),
            B::And | B::Or | B::Xor => match hi {
                0 => Some(0),
                1 => Some(1),
                _ => None,
            },
            B::MatrixMultiply | B::Subscr => None,
        };

        match rank {
            Some(0) => Self::BOOL,
            Some(1) => Self::INTEGER,
            Some(2) => Self::FLOAT,
            Some(3) => Self::of(AbstractValueKind::Complex),
            _ => Self::ANY,
        }
    }

    /// Returns `true` if the operation can be carried out on unboxed operands,
    /// leaving its inputs and result unboxed.
    ///
    /// This holds for arithmetic between two floats that produces a float.
    #[must_use]
    pub fn is_unboxed_binary(self, op: Opcode, rhs: Self) -> bool {
        self.0 == AbstractValueKind::Float
            && rhs.0 == AbstractValueKind::Float
            && self.binary(op, rhs) == Self::FLOAT
    }

    /// Returns `true` if the binary operation may raise.
    ///
    /// Unboxed float addition, subtraction and multiplication are the only
    /// operations known not to.
    #[must_use]
    pub fn binary_can_raise(self, op: Opcode, rhs: Self) -> bool {
        !(self.is_unboxed_binary(op, rhs)
            && matches!(
                op.binary_operator(),
                Some(BinaryOperator::Add | BinaryOperator::Subtract | BinaryOperator::Multiply)
            ))
    }

    /// Result of a `UNARY_*` opcode.
    #[must_use]
    pub fn unary(self, op: Opcode) -> Self {
        use AbstractValueKind as K;

        let kind = match (op, self.0) {
            (Opcode::UnaryNot, _) => K::Bool,
            (Opcode::UnaryPositive | Opcode::UnaryNegative, K::Bool | K::Integer) => K::Integer,
            (Opcode::UnaryPositive | Opcode::UnaryNegative, K::Float) => K::Float,
            (Opcode::UnaryPositive | Opcode::UnaryNegative, K::Complex) => K::Complex,
            (Opcode::UnaryInvert, K::Bool | K::Integer) => K::Integer,
            _ => K::Any,
        };
        Self(kind)
    }

    /// Returns `true` if the unary operation works on an unboxed operand and
    /// yields an unboxed result.
    #[must_use]
    pub fn is_unboxed_unary(self, op: Opcode) -> bool {
        self.is_unboxable() && self.unary(op).is_unboxable()
    }

    /// Result of `COMPARE_OP` with `self` on the left.
    #[must_use]
    pub fn compare(self, op: CompareOp, rhs: Self) -> Self {
        if !op.is_rich() {
            return Self::BOOL;
        }

        let ordered = |v: Self| {
            matches!(
                v.0,
                AbstractValueKind::Bool | AbstractValueKind::Integer | AbstractValueKind::Float
            )
        };
        if (ordered(self) && ordered(rhs))
            || (self.0 == AbstractValueKind::String && rhs.0 == AbstractValueKind::String)
        {
            Self::BOOL
        } else {
            Self::ANY
        }
    }

    /// Returns `true` if the comparison runs on unboxed floats.
    #[must_use]
    pub fn is_unboxed_compare(self, op: CompareOp, rhs: Self) -> bool {
        op.is_rich() && self.0 == AbstractValueKind::Float && rhs.0 == AbstractValueKind::Float
    }

    /// Returns `true` if the comparison may raise.
    #[must_use]
    pub fn compare_can_raise(self, op: CompareOp, rhs: Self) -> bool {
        !matches!(op, CompareOp::Is | CompareOp::IsNot) && !self.is_unboxed_compare(op, rhs)
    }
}

impl std::fmt::Debug for AbstractValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::fmt::Display for AbstractValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl From<AbstractValueKind> for AbstractValue {
    fn from(kind: AbstractValueKind) -> Self {
        Self(kind)
    }
}
