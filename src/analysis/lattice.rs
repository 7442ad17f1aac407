//! Lattice traits for the abstract interpretation.
//!
//! A lattice defines how abstract facts combine where control flow paths
//! meet. The abstract interpreter is a forward *may* analysis: facts only ever
//! widen, and the join is the operation applied at every merge point.
//!
//! # Termination
//!
//! Every domain implementing [`JoinSemiLattice`] here has finite height:
//!
//! - [`AbstractValue`]: `Undefined` → specific kind → `Any` (height 2)
//! - [`BitSet`] of sources: bounded by the number of producing offsets
//!
//! so repeatedly joining a state with incoming states reaches a fixed point
//! after finitely many changes.

use std::fmt::Debug;

use crate::{analysis::AbstractValue, utils::BitSet};

/// A join semi-lattice with a join (least upper bound) operation.
///
/// It must satisfy:
///
/// - **Idempotent**: `x.join(x) = x`
/// - **Commutative**: `x.join(y) = y.join(x)`
/// - **Associative**: `x.join(y.join(z)) = (x.join(y)).join(z)`
///
/// # Examples
///
/// ```rust
/// use jitscope::analysis::{AbstractValue, JoinSemiLattice};
///
/// let merged = AbstractValue::FLOAT.join(&AbstractValue::UNDEFINED);
/// assert_eq!(merged, AbstractValue::FLOAT);
/// assert!(AbstractValue::FLOAT.join(&AbstractValue::BOOL).is_top());
/// ```
pub trait JoinSemiLattice: Clone + Debug + PartialEq {
    /// Computes the join (least upper bound) of two lattice elements.
    ///
    /// The join represents the least specific value that covers both inputs.
    #[must_use]
    fn join(&self, other: &Self) -> Self;

    /// Returns `true` if this is the top element.
    ///
    /// Once top is reached, further joins cannot change the value.
    fn is_top(&self) -> bool;
}

impl JoinSemiLattice for AbstractValue {
    /// `Undefined` is absorbed by the other side, equal kinds stay, anything
    /// else widens to `Any`.
    fn join(&self, other: &Self) -> Self {
        if self.is_undefined() {
            *other
        } else if other.is_undefined() || self == other {
            *self
        } else {
            AbstractValue::ANY
        }
    }

    fn is_top(&self) -> bool {
        self.is_any()
    }
}

impl JoinSemiLattice for BitSet {
    /// Join is union: a value may come from any source of either side.
    fn join(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.union_with(other);
        result
    }

    /// Source sets have no finite top.
    fn is_top(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitset_join_is_union() {
        let a: BitSet = [1, 2].into_iter().collect();
        let b: BitSet = [2, 70].into_iter().collect();
        let joined = a.join(&b);
        assert_eq!(joined, [1, 2, 70].into_iter().collect());
        assert_eq!(joined, b.join(&a));
        assert_eq!(a.join(&a), a);
        assert!(!joined.is_top());
    }

    #[test]
    fn test_value_join_associative() {
        let values = [
            AbstractValue::UNDEFINED,
            AbstractValue::FLOAT,
            AbstractValue::INTEGER,
            AbstractValue::ANY,
        ];
        for x in values {
            for y in values {
                for z in values {
                    assert_eq!(x.join(&y.join(&z)), x.join(&y).join(&z));
                }
            }
        }
    }
}
