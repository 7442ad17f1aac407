//! Shared containers and helpers used across the analysis.

mod bitset;
mod cowvec;
mod dot;

pub use bitset::{BitSet, BitSetIter};
pub use cowvec::CowVector;
pub use dot::escape_dot;
