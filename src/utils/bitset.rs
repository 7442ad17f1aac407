//! A growable bit vector for source-set tracking.
//!
//! Abstract values carry the set of sources that may have produced them.
//! Sources are numbered densely by the [`SourceTable`](crate::analysis::SourceTable)
//! as the analysis discovers them, so the sets have to grow on demand rather than
//! being sized up front.
//!
//! # Features
//!
//! - One `u64` word per 64 source ids
//! - Grows on insert and on union with a longer set
//! - Equality and hashing ignore trailing zero words, so sets built with
//!   different capacities compare by content
//!
//! # Example
//!
//! ```rust
//! use jitscope::utils::BitSet;
//!
//! let mut set = BitSet::new();
//! set.insert(0);
//! set.insert(150);
//!
//! assert!(set.contains(150));
//! assert!(!set.contains(1000));
//! assert_eq!(set.count(), 2);
//! assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 150]);
//! ```

use std::hash::{Hash, Hasher};

/// A growable bit vector for efficient set operations.
#[derive(Clone, Default)]
pub struct BitSet {
    /// Bit `i % 64` of word `i / 64` is set iff `i` is an element
    words: Vec<u64>,
}

impl BitSet {
    /// Creates a new empty bit set.
    #[must_use]
    pub const fn new() -> Self {
        Self { words: Vec::new() }
    }

    /// Creates a new empty bit set able to hold `capacity` bits without growing.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(64)],
        }
    }

    /// Creates a bit set holding exactly one element.
    #[must_use]
    pub fn singleton(index: usize) -> Self {
        let mut set = Self::with_capacity(index + 1);
        set.insert(index);
        set
    }

    /// Returns `true` if no element is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.words.iter().any(|&w| w != 0)
    }

    /// Sets the bit at the given index, growing the set if needed.
    ///
    /// Returns `true` if the bit was not set before.
    pub fn insert(&mut self, index: usize) -> bool {
        let word = index / 64;
        let bit = index % 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let old = self.words[word];
        self.words[word] |= 1u64 << bit;
        old != self.words[word]
    }

    /// Removes `index` from the set.
    pub fn remove(&mut self, index: usize) {
        if let Some(word) = self.words.get_mut(index / 64) {
            *word &= !(1u64 << (index % 64));
        }
    }

    /// Returns `true` if `index` is in the set.
    ///
    /// Indices beyond the current storage are simply not contained.
    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        self.words
            .get(index / 64)
            .is_some_and(|w| (w & (1u64 << (index % 64))) != 0)
    }

    /// Number of elements.
    #[must_use]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones()).sum::<u32>() as usize
    }

    /// Clears all bits.
    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    /// Adds every element of `other`, reporting whether anything was new.
    pub fn union_with(&mut self, other: &Self) -> bool {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        let mut changed = false;
        for (mine, theirs) in self.words.iter_mut().zip(&other.words) {
            changed |= theirs & !*mine != 0;
            *mine |= theirs;
        }
        changed
    }

    /// Returns `true` if every element of `self` is also in `other`.
    #[must_use]
    pub fn is_subset(&self, other: &Self) -> bool {
        self.words.iter().enumerate().all(|(i, &w)| {
            let o = other.words.get(i).copied().unwrap_or(0);
            w & !o == 0
        })
    }

    /// Returns the smallest element, if any.
    #[must_use]
    pub fn first(&self) -> Option<usize> {
        self.iter().next()
    }

    /// Elements in ascending order.
    pub fn iter(&self) -> BitSetIter<'_> {
        BitSetIter {
            words: &self.words,
            base: 0,
            pending: self.words.first().copied().unwrap_or(0),
        }
    }

    /// The words up to and including the last non-zero one.
    fn significant_words(&self) -> &[u64] {
        let len = self
            .words
            .iter()
            .rposition(|&w| w != 0)
            .map_or(0, |pos| pos + 1);
        &self.words[..len]
    }
}

impl PartialEq for BitSet {
    fn eq(&self, other: &Self) -> bool {
        self.significant_words() == other.significant_words()
    }
}

impl Eq for BitSet {}

impl Hash for BitSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.significant_words().hash(state);
    }
}

impl FromIterator<usize> for BitSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = BitSet::new();
        for index in iter {
            set.insert(index);
        }
        set
    }
}

impl std::fmt::Debug for BitSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Ascending iterator over the elements of a [`BitSet`].
pub struct BitSetIter<'a> {
    words: &'a [u64],
    /// Index of the first bit of `pending`
    base: usize,
    /// Bits of the current word not yet yielded
    pending: u64,
}

impl Iterator for BitSetIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while self.pending == 0 {
            self.base += 64;
            self.pending = *self.words.get(self.base / 64)?;
        }
        let bit = self.pending.trailing_zeros() as usize;
        self.pending &= self.pending - 1;
        Some(self.base + bit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitset_basic() {
        let mut set = BitSet::new();
        assert!(set.is_empty());

        assert!(set.insert(0));
        assert!(set.insert(50));
        assert!(set.insert(199));
        assert!(!set.insert(50));

        assert_eq!(set.count(), 3);
        assert!(set.contains(199));
        assert!(!set.contains(1));
        assert!(!set.contains(10_000));
    }

    #[test]
    fn test_bitset_remove() {
        let mut set = BitSet::singleton(42);
        set.remove(42);
        assert!(!set.contains(42));
        set.remove(4200);
        assert!(set.is_empty());
    }

    #[test]
    fn test_bitset_union_grows() {
        let mut a = BitSet::new();
        let mut b = BitSet::new();

        a.insert(0);
        a.insert(1);
        b.insert(1);
        b.insert(130);

        assert!(a.union_with(&b));
        assert!(a.contains(0));
        assert!(a.contains(1));
        assert!(a.contains(130));
        assert_eq!(a.count(), 3);

        assert!(!a.union_with(&b));
    }

    #[test]
    fn test_bitset_equality_ignores_capacity() {
        let mut a = BitSet::with_capacity(1000);
        let mut b = BitSet::new();
        assert_eq!(a, b);

        a.insert(3);
        b.insert(3);
        assert_eq!(a, b);

        b.insert(700);
        b.remove(700);
        assert_eq!(a, b);
    }

    #[test]
    fn test_bitset_subset() {
        let a: BitSet = [1, 5].into_iter().collect();
        let b: BitSet = [1, 5, 99].into_iter().collect();
        assert!(a.is_subset(&b));
        assert!(!b.is_subset(&a));
        assert!(BitSet::new().is_subset(&a));
    }

    #[test]
    fn test_bitset_iter() {
        let set: BitSet = [130, 7, 63, 64].into_iter().collect();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![7, 63, 64, 130]);
        assert_eq!(set.first(), Some(7));
        assert_eq!(format!("{set:?}"), "{7, 63, 64, 130}");
        assert_eq!(BitSet::with_capacity(300).iter().next(), None);
    }

    #[test]
    fn test_bitset_clear() {
        let mut set = BitSet::singleton(50);
        set.clear();
        assert!(set.is_empty());
        assert_eq!(set, BitSet::new());
    }
}
