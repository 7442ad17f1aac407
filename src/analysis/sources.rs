//! Value provenance.
//!
//! A source is the instruction that produced a value: a `LOAD_FAST` of a
//! local, a `LOAD_CONST`, or an operation whose result may stay unboxed. Each
//! producing offset owns exactly one source, created the first time the
//! offset is interpreted and reused on every later visit, which keeps the
//! number of sources (and so the height of the source-set lattice) finite.
//!
//! Whenever two values meet, at a join point or because one was loaded from a
//! local holding the other, their sources must agree on a single
//! representation: either all of them stay unboxed or all of them are boxed.
//! [`SourceTable`] tracks these groups with a union-find structure and keeps
//! the monotonic *escapes* flag per group. Once any member of a group escapes,
//! every member must be boxed.

use crate::utils::BitSet;

/// Index of a source in its [`SourceTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub usize);

/// What produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// A `LOAD_FAST` of the given local slot
    Local {
        /// Local slot
        index: usize,
    },
    /// A `LOAD_CONST` of the given constant pool entry
    Const {
        /// Constant pool index
        index: usize,
    },
    /// The result of an operation that can run on unboxed operands
    Intermediate,
}

/// A producer of values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbstractSource {
    /// What produced the value
    pub kind: SourceKind,
    /// Offset of the producing instruction
    pub offset: usize,
}

/// All sources of one function, grouped by shared representation.
#[derive(Debug, Clone, Default)]
pub struct SourceTable {
    sources: Vec<AbstractSource>,
    /// Union-find parent links
    parent: Vec<usize>,
    /// Escape flag, meaningful at group roots only
    escapes: Vec<bool>,
}

impl SourceTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Returns `true` if no source was created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Creates a new source in its own group.
    pub fn add(&mut self, kind: SourceKind, offset: usize) -> SourceId {
        let id = self.sources.len();
        self.sources.push(AbstractSource { kind, offset });
        self.parent.push(id);
        self.escapes.push(false);
        SourceId(id)
    }

    /// The source record.
    #[must_use]
    pub fn get(&self, id: SourceId) -> Option<&AbstractSource> {
        self.sources.get(id.0)
    }

    /// Iterates all sources with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (SourceId, &AbstractSource)> {
        self.sources
            .iter()
            .enumerate()
            .map(|(i, s)| (SourceId(i), s))
    }

    fn root(&self, mut id: usize) -> usize {
        while self.parent[id] != id {
            id = self.parent[id];
        }
        id
    }

    fn root_compress(&mut self, id: usize) -> usize {
        let root = self.root(id);
        let mut current = id;
        while self.parent[current] != root {
            let next = self.parent[current];
            self.parent[current] = root;
            current = next;
        }
        root
    }

    /// Merges the groups of `a` and `b`. The merged group escapes if either did.
    pub fn union(&mut self, a: SourceId, b: SourceId) {
        let ra = self.root_compress(a.0);
        let rb = self.root_compress(b.0);
        if ra == rb {
            return;
        }
        let (keep, absorb) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent[absorb] = keep;
        self.escapes[keep] |= self.escapes[absorb];
    }

    /// Merges the groups of every source in `set`.
    pub fn unify(&mut self, set: &BitSet) {
        let mut members = set.iter();
        if let Some(first) = members.next() {
            for other in members {
                self.union(SourceId(first), SourceId(other));
            }
        }
    }

    /// Returns `true` if `a` and `b` share a representation group.
    #[must_use]
    pub fn same_group(&self, a: SourceId, b: SourceId) -> bool {
        self.root(a.0) == self.root(b.0)
    }

    /// Marks the group of `id` as escaped.
    pub fn escape(&mut self, id: SourceId) {
        let root = self.root_compress(id.0);
        self.escapes[root] = true;
    }

    /// Marks the groups of every source in `set` as escaped.
    pub fn escape_all(&mut self, set: &BitSet) {
        for id in set.iter() {
            self.escape(SourceId(id));
        }
    }

    /// Returns `true` if the group of `id` escaped.
    #[must_use]
    pub fn escapes(&self, id: SourceId) -> bool {
        self.escapes[self.root(id.0)]
    }

    /// Returns `true` if any source in `set` escaped.
    #[must_use]
    pub fn any_escapes(&self, set: &BitSet) -> bool {
        set.iter().any(|id| self.escapes(SourceId(id)))
    }

    /// All members of the group of `id`, in id order.
    #[must_use]
    pub fn group(&self, id: SourceId) -> Vec<SourceId> {
        let root = self.root(id.0);
        (0..self.sources.len())
            .filter(|&i| self.root(i) == root)
            .map(SourceId)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sources_start_isolated() {
        let mut table = SourceTable::new();
        let a = table.add(SourceKind::Local { index: 0 }, 2);
        let b = table.add(SourceKind::Const { index: 1 }, 4);
        assert_eq!(table.len(), 2);
        assert!(!table.same_group(a, b));
        assert!(!table.escapes(a));
        assert_eq!(table.get(b).map(|s| s.offset), Some(4));
    }

    #[test]
    fn test_escape_spreads_through_group() {
        let mut table = SourceTable::new();
        let a = table.add(SourceKind::Intermediate, 0);
        let b = table.add(SourceKind::Intermediate, 2);
        let c = table.add(SourceKind::Intermediate, 4);

        table.union(a, b);
        table.escape(b);
        assert!(table.escapes(a));
        assert!(!table.escapes(c));

        // escapes survive later unions
        table.union(c, a);
        assert!(table.escapes(c));
        assert_eq!(table.group(c), vec![a, b, c]);
    }

    #[test]
    fn test_unify_set() {
        let mut table = SourceTable::new();
        let ids: Vec<_> = (0..4)
            .map(|i| table.add(SourceKind::Intermediate, i * 2))
            .collect();
        let set: BitSet = [0, 2, 3].into_iter().collect();
        table.unify(&set);

        assert!(table.same_group(ids[0], ids[3]));
        assert!(!table.same_group(ids[0], ids[1]));
        assert!(!table.any_escapes(&set));

        table.escape_all(&BitSet::singleton(2));
        assert!(table.any_escapes(&set));
        assert!(table.escapes(ids[0]));
        assert!(!table.escapes(ids[1]));
    }
}
