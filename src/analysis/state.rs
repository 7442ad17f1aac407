//! Per-offset machine state.
//!
//! An [`InterpreterState`] is what the analysis knows just before the
//! instruction at some offset executes: the abstract evaluation stack and the
//! abstract locals.
//!
//! The stack is private to each state because almost every instruction
//! changes it. The locals are a [`CowVector`] shared with the state they were
//! derived from until one of them writes.
//!
//! # Local states
//!
//! An [`AbstractLocalInfo`] pairs a value with a maybe-undefined flag. Of the
//! four combinations, three are reachable:
//!
//! | value       | maybe undefined | meaning                              |
//! |-------------|-----------------|--------------------------------------|
//! | known kind  | no              | definitely assigned                  |
//! | known kind  | yes             | assigned on some incoming paths      |
//! | `Undefined` | yes             | definitely unassigned                |
//! | `Undefined` | no              | impossible, construction panics      |

use crate::{
    analysis::{AbstractValue, JoinSemiLattice, SourceId, SourceTable},
    utils::{BitSet, CowVector},
    Error, Result,
};

/// Representation of one evaluation stack slot in generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackKind {
    /// A reference to a boxed object
    Object,
    /// An unboxed float or bool
    Value,
}

/// An abstract value together with the sources that may have produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbstractValueWithSources {
    /// The abstract value
    pub value: AbstractValue,
    /// Producers of the value, as [`SourceId`] indices
    pub sources: BitSet,
}

impl AbstractValueWithSources {
    /// A value without known producers.
    #[must_use]
    pub fn new(value: AbstractValue) -> Self {
        Self {
            value,
            sources: BitSet::new(),
        }
    }

    /// A value produced by a single source.
    #[must_use]
    pub fn with_source(value: AbstractValue, source: SourceId) -> Self {
        Self {
            value,
            sources: BitSet::singleton(source.0),
        }
    }

    /// Returns `true` if any producer is known.
    #[must_use]
    pub fn has_sources(&self) -> bool {
        !self.sources.is_empty()
    }

    /// Iterates the producers.
    pub fn source_ids(&self) -> impl Iterator<Item = SourceId> + '_ {
        self.sources.iter().map(SourceId)
    }

    /// Records that this value leaves unboxed form.
    pub fn escape(&self, table: &mut SourceTable) {
        table.escape_all(&self.sources);
    }

    /// Returns `true` if the value has to be materialized as a boxed object.
    ///
    /// Only unboxable kinds with known producers, none of which escaped, may
    /// stay unboxed.
    #[must_use]
    pub fn needs_boxing(&self, table: &SourceTable) -> bool {
        !(self.value.is_unboxable() && self.has_sources() && !table.any_escapes(&self.sources))
    }

    /// The slot representation of this value.
    #[must_use]
    pub fn stack_kind(&self, table: &SourceTable) -> StackKind {
        if self.needs_boxing(table) {
            StackKind::Object
        } else {
            StackKind::Value
        }
    }

    /// Joins two values flowing into the same slot.
    ///
    /// Kinds join in the value lattice and source sets union. Because the two
    /// inputs now share one slot they must share one representation, so their
    /// sources are unified in `table`. A side whose kind had to widen escapes,
    /// as does a sourced side meeting a value without sources.
    pub fn merge(&self, other: &Self, table: &mut SourceTable) -> Self {
        let value = self.value.join(&other.value);

        if !self.value.is_undefined() && !other.value.is_undefined() {
            if self.value != value {
                self.escape(table);
            }
            if other.value != value {
                other.escape(table);
            }
            if self.has_sources() != other.has_sources() {
                self.escape(table);
                other.escape(table);
            }
        }

        let sources = self.sources.join(&other.sources);
        table.unify(&sources);
        Self { value, sources }
    }
}

impl std::fmt::Display for AbstractValueWithSources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)?;
        if self.has_sources() {
            write!(f, "{:?}", self.sources)?;
        }
        Ok(())
    }
}

/// What is known about one local slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbstractLocalInfo {
    value: AbstractValueWithSources,
    maybe_undefined: bool,
}

impl AbstractLocalInfo {
    /// Creates a local state.
    ///
    /// # Panics
    ///
    /// Panics if `value` is `Undefined` while `maybe_undefined` is `false`. That
    /// state means the transfer functions lost track of an assignment and the
    /// analysis of the function cannot continue.
    #[must_use]
    pub fn new(value: AbstractValueWithSources, maybe_undefined: bool) -> Self {
        assert!(
            maybe_undefined || !value.value.is_undefined(),
            "local is Undefined but marked definitely assigned"
        );
        Self {
            value,
            maybe_undefined,
        }
    }

    /// A definitely unassigned local.
    #[must_use]
    pub fn undefined() -> Self {
        Self {
            value: AbstractValueWithSources::new(AbstractValue::UNDEFINED),
            maybe_undefined: true,
        }
    }

    /// A definitely assigned local.
    #[must_use]
    pub fn assigned(value: AbstractValueWithSources) -> Self {
        Self::new(value, false)
    }

    /// The value held when assigned.
    #[must_use]
    pub fn value(&self) -> &AbstractValueWithSources {
        &self.value
    }

    /// The abstract value held when assigned.
    #[must_use]
    pub fn kind(&self) -> AbstractValue {
        self.value.value
    }

    /// Returns `true` if the local is unassigned on at least one incoming path.
    #[must_use]
    pub fn is_maybe_undefined(&self) -> bool {
        self.maybe_undefined
    }

    /// Returns `true` if the local is unassigned on every incoming path.
    #[must_use]
    pub fn is_definitely_unassigned(&self) -> bool {
        self.value.value.is_undefined()
    }

    /// The same local after a read succeeded: reading an unassigned local
    /// raises, so past the read it is assigned.
    #[must_use]
    pub fn assume_assigned(&self) -> Self {
        Self::new(self.value.clone(), false)
    }

    /// Joins two local states: values merge and undefinedness ORs.
    pub fn merge(&self, other: &Self, table: &mut SourceTable) -> Self {
        Self::new(
            self.value.merge(&other.value, table),
            self.maybe_undefined || other.maybe_undefined,
        )
    }
}

impl std::fmt::Display for AbstractLocalInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)?;
        if self.maybe_undefined && !self.is_definitely_unassigned() {
            write!(f, "?")?;
        }
        Ok(())
    }
}

/// The abstract machine state before one instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpreterState {
    stack: Vec<AbstractValueWithSources>,
    locals: CowVector<AbstractLocalInfo>,
}

impl InterpreterState {
    /// A state with an empty stack and the given locals.
    #[must_use]
    pub fn new(locals: CowVector<AbstractLocalInfo>) -> Self {
        Self {
            stack: Vec::new(),
            locals,
        }
    }

    /// A state with an empty stack and `count` unassigned locals.
    #[must_use]
    pub fn with_undefined_locals(count: usize) -> Self {
        Self::new(CowVector::from_elem(AbstractLocalInfo::undefined(), count))
    }

    /// Pushes a value.
    pub fn push(&mut self, value: AbstractValueWithSources) {
        self.stack.push(value);
    }

    /// Pushes a value without sources.
    pub fn push_value(&mut self, value: AbstractValue) {
        self.stack.push(AbstractValueWithSources::new(value));
    }

    /// Pops a value consumed in boxed form, escaping its sources.
    pub fn pop(&mut self, table: &mut SourceTable) -> Option<AbstractValueWithSources> {
        let value = self.stack.pop()?;
        value.escape(table);
        Some(value)
    }

    /// Pops a value whose consumer handles the unboxed form.
    pub fn pop_no_escape(&mut self) -> Option<AbstractValueWithSources> {
        self.stack.pop()
    }

    /// The value `depth` slots below the top (0 is the top).
    #[must_use]
    pub fn peek(&self, depth: usize) -> Option<&AbstractValueWithSources> {
        self.stack
            .len()
            .checked_sub(depth + 1)
            .map(|index| &self.stack[index])
    }

    /// The stack, bottom first.
    #[must_use]
    pub fn stack(&self) -> &[AbstractValueWithSources] {
        &self.stack
    }

    /// Representation of every stack slot, bottom first.
    #[must_use]
    pub fn stack_kinds(&self, table: &SourceTable) -> Vec<StackKind> {
        self.stack.iter().map(|v| v.stack_kind(table)).collect()
    }

    /// Current stack depth.
    #[must_use]
    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    /// Drops every value above `len`.
    pub fn truncate(&mut self, len: usize) {
        self.stack.truncate(len);
    }

    /// Number of local slots.
    #[must_use]
    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    /// The state of local `index`.
    #[must_use]
    pub fn get_local(&self, index: usize) -> Option<&AbstractLocalInfo> {
        self.locals.get(index)
    }

    /// All locals.
    #[must_use]
    pub fn locals(&self) -> &CowVector<AbstractLocalInfo> {
        &self.locals
    }

    /// Replaces local `index`, detaching from shared storage if needed.
    ///
    /// Returns `false` if the slot does not exist.
    pub fn replace_local(&mut self, index: usize, info: AbstractLocalInfo) -> bool {
        if index >= self.locals.len() {
            return false;
        }
        self.locals.replace(index, info);
        true
    }

    /// Joins `other` into `self`, as at a merge point at `offset`.
    ///
    /// Returns `true` if `self` changed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StackDepthMismatch`] if the stack depths differ.
    pub fn merge_from(
        &mut self,
        other: &InterpreterState,
        table: &mut SourceTable,
        offset: usize,
    ) -> Result<bool> {
        if self.stack.len() != other.stack.len() {
            return Err(Error::StackDepthMismatch {
                offset,
                expected: self.stack.len(),
                found: other.stack.len(),
            });
        }
        if self.locals.len() != other.locals.len() {
            return Err(invariant_error!(
                "Local count mismatch at offset {}: {} vs {}",
                offset,
                self.locals.len(),
                other.locals.len()
            ));
        }

        let mut changed = false;
        for (mine, theirs) in self.stack.iter_mut().zip(&other.stack) {
            let merged = mine.merge(theirs, table);
            if merged != *mine {
                *mine = merged;
                changed = true;
            }
        }

        if !self.locals.ptr_eq(&other.locals) {
            for index in 0..self.locals.len() {
                let merged = self.locals[index].merge(&other.locals[index], table);
                if merged != self.locals[index] {
                    self.locals.replace(index, merged);
                    changed = true;
                }
            }
        }

        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::SourceKind;

    fn sourced(table: &mut SourceTable, value: AbstractValue, offset: usize) -> AbstractValueWithSources {
        let id = table.add(SourceKind::Intermediate, offset);
        AbstractValueWithSources::with_source(value, id)
    }

    #[test]
    fn test_value_merge_same_kind_unifies() {
        let mut table = SourceTable::new();
        let a = sourced(&mut table, AbstractValue::FLOAT, 0);
        let b = sourced(&mut table, AbstractValue::FLOAT, 2);

        let merged = a.merge(&b, &mut table);
        assert_eq!(merged.value, AbstractValue::FLOAT);
        assert_eq!(merged.sources.count(), 2);
        assert!(table.same_group(SourceId(0), SourceId(1)));
        assert!(!merged.needs_boxing(&table));
    }

    #[test]
    fn test_value_merge_widening_escapes() {
        let mut table = SourceTable::new();
        let a = sourced(&mut table, AbstractValue::FLOAT, 0);
        let b = AbstractValueWithSources::new(AbstractValue::INTEGER);

        let merged = a.merge(&b, &mut table);
        assert_eq!(merged.value, AbstractValue::ANY);
        assert!(table.escapes(SourceId(0)));
        assert!(merged.needs_boxing(&table));
    }

    #[test]
    fn test_value_merge_unsourced_escapes() {
        let mut table = SourceTable::new();
        let a = sourced(&mut table, AbstractValue::FLOAT, 0);
        let b = AbstractValueWithSources::new(AbstractValue::FLOAT);

        let merged = b.merge(&a, &mut table);
        assert_eq!(merged.value, AbstractValue::FLOAT);
        assert!(table.escapes(SourceId(0)));
    }

    #[test]
    fn test_value_merge_commutative_and_idempotent() {
        let mut table = SourceTable::new();
        let a = sourced(&mut table, AbstractValue::FLOAT, 0);
        let b = sourced(&mut table, AbstractValue::BOOL, 2);

        assert_eq!(a.merge(&b, &mut table), b.merge(&a, &mut table));
        assert_eq!(a.merge(&a, &mut table), a);
    }

    #[test]
    fn test_state_merge_unifies_slot_kinds() {
        let mut table = SourceTable::new();
        let unboxed = sourced(&mut table, AbstractValue::FLOAT, 0);

        let mut recorded = InterpreterState::new(CowVector::from(Vec::new()));
        recorded.push(unboxed.clone());
        assert_eq!(recorded.stack_kinds(&table), vec![StackKind::Value]);

        let mut incoming = InterpreterState::new(CowVector::from(Vec::new()));
        incoming.push_value(AbstractValue::FLOAT);
        assert_eq!(incoming.stack_kinds(&table), vec![StackKind::Object]);

        assert!(recorded.merge_from(&incoming, &mut table, 4).unwrap());
        assert_eq!(recorded.stack_kinds(&table), incoming.stack_kinds(&table));
        assert_eq!(unboxed.stack_kind(&table), StackKind::Object);
    }

    #[test]
    fn test_local_merge() {
        let mut table = SourceTable::new();
        let float = AbstractLocalInfo::assigned(AbstractValueWithSources::new(AbstractValue::FLOAT));
        let undefined = AbstractLocalInfo::undefined();

        let merged = float.merge(&undefined, &mut table);
        assert_eq!(merged.kind(), AbstractValue::FLOAT);
        assert!(merged.is_maybe_undefined());
        assert!(!merged.is_definitely_unassigned());
        assert_eq!(merged.to_string(), "Float?");

        let both = undefined.merge(&undefined, &mut table);
        assert!(both.is_definitely_unassigned());
        assert!(both.is_maybe_undefined());
    }

    #[test]
    #[should_panic(expected = "definitely assigned")]
    fn test_undefined_assigned_local_panics() {
        let _ = AbstractLocalInfo::new(AbstractValueWithSources::new(AbstractValue::UNDEFINED), false);
    }

    #[test]
    fn test_stack_operations() {
        let mut table = SourceTable::new();
        let mut state = InterpreterState::with_undefined_locals(2);
        let value = sourced(&mut table, AbstractValue::FLOAT, 0);
        state.push(value.clone());
        state.push_value(AbstractValue::ANY);

        assert_eq!(state.stack_len(), 2);
        assert_eq!(state.peek(1), Some(&value));
        assert_eq!(state.peek(2), None);

        assert!(state.pop(&mut table).is_some());
        assert_eq!(state.pop_no_escape(), Some(value));
        assert!(!table.escapes(SourceId(0)));
        assert!(state.pop(&mut table).is_none());
    }

    #[test]
    fn test_pop_escapes() {
        let mut table = SourceTable::new();
        let mut state = InterpreterState::with_undefined_locals(0);
        state.push(sourced(&mut table, AbstractValue::FLOAT, 0));
        state.pop(&mut table);
        assert!(table.escapes(SourceId(0)));
    }

    #[test]
    fn test_fork_isolation() {
        let original = InterpreterState::with_undefined_locals(3);
        let mut fork = original.clone();
        assert!(fork.locals().ptr_eq(original.locals()));

        let info = AbstractLocalInfo::assigned(AbstractValueWithSources::new(AbstractValue::BOOL));
        assert!(fork.replace_local(1, info.clone()));
        assert!(!fork.replace_local(3, info.clone()));

        for index in 0..3 {
            assert!(original.get_local(index).unwrap().is_definitely_unassigned());
        }
        assert_eq!(fork.get_local(1), Some(&info));
    }

    #[test]
    fn test_merge_from() -> Result<()> {
        let mut table = SourceTable::new();
        let mut recorded = InterpreterState::with_undefined_locals(1);
        let mut incoming = recorded.clone();
        incoming.replace_local(
            0,
            AbstractLocalInfo::assigned(AbstractValueWithSources::new(AbstractValue::INTEGER)),
        );

        assert!(recorded.merge_from(&incoming, &mut table, 4)?);
        assert_eq!(recorded.get_local(0).unwrap().kind(), AbstractValue::INTEGER);
        assert!(recorded.get_local(0).unwrap().is_maybe_undefined());

        // merging the same input again is a fixed point
        assert!(!recorded.merge_from(&incoming, &mut table, 4)?);
        let copy = recorded.clone();
        assert!(!recorded.merge_from(&copy, &mut table, 4)?);
        Ok(())
    }

    #[test]
    fn test_merge_from_depth_mismatch() {
        let mut table = SourceTable::new();
        let mut a = InterpreterState::with_undefined_locals(0);
        let mut b = a.clone();
        b.push_value(AbstractValue::ANY);

        let err = a.merge_from(&b, &mut table, 10).unwrap_err();
        assert_eq!(
            err,
            Error::StackDepthMismatch {
                offset: 10,
                expected: 0,
                found: 1
            }
        );
        assert!(err.is_invariant_violation());
    }
}
