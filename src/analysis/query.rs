//! Read-only queries over a finished analysis.
//!
//! The code generator walks the function a second time and asks, per offset,
//! what the analysis proved. All queries return `None` / `false` for offsets
//! the analysis never reached; callers check [`AbstractInterpreter::has_info`]
//! where the distinction matters.

use crate::{
    analysis::{
        AbstractInterpreter, AbstractLocalInfo, AbstractValueWithSources, BlockModel,
        ExceptionHandler, RaiseAndFreeChains, SourceTable, StackKind, Successor,
    },
    backend::Label,
};

impl AbstractInterpreter {
    /// Returns `true` once [`AbstractInterpreter::interpret`] succeeded.
    #[must_use]
    pub fn is_analyzed(&self) -> bool {
        self.analyzed
    }

    /// Returns `true` if a state was recorded for `offset`.
    #[must_use]
    pub fn has_info(&self, offset: usize) -> bool {
        self.states.get(offset).is_some_and(Option::is_some)
    }

    /// What is known about local `index` just before `offset`.
    #[must_use]
    pub fn get_local_info(&self, offset: usize, index: usize) -> Option<&AbstractLocalInfo> {
        self.states.get(offset)?.as_ref()?.get_local(index)
    }

    /// The evaluation stack just before `offset`, bottom first.
    #[must_use]
    pub fn get_stack_info(&self, offset: usize) -> Option<&[AbstractValueWithSources]> {
        self.states
            .get(offset)?
            .as_ref()
            .map(|s| s.stack())
    }

    /// Representation of each stack slot just before `offset`.
    #[must_use]
    pub fn get_stack_kinds(&self, offset: usize) -> Option<Vec<StackKind>> {
        self.states
            .get(offset)?
            .as_ref()
            .map(|s| s.stack_kinds(&self.sources))
    }

    /// Returns `true` if the value produced at `offset` must be materialized
    /// as a boxed object.
    ///
    /// Offsets that create no source always box. Otherwise the value stays
    /// unboxed unless its representation group escaped.
    #[must_use]
    pub fn should_box(&self, offset: usize) -> bool {
        match self.offset_sources.get(offset).copied().flatten() {
            Some(id) => self.sources.escapes(id),
            None => true,
        }
    }

    /// Returns `true` if the instruction at `offset` cannot raise, so the code
    /// generator may skip updating the last-instruction bookkeeping before it.
    #[must_use]
    pub fn can_skip_lasti_update(&self, offset: usize) -> bool {
        self.analyzed && self.has_info(offset) && !self.can_raise.contains(offset)
    }

    /// Returns `true` if the instruction at `offset` may raise.
    #[must_use]
    pub fn can_raise(&self, offset: usize) -> bool {
        self.can_raise.contains(offset)
    }

    /// The merged value of every `RETURN_VALUE`, `None` if none is reachable.
    #[must_use]
    pub fn get_return_info(&self) -> Option<&AbstractValueWithSources> {
        self.return_value.as_ref()
    }

    /// Handler entry receiving errors raised at `offset`.
    #[must_use]
    pub fn error_target(&self, offset: usize) -> Option<usize> {
        self.error_targets.get(offset).copied().flatten()
    }

    /// Outgoing edges of `offset` at the fixed point.
    #[must_use]
    pub fn successors(&self, offset: usize) -> &[Successor] {
        self.successors.get(offset).map_or(&[], Vec::as_slice)
    }

    /// Number of worklist pops the analysis needed.
    #[must_use]
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Offsets with a recorded state, ascending.
    pub fn analyzed_offsets(&self) -> impl Iterator<Item = usize> + '_ {
        self.states
            .iter()
            .enumerate()
            .filter_map(|(offset, state)| state.as_ref().map(|_| offset))
    }

    /// All exception handlers of the function.
    #[must_use]
    pub fn handlers(&self) -> &[ExceptionHandler] {
        self.blocks.handlers()
    }

    /// The loop and exception region model.
    #[must_use]
    pub fn blocks(&self) -> &BlockModel {
        &self.blocks
    }

    /// Value sources and their representation groups.
    #[must_use]
    pub fn sources(&self) -> &SourceTable {
        &self.sources
    }

    /// The raise-and-free chains.
    #[must_use]
    pub fn raise_and_free(&self) -> &RaiseAndFreeChains {
        &self.raise_and_free
    }

    /// Boxed values an error at `offset` has to release: those still on the
    /// stack once the instruction has consumed its operands.
    #[must_use]
    pub fn raise_depth(&self, offset: usize) -> Option<usize> {
        self.raise_and_free.site(offset).map(|s| s.depth)
    }

    /// Chain entry an error at `offset` branches to.
    #[must_use]
    pub fn raise_and_free_entry(&self, offset: usize) -> Option<Label> {
        let site = self.raise_and_free.site(offset)?;
        self.raise_and_free.entry(site.handler, site.depth)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        analysis::{AbstractInterpreter, AbstractValue},
        backend::SymbolicBackend,
        bytecode::{Assembler, CodeObject, Constant, Opcode},
        config::AnalysisConfig,
        Result,
    };

    /// `x = 1.0; y = x * x; return y`
    fn float_code() -> Result<CodeObject> {
        let mut asm = Assembler::new();
        asm.emit(Opcode::LoadConst, 0)?;
        asm.emit(Opcode::StoreFast, 0)?;
        asm.emit(Opcode::LoadFast, 0)?;
        asm.emit(Opcode::LoadFast, 0)?;
        asm.emit(Opcode::BinaryMultiply, 0)?;
        asm.emit(Opcode::StoreFast, 1)?;
        asm.emit(Opcode::LoadConst, 1)?;
        asm.emit(Opcode::ReturnValue, 0)?;
        Ok(CodeObject::new(
            "square",
            asm.finalize()?,
            vec![Constant::Float(1.0), Constant::None],
            2,
        ))
    }

    #[test]
    fn test_queries_before_and_after() -> Result<()> {
        let mut interp = AbstractInterpreter::new(float_code()?, AnalysisConfig::default())?;
        assert!(!interp.has_info(0));
        assert!(!interp.can_skip_lasti_update(0));
        assert!(interp.get_stack_info(0).is_none());

        interp.interpret(&mut SymbolicBackend::new())?;
        assert!(interp.is_analyzed());
        assert_eq!(interp.analyzed_offsets().count(), 8);
        assert!(!interp.has_info(100));

        assert_eq!(
            interp.get_local_info(6, 0).map(|l| l.kind()),
            Some(AbstractValue::FLOAT)
        );
        assert!(interp.get_local_info(6, 1).unwrap().is_definitely_unassigned());
        assert_eq!(interp.get_stack_info(8).map(<[_]>::len), Some(2));
        Ok(())
    }

    #[test]
    fn test_unboxed_float_chain() -> Result<()> {
        let mut interp = AbstractInterpreter::new(float_code()?, AnalysisConfig::default())?;
        interp.interpret(&mut SymbolicBackend::new())?;

        // the constant, both loads and the product never leave unboxed form
        for offset in [0, 4, 6, 8] {
            assert!(!interp.should_box(offset), "offset {offset}");
        }
        // the returned None and offsets producing nothing box
        assert!(interp.should_box(12));
        assert!(interp.should_box(2));

        assert!(interp.can_skip_lasti_update(8));
        assert!(interp.can_skip_lasti_update(4));
        assert!(!interp.can_raise(8));
        assert_eq!(interp.get_return_info().map(|v| v.value), Some(AbstractValue::NONE));
        assert_eq!(interp.successors(8).len(), 1);
        assert!(interp.successors(14).is_empty());
        Ok(())
    }
}
