//! The fixed point abstract interpreter.
//!
//! [`AbstractInterpreter`] computes, for every reachable instruction of one
//! function, the [`InterpreterState`] holding just before it executes.
//!
//! # Algorithm
//!
//! 1. Decode the wordcode and build the [`BlockModel`]
//! 2. Seed offset 0: parameters definitely assigned with their declared kind,
//!    every other local definitely unassigned
//! 3. While the worklist is non-empty:
//!    a. Pop an offset and apply the transfer function of its instruction to a
//!       copy of the recorded state, producing one state per successor edge
//!    b. Merge each edge state into the state recorded at its target
//!    c. Enqueue the target if its recorded state changed
//! 4. Replay every transfer function once over the final states to verify
//!    that stack depth and slot representation agree at every edge
//! 5. Allocate handler storage and raise-and-free chains through the
//!    [`Backend`]
//!
//! Every abstract domain involved has finite height and merges only widen, so
//! the worklist drains.
//!
//! # Edges
//!
//! Besides fall-through and jumps, an instruction that may raise inside a try
//! region gets an error edge to the handler, carrying its pre-state truncated
//! to the block level plus the values the run time pushes on handler entry.
//! `break`, `continue` and `return` crossing a try/finally get an edge into the
//! finally body, and the `END_FINALLY` closing that body gets edges to wherever
//! the statement continues.

use std::{collections::VecDeque, sync::Arc};

use log::{debug, error, trace, warn};
use rayon::prelude::*;

use crate::{
    analysis::{
        AbstractLocalInfo, AbstractValue, AbstractValueKind, AbstractValueWithSources,
        BlockModel, BranchKind, HandlerId, InterpreterState, RaiseAndFreeChains, RaiseSite,
        SourceId, SourceKind, SourceTable, UnwindPlan,
    },
    backend::{Backend, LocalKind, Method},
    bytecode::{CodeObject, CompareOp, Instruction, Instructions, Opcode},
    config::AnalysisConfig,
    utils::{BitSet, CowVector},
    Error, Result,
};

/// Why control moves along an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Fall-through, jumps and loop exits
    Normal,
    /// Entry of an exception handler
    Error,
    /// A `break`, `continue` or `return` running a finally body
    Finally,
}

/// An outgoing edge of an analysed instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Successor {
    /// Target offset
    pub target: usize,
    /// Edge kind
    pub kind: EdgeKind,
}

#[derive(Debug, Clone)]
struct Edge {
    target: usize,
    kind: EdgeKind,
    state: InterpreterState,
}

impl Edge {
    fn normal(target: usize, state: InterpreterState) -> Self {
        Self {
            target,
            kind: EdgeKind::Normal,
            state,
        }
    }
}

/// Abstract interpreter for one function body.
///
/// # Examples
///
/// ```rust
/// use jitscope::prelude::*;
///
/// let mut asm = Assembler::new();
/// asm.emit(Opcode::LoadConst, 0)?;
/// asm.emit(Opcode::StoreFast, 0)?;
/// asm.emit(Opcode::LoadFast, 0)?;
/// asm.emit(Opcode::ReturnValue, 0)?;
/// let code = CodeObject::new("f", asm.finalize()?, vec![Constant::Float(1.0)], 1);
///
/// let mut interp = AbstractInterpreter::new(code, AnalysisConfig::default())?;
/// interp.interpret(&mut SymbolicBackend::new())?;
///
/// assert_eq!(interp.get_local_info(4, 0).map(|l| l.kind()), Some(AbstractValue::FLOAT));
/// assert_eq!(interp.get_return_info().map(|v| v.value), Some(AbstractValue::FLOAT));
/// # Ok::<(), jitscope::Error>(())
/// ```
#[derive(Debug)]
pub struct AbstractInterpreter {
    pub(crate) code: Arc<CodeObject>,
    pub(crate) config: AnalysisConfig,
    pub(crate) instructions: Instructions,
    pub(crate) blocks: BlockModel,
    pub(crate) sources: SourceTable,
    /// The source created by each producing offset
    pub(crate) offset_sources: Vec<Option<SourceId>>,
    /// State before each offset, `None` until reached
    pub(crate) states: Vec<Option<InterpreterState>>,
    pub(crate) successors: Vec<Vec<Successor>>,
    pub(crate) error_targets: Vec<Option<usize>>,
    pub(crate) can_raise: BitSet,
    /// Stack slots still held when the instruction at each offset fails
    raise_live: Vec<usize>,
    pub(crate) return_value: Option<AbstractValueWithSources>,
    pub(crate) raise_and_free: RaiseAndFreeChains,
    worklist: VecDeque<usize>,
    in_worklist: Vec<bool>,
    pub(crate) iterations: usize,
    pub(crate) analyzed: bool,
}

impl AbstractInterpreter {
    /// Decodes `code` and builds its region model.
    ///
    /// # Errors
    ///
    /// Returns a clean failure for empty or malformed wordcode, unsupported
    /// opcodes, unbalanced blocks and parameters declared `Undefined`.
    pub fn new(code: impl Into<Arc<CodeObject>>, config: AnalysisConfig) -> Result<Self> {
        let code = code.into();
        if let Some(index) = code
            .param_kinds
            .iter()
            .position(|&k| k == AbstractValueKind::Undefined)
        {
            return Err(malformed_error!(
                "Parameter {} of {} is declared Undefined",
                index,
                code.name
            ));
        }
        let instructions = Instructions::decode(&code.bytecode)?;
        let blocks = BlockModel::preprocess(&instructions)?;
        let size = instructions.code_len();

        Ok(Self {
            code,
            config,
            instructions,
            blocks,
            sources: SourceTable::new(),
            offset_sources: vec![None; size],
            states: vec![None; size],
            successors: vec![Vec::new(); size],
            error_targets: vec![None; size],
            can_raise: BitSet::with_capacity(size),
            raise_live: vec![0; size],
            return_value: None,
            raise_and_free: RaiseAndFreeChains::new(),
            worklist: VecDeque::new(),
            in_worklist: vec![false; size],
            iterations: 0,
            analyzed: false,
        })
    }

    /// Like [`AbstractInterpreter::new`], with parameter kinds taken from the
    /// storage classes `method` declares.
    ///
    /// # Errors
    ///
    /// See [`AbstractInterpreter::new`].
    pub fn for_method(method: &dyn Method, code: CodeObject, config: AnalysisConfig) -> Result<Self> {
        let kinds = method
            .params()
            .iter()
            .map(|p| match p.kind {
                LocalKind::Float => AbstractValueKind::Float,
                LocalKind::Int => AbstractValueKind::Integer,
                LocalKind::Bool => AbstractValueKind::Bool,
                LocalKind::Object => AbstractValueKind::Any,
            })
            .collect();
        Self::new(code.with_params(kinds), config)
    }

    /// The analysed function.
    #[must_use]
    pub fn code(&self) -> &CodeObject {
        &self.code
    }

    /// The decoded instructions.
    #[must_use]
    pub fn instructions(&self) -> &Instructions {
        &self.instructions
    }

    /// Runs the analysis to its fixed point.
    ///
    /// Calling it again after a successful run does nothing.
    ///
    /// # Errors
    ///
    /// Clean failures ([`Error::IterationLimit`], [`Error::StackUnderflow`],
    /// operand errors) mean the function should run uncompiled. Invariant
    /// violations ([`Error::is_invariant_violation`]) mean the analysis and the
    /// region model disagree and compilation must be aborted.
    pub fn interpret(&mut self, backend: &mut dyn Backend) -> Result<()> {
        if self.analyzed {
            return Ok(());
        }

        debug!(
            "Analysing {} ({} instructions, {} locals)",
            self.code.name,
            self.instructions.len(),
            self.code.local_count
        );

        match self.run(backend) {
            Ok(()) => {
                self.analyzed = true;
                debug!(
                    "Analysed {}: {} offsets in {} iterations, returns {}",
                    self.code.name,
                    self.states.iter().filter(|s| s.is_some()).count(),
                    self.iterations,
                    self.return_value
                        .as_ref()
                        .map_or(AbstractValue::UNDEFINED, |v| v.value)
                );
                Ok(())
            }
            Err(err) => {
                if err.is_invariant_violation() {
                    error!("Aborting analysis of {}: {}", self.code.name, err);
                } else {
                    warn!("Giving up on {}: {}", self.code.name, err);
                }
                Err(err)
            }
        }
    }

    fn run(&mut self, backend: &mut dyn Backend) -> Result<()> {
        self.seed();
        self.iterate()?;
        self.verify()?;
        self.finish(backend)
    }

    fn seed(&mut self) {
        let count = self.code.local_count.max(self.code.arg_count);
        let locals: Vec<AbstractLocalInfo> = (0..count)
            .map(|i| {
                if i < self.code.arg_count {
                    AbstractLocalInfo::assigned(AbstractValueWithSources::new(AbstractValue::of(
                        self.code.param_kind(i),
                    )))
                } else {
                    AbstractLocalInfo::undefined()
                }
            })
            .collect();

        self.states[0] = Some(InterpreterState::new(CowVector::from(locals)));
        self.worklist.push_back(0);
        self.in_worklist[0] = true;
    }

    fn iterate(&mut self) -> Result<()> {
        while let Some(offset) = self.worklist.pop_front() {
            self.in_worklist[offset] = false;
            self.iterations += 1;
            if self.iterations > self.config.max_iterations {
                return Err(Error::IterationLimit(self.config.max_iterations));
            }

            let instr = self.instruction(offset)?;
            let state = self.states[offset]
                .clone()
                .ok_or_else(|| invariant_error!("Offset {} queued without a state", offset))?;
            trace!("{} stack={}", instr, state.stack_len());

            let edges = self.step(&instr, &state)?;
            self.successors[offset] = edges
                .iter()
                .map(|e| Successor {
                    target: e.target,
                    kind: e.kind,
                })
                .collect();

            for edge in edges {
                self.merge_into(offset, edge.target, &edge.state)?;
            }
        }
        Ok(())
    }

    fn instruction(&self, offset: usize) -> Result<Instruction> {
        self.instructions
            .get(offset)
            .copied()
            .ok_or_else(|| invariant_error!("No instruction at offset {}", offset))
    }

    fn merge_into(&mut self, from: usize, target: usize, state: &InterpreterState) -> Result<()> {
        if !self.instructions.contains(target) {
            return Err(Error::InvalidJumpTarget {
                offset: from,
                target,
            });
        }

        let changed = match self.states[target].as_mut() {
            Some(recorded) => recorded.merge_from(state, &mut self.sources, target)?,
            None => {
                self.states[target] = Some(state.clone());
                true
            }
        };

        if changed && !self.in_worklist[target] {
            trace!("requeue {} from {}", target, from);
            self.in_worklist[target] = true;
            self.worklist.push_back(target);
        }
        Ok(())
    }

    /// Replays the transfer functions over the final states and checks every
    /// edge against the state recorded at its target.
    fn verify(&mut self) -> Result<()> {
        let offsets: Vec<usize> = self
            .instructions
            .iter()
            .map(|i| i.offset)
            .filter(|&o| self.states[o].is_some())
            .collect();

        for offset in offsets {
            let instr = self.instruction(offset)?;
            let Some(state) = self.states[offset].clone() else {
                continue;
            };
            for edge in self.step(&instr, &state)? {
                let recorded = self.states[edge.target].as_ref().ok_or_else(|| {
                    invariant_error!("Edge {} -> {} reaches no state", offset, edge.target)
                })?;
                if recorded.stack_len() != edge.state.stack_len() {
                    return Err(Error::StackDepthMismatch {
                        offset: edge.target,
                        expected: recorded.stack_len(),
                        found: edge.state.stack_len(),
                    });
                }

                // merge_from unifies the sources of every joined slot, so a
                // disagreement here means a transfer function bypassed it
                let expected = recorded.stack_kinds(&self.sources);
                let found = edge.state.stack_kinds(&self.sources);
                if let Some(slot) = expected.iter().zip(&found).position(|(a, b)| a != b) {
                    return Err(Error::StackKindMismatch {
                        offset: edge.target,
                        slot,
                    });
                }
            }
        }
        Ok(())
    }

    /// Allocates handler storage and the raise-and-free chains.
    fn finish(&mut self, backend: &mut dyn Backend) -> Result<()> {
        for index in 0..self.blocks.handlers().len() {
            let handler = HandlerId(index);
            let target = self.blocks.handlers()[index].target_offset;
            if let Some(state) = &self.states[target] {
                let kinds = state.stack_kinds(&self.sources);
                self.blocks.set_entry_stack(handler, kinds);
            }
        }
        self.blocks.allocate(backend);

        let mut deepest = 0;
        for offset in self.can_raise.iter() {
            let Some(state) = &self.states[offset] else {
                continue;
            };
            let handler = self.blocks.handler_for(offset);
            let level = match handler {
                Some(h) => {
                    let block = self.blocks.handlers()[h.0].block;
                    self.blocks.level(block).ok_or_else(|| {
                        invariant_error!("Handler level unknown at offset {}", offset)
                    })?
                }
                None => 0,
            };
            let kinds = state.stack_kinds(&self.sources);
            let live = self.raise_live[offset].min(kinds.len());
            let depth = RaiseAndFreeChains::spill_count(&kinds[..live], level);
            self.raise_and_free
                .record_site(offset, RaiseSite { handler, depth });
            self.raise_and_free.ensure_labels(handler, depth, backend);
            deepest = deepest.max(depth);
        }
        self.raise_and_free
            .ensure_raise_and_free_locals(deepest, backend);
        Ok(())
    }

    /// Releases the backend locals held by handlers and raise chains.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LocalDoubleFree`] when called twice.
    pub fn release(&self, backend: &mut dyn Backend) -> Result<()> {
        self.blocks.release(backend)?;
        self.raise_and_free.release(backend)
    }

    fn pop(&mut self, state: &mut InterpreterState, offset: usize) -> Result<AbstractValueWithSources> {
        state
            .pop(&mut self.sources)
            .ok_or(Error::StackUnderflow { offset })
    }

    fn pop_no_escape(
        state: &mut InterpreterState,
        offset: usize,
    ) -> Result<AbstractValueWithSources> {
        state.pop_no_escape().ok_or(Error::StackUnderflow { offset })
    }

    fn pop_n(&mut self, state: &mut InterpreterState, count: usize, offset: usize) -> Result<()> {
        for _ in 0..count {
            self.pop(state, offset)?;
        }
        Ok(())
    }

    fn source_at(&mut self, offset: usize, kind: SourceKind) -> SourceId {
        if let Some(id) = self.offset_sources[offset] {
            return id;
        }
        let id = self.sources.add(kind, offset);
        self.offset_sources[offset] = Some(id);
        id
    }

    /// A value produced at `offset`, joined with the sources it was derived
    /// from. Values that cannot be unboxed escape right away.
    fn produce(
        &mut self,
        offset: usize,
        kind: SourceKind,
        value: AbstractValue,
        derived: &BitSet,
    ) -> AbstractValueWithSources {
        let id = self.source_at(offset, kind);
        let mut sources = derived.clone();
        sources.insert(id.0);
        self.sources.unify(&sources);
        if !value.is_unboxable() {
            self.sources.escape(id);
        }
        AbstractValueWithSources { value, sources }
    }

    fn truncate_to(state: &mut InterpreterState, level: usize, offset: usize) -> Result<()> {
        if state.stack_len() < level {
            return Err(Error::StackDepthMismatch {
                offset,
                expected: level,
                found: state.stack_len(),
            });
        }
        state.truncate(level);
        Ok(())
    }

    fn handler_level(&self, handler: HandlerId) -> Result<usize> {
        self.blocks
            .handler(handler)
            .and_then(|h| self.blocks.level(h.block))
            .ok_or_else(|| invariant_error!("Level of handler {} is not known", handler.0))
    }

    /// Handler entry: `state` cut to the try level plus the exception values.
    fn handler_entry_edge(
        &self,
        handler: HandlerId,
        state: &InterpreterState,
        offset: usize,
    ) -> Result<Edge> {
        let info = self
            .blocks
            .handler(handler)
            .ok_or_else(|| invariant_error!("Unknown handler {}", handler.0))?;
        let mut entry = state.clone();
        Self::truncate_to(&mut entry, self.handler_level(handler)?, offset)?;
        for _ in 0..info.entry_values() {
            entry.push_value(AbstractValue::ANY);
        }
        Ok(Edge {
            target: info.target_offset,
            kind: EdgeKind::Error,
            state: entry,
        })
    }

    /// The edge a `break`, `continue` or `return` takes next.
    fn unwind_edge(
        &self,
        plan: &UnwindPlan,
        state: &InterpreterState,
        offset: usize,
    ) -> Result<Option<Edge>> {
        if let Some((handler, target)) = plan.first_finally() {
            let mut entry = state.clone();
            Self::truncate_to(&mut entry, self.handler_level(handler)?, offset)?;
            entry.push_value(AbstractValue::ANY);
            return Ok(Some(Edge {
                target,
                kind: EdgeKind::Finally,
                state: entry,
            }));
        }

        let Some(target) = plan.target else {
            return Ok(None);
        };
        let mut next = state.clone();
        if let Some(level) = plan.level {
            Self::truncate_to(&mut next, level, offset)?;
        }
        Ok(Some(Edge::normal(target, next)))
    }

    /// Which ways a conditional jump goes: `(jump, fall through)`.
    fn branch_outcomes(&self, value: AbstractValue, jump_if_true: bool) -> (bool, bool) {
        if !self.config.specialize_known_branches {
            return (true, true);
        }
        if value.is_always_true() {
            (jump_if_true, !jump_if_true)
        } else if value.is_always_false() {
            (!jump_if_true, jump_if_true)
        } else {
            (true, true)
        }
    }

    fn jump_target(instr: &Instruction) -> Result<usize> {
        instr
            .jump_target()
            .ok_or_else(|| invariant_error!("{} has no jump target", instr))
    }

    fn local_index(&self, instr: &Instruction) -> Result<usize> {
        let index = instr.arg();
        if index >= self.code.local_count.max(self.code.arg_count) {
            return Err(Error::InvalidLocal {
                offset: instr.offset,
                index,
            });
        }
        Ok(index)
    }

    /// Applies the transfer function of `instr` to `pre`, returning the state
    /// along every outgoing edge.
    fn step(&mut self, instr: &Instruction, pre: &InterpreterState) -> Result<Vec<Edge>> {
        let offset = instr.offset;
        let op = instr.opcode;
        let mut state = pre.clone();
        let mut edges = Vec::new();
        let mut raises = op.can_raise();
        let mut falls_through = true;
        // set once the inputs are popped when the result is pushed afterwards
        let mut live = None;

        match op {
            Opcode::Nop | Opcode::PopBlock | Opcode::PopExcept => {}
            Opcode::PopTop => {
                Self::pop_no_escape(&mut state, offset)?;
            }
            Opcode::RotTwo => {
                let top = Self::pop_no_escape(&mut state, offset)?;
                let second = Self::pop_no_escape(&mut state, offset)?;
                state.push(top);
                state.push(second);
            }
            Opcode::RotThree => {
                let top = Self::pop_no_escape(&mut state, offset)?;
                let second = Self::pop_no_escape(&mut state, offset)?;
                let third = Self::pop_no_escape(&mut state, offset)?;
                state.push(top);
                state.push(third);
                state.push(second);
            }
            Opcode::DupTop => {
                let top = state.peek(0).cloned().ok_or(Error::StackUnderflow { offset })?;
                state.push(top);
            }
            Opcode::DupTopTwo => {
                let top = state.peek(0).cloned().ok_or(Error::StackUnderflow { offset })?;
                let second = state.peek(1).cloned().ok_or(Error::StackUnderflow { offset })?;
                state.push(second);
                state.push(top);
            }
            Opcode::UnaryPositive | Opcode::UnaryNegative | Opcode::UnaryNot | Opcode::UnaryInvert => {
                let operand = Self::pop_no_escape(&mut state, offset)?;
                live = Some(state.stack_len());
                let result = operand.value.unary(op);
                if operand.value.is_unboxed_unary(op) {
                    raises = false;
                    let value =
                        self.produce(offset, SourceKind::Intermediate, result, &BitSet::new());
                    state.push(value);
                } else {
                    raises = op != Opcode::UnaryNot || operand.value.truth_test_can_raise();
                    operand.escape(&mut self.sources);
                    state.push_value(result);
                }
            }
            Opcode::StoreSubscr => self.pop_n(&mut state, 3, offset)?,
            Opcode::DeleteSubscr | Opcode::StoreAttr | Opcode::MapAdd => {
                self.pop_n(&mut state, 2, offset)?;
            }
            Opcode::PrintExpr
            | Opcode::ImportStar
            | Opcode::StoreName
            | Opcode::StoreGlobal
            | Opcode::StoreDeref
            | Opcode::DeleteAttr
            | Opcode::ListAppend
            | Opcode::SetAdd => self.pop_n(&mut state, 1, offset)?,
            Opcode::DeleteName | Opcode::DeleteGlobal | Opcode::DeleteDeref | Opcode::SetupAnnotations => {}
            Opcode::GetIter => {
                self.pop(&mut state, offset)?;
                live = Some(state.stack_len());
                state.push_value(AbstractValue::of(AbstractValueKind::Iterable));
            }
            Opcode::LoadBuildClass
            | Opcode::LoadName
            | Opcode::LoadGlobal
            | Opcode::LoadDeref
            | Opcode::LoadClassderef
            | Opcode::LoadClosure
            | Opcode::ImportFrom => state.push_value(AbstractValue::ANY),
            Opcode::BreakLoop | Opcode::ContinueLoop => {
                let kind = if op == Opcode::BreakLoop {
                    BranchKind::Break
                } else {
                    BranchKind::Continue
                };
                let plan = self.blocks.unwind_loop(offset, kind)?;
                edges.extend(self.unwind_edge(&plan, &state, offset)?);
                falls_through = false;
            }
            Opcode::ReturnValue => {
                let value = self.pop(&mut state, offset)?;
                self.return_value = Some(match self.return_value.take() {
                    Some(previous) => previous.merge(&value, &mut self.sources),
                    None => value,
                });
                let plan = self.blocks.unwind_return(offset)?;
                edges.extend(self.unwind_edge(&plan, &state, offset)?);
                falls_through = false;
            }
            Opcode::EndFinally => match self.blocks.end_finally_is_finally(offset) {
                Some(true) => {
                    self.pop(&mut state, offset)?;
                    for kind in [BranchKind::Break, BranchKind::Continue, BranchKind::Return] {
                        if let Some(plan) = self.blocks.continuation(offset, kind)? {
                            edges.extend(self.unwind_edge(&plan, &state, offset)?);
                        }
                    }
                }
                Some(false) => {
                    self.pop_n(&mut state, 3, offset)?;
                    falls_through = false;
                }
                None => {
                    return Err(invariant_error!("END_FINALLY at {} ends no handler", offset));
                }
            },
            Opcode::UnpackSequence => {
                self.pop(&mut state, offset)?;
                live = Some(state.stack_len());
                for _ in 0..instr.arg() {
                    state.push_value(AbstractValue::ANY);
                }
            }
            Opcode::UnpackEx => {
                self.pop(&mut state, offset)?;
                live = Some(state.stack_len());
                let before = instr.arg() & 0xff;
                let after = instr.arg() >> 8;
                for _ in 0..after {
                    state.push_value(AbstractValue::ANY);
                }
                state.push_value(AbstractValue::of(AbstractValueKind::List));
                for _ in 0..before {
                    state.push_value(AbstractValue::ANY);
                }
            }
            Opcode::ForIter => {
                let mut exhausted = state.clone();
                self.pop(&mut exhausted, offset)?;
                edges.push(Edge::normal(Self::jump_target(instr)?, exhausted));
                state.push_value(AbstractValue::ANY);
            }
            Opcode::LoadConst => {
                let index = instr.arg();
                let constant = self
                    .code
                    .consts
                    .get(index)
                    .ok_or(Error::InvalidConst { offset, index })?;
                let value = AbstractValue::of(constant.kind());
                let value = self.produce(offset, SourceKind::Const { index }, value, &BitSet::new());
                state.push(value);
            }
            Opcode::BuildTuple
            | Opcode::BuildList
            | Opcode::BuildSet
            | Opcode::BuildString
            | Opcode::BuildSlice
            | Opcode::BuildTupleUnpack
            | Opcode::BuildTupleUnpackWithCall
            | Opcode::BuildListUnpack
            | Opcode::BuildSetUnpack
            | Opcode::BuildMapUnpack
            | Opcode::BuildMapUnpackWithCall => {
                self.pop_n(&mut state, instr.arg(), offset)?;
                live = Some(state.stack_len());
                let kind = match op {
                    Opcode::BuildTuple | Opcode::BuildTupleUnpack | Opcode::BuildTupleUnpackWithCall => {
                        AbstractValueKind::Tuple
                    }
                    Opcode::BuildList | Opcode::BuildListUnpack => AbstractValueKind::List,
                    Opcode::BuildSet | Opcode::BuildSetUnpack => AbstractValueKind::Set,
                    Opcode::BuildString => AbstractValueKind::String,
                    Opcode::BuildSlice => AbstractValueKind::Slice,
                    _ => AbstractValueKind::Dict,
                };
                state.push_value(AbstractValue::of(kind));
            }
            Opcode::BuildMap => {
                self.pop_n(&mut state, instr.arg() * 2, offset)?;
                live = Some(state.stack_len());
                state.push_value(AbstractValue::of(AbstractValueKind::Dict));
            }
            Opcode::BuildConstKeyMap => {
                self.pop_n(&mut state, instr.arg() + 1, offset)?;
                live = Some(state.stack_len());
                state.push_value(AbstractValue::of(AbstractValueKind::Dict));
            }
            Opcode::LoadAttr => {
                self.pop(&mut state, offset)?;
                live = Some(state.stack_len());
                state.push_value(AbstractValue::ANY);
            }
            Opcode::CompareOp => {
                let cmp = CompareOp::from_oparg(instr.oparg).ok_or_else(|| {
                    malformed_error!("Invalid comparison {} at offset {}", instr.oparg, offset)
                })?;
                let rhs = Self::pop_no_escape(&mut state, offset)?;
                let lhs = Self::pop_no_escape(&mut state, offset)?;
                live = Some(state.stack_len());
                raises = lhs.value.compare_can_raise(cmp, rhs.value);
                if lhs.value.is_unboxed_compare(cmp, rhs.value) {
                    let value = self.produce(
                        offset,
                        SourceKind::Intermediate,
                        AbstractValue::BOOL,
                        &BitSet::new(),
                    );
                    state.push(value);
                } else {
                    lhs.escape(&mut self.sources);
                    rhs.escape(&mut self.sources);
                    state.push_value(lhs.value.compare(cmp, rhs.value));
                }
            }
            Opcode::ImportName => {
                self.pop_n(&mut state, 2, offset)?;
                live = Some(state.stack_len());
                state.push_value(AbstractValue::ANY);
            }
            Opcode::JumpForward | Opcode::JumpAbsolute => {
                edges.push(Edge::normal(Self::jump_target(instr)?, state.clone()));
                falls_through = false;
            }
            Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
                let condition = Self::pop_no_escape(&mut state, offset)?;
                if !condition.value.is_unboxable() {
                    condition.escape(&mut self.sources);
                }
                raises = condition.value.truth_test_can_raise();
                let (jump, fall) =
                    self.branch_outcomes(condition.value, op == Opcode::PopJumpIfTrue);
                if jump {
                    edges.push(Edge::normal(Self::jump_target(instr)?, state.clone()));
                }
                falls_through = fall;
            }
            Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => {
                let condition = state.peek(0).cloned().ok_or(Error::StackUnderflow { offset })?;
                live = Some(state.stack_len());
                raises = condition.value.truth_test_can_raise();
                let (jump, fall) =
                    self.branch_outcomes(condition.value, op == Opcode::JumpIfTrueOrPop);
                if jump {
                    edges.push(Edge::normal(Self::jump_target(instr)?, state.clone()));
                }
                if fall {
                    let popped = Self::pop_no_escape(&mut state, offset)?;
                    if !popped.value.is_unboxable() {
                        popped.escape(&mut self.sources);
                    }
                }
                falls_through = fall;
            }
            Opcode::LoadFast => {
                let index = self.local_index(instr)?;
                let local = state
                    .get_local(index)
                    .cloned()
                    .ok_or(Error::InvalidLocal { offset, index })?;
                if local.is_definitely_unassigned() {
                    raises = true;
                    falls_through = false;
                } else {
                    raises = local.is_maybe_undefined();
                    if raises {
                        state.replace_local(index, local.assume_assigned());
                    }
                    let value = self.produce(
                        offset,
                        SourceKind::Local { index },
                        local.kind(),
                        &local.value().sources,
                    );
                    state.push(value);
                }
            }
            Opcode::StoreFast => {
                let index = self.local_index(instr)?;
                let value = Self::pop_no_escape(&mut state, offset)?;
                state.replace_local(index, AbstractLocalInfo::assigned(value));
            }
            Opcode::DeleteFast => {
                let index = self.local_index(instr)?;
                let local = state
                    .get_local(index)
                    .cloned()
                    .ok_or(Error::InvalidLocal { offset, index })?;
                if local.is_definitely_unassigned() {
                    raises = true;
                    falls_through = false;
                } else {
                    raises = local.is_maybe_undefined();
                    state.replace_local(index, AbstractLocalInfo::undefined());
                }
            }
            Opcode::RaiseVarargs => {
                self.pop_n(&mut state, instr.arg(), offset)?;
                raises = true;
                falls_through = false;
            }
            Opcode::CallFunction => {
                self.pop_n(&mut state, instr.arg() + 1, offset)?;
                live = Some(state.stack_len());
                state.push_value(AbstractValue::ANY);
            }
            Opcode::CallFunctionKw => {
                self.pop_n(&mut state, instr.arg() + 2, offset)?;
                live = Some(state.stack_len());
                state.push_value(AbstractValue::ANY);
            }
            Opcode::CallFunctionEx => {
                self.pop_n(&mut state, 2 + (instr.arg() & 1), offset)?;
                live = Some(state.stack_len());
                state.push_value(AbstractValue::ANY);
            }
            Opcode::MakeFunction => {
                let extras = (instr.oparg & 0xf).count_ones() as usize;
                self.pop_n(&mut state, 2 + extras, offset)?;
                live = Some(state.stack_len());
                state.push_value(AbstractValue::of(AbstractValueKind::Function));
            }
            Opcode::FormatValue => {
                let has_format = usize::from(instr.oparg & 0x4 != 0);
                self.pop_n(&mut state, 1 + has_format, offset)?;
                live = Some(state.stack_len());
                state.push_value(AbstractValue::STRING);
            }
            Opcode::SetupLoop | Opcode::SetupExcept | Opcode::SetupFinally => {
                let block = self
                    .blocks
                    .block_opened_at(offset)
                    .ok_or_else(|| invariant_error!("No block opened at offset {}", offset))?;
                self.blocks.set_level(block, state.stack_len())?;
                if let Some(handler) = self.blocks.block(block).and_then(|b| b.handler) {
                    edges.push(self.handler_entry_edge(handler, &state, offset)?);
                }
            }
            Opcode::ExtendedArg => {
                return Err(invariant_error!("Unfolded EXTENDED_ARG at offset {}", offset));
            }
            op if op.binary_operator().is_some() => {
                let rhs = Self::pop_no_escape(&mut state, offset)?;
                let lhs = Self::pop_no_escape(&mut state, offset)?;
                live = Some(state.stack_len());
                raises = lhs.value.binary_can_raise(op, rhs.value);
                if lhs.value.is_unboxed_binary(op, rhs.value) {
                    let value = self.produce(
                        offset,
                        SourceKind::Intermediate,
                        AbstractValue::FLOAT,
                        &BitSet::new(),
                    );
                    state.push(value);
                } else {
                    lhs.escape(&mut self.sources);
                    rhs.escape(&mut self.sources);
                    state.push_value(lhs.value.binary(op, rhs.value));
                }
            }
            op => {
                return Err(Error::UnsupportedOpcode {
                    offset,
                    opcode: op.name(),
                });
            }
        }

        let handler = self.blocks.handler_for(offset);
        if raises {
            self.can_raise.insert(offset);
            self.raise_live[offset] =
                live.unwrap_or_else(|| state.stack_len().min(pre.stack_len()));
            if let Some(handler) = handler {
                let target = self.blocks.handler(handler).map(|h| h.target_offset);
                self.error_targets[offset] = target;
                if self.config.model_error_edges {
                    edges.push(self.handler_entry_edge(handler, pre, offset)?);
                }
            }
        }

        if falls_through {
            edges.push(Edge::normal(instr.next, state));
        }
        Ok(edges)
    }
}

/// Analyses many functions in parallel, one interpreter and one backend per
/// function.
///
/// Results are returned in input order.
///
/// # Examples
///
/// ```rust
/// use jitscope::prelude::*;
/// use jitscope::analysis::analyze_batch;
///
/// let code = CodeObject::new("f", vec![100, 0, 83, 0], vec![Constant::None], 0);
/// let results = analyze_batch(vec![code.clone(), code], AnalysisConfig::default(), SymbolicBackend::new);
/// assert!(results.iter().all(Result::is_ok));
/// ```
pub fn analyze_batch<B, F>(
    codes: Vec<CodeObject>,
    config: AnalysisConfig,
    backend_factory: F,
) -> Vec<Result<(AbstractInterpreter, B)>>
where
    B: Backend + Send,
    F: Fn() -> B + Sync,
{
    codes
        .into_par_iter()
        .map(|code| {
            let mut backend = backend_factory();
            let mut interp = AbstractInterpreter::new(code, config)?;
            interp.interpret(&mut backend)?;
            Ok((interp, backend))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{Parameter, SymbolicBackend, UserMethod},
        bytecode::{Assembler, Constant},
    };

    fn analyse(code: CodeObject) -> Result<AbstractInterpreter> {
        let mut interp = AbstractInterpreter::new(code, AnalysisConfig::default())?;
        interp.interpret(&mut SymbolicBackend::new())?;
        Ok(interp)
    }

    #[test]
    fn test_straight_line() -> Result<()> {
        let mut asm = Assembler::new();
        asm.emit(Opcode::LoadConst, 0)?;
        asm.emit(Opcode::LoadConst, 1)?;
        asm.emit(Opcode::BinaryAdd, 0)?;
        asm.emit(Opcode::ReturnValue, 0)?;
        let code = CodeObject::new(
            "add",
            asm.finalize()?,
            vec![Constant::Float(1.0), Constant::Float(2.0)],
            0,
        );
        let interp = analyse(code)?;

        assert_eq!(interp.iterations, 4);
        assert!(!interp.can_raise.contains(4));
        let stack = interp.states[6].as_ref().unwrap().stack();
        assert_eq!(stack[0].value, AbstractValue::FLOAT);
        // the result is returned, which boxes everything it came from
        assert!(stack[0].needs_boxing(&interp.sources));
        Ok(())
    }

    #[test]
    fn test_stack_underflow() -> Result<()> {
        let mut asm = Assembler::new();
        asm.emit(Opcode::PopTop, 0)?;
        let code = CodeObject::new("f", asm.finalize()?, vec![], 0);
        assert_eq!(analyse(code).unwrap_err(), Error::StackUnderflow { offset: 0 });
        Ok(())
    }

    #[test]
    fn test_falls_off_end() -> Result<()> {
        let code = CodeObject::new("f", vec![100, 0], vec![Constant::None], 0);
        assert!(matches!(
            analyse(code),
            Err(Error::InvalidJumpTarget { offset: 0, target: 2 })
        ));
        Ok(())
    }

    #[test]
    fn test_invalid_operands() -> Result<()> {
        let code = CodeObject::new("f", vec![124, 3, 83, 0], vec![], 1);
        assert_eq!(
            analyse(code).unwrap_err(),
            Error::InvalidLocal { offset: 0, index: 3 }
        );

        let code = CodeObject::new("f", vec![100, 1, 83, 0], vec![Constant::None], 0);
        assert_eq!(
            analyse(code).unwrap_err(),
            Error::InvalidConst { offset: 0, index: 1 }
        );
        Ok(())
    }

    #[test]
    fn test_iteration_limit() -> Result<()> {
        let mut asm = Assembler::new();
        asm.emit(Opcode::LoadConst, 0)?;
        asm.emit(Opcode::PopTop, 0)?;
        asm.emit(Opcode::LoadConst, 0)?;
        asm.emit(Opcode::ReturnValue, 0)?;
        let code = CodeObject::new("f", asm.finalize()?, vec![Constant::None], 0);
        let config = AnalysisConfig {
            max_iterations: 2,
            ..AnalysisConfig::default()
        };
        let mut interp = AbstractInterpreter::new(code, config)?;
        assert_eq!(
            interp.interpret(&mut SymbolicBackend::new()),
            Err(Error::IterationLimit(2))
        );
        Ok(())
    }

    #[test]
    fn test_for_method_seeds_params() -> Result<()> {
        let method = UserMethod::new(
            "f",
            vec![
                Parameter { kind: LocalKind::Float },
                Parameter { kind: LocalKind::Object },
            ],
            LocalKind::Object,
            0,
        );
        let code = CodeObject::new("f", vec![124, 0, 83, 0], vec![], 2);
        let mut interp = AbstractInterpreter::for_method(&method, code, AnalysisConfig::default())?;
        interp.interpret(&mut SymbolicBackend::new())?;

        let state = interp.states[0].as_ref().unwrap();
        assert_eq!(state.get_local(0).unwrap().kind(), AbstractValue::FLOAT);
        assert_eq!(state.get_local(1).unwrap().kind(), AbstractValue::ANY);
        assert!(!state.get_local(1).unwrap().is_maybe_undefined());
        Ok(())
    }

    #[test]
    fn test_undefined_param_rejected() {
        let code = CodeObject::new("f", vec![124, 0, 83, 0], vec![], 1)
            .with_params(vec![AbstractValueKind::Undefined]);
        let err = AbstractInterpreter::new(code, AnalysisConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Malformed { .. }));
        assert!(!err.is_invariant_violation());
    }

    #[test]
    fn test_raise_depth_excludes_consumed_operands() -> Result<()> {
        // return a + b
        let mut asm = Assembler::new();
        asm.emit(Opcode::LoadGlobal, 0)?;
        asm.emit(Opcode::LoadGlobal, 1)?;
        asm.emit(Opcode::BinaryAdd, 0)?;
        asm.emit(Opcode::ReturnValue, 0)?;
        let interp = analyse(CodeObject::new("add", asm.finalize()?, vec![], 0))?;

        assert_eq!(interp.raise_depth(0), Some(0));
        assert_eq!(interp.raise_depth(2), Some(1));
        assert_eq!(interp.raise_depth(4), Some(0));
        assert_eq!(interp.raise_and_free().spill_locals().len(), 1);
        Ok(())
    }

    #[test]
    fn test_known_branch_specialised() -> Result<()> {
        let mut asm = Assembler::new();
        asm.emit(Opcode::LoadConst, 0)?;
        asm.emit_jump(Opcode::PopJumpIfFalse, "else")?;
        asm.emit(Opcode::LoadConst, 0)?;
        asm.emit(Opcode::ReturnValue, 0)?;
        asm.define_label("else")?;
        asm.emit(Opcode::LoadConst, 0)?;
        asm.emit(Opcode::ReturnValue, 0)?;
        let bytecode = asm.finalize()?;

        let code = CodeObject::new("f", bytecode.clone(), vec![Constant::None], 0);
        let interp = analyse(code)?;
        assert!(interp.states[4].is_none());
        assert!(interp.states[8].is_some());

        let code = CodeObject::new("f", bytecode, vec![Constant::None], 0);
        let mut interp = AbstractInterpreter::new(code, AnalysisConfig::minimal())?;
        interp.interpret(&mut SymbolicBackend::new())?;
        assert!(interp.states[4].is_some());
        Ok(())
    }

    #[test]
    fn test_batch_preserves_order() {
        let ok = CodeObject::new("ok", vec![100, 0, 83, 0], vec![Constant::None], 0);
        let bad = CodeObject::new("bad", vec![1, 0], vec![], 0);
        let results = analyze_batch(
            vec![ok.clone(), bad, ok],
            AnalysisConfig::default(),
            SymbolicBackend::new,
        );
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(Error::StackUnderflow { offset: 0 })));
        assert_eq!(results[2].as_ref().map(|(i, _)| i.code().name.as_str()).ok(), Some("ok"));
    }
}
