//! Loop and exception region model.
//!
//! Wordcode marks its lexical regions with explicit instructions:
//! `SETUP_LOOP` / `SETUP_EXCEPT` / `SETUP_FINALLY` open a region whose end (or
//! handler) is the instruction's jump target, `POP_BLOCK` closes the innermost
//! one, and `END_FINALLY` ends an active except or finally handler body.
//!
//! [`BlockModel::preprocess`] replays these markers over the instruction
//! stream once and records:
//!
//! - every region as a [`BlockInfo`] in an arena with parent links, plus the
//!   innermost region in effect at each offset, so the block stack at any
//!   offset is the parent chain of [`BlockModel::block_at`];
//! - one [`ExceptionHandler`] per try region, chained to the handler of the
//!   lexically enclosing try through `back_handler`;
//! - the loop every `BREAK_LOOP` leaves, and which try/finally regions are
//!   crossed by a `break`, `continue` or `return`.
//!
//! When a try body's `POP_BLOCK` is seen, the try block is replaced by a
//! handler-active block ([`BlockKind::ExceptHandler`] or
//! [`BlockKind::FinallyHandler`]) whose parent is the try's parent. Code in the
//! handler body is then governed by the enclosing regions only.
//!
//! # Stack levels
//!
//! A block's level is the evaluation stack depth at its `SETUP_*` instruction.
//! It is only known once the fixed point analysis reaches that instruction, so
//! the analysis reports it through [`BlockModel::set_level`]. Unwinding to a
//! block truncates the stack to its level. Handler entry adds the values the
//! run time pushes: three objects (traceback, value, type) for an except
//! handler and one object for a finally body.

use bitflags::bitflags;

use crate::{
    analysis::StackKind,
    backend::{Backend, Label, Local, LocalKind},
    bytecode::{Instructions, Opcode},
    Error, Result,
};

/// Index of a block in its [`BlockModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub usize);

/// Index of an exception handler in its [`BlockModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub usize);

/// The kind of a lexical region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// `SETUP_LOOP` body
    Loop,
    /// `SETUP_EXCEPT` body
    TryExcept,
    /// `SETUP_FINALLY` body
    TryFinally,
    /// Except clauses of a closed try/except
    ExceptHandler,
    /// Finally body of a closed try/finally
    FinallyHandler,
}

impl BlockKind {
    /// Returns `true` for protected try bodies.
    #[must_use]
    pub fn is_try(self) -> bool {
        matches!(self, BlockKind::TryExcept | BlockKind::TryFinally)
    }

    /// Returns `true` for handler bodies.
    #[must_use]
    pub fn is_handler(self) -> bool {
        matches!(self, BlockKind::ExceptHandler | BlockKind::FinallyHandler)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    /// Control flow facts about a block or handler
    pub struct EhFlags: u8 {
        /// A `continue` leaves the region
        const BLOCK_CONTINUES = 0x01;
        /// A `return` leaves the region
        const BLOCK_RETURNS = 0x02;
        /// A `break` leaves the region
        const BLOCK_BREAKS = 0x04;
        /// The handler runs a finally body
        const TRY_FINALLY = 0x08;
        /// The handler runs except clauses
        const TRY_EXCEPT = 0x10;
        /// The block is an active handler body
        const IN_EXCEPT_HANDLER = 0x20;
    }
}

/// Life cycle of a protected region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    /// The try body is being executed
    Open,
    /// The try body ended; its handler governs the handler body
    HandlerActive,
    /// The handler body ended
    Retired,
}

/// One lexical region.
#[derive(Debug, Clone)]
pub struct BlockInfo {
    /// Region kind
    pub kind: BlockKind,
    /// Offset of the instruction that opened the block
    pub start: usize,
    /// End of a loop, or handler target of a try body
    pub end: usize,
    /// Target of `continue` statements leaving the loop
    pub continue_target: Option<usize>,
    /// Enclosing block
    pub parent: Option<BlockId>,
    /// Handler of a try block or handler body
    pub handler: Option<HandlerId>,
    /// The try block a handler body replaced
    pub origin: Option<BlockId>,
    /// Control flow facts
    pub flags: EhFlags,
}

/// The loop a `break` leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbsIntBlockInfo {
    /// Offset of the `SETUP_LOOP`
    pub block_start: usize,
    /// First offset after the loop
    pub block_end: usize,
    /// Always `true` for break targets
    pub is_loop: bool,
}

/// Backend locals holding exception state across a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionVars {
    /// Exception type active before the handler was entered
    pub prev_exc: Local,
    /// Exception value active before the handler was entered
    pub prev_exc_val: Local,
    /// Traceback active before the handler was entered
    pub prev_traceback: Local,
    /// Exception type, value and traceback propagating through a finally body
    pub finally: Option<[Local; 3]>,
}

impl ExceptionVars {
    /// All locals, in allocation order.
    pub fn locals(&self) -> impl Iterator<Item = Local> + '_ {
        [self.prev_exc, self.prev_exc_val, self.prev_traceback]
            .into_iter()
            .chain(self.finally.into_iter().flatten())
    }
}

/// Branch targets of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerLabels {
    /// Entry taken by an error raised in the protected body
    pub error_target: Label,
    /// Start of the raise path
    pub raise: Label,
    /// Start of the re-raise path
    pub reraise: Label,
}

/// One try region and its handler.
#[derive(Debug, Clone)]
pub struct ExceptionHandler {
    /// Handler index
    pub id: HandlerId,
    /// The try block
    pub block: BlockId,
    /// Offset of the `SETUP_EXCEPT` / `SETUP_FINALLY`
    pub setup_offset: usize,
    /// First offset of the handler body
    pub target_offset: usize,
    /// Handler of the lexically enclosing try
    pub back_handler: Option<HandlerId>,
    /// `TRY_EXCEPT` or `TRY_FINALLY` plus the control flow facts
    pub flags: EhFlags,
    /// Offset of the `POP_BLOCK` closing the try body
    pub closed_at: Option<usize>,
    /// Offset of the `END_FINALLY` ending the handler body
    pub retired_at: Option<usize>,
    /// Stack representation at handler entry, known after analysis
    pub entry_stack: Vec<StackKind>,
    vars: Option<ExceptionVars>,
    labels: Option<HandlerLabels>,
}

impl ExceptionHandler {
    /// Returns `true` for try/finally handlers.
    #[must_use]
    pub fn is_finally(&self) -> bool {
        self.flags.contains(EhFlags::TRY_FINALLY)
    }

    /// Region state at `offset`.
    #[must_use]
    pub fn state_at(&self, offset: usize) -> RegionState {
        match (self.closed_at, self.retired_at) {
            (_, Some(retired)) if offset > retired => RegionState::Retired,
            (Some(closed), _) if offset >= closed => RegionState::HandlerActive,
            _ => RegionState::Open,
        }
    }

    /// Saved exception state locals, once allocated.
    #[must_use]
    pub fn vars(&self) -> Option<&ExceptionVars> {
        self.vars.as_ref()
    }

    /// Branch targets, once allocated.
    #[must_use]
    pub fn labels(&self) -> Option<&HandlerLabels> {
        self.labels.as_ref()
    }

    /// Values the run time pushes on top of the block level at entry.
    #[must_use]
    pub fn entry_values(&self) -> usize {
        if self.is_finally() {
            1
        } else {
            3
        }
    }
}

/// Which statement leaves its regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchKind {
    /// `break`
    Break,
    /// `continue`
    Continue,
    /// `return`
    Return,
}

/// One action taken while leaving a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindStep {
    /// Run the finally body at `target` before going on
    RunFinally {
        /// Handler of the try/finally
        handler: HandlerId,
        /// Start of the finally body
        target: usize,
    },
    /// Drop a loop or try/except block
    PopBlock {
        /// The block left
        block: BlockId,
    },
    /// Leave a handler body, restoring the previous exception state
    PopExcept {
        /// The handler body left
        block: BlockId,
    },
}

/// How a `break`, `continue` or `return` reaches its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindPlan {
    /// Actions, innermost region first
    pub steps: Vec<UnwindStep>,
    /// Final destination, `None` for leaving the function
    pub target: Option<usize>,
    /// Stack depth at the destination, `None` if the stack is kept
    pub level: Option<usize>,
}

impl UnwindPlan {
    /// The first finally body to run, if any.
    #[must_use]
    pub fn first_finally(&self) -> Option<(HandlerId, usize)> {
        self.steps.iter().find_map(|step| match *step {
            UnwindStep::RunFinally { handler, target } => Some((handler, target)),
            _ => None,
        })
    }
}

/// Iterator over a handler and its enclosing handlers, innermost first.
pub struct HandlerChain<'a> {
    model: &'a BlockModel,
    next: Option<HandlerId>,
}

impl Iterator for HandlerChain<'_> {
    type Item = HandlerId;

    fn next(&mut self) -> Option<HandlerId> {
        let current = self.next?;
        self.next = self
            .model
            .handlers
            .get(current.0)
            .and_then(|h| h.back_handler);
        Some(current)
    }
}

/// Regions and handlers of one function.
#[derive(Debug, Clone, Default)]
pub struct BlockModel {
    blocks: Vec<BlockInfo>,
    handlers: Vec<ExceptionHandler>,
    /// Innermost block in effect, per offset
    block_at: Vec<Option<BlockId>>,
    /// `SETUP_*` offset of the block a `POP_BLOCK` closes, per offset
    pop_starts: Vec<Option<usize>>,
    /// Handler body an `END_FINALLY` ends, per offset
    end_finally: Vec<Option<BlockId>>,
    /// Loop a `BREAK_LOOP` leaves, per offset
    break_to: Vec<Option<AbsIntBlockInfo>>,
    /// Stack depth at each block's `SETUP_*`
    levels: Vec<Option<usize>>,
}

impl BlockModel {
    /// Builds the region model of a function.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedOpcode`] for generators, `with` and async code
    /// - [`Error::UnbalancedBlocks`] when `POP_BLOCK` / `END_FINALLY` do not
    ///   match the open regions, or regions are left open
    /// - [`Error::Malformed`] for a `break` or `continue` outside a loop
    pub fn preprocess(instructions: &Instructions) -> Result<Self> {
        let size = instructions.code_len();
        let mut model = BlockModel {
            block_at: vec![None; size],
            pop_starts: vec![None; size],
            end_finally: vec![None; size],
            break_to: vec![None; size],
            ..Default::default()
        };
        let mut stack: Vec<BlockId> = Vec::new();

        for instr in instructions {
            let offset = instr.offset;
            model.block_at[offset] = stack.last().copied();

            match instr.opcode {
                op if op.is_unsupported() => {
                    return Err(Error::UnsupportedOpcode {
                        offset,
                        opcode: op.name(),
                    });
                }
                Opcode::SetupLoop => {
                    let end = Self::setup_target(instr.jump_target(), offset)?;
                    let id = model.push_block(BlockKind::Loop, offset, end, stack.last().copied());
                    stack.push(id);
                }
                Opcode::SetupExcept | Opcode::SetupFinally => {
                    let end = Self::setup_target(instr.jump_target(), offset)?;
                    let parent = stack.last().copied();
                    let (kind, flag) = if instr.opcode == Opcode::SetupExcept {
                        (BlockKind::TryExcept, EhFlags::TRY_EXCEPT)
                    } else {
                        (BlockKind::TryFinally, EhFlags::TRY_FINALLY)
                    };

                    let id = model.push_block(kind, offset, end, parent);
                    let handler = HandlerId(model.handlers.len());
                    let back_handler = model
                        .enclosing_try(parent)
                        .and_then(|b| model.blocks[b.0].handler);
                    model.handlers.push(ExceptionHandler {
                        id: handler,
                        block: id,
                        setup_offset: offset,
                        target_offset: end,
                        back_handler,
                        flags: flag,
                        closed_at: None,
                        retired_at: None,
                        entry_stack: Vec::new(),
                        vars: None,
                        labels: None,
                    });
                    model.blocks[id.0].handler = Some(handler);
                    stack.push(id);
                }
                Opcode::PopBlock => {
                    let top = stack.pop().ok_or(Error::UnbalancedBlocks { offset })?;
                    let block = model.blocks[top.0].clone();
                    model.pop_starts[offset] = Some(block.start);

                    match block.kind {
                        BlockKind::Loop => {}
                        BlockKind::TryExcept | BlockKind::TryFinally => {
                            let handler = block.handler.ok_or_else(|| {
                                invariant_error!("Try block at {} has no handler", block.start)
                            })?;
                            model.handlers[handler.0].closed_at = Some(offset);

                            let kind = if block.kind == BlockKind::TryExcept {
                                BlockKind::ExceptHandler
                            } else {
                                BlockKind::FinallyHandler
                            };
                            let active = model.push_block(kind, offset, block.end, block.parent);
                            let info = &mut model.blocks[active.0];
                            info.handler = Some(handler);
                            info.origin = Some(top);
                            info.flags |= EhFlags::IN_EXCEPT_HANDLER;
                            stack.push(active);
                        }
                        BlockKind::ExceptHandler | BlockKind::FinallyHandler => {
                            return Err(Error::UnbalancedBlocks { offset });
                        }
                    }
                }
                Opcode::EndFinally => {
                    let top = stack
                        .last()
                        .copied()
                        .filter(|b| model.blocks[b.0].kind.is_handler())
                        .ok_or(Error::UnbalancedBlocks { offset })?;
                    stack.pop();
                    model.end_finally[offset] = Some(top);
                    if let Some(handler) = model.blocks[top.0].handler {
                        model.handlers[handler.0].retired_at = Some(offset);
                    }
                }
                Opcode::BreakLoop => {
                    let lp = model.mark_crossed(&stack, EhFlags::BLOCK_BREAKS, true);
                    let lp = lp.ok_or_else(|| {
                        malformed_error!("BREAK_LOOP outside of a loop at offset {}", offset)
                    })?;
                    let info = &model.blocks[lp.0];
                    model.break_to[offset] = Some(AbsIntBlockInfo {
                        block_start: info.start,
                        block_end: info.end,
                        is_loop: true,
                    });
                }
                Opcode::ContinueLoop => {
                    let lp = model.mark_crossed(&stack, EhFlags::BLOCK_CONTINUES, true);
                    let lp = lp.ok_or_else(|| {
                        malformed_error!("CONTINUE_LOOP outside of a loop at offset {}", offset)
                    })?;
                    let target = instr.jump_target();
                    let info = &mut model.blocks[lp.0];
                    match info.continue_target {
                        Some(existing) if Some(existing) != target => {
                            return Err(malformed_error!(
                                "CONTINUE_LOOP at {} targets {:?}, loop continues at {}",
                                offset,
                                target,
                                existing
                            ));
                        }
                        _ => info.continue_target = target,
                    }
                }
                Opcode::ReturnValue => {
                    model.mark_crossed(&stack, EhFlags::BLOCK_RETURNS, false);
                }
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(Error::UnbalancedBlocks { offset: size });
        }

        model.levels = vec![None; model.blocks.len()];
        Ok(model)
    }

    fn setup_target(target: Option<usize>, offset: usize) -> Result<usize> {
        target.ok_or_else(|| malformed_error!("Block setup without target at offset {}", offset))
    }

    fn push_block(
        &mut self,
        kind: BlockKind,
        start: usize,
        end: usize,
        parent: Option<BlockId>,
    ) -> BlockId {
        self.blocks.push(BlockInfo {
            kind,
            start,
            end,
            continue_target: None,
            parent,
            handler: None,
            origin: None,
            flags: EhFlags::empty(),
        });
        BlockId(self.blocks.len() - 1)
    }

    /// Sets `flag` on every try/finally between the top of `stack` and the
    /// innermost loop (or the bottom). Returns that loop.
    fn mark_crossed(
        &mut self,
        stack: &[BlockId],
        flag: EhFlags,
        stop_at_loop: bool,
    ) -> Option<BlockId> {
        for &id in stack.iter().rev() {
            let kind = self.blocks[id.0].kind;
            if stop_at_loop && kind == BlockKind::Loop {
                return Some(id);
            }
            if kind == BlockKind::TryFinally {
                self.blocks[id.0].flags |= flag;
                if let Some(handler) = self.blocks[id.0].handler {
                    self.handlers[handler.0].flags |= flag;
                }
            }
        }
        None
    }

    /// All blocks, indexed by [`BlockId`].
    #[must_use]
    pub fn blocks(&self) -> &[BlockInfo] {
        &self.blocks
    }

    /// All handlers, indexed by [`HandlerId`].
    #[must_use]
    pub fn handlers(&self) -> &[ExceptionHandler] {
        &self.handlers
    }

    /// A block by id.
    #[must_use]
    pub fn block(&self, id: BlockId) -> Option<&BlockInfo> {
        self.blocks.get(id.0)
    }

    /// A handler by id.
    #[must_use]
    pub fn handler(&self, id: HandlerId) -> Option<&ExceptionHandler> {
        self.handlers.get(id.0)
    }

    /// Innermost block in effect at `offset`.
    #[must_use]
    pub fn block_at(&self, offset: usize) -> Option<BlockId> {
        self.block_at.get(offset).copied().flatten()
    }

    /// The block stack at `offset`, innermost first.
    #[must_use]
    pub fn block_stack(&self, offset: usize) -> Vec<BlockId> {
        std::iter::successors(self.block_at(offset), |b| self.blocks[b.0].parent).collect()
    }

    /// `SETUP_*` offset of the block closed by the `POP_BLOCK` at `offset`.
    #[must_use]
    pub fn block_start_for_pop(&self, offset: usize) -> Option<usize> {
        self.pop_starts.get(offset).copied().flatten()
    }

    /// For an `END_FINALLY` at `offset`, whether it ends a finally body
    /// (`Some(true)`) or except clauses (`Some(false)`).
    #[must_use]
    pub fn end_finally_is_finally(&self, offset: usize) -> Option<bool> {
        self.end_finally_block(offset)
            .map(|b| self.blocks[b.0].kind == BlockKind::FinallyHandler)
    }

    /// Handler body ended by the `END_FINALLY` at `offset`.
    #[must_use]
    pub fn end_finally_block(&self, offset: usize) -> Option<BlockId> {
        self.end_finally.get(offset).copied().flatten()
    }

    /// The loop left by the `BREAK_LOOP` at `offset`.
    #[must_use]
    pub fn break_target(&self, offset: usize) -> Option<AbsIntBlockInfo> {
        self.break_to.get(offset).copied().flatten()
    }

    /// Innermost try block at or above `block`.
    #[must_use]
    pub fn enclosing_try(&self, block: Option<BlockId>) -> Option<BlockId> {
        std::iter::successors(block, |b| self.blocks[b.0].parent)
            .find(|b| self.blocks[b.0].kind.is_try())
    }

    /// Handler receiving errors raised at `offset`.
    #[must_use]
    pub fn handler_for(&self, offset: usize) -> Option<HandlerId> {
        self.enclosing_try(self.block_at(offset))
            .and_then(|b| self.blocks[b.0].handler)
    }

    /// Walks `from` and its enclosing handlers, innermost first.
    #[must_use]
    pub fn handler_chain(&self, from: Option<HandlerId>) -> HandlerChain<'_> {
        HandlerChain {
            model: self,
            next: from,
        }
    }

    /// Finally bodies to run when control leaves handler `from` for handler
    /// `to` (exclusive), or for the function boundary when `to` is `None`.
    ///
    /// Steps are ordered innermost first.
    #[must_use]
    pub fn unwind_eh(&self, from: Option<HandlerId>, to: Option<HandlerId>) -> Vec<UnwindStep> {
        self.handler_chain(from)
            .take_while(|&h| Some(h) != to)
            .filter_map(|h| {
                let handler = &self.handlers[h.0];
                handler.is_finally().then_some(UnwindStep::RunFinally {
                    handler: h,
                    target: handler.target_offset,
                })
            })
            .collect()
    }

    /// How the `BREAK_LOOP` or `CONTINUE_LOOP` at `offset` reaches its loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] outside a loop and [`Error::Invariant`]
    /// if the loop level is not known yet.
    pub fn unwind_loop(&self, offset: usize, kind: BranchKind) -> Result<UnwindPlan> {
        self.plan_from(self.block_at(offset), kind)
    }

    /// How the `RETURN_VALUE` at `offset` leaves the function.
    ///
    /// # Errors
    ///
    /// Only fails on internal inconsistencies of the model.
    pub fn unwind_return(&self, offset: usize) -> Result<UnwindPlan> {
        self.plan_from(self.block_at(offset), BranchKind::Return)
    }

    /// Where a `break`, `continue` or `return` that ran the finally body ended
    /// by the `END_FINALLY` at `offset` goes next.
    ///
    /// Returns `None` if no such statement passes through that finally body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if `offset` does not end a finally body.
    pub fn continuation(&self, offset: usize, kind: BranchKind) -> Result<Option<UnwindPlan>> {
        let block = self
            .end_finally_block(offset)
            .filter(|b| self.blocks[b.0].kind == BlockKind::FinallyHandler)
            .ok_or_else(|| malformed_error!("No finally body ends at offset {}", offset))?;
        let info = &self.blocks[block.0];
        let flags = info
            .handler
            .map(|h| self.handlers[h.0].flags)
            .unwrap_or_default();
        let needed = match kind {
            BranchKind::Break => EhFlags::BLOCK_BREAKS,
            BranchKind::Continue => EhFlags::BLOCK_CONTINUES,
            BranchKind::Return => EhFlags::BLOCK_RETURNS,
        };
        if !flags.contains(needed) {
            return Ok(None);
        }
        self.plan_from(info.parent, kind).map(Some)
    }

    fn plan_from(&self, start: Option<BlockId>, kind: BranchKind) -> Result<UnwindPlan> {
        let mut steps = Vec::new();
        let mut outermost_left = None;
        let mut current = start;

        while let Some(id) = current {
            let block = &self.blocks[id.0];
            if kind != BranchKind::Return && block.kind == BlockKind::Loop {
                let (target, level) = match kind {
                    BranchKind::Break => (Some(block.end), Some(self.required_level(id)?)),
                    _ => {
                        let target = block.continue_target.ok_or_else(|| {
                            malformed_error!("Loop at {} has no continue target", block.start)
                        })?;
                        let level = match outermost_left {
                            Some(left) => Some(self.required_level(left)?),
                            None => None,
                        };
                        (Some(target), level)
                    }
                };
                return Ok(UnwindPlan {
                    steps,
                    target,
                    level,
                });
            }

            steps.push(match block.kind {
                BlockKind::TryFinally => {
                    let handler = block.handler.ok_or_else(|| {
                        invariant_error!("Try block at {} has no handler", block.start)
                    })?;
                    UnwindStep::RunFinally {
                        handler,
                        target: block.end,
                    }
                }
                BlockKind::Loop | BlockKind::TryExcept => UnwindStep::PopBlock { block: id },
                BlockKind::ExceptHandler | BlockKind::FinallyHandler => {
                    UnwindStep::PopExcept { block: id }
                }
            });
            outermost_left = Some(id);
            current = block.parent;
        }

        match kind {
            BranchKind::Return => Ok(UnwindPlan {
                steps,
                target: None,
                level: Some(0),
            }),
            _ => Err(malformed_error!("{:?} outside of a loop", kind)),
        }
    }

    /// Stack depth at the `SETUP_*` of `block`, once analysed.
    ///
    /// Handler bodies share the level of the try block they replaced.
    #[must_use]
    pub fn level(&self, block: BlockId) -> Option<usize> {
        let info = self.blocks.get(block.0)?;
        let id = info.origin.unwrap_or(block);
        self.levels.get(id.0).copied().flatten()
    }

    fn required_level(&self, block: BlockId) -> Result<usize> {
        self.level(block).ok_or_else(|| {
            invariant_error!(
                "Level of block at {} is not known",
                self.blocks[block.0].start
            )
        })
    }

    /// Stack depth at handler entry: block level plus the pushed exception
    /// values.
    #[must_use]
    pub fn handler_entry_depth(&self, handler: HandlerId) -> Option<usize> {
        let info = self.handlers.get(handler.0)?;
        self.level(info.block).map(|l| l + info.entry_values())
    }

    /// Records the stack depth at the `SETUP_*` of `block`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StackDepthMismatch`] if a different depth was recorded.
    pub fn set_level(&mut self, block: BlockId, level: usize) -> Result<()> {
        let start = self
            .blocks
            .get(block.0)
            .map(|b| b.start)
            .ok_or_else(|| invariant_error!("Unknown block {}", block.0))?;
        match self.levels[block.0] {
            Some(existing) if existing != level => Err(Error::StackDepthMismatch {
                offset: start,
                expected: existing,
                found: level,
            }),
            _ => {
                self.levels[block.0] = Some(level);
                Ok(())
            }
        }
    }

    /// The block opened by the `SETUP_*` at `offset`.
    #[must_use]
    pub fn block_opened_at(&self, offset: usize) -> Option<BlockId> {
        self.blocks
            .iter()
            .position(|b| b.start == offset && !b.kind.is_handler())
            .map(BlockId)
    }

    /// Records the stack representation at entry of `handler`.
    pub fn set_entry_stack(&mut self, handler: HandlerId, kinds: Vec<StackKind>) {
        if let Some(info) = self.handlers.get_mut(handler.0) {
            info.entry_stack = kinds;
        }
    }

    /// Allocates saved exception state locals and branch labels for every
    /// handler that does not have them yet.
    pub fn allocate(&mut self, backend: &mut dyn Backend) {
        for handler in &mut self.handlers {
            if handler.vars.is_none() {
                let finally = handler.is_finally().then(|| {
                    [
                        backend.define_local(LocalKind::Object),
                        backend.define_local(LocalKind::Object),
                        backend.define_local(LocalKind::Object),
                    ]
                });
                handler.vars = Some(ExceptionVars {
                    prev_exc: backend.define_local(LocalKind::Object),
                    prev_exc_val: backend.define_local(LocalKind::Object),
                    prev_traceback: backend.define_local(LocalKind::Object),
                    finally,
                });
            }
            if handler.labels.is_none() {
                handler.labels = Some(HandlerLabels {
                    error_target: backend.define_label(),
                    raise: backend.define_label(),
                    reraise: backend.define_label(),
                });
            }
        }
    }

    /// Releases every handler local.
    ///
    /// # Errors
    ///
    /// Propagates backend failures; releasing twice yields
    /// [`Error::LocalDoubleFree`].
    pub fn release(&self, backend: &mut dyn Backend) -> Result<()> {
        for vars in self.handlers.iter().filter_map(|h| h.vars.as_ref()) {
            for local in vars.locals() {
                backend.free_local(local)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::SymbolicBackend, bytecode::Assembler};

    fn model(asm: Assembler) -> Result<(Instructions, BlockModel)> {
        let code = asm.finalize()?;
        let instrs = Instructions::decode(&code)?;
        let model = BlockModel::preprocess(&instrs)?;
        Ok((instrs, model))
    }

    /// `try: return x finally: pass`
    fn try_finally_return() -> Result<Assembler> {
        let mut asm = Assembler::new();
        asm.emit_jump(Opcode::SetupFinally, "finally")?;
        asm.emit(Opcode::LoadFast, 0)?;
        asm.define_label("ret")?;
        asm.emit(Opcode::ReturnValue, 0)?;
        asm.emit(Opcode::PopBlock, 0)?;
        asm.emit(Opcode::LoadConst, 0)?;
        asm.define_label("finally")?;
        asm.emit(Opcode::EndFinally, 0)?;
        asm.emit(Opcode::LoadConst, 0)?;
        asm.emit(Opcode::ReturnValue, 0)?;
        Ok(asm)
    }

    #[test]
    fn test_try_finally_return() -> Result<()> {
        let (_, mut model) = model(try_finally_return()?)?;
        assert_eq!(model.blocks().len(), 2);
        assert_eq!(model.handlers().len(), 1);

        let handler = &model.handlers()[0];
        assert!(handler.is_finally());
        assert!(handler.flags.contains(EhFlags::BLOCK_RETURNS));
        assert_eq!(handler.target_offset, 10);
        assert_eq!(handler.state_at(4), RegionState::Open);
        assert_eq!(handler.state_at(6), RegionState::HandlerActive);
        assert_eq!(handler.state_at(12), RegionState::Retired);

        assert_eq!(model.block_start_for_pop(6), Some(0));
        assert_eq!(model.end_finally_is_finally(10), Some(true));
        assert_eq!(model.handler_for(4), Some(HandlerId(0)));
        assert_eq!(model.handler_for(10), None);

        model.set_level(BlockId(0), 0)?;
        let plan = model.unwind_return(4)?;
        assert_eq!(plan.first_finally(), Some((HandlerId(0), 10)));
        assert_eq!(plan.target, None);

        let next = model.continuation(10, BranchKind::Return)?;
        assert_eq!(next.map(|p| p.steps), Some(vec![]));
        assert!(model.continuation(10, BranchKind::Break)?.is_none());
        assert_eq!(model.handler_entry_depth(HandlerId(0)), Some(1));
        Ok(())
    }

    #[test]
    fn test_nested_handler_chain() -> Result<()> {
        let mut asm = Assembler::new();
        asm.emit_jump(Opcode::SetupExcept, "outer")?;
        asm.emit_jump(Opcode::SetupFinally, "middle")?;
        asm.emit_jump(Opcode::SetupExcept, "inner")?;
        asm.emit(Opcode::LoadFast, 0)?;
        asm.emit(Opcode::PopTop, 0)?;
        asm.emit(Opcode::PopBlock, 0)?;
        asm.emit_jump(Opcode::JumpForward, "inner_end")?;
        asm.define_label("inner")?;
        asm.emit(Opcode::EndFinally, 0)?;
        asm.define_label("inner_end")?;
        asm.emit(Opcode::PopBlock, 0)?;
        asm.emit(Opcode::LoadConst, 0)?;
        asm.define_label("middle")?;
        asm.emit(Opcode::EndFinally, 0)?;
        asm.emit(Opcode::PopBlock, 0)?;
        asm.emit_jump(Opcode::JumpForward, "end")?;
        asm.define_label("outer")?;
        asm.emit(Opcode::EndFinally, 0)?;
        asm.define_label("end")?;
        asm.emit(Opcode::LoadConst, 0)?;
        asm.emit(Opcode::ReturnValue, 0)?;
        let (_, model) = model(asm)?;

        let innermost = model.handler_for(6).unwrap();
        let chain: Vec<_> = model.handler_chain(Some(innermost)).collect();
        assert_eq!(chain, vec![HandlerId(2), HandlerId(1), HandlerId(0)]);

        let steps = model.unwind_eh(Some(innermost), None);
        assert_eq!(
            steps,
            vec![UnwindStep::RunFinally {
                handler: HandlerId(1),
                target: model.handlers()[1].target_offset
            }]
        );
        assert!(model.unwind_eh(Some(innermost), Some(HandlerId(1))).is_empty());
        Ok(())
    }

    #[test]
    fn test_break_through_finally() -> Result<()> {
        let mut asm = Assembler::new();
        asm.emit_jump(Opcode::SetupLoop, "end")?;
        asm.define_label("top")?;
        asm.emit_jump(Opcode::SetupFinally, "finally")?;
        asm.emit(Opcode::BreakLoop, 0)?;
        asm.emit(Opcode::PopBlock, 0)?;
        asm.emit(Opcode::LoadConst, 0)?;
        asm.define_label("finally")?;
        asm.emit(Opcode::EndFinally, 0)?;
        asm.emit_jump(Opcode::JumpAbsolute, "top")?;
        asm.emit(Opcode::PopBlock, 0)?;
        asm.define_label("end")?;
        asm.emit(Opcode::LoadConst, 0)?;
        asm.emit(Opcode::ReturnValue, 0)?;
        let (_, mut model) = model(asm)?;

        assert_eq!(
            model.break_target(4),
            Some(AbsIntBlockInfo {
                block_start: 0,
                block_end: 16,
                is_loop: true
            })
        );
        assert!(model.handlers()[0].flags.contains(EhFlags::BLOCK_BREAKS));

        // levels are unknown until analysed
        assert!(model.unwind_loop(4, BranchKind::Break).is_err());
        model.set_level(BlockId(0), 0)?;
        model.set_level(BlockId(1), 0)?;

        let plan = model.unwind_loop(4, BranchKind::Break)?;
        assert_eq!(plan.first_finally(), Some((HandlerId(0), 10)));
        assert_eq!(plan.target, Some(16));
        assert_eq!(plan.level, Some(0));

        let next = model.continuation(10, BranchKind::Break)?.unwrap();
        assert!(next.steps.is_empty());
        assert_eq!(next.target, Some(16));
        Ok(())
    }

    #[test]
    fn test_unbalanced() -> Result<()> {
        let mut asm = Assembler::new();
        asm.emit(Opcode::PopBlock, 0)?;
        asm.emit(Opcode::ReturnValue, 0)?;
        let code = asm.finalize()?;
        let instrs = Instructions::decode(&code)?;
        assert_eq!(
            BlockModel::preprocess(&instrs).unwrap_err(),
            Error::UnbalancedBlocks { offset: 0 }
        );

        let mut asm = Assembler::new();
        asm.emit_jump(Opcode::SetupLoop, "end")?;
        asm.define_label("end")?;
        asm.emit(Opcode::ReturnValue, 0)?;
        let code = asm.finalize()?;
        let instrs = Instructions::decode(&code)?;
        assert!(matches!(
            BlockModel::preprocess(&instrs),
            Err(Error::UnbalancedBlocks { offset: 4 })
        ));
        Ok(())
    }

    #[test]
    fn test_break_outside_loop() -> Result<()> {
        let mut asm = Assembler::new();
        asm.emit(Opcode::BreakLoop, 0)?;
        let code = asm.finalize()?;
        let instrs = Instructions::decode(&code)?;
        assert!(matches!(
            BlockModel::preprocess(&instrs),
            Err(Error::Malformed { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_unsupported_opcode() -> Result<()> {
        let mut asm = Assembler::new();
        asm.emit(Opcode::LoadConst, 0)?;
        asm.emit(Opcode::YieldValue, 0)?;
        let code = asm.finalize()?;
        let instrs = Instructions::decode(&code)?;
        assert_eq!(
            BlockModel::preprocess(&instrs).unwrap_err(),
            Error::UnsupportedOpcode {
                offset: 2,
                opcode: "YIELD_VALUE"
            }
        );
        Ok(())
    }

    #[test]
    fn test_level_conflict() -> Result<()> {
        let (_, mut model) = model(try_finally_return()?)?;
        model.set_level(BlockId(0), 2)?;
        model.set_level(BlockId(0), 2)?;
        assert!(matches!(
            model.set_level(BlockId(0), 3),
            Err(Error::StackDepthMismatch { offset: 0, .. })
        ));
        assert_eq!(model.level(BlockId(1)), Some(2));
        Ok(())
    }

    #[test]
    fn test_allocate_and_release() -> Result<()> {
        let (_, mut model) = model(try_finally_return()?)?;
        let mut backend = SymbolicBackend::new();
        model.allocate(&mut backend);
        model.allocate(&mut backend);

        let handler = &model.handlers()[0];
        assert_eq!(handler.vars().unwrap().locals().count(), 6);
        assert!(handler.labels().is_some());
        assert_eq!(backend.live_locals(), 6);
        assert_eq!(backend.label_count(), 3);

        model.release(&mut backend)?;
        assert_eq!(backend.live_locals(), 0);
        assert!(matches!(
            model.release(&mut backend),
            Err(Error::LocalDoubleFree(_))
        ));
        Ok(())
    }
}
