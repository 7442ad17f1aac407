//! Shared cleanup paths for raising with live stack values.
//!
//! An instruction that fails while `k` boxed values are live above its
//! handler's level must release exactly those `k` values before the raise
//! logic runs. Instead of giving every such site its own cleanup sequence, each
//! handler (and the function boundary) owns one chain of labels:
//!
//! ```text
//! entry[k]:   free spill[k-1]
//! entry[k-1]: free spill[k-2]
//! ...
//! entry[1]:   free spill[0]
//! entry[0]:   raise
//! ```
//!
//! A site with `k` live values spills them into the shared spill locals and
//! branches to `entry[k]`; falling through the chain frees exactly `k` values.
//! A second chain of the same shape ends in a re-raise.
//!
//! Operands an instruction consumes are released by the instruction itself
//! before it fails, so they are not part of `k`.

use std::collections::BTreeMap;

use crate::{
    analysis::{HandlerId, StackKind},
    backend::{Backend, Label, Local, LocalKind},
    Result,
};

/// One element of a laid out chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStep {
    /// Bind a chain entry label
    Mark(Label),
    /// Release the value held in spill local `n`
    Free(usize),
    /// Raise the pending error
    Raise,
    /// Re-raise the exception being handled
    Reraise,
}

/// A failing site waiting for cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaiseSite {
    /// Handler the error goes to, `None` for the function boundary
    pub handler: Option<HandlerId>,
    /// Boxed values live above the handler level
    pub depth: usize,
}

#[derive(Debug, Clone, Default)]
struct Chain {
    raise: Vec<Label>,
    reraise: Vec<Label>,
}

/// Raise-and-free chains of one function.
#[derive(Debug, Clone, Default)]
pub struct RaiseAndFreeChains {
    chains: BTreeMap<Option<HandlerId>, Chain>,
    spill_locals: Vec<Local>,
    sites: BTreeMap<usize, RaiseSite>,
}

impl RaiseAndFreeChains {
    /// Creates empty chains.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of boxed slots in `stack` above `level`.
    #[must_use]
    pub fn spill_count(stack: &[StackKind], level: usize) -> usize {
        stack
            .iter()
            .skip(level)
            .filter(|&&k| k == StackKind::Object)
            .count()
    }

    /// Records the failing site at `offset`.
    pub fn record_site(&mut self, offset: usize, site: RaiseSite) {
        self.sites.insert(offset, site);
    }

    /// The failing site at `offset`.
    #[must_use]
    pub fn site(&self, offset: usize) -> Option<&RaiseSite> {
        self.sites.get(&offset)
    }

    /// All failing sites, by offset.
    pub fn sites(&self) -> impl Iterator<Item = (usize, &RaiseSite)> {
        self.sites.iter().map(|(&o, s)| (o, s))
    }

    /// Grows the chains of `handler` until entries `0..=depth` exist.
    pub fn ensure_labels(
        &mut self,
        handler: Option<HandlerId>,
        depth: usize,
        backend: &mut dyn Backend,
    ) {
        let chain = self.chains.entry(handler).or_default();
        while chain.raise.len() <= depth {
            chain.raise.push(backend.define_label());
        }
        while chain.reraise.len() <= depth {
            chain.reraise.push(backend.define_label());
        }
    }

    /// Grows the shared spill locals to at least `count`.
    pub fn ensure_raise_and_free_locals(&mut self, count: usize, backend: &mut dyn Backend) {
        while self.spill_locals.len() < count {
            self.spill_locals.push(backend.define_local(LocalKind::Object));
        }
    }

    /// The shared spill locals.
    #[must_use]
    pub fn spill_locals(&self) -> &[Local] {
        &self.spill_locals
    }

    /// Entry of the raise chain for a site with `depth` live values.
    #[must_use]
    pub fn entry(&self, handler: Option<HandlerId>, depth: usize) -> Option<Label> {
        self.chains.get(&handler)?.raise.get(depth).copied()
    }

    /// Entry of the re-raise chain for a site with `depth` live values.
    #[must_use]
    pub fn reraise_entry(&self, handler: Option<HandlerId>, depth: usize) -> Option<Label> {
        self.chains.get(&handler)?.reraise.get(depth).copied()
    }

    /// Deepest entry of the chain of `handler`.
    #[must_use]
    pub fn max_depth(&self, handler: Option<HandlerId>) -> Option<usize> {
        self.chains
            .get(&handler)
            .and_then(|c| c.raise.len().checked_sub(1))
    }

    /// The fall-through sequence of one chain, deepest entry first.
    #[must_use]
    pub fn layout(&self, handler: Option<HandlerId>, reraise: bool) -> Vec<ChainStep> {
        let Some(chain) = self.chains.get(&handler) else {
            return Vec::new();
        };
        let labels = if reraise { &chain.reraise } else { &chain.raise };

        let mut steps = Vec::with_capacity(labels.len() * 2 + 1);
        for (depth, &label) in labels.iter().enumerate().rev() {
            steps.push(ChainStep::Mark(label));
            if depth > 0 {
                steps.push(ChainStep::Free(depth - 1));
            }
        }
        steps.push(if reraise {
            ChainStep::Reraise
        } else {
            ChainStep::Raise
        });
        steps
    }

    /// Spill locals released when entering the raise chain of `handler` at
    /// `depth`, in release order.
    ///
    /// Returns `None` if that entry does not exist.
    #[must_use]
    pub fn frees_from(&self, handler: Option<HandlerId>, depth: usize) -> Option<Vec<usize>> {
        let entry = self.entry(handler, depth)?;
        let layout = self.layout(handler, false);
        let start = layout.iter().position(|s| *s == ChainStep::Mark(entry))?;
        Some(
            layout[start..]
                .iter()
                .take_while(|s| **s != ChainStep::Raise)
                .filter_map(|s| match *s {
                    ChainStep::Free(n) => Some(n),
                    _ => None,
                })
                .collect(),
        )
    }

    /// Binds every chain label through `backend`, in layout order.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::LabelAlreadyMarked`] if called twice.
    pub fn bind(&self, backend: &mut dyn Backend) -> Result<()> {
        for &handler in self.chains.keys() {
            for reraise in [false, true] {
                for step in self.layout(handler, reraise) {
                    if let ChainStep::Mark(label) = step {
                        backend.mark_label(label)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Releases the spill locals.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::LocalDoubleFree`] when released twice.
    pub fn release(&self, backend: &mut dyn Backend) -> Result<()> {
        for &local in &self.spill_locals {
            backend.free_local(local)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::SymbolicBackend, Error};

    #[test]
    fn test_entries_free_exact_counts() {
        let mut backend = SymbolicBackend::new();
        let mut chains = RaiseAndFreeChains::new();
        let handler = Some(HandlerId(0));

        chains.ensure_labels(handler, 1, &mut backend);
        chains.ensure_labels(handler, 3, &mut backend);
        chains.ensure_raise_and_free_locals(3, &mut backend);

        assert_eq!(chains.max_depth(handler), Some(3));
        assert_eq!(chains.spill_locals().len(), 3);
        assert_eq!(chains.frees_from(handler, 0), Some(vec![]));
        assert_eq!(chains.frees_from(handler, 1), Some(vec![0]));
        assert_eq!(chains.frees_from(handler, 3), Some(vec![2, 1, 0]));
        assert_eq!(chains.frees_from(handler, 4), None);
        assert_eq!(chains.frees_from(None, 0), None);
    }

    #[test]
    fn test_layout_shape() {
        let mut backend = SymbolicBackend::new();
        let mut chains = RaiseAndFreeChains::new();
        chains.ensure_labels(None, 1, &mut backend);

        let raise = chains.layout(None, false);
        assert_eq!(
            raise,
            vec![
                ChainStep::Mark(chains.entry(None, 1).unwrap()),
                ChainStep::Free(0),
                ChainStep::Mark(chains.entry(None, 0).unwrap()),
                ChainStep::Raise,
            ]
        );
        assert_eq!(chains.layout(None, true).last(), Some(&ChainStep::Reraise));
        assert_ne!(chains.entry(None, 1), chains.reraise_entry(None, 1));
    }

    #[test]
    fn test_spill_count() {
        use StackKind::{Object, Value};
        assert_eq!(RaiseAndFreeChains::spill_count(&[Object, Value, Object, Object], 1), 2);
        assert_eq!(RaiseAndFreeChains::spill_count(&[Object], 3), 0);
    }

    #[test]
    fn test_bind_and_release() -> Result<()> {
        let mut backend = SymbolicBackend::new();
        let mut chains = RaiseAndFreeChains::new();
        chains.ensure_labels(None, 2, &mut backend);
        chains.ensure_raise_and_free_locals(2, &mut backend);

        chains.bind(&mut backend)?;
        assert!(matches!(
            chains.bind(&mut backend),
            Err(Error::LabelAlreadyMarked(_))
        ));

        chains.release(&mut backend)?;
        assert_eq!(backend.live_locals(), 0);
        assert!(matches!(
            chains.release(&mut backend),
            Err(Error::LocalDoubleFree(_))
        ));
        Ok(())
    }
}
