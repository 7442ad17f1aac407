//! Capabilities the analysis borrows from the code generator.
//!
//! The abstract interpreter never emits code, but exception handlers need
//! storage for the saved exception state and branch targets for their raise
//! paths. Those come from the code generator through the narrow [`Backend`]
//! trait: allocate a label, bind it, reserve a typed local, release it.
//!
//! [`SymbolicBackend`] is a bookkeeping implementation that hands out
//! numbered labels and locals and enforces the two misuse rules every real
//! backend must enforce as well: a label is bound at most once and a local is
//! released at most once.
//!
//! The [`Method`] and [`Module`] traits describe callees to the compiler. A
//! module resolves method tokens locally and otherwise delegates to its parent.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crate::{utils::BitSet, Error, Result};

/// A branch target allocated by a [`Backend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

/// Storage class of a backend local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalKind {
    /// A reference to a boxed object
    Object,
    /// A machine integer
    Int,
    /// An unboxed double
    Float,
    /// An unboxed boolean
    Bool,
}

/// A typed storage slot allocated by a [`Backend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Local {
    /// Slot number
    pub index: u32,
    /// Storage class
    pub kind: LocalKind,
}

/// Code generation capabilities used while modelling exception handlers.
pub trait Backend {
    /// Allocates a new, unbound label.
    fn define_label(&mut self) -> Label;

    /// Binds `label` to the current output position.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LabelAlreadyMarked`] if the label is already bound.
    fn mark_label(&mut self, label: Label) -> Result<()>;

    /// Reserves a local of the given kind.
    fn define_local(&mut self, kind: LocalKind) -> Local;

    /// Releases a local for reuse.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LocalDoubleFree`] if the local is not currently allocated.
    fn free_local(&mut self, local: Local) -> Result<()>;
}

/// A backend that only keeps the books.
///
/// Labels are bound to a monotonically increasing position counter; released
/// locals are recycled per kind, most recently freed first.
///
/// # Examples
///
/// ```rust
/// use jitscope::backend::{Backend, LocalKind, SymbolicBackend};
///
/// let mut backend = SymbolicBackend::new();
/// let local = backend.define_local(LocalKind::Object);
/// backend.free_local(local)?;
/// assert!(backend.free_local(local).is_err());
///
/// let label = backend.define_label();
/// backend.mark_label(label)?;
/// assert!(backend.mark_label(label).is_err());
/// # Ok::<(), jitscope::Error>(())
/// ```
#[derive(Debug, Default)]
pub struct SymbolicBackend {
    /// Bound position of every label, `None` while unbound
    labels: Vec<Option<usize>>,
    /// Kind of every local ever defined
    locals: Vec<LocalKind>,
    /// Locals currently released
    freed: BitSet,
    /// Released locals available for reuse, per kind
    free_lists: HashMap<LocalKind, Vec<u32>>,
    position: usize,
}

impl SymbolicBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of labels allocated.
    #[must_use]
    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    /// Position a label was bound to.
    #[must_use]
    pub fn label_position(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0 as usize).copied().flatten()
    }

    /// Number of distinct local slots ever allocated.
    #[must_use]
    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    /// Number of local slots currently allocated.
    #[must_use]
    pub fn live_locals(&self) -> usize {
        self.locals.len() - self.freed.count()
    }
}

impl Backend for SymbolicBackend {
    fn define_label(&mut self) -> Label {
        self.labels.push(None);
        Label((self.labels.len() - 1) as u32)
    }

    fn mark_label(&mut self, label: Label) -> Result<()> {
        let slot = self
            .labels
            .get_mut(label.0 as usize)
            .ok_or_else(|| invariant_error!("Label {} was never defined", label.0))?;
        if slot.is_some() {
            return Err(Error::LabelAlreadyMarked(label.0));
        }
        *slot = Some(self.position);
        self.position += 1;
        Ok(())
    }

    fn define_local(&mut self, kind: LocalKind) -> Local {
        if let Some(index) = self.free_lists.get_mut(&kind).and_then(Vec::pop) {
            self.freed.remove(index as usize);
            return Local { index, kind };
        }

        self.locals.push(kind);
        Local {
            index: (self.locals.len() - 1) as u32,
            kind,
        }
    }

    fn free_local(&mut self, local: Local) -> Result<()> {
        let index = local.index as usize;
        if index >= self.locals.len() || self.locals[index] != local.kind {
            return Err(invariant_error!(
                "Local {} of kind {:?} was never defined",
                local.index,
                local.kind
            ));
        }
        if !self.freed.insert(index) {
            return Err(Error::LocalDoubleFree(local.index));
        }
        self.free_lists
            .entry(local.kind)
            .or_default()
            .push(local.index);
        Ok(())
    }
}

/// A declared parameter of a [`Method`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parameter {
    /// Storage class the callee expects
    pub kind: LocalKind,
}

/// A callable known to the compiler.
pub trait Method: Send + Sync {
    /// Display name.
    fn name(&self) -> &str;

    /// Declared parameters.
    fn params(&self) -> &[Parameter];

    /// Number of parameters.
    fn param_count(&self) -> usize {
        self.params().len()
    }

    /// Storage class of the return value.
    fn return_kind(&self) -> LocalKind;

    /// Entry address.
    fn addr(&self) -> usize;
}

/// A method resolver.
pub trait Module: Send + Sync {
    /// Resolves a method token.
    fn resolve_method(&self, token: u32) -> Option<Arc<dyn Method>>;

    /// Finds the token under which the method at `addr` is registered.
    fn resolve_method_token(&self, addr: usize) -> Option<u32>;
}

/// A method defined by the embedding application.
#[derive(Debug, Clone)]
pub struct UserMethod {
    name: String,
    params: Vec<Parameter>,
    return_kind: LocalKind,
    addr: usize,
}

impl UserMethod {
    /// Creates a method descriptor.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        params: Vec<Parameter>,
        return_kind: LocalKind,
        addr: usize,
    ) -> Self {
        Self {
            name: name.into(),
            params,
            return_kind,
            addr,
        }
    }
}

impl Method for UserMethod {
    fn name(&self) -> &str {
        &self.name
    }

    fn params(&self) -> &[Parameter] {
        &self.params
    }

    fn return_kind(&self) -> LocalKind {
        self.return_kind
    }

    fn addr(&self) -> usize {
        self.addr
    }
}

/// A method reached through an address cell that can be retargeted later.
///
/// Calls are compiled against [`IndirectDispatchMethod::indirect_addr`]; the
/// cell starts out holding the core method's address.
pub struct IndirectDispatchMethod {
    core: Arc<dyn Method>,
    target: AtomicUsize,
}

impl IndirectDispatchMethod {
    /// Wraps `core`, initially dispatching to its own address.
    #[must_use]
    pub fn new(core: Arc<dyn Method>) -> Self {
        let target = AtomicUsize::new(core.addr());
        Self { core, target }
    }

    /// The address cell compiled call sites load through.
    #[must_use]
    pub fn indirect_addr(&self) -> &AtomicUsize {
        &self.target
    }

    /// Points the cell at a new entry address.
    pub fn retarget(&self, addr: usize) {
        self.target.store(addr, Ordering::Release);
    }
}

impl Method for IndirectDispatchMethod {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn params(&self) -> &[Parameter] {
        self.core.params()
    }

    fn return_kind(&self) -> LocalKind {
        self.core.return_kind()
    }

    fn addr(&self) -> usize {
        self.target.load(Ordering::Acquire)
    }
}

/// A module of user methods with an optional parent to fall back to.
#[derive(Default)]
pub struct UserModule {
    parent: Option<Arc<dyn Module>>,
    methods: HashMap<u32, Arc<dyn Method>>,
}

impl UserModule {
    /// Creates a module that delegates unknown tokens to `parent`.
    #[must_use]
    pub fn new(parent: Option<Arc<dyn Module>>) -> Self {
        Self {
            parent,
            methods: HashMap::new(),
        }
    }

    /// Registers `method` under `token`, replacing any previous registration.
    pub fn register(&mut self, token: u32, method: Arc<dyn Method>) {
        self.methods.insert(token, method);
    }
}

impl Module for UserModule {
    fn resolve_method(&self, token: u32) -> Option<Arc<dyn Method>> {
        match self.methods.get(&token) {
            Some(method) => Some(Arc::clone(method)),
            None => self
                .parent
                .as_ref()
                .and_then(|parent| parent.resolve_method(token)),
        }
    }

    fn resolve_method_token(&self, addr: usize) -> Option<u32> {
        self.methods
            .iter()
            .find(|(_, method)| method.addr() == addr)
            .map(|(&token, _)| token)
            .or_else(|| {
                self.parent
                    .as_ref()
                    .and_then(|parent| parent.resolve_method_token(addr))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels() -> Result<()> {
        let mut backend = SymbolicBackend::new();
        let a = backend.define_label();
        let b = backend.define_label();
        assert_ne!(a, b);
        assert_eq!(backend.label_count(), 2);

        backend.mark_label(b)?;
        backend.mark_label(a)?;
        assert_eq!(backend.label_position(b), Some(0));
        assert_eq!(backend.label_position(a), Some(1));
        assert_eq!(backend.mark_label(a), Err(Error::LabelAlreadyMarked(a.0)));
        assert!(backend.mark_label(Label(99)).is_err());
        Ok(())
    }

    #[test]
    fn test_locals_reuse_by_kind() -> Result<()> {
        let mut backend = SymbolicBackend::new();
        let obj = backend.define_local(LocalKind::Object);
        let float = backend.define_local(LocalKind::Float);
        backend.free_local(obj)?;
        assert_eq!(backend.live_locals(), 1);

        let other = backend.define_local(LocalKind::Float);
        assert_ne!(other.index, obj.index);

        let reused = backend.define_local(LocalKind::Object);
        assert_eq!(reused.index, obj.index);
        assert_eq!(backend.local_count(), 3);
        assert_ne!(float.index, reused.index);
        Ok(())
    }

    #[test]
    fn test_double_free_detected() {
        let mut backend = SymbolicBackend::new();
        let local = backend.define_local(LocalKind::Object);
        assert!(backend.free_local(local).is_ok());
        let err = backend.free_local(local).unwrap_err();
        assert_eq!(err, Error::LocalDoubleFree(local.index));
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn test_module_parent_fallback() {
        let base: Arc<dyn Method> = Arc::new(UserMethod::new(
            "len",
            vec![Parameter {
                kind: LocalKind::Object,
            }],
            LocalKind::Int,
            0x1000,
        ));
        let mut parent = UserModule::new(None);
        parent.register(1, Arc::clone(&base));
        let parent: Arc<dyn Module> = Arc::new(parent);

        let mut child = UserModule::new(Some(parent));
        child.register(
            2,
            Arc::new(UserMethod::new("abs", vec![], LocalKind::Float, 0x2000)),
        );

        assert_eq!(child.resolve_method(2).map(|m| m.addr()), Some(0x2000));
        assert_eq!(child.resolve_method(1).map(|m| m.addr()), Some(0x1000));
        assert!(child.resolve_method(3).is_none());
        assert_eq!(child.resolve_method_token(0x1000), Some(1));
        assert_eq!(child.resolve_method_token(0x2000), Some(2));
        assert_eq!(child.resolve_method_token(0x3000), None);
    }

    #[test]
    fn test_indirect_dispatch() {
        let core: Arc<dyn Method> = Arc::new(UserMethod::new(
            "f",
            vec![Parameter {
                kind: LocalKind::Float,
            }],
            LocalKind::Object,
            0x10,
        ));
        let indirect = IndirectDispatchMethod::new(core);
        assert_eq!(indirect.addr(), 0x10);
        assert_eq!(indirect.param_count(), 1);
        assert_eq!(indirect.name(), "f");

        indirect.retarget(0x20);
        assert_eq!(indirect.addr(), 0x20);
        assert_eq!(indirect.indirect_addr().load(Ordering::Relaxed), 0x20);
    }
}
