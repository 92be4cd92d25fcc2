//! # Greenlets
//!
//! A [`Greenlet`] is a handle to a stackful coroutine. Handles are cheap to
//! clone and may be sent between threads, but a greenlet only ever runs on
//! the thread it is bound to: the thread of its nearest started ancestor
//! until it starts, and the thread it started on afterwards.
//!
//! ## States
//!
//! State is derived rather than stored:
//!
//! | state     | condition                                       |
//! |-----------|-------------------------------------------------|
//! | started   | a stack size has been recorded                  |
//! | active    | it owns a stack, or it is a thread's root       |
//! | dead      | started and no longer active                    |
//! | root      | created implicitly for a thread                 |
//!
//! ## Example
//!
//! ```rust,ignore
//! use greenstack_runtime::{args, current, Greenlet, Values};
//!
//! let g = Greenlet::new(|values| {
//!     let n: i32 = values.into_one().unwrap_or(0);
//!     let back = current().parent().unwrap().switch(args![n + 1])?;
//!     Ok(back)
//! });
//! let first = g.switch(args![1])?;       // 2
//! let last = g.switch(args!["done"])?;   // "done"
//! assert!(g.is_dead());
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use parking_lot::Mutex;

use crate::attrs::Attributes;
use crate::context::MachineContext;
use crate::error::{Exception, GreenletError};
use crate::host::HostSnapshot;
use crate::registry::{self, ThreadToken};
use crate::stack::Stack;
use crate::switch;
use crate::value::{Args, Values};

/// A greenlet body: receives the values of the switch that started it and
/// returns what its parent receives when it finishes.
pub type Run = Box<dyn FnOnce(Values) -> Result<Values, Exception> + Send + 'static>;

/// Unique identifier for a greenlet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GreenletId(u64);

impl GreenletId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for GreenletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Greenlet({})", self.0)
    }
}

// ============================================================================
// SHARED STATE
// ============================================================================

pub(crate) enum StackSlot {
    /// Not started, or finished.
    Empty,
    /// A thread's root, running on the thread's own stack.
    Root,
    /// Started and not yet finished.
    Owned(Stack),
}

pub(crate) struct State {
    pub(crate) stack: StackSlot,
    /// Zero until started. Roots record `usize::MAX`.
    pub(crate) stack_size: usize,
    pub(crate) parent: Option<Greenlet>,
    pub(crate) run: Option<Run>,
    pub(crate) affinity: Option<ThreadToken>,
    pub(crate) saved_host: Option<HostSnapshot>,
}

impl State {
    fn vacant() -> Self {
        Self {
            stack: StackSlot::Empty,
            stack_size: 0,
            parent: None,
            run: None,
            affinity: None,
            saved_host: None,
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.stack_size != 0
    }

    pub(crate) fn is_active(&self) -> bool {
        !matches!(self.stack, StackSlot::Empty)
    }

    fn describe(&self) -> &'static str {
        match (self.is_started(), self.is_active()) {
            (false, _) => "unstarted",
            (true, true) => "active",
            (true, false) => "dead",
        }
    }
}

pub(crate) struct Inner {
    pub(crate) id: GreenletId,
    root: bool,
    name: Option<String>,
    stack_request: Option<usize>,
    pub(crate) context: MachineContext,
    pub(crate) state: Mutex<State>,
    attrs: Mutex<Attributes>,
}

impl Inner {
    fn new(root: bool, name: Option<String>, stack_request: Option<usize>, state: State) -> Self {
        Self {
            id: GreenletId::next(),
            root,
            name,
            stack_request,
            context: MachineContext::new(),
            state: Mutex::new(state),
            attrs: Mutex::new(Attributes::new()),
        }
    }

    /// Move a greenlet whose last handle is going away into a fresh
    /// allocation under the same id, leaving `self` inert. The suspended
    /// frames hold no pointer into the old allocation.
    pub(crate) fn relocate(&mut self) -> Inner {
        let state = mem::replace(self.state.get_mut(), State::vacant());
        Inner {
            id: self.id,
            root: self.root,
            name: self.name.take(),
            stack_request: self.stack_request,
            context: self.context.take(),
            state: Mutex::new(state),
            attrs: Mutex::new(mem::take(self.attrs.get_mut())),
        }
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub(crate) fn is_root(&self) -> bool {
        self.root
    }

    pub(crate) fn stack_request(&self) -> Option<usize> {
        self.stack_request
    }
}

// ============================================================================
// HANDLE
// ============================================================================

/// Handle to a stackful coroutine.
///
/// Dropping the last handle to a greenlet that is suspended mid-body kills
/// it: the exit signal is thrown into it on its own thread so that its body
/// can unwind. See [`Greenlet::kill`].
#[derive(Clone)]
pub struct Greenlet {
    pub(crate) inner: Arc<Inner>,
}

impl Greenlet {
    /// Create a greenlet whose parent is the current greenlet.
    ///
    /// # Panics
    ///
    /// Panics if called while the thread's runtime state is being destroyed.
    pub fn new<F>(run: F) -> Greenlet
    where
        F: FnOnce(Values) -> Result<Values, Exception> + Send + 'static,
    {
        Self::with_parts(Some(Box::new(run)), None, None, Some(current()))
    }

    /// Create a greenlet with no body yet; attach one with [`Greenlet::set_run`].
    ///
    /// # Panics
    ///
    /// Panics if called while the thread's runtime state is being destroyed.
    pub fn empty() -> Greenlet {
        Self::with_parts(None, None, None, Some(current()))
    }

    /// Start configuring a greenlet.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// The current greenlet.
    pub fn current() -> Greenlet {
        current()
    }

    fn with_parts(
        run: Option<Run>,
        name: Option<String>,
        stack_request: Option<usize>,
        parent: Option<Greenlet>,
    ) -> Greenlet {
        let state = State {
            parent,
            run,
            ..State::vacant()
        };
        Greenlet {
            inner: Arc::new(Inner::new(false, name, stack_request, state)),
        }
    }

    pub(crate) fn new_root(token: ThreadToken) -> Greenlet {
        let state = State {
            stack: StackSlot::Root,
            stack_size: usize::MAX,
            parent: None,
            run: None,
            affinity: Some(token),
            saved_host: None,
        };
        Greenlet {
            inner: Arc::new(Inner::new(true, Some("root".to_owned()), None, state)),
        }
    }

    /// Switch to this greenlet, delivering `args`.
    ///
    /// Returns what is delivered when control next comes back to the
    /// caller: the arguments of the switch that resumes it, the return value
    /// of a child that finished, or an exception.
    ///
    /// Switching to an unstarted greenlet starts it with `args`. Switching
    /// to a dead greenlet switches to its parent instead.
    pub fn switch(&self, args: Args) -> Result<Values, Exception> {
        switch::switch(self, args.into_values())
    }

    /// Raise `exception` inside this greenlet.
    ///
    /// An unstarted greenlet dies immediately without running its body. The
    /// exit signal thrown at a dead greenlet becomes a plain return to its
    /// nearest live ancestor.
    pub fn throw(&self, exception: Exception) -> Result<Values, Exception> {
        switch::throw(self, exception)
    }

    /// Throw the exit signal into this greenlet.
    pub fn kill(&self) -> Result<Values, Exception> {
        self.throw(Exception::exit())
    }

    /// Unique id.
    pub fn id(&self) -> GreenletId {
        self.inner.id
    }

    /// Name given at creation.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// The greenlet that receives control when this one finishes.
    pub fn parent(&self) -> Option<Greenlet> {
        self.inner.with_state(|s| s.parent.clone())
    }

    /// Change the parent.
    ///
    /// Fails if the new chain would loop back to this greenlet, if the chain
    /// has no active greenlet left to anchor it to a live thread, or if this
    /// greenlet has started and the chain belongs to another thread.
    pub fn set_parent(&self, parent: &Greenlet) -> Result<(), GreenletError> {
        let mut anchor: Option<ThreadToken> = None;
        let mut cursor = Some(parent.clone());
        while let Some(node) = cursor {
            if node == *self {
                return Err(GreenletError::CyclicParent);
            }
            let (active, affinity, next) =
                node.inner.with_state(|s| (s.is_active(), s.affinity.clone(), s.parent.clone()));
            if active {
                anchor = affinity;
            }
            cursor = next;
        }

        let Some(anchor) = anchor else {
            return Err(GreenletError::ParentGarbageCollected);
        };
        let (started, affinity) = self.inner.with_state(|s| (s.is_started(), s.affinity.clone()));
        if started && !affinity.is_some_and(|t| t.ptr_eq(&anchor)) {
            return Err(GreenletError::ParentOnDifferentThread);
        }

        drop(self.replace_parent(Some(parent.clone())));
        Ok(())
    }

    /// Swap the parent without validation, returning the old one so that it
    /// is dropped after the lock is released.
    pub(crate) fn replace_parent(&self, parent: Option<Greenlet>) -> Option<Greenlet> {
        self.inner.with_state(|s| mem::replace(&mut s.parent, parent))
    }

    /// Attach a body. Fails once the greenlet has started.
    pub fn set_run<F>(&self, run: F) -> Result<(), GreenletError>
    where
        F: FnOnce(Values) -> Result<Values, Exception> + Send + 'static,
    {
        let run: Run = Box::new(run);
        let previous = self.inner.with_state(|s| {
            if s.is_started() {
                Err(GreenletError::AlreadyStarted)
            } else {
                Ok(s.run.replace(run))
            }
        })?;
        drop(previous);
        Ok(())
    }

    /// Whether a body is attached and waiting to run.
    pub fn has_run(&self) -> bool {
        self.inner.with_state(|s| s.run.is_some())
    }

    /// Whether the greenlet has been switched to at least once.
    pub fn is_started(&self) -> bool {
        self.inner.with_state(|s| s.is_started())
    }

    /// Whether the greenlet is running or suspended mid-body.
    pub fn is_active(&self) -> bool {
        self.inner.with_state(|s| s.is_active())
    }

    /// Whether the greenlet has finished.
    pub fn is_dead(&self) -> bool {
        self.inner.with_state(|s| s.is_started() && !s.is_active())
    }

    /// Whether this is a thread's implicit root greenlet.
    pub fn is_root(&self) -> bool {
        self.inner.is_root()
    }

    /// Usable bytes of the stack, once started. Roots report `None`.
    pub fn stack_size(&self) -> Option<usize> {
        self.inner
            .with_state(|s| (s.is_started() && !self.inner.is_root()).then_some(s.stack_size))
    }

    /// The thread this greenlet is bound to, once bound.
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.inner.with_state(|s| s.affinity.as_ref().map(ThreadToken::thread_id))
    }

    /// Run `f` with this greenlet's attributes locked.
    ///
    /// `f` must not switch greenlets.
    pub fn with_attrs<R>(&self, f: impl FnOnce(&mut Attributes) -> R) -> R {
        f(&mut self.inner.attrs.lock())
    }

    /// Store an attribute.
    pub fn set_attr<T: std::any::Any + Send>(&self, key: impl Into<String>, value: T) {
        self.with_attrs(|attrs| attrs.insert(key, value));
    }

    /// Clone an attribute out.
    pub fn attr<T: std::any::Any + Send + Clone>(&self, key: &str) -> Option<T> {
        self.with_attrs(|attrs| attrs.get::<T>(key).cloned())
    }

    /// A handle that does not keep the greenlet alive.
    pub fn downgrade(&self) -> WeakGreenlet {
        WeakGreenlet {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether both handles refer to the same greenlet.
    pub fn ptr_eq(&self, other: &Greenlet) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ------------------------------------------------------------------------
    // Runtime internals
    // ------------------------------------------------------------------------

    /// Thread this greenlet will run on: its own binding once started,
    /// otherwise that of its nearest started ancestor.
    pub(crate) fn resolve_affinity(&self) -> Option<ThreadToken> {
        let mut cursor = self.clone();
        loop {
            let (started, affinity, parent) =
                cursor.inner.with_state(|s| (s.is_started(), s.affinity.clone(), s.parent.clone()));
            if started {
                return affinity;
            }
            cursor = parent?;
        }
    }

    /// Bind to the thread of the nearest started ancestor.
    pub(crate) fn bind_to_ancestor(&self, fallback: Option<ThreadToken>) {
        let token = self
            .parent()
            .and_then(|p| p.resolve_affinity())
            .or(fallback);
        let previous = self.inner.with_state(|s| mem::replace(&mut s.affinity, token));
        drop(previous);
    }

    /// Mark finished: give up the stack, keep the recorded size.
    /// Returns the parent and the stack to retire.
    pub(crate) fn retire(&self) -> (Option<Greenlet>, Option<Stack>) {
        let (parent, stack, host) = self.inner.with_state(|s| {
            let stack = match mem::replace(&mut s.stack, StackSlot::Empty) {
                StackSlot::Owned(stack) => Some(stack),
                other => {
                    s.stack = other;
                    None
                }
            };
            (s.parent.clone(), stack, s.saved_host.take())
        });
        drop(host);
        (parent, stack)
    }

    /// Detach a root from its exiting thread.
    pub(crate) fn orphan(&self) {
        let (token, host) = self.inner.with_state(|s| {
            s.stack = StackSlot::Empty;
            (s.affinity.take(), s.saved_host.take())
        });
        drop(token);
        drop(host);
    }

    pub(crate) fn save_host(&self, snapshot: Option<HostSnapshot>) {
        let previous = self.inner.with_state(|s| mem::replace(&mut s.saved_host, snapshot));
        drop(previous);
    }

    pub(crate) fn take_host(&self) -> Option<HostSnapshot> {
        self.inner.with_state(|s| s.saved_host.take())
    }
}

impl PartialEq for Greenlet {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Greenlet {}

impl Hash for Greenlet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state);
    }
}

impl fmt::Debug for Greenlet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.inner.is_root() {
            self.inner.with_state(|s| if s.is_active() { "root" } else { "dead root" })
        } else {
            self.inner.with_state(|s| s.describe())
        };
        let mut d = f.debug_struct("Greenlet");
        d.field("id", &self.inner.id.0);
        if let Some(name) = &self.inner.name {
            d.field("name", name);
        }
        d.field("state", &state).finish()
    }
}

/// Non-owning greenlet handle.
///
/// A greenlet that has to be killed after its last strong handle went away
/// is moved first; weak handles taken before that no longer reach it.
#[derive(Clone, Default)]
pub struct WeakGreenlet {
    inner: Weak<Inner>,
}

impl WeakGreenlet {
    /// A handle to the greenlet if it still exists.
    pub fn upgrade(&self) -> Option<Greenlet> {
        self.inner.upgrade().map(|inner| Greenlet { inner })
    }
}

impl fmt::Debug for WeakGreenlet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakGreenlet")
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Configuration for greenlet creation.
#[derive(Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
    parent: Option<Greenlet>,
    run: Option<Run>,
}

impl Builder {
    /// Create a builder with defaults: no name, the configured stack size,
    /// and the current greenlet as parent.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a name for debugging.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Request a stack of at least `size` bytes.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Set the parent instead of the current greenlet.
    pub fn parent(mut self, parent: &Greenlet) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    /// Set the body.
    pub fn run<F>(mut self, run: F) -> Self
    where
        F: FnOnce(Values) -> Result<Values, Exception> + Send + 'static,
    {
        self.run = Some(Box::new(run));
        self
    }

    /// Create the greenlet, validating an explicit parent.
    pub fn build(self) -> Result<Greenlet, GreenletError> {
        let Builder { name, stack_size, parent, run } = self;
        match parent {
            Some(parent) => {
                let greenlet = Greenlet::with_parts(run, name, stack_size, None);
                greenlet.set_parent(&parent)?;
                Ok(greenlet)
            }
            None => Ok(Greenlet::with_parts(run, name, stack_size, Some(try_current()?))),
        }
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("name", &self.name)
            .field("stack_size", &self.stack_size)
            .field("parent", &self.parent)
            .field("has_run", &self.run.is_some())
            .finish()
    }
}

// ============================================================================
// CURRENT
// ============================================================================

/// The greenlet running on the calling thread, creating the thread's root
/// on first use. Greenlets posted to this thread for teardown are killed
/// before it returns.
///
/// # Panics
///
/// Panics if called while the thread's runtime state is being destroyed;
/// use [`try_current`] where that can happen.
pub fn current() -> Greenlet {
    try_current().expect("greenlet runtime state accessed during thread teardown")
}

/// The greenlet running on the calling thread.
pub fn try_current() -> Result<Greenlet, GreenletError> {
    registry::current()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_handle_is_send_sync() {
        assert_send_sync::<Greenlet>();
        assert_send_sync::<WeakGreenlet>();
    }

    #[test]
    fn test_greenlet_ids_are_unique() {
        let a = Greenlet::empty();
        let b = Greenlet::empty();
        assert_ne!(a.id(), b.id());
        assert!(a.id() < b.id());
        assert_eq!(format!("{}", GreenletId(3)), "Greenlet(3)");
    }

    #[test]
    fn test_new_greenlet_state() {
        let g = Greenlet::new(|_| Ok(Values::Empty));
        assert!(!g.is_started());
        assert!(!g.is_active());
        assert!(!g.is_dead());
        assert!(!g.is_root());
        assert!(g.has_run());
        assert_eq!(g.stack_size(), None);
        assert_eq!(g.thread_id(), None);
        assert_eq!(g.parent(), Some(current()));
    }

    #[test]
    fn test_builder_options() {
        let g = Greenlet::builder()
            .name("worker")
            .stack_size(64 * 1024)
            .run(|_| Ok(Values::Empty))
            .build()
            .unwrap();
        assert_eq!(g.name(), Some("worker"));
        assert!(format!("{:?}", g).contains("worker"));
        assert!(format!("{:?}", g).contains("unstarted"));
    }

    #[test]
    fn test_set_parent_rejects_cycle() {
        let a = Greenlet::empty();
        let b = Greenlet::builder().parent(&a).build().unwrap();
        assert_eq!(a.set_parent(&b), Err(GreenletError::CyclicParent));
        assert_eq!(a.set_parent(&a), Err(GreenletError::CyclicParent));
        assert_eq!(a.parent(), Some(current()));
    }

    #[test]
    fn test_set_run_replaces_body() {
        let g = Greenlet::empty();
        assert!(!g.has_run());
        g.set_run(|_| Ok(Values::one(1_i32))).unwrap();
        g.set_run(|_| Ok(Values::one(2_i32))).unwrap();
        assert_eq!(g.switch(Args::new()).unwrap().into_one::<i32>(), Some(2));
        assert_eq!(g.set_run(|_| Ok(Values::Empty)), Err(GreenletError::AlreadyStarted));
    }

    #[test]
    fn test_attributes() {
        let g = Greenlet::empty();
        g.set_attr("request", 7_u32);
        assert_eq!(g.attr::<u32>("request"), Some(7));
        assert_eq!(g.attr::<String>("request"), None);
        assert_eq!(g.with_attrs(|a| a.len()), 1);
    }

    #[test]
    fn test_weak_handle() {
        let g = Greenlet::empty();
        let weak = g.downgrade();
        assert_eq!(weak.upgrade(), Some(g.clone()));
        drop(g);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_root_debug() {
        let root = current();
        assert!(format!("{:?}", root).contains("root"));
        assert!(root.stack_size().is_none());
    }
}
