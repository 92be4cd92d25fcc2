//! Host Execution Snapshots
//!
//! An embedding runtime often keeps per-thread state that really belongs to
//! whatever is executing: an interpreter's frame pointer, a recursion depth,
//! an exception-in-flight slot. Installing a [`HostContext`] on a thread makes
//! the switch protocol save that state into the suspending coroutine, restore
//! it into the resuming one, and reset it when a coroutine starts fresh.
//!
//! Snapshots are opaque to the runtime.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use crate::registry;

/// Opaque per-coroutine copy of host state.
pub struct HostSnapshot(Box<dyn Any + Send>);

impl HostSnapshot {
    /// Wrap host state.
    pub fn new<T: Any + Send>(state: T) -> Self {
        Self(Box::new(state))
    }

    /// Take the state back out.
    pub fn downcast<T: Any + Send>(self) -> Option<T> {
        self.0.downcast().ok().map(|b| *b)
    }

    /// Borrow the state.
    pub fn downcast_ref<T: Any + Send>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl fmt::Debug for HostSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HostSnapshot(..)")
    }
}

/// Host state hooks run on every switch of the thread they are installed on.
///
/// The hooks must not switch coroutines.
pub trait HostContext {
    /// Capture the state of the coroutine about to be suspended.
    fn snapshot(&self) -> HostSnapshot;

    /// Reinstate the state of the coroutine being resumed.
    fn restore(&self, snapshot: HostSnapshot);

    /// Clear state before a coroutine body starts.
    fn reset(&self);
}

/// Install host hooks for the calling thread, returning the previous ones.
pub fn set_host_context(host: Option<Rc<dyn HostContext>>) -> Option<Rc<dyn HostContext>> {
    registry::replace_host(host)
}

/// The host hooks installed on the calling thread.
pub fn host_context() -> Option<Rc<dyn HostContext>> {
    registry::host()
}

pub(crate) fn snapshot() -> Option<HostSnapshot> {
    registry::host().map(|h| h.snapshot())
}

pub(crate) fn restore(snapshot: Option<HostSnapshot>) {
    if let (Some(host), Some(snapshot)) = (registry::host(), snapshot) {
        host.restore(snapshot);
    }
}

pub(crate) fn reset() {
    if let Some(host) = registry::host() {
        host.reset();
    }
}
