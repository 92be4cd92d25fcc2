//! # Teardown
//!
//! A greenlet that is suspended mid-body still has live frames on its
//! stack. When the last handle to it goes away those frames must be unwound
//! on the greenlet's own thread, by throwing the exit signal into it.
//!
//! The decision is made once, by whichever thread releases the final
//! handle. The greenlet is moved into a fresh allocation and then:
//!
//! - on the owning thread, killed on the spot. Its parent is pointed at the
//!   current greenlet for the duration, so control comes straight back here
//!   once it has unwound;
//! - on another thread, posted to the owner's mailbox and killed the next
//!   time the owner resolves its current greenlet.
//!
//! If the owner has already exited nothing can run the frames any more and
//! the stack is simply unmapped. A greenlet that catches the exit signal and
//! stays active is leaked, with its stack, rather than freed under live
//! frames.

use std::mem;
use std::sync::Arc;

use crate::greenlet::{Greenlet, Inner, StackSlot, State};
use crate::log::{LogBuilder, LogLevel};
use crate::registry::{self, ThreadToken};

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(owner) = live_owner(self.state.get_mut()) {
            let victim = Greenlet {
                inner: Arc::new(self.relocate()),
            };
            reclaim(&owner, victim);
            return;
        }
        let state = self.state.get_mut();
        state.stack = StackSlot::Empty;
        release_ancestors(state.parent.take());
    }
}

/// The thread that must unwind this greenlet, if it has frames to unwind
/// and that thread is still running.
fn live_owner(state: &State) -> Option<ThreadToken> {
    match state.stack {
        StackSlot::Owned(_) => state.affinity.clone().filter(ThreadToken::is_alive),
        _ => None,
    }
}

/// Drop a parent chain one link at a time.
///
/// A link whose last handle this is has its own parent detached first, so
/// freeing it never recurses into the next one. Links that still need a
/// teardown keep their parent: they are about to run again.
fn release_ancestors(mut next: Option<Greenlet>) {
    while let Some(link) = next.take() {
        let Some(mut inner) = Arc::into_inner(link.inner) else {
            continue;
        };
        let state = inner.state.get_mut();
        if live_owner(state).is_none() {
            next = state.parent.take();
        }
        drop(inner);
    }
}

fn reclaim(owner: &ThreadToken, victim: Greenlet) {
    if registry::is_this_thread(owner) {
        kill(victim);
    } else if let Err(victim) = owner.post(victim) {
        // The owner exited in the meantime; this drop unmaps the stack.
        drop(victim);
    }
}

fn kill(victim: Greenlet) {
    let Ok(current) = registry::current() else {
        LogBuilder::new(LogLevel::Warn)
            .message("cannot kill greenlet while thread state is destroyed; leaking it")
            .field("greenlet", victim.id())
            .emit();
        mem::forget(victim);
        return;
    };

    let previous = victim.replace_parent(Some(current));
    let outcome = victim.kill();
    drop(victim.replace_parent(previous));

    if let Err(exc) = outcome {
        LogBuilder::new(LogLevel::Warn)
            .message("exception escaped while killing greenlet")
            .field("greenlet", victim.id())
            .field("exception", exc.to_string())
            .emit();
    }

    if !victim.is_active() {
        return;
    }
    if Arc::strong_count(&victim.inner) > 1 {
        // A new handle was taken while it unwound; it lives on.
        return;
    }
    LogBuilder::new(LogLevel::Warn)
        .message("greenlet survived the exit signal; leaking it")
        .field("greenlet", victim.id())
        .emit();
    mem::forget(victim);
}
