//! # Current-Greenlet Registry
//!
//! Each OS thread owns one [`ThreadRecord`]: which greenlet is running, the
//! thread's root greenlet, its stack pool, its deferred-teardown mailbox and
//! its optional host and trace hooks. The record is created lazily the first
//! time the thread touches the runtime and torn down with the thread.
//!
//! A [`ThreadToken`] is the shareable identity of a record. Greenlets store
//! the token of the thread they are bound to; it answers "is this my thread"
//! and "is that thread still alive", and carries the sending half of the
//! thread's mailbox.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

use crossbeam_channel::{Receiver, Sender};

use crate::config::{self, StackConfig};
use crate::error::GreenletError;
use crate::greenlet::Greenlet;
use crate::host::HostContext;
use crate::stack::{PoolStats, Stack, StackPool};
use crate::trace::TraceFn;

// ============================================================================
// THREAD TOKEN
// ============================================================================

struct ThreadShared {
    id: ThreadId,
    alive: AtomicBool,
    mailbox: Sender<Greenlet>,
}

/// Shareable identity of one thread's record.
#[derive(Clone)]
pub(crate) struct ThreadToken(Arc<ThreadShared>);

impl ThreadToken {
    pub(crate) fn thread_id(&self) -> ThreadId {
        self.0.id
    }

    /// False once the owning thread has started tearing its record down.
    pub(crate) fn is_alive(&self) -> bool {
        self.0.alive.load(Ordering::Acquire)
    }

    pub(crate) fn ptr_eq(&self, other: &ThreadToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Hand a greenlet to the owning thread for teardown. Fails, giving the
    /// handle back, when that thread is gone.
    pub(crate) fn post(&self, greenlet: Greenlet) -> Result<(), Greenlet> {
        if !self.is_alive() {
            return Err(greenlet);
        }
        self.0.mailbox.send(greenlet).map_err(|err| err.into_inner())
    }
}

impl fmt::Debug for ThreadToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadToken")
            .field("thread", &self.0.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

// ============================================================================
// THREAD RECORD
// ============================================================================

/// Per-thread runtime state.
pub(crate) struct ThreadRecord {
    token: ThreadToken,
    mailbox: Receiver<Greenlet>,
    root: RefCell<Option<Greenlet>>,
    current: RefCell<Option<Greenlet>>,
    pool: RefCell<StackPool>,
    host: RefCell<Option<Rc<dyn HostContext>>>,
    trace: RefCell<Option<TraceFn>>,
    switches: Cell<u64>,
    stack: StackConfig,
}

thread_local! {
    static RECORD: ThreadRecord = ThreadRecord::new();
}

impl ThreadRecord {
    fn new() -> Self {
        let stack = config::stack_config();
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            token: ThreadToken(Arc::new(ThreadShared {
                id: thread::current().id(),
                alive: AtomicBool::new(true),
                mailbox: tx,
            })),
            mailbox: rx,
            root: RefCell::new(None),
            current: RefCell::new(None),
            pool: RefCell::new(StackPool::from_config(&stack)),
            host: RefCell::new(None),
            trace: RefCell::new(None),
            switches: Cell::new(0),
            stack,
        }
    }

    /// The running greenlet, creating the root on first use.
    fn running(&self) -> Greenlet {
        if let Some(current) = self.current.borrow().as_ref() {
            return current.clone();
        }
        let root = Greenlet::new_root(self.token.clone());
        *self.root.borrow_mut() = Some(root.clone());
        *self.current.borrow_mut() = Some(root.clone());
        root
    }

    /// Tear down greenlets posted by other threads. Each teardown may switch.
    fn drain_mailbox(&self) {
        for greenlet in self.mailbox.try_iter() {
            drop(greenlet);
        }
    }

    /// The running greenlet after pending teardowns have been applied.
    ///
    /// A teardown runs the victim to completion and comes back here, so
    /// the loop repeats until a pass performs no switches.
    fn reconcile(&self) -> Greenlet {
        loop {
            let switches = self.switches.get();
            let running = self.running();
            self.drain_mailbox();
            if self.switches.get() == switches {
                return running;
            }
        }
    }
}

impl Drop for ThreadRecord {
    fn drop(&mut self) {
        self.token.0.alive.store(false, Ordering::Release);

        let current = self.current.get_mut().take();
        let root = self.root.get_mut().take();
        if let Some(root) = &root {
            root.orphan();
        }
        // Nothing posted now can be unwound; dropping frees the stacks.
        for greenlet in self.mailbox.try_iter() {
            drop(greenlet);
        }
        drop(current);
        drop(root);
    }
}

fn with<R>(f: impl FnOnce(&ThreadRecord) -> R) -> Result<R, GreenletError> {
    RECORD.try_with(f).map_err(|_| GreenletError::ThreadExiting)
}

// ============================================================================
// ACCESSORS
// ============================================================================

/// The current greenlet, applying deferred teardowns first.
pub(crate) fn current() -> Result<Greenlet, GreenletError> {
    with(ThreadRecord::reconcile)
}

/// The current greenlet without touching the mailbox.
pub(crate) fn running() -> Option<Greenlet> {
    with(ThreadRecord::running).ok()
}

/// Record `target` as running. Called immediately before a transfer.
pub(crate) fn install(target: Greenlet) {
    let previous = with(|record| {
        record.switches.set(record.switches.get().wrapping_add(1));
        record.current.replace(Some(target))
    });
    drop(previous);
}

/// Token of the calling thread.
pub(crate) fn this_thread() -> Result<ThreadToken, GreenletError> {
    with(|record| record.token.clone())
}

/// Whether `token` names the calling thread.
pub(crate) fn is_this_thread(token: &ThreadToken) -> bool {
    with(|record| record.token.ptr_eq(token)).unwrap_or(false)
}

/// Number of context transfers this thread has performed.
pub(crate) fn switch_count() -> u64 {
    with(|record| record.switches.get()).unwrap_or(0)
}

pub(crate) fn default_stack_size() -> usize {
    with(|record| record.stack.stack_size).unwrap_or(config::DEFAULT_STACK_SIZE)
}

pub(crate) fn acquire_stack(size: usize) -> Result<Stack, GreenletError> {
    Ok(with(|record| record.pool.borrow_mut().acquire(size))??)
}

/// Return a stack to this thread's pool, or unmap it if the pool is gone.
pub(crate) fn release_stack(stack: Stack) {
    let mut stack = Some(stack);
    let _ = with(|record| {
        if let Some(stack) = stack.take() {
            record.pool.borrow_mut().release(stack);
        }
    });
}

pub(crate) fn pool_stats() -> PoolStats {
    with(|record| record.pool.borrow().stats()).unwrap_or_default()
}

pub(crate) fn host() -> Option<Rc<dyn HostContext>> {
    with(|record| record.host.borrow().clone()).ok().flatten()
}

pub(crate) fn replace_host(host: Option<Rc<dyn HostContext>>) -> Option<Rc<dyn HostContext>> {
    with(|record| record.host.replace(host)).ok().flatten()
}

pub(crate) fn trace() -> Option<TraceFn> {
    with(|record| record.trace.borrow().clone()).ok().flatten()
}

pub(crate) fn replace_trace(hook: Option<TraceFn>) -> Option<TraceFn> {
    with(|record| record.trace.replace(hook)).ok().flatten()
}
