//! Error Types
//!
//! Two layers of failure exist in the runtime:
//!
//! - [`GreenletError`] / [`StackError`]: protocol and resource errors raised by
//!   the runtime itself (wrong thread, cyclic parent, out of stack memory).
//! - [`Exception`]: what travels across a switch. A coroutine that fails,
//!   a value thrown with [`Greenlet::throw`](crate::Greenlet::throw), the exit
//!   signal, and protocol errors that must be delivered to another coroutine
//!   are all carried as an `Exception`.

use std::any::Any;
use std::fmt;

use nix::errno::Errno;
use thiserror::Error;

use crate::value::{Value, Values};

/// Failure to obtain or map a coroutine stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StackError {
    /// The kernel refused the mapping.
    #[error("cannot allocate a {size} byte coroutine stack: {errno}")]
    OutOfMemory {
        /// Requested mapping length, guard pages included.
        size: usize,
        /// Error reported by `mmap`/`mprotect`.
        #[source]
        errno: Errno,
    },
    /// The requested size cannot be mapped.
    #[error("invalid coroutine stack size {size}")]
    InvalidSize {
        /// The rejected size.
        size: usize,
    },
}

/// Errors raised by the switch protocol and by parent/run assignment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GreenletError {
    /// The target belongs to another thread.
    #[error("cannot switch to a different thread")]
    WrongThread,
    /// The target's thread has exited and its root is gone.
    #[error("cannot switch to a garbage collected greenlet")]
    GarbageCollected,
    /// Assigning this parent would make the chain loop.
    #[error("cyclic parent chain")]
    CyclicParent,
    /// The proposed parent chain ends at a thread that has exited.
    #[error("parent must not be garbage collected")]
    ParentGarbageCollected,
    /// The proposed parent is bound to another thread.
    #[error("parent cannot be on a different thread")]
    ParentOnDifferentThread,
    /// `run` cannot change once the coroutine has started.
    #[error("run cannot be set after the start of the greenlet")]
    AlreadyStarted,
    /// The coroutine was switched to but has nothing to run.
    #[error("greenlet has no run callable")]
    MissingRun,
    /// Thread-local runtime state has already been destroyed.
    #[error("thread is exiting; greenlet state is gone")]
    ThreadExiting,
    /// A stack could not be obtained for a coroutine start.
    #[error(transparent)]
    Stack(#[from] StackError),
}

/// A condition delivered across a switch instead of values.
#[derive(Error)]
pub enum Exception {
    /// The exit signal. A coroutine body that lets it escape finishes
    /// normally, returning the carried value (if any) to its parent.
    #[error("greenlet exit")]
    Exit(Option<Value>),
    /// A runtime protocol error.
    #[error(transparent)]
    Greenlet(#[from] GreenletError),
    /// An application-defined condition.
    #[error("exception {0:?}")]
    User(Value),
    /// A panic that escaped a coroutine body.
    #[error("greenlet panicked: {}", panic_message(.0))]
    Panic(Box<dyn Any + Send>),
}

impl Exception {
    /// The bare exit signal.
    pub fn exit() -> Self {
        Exception::Exit(None)
    }

    /// The exit signal carrying a value for the parent.
    pub fn exit_with<T: Any>(value: T) -> Self {
        Exception::Exit(Some(Value::new(value)))
    }

    /// Wrap an application value as an exception.
    pub fn user<T: Any>(value: T) -> Self {
        Exception::User(Value::new(value))
    }

    /// Whether this is the exit signal.
    pub fn is_exit(&self) -> bool {
        matches!(self, Exception::Exit(_))
    }

    /// The protocol error, if this is one.
    pub fn greenlet_error(&self) -> Option<&GreenletError> {
        match self {
            Exception::Greenlet(err) => Some(err),
            _ => None,
        }
    }

    /// Borrow the payload of a [`Exception::User`] as `T`.
    pub fn user_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Exception::User(value) => value.downcast_ref(),
            _ => None,
        }
    }

    /// Whether this is a [`Exception::User`] carrying a `T`.
    pub fn is_user<T: Any>(&self) -> bool {
        self.user_ref::<T>().is_some()
    }

    /// Turn the exit signal into the values a finished coroutine returns.
    ///
    /// Every other exception is handed back unchanged.
    pub fn into_exit_values(self) -> Result<Values, Exception> {
        match self {
            Exception::Exit(Some(value)) => Ok(Values::One(value)),
            Exception::Exit(None) => Ok(Values::Empty),
            other => Err(other),
        }
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exception::Exit(value) => f.debug_tuple("Exit").field(value).finish(),
            Exception::Greenlet(err) => f.debug_tuple("Greenlet").field(err).finish(),
            Exception::User(value) => f.debug_tuple("User").field(value).finish(),
            Exception::Panic(payload) => f.debug_tuple("Panic").field(&panic_message(payload)).finish(),
        }
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}
