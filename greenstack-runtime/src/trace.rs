//! Switch Tracing
//!
//! A per-thread hook observing every completed switch. The hook runs on the
//! resumed side, after the switch, with the coroutine that gave up control
//! and the one that received it.
//!
//! A hook that fails is uninstalled, and its exception is delivered to the
//! target in place of whatever the switch carried.

use std::fmt;
use std::rc::Rc;

use crate::error::Exception;
use crate::greenlet::Greenlet;
use crate::registry;
use crate::switch::Payload;

/// Kind of switch reported to the trace hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceEvent {
    /// Values were delivered.
    Switch,
    /// An exception was delivered.
    Throw,
}

impl TraceEvent {
    /// Event name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceEvent::Switch => "switch",
            TraceEvent::Throw => "throw",
        }
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trace hook: `(event, origin, target)`.
pub type TraceFn = Rc<dyn Fn(TraceEvent, &Greenlet, &Greenlet) -> Result<(), Exception>>;

/// Install a trace hook for the calling thread, returning the previous one.
pub fn settrace(hook: Option<TraceFn>) -> Option<TraceFn> {
    registry::replace_trace(hook)
}

/// The trace hook installed on the calling thread.
pub fn gettrace() -> Option<TraceFn> {
    registry::trace()
}

/// Report a completed switch and apply a failing hook's exception.
pub(crate) fn notify(payload: Payload, origin: Option<&Greenlet>, target: &Greenlet) -> Payload {
    let (Some(origin), Some(hook)) = (origin, registry::trace()) else {
        return payload;
    };
    let event = if payload.is_ok() {
        TraceEvent::Switch
    } else {
        TraceEvent::Throw
    };
    match hook(event, origin, target) {
        Ok(()) => payload,
        Err(exc) => {
            registry::replace_trace(None);
            Err(exc)
        }
    }
}
