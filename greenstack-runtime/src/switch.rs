//! # Switch Protocol
//!
//! Every transfer of control goes through [`dispatch`]:
//!
//! 1. Resolve the current greenlet (applying deferred teardowns).
//! 2. Refuse targets bound to another thread or to an exited one.
//! 3. Walk from the target towards the root until something can take
//!    control: an active greenlet is resumed, an unstarted one is started,
//!    a dead one delegates to its parent.
//! 4. Save host state, mark the target current, and transfer.
//! 5. On the way back in, recycle any retired stack, restore host state and
//!    report the switch to the trace hook.
//!
//! Locks are never held across a transfer, a call into user code, or the
//! drop of a greenlet handle.

use crate::context::{self, Transaction, TransactionSlot};
use crate::error::{Exception, GreenletError};
use crate::greenlet::{Greenlet, Run, StackSlot};
use crate::host;
use crate::log::{self, LogBuilder, LogLevel};
use crate::registry;
use crate::stack::Stack;
use crate::trace;
use crate::trampoline;
use crate::value::Values;

/// What a switch delivers: values, or an exception to raise.
pub(crate) type Payload = Result<Values, Exception>;

/// Outcome of [`dispatch`].
pub(crate) enum Dispatch {
    /// Control came back to the caller with this payload.
    Resumed(Payload),
    /// Nothing was transferred. `target` and `retired` are handed back so a
    /// finishing greenlet can try the next ancestor.
    Refused {
        error: Exception,
        target: Greenlet,
        retired: Option<Stack>,
    },
}

impl Dispatch {
    fn into_payload(self) -> Payload {
        match self {
            Dispatch::Resumed(payload) => payload,
            Dispatch::Refused { error, .. } => Err(error),
        }
    }
}

/// Switch from the current greenlet towards `target`.
///
/// `retired` is only set by a finishing greenlet; it is the stack the caller
/// is running on, and it reaches the next greenlet to run inside the
/// transaction.
pub(crate) fn dispatch(target: Greenlet, payload: Payload, retired: Option<Stack>) -> Dispatch {
    let current = if retired.is_some() {
        registry::running().ok_or(GreenletError::ThreadExiting)
    } else {
        registry::current()
    };
    let current = match current.and_then(|current| check_affinity(&target).map(|()| current)) {
        Ok(current) => current,
        Err(err) => {
            return Dispatch::Refused {
                error: err.into(),
                target,
                retired,
            };
        }
    };

    let mut cursor = target.clone();
    loop {
        let (started, active, parent) = cursor
            .inner
            .with_state(|s| (s.is_started(), s.is_active(), s.parent.clone()));

        if active {
            drop((parent, target));
            if cursor == current {
                return Dispatch::Resumed(payload);
            }
            return Dispatch::Resumed(resume(current, cursor, Transaction::new(payload, retired)));
        }

        if !started {
            match begin(&cursor) {
                Ok(run) => {
                    drop((parent, target));
                    let mut txn = Transaction::new(payload, retired);
                    txn.start = Some(run);
                    return Dispatch::Resumed(resume(current, cursor, txn));
                }
                Err(err) => {
                    return Dispatch::Refused {
                        error: err.into(),
                        target,
                        retired,
                    };
                }
            }
        }

        match parent {
            Some(parent) => cursor = parent,
            None if retired.is_some() => {
                return Dispatch::Refused {
                    error: GreenletError::GarbageCollected.into(),
                    target,
                    retired,
                };
            }
            // Nothing left to take control: the caller keeps it.
            None => return Dispatch::Resumed(payload),
        }
    }
}

fn check_affinity(target: &Greenlet) -> Result<(), GreenletError> {
    match target.resolve_affinity() {
        Some(token) if registry::is_this_thread(&token) => Ok(()),
        Some(token) if token.is_alive() => Err(GreenletError::WrongThread),
        _ => Err(GreenletError::GarbageCollected),
    }
}

/// Give an unstarted greenlet a stack and a prepared entry frame. Returns
/// its body, which travels to the trampoline in the transaction.
fn begin(greenlet: &Greenlet) -> Result<Run, GreenletError> {
    let token = registry::this_thread()?;
    let Some(run) = greenlet.inner.with_state(|s| s.run.take()) else {
        return Err(GreenletError::MissingRun);
    };
    let size = greenlet
        .inner
        .stack_request()
        .unwrap_or_else(registry::default_stack_size);
    let stack = match registry::acquire_stack(size) {
        Ok(stack) => stack,
        Err(err) => {
            greenlet.inner.with_state(|s| s.run = Some(run));
            return Err(err);
        }
    };

    greenlet.inner.context.prepare(&stack, trampoline::entry);
    greenlet.inner.with_state(|s| {
        s.stack_size = stack.size();
        s.stack = StackSlot::Owned(stack);
        s.affinity = Some(token);
    });
    Ok(run)
}

/// Suspend `current`, run `target`, and return what resumes `current`.
fn resume(current: Greenlet, target: Greenlet, mut txn: Transaction) -> Payload {
    // A finishing greenlet is never resumed, so it keeps no host state.
    if txn.retired.is_none() {
        current.save_host(host::snapshot());
    }

    let from = current.inner.context.slot();
    let to = target.inner.context.stack_pointer();
    registry::install(target);
    txn.origin = Some(current);

    let mut slot = Some(txn);
    // SAFETY: `from` lives in the origin's context, which the transaction
    // keeps alive until the receiver has taken it; the transfer writes it
    // before leaving this stack. `slot` outlives the receiver's take.
    let received = unsafe { context::transfer(from, to, &mut slot) };
    complete(received)
}

/// Finish a transfer on the resumed side.
fn complete(slot: TransactionSlot) -> Payload {
    // SAFETY: `slot` was passed by the transfer that resumed us.
    let Some(txn) = (unsafe { context::receive(slot) }) else {
        fatal("greenlet resumed without a switch transaction");
    };
    let Transaction {
        origin,
        payload,
        retired,
        start,
    } = txn;
    if let Some(stack) = retired {
        registry::release_stack(stack);
    }
    let Some(me) = registry::running() else {
        fatal("greenlet resumed after thread state was destroyed");
    };
    host::restore(me.take_host());
    let payload = trace::notify(payload, origin.as_ref(), &me);
    drop((me, origin, start));
    payload
}

/// Convert the exit signal into a regular return.
pub(crate) fn handle_exit(payload: Payload) -> Payload {
    match payload {
        Err(exc) => exc.into_exit_values(),
        ok => ok,
    }
}

pub(crate) fn switch(target: &Greenlet, values: Values) -> Payload {
    dispatch(target.clone(), Ok(values), None).into_payload()
}

pub(crate) fn throw(target: &Greenlet, exception: Exception) -> Payload {
    let mut payload = Err(exception);
    if target.is_dead() {
        payload = handle_exit(payload);
    }
    dispatch(target.clone(), payload, None).into_payload()
}

/// Report a broken invariant and abort: there is no frame left to unwind to.
pub(crate) fn fatal(message: &str) -> ! {
    LogBuilder::new(LogLevel::Error)
        .message(message)
        .field("switches", registry::switch_count())
        .emit();
    if !log::would_log(LogLevel::Error) {
        eprintln!("greenstack: {}", message);
    }
    std::process::abort()
}
