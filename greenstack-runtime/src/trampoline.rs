//! # Trampoline
//!
//! The first frame on every greenlet stack. It runs the body, converts the
//! exit signal into a return, marks the greenlet dead, and hands the result
//! to the nearest ancestor that can take it. It never returns: the stack it
//! runs on travels to the next greenlet as a retired stack and is recycled
//! there.

use std::panic::{self, AssertUnwindSafe};

use crate::context::{self, Transaction, TransactionSlot};
use crate::error::{Exception, GreenletError};
use crate::greenlet::Run;
use crate::host;
use crate::log::{self, LogBuilder, LogLevel};
use crate::registry;
use crate::switch::{self, Dispatch, Payload};
use crate::trace;
use crate::value::Values;

/// Entry point of a fresh stack.
pub(crate) extern "C" fn entry(slot: *mut u8, _data: *mut u8) -> ! {
    let outcome = start(slot.cast());
    finish(outcome)
}

fn start(slot: TransactionSlot) -> Payload {
    // SAFETY: the transfer that started us passed its transaction slot.
    let Some(txn) = (unsafe { context::receive(slot) }) else {
        switch::fatal("greenlet started without a switch transaction");
    };
    let Transaction {
        origin,
        payload,
        retired,
        start: body,
    } = txn;
    if let Some(stack) = retired {
        registry::release_stack(stack);
    }
    let Some(me) = registry::running() else {
        switch::fatal("greenlet started after thread state was destroyed");
    };

    me.bind_to_ancestor(registry::this_thread().ok());
    host::reset();
    let payload = trace::notify(payload, origin.as_ref(), &me);
    drop(origin);

    if log::would_log(LogLevel::Debug) {
        LogBuilder::new(LogLevel::Debug)
            .message("greenlet started")
            .field("greenlet", me.id())
            .field("stack_size", me.stack_size().unwrap_or(0))
            .emit();
    }
    drop(me);

    match (payload, body) {
        (Ok(values), Some(body)) => invoke(body, values),
        (Ok(_), None) => Err(GreenletError::MissingRun.into()),
        (Err(exc), body) => {
            drop(body);
            Err(exc)
        }
    }
}

fn invoke(body: Run, values: Values) -> Payload {
    match panic::catch_unwind(AssertUnwindSafe(move || body(values))) {
        Ok(outcome) => outcome,
        Err(panic) => Err(Exception::Panic(panic)),
    }
}

fn finish(outcome: Payload) -> ! {
    let mut payload = switch::handle_exit(outcome);

    let Some(me) = registry::running() else {
        switch::fatal("greenlet finished after thread state was destroyed");
    };
    let (mut next, mut retired) = me.retire();
    if log::would_log(LogLevel::Debug) {
        LogBuilder::new(LogLevel::Debug)
            .message("greenlet finished")
            .field("greenlet", me.id())
            .field("outcome", if payload.is_ok() { "returned" } else { "raised" })
            .emit();
    }
    drop(me);

    // Try each ancestor in turn; the first one that takes control never
    // gives it back to this stack.
    loop {
        let Some(parent) = next.take() else {
            switch::fatal("greenlet finished with no ancestor able to continue");
        };
        match switch::dispatch(parent, payload, retired) {
            Dispatch::Resumed(_) => switch::fatal("dead greenlet was resumed"),
            Dispatch::Refused {
                error,
                target,
                retired: handed_back,
            } => {
                payload = Err(error);
                retired = handed_back;
                next = target.parent();
            }
        }
    }
}
