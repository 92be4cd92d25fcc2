//! # Execution-Context Transfer
//!
//! A [`MachineContext`] is the saved stack pointer of a suspended coroutine.
//! Everything else a switch needs to hand over travels in a [`Transaction`]
//! that lives on the sending side's stack and is passed by pointer through
//! the transfer itself. The receiving side takes it out before doing
//! anything else, so nothing about an in-flight switch is global.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::{self, EntryFn};
use crate::greenlet::{Greenlet, Run};
use crate::stack::Stack;
use crate::switch::Payload;

/// Saved machine state of a suspended coroutine.
#[derive(Debug, Default)]
pub(crate) struct MachineContext {
    sp: AtomicUsize,
}

impl MachineContext {
    pub(crate) const fn new() -> Self {
        Self { sp: AtomicUsize::new(0) }
    }

    /// Slot the outgoing side writes its stack pointer into.
    pub(crate) fn slot(&self) -> *mut usize {
        self.sp.as_ptr()
    }

    /// Move the saved stack pointer out, leaving this context empty.
    pub(crate) fn take(&mut self) -> Self {
        Self {
            sp: AtomicUsize::new(std::mem::take(self.sp.get_mut())),
        }
    }

    pub(crate) fn stack_pointer(&self) -> usize {
        self.sp.load(Ordering::Acquire)
    }

    /// Point this context at a fresh frame on `stack` that enters `entry`.
    pub(crate) fn prepare(&self, stack: &Stack, entry: EntryFn) {
        // SAFETY: the top of an unused stack is ours to write.
        let sp = unsafe { arch::init_stack(stack.top(), entry, std::ptr::null_mut()) };
        self.sp.store(sp, Ordering::Release);
    }
}

/// Everything handed from the suspending side to the resuming side.
pub(crate) struct Transaction {
    /// The coroutine that gave up control.
    pub(crate) origin: Option<Greenlet>,
    /// Values or exception being delivered.
    pub(crate) payload: Payload,
    /// Stack of a coroutine that finished during this switch. The receiver
    /// returns it to the pool once the old stack is no longer in use.
    pub(crate) retired: Option<Stack>,
    /// Body to run when the target is being started.
    pub(crate) start: Option<Run>,
}

impl Transaction {
    pub(crate) fn new(payload: Payload, retired: Option<Stack>) -> Self {
        Self {
            origin: None,
            payload,
            retired,
            start: None,
        }
    }
}

/// Pointer type carried through the transfer.
pub(crate) type TransactionSlot = *mut Option<Transaction>;

/// Suspend the running context into `from` and resume `to`, delivering
/// `slot`. Returns the slot delivered by whichever transfer resumes us.
///
/// # Safety
///
/// `from` must stay valid until the transfer has written it, `to` must be a
/// stack pointer saved by a previous transfer or produced by
/// [`MachineContext::prepare`], and `slot` must stay valid until the
/// receiver has taken the transaction out.
pub(crate) unsafe fn transfer(from: *mut usize, to: usize, slot: TransactionSlot) -> TransactionSlot {
    // SAFETY: upheld by the caller.
    unsafe { arch::transfer(from, to, slot.cast()).cast() }
}

/// Take the transaction delivered to the resumed side.
///
/// # Safety
///
/// `slot` must come from [`transfer`] or the trampoline's entry argument.
pub(crate) unsafe fn receive(slot: TransactionSlot) -> Option<Transaction> {
    if slot.is_null() {
        return None;
    }
    // SAFETY: the sender keeps the slot alive until we resume it again.
    unsafe { (*slot).take() }
}
