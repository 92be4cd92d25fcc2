//! AAPCS64 backend.
//!
//! Saved frame (176 bytes) from the saved stack pointer upwards: d8-d15,
//! x19-x28, x29 (frame pointer), x30 (link register). `x18` is the platform
//! register and is never touched.

use std::arch::naked_asm;

use super::EntryFn;

const FRAME: usize = 176;

#[unsafe(naked)]
pub(crate) unsafe extern "C" fn transfer(from: *mut usize, to: usize, arg: *mut u8) -> *mut u8 {
    naked_asm!(
        "sub sp, sp, #176",
        "stp d8, d9, [sp, #0]",
        "stp d10, d11, [sp, #16]",
        "stp d12, d13, [sp, #32]",
        "stp d14, d15, [sp, #48]",
        "stp x19, x20, [sp, #64]",
        "stp x21, x22, [sp, #80]",
        "stp x23, x24, [sp, #96]",
        "stp x25, x26, [sp, #112]",
        "stp x27, x28, [sp, #128]",
        "stp x29, x30, [sp, #144]",
        "mov x9, sp",
        "str x9, [x0]",
        "mov sp, x1",
        "ldp d8, d9, [sp, #0]",
        "ldp d10, d11, [sp, #16]",
        "ldp d12, d13, [sp, #32]",
        "ldp d14, d15, [sp, #48]",
        "ldp x19, x20, [sp, #64]",
        "ldp x21, x22, [sp, #80]",
        "ldp x23, x24, [sp, #96]",
        "ldp x25, x26, [sp, #112]",
        "ldp x27, x28, [sp, #128]",
        "ldp x29, x30, [sp, #144]",
        "add sp, sp, #176",
        "mov x0, x2",
        "ret",
    )
}

/// First code run on a fresh stack: `x0` holds the transfer argument,
/// `x19` the entry function, `x20` its data.
#[unsafe(naked)]
unsafe extern "C" fn entry_shim() -> ! {
    naked_asm!(
        "mov x1, x20",
        "blr x19",
        "brk #0",
    )
}

/// Build the initial frame below `top` and return the stack pointer to
/// transfer to.
///
/// # Safety
///
/// `top` must be the high end of a writable region of at least `FRAME`
/// bytes that nothing else uses.
pub(crate) unsafe fn init_stack(top: usize, entry: EntryFn, data: *mut u8) -> usize {
    let sp = (top & !15) - FRAME;
    let frame = sp as *mut usize;
    for i in 0..FRAME / 8 {
        // SAFETY: within the reserved frame.
        unsafe { frame.add(i).write(0) };
    }
    // SAFETY: slots 8, 9 and 19 hold x19, x20 and x30.
    unsafe {
        frame.add(8).write(entry as *const () as usize);
        frame.add(9).write(data as usize);
        frame.add(19).write(entry_shim as *const () as usize);
    }
    sp
}
