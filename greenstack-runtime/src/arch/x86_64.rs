//! System V x86_64 backend.
//!
//! Saved frame, from the saved stack pointer upwards:
//!
//! ```text
//! sp+0   mxcsr (u32) | x87 control word (u16)
//! sp+8   r15
//! sp+16  r14
//! sp+24  r13
//! sp+32  r12
//! sp+40  rbx
//! sp+48  rbp
//! sp+56  return address
//! ```

use std::arch::naked_asm;

use super::EntryFn;

/// Bytes reserved below the top of a fresh stack for the initial frame.
/// Leaves `sp + 64` 16-byte aligned when the shim starts.
const INITIAL_FRAME: usize = 80;

/// Default MXCSR (all exceptions masked, round to nearest).
const MXCSR_DEFAULT: usize = 0x1F80;
/// Default x87 control word (extended precision, all exceptions masked).
const FPU_CW_DEFAULT: usize = 0x037F;

#[unsafe(naked)]
pub(crate) unsafe extern "C" fn transfer(from: *mut usize, to: usize, arg: *mut u8) -> *mut u8 {
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "sub rsp, 8",
        "stmxcsr dword ptr [rsp]",
        "fnstcw word ptr [rsp + 4]",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "ldmxcsr dword ptr [rsp]",
        "fldcw word ptr [rsp + 4]",
        "add rsp, 8",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "mov rax, rdx",
        "ret",
    )
}

/// First code run on a fresh stack: `rax` holds the transfer argument,
/// `r13` the entry function, `r12` its data.
#[unsafe(naked)]
unsafe extern "C" fn entry_shim() -> ! {
    naked_asm!(
        "mov rdi, rax",
        "mov rsi, r12",
        "call r13",
        "ud2",
    )
}

/// Build the initial frame below `top` and return the stack pointer to
/// transfer to.
///
/// # Safety
///
/// `top` must be the high end of a writable region of at least
/// `INITIAL_FRAME` bytes that nothing else uses.
pub(crate) unsafe fn init_stack(top: usize, entry: EntryFn, data: *mut u8) -> usize {
    let sp = (top & !15) - INITIAL_FRAME;
    let frame = sp as *mut usize;
    let words = [
        (FPU_CW_DEFAULT << 32) | MXCSR_DEFAULT,
        0,                                // r15
        0,                                // r14
        entry as *const () as usize,      // r13
        data as usize,                    // r12
        0,                                // rbx
        0,                                // rbp
        entry_shim as *const () as usize, // return address
        0,
        0,
    ];
    for (i, word) in words.into_iter().enumerate() {
        // SAFETY: within the reserved frame.
        unsafe { frame.add(i).write(word) };
    }
    sp
}
