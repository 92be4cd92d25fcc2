//! Machine-level context transfer.
//!
//! Each backend provides:
//!
//! - `transfer(from, to, arg) -> arg'`: save the callee-saved register set
//!   on the current stack, store the resulting stack pointer in `*from`,
//!   switch to the stack pointer `to`, restore its register set and return
//!   `arg` there. The pointer returned on the resumed side is whatever the
//!   *next* transfer into it passed.
//! - `init_stack(top, entry, data) -> sp`: lay out a frame at the top of a
//!   fresh stack so that the first `transfer` into `sp` calls
//!   `entry(arg, data)`, where `entry` never returns.

#[cfg(all(unix, target_arch = "x86_64"))]
mod x86_64;
#[cfg(all(unix, target_arch = "x86_64"))]
pub(crate) use self::x86_64::{init_stack, transfer};

#[cfg(all(unix, target_arch = "aarch64"))]
mod aarch64;
#[cfg(all(unix, target_arch = "aarch64"))]
pub(crate) use self::aarch64::{init_stack, transfer};

#[cfg(not(all(unix, any(target_arch = "x86_64", target_arch = "aarch64"))))]
compile_error!("greenstack-runtime supports x86_64 and aarch64 on unix targets only");

/// Function started on a fresh stack.
pub(crate) type EntryFn = extern "C" fn(arg: *mut u8, data: *mut u8) -> !;
