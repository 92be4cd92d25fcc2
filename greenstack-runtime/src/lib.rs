//! # Greenstack Runtime
//!
//! Stackful coroutines ("greenlets") with explicit, symmetric switching.
//!
//! - **Greenlets**: each runs on its own stack and hands control to another
//!   greenlet with [`Greenlet::switch`], passing values both ways
//! - **Parent chains**: a finishing greenlet returns to its parent; dead
//!   targets delegate to their parents
//! - **Thread affinity**: a greenlet only runs on the thread it belongs to;
//!   handles can still be shared and dropped anywhere
//! - **Pooled stacks**: guard-paged mappings recycled per thread
//! - **Teardown**: suspended greenlets are killed when their last handle
//!   goes away, on their own thread
//!
//! ## Technical Standards
//!
//! - **Context switch**: hand-written `naked_asm!` for System V x86_64 and
//!   AAPCS64, saving only callee-saved state
//! - **Stacks**: anonymous `mmap` with `PROT_NONE` guard pages via
//!   [nix](https://docs.rs/nix)
//! - **Cross-thread teardown**: per-thread mailboxes per
//!   [crossbeam-channel](https://docs.rs/crossbeam-channel)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      GREENSTACK RUNTIME                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │   Greenlet   │  │    Switch    │  │  Trampoline  │           │
//! │  │ (greenlet.rs)│─▶│ (switch.rs)  │◀─│(trampoline.rs│           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │         │                 │                 │                   │
//! │         ▼                 ▼                 ▼                   │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │   Teardown   │  │   Registry   │  │   Context    │           │
//! │  │(teardown.rs) │─▶│(registry.rs) │  │ (context.rs) │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │                           │                 │                   │
//! │                           ▼                 ▼                   │
//! │                    ┌──────────────┐  ┌──────────────┐           │
//! │                    │  Stack Pool  │  │  arch (asm)  │           │
//! │                    │  (stack.rs)  │  │ x86_64/arm64 │           │
//! │                    └──────────────┘  └──────────────┘           │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use greenstack_runtime::{args, current, Greenlet, Values};
//!
//! let child = Greenlet::new(|values| {
//!     let x: i32 = values.into_one().unwrap_or_default();
//!     Ok(Values::one(x * 2))
//! });
//! let result = child.switch(args![5])?;
//! assert_eq!(result.into_one::<i32>(), Some(10));
//! assert!(child.is_dead());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod arch;
pub mod attrs;
pub mod config;
mod context;
pub mod error;
pub mod greenlet;
pub mod host;
pub mod log;
mod registry;
pub mod stack;
mod switch;
mod teardown;
pub mod trace;
mod trampoline;
pub mod value;

// Re-exports
pub use attrs::Attributes;
pub use config::{ConfigError, RuntimeConfig, RuntimeConfigBuilder, StackConfig};
pub use error::{Exception, GreenletError, StackError};
pub use greenlet::{Builder, Greenlet, GreenletId, Run, WeakGreenlet, current, try_current};
pub use host::{HostContext, HostSnapshot, set_host_context};
pub use stack::{PoolStats, pool_stats};
pub use trace::{TraceEvent, TraceFn, gettrace, settrace};
pub use value::{Args, Keyed, Value, Values};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Global runtime configuration.
static RUNTIME_CONFIG: std::sync::OnceLock<RuntimeConfig> = std::sync::OnceLock::new();

/// Initialize the runtime with default configuration.
///
/// Threads that already touched the runtime keep the settings they started
/// with; everything created afterwards uses the installed configuration.
pub fn init() {
    init_with_runtime_config(RuntimeConfig::default());
}

/// Initialize the runtime with an explicit configuration.
///
/// Only the first call installs a configuration; returns `false` if one was
/// already installed.
///
/// # Example
///
/// ```rust,ignore
/// use greenstack_runtime::{init_with_runtime_config, RuntimeConfig};
///
/// let config = RuntimeConfig::builder()
///     .stack_size(512 * 1024)
///     .cache_capacity(256)
///     .build()?;
///
/// init_with_runtime_config(config);
/// ```
pub fn init_with_runtime_config(config: RuntimeConfig) -> bool {
    let log_config = config.log;
    if RUNTIME_CONFIG.set(config).is_err() {
        return false;
    }
    log::init(log_config);
    true
}

/// Initialize the runtime from environment variables.
///
/// Reads configuration from `GREENSTACK_*` environment variables.
/// See [`RuntimeConfig::from_env`] for the full list of supported variables.
pub fn init_from_env() -> bool {
    init_with_runtime_config(RuntimeConfig::from_env())
}

/// Get the installed runtime configuration.
///
/// Returns `None` if the runtime was never initialized; defaults apply then.
pub fn runtime_config() -> Option<&'static RuntimeConfig> {
    RUNTIME_CONFIG.get()
}
