//! # Coroutine Stacks
//!
//! Each started coroutine runs on its own anonymous mapping with guard pages
//! at the low end. Stacks of finished coroutines go back to a per-thread
//! [`StackPool`] and are handed out again LIFO, so the most recently used
//! (still cache-warm) memory is reused first. When the pool is full the
//! oldest cached stack is unmapped.
//!
//! ```text
//!  low addresses                                         high addresses
//!  ┌─────────────┬─────────────────────────────────────────────────────┐
//!  │ guard pages │  usable stack (grows down from top)                 │
//!  │ PROT_NONE   │  PROT_READ | PROT_WRITE                             │
//!  └─────────────┴─────────────────────────────────────────────────────┘
//!  base                                                               top
//! ```

use std::collections::VecDeque;
use std::ffi::c_void;
use std::fmt;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::OnceLock;

use nix::libc;
use nix::sys::mman::{self, MapFlags, ProtFlags};

use crate::config::{MIN_STACK_SIZE, StackConfig};
use crate::error::StackError;
use crate::log::{self, LogBuilder, LogLevel};

/// System page size, queried once.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    })
}

fn round_to_pages(size: usize) -> Option<usize> {
    let page = page_size();
    size.checked_add(page - 1).map(|s| s & !(page - 1))
}

/// An owned, mapped coroutine stack.
pub struct Stack {
    base: NonNull<c_void>,
    mapped: usize,
    guard: usize,
}

// SAFETY: the mapping is exclusively owned; no thread-bound state is attached
// to it. Stacks only move between threads when their owner has exited and the
// memory is being released.
unsafe impl Send for Stack {}

impl Stack {
    /// Map a new stack with at least `size` usable bytes and `guard_pages`
    /// inaccessible pages below it.
    pub fn new(size: usize, guard_pages: usize) -> Result<Self, StackError> {
        let usable = round_to_pages(size.max(MIN_STACK_SIZE)).ok_or(StackError::InvalidSize { size })?;
        let guard = guard_pages
            .checked_mul(page_size())
            .ok_or(StackError::InvalidSize { size })?;
        let mapped = usable
            .checked_add(guard)
            .and_then(NonZeroUsize::new)
            .ok_or(StackError::InvalidSize { size })?;

        // SAFETY: a fresh private anonymous mapping aliases nothing.
        let base = unsafe {
            mman::mmap_anonymous(
                None,
                mapped,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|errno| StackError::OutOfMemory { size: mapped.get(), errno })?;

        let stack = Stack { base, mapped: mapped.get(), guard };
        if guard > 0 {
            // SAFETY: the guard range lies at the start of our own mapping.
            unsafe { mman::mprotect(base, guard, ProtFlags::PROT_NONE) }
                .map_err(|errno| StackError::OutOfMemory { size: stack.mapped, errno })?;
        }
        Ok(stack)
    }

    /// Highest address of the stack; execution starts just below it.
    pub fn top(&self) -> usize {
        self.base.as_ptr() as usize + self.mapped
    }

    /// Lowest usable address (just above the guard pages).
    pub fn bottom(&self) -> usize {
        self.base.as_ptr() as usize + self.guard
    }

    /// Usable bytes.
    pub fn size(&self) -> usize {
        self.mapped - self.guard
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: we own the mapping and nothing runs on it any more.
        if let Err(errno) = unsafe { mman::munmap(self.base, self.mapped) } {
            log::warn(format!("munmap of coroutine stack failed: {}", errno));
        }
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("bottom", &format_args!("{:#x}", self.bottom()))
            .field("top", &format_args!("{:#x}", self.top()))
            .field("size", &self.size())
            .finish()
    }
}

// ============================================================================
// POOL
// ============================================================================

/// Counters describing a pool's activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Stacks freshly mapped because no cached one fit.
    pub allocated: u64,
    /// Requests satisfied from the cache.
    pub reused: u64,
    /// Stacks unmapped because the cache was full or disabled.
    pub evicted: u64,
    /// Stacks currently cached.
    pub cached: usize,
}

/// Bounded LIFO cache of released stacks for one thread.
pub struct StackPool {
    cache: VecDeque<Stack>,
    capacity: usize,
    guard_pages: usize,
    stats: PoolStats,
}

impl StackPool {
    /// Create a pool that caches up to `capacity` stacks.
    pub fn new(capacity: usize, guard_pages: usize) -> Self {
        Self {
            cache: VecDeque::new(),
            capacity,
            guard_pages,
            stats: PoolStats::default(),
        }
    }

    /// Create a pool from stack configuration.
    pub fn from_config(config: &StackConfig) -> Self {
        Self::new(config.cache_capacity, config.guard_pages)
    }

    /// Get a stack with at least `size` usable bytes.
    ///
    /// The most recently released stack is used if it is large enough;
    /// otherwise a new one is mapped.
    pub fn acquire(&mut self, size: usize) -> Result<Stack, StackError> {
        if self.cache.back().is_some_and(|s| s.size() >= size) {
            if let Some(stack) = self.cache.pop_back() {
                self.stats.reused += 1;
                return Ok(stack);
            }
        }
        let stack = Stack::new(size, self.guard_pages)?;
        self.stats.allocated += 1;
        Ok(stack)
    }

    /// Return a stack for reuse, evicting the oldest cached stack when full.
    pub fn release(&mut self, stack: Stack) {
        if self.capacity == 0 {
            self.stats.evicted += 1;
            return;
        }
        if self.cache.len() >= self.capacity {
            if let Some(oldest) = self.cache.pop_front() {
                self.stats.evicted += 1;
                if log::would_log(LogLevel::Debug) {
                    LogBuilder::new(LogLevel::Debug)
                        .message("evicting cached stack")
                        .field("size", oldest.size())
                        .field("capacity", self.capacity)
                        .emit();
                }
            }
        }
        self.cache.push_back(stack);
    }

    /// Number of cached stacks.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether no stacks are cached.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Activity counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            cached: self.cache.len(),
            ..self.stats
        }
    }
}

/// Counters for the calling thread's stack pool.
pub fn pool_stats() -> PoolStats {
    crate::registry::pool_stats()
}
