//! Runtime Configuration
//!
//! Stack sizing, stack caching and logging can be set programmatically or
//! loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `GREENSTACK_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `GREENSTACK_STACK_SIZE` | Default coroutine stack size in bytes | 2097152 (2MB) |
//! | `GREENSTACK_STACK_CACHE` | Stacks kept per thread for reuse (0 = no caching) | 1024 |
//! | `GREENSTACK_GUARD_PAGES` | Inaccessible pages below each stack | 1 |
//! | `GREENSTACK_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//! | `GREENSTACK_LOG_FORMAT` | Log format (plain/json) | plain |
//!
//! Invalid values are ignored and the default is kept.
//!
//! # Example
//!
//! ```rust,ignore
//! use greenstack_runtime::config::RuntimeConfig;
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = RuntimeConfig::builder()
//!     .stack_size(256 * 1024)
//!     .cache_capacity(64)
//!     .build()?;
//! ```

use std::env;
use std::fmt;

use crate::log::{LogFormat, LogLevel};

/// Smallest stack a coroutine may be given.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Default coroutine stack size: 256k machine words.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024 * std::mem::size_of::<usize>();

/// Default number of stacks each thread keeps for reuse.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Stack allocation and caching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackConfig {
    /// Stack size for coroutines that do not request one.
    /// Default: 2MB on 64-bit targets.
    pub stack_size: usize,

    /// Maximum number of released stacks each thread caches.
    /// Default: 1024. Zero disables caching.
    pub cache_capacity: usize,

    /// Number of inaccessible guard pages mapped below each stack.
    /// Default: 1.
    pub guard_pages: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            guard_pages: 1,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogConfig {
    /// Minimum level that is emitted.
    pub level: LogLevel,
    /// Output format.
    pub format: LogFormat,
}

/// Complete runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuntimeConfig {
    /// Stack settings.
    pub stack: StackConfig,
    /// Logging settings.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Create a new configuration builder.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Unset or unparsable variables fall back to the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(size) = parse_env_usize("GREENSTACK_STACK_SIZE") {
            config.stack.stack_size = size;
        }
        if let Some(capacity) = parse_env_usize("GREENSTACK_STACK_CACHE") {
            config.stack.cache_capacity = capacity;
        }
        if let Some(pages) = parse_env_usize("GREENSTACK_GUARD_PAGES") {
            config.stack.guard_pages = pages;
        }
        if let Some(level) = env::var("GREENSTACK_LOG_LEVEL")
            .ok()
            .and_then(|v| v.parse::<LogLevel>().ok())
        {
            config.log.level = level;
        }
        if let Some(format) = env::var("GREENSTACK_LOG_FORMAT")
            .ok()
            .and_then(|v| v.parse::<LogFormat>().ok())
        {
            config.log.format = format;
        }

        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::StackTooSmall {
                size: self.stack.stack_size,
                min: MIN_STACK_SIZE,
            });
        }
        if self.stack.stack_size > isize::MAX as usize / 2 {
            return Err(ConfigError::StackTooLarge {
                size: self.stack.stack_size,
            });
        }
        Ok(())
    }
}

/// Configuration validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Stack size is below [`MIN_STACK_SIZE`].
    StackTooSmall {
        /// Configured size.
        size: usize,
        /// Minimum accepted size.
        min: usize,
    },
    /// Stack size cannot be mapped.
    StackTooLarge {
        /// Configured size.
        size: usize,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::StackTooSmall { size, min } => {
                write!(f, "stack size {} is smaller than the minimum of {} bytes", size, min)
            }
            ConfigError::StackTooLarge { size } => {
                write!(f, "stack size {} is too large", size)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default coroutine stack size.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack.stack_size = size;
        self
    }

    /// Set the per-thread stack cache capacity.
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.config.stack.cache_capacity = capacity;
        self
    }

    /// Set the number of guard pages per stack.
    pub fn guard_pages(mut self, pages: usize) -> Self {
        self.config.stack.guard_pages = pages;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Set the log format.
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.config.log.format = format;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build without validation.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok()?.trim().parse().ok()
}

/// Stack settings currently in force: the installed configuration, or the
/// defaults when the runtime was never initialised.
pub fn stack_config() -> StackConfig {
    crate::runtime_config()
        .map(|c| c.stack.clone())
        .unwrap_or_default()
}
