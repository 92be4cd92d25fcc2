//! Logging Infrastructure
//!
//! Structured engine logging. An entry is a level, a message and a list of
//! `key=value` fields, written to stderr as one line of plain text or JSON.
//!
//! The switch path checks [`would_log`] before building an entry, so a
//! disabled level costs one atomic load.
//!
//! # Example
//!
//! ```rust,ignore
//! use greenstack_runtime::log::{LogBuilder, LogLevel};
//!
//! LogBuilder::new(LogLevel::Debug)
//!     .message("greenlet finished")
//!     .field("greenlet", 7u64)
//!     .field("outcome", "returned")
//!     .emit();
//! ```

use std::fmt::{self, Write as _};
use std::io::Write as _;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::config::LogConfig;
use crate::greenlet::GreenletId;

/// Target recorded on every entry the runtime emits.
pub const TARGET: &str = "greenstack";

/// Severity of an entry, and the threshold below which entries are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum LogLevel {
    /// Per-greenlet lifecycle and pool activity.
    Debug = 1,
    /// Informational.
    #[default]
    Info = 2,
    /// A greenlet or stack had to be leaked.
    Warn = 3,
    /// Emitted right before the process aborts.
    Error = 4,
    /// Nothing is logged.
    Off = 5,
}

impl LogLevel {
    const ALL: [LogLevel; 5] = [
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
        LogLevel::Off,
    ];

    /// Upper-case name used in output.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Off => "OFF",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Debug),
            "warning" => Ok(LogLevel::Warn),
            "none" => Ok(LogLevel::Off),
            _ => Self::ALL
                .into_iter()
                .find(|level| level.as_str().eq_ignore_ascii_case(s))
                .ok_or(()),
        }
    }
}

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// `[secs.millis] LEVEL [greenstack] (thread) message {k=v, ...}`
    #[default]
    Plain,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plain" | "text" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            _ => Err(()),
        }
    }
}

/// A field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    /// Text.
    Str(String),
    /// Unsigned integer: ids, sizes, counters.
    Uint(u64),
    /// Flag.
    Bool(bool),
}

impl From<&str> for Field {
    fn from(s: &str) -> Self {
        Field::Str(s.to_owned())
    }
}

impl From<String> for Field {
    fn from(s: String) -> Self {
        Field::Str(s)
    }
}

impl From<u64> for Field {
    fn from(n: u64) -> Self {
        Field::Uint(n)
    }
}

impl From<usize> for Field {
    fn from(n: usize) -> Self {
        Field::Uint(n as u64)
    }
}

impl From<bool> for Field {
    fn from(b: bool) -> Self {
        Field::Bool(b)
    }
}

impl From<GreenletId> for Field {
    fn from(id: GreenletId) -> Self {
        Field::Uint(id.as_u64())
    }
}

/// One log record.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Severity.
    pub level: LogLevel,
    /// Message.
    pub message: String,
    /// Fields, in insertion order.
    pub fields: Vec<(&'static str, Field)>,
    /// Unix time in milliseconds.
    pub timestamp: u64,
    /// Name of the emitting OS thread.
    pub thread_name: Option<String>,
}

impl LogEntry {
    /// Stamp a new entry with the current time and thread.
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        Self {
            level,
            message: message.into(),
            fields: Vec::new(),
            timestamp,
            thread_name: std::thread::current().name().map(str::to_owned),
        }
    }

    /// Render in `format`.
    pub fn render(&self, format: LogFormat) -> String {
        let mut out = String::with_capacity(96);
        // Writing into a String cannot fail.
        let _ = match format {
            LogFormat::Plain => self.write_plain(&mut out),
            LogFormat::Json => self.write_json(&mut out),
        };
        out
    }

    fn write_plain(&self, out: &mut String) -> fmt::Result {
        write!(
            out,
            "[{}.{:03}] {:<5} [{}] ",
            self.timestamp / 1000,
            self.timestamp % 1000,
            self.level,
            TARGET
        )?;
        if let Some(thread) = &self.thread_name {
            write!(out, "({}) ", thread)?;
        }
        out.push_str(&self.message);
        for (i, (key, value)) in self.fields.iter().enumerate() {
            out.push_str(if i == 0 { " {" } else { ", " });
            match value {
                Field::Str(s) => write!(out, "{}={}", key, s)?,
                Field::Uint(n) => write!(out, "{}={}", key, n)?,
                Field::Bool(b) => write!(out, "{}={}", key, b)?,
            }
        }
        if !self.fields.is_empty() {
            out.push('}');
        }
        Ok(())
    }

    fn write_json(&self, out: &mut String) -> fmt::Result {
        write!(
            out,
            "{{\"timestamp\":{},\"level\":\"{}\",\"target\":\"{}\"",
            self.timestamp, self.level, TARGET
        )?;
        if let Some(thread) = &self.thread_name {
            out.push_str(",\"thread\":");
            json_string(out, thread);
        }
        out.push_str(",\"message\":");
        json_string(out, &self.message);
        if !self.fields.is_empty() {
            out.push_str(",\"fields\":{");
            for (i, (key, value)) in self.fields.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                json_string(out, key);
                out.push(':');
                match value {
                    Field::Str(s) => json_string(out, s),
                    Field::Uint(n) => write!(out, "{}", n)?,
                    Field::Bool(b) => write!(out, "{}", b)?,
                }
            }
            out.push('}');
        }
        out.push('}');
        Ok(())
    }
}

/// Append `s` as a quoted JSON string.
fn json_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

// ============================================================================
// GLOBAL STATE
// ============================================================================

static MIN_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

static FORMAT: Mutex<LogFormat> = Mutex::new(LogFormat::Plain);

/// Apply a logging configuration.
pub fn init(config: LogConfig) {
    set_level(config.level);
    set_format(config.format);
}

/// Set the minimum level.
pub fn set_level(level: LogLevel) {
    MIN_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// The minimum level.
pub fn level() -> LogLevel {
    let raw = MIN_LEVEL.load(Ordering::Relaxed);
    LogLevel::ALL
        .into_iter()
        .find(|level| *level as u8 == raw)
        .unwrap_or(LogLevel::Off)
}

/// Set the output format.
pub fn set_format(format: LogFormat) {
    *FORMAT.lock() = format;
}

/// Whether an entry at `level` would be written.
pub fn would_log(level: LogLevel) -> bool {
    level != LogLevel::Off && level as u8 >= MIN_LEVEL.load(Ordering::Relaxed)
}

/// Write `entry` to stderr if its level is enabled.
pub fn emit(entry: &LogEntry) {
    if !would_log(entry.level) {
        return;
    }
    let line = entry.render(*FORMAT.lock());
    let _ = writeln!(std::io::stderr().lock(), "{}", line);
}

/// Builder for a [`LogEntry`].
#[derive(Debug)]
pub struct LogBuilder {
    entry: LogEntry,
}

impl LogBuilder {
    /// Start an entry at `level`.
    pub fn new(level: LogLevel) -> Self {
        Self {
            entry: LogEntry::new(level, String::new()),
        }
    }

    /// Set the message.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.entry.message = message.into();
        self
    }

    /// Append a field.
    pub fn field(mut self, key: &'static str, value: impl Into<Field>) -> Self {
        self.entry.fields.push((key, value.into()));
        self
    }

    /// Write the entry.
    pub fn emit(self) {
        emit(&self.entry);
    }
}

/// Log a bare message at `level`.
pub fn log(level: LogLevel, message: impl Into<String>) {
    if would_log(level) {
        emit(&LogEntry::new(level, message));
    }
}

/// Log a warning.
pub fn warn(message: impl Into<String>) {
    log(LogLevel::Warn, message);
}
