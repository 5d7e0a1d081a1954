//! Logging Infrastructure
//!
//! Structured logging for the rcbox runtime. Refcount operations emit
//! `Trace` entries describing each transition of an object's retain count;
//! fatal errors emit an `Error` entry right before the process terminates.
//!
//! # Features
//!
//! - **Log Levels**: Trace, Debug, Info, Warn, Error
//! - **Structured Logging**: Key-value pairs for machine-readable output
//! - **Output Formats**: Plain text and JSON
//! - **Sinks**: stderr, stdout, or an in-memory capture buffer
//!
//! # Example
//!
//! ```rust,ignore
//! use rcbox_runtime::log::{LogBuilder, LogLevel};
//!
//! LogBuilder::new(LogLevel::Trace)
//!     .target("rcbox::refcount")
//!     .message("retaining object")
//!     .field_addr("address", 0x7f00_0000_1008)
//!     .field_int("retain_count", 2)
//!     .emit();
//! ```

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum LogLevel {
    /// Trace level (every refcount transition).
    Trace = 0,
    /// Debug level.
    Debug = 1,
    /// Info level.
    Info = 2,
    /// Warning level (default).
    #[default]
    Warn = 3,
    /// Error level.
    Error = 4,
    /// Off (no logging).
    Off = 5,
}

impl LogLevel {
    /// Get the level name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Off => "OFF",
        }
    }

    /// Get the level from a u8.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(LogLevel::Trace),
            1 => Some(LogLevel::Debug),
            2 => Some(LogLevel::Info),
            3 => Some(LogLevel::Warn),
            4 => Some(LogLevel::Error),
            5 => Some(LogLevel::Off),
            _ => None,
        }
    }

    /// Parse a log level from a string.
    ///
    /// Accepts names in any case and the numeric shorthands used by
    /// `RCBOX_LOG_LEVEL` (`0` = off through `5` = trace).
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Whether an entry at `self` passes a filter set to `min`.
    pub fn passes(self, min: LogLevel) -> bool {
        self != LogLevel::Off && min != LogLevel::Off && self >= min
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output format for log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum LogFormat {
    /// Plain text format (human readable).
    #[default]
    Plain = 0,
    /// JSON format (machine readable).
    Json = 1,
}

impl LogFormat {
    /// Parse a format from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "plain" | "text" => Some(LogFormat::Plain),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }

    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Plain => "plain",
            LogFormat::Json => "json",
        }
    }
}

/// Where formatted entries are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogSink {
    /// Standard error (default).
    #[default]
    Stderr,
    /// Standard output.
    Stdout,
    /// In-memory buffer, drained with [`take_captured`].
    Capture,
}

/// A key-value field in a structured log entry.
#[derive(Debug, Clone)]
pub struct LogField {
    /// Field key.
    pub key: &'static str,
    /// Field value.
    pub value: LogValue,
}

/// A value in a structured log entry.
#[derive(Debug, Clone, PartialEq)]
pub enum LogValue {
    /// String value.
    String(String),
    /// Integer value.
    Int(i64),
    /// Unsigned integer value.
    UInt(u64),
    /// Memory address, rendered in hex.
    Address(usize),
    /// Boolean value.
    Bool(bool),
}

impl fmt::Display for LogValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogValue::String(s) => f.write_str(s),
            LogValue::Int(i) => write!(f, "{i}"),
            LogValue::UInt(u) => write!(f, "{u}"),
            LogValue::Address(a) => write!(f, "{a:#x}"),
            LogValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl LogValue {
    /// Format as JSON value.
    fn to_json(&self) -> String {
        match self {
            LogValue::String(s) => format!("\"{}\"", escape_json(s)),
            LogValue::Address(a) => format!("\"{a:#x}\""),
            other => other.to_string(),
        }
    }
}

/// A log entry.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level.
    pub level: LogLevel,
    /// Log message.
    pub message: String,
    /// Structured fields.
    pub fields: Vec<LogField>,
    /// Timestamp (Unix milliseconds).
    pub timestamp: u64,
    /// Module/target name.
    pub target: Option<&'static str>,
}

impl LogEntry {
    /// Create a new log entry.
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            level,
            message: message.into(),
            fields: Vec::new(),
            timestamp,
            target: None,
        }
    }

    /// Add a field.
    pub fn with_field(mut self, key: &'static str, value: LogValue) -> Self {
        self.fields.push(LogField { key, value });
        self
    }

    /// Look up a field value by key.
    pub fn field(&self, key: &str) -> Option<&LogValue> {
        self.fields.iter().find(|f| f.key == key).map(|f| &f.value)
    }

    /// Format as plain text.
    pub fn format_plain(&self) -> String {
        let mut output = format!(
            "[{}.{:03}] {:<5} ",
            self.timestamp / 1000,
            self.timestamp % 1000,
            self.level.as_str()
        );

        if let Some(target) = self.target {
            output.push_str(&format!("[{target}] "));
        }

        output.push_str(&self.message);

        if !self.fields.is_empty() {
            let fields: Vec<String> = self
                .fields
                .iter()
                .map(|field| format!("{}={}", field.key, field.value))
                .collect();
            output.push_str(&format!(" {{{}}}", fields.join(", ")));
        }

        output
    }

    /// Format as JSON.
    pub fn format_json(&self) -> String {
        let mut output = format!(
            "{{\"timestamp\":{},\"level\":\"{}\"",
            self.timestamp,
            self.level.as_str()
        );

        if let Some(target) = self.target {
            output.push_str(&format!(",\"target\":\"{}\"", escape_json(target)));
        }

        output.push_str(&format!(",\"message\":\"{}\"", escape_json(&self.message)));

        if !self.fields.is_empty() {
            let fields: Vec<String> = self
                .fields
                .iter()
                .map(|field| format!("\"{}\":{}", escape_json(field.key), field.value.to_json()))
                .collect();
            output.push_str(&format!(",\"fields\":{{{}}}", fields.join(",")));
        }

        output.push('}');
        output
    }

    /// Format according to the given format.
    pub fn format(&self, format: LogFormat) -> String {
        match format {
            LogFormat::Plain => self.format_plain(),
            LogFormat::Json => self.format_json(),
        }
    }
}

/// Escape a string for JSON output.
fn escape_json(s: &str) -> String {
    let mut output = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => output.push_str("\\\""),
            '\\' => output.push_str("\\\\"),
            '\n' => output.push_str("\\n"),
            '\r' => output.push_str("\\r"),
            '\t' => output.push_str("\\t"),
            c if c.is_control() => output.push_str(&format!("\\u{:04x}", c as u32)),
            c => output.push(c),
        }
    }
    output
}

/// Minimum log level (atomic for fast checking on the refcount hot path).
static MIN_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);

/// Logger output settings.
struct LoggerState {
    format: LogFormat,
    sink: LogSink,
    captured: Vec<String>,
}

static LOGGER: Mutex<LoggerState> = parking_lot::const_mutex(LoggerState {
    format: LogFormat::Plain,
    sink: LogSink::Stderr,
    captured: Vec::new(),
});

/// Set the minimum log level.
pub fn set_level(level: LogLevel) {
    MIN_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Get the current minimum log level.
pub fn level() -> LogLevel {
    LogLevel::from_u8(MIN_LEVEL.load(Ordering::Relaxed)).unwrap_or_default()
}

/// Set the output format.
pub fn set_format(format: LogFormat) {
    LOGGER.lock().format = format;
}

/// Get the current output format.
pub fn format() -> LogFormat {
    LOGGER.lock().format
}

/// Redirect output to `sink`.
pub fn set_sink(sink: LogSink) {
    LOGGER.lock().sink = sink;
}

/// Drain every line written to the capture sink so far.
pub fn take_captured() -> Vec<String> {
    std::mem::take(&mut LOGGER.lock().captured)
}

/// Check if a log level would be logged.
#[inline]
pub fn would_log(level: LogLevel) -> bool {
    level.passes(self::level())
}

/// Emit a log entry.
pub fn emit(entry: &LogEntry) {
    if !would_log(entry.level) {
        return;
    }

    let mut logger = LOGGER.lock();
    let line = entry.format(logger.format);
    match logger.sink {
        LogSink::Stderr => {
            let _ = writeln!(std::io::stderr(), "{line}");
        }
        LogSink::Stdout => {
            let _ = writeln!(std::io::stdout(), "{line}");
        }
        LogSink::Capture => logger.captured.push(line),
    }
}

/// Builder for log entries.
#[derive(Debug)]
pub struct LogBuilder {
    entry: LogEntry,
}

impl LogBuilder {
    /// Create a new log builder.
    pub fn new(level: LogLevel) -> Self {
        Self {
            entry: LogEntry::new(level, ""),
        }
    }

    /// Set the message.
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.entry.message = msg.into();
        self
    }

    /// Set the target.
    pub fn target(mut self, target: &'static str) -> Self {
        self.entry.target = Some(target);
        self
    }

    /// Add a string field.
    pub fn field_str(self, key: &'static str, value: impl Into<String>) -> Self {
        self.field(key, LogValue::String(value.into()))
    }

    /// Add an integer field.
    pub fn field_int(self, key: &'static str, value: i64) -> Self {
        self.field(key, LogValue::Int(value))
    }

    /// Add an unsigned integer field.
    pub fn field_uint(self, key: &'static str, value: u64) -> Self {
        self.field(key, LogValue::UInt(value))
    }

    /// Add an address field.
    pub fn field_addr(self, key: &'static str, address: usize) -> Self {
        self.field(key, LogValue::Address(address))
    }

    /// Add a boolean field.
    pub fn field_bool(self, key: &'static str, value: bool) -> Self {
        self.field(key, LogValue::Bool(value))
    }

    fn field(mut self, key: &'static str, value: LogValue) -> Self {
        self.entry.fields.push(LogField { key, value });
        self
    }

    /// Finish building without emitting.
    pub fn build(self) -> LogEntry {
        self.entry
    }

    /// Emit the log entry.
    pub fn emit(self) {
        emit(&self.entry);
    }
}

/// Log a message at the given level.
pub fn log(level: LogLevel, message: impl Into<String>) {
    if !would_log(level) {
        return;
    }
    emit(&LogEntry::new(level, message));
}

/// Log a debug message.
pub fn debug(message: impl Into<String>) {
    log(LogLevel::Debug, message);
}

/// Log an info message.
pub fn info(message: impl Into<String>) {
    log(LogLevel::Info, message);
}

/// Log a warning message.
pub fn warn(message: impl Into<String>) {
    log(LogLevel::Warn, message);
}

/// Log an error message.
pub fn error(message: impl Into<String>) {
    log(LogLevel::Error, message);
}
