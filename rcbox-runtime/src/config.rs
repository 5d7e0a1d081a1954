//! Runtime Configuration
//!
//! Configuration for the rcbox runtime. Settings can be built
//! programmatically or loaded from environment variables, then applied with
//! [`crate::init_with_runtime_config`] or [`crate::init_from_env`].
//!
//! # Environment Variables
//!
//! All environment variables use the `RCBOX_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `RCBOX_MAX_HEAP_SIZE` | Byte limit for the system allocator (0 = unlimited) | 0 |
//! | `RCBOX_FATAL_POLICY` | Fatal error policy (abort/panic) | abort |
//! | `RCBOX_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | warn |
//! | `RCBOX_LOG_FORMAT` | Log output format (plain/json) | plain |
//!
//! Malformed values are reported as warnings and the default is kept.
//!
//! # Example
//!
//! ```rust,ignore
//! use rcbox_runtime::config::RuntimeConfig;
//! use rcbox_runtime::fatal::FatalPolicy;
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = RuntimeConfig::builder()
//!     .max_heap_size(64 * 1024 * 1024) // 64MB
//!     .fatal_policy(FatalPolicy::Panic)
//!     .build()?;
//! ```

use std::env;

use crate::fatal::FatalPolicy;
use crate::log::{self, LogFormat, LogLevel};

/// Smallest non-zero heap limit accepted by [`RuntimeConfig::validate`].
pub const MIN_HEAP_SIZE: usize = 4096;

/// Memory configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Maximum bytes the system allocator hands out.
    /// 0 means unlimited (default).
    pub max_heap_size: usize,
}

/// Fatal error configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FatalConfig {
    /// Built-in reporter used on contract violations.
    /// Default: abort.
    pub policy: FatalPolicy,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogConfig {
    /// Minimum level written.
    /// Default: warn.
    pub level: LogLevel,

    /// Output format.
    /// Default: plain.
    pub format: LogFormat,
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Memory settings.
    pub memory: MemoryConfig,
    /// Fatal error settings.
    pub fatal: FatalConfig,
    /// Logging settings.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are not set use default values. Malformed values are
    /// logged as warnings and the default is used instead. Values that parse
    /// but are out of range are kept, so [`validate`](Self::validate) can
    /// reject them.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("RCBOX_MAX_HEAP_SIZE") {
            config.memory.max_heap_size = val;
        }

        if let Some(policy) = parse_env_with("RCBOX_FATAL_POLICY", FatalPolicy::from_str) {
            config.fatal.policy = policy;
        }

        if let Some(level) = parse_env_with("RCBOX_LOG_LEVEL", LogLevel::from_str) {
            config.log.level = level;
        }

        if let Some(format) = parse_env_with("RCBOX_LOG_FORMAT", LogFormat::from_str) {
            config.log.format = format;
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let heap = self.memory.max_heap_size;
        if heap != 0 && heap < MIN_HEAP_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "memory.max_heap_size".into(),
                message: format!("must be 0 (unlimited) or at least {MIN_HEAP_SIZE} bytes"),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid configuration value.
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
    /// Environment variable parse error.
    EnvParseError {
        /// Variable name.
        var: String,
        /// Error message.
        message: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue { field, message } => {
                write!(f, "invalid configuration for '{}': {}", field, message)
            }
            ConfigError::EnvParseError { var, message } => {
                write!(f, "failed to parse environment variable '{}': {}", var, message)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum heap size in bytes (0 = unlimited).
    pub fn max_heap_size(mut self, size: usize) -> Self {
        self.config.memory.max_heap_size = size;
        self
    }

    /// Set the fatal error policy.
    pub fn fatal_policy(mut self, policy: FatalPolicy) -> Self {
        self.config.fatal.policy = policy;
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

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    ///
    /// Use this only if you're certain the configuration is valid.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

/// Read an environment variable and parse it, warning on malformed input.
fn parse_env_with<T>(name: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
    let raw = env::var(name).ok()?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        let err = ConfigError::EnvParseError {
            var: name.to_string(),
            message: format!("unrecognized value {raw:?}, using default"),
        };
        log::warn(err.to_string());
    }
    parsed
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    parse_env_with(name, |s| s.trim().parse().ok())
}
