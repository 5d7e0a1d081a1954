//! # rcbox Runtime Library
//!
//! Manual reference counting for indirect objects, callable from Rust and
//! from compiled code through a C ABI.
//!
//! The rcbox runtime provides:
//!
//! - **Refcount Core**: allocate / retain / release with a per-object lock
//! - **Back-link Layout**: a pointer-sized slot before every payload that
//!   reaches the object's header and doubles as a use-after-free sentinel
//! - **Fatal Errors**: contract violations terminate through a pluggable
//!   reporter instead of returning errors
//! - **Typed Handles**: [`Indirect<T>`] for safe Rust callers
//! - **FFI Exports**: `rcbox_*` symbols for compiled programs
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        RCBOX RUNTIME                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐                             │
//! │  │ FFI Exports  │  │   Handles    │                             │
//! │  │(ffi_exports) │  │ (handle.rs)  │                             │
//! │  └──────────────┘  └──────────────┘                             │
//! │         │                 │                                     │
//! │         └────────┬────────┘                                     │
//! │                  │                                              │
//! │          ┌──────────────┐        ┌──────────────┐              │
//! │          │   Refcount   │───────▶│    Fatal     │              │
//! │          │(refcount.rs) │        │  (fatal.rs)  │              │
//! │          └──────────────┘        └──────────────┘              │
//! │                  │                                              │
//! │   ┌──────────────┼──────────────┬──────────────┐               │
//! │   │              │              │              │               │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────┐          │
//! │  │  Header  │ │  Layout  │ │  Alloc   │ │  Stats   │          │
//! │  └──────────┘ └──────────┘ └──────────┘ └──────────┘          │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod alloc;
pub mod config;
pub mod fatal;
pub mod ffi_exports;
pub mod handle;
pub mod header;
pub mod layout;
pub mod log;
pub mod refcount;
pub mod stats;

// Re-exports
pub use alloc::{RawAllocator, SystemAllocator};
pub use config::{ConfigError, RuntimeConfig, RuntimeConfigBuilder};
pub use fatal::{FatalError, FatalPolicy, FatalReporter};
pub use handle::Indirect;
pub use header::{Destructor, ExternDestructor, RefCountBox, RetainCount, MAX_RETAIN_COUNT};
pub use refcount::{allocate, allocate_in, is_uniquely_referenced, release, retain, retain_count};
pub use stats::{stats, StatsSnapshot};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the runtime with full runtime configuration.
///
/// Applies the log level and format, the fatal policy, and the system
/// allocator's heap limit. An invalid configuration is rejected and nothing
/// is applied.
///
/// # Example
///
/// ```rust,ignore
/// use rcbox_runtime::{init_with_runtime_config, RuntimeConfig};
///
/// let config = RuntimeConfig::builder()
///     .max_heap_size(64 * 1024 * 1024)
///     .build_unchecked();
///
/// init_with_runtime_config(config)?;
/// ```
pub fn init_with_runtime_config(config: RuntimeConfig) -> Result<(), ConfigError> {
    config.validate()?;
    apply(&config);
    *RUNTIME_CONFIG.write() = Some(config);
    Ok(())
}

/// Initialize the runtime from environment variables.
///
/// Reads configuration from `RCBOX_*` environment variables. See
/// [`RuntimeConfig::from_env`] for the supported variables. If the
/// environment describes an invalid configuration, defaults are applied and
/// the validation error is returned.
pub fn init_from_env() -> Result<(), ConfigError> {
    let config = RuntimeConfig::from_env();
    match config.validate() {
        Ok(()) => init_with_runtime_config(config),
        Err(err) => {
            log::error(format!("{err}; falling back to default configuration"));
            init_with_runtime_config(RuntimeConfig::default())?;
            Err(err)
        }
    }
}

fn apply(config: &RuntimeConfig) {
    log::set_level(config.log.level);
    log::set_format(config.log.format);
    fatal::set_policy(config.fatal.policy);
    alloc::system_allocator().set_max_heap_size(config.memory.max_heap_size as u64);

    log::LogBuilder::new(log::LogLevel::Debug)
        .target("rcbox::config")
        .message("runtime configured")
        .field_uint("max_heap_size", config.memory.max_heap_size as u64)
        .field_str("fatal_policy", config.fatal.policy.as_str())
        .field_str("log_format", config.log.format.as_str())
        .emit();
}

/// Most recently applied runtime configuration.
static RUNTIME_CONFIG: parking_lot::RwLock<Option<RuntimeConfig>> = parking_lot::const_rwlock(None);

/// Get the current runtime configuration.
///
/// Returns the configuration applied by the latest successful
/// [`init_with_runtime_config`] or [`init_from_env`], or `None` if the
/// runtime was never initialized.
pub fn runtime_config() -> Option<RuntimeConfig> {
    RUNTIME_CONFIG.read().clone()
}
