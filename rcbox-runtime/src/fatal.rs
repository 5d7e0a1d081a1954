//! # Fatal Errors
//!
//! Every invariant violation in the refcount runtime is fatal. There is no
//! recoverable path: a bad retain count means the calling code has corrupted
//! memory or mismanaged ownership, and continuing risks double frees and
//! silent data corruption.
//!
//! Violations are described by [`FatalError`] and handed to the process-wide
//! [`FatalReporter`]. The default reporter logs the error and aborts. Hosts
//! that embed the runtime (and the test suite) can switch to
//! [`FatalPolicy::Panic`] to unwind instead, or install their own reporter.
//!
//! Panics cannot cross the `extern "C"` exports in [`crate::ffi_exports`]:
//! since Rust 1.81 an unwind reaching an `extern "C"` boundary aborts, so
//! under the panic policy a fatal error raised through the C ABI still
//! aborts.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use parking_lot::RwLock;

use crate::header::RetainCount;
use crate::log::{LogBuilder, LogLevel};

/// An unrecoverable runtime invariant violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    /// The back-link slot before a payload holds the null sentinel.
    UseAfterFree {
        /// Payload address.
        address: usize,
    },
    /// Retain attempted with the count already at its maximum.
    RetainOverflow {
        /// Payload address.
        address: usize,
        /// Count observed (always the maximum).
        count: RetainCount,
    },
    /// Release attempted on an object with no outstanding references.
    ReleaseUnderflow {
        /// Payload address.
        address: usize,
    },
    /// Teardown reached while the object is still referenced.
    TeardownInvariantViolation {
        /// Payload address.
        address: usize,
        /// Count observed at teardown.
        count: RetainCount,
    },
    /// The slot + payload region for a requested size has no valid layout.
    LayoutOverflow {
        /// Requested payload size in bytes.
        size: usize,
    },
    /// A null pointer was passed where an object was expected.
    NullInstance {
        /// Operation that received it.
        operation: &'static str,
    },
    /// A fatal error raised by compiled code through the runtime.
    Runtime {
        /// Message supplied by the caller.
        message: String,
    },
}

impl FatalError {
    /// Short machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            FatalError::UseAfterFree { .. } => "use_after_free",
            FatalError::RetainOverflow { .. } => "retain_overflow",
            FatalError::ReleaseUnderflow { .. } => "release_underflow",
            FatalError::TeardownInvariantViolation { .. } => "teardown_invariant_violation",
            FatalError::LayoutOverflow { .. } => "layout_overflow",
            FatalError::NullInstance { .. } => "null_instance",
            FatalError::Runtime { .. } => "runtime",
        }
    }

    /// The offending payload address, if the error concerns an object.
    pub fn address(&self) -> Option<usize> {
        match *self {
            FatalError::UseAfterFree { address }
            | FatalError::RetainOverflow { address, .. }
            | FatalError::ReleaseUnderflow { address }
            | FatalError::TeardownInvariantViolation { address, .. } => Some(address),
            FatalError::LayoutOverflow { .. } | FatalError::NullInstance { .. } | FatalError::Runtime { .. } => None,
        }
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalError::UseAfterFree { address } => {
                write!(f, "object ({address:#x}) used after deallocation")
            }
            FatalError::RetainOverflow { address, count } => {
                write!(f, "retain count overflow: object ({address:#x}) already has retain count {count}")
            }
            FatalError::ReleaseUnderflow { address } => {
                write!(f, "attempting to release object with retain count 0 ({address:#x})")
            }
            FatalError::TeardownInvariantViolation { address, count } => {
                write!(f, "object ({address:#x}) deallocated with retain count {count} > 0")
            }
            FatalError::LayoutOverflow { size } => {
                write!(f, "allocation layout overflow: payload of {size} bytes cannot be allocated")
            }
            FatalError::NullInstance { operation } => {
                write!(f, "null object passed to {operation}")
            }
            FatalError::Runtime { message } => f.write_str(message),
        }
    }
}

impl std::error::Error for FatalError {}

/// Terminates the current computation on a fatal error.
pub trait FatalReporter: Send + Sync {
    /// Report `error`. Must not return.
    fn report(&self, error: &FatalError) -> !;
}

/// Logs the error and aborts the process.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbortReporter;

impl FatalReporter for AbortReporter {
    fn report(&self, error: &FatalError) -> ! {
        log_fatal(error);
        std::process::abort();
    }
}

/// Logs the error and panics with its message.
#[derive(Debug, Clone, Copy, Default)]
pub struct PanicReporter;

impl FatalReporter for PanicReporter {
    fn report(&self, error: &FatalError) -> ! {
        log_fatal(error);
        panic!("rcbox fatal error: {error}");
    }
}

/// Built-in reporter selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FatalPolicy {
    /// Abort the process (default).
    #[default]
    Abort = 0,
    /// Unwind with a panic.
    Panic = 1,
}

impl FatalPolicy {
    /// Parse a policy from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "abort" => Some(FatalPolicy::Abort),
            "panic" | "unwind" => Some(FatalPolicy::Panic),
            _ => None,
        }
    }

    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            FatalPolicy::Abort => "abort",
            FatalPolicy::Panic => "panic",
        }
    }
}

static POLICY: AtomicU8 = AtomicU8::new(FatalPolicy::Abort as u8);

static REPORTER: RwLock<Option<&'static dyn FatalReporter>> = parking_lot::const_rwlock(None);

static FATAL_COUNT: AtomicU64 = AtomicU64::new(0);

/// Select the built-in reporter used when no custom reporter is installed.
pub fn set_policy(policy: FatalPolicy) {
    POLICY.store(policy as u8, Ordering::SeqCst);
}

/// The current built-in policy.
pub fn policy() -> FatalPolicy {
    match POLICY.load(Ordering::SeqCst) {
        1 => FatalPolicy::Panic,
        _ => FatalPolicy::Abort,
    }
}

/// Install a custom reporter, replacing the policy-selected one.
pub fn set_reporter(reporter: &'static dyn FatalReporter) {
    *REPORTER.write() = Some(reporter);
}

/// Remove a custom reporter, falling back to the policy.
pub fn clear_reporter() {
    *REPORTER.write() = None;
}

/// Number of fatal errors reported so far in this process.
///
/// Only ever observable above zero under a non-aborting reporter.
pub fn fatal_count() -> u64 {
    FATAL_COUNT.load(Ordering::SeqCst)
}

/// Report a fatal error. Never returns.
#[cold]
#[inline(never)]
pub fn report(error: FatalError) -> ! {
    FATAL_COUNT.fetch_add(1, Ordering::SeqCst);

    let custom = *REPORTER.read();
    if let Some(reporter) = custom {
        reporter.report(&error);
    }

    match policy() {
        FatalPolicy::Abort => AbortReporter.report(&error),
        FatalPolicy::Panic => PanicReporter.report(&error),
    }
}

fn log_fatal(error: &FatalError) {
    let mut entry = LogBuilder::new(LogLevel::Error)
        .target("rcbox::fatal")
        .message(error.to_string())
        .field_str("kind", error.kind());
    if let Some(address) = error.address() {
        entry = entry.field_addr("address", address);
    }
    entry.emit();
}
