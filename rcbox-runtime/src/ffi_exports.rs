//! # FFI Exports
//!
//! C-compatible exports for linking compiled programs against the runtime.
//!
//! ## Design
//!
//! Compiled code treats every indirect object as an opaque `void *` payload
//! pointer and calls these functions to manage its lifetime. The
//! deinitializer emitted for a type is passed to [`rcbox_alloc_indirect`] and
//! called with the payload once the last reference is released.
//!
//! ## Usage
//!
//! The crate builds as `cdylib`, `staticlib` and `rlib`; link compiled
//! programs with `-lrcbox_runtime`.
//!
//! ```c
//! typedef void (*rcbox_deinitializer_t)(void *);
//!
//! void *rcbox_alloc_indirect(size_t size, rcbox_deinitializer_t deinit);
//! void rcbox_retain(void *instance);
//! void rcbox_release(void *instance);
//! uint8_t rcbox_is_uniquely_referenced(void *instance);
//! uint32_t rcbox_retain_count(void *instance);
//! _Noreturn void rcbox_fatal_error(const char *message);
//! int rcbox_runtime_init(void);
//! ```
//!
//! Unwinding cannot leave these functions. Fatal errors raised here always
//! terminate the process, whatever the configured [`FatalPolicy`].
//!
//! [`FatalPolicy`]: crate::fatal::FatalPolicy

use std::ffi::{c_char, c_int, c_void, CStr};
use std::ptr::NonNull;

use crate::fatal::{self, FatalError};
use crate::header::{Destructor, ExternDestructor};
use crate::refcount;

fn instance(ptr: *mut c_void, operation: &'static str) -> NonNull<u8> {
    match NonNull::new(ptr.cast::<u8>()) {
        Some(payload) => payload,
        None => fatal::report(FatalError::NullInstance { operation }),
    }
}

// ============================================================================
// Object Lifetime
// ============================================================================

/// Allocate an indirect object with a `size`-byte payload.
///
/// The returned payload is uninitialized and has a retain count of zero.
#[no_mangle]
pub extern "C" fn rcbox_alloc_indirect(size: usize, deinit: Option<ExternDestructor>) -> *mut c_void {
    refcount::allocate(size, deinit.map(Destructor::Extern))
        .as_ptr()
        .cast()
}

/// Retain an indirect object.
///
/// # Safety
/// `instance_ptr` must have been returned by [`rcbox_alloc_indirect`].
#[no_mangle]
pub unsafe extern "C" fn rcbox_retain(instance_ptr: *mut c_void) {
    refcount::retain(instance(instance_ptr, "rcbox_retain"));
}

/// Release an indirect object, deinitializing it at zero.
///
/// # Safety
/// `instance_ptr` must have been returned by [`rcbox_alloc_indirect`].
#[no_mangle]
pub unsafe extern "C" fn rcbox_release(instance_ptr: *mut c_void) {
    refcount::release(instance(instance_ptr, "rcbox_release"));
}

/// Returns 1 if the object has exactly one reference, 0 otherwise.
///
/// # Safety
/// `instance_ptr` must have been returned by [`rcbox_alloc_indirect`].
#[no_mangle]
pub unsafe extern "C" fn rcbox_is_uniquely_referenced(instance_ptr: *mut c_void) -> u8 {
    let payload = instance(instance_ptr, "rcbox_is_uniquely_referenced");
    u8::from(refcount::is_uniquely_referenced(payload))
}

/// Current retain count of the object.
///
/// # Safety
/// `instance_ptr` must have been returned by [`rcbox_alloc_indirect`].
#[no_mangle]
pub unsafe extern "C" fn rcbox_retain_count(instance_ptr: *mut c_void) -> u32 {
    refcount::retain_count(instance(instance_ptr, "rcbox_retain_count"))
}

// ============================================================================
// Errors and Initialization
// ============================================================================

/// Called by compiled code on unrecoverable errors.
///
/// # Safety
/// `msg` must be null or a valid C string.
#[no_mangle]
pub unsafe extern "C" fn rcbox_fatal_error(msg: *const c_char) -> ! {
    let message = if msg.is_null() {
        "unknown error".to_string()
    } else {
        CStr::from_ptr(msg).to_string_lossy().into_owned()
    };
    fatal::report(FatalError::Runtime { message });
}

/// Initialize the runtime from `RCBOX_*` environment variables.
///
/// Returns 0 on success, -1 if the environment holds an invalid
/// configuration (defaults are applied in that case).
#[no_mangle]
pub extern "C" fn rcbox_runtime_init() -> c_int {
    match crate::init_from_env() {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_lifecycle_through_c_abi() {
        static DEINIT_CALLS: AtomicUsize = AtomicUsize::new(0);
        unsafe extern "C" fn deinit(_: *mut c_void) {
            DEINIT_CALLS.fetch_add(1, Ordering::SeqCst);
        }

        let obj = rcbox_alloc_indirect(8, Some(deinit));
        assert!(!obj.is_null());
        unsafe {
            assert_eq!(rcbox_retain_count(obj), 0);
            assert_eq!(rcbox_is_uniquely_referenced(obj), 0);

            rcbox_retain(obj);
            assert_eq!(rcbox_is_uniquely_referenced(obj), 1);
            rcbox_retain(obj);
            assert_eq!(rcbox_is_uniquely_referenced(obj), 0);
            assert_eq!(rcbox_retain_count(obj), 2);

            rcbox_release(obj);
            rcbox_release(obj);
        }
        assert_eq!(DEINIT_CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_alloc_without_deinit() {
        let obj = rcbox_alloc_indirect(0, None);
        unsafe {
            rcbox_retain(obj);
            rcbox_release(obj);
        }
    }
}
