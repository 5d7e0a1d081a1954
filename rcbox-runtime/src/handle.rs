//! # Typed Handles
//!
//! [`Indirect<T>`] owns one retain of an indirect object whose payload is a
//! `T`. It is the safe Rust face of [`crate::refcount`]: `clone` retains,
//! `drop` releases, and the last release drops the `T` in place through the
//! object's destructor.
//!
//! The payload keeps the ordinary slot-before-payload layout, so a handle can
//! be converted to and from the raw payload pointer that compiled code
//! passes around ([`Indirect::into_payload`], [`Indirect::from_payload`]).
//!
//! The payload is dropped through a C ABI destructor, so a `T` whose `Drop`
//! panics aborts the process.

use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::Deref;
use std::ptr::{self, NonNull};

use crate::header::{Destructor, RetainCount};
use crate::layout::PAYLOAD_ALIGN;
use crate::refcount;

unsafe extern "C" fn drop_payload<T>(payload: *mut c_void) {
    ptr::drop_in_place(payload.cast::<T>());
}

/// A counted reference to a `T` stored in an indirect object.
pub struct Indirect<T> {
    payload: NonNull<u8>,
    _marker: PhantomData<T>,
}

// Safety: same contract as `Arc<T>`; the refcount itself is lock-protected.
unsafe impl<T: Send + Sync> Send for Indirect<T> {}
unsafe impl<T: Send + Sync> Sync for Indirect<T> {}

impl<T> Indirect<T> {
    /// Move `value` into a new indirect object and take the first reference.
    pub fn new(value: T) -> Self {
        const { assert!(mem::align_of::<T>() <= PAYLOAD_ALIGN, "payload type is over-aligned") };

        let destructor = mem::needs_drop::<T>().then(|| Destructor::Extern(drop_payload::<T>));
        let payload = refcount::allocate(mem::size_of::<T>(), destructor);
        unsafe {
            payload.as_ptr().cast::<T>().write(value);
            refcount::retain(payload);
        }
        Self {
            payload,
            _marker: PhantomData,
        }
    }

    /// Adopt one existing reference to `payload`.
    ///
    /// # Safety
    /// `payload` must be a live object holding an initialized `T`, allocated
    /// with a destructor that drops a `T` (or none if `T` needs no drop), and
    /// the caller must own one retain that is transferred to the handle.
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        Self {
            payload,
            _marker: PhantomData,
        }
    }

    /// Give up the handle without releasing, returning the payload.
    ///
    /// The caller becomes responsible for the retain the handle held.
    pub fn into_payload(this: Self) -> NonNull<u8> {
        let payload = this.payload;
        mem::forget(this);
        payload
    }

    /// The payload address, without affecting the count.
    pub fn as_payload(this: &Self) -> NonNull<u8> {
        this.payload
    }

    /// Current retain count.
    pub fn retain_count(this: &Self) -> RetainCount {
        unsafe { refcount::retain_count(this.payload) }
    }

    /// Whether this is the only reference.
    pub fn is_unique(this: &Self) -> bool {
        unsafe { refcount::is_uniquely_referenced(this.payload) }
    }

    /// Mutable access, if this is the only reference.
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        if Self::is_unique(this) {
            Some(unsafe { &mut *this.payload.as_ptr().cast::<T>() })
        } else {
            None
        }
    }

    /// Whether both handles refer to the same object.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.payload == b.payload
    }
}

impl<T: Clone> Indirect<T> {
    /// Mutable access, cloning the value into a fresh object first if it is
    /// shared.
    pub fn make_mut(this: &mut Self) -> &mut T {
        if !Self::is_unique(this) {
            *this = Indirect::new((**this).clone());
        }
        unsafe { &mut *this.payload.as_ptr().cast::<T>() }
    }
}

impl<T> Deref for Indirect<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.payload.as_ptr().cast::<T>() }
    }
}

impl<T> Clone for Indirect<T> {
    fn clone(&self) -> Self {
        unsafe { refcount::retain(self.payload) };
        Self {
            payload: self.payload,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for Indirect<T> {
    fn drop(&mut self) {
        unsafe { refcount::release(self.payload) };
    }
}

impl<T: fmt::Debug> fmt::Debug for Indirect<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: fmt::Display> fmt::Display for Indirect<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

impl<T: PartialEq> PartialEq for Indirect<T> {
    fn eq(&self, other: &Self) -> bool {
        **self == **other
    }
}

impl<T: Eq> Eq for Indirect<T> {}

impl<T> From<T> for Indirect<T> {
    fn from(value: T) -> Self {
        Indirect::new(value)
    }
}
