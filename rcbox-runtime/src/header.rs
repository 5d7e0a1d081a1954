//! # Reference-Count Box
//!
//! The metadata header governing one indirect object: its retain count, its
//! optional destructor, and the lock serializing every access to both.
//!
//! A box lives on the Rust heap, independently of the payload it governs.
//! The payload only stores a back-link to it (see [`crate::layout`]):
//!
//! ```text
//!   raw allocation                         Rust heap
//!   ┌──────────────┬──────────────────┐    ┌──────────────────┐
//!   │ *RefCountBox │ payload bytes... │    │ lock             │
//!   └──────┬───────┴──────────────────┘    │ count            │
//!          │       ^~ object address       │ destructor       │
//!          └──────────────────────────────>└──────────────────┘
//! ```
//!
//! The lock is a raw `parking_lot` mutex rather than a `Mutex<T>` because
//! release must keep it held across teardown and unlock it by hand just
//! before the box is freed.

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;

use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;

/// Retain count of a single object.
pub type RetainCount = u32;

/// Largest representable retain count. Retaining past it is fatal.
pub const MAX_RETAIN_COUNT: RetainCount = RetainCount::MAX;

/// Destructor signature used by compiled code.
pub type ExternDestructor = unsafe extern "C" fn(*mut c_void);

/// Callback run once, with the payload address, when the count reaches zero.
pub enum Destructor {
    /// A C ABI function pointer, as emitted by the compiler.
    Extern(ExternDestructor),
    /// A Rust closure.
    Closure(Box<dyn FnOnce(*mut u8) + Send>),
}

impl Destructor {
    /// Wrap a closure.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce(*mut u8) + Send + 'static,
    {
        Destructor::Closure(Box::new(f))
    }

    /// Run the destructor on `payload`.
    ///
    /// # Safety
    /// `payload` must satisfy whatever the destructor expects of it.
    pub(crate) unsafe fn invoke(self, payload: *mut u8) {
        match self {
            Destructor::Extern(f) => f(payload.cast()),
            Destructor::Closure(f) => f(payload),
        }
    }
}

impl fmt::Debug for Destructor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destructor::Extern(func) => f.debug_tuple("Extern").field(&(*func as usize as *const ())).finish(),
            Destructor::Closure(_) => f.write_str("Closure(..)"),
        }
    }
}

impl From<ExternDestructor> for Destructor {
    fn from(f: ExternDestructor) -> Self {
        Destructor::Extern(f)
    }
}

/// Metadata header of one indirect object.
pub struct RefCountBox {
    /// Guards `count` and `destructor`.
    lock: RawMutex,
    count: UnsafeCell<RetainCount>,
    destructor: UnsafeCell<Option<Destructor>>,
}

// Safety: `count` and `destructor` are only touched with `lock` held, and the
// destructor itself is `Send`.
unsafe impl Send for RefCountBox {}
unsafe impl Sync for RefCountBox {}

impl RefCountBox {
    /// Create a box with a retain count of zero.
    pub fn new(destructor: Option<Destructor>) -> Self {
        Self {
            lock: RawMutex::INIT,
            count: UnsafeCell::new(0),
            destructor: UnsafeCell::new(destructor),
        }
    }

    /// Move the box onto the heap and leak it.
    ///
    /// The result must eventually be passed to [`RefCountBox::free`].
    pub fn into_raw(self) -> NonNull<RefCountBox> {
        NonNull::from(Box::leak(Box::new(self)))
    }

    /// Free a box produced by [`RefCountBox::into_raw`].
    ///
    /// # Safety
    /// `ptr` must come from `into_raw`, must be unlocked, and must not be
    /// used afterwards. An untaken destructor is dropped without running.
    pub unsafe fn free(ptr: NonNull<RefCountBox>) {
        drop(Box::from_raw(ptr.as_ptr()));
    }

    /// Acquire the lock for the duration of the returned guard.
    pub fn lock(&self) -> BoxGuard<'_> {
        self.lock.lock();
        BoxGuard { header: self }
    }

    /// Whether some thread currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Acquire the lock without a guard.
    pub(crate) fn lock_raw(&self) {
        self.lock.lock();
    }

    /// # Safety
    /// The current thread must hold the lock.
    pub(crate) unsafe fn unlock_raw(&self) {
        self.lock.unlock();
    }

    /// # Safety
    /// The current thread must hold the lock.
    pub(crate) unsafe fn count_locked(&self) -> RetainCount {
        *self.count.get()
    }

    /// # Safety
    /// The current thread must hold the lock.
    pub(crate) unsafe fn set_count_locked(&self, count: RetainCount) {
        *self.count.get() = count;
    }

    /// # Safety
    /// The current thread must hold the lock.
    pub(crate) unsafe fn take_destructor_locked(&self) -> Option<Destructor> {
        (*self.destructor.get()).take()
    }
}

impl fmt::Debug for RefCountBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefCountBox")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// Scoped hold on a box's lock.
pub struct BoxGuard<'a> {
    header: &'a RefCountBox,
}

impl BoxGuard<'_> {
    /// Current retain count.
    pub fn count(&self) -> RetainCount {
        unsafe { self.header.count_locked() }
    }

    /// Whether a destructor is still attached.
    pub fn has_destructor(&self) -> bool {
        unsafe { (*self.header.destructor.get()).is_some() }
    }

    pub(crate) fn set_count(&mut self, count: RetainCount) {
        unsafe { self.header.set_count_locked(count) }
    }
}

impl Drop for BoxGuard<'_> {
    fn drop(&mut self) {
        unsafe { self.header.unlock_raw() }
    }
}
