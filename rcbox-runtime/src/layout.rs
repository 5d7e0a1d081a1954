//! # Payload Addressing
//!
//! Every indirect object is addressed by its *payload* pointer. The
//! pointer-sized slot immediately before the payload is the *back-link*: it
//! holds the address of the object's [`RefCountBox`], or null once the object
//! has been deallocated.
//!
//! ```text
//!   base                 base + SLOT_SIZE
//!   ┌────────────────────┬──────────────────────────┐
//!   │ back-link (ptr)    │ payload (size bytes)     │
//!   └────────────────────┴──────────────────────────┘
//!                        ^~ what compiled code sees
//! ```
//!
//! This layout is an ABI contract. Any component that builds boxed values
//! without going through [`crate::refcount::allocate`] must place a
//! pointer-aligned back-link in the same position, written with
//! [`install_box`], for retain and release to work.
//!
//! The back-link is read and written as an `AtomicPtr`, which has the same
//! size and layout as a raw pointer. Teardown stores null with `Release`
//! ordering; resolution loads with `Acquire`.

use std::alloc::Layout;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::fatal::{self, FatalError};
use crate::header::RefCountBox;

/// Size of the back-link slot.
pub const SLOT_SIZE: usize = mem::size_of::<*mut RefCountBox>();

/// Alignment guaranteed for every payload.
pub const PAYLOAD_ALIGN: usize = mem::align_of::<*mut RefCountBox>();

/// Alignment requested from the raw allocator for slot + payload.
pub const ALLOCATION_ALIGN: usize = 16;

/// Layout of the raw allocation backing a payload of `payload_size` bytes.
///
/// Returns `None` if the total size overflows.
pub fn allocation_layout(payload_size: usize) -> Option<Layout> {
    let total = SLOT_SIZE.checked_add(payload_size)?;
    Layout::from_size_align(total, ALLOCATION_ALIGN).ok()
}

/// Payload address for a raw allocation starting at `base`.
///
/// # Safety
/// `base` must point to at least `SLOT_SIZE` bytes.
pub unsafe fn payload_of(base: NonNull<u8>) -> NonNull<u8> {
    NonNull::new_unchecked(base.as_ptr().add(SLOT_SIZE))
}

/// Start of the raw allocation holding `payload`.
///
/// # Safety
/// `payload` must be preceded by a back-link slot.
pub unsafe fn base_of(payload: NonNull<u8>) -> NonNull<u8> {
    NonNull::new_unchecked(payload.as_ptr().sub(SLOT_SIZE))
}

/// # Safety
/// `payload` must be preceded by an initialized, pointer-aligned back-link.
unsafe fn backlink<'a>(payload: NonNull<u8>) -> &'a AtomicPtr<RefCountBox> {
    &*base_of(payload).as_ptr().cast::<AtomicPtr<RefCountBox>>()
}

/// Write `header`'s address into the back-link before `payload`.
///
/// The slot may be uninitialized. This is a plain write: the object must not
/// yet be visible to other threads.
///
/// # Safety
/// `payload` must be preceded by `SLOT_SIZE` writable, pointer-aligned bytes.
pub unsafe fn install_box(payload: NonNull<u8>, header: NonNull<RefCountBox>) {
    ptr::write(
        base_of(payload).as_ptr().cast::<AtomicPtr<RefCountBox>>(),
        AtomicPtr::new(header.as_ptr()),
    );
}

/// Store the null sentinel into the back-link before `payload`.
///
/// # Safety
/// `payload` must be preceded by an initialized back-link.
pub unsafe fn clear_slot(payload: NonNull<u8>) {
    backlink(payload).store(ptr::null_mut(), Ordering::Release);
}

/// Read the back-link; `None` means the object was deallocated.
///
/// # Safety
/// `payload` must be preceded by an initialized back-link.
pub unsafe fn load_box(payload: NonNull<u8>) -> Option<NonNull<RefCountBox>> {
    NonNull::new(backlink(payload).load(Ordering::Acquire))
}

/// Whether the object at `payload` has been deallocated.
///
/// # Safety
/// `payload` must be preceded by an initialized back-link.
pub unsafe fn is_deallocated(payload: NonNull<u8>) -> bool {
    load_box(payload).is_none()
}

/// Resolve the box governing `payload`.
///
/// Reports [`FatalError::UseAfterFree`] if the back-link holds the null
/// sentinel.
///
/// # Safety
/// `payload` must be preceded by an initialized back-link. The returned
/// pointer is only valid while the object is live.
pub unsafe fn resolve_box(payload: NonNull<u8>) -> NonNull<RefCountBox> {
    match load_box(payload) {
        Some(header) => header,
        None => fatal::report(FatalError::UseAfterFree {
            address: payload.as_ptr() as usize,
        }),
    }
}
