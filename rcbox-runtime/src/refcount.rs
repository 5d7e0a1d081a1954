//! # Reference Counting
//!
//! The operations compiled code uses to manage indirect objects:
//!
//! | Operation | Effect |
//! |-----------|--------|
//! | [`allocate`] | new object, retain count 0 |
//! | [`retain`] | count + 1 |
//! | [`release`] | count − 1; at zero runs the destructor and tears the box down |
//! | [`is_uniquely_referenced`] | count == 1 |
//! | [`retain_count`] | raw count, for diagnostics |
//!
//! ## Lifecycle
//!
//! ```text
//!   allocate ──> Allocated (0) ──retain──> Live (≥1) ──release to 0──> Deallocated
//!                                           │    ^
//!                                           └────┘ retain / release to ≥1
//! ```
//!
//! Deallocated is terminal: the back-link is null and every further
//! operation on the payload reports [`FatalError::UseAfterFree`].
//!
//! ## Locking
//!
//! Each box has its own lock; operations on different objects never
//! contend. The destructor runs while the box lock is still held, so a
//! destructor must not retain or release its own object (the lock is not
//! reentrant). Destructors may freely operate on other objects. If a
//! destructor unwinds, the object is still deallocated before the unwind
//! reaches the releasing caller.

use std::ptr::NonNull;

use crate::alloc::{self, RawAllocator};
use crate::fatal::{self, FatalError};
use crate::header::{Destructor, RefCountBox, RetainCount, MAX_RETAIN_COUNT};
use crate::layout;
use crate::log::{self, LogBuilder, LogLevel};
use crate::stats::stats;

const TARGET: &str = "rcbox::refcount";

fn trace(event: &'static str, payload: NonNull<u8>, count: RetainCount) {
    if !log::would_log(LogLevel::Trace) {
        return;
    }
    LogBuilder::new(LogLevel::Trace)
        .target(TARGET)
        .message(event)
        .field_addr("address", payload.as_ptr() as usize)
        .field_uint("retain_count", u64::from(count))
        .emit();
}

/// Allocate an object with a `size`-byte payload from the global allocator.
///
/// The object starts with a retain count of zero; the first owner must
/// [`retain`] it. The payload is uninitialized and aligned to
/// [`layout::PAYLOAD_ALIGN`].
pub fn allocate(size: usize, destructor: Option<Destructor>) -> NonNull<u8> {
    allocate_in(alloc::global_allocator(), size, destructor)
}

/// Allocate an object using `allocator` for the slot + payload region.
///
/// Exhaustion is handled by `std::alloc::handle_alloc_error`. A `size` whose
/// slot + payload region has no valid layout reports
/// [`FatalError::LayoutOverflow`].
pub fn allocate_in(allocator: &dyn RawAllocator, size: usize, destructor: Option<Destructor>) -> NonNull<u8> {
    let Some(region) = layout::allocation_layout(size) else {
        fatal::report(FatalError::LayoutOverflow { size });
    };
    let base = match allocator.allocate(region) {
        Some(base) => base,
        None => std::alloc::handle_alloc_error(region),
    };

    let header = RefCountBox::new(destructor).into_raw();
    let payload = unsafe {
        let payload = layout::payload_of(base);
        layout::install_box(payload, header);
        payload
    };

    stats().record_allocation(size);
    trace("creating box", payload, 0);
    payload
}

/// Increment the retain count of `payload`.
///
/// Fatal if the object was deallocated or the count is already
/// [`MAX_RETAIN_COUNT`]; the count is left untouched in both cases.
///
/// # Safety
/// `payload` must have been returned by [`allocate`] (or be laid out the same
/// way) and its backing region must still exist.
pub unsafe fn retain(payload: NonNull<u8>) {
    let header = layout::resolve_box(payload);
    let count = {
        let mut guard = header.as_ref().lock();
        let count = guard.count();
        if count == MAX_RETAIN_COUNT {
            drop(guard);
            fatal::report(FatalError::RetainOverflow {
                address: payload.as_ptr() as usize,
                count,
            });
        }
        guard.set_count(count + 1);
        count + 1
    };

    stats().record_retain();
    trace("retaining object", payload, count);
}

/// Decrement the retain count of `payload`, tearing the object down when it
/// reaches zero.
///
/// Fatal if the object was deallocated or has a retain count of zero.
///
/// # Safety
/// Same as [`retain`]. After the final release the payload must not be
/// dereferenced; passing it to another operation is the fatal use-after-free
/// path.
pub unsafe fn release(payload: NonNull<u8>) {
    let header_ptr = layout::resolve_box(payload);
    let header = header_ptr.as_ref();

    // Held across teardown, so not guard-scoped.
    header.lock_raw();
    let count = header.count_locked();
    if count == 0 {
        header.unlock_raw();
        fatal::report(FatalError::ReleaseUnderflow {
            address: payload.as_ptr() as usize,
        });
    }

    let remaining = count - 1;
    header.set_count_locked(remaining);
    stats().record_release();
    trace("releasing object", payload, remaining);

    if remaining == 0 {
        teardown(payload, header_ptr);
    } else {
        header.unlock_raw();
    }
}

/// Unlocks and frees a box, then nulls its back-link, when dropped.
///
/// Dropped after the destructor returns or while it unwinds, so an object
/// whose destructor panics is still fully deallocated.
struct FinishTeardown {
    payload: NonNull<u8>,
    header: NonNull<RefCountBox>,
}

impl Drop for FinishTeardown {
    fn drop(&mut self) {
        unsafe {
            self.header.as_ref().unlock_raw();
            RefCountBox::free(self.header);
            layout::clear_slot(self.payload);
        }
        stats().record_deallocation();
    }
}

/// Run the destructor, free the box, and null the back-link.
///
/// # Safety
/// The caller holds `header_ptr`'s lock and has just driven its count to
/// zero. On return (or unwind out of the destructor) the lock has been
/// released and the box freed.
pub(crate) unsafe fn teardown(payload: NonNull<u8>, header_ptr: NonNull<RefCountBox>) {
    let header = header_ptr.as_ref();
    let count = header.count_locked();
    if count != 0 {
        header.unlock_raw();
        fatal::report(FatalError::TeardownInvariantViolation {
            address: payload.as_ptr() as usize,
            count,
        });
    }

    trace("deallocating", payload, 0);
    let _finish = FinishTeardown {
        payload,
        header: header_ptr,
    };
    if let Some(destructor) = header.take_destructor_locked() {
        destructor.invoke(payload.as_ptr());
    }
}

/// Whether `payload` has exactly one outstanding reference.
///
/// # Safety
/// Same as [`retain`].
pub unsafe fn is_uniquely_referenced(payload: NonNull<u8>) -> bool {
    let header = layout::resolve_box(payload);
    let count = header.as_ref().lock().count();
    count == 1
}

/// The current retain count of `payload`.
///
/// Only meaningful for diagnostics: another thread may change it as soon as
/// the lock is released.
///
/// # Safety
/// Same as [`retain`].
pub unsafe fn retain_count(payload: NonNull<u8>) -> RetainCount {
    let header = layout::resolve_box(payload);
    let count = header.as_ref().lock().count();
    trace("getting retain count", payload, count);
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fatal::FatalPolicy;
    use std::alloc::Layout;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn setup() {
        fatal::set_policy(FatalPolicy::Panic);
    }

    /// Destructor that records how often it ran and with which payload.
    fn counting_destructor() -> (Destructor, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicUsize::new(0));
        let (c, s) = (Arc::clone(&calls), Arc::clone(&seen));
        let destructor = Destructor::from_fn(move |p| {
            c.fetch_add(1, Ordering::SeqCst);
            s.store(p as usize, Ordering::SeqCst);
        });
        (destructor, calls, seen)
    }

    fn panic_message(result: std::thread::Result<()>) -> String {
        let payload = result.unwrap_err();
        payload.downcast_ref::<String>().cloned().unwrap_or_default()
    }

    #[test]
    fn test_allocate_starts_at_zero() {
        setup();
        let p = allocate(8, None);
        unsafe {
            assert_eq!(retain_count(p), 0);
            assert!(!is_uniquely_referenced(p));
            assert!(!layout::is_deallocated(p));
        }
        assert_eq!(p.as_ptr() as usize % layout::PAYLOAD_ALIGN, 0);
    }

    #[test]
    fn test_payload_is_writable() {
        setup();
        let p = allocate(16, None);
        unsafe {
            p.as_ptr().cast::<u64>().write(0xdead_beef);
            p.as_ptr().cast::<u64>().add(1).write(42);
            retain(p);
            assert_eq!(p.as_ptr().cast::<u64>().read(), 0xdead_beef);
            assert_eq!(p.as_ptr().cast::<u64>().add(1).read(), 42);
            release(p);
        }
    }

    #[test]
    fn test_retain_retain_release_release() {
        setup();
        let (destructor, calls, seen) = counting_destructor();
        let p = allocate(8, Some(destructor));
        unsafe {
            retain(p);
            retain(p);
            release(p);
            assert_eq!(retain_count(p), 1);
            assert_eq!(calls.load(Ordering::SeqCst), 0);

            release(p);
            assert!(layout::is_deallocated(p));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(seen.load(Ordering::SeqCst), p.as_ptr() as usize);
    }

    #[test]
    fn test_unique_after_single_retain() {
        setup();
        let p = allocate(8, None);
        unsafe {
            retain(p);
            assert!(is_uniquely_referenced(p));
            retain(p);
            assert!(!is_uniquely_referenced(p));
            release(p);
            assert!(is_uniquely_referenced(p));
            release(p);
        }
    }

    #[test]
    fn test_release_fresh_object_is_fatal() {
        setup();
        let p = allocate(8, None);
        let message = panic_message(panic::catch_unwind(|| unsafe { release(p) }));
        assert!(message.contains("attempting to release object with retain count 0"));

        // Nothing was mutated and the lock was released before reporting.
        unsafe {
            assert_eq!(retain_count(p), 0);
            retain(p);
            release(p);
        }
    }

    #[test]
    fn test_use_after_free_is_fatal_for_every_operation() {
        setup();
        let (destructor, calls, _) = counting_destructor();
        let p = allocate(8, Some(destructor));
        unsafe {
            retain(p);
            release(p);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let ops: [(&str, Box<dyn Fn()>); 4] = [
            ("retain", Box::new(move || unsafe { retain(p) })),
            ("release", Box::new(move || unsafe { release(p) })),
            ("is_uniquely_referenced", Box::new(move || unsafe {
                is_uniquely_referenced(p);
            })),
            ("retain_count", Box::new(move || unsafe {
                retain_count(p);
            })),
        ];
        for (name, op) in ops {
            let message = panic_message(panic::catch_unwind(AssertUnwindSafe(op)));
            assert!(message.contains("used after deallocation"), "{name}: {message}");
            assert!(message.contains(&format!("{:#x}", p.as_ptr() as usize)), "{name}");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retain_overflow_leaves_count_unchanged() {
        setup();
        let p = allocate(8, None);
        unsafe {
            layout::resolve_box(p).as_ref().lock().set_count(MAX_RETAIN_COUNT);
        }

        let message = panic_message(panic::catch_unwind(|| unsafe { retain(p) }));
        assert!(message.contains("retain count overflow"));
        unsafe {
            assert_eq!(retain_count(p), MAX_RETAIN_COUNT);
            release(p);
            assert_eq!(retain_count(p), MAX_RETAIN_COUNT - 1);
        }
    }

    #[test]
    fn test_retain_up_to_max_is_allowed() {
        setup();
        let p = allocate(8, None);
        unsafe {
            layout::resolve_box(p).as_ref().lock().set_count(MAX_RETAIN_COUNT - 1);
            retain(p);
            assert_eq!(retain_count(p), MAX_RETAIN_COUNT);
        }
    }

    #[test]
    fn test_teardown_with_live_count_is_fatal() {
        setup();
        let (destructor, calls, _) = counting_destructor();
        let p = allocate(8, Some(destructor));
        let header = unsafe { layout::resolve_box(p) };
        unsafe {
            header.as_ref().lock().set_count(2);
            header.as_ref().lock_raw();
        }

        let message = panic_message(panic::catch_unwind(AssertUnwindSafe(|| unsafe { teardown(p, header) })));
        assert!(message.contains("deallocated with retain count 2 > 0"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        unsafe {
            assert!(!header.as_ref().is_locked());
            assert_eq!(retain_count(p), 2);
        }
    }

    #[test]
    fn test_destructor_runs_under_lock() {
        setup();
        let header_addr = Arc::new(AtomicUsize::new(0));
        let locked_during_destructor = Arc::new(AtomicUsize::new(0));
        let (addr, flag) = (Arc::clone(&header_addr), Arc::clone(&locked_during_destructor));

        let p = allocate(
            8,
            Some(Destructor::from_fn(move |_| {
                let header = addr.load(Ordering::SeqCst) as *const RefCountBox;
                if unsafe { (*header).is_locked() } {
                    flag.store(1, Ordering::SeqCst);
                }
            })),
        );
        header_addr.store(unsafe { layout::resolve_box(p) }.as_ptr() as usize, Ordering::SeqCst);
        unsafe {
            retain(p);
            release(p);
        }
        assert_eq!(locked_during_destructor.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_destructor_may_release_other_objects() {
        setup();
        let (inner_destructor, inner_calls, _) = counting_destructor();
        let inner = allocate(8, Some(inner_destructor));
        unsafe { retain(inner) };

        let inner_addr = inner.as_ptr() as usize;
        let outer = allocate(
            8,
            Some(Destructor::from_fn(move |_| unsafe {
                let inner = NonNull::new_unchecked(inner_addr as *mut u8);
                retain(inner);
                release(inner);
                release(inner);
            })),
        );
        unsafe {
            retain(outer);
            release(outer);
            assert!(layout::is_deallocated(outer));
            assert!(layout::is_deallocated(inner));
        }
        assert_eq!(inner_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unwinding_destructor_still_deallocates() {
        setup();
        let inner = allocate(8, None);
        let inner_addr = inner.as_ptr() as usize;
        let outer = allocate(
            8,
            Some(Destructor::from_fn(move |_| unsafe {
                // Never retained: fatal, and unwinds under the panic policy.
                release(NonNull::new_unchecked(inner_addr as *mut u8));
            })),
        );
        let before = stats().snapshot();
        unsafe { retain(outer) };

        let message = panic_message(panic::catch_unwind(|| unsafe { release(outer) }));
        assert!(message.contains("attempting to release object with retain count 0"));
        assert!(stats().snapshot().deallocations > before.deallocations);

        // The outer box lock was released on the way out, so a query from
        // another thread reports use-after-free instead of blocking.
        let addr = outer.as_ptr() as usize;
        let (tx, rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            let outer = NonNull::new(addr as *mut u8).unwrap();
            let result = panic::catch_unwind(|| unsafe {
                retain_count(outer);
            });
            let _ = tx.send(panic_message(result));
        });
        let message = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("retain_count blocked on a box left locked by an unwinding destructor");
        assert!(message.contains("used after deallocation"));
        unsafe { assert!(layout::is_deallocated(outer)) };

        // The object the destructor failed on is untouched.
        unsafe {
            assert_eq!(retain_count(inner), 0);
            retain(inner);
            release(inner);
        }
    }

    #[test]
    fn test_allocation_size_overflow_is_fatal() {
        setup();
        let result = panic::catch_unwind(|| {
            allocate(usize::MAX, None);
        });
        let message = panic_message(result);
        assert!(message.contains("allocation layout overflow"), "{message}");
        assert!(message.contains(&usize::MAX.to_string()), "{message}");
    }

    #[test]
    fn test_extern_destructor_gets_payload() {
        setup();
        static LAST: AtomicUsize = AtomicUsize::new(0);
        unsafe extern "C" fn deinit(p: *mut std::ffi::c_void) {
            LAST.store(p as usize, Ordering::SeqCst);
        }

        let p = allocate(24, Some(Destructor::Extern(deinit)));
        unsafe {
            retain(p);
            release(p);
        }
        assert_eq!(LAST.load(Ordering::SeqCst), p.as_ptr() as usize);
    }

    #[test]
    fn test_concurrent_retains_are_not_lost() {
        setup();
        const THREADS: usize = 8;
        const PER_THREAD: usize = 1000;

        let p = allocate(8, None);
        unsafe { retain(p) };
        let addr = p.as_ptr() as usize;
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let p = NonNull::new(addr as *mut u8).unwrap();
                    barrier.wait();
                    for _ in 0..PER_THREAD {
                        unsafe { retain(p) };
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        unsafe {
            assert_eq!(retain_count(p), (1 + THREADS * PER_THREAD) as RetainCount);
        }
    }

    #[test]
    fn test_concurrent_balanced_traffic_tears_down_once() {
        setup();
        const THREADS: usize = 8;

        let (destructor, calls, _) = counting_destructor();
        let p = allocate(8, Some(destructor));
        unsafe { retain(p) };
        let addr = p.as_ptr() as usize;
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let p = NonNull::new(addr as *mut u8).unwrap();
                    barrier.wait();
                    for _ in 0..500 {
                        unsafe {
                            retain(p);
                            release(p);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        unsafe {
            assert_eq!(retain_count(p), 1);
            assert_eq!(calls.load(Ordering::SeqCst), 0);
            release(p);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_allocate_in_custom_allocator() {
        setup();
        struct Counting(AtomicUsize);
        impl RawAllocator for Counting {
            fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
                self.0.fetch_add(layout.size(), Ordering::SeqCst);
                alloc::system_allocator().allocate(layout)
            }
        }

        let allocator = Counting(AtomicUsize::new(0));
        let p = allocate_in(&allocator, 40, None);
        assert_eq!(allocator.0.load(Ordering::SeqCst), layout::SLOT_SIZE + 40);
        unsafe {
            retain(p);
            assert!(is_uniquely_referenced(p));
            release(p);
        }
    }

    #[test]
    fn test_zero_sized_payload() {
        setup();
        let (destructor, calls, _) = counting_destructor();
        let p = allocate(0, Some(destructor));
        unsafe {
            retain(p);
            release(p);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stats_advance() {
        setup();
        let before = stats().snapshot();
        let p = allocate(32, None);
        unsafe {
            retain(p);
            release(p);
        }
        let after = stats().snapshot();
        assert!(after.allocations > before.allocations);
        assert!(after.deallocations > before.deallocations);
        assert!(after.retains > before.retains);
        assert!(after.releases > before.releases);
        assert!(after.payload_bytes >= before.payload_bytes + 32);
    }
}
