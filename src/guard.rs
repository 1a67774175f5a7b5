//! Thread-local reclaimer handle and the hazard-scope API.
//!
//! Each thread lazily claims a fixed group of slots from the global registry
//! and keeps them for its whole lifetime. `HazardScope` is the RAII front for
//! publishing pointers into those slots; `retire`/`try_reclaim` feed the
//! thread's deferred-free list. On thread exit the handle clears its slots,
//! hands them back, then drains the deferred list, yielding until every
//! remaining pointer is no longer protected anywhere.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::marker::PhantomData;
use core::sync::atomic::{fence, Ordering};
use std::collections::HashSet;

use foldhash::fast::FixedState;

use crate::retired::{DropFn, Retired};
use crate::slot::{registry, HazardSlot};

/// Number of hazard slots every thread owns.
pub const HAZARDS_PER_THREAD: usize = 3;

// Reclamation scans run only once the deferred list exceeds this multiple of
// the global slot count (17/4, roughly four and a quarter). Scanning is
// linear in the registry, so the amortized cost per retired pointer stays
// constant.
const SCAN_FACTOR_NUM: usize = 17;
const SCAN_FACTOR_DEN: usize = 4;

/// Thread-local reclaimer state.
struct Handle {
    slots: Cell<Option<[&'static HazardSlot; HAZARDS_PER_THREAD]>>,
    retired: RefCell<Vec<Retired>>,
}

impl Handle {
    const fn new() -> Self {
        Self {
            slots: Cell::new(None),
            retired: RefCell::new(Vec::new()),
        }
    }

    /// The thread's slot group, claimed from the registry on first use.
    fn slots(&self) -> [&'static HazardSlot; HAZARDS_PER_THREAD] {
        match self.slots.get() {
            Some(slots) => slots,
            None => {
                let r = registry();
                let slots = [r.claim(), r.claim(), r.claim()];
                self.slots.set(Some(slots));
                slots
            }
        }
    }

    fn retire(&self, ptr: *mut u8, drop_fn: DropFn) {
        self.retired.borrow_mut().push(Retired { ptr, drop_fn });
    }

    /// Free every deferred pointer that no slot anywhere protects. Skipped
    /// entirely while the deferred list is short.
    fn try_reclaim(&self) {
        let threshold = registry().len() * SCAN_FACTOR_NUM / SCAN_FACTOR_DEN;
        if self.retired.borrow().len() < threshold.max(1) {
            return;
        }

        // Take the list out before freeing anything: a destructor may itself
        // retire pointers, which must land on the fresh list rather than
        // re-enter the borrow.
        let pending = self.retired.take();
        // Order the scan after every publication store that could precede it.
        fence(Ordering::SeqCst);
        let mut shield: HashSet<usize, FixedState> = HashSet::default();
        registry().snapshot_into(&mut shield);

        let mut survivors = Vec::with_capacity(pending.len());
        for record in pending {
            if shield.contains(&(record.ptr as usize)) {
                survivors.push(record);
            } else {
                // SAFETY: the pointer was unlinked before retirement and no
                // slot protected it at the snapshot, so no thread can still
                // dereference it.
                unsafe { record.free() };
            }
        }

        let mut list = self.retired.borrow_mut();
        if list.is_empty() {
            *list = survivors;
        } else {
            list.extend(survivors);
        }
    }

    /// Drain the deferred list completely, yielding while any pointer is
    /// still protected somewhere. The caller must have cleared this thread's
    /// own slots first or the wait would never end.
    fn drain_all(&self) {
        loop {
            let pending = self.retired.take();
            if pending.is_empty() {
                return;
            }
            for record in pending {
                while registry().is_protected(record.ptr as usize) {
                    std::thread::yield_now();
                }
                // SAFETY: unlinked before retirement and observed unprotected.
                unsafe { record.free() };
            }
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.get() {
            for slot in slots {
                slot.set(0);
                registry().release(slot);
            }
            self.slots.set(None);
        }
        self.drain_all();
    }
}

thread_local! {
    static HANDLE: Handle = const { Handle::new() };
}

/// RAII handle over the calling thread's hazard slots.
///
/// Pointers published through a scope stay protected until overwritten or
/// until the scope drops, which clears every slot. The scope captures the
/// thread's slot group directly, so publication is a single release store.
///
/// A thread must drive at most one scope at a time: scopes share the same
/// underlying slots, and dropping an inner scope would strip protection from
/// an outer one.
pub struct HazardScope {
    slots: [&'static HazardSlot; HAZARDS_PER_THREAD],
    // Slots belong to one thread; the scope must not migrate.
    _not_send: PhantomData<*mut ()>,
}

impl HazardScope {
    /// Publish `ptr` into slot `index`.
    ///
    /// The store is release; callers that are about to dereference `ptr`
    /// must re-validate the shared location it was loaded from afterwards.
    /// If the re-read still yields `ptr`, every reclaimer scan that could
    /// free it is ordered after this publication.
    #[inline]
    pub fn protect<T>(&self, index: usize, ptr: *const T) {
        self.slots[index].set(ptr as usize);
    }

    /// Read back the pointer currently published in slot `index`.
    #[inline]
    pub fn protected(&self, index: usize) -> *mut u8 {
        self.slots[index].get() as *mut u8
    }

    /// Clear slot `index`.
    #[inline]
    pub fn clear(&self, index: usize) {
        self.slots[index].set(0);
    }
}

impl Drop for HazardScope {
    #[inline]
    fn drop(&mut self) {
        for slot in self.slots {
            slot.set(0);
        }
    }
}

/// Open a hazard scope on the calling thread, claiming its slot group from
/// the global registry on first use.
#[inline]
pub fn enter() -> HazardScope {
    HANDLE.with(|handle| HazardScope {
        slots: handle.slots(),
        _not_send: PhantomData,
    })
}

/// Hand `ptr` to the reclaimer for deferred freeing.
///
/// The pointee is dropped via `Box::from_raw` once no hazard slot anywhere
/// publishes the pointer. Retiring does not scan; pair with [`try_reclaim`].
///
/// # Safety
///
/// - `ptr` must come from `Box::into_raw` and must be unreachable for new
///   readers (unlinked from every shared location).
/// - `ptr` must not be retired more than once.
/// - The caller must not use `ptr` after this call.
#[inline]
pub unsafe fn retire<T: 'static>(ptr: *mut T) {
    unsafe fn drop_boxed<T>(ptr: *mut u8) {
        // SAFETY: `retire` erased this pointer from `*mut T` obtained via
        // `Box::into_raw`; it is freed exactly once.
        unsafe { drop(Box::from_raw(ptr as *mut T)) }
    }
    // During thread teardown the handle may already be gone; leaking is safe,
    // the OS reclaims process memory on exit.
    let _ = HANDLE.try_with(|handle| handle.retire(ptr as *mut u8, drop_boxed::<T>));
}

/// Free deferred pointers that are no longer protected anywhere.
///
/// Rate-limited: the scan only runs once the calling thread's deferred list
/// has outgrown a small multiple of the global slot count, so it is cheap to
/// call after every retirement.
#[inline]
pub fn try_reclaim() {
    let _ = HANDLE.try_with(|handle| handle.try_reclaim());
}

/// Drain the calling thread's deferred list completely, yielding until each
/// pointer is unprotected. The thread's own slots are cleared first.
///
/// Threads do this implicitly on exit; tests call it to assert that nothing
/// retired is left undeleted.
pub fn flush() {
    let _ = HANDLE.try_with(|handle| {
        if let Some(slots) = handle.slots.get() {
            for slot in slots {
                slot.set(0);
            }
        }
        handle.drain_all();
    });
}
