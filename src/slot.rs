//! Global hazard-slot registry.
//!
//! Slot records form a process-wide, append-only singly linked list. A thread
//! claims records by test-and-set of the flag embedded in each record and
//! hands them back on exit; records are recycled by later threads, never
//! freed. Reclamation scans walk the whole list, so the list only ever holds
//! as many records as the peak number of concurrently live threads times the
//! per-thread slot count.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::collections::HashSet;

use foldhash::fast::FixedState;
use once_cell::race::OnceBox;

/// One published-pointer cell in the global registry.
pub(crate) struct HazardSlot {
    /// Claim flag. Test-and-set to acquire, cleared when the owning thread
    /// exits.
    claimed: AtomicBool,
    /// The pointer this slot currently protects. Zero when idle.
    protected: AtomicUsize,
    /// Next record in the registry list. Written once, before the record is
    /// published.
    next: AtomicPtr<HazardSlot>,
}

impl HazardSlot {
    fn new_claimed() -> Self {
        Self {
            claimed: AtomicBool::new(true),
            protected: AtomicUsize::new(0),
            next: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Publish `ptr` into this slot. The release store pairs with the acquire
    /// loads performed by reclamation scans, so a scan that misses `ptr` here
    /// can only have run before the publication.
    #[inline]
    pub(crate) fn set(&self, ptr: usize) {
        self.protected.store(ptr, Ordering::Release);
    }

    #[inline]
    pub(crate) fn get(&self) -> usize {
        self.protected.load(Ordering::Acquire)
    }
}

/// The process-wide list of hazard slots.
pub(crate) struct SlotRegistry {
    head: AtomicPtr<HazardSlot>,
    len: AtomicUsize,
}

impl SlotRegistry {
    fn new() -> Self {
        Self {
            head: AtomicPtr::new(core::ptr::null_mut()),
            len: AtomicUsize::new(0),
        }
    }

    /// Claim an idle slot, appending a fresh record when every existing one
    /// is taken. The returned reference is `'static`: records are leaked into
    /// the registry and outlive every thread.
    pub(crate) fn claim(&self) -> &'static HazardSlot {
        let mut p = self.head.load(Ordering::Acquire);
        while !p.is_null() {
            // SAFETY: records are never freed once published.
            let slot = unsafe { &*p };
            if !slot.claimed.swap(true, Ordering::Acquire) {
                return slot;
            }
            p = slot.next.load(Ordering::Relaxed);
        }

        let fresh: &'static HazardSlot = Box::leak(Box::new(HazardSlot::new_claimed()));
        let fresh_ptr = fresh as *const HazardSlot as *mut HazardSlot;
        self.len.fetch_add(1, Ordering::Relaxed);
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            fresh.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, fresh_ptr, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return fresh,
                Err(observed) => head = observed,
            }
        }
    }

    /// Hand a slot back for recycling. The caller must have cleared the
    /// published pointer already.
    pub(crate) fn release(&self, slot: &'static HazardSlot) {
        debug_assert_eq!(slot.protected.load(Ordering::Relaxed), 0);
        slot.claimed.store(false, Ordering::Release);
    }

    /// Number of records ever appended, claimed or not. Used to rate-limit
    /// reclamation scans.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// True if any slot anywhere currently publishes `ptr`.
    pub(crate) fn is_protected(&self, ptr: usize) -> bool {
        let mut p = self.head.load(Ordering::Acquire);
        while !p.is_null() {
            // SAFETY: records are never freed once published.
            let slot = unsafe { &*p };
            if slot.protected.load(Ordering::Acquire) == ptr {
                return true;
            }
            p = slot.next.load(Ordering::Relaxed);
        }
        false
    }

    /// Collect every non-zero published pointer into `shield`.
    pub(crate) fn snapshot_into(&self, shield: &mut HashSet<usize, FixedState>) {
        let mut p = self.head.load(Ordering::Acquire);
        while !p.is_null() {
            // SAFETY: records are never freed once published.
            let slot = unsafe { &*p };
            let ptr = slot.protected.load(Ordering::Acquire);
            if ptr != 0 {
                shield.insert(ptr);
            }
            p = slot.next.load(Ordering::Relaxed);
        }
    }
}

static REGISTRY: OnceBox<SlotRegistry> = OnceBox::new();

/// The global registry singleton.
#[inline]
pub(crate) fn registry() -> &'static SlotRegistry {
    REGISTRY.get_or_init(|| Box::new(SlotRegistry::new()))
}
