//! Lazily allocated bucket directory.
//!
//! A fixed-depth radix tree over the bucket index: the root array is
//! allocated in place with the table, every lower level is installed on
//! demand by compare-exchange from null. The loser of an installation race
//! frees its draft array and adopts the winner's, so a slot, once non-null,
//! never changes again. Leaf slots hold raw pointers to the bucket anchor
//! nodes embedded in the ordered list; the directory owns its arrays but
//! never the anchors.

use alloc::boxed::Box;
use core::array;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Fan-out of every directory level.
pub(crate) const SEGMENT_FANOUT: usize = 64;

/// Number of array levels, root included.
pub(crate) const SEGMENT_LEVELS: u32 = 4;

/// Buckets addressable by the directory: `SEGMENT_FANOUT ^ SEGMENT_LEVELS`.
pub(crate) const DIRECTORY_CAPACITY: u64 =
    (SEGMENT_FANOUT as u64).pow(SEGMENT_LEVELS);

const DIGIT_BITS: u32 = SEGMENT_FANOUT.trailing_zeros();
const DIGIT_MASK: u64 = SEGMENT_FANOUT as u64 - 1;

type LeafSegment<T> = [AtomicPtr<T>; SEGMENT_FANOUT];
type SubSegment<T> = [AtomicPtr<LeafSegment<T>>; SEGMENT_FANOUT];
type MidSegment<T> = [AtomicPtr<SubSegment<T>>; SEGMENT_FANOUT];

fn null_array<C>() -> Box<[AtomicPtr<C>; SEGMENT_FANOUT]> {
    Box::new(array::from_fn(|_| AtomicPtr::new(core::ptr::null_mut())))
}

/// Install-or-adopt: returns the child array behind `slot`, allocating one if
/// the slot is still null. Never blocks and never re-reads from the root.
fn descend<C>(slot: &AtomicPtr<C>, fresh: impl FnOnce() -> Box<C>) -> *mut C {
    let current = slot.load(Ordering::Acquire);
    if !current.is_null() {
        return current;
    }
    let draft = Box::into_raw(fresh());
    match slot.compare_exchange(
        core::ptr::null_mut(),
        draft,
        Ordering::Release,
        Ordering::Acquire,
    ) {
        Ok(_) => draft,
        Err(winner) => {
            // SAFETY: the draft was never published.
            unsafe { drop(Box::from_raw(draft)) };
            winner
        }
    }
}

/// The directory tree. `T` is the anchor node type referenced by leaf slots.
pub(crate) struct Directory<T> {
    root: [AtomicPtr<MidSegment<T>>; SEGMENT_FANOUT],
}

impl<T> Directory<T> {
    pub(crate) fn new() -> Self {
        Self {
            root: array::from_fn(|_| AtomicPtr::new(core::ptr::null_mut())),
        }
    }

    /// Per-level indices of `bucket`, most significant digit first.
    #[inline]
    fn digits(bucket: u64) -> [usize; SEGMENT_LEVELS as usize] {
        debug_assert!(bucket < DIRECTORY_CAPACITY);
        [
            (bucket >> (3 * DIGIT_BITS) & DIGIT_MASK) as usize,
            (bucket >> (2 * DIGIT_BITS) & DIGIT_MASK) as usize,
            (bucket >> DIGIT_BITS & DIGIT_MASK) as usize,
            (bucket & DIGIT_MASK) as usize,
        ]
    }

    /// The anchor published for `bucket`, or null while the bucket is
    /// uninitialized or its directory path unallocated.
    pub(crate) fn lookup(&self, bucket: u64) -> *mut T {
        let [d1, d2, d3, d4] = Self::digits(bucket);
        let mid = self.root[d1].load(Ordering::Acquire);
        if mid.is_null() {
            return core::ptr::null_mut();
        }
        // SAFETY: non-null interior arrays are immutable once installed and
        // live until the directory drops.
        let sub = unsafe { &(*mid)[d2] }.load(Ordering::Acquire);
        if sub.is_null() {
            return core::ptr::null_mut();
        }
        let leaf = unsafe { &(*sub)[d3] }.load(Ordering::Acquire);
        if leaf.is_null() {
            return core::ptr::null_mut();
        }
        unsafe { &(*leaf)[d4] }.load(Ordering::Acquire)
    }

    /// The leaf slot for `bucket`, allocating the path down to it on demand.
    pub(crate) fn slot(&self, bucket: u64) -> &AtomicPtr<T> {
        let [d1, d2, d3, d4] = Self::digits(bucket);
        let mid = descend(&self.root[d1], null_array);
        // SAFETY: as in `lookup`, installed arrays are immutable and outlive
        // every caller holding `&self`.
        let sub = descend(unsafe { &(*mid)[d2] }, null_array);
        let leaf = descend(unsafe { &(*sub)[d3] }, null_array);
        unsafe { &(*leaf)[d4] }
    }
}

impl<T> Drop for Directory<T> {
    fn drop(&mut self) {
        // Frees the arrays only; anchor nodes belong to the ordered list.
        for mid_slot in &self.root {
            let mid = mid_slot.load(Ordering::Relaxed);
            if mid.is_null() {
                continue;
            }
            // SAFETY: exclusive access; each array was installed exactly once
            // via `Box::into_raw`.
            let mid = unsafe { Box::from_raw(mid) };
            for sub_slot in mid.iter() {
                let sub = sub_slot.load(Ordering::Relaxed);
                if sub.is_null() {
                    continue;
                }
                let sub = unsafe { Box::from_raw(sub) };
                for leaf_slot in sub.iter() {
                    let leaf = leaf_slot.load(Ordering::Relaxed);
                    if !leaf.is_null() {
                        unsafe { drop(Box::from_raw(leaf)) };
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digit_decomposition_is_msb_first() {
        assert_eq!(Directory::<u32>::digits(0), [0, 0, 0, 0]);
        assert_eq!(Directory::<u32>::digits(63), [0, 0, 0, 63]);
        assert_eq!(Directory::<u32>::digits(64), [0, 0, 1, 0]);
        assert_eq!(Directory::<u32>::digits(64 * 64), [0, 1, 0, 0]);
        assert_eq!(
            Directory::<u32>::digits(DIRECTORY_CAPACITY - 1),
            [63, 63, 63, 63]
        );
    }

    #[test]
    fn slot_is_stable_and_lookup_agrees() {
        let dir = Directory::<u32>::new();
        assert!(dir.lookup(1234).is_null());

        let value = Box::into_raw(Box::new(7u32));
        dir.slot(1234).store(value, Ordering::Release);

        assert_eq!(dir.lookup(1234), value);
        assert_eq!(dir.slot(1234).load(Ordering::Acquire), value);
        // A neighbouring bucket in the same leaf stays untouched.
        assert!(dir.lookup(1235).is_null());

        unsafe { drop(Box::from_raw(value)) };
    }

    #[test]
    fn distant_buckets_use_distinct_leaves() {
        let dir = Directory::<u32>::new();
        let a = dir.slot(0) as *const _;
        let b = dir.slot(DIRECTORY_CAPACITY - 1) as *const _;
        assert_ne!(a, b);
    }
}
