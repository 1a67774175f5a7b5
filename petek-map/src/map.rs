//! Split-ordered lock-free hash map.
//!
//! Every item lives in one global singly linked list kept sorted by the
//! bit-reversed image of its hash. Each logical bucket is a contiguous run of
//! that list headed by a keyless anchor node, so doubling the bucket count
//! never moves an item: the new anchor simply splits an existing run where
//! the extra hash bit separates it. Removal is Harris-style, a mark on the
//! victim's next pointer followed by a physical unlink that any later walk
//! may finish. Freed nodes go through the hazard-pointer reclaimer, never
//! directly to the allocator.

use alloc::boxed::Box;
use core::borrow::Borrow;
use core::cmp;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use foldhash::fast::FixedState;
use petek::HazardScope;

use crate::atomic::{Marked, MarkedAtomic};
use crate::directory::{Directory, DIRECTORY_CAPACITY};

const MSB: u64 = 1 << 63;

/// Largest bucket-count exponent the directory can address.
const MAX_EXPONENT: usize = DIRECTORY_CAPACITY.trailing_zeros() as usize;

/// Sort rank of a regular node. Forcing the top hash bit before reversing
/// sets the low rank bit, so regular nodes always sort strictly after the
/// anchor of their bucket.
#[inline]
fn regular_rank(hash: u64) -> u64 {
    (hash | MSB).reverse_bits()
}

/// Sort rank of a bucket anchor; even, and a prefix of every rank in the
/// bucket's run.
#[inline]
fn anchor_rank(bucket: u64) -> u64 {
    bucket.reverse_bits()
}

/// The bucket whose run `bucket` splits off of: the index with its most
/// significant set bit cleared.
#[inline]
fn parent_bucket(bucket: u64) -> u64 {
    debug_assert!(bucket > 0);
    bucket & !(MSB >> bucket.leading_zeros())
}

/// A list node. Anchors carry no key and a null value pointer; regular nodes
/// own their key and a heap value that can be swapped out on overwrite.
struct Node<K, V> {
    hash: u64,
    rank: u64,
    key: Option<K>,
    value: AtomicPtr<V>,
    next: MarkedAtomic<Node<K, V>>,
}

impl<K, V> Node<K, V> {
    fn anchor(bucket: u64) -> Self {
        Self {
            hash: bucket,
            rank: anchor_rank(bucket),
            key: None,
            value: AtomicPtr::new(ptr::null_mut()),
            next: MarkedAtomic::null(),
        }
    }

    fn regular(hash: u64, key: K, value: V) -> Self {
        Self {
            hash,
            rank: regular_rank(hash),
            key: Some(key),
            value: AtomicPtr::new(Box::into_raw(Box::new(value))),
            next: MarkedAtomic::null(),
        }
    }

    #[inline]
    fn is_anchor(&self) -> bool {
        self.rank & 1 == 0
    }
}

impl<K, V> Drop for Node<K, V> {
    fn drop(&mut self) {
        let value = *self.value.get_mut();
        if !value.is_null() {
            // SAFETY: dropping with exclusive access; the value allocation
            // belongs to this node alone.
            unsafe { drop(Box::from_raw(value)) };
        }
    }
}

/// A list position to search for: a sort rank plus, for regular targets, the
/// key that breaks rank ties.
struct Probe<'a, Q: ?Sized> {
    rank: u64,
    key: Option<&'a Q>,
}

/// Where `node` sorts relative to `probe`. Two anchors can only tie on rank
/// when they stand for the same bucket, so a missing key compares equal.
fn position<K, V, Q>(node: &Node<K, V>, probe: &Probe<'_, Q>) -> cmp::Ordering
where
    K: Borrow<Q>,
    Q: Ord + ?Sized,
{
    node.rank
        .cmp(&probe.rank)
        .then_with(|| match (&node.key, probe.key) {
            (Some(key), Some(target)) => key.borrow().cmp(target),
            _ => cmp::Ordering::Equal,
        })
}

/// Lock-free hash map based on a split-ordered list.
///
/// Insertion, lookup and removal are non-blocking; the table grows by
/// doubling a bucket-count exponent whenever it is more than half full,
/// without rehashing or moving any item. [`len`](Self::len) is eventually
/// consistent: it is updated after an operation's linearizing CAS, so a
/// racing reader may observe either side of an in-flight operation.
pub struct SplitOrderedMap<K, V, S = FixedState> {
    directory: Directory<Node<K, V>>,
    /// Bucket count is `1 << exponent`; grows monotonically.
    exponent: AtomicUsize,
    len: AtomicUsize,
    hasher: S,
}

impl<K, V> SplitOrderedMap<K, V, FixedState>
where
    K: Hash + Ord + 'static,
    V: Clone + 'static,
{
    /// Creates an empty map with two buckets.
    pub fn new() -> Self {
        Self::with_hasher(FixedState::default())
    }

    /// Creates an empty map sized so `capacity` items fit at the growth
    /// threshold. Buckets are still materialized lazily.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, FixedState::default())
    }
}

impl<K, V, S> SplitOrderedMap<K, V, S>
where
    K: Hash + Ord + 'static,
    V: Clone + 'static,
    S: BuildHasher,
{
    /// Creates an empty map with a custom hasher.
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(0, hasher)
    }

    /// Creates an empty map with a custom hasher and a capacity hint.
    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        let mut exponent = 1usize;
        while exponent < MAX_EXPONENT && (1usize << exponent) < capacity.saturating_mul(2) {
            exponent += 1;
        }

        let map = Self {
            directory: Directory::new(),
            exponent: AtomicUsize::new(exponent),
            len: AtomicUsize::new(0),
            hasher,
        };

        // Bucket 0's anchor heads the list and exists for the whole lifetime
        // of the table; every other anchor descends from it.
        let head = Box::into_raw(Box::new(Node::anchor(0)));
        map.directory.slot(0).store(head, Ordering::Release);
        map
    }

    /// Number of items, eventually consistent under concurrency.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// True if the map holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current logical bucket count.
    pub fn bucket_count(&self) -> usize {
        1 << self.exponent.load(Ordering::Acquire)
    }

    /// The map's build hasher.
    pub fn hasher(&self) -> &S {
        &self.hasher
    }

    /// Inserts `value` under `key`, overwriting any previous value.
    ///
    /// Returns `true` if the key was absent, `false` if an existing value was
    /// replaced. Only a fresh insertion counts toward [`len`](Self::len).
    pub fn insert(&self, key: K, value: V) -> bool {
        let hash = self.hasher.hash_one(&key);
        let node = Box::into_raw(Box::new(Node::regular(hash, key, value)));
        let scope = petek::enter();
        let anchor = self.anchor_for(hash, &scope);
        // SAFETY: the node is freshly allocated and unpublished.
        unsafe { self.insert_regular(anchor, node, &scope) }
    }

    /// Returns a copy of the value stored under `key`.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Ord + ?Sized,
    {
        let hash = self.hasher.hash_one(key);
        let scope = petek::enter();
        let anchor = self.anchor_for(hash, &scope);
        let probe = Probe {
            rank: regular_rank(hash),
            key: Some(key),
        };
        let (_prev, cur, found) = self.search(anchor, &probe, &scope);
        if !found {
            return None;
        }
        // The copy must be taken while slot 0 still protects the node; after
        // the scope drops the node may be unlinked and freed at any time.
        // SAFETY: protected dereference; regular nodes keep a live value.
        let node = unsafe { cur.deref() };
        let value = node.value.load(Ordering::Acquire);
        Some(unsafe { (*value).clone() })
    }

    /// True if `key` is present.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Ord + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Removes `key`, returning whether it was present.
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Ord + ?Sized,
    {
        let hash = self.hasher.hash_one(key);
        let scope = petek::enter();
        let anchor = self.anchor_for(hash, &scope);
        let probe = Probe {
            rank: regular_rank(hash),
            key: Some(key),
        };

        loop {
            let (prev, cur, found) = self.search(anchor, &probe, &scope);
            if !found {
                return false;
            }
            // SAFETY: slot 0 protects `cur` since the search returned.
            let cur_node = unsafe { cur.deref() };
            let next = cur_node.next.load(Ordering::Acquire, &scope);
            if next.is_marked() {
                // Another remover got here first; rewalk to find out whether
                // an equal key (re-inserted) still exists.
                continue;
            }

            // Logical removal: set the mark without losing the successor.
            if cur_node
                .next
                .compare_exchange(next, next.marked(), Ordering::AcqRel, Ordering::Acquire, &scope)
                .is_err()
            {
                continue;
            }

            // Physical removal. If the predecessor moved on, a fresh walk
            // unlinks the node for us; the removal already took effect.
            // SAFETY: `prev` is the start anchor or protected by slot 1.
            let prev_node = unsafe { &*prev };
            if prev_node
                .next
                .compare_exchange(cur, next, Ordering::Release, Ordering::Acquire, &scope)
                .is_ok()
            {
                self.len.fetch_sub(1, Ordering::AcqRel);
                // SAFETY: the CAS above unlinked the node; sole retirement.
                unsafe { petek::retire(cur.ptr()) };
                petek::try_reclaim();
            } else {
                let _ = self.search(anchor, &probe, &scope);
            }
            return true;
        }
    }

    /// Inserts an exclusively owned regular node, or folds its value into an
    /// existing node with the same key.
    ///
    /// # Safety
    ///
    /// `new_node` must be freshly allocated, unpublished and regular.
    unsafe fn insert_regular(
        &self,
        anchor: *const Node<K, V>,
        new_node: *mut Node<K, V>,
        scope: &HazardScope,
    ) -> bool {
        // SAFETY: exclusive access to the unpublished node.
        let rank = unsafe { (*new_node).rank };

        loop {
            let (prev, cur, found) = {
                let probe = Probe {
                    rank,
                    key: unsafe { (*new_node).key.as_ref() },
                };
                self.search(anchor, &probe, scope)
            };

            if found {
                // Overwrite: move our value into the existing node and free
                // the displaced one; the exchange winner owns it. The node
                // shell never entered the list, so it is freed directly.
                // SAFETY: slot 0 protects `cur`.
                let existing = unsafe { cur.deref() };
                let fresh = unsafe { (*new_node).value.load(Ordering::Relaxed) };
                unsafe { (*new_node).value.store(ptr::null_mut(), Ordering::Relaxed) };
                let stale = existing.value.swap(fresh, Ordering::AcqRel);
                // SAFETY: regular nodes always hold a live value; the swap
                // transferred `stale` to us exclusively.
                unsafe { drop(Box::from_raw(stale)) };
                // SAFETY: unpublished, and its value pointer is now null.
                unsafe { drop(Box::from_raw(new_node)) };
                return false;
            }

            unsafe { (*new_node).next.store(cur, Ordering::Release) };
            // SAFETY: `prev` is the start anchor or protected by slot 1.
            let prev_node = unsafe { &*prev };
            let link = unsafe { Marked::from_raw(new_node) };
            if prev_node
                .next
                .compare_exchange(cur, link, Ordering::Release, Ordering::Acquire, scope)
                .is_ok()
            {
                let len = self.len.fetch_add(1, Ordering::AcqRel) + 1;
                self.maybe_grow(len);
                return true;
            }
        }
    }

    /// Doubles the bucket count once the table is more than half full.
    /// Losing the exponent CAS means another thread already grew the table.
    fn maybe_grow(&self, len: usize) {
        let exponent = self.exponent.load(Ordering::Acquire);
        if exponent < MAX_EXPONENT && len * 2 > (1usize << exponent) {
            let _ = self.exponent.compare_exchange(
                exponent,
                exponent + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    /// The anchor heading the bucket `hash` currently projects to.
    #[inline]
    fn anchor_for(&self, hash: u64, scope: &HazardScope) -> *const Node<K, V> {
        let bucket = hash & (self.bucket_count() as u64 - 1);
        self.anchor_head(bucket, scope)
    }

    fn anchor_head(&self, bucket: u64, scope: &HazardScope) -> *const Node<K, V> {
        let head = self.directory.lookup(bucket);
        if head.is_null() {
            self.initialize_bucket(bucket, scope)
        } else {
            head
        }
    }

    /// Creates the anchor for `bucket`: ensure the parent bucket exists,
    /// link a fresh anchor into the list from the parent's anchor, and only
    /// then publish it in the directory. A published slot therefore always
    /// points at an anchor that is reachable in the list.
    fn initialize_bucket(&self, bucket: u64, scope: &HazardScope) -> *const Node<K, V> {
        let parent = self.anchor_head(parent_bucket(bucket), scope);
        let slot = self.directory.slot(bucket);
        let head = slot.load(Ordering::Acquire);
        if !head.is_null() {
            return head;
        }

        let draft = Box::into_raw(Box::new(Node::anchor(bucket)));
        // SAFETY: the draft is freshly allocated and unpublished.
        match unsafe { self.insert_anchor(parent, draft, scope) } {
            Ok(()) => {
                slot.store(draft, Ordering::Release);
                draft
            }
            Err(existing) => {
                // Another thread linked this bucket's anchor first; ours was
                // never published.
                debug_assert_eq!(unsafe { (*existing).hash }, bucket);
                // SAFETY: exclusively owned, never linked.
                unsafe { drop(Box::from_raw(draft)) };
                existing
            }
        }
    }

    /// Links an anchor into the list, or reports the equivalent anchor that
    /// beat it there.
    ///
    /// # Safety
    ///
    /// `draft` must be freshly allocated, unpublished and an anchor.
    unsafe fn insert_anchor(
        &self,
        parent: *const Node<K, V>,
        draft: *mut Node<K, V>,
        scope: &HazardScope,
    ) -> Result<(), *const Node<K, V>> {
        // SAFETY: exclusive access to the unpublished draft.
        let rank = unsafe { (*draft).rank };
        let probe: Probe<'_, K> = Probe { rank, key: None };

        loop {
            let (prev, cur, found) = self.search(parent, &probe, scope);
            if found {
                return Err(cur.ptr());
            }
            unsafe { (*draft).next.store(cur, Ordering::Release) };
            // SAFETY: `prev` is the parent anchor or protected by slot 1.
            let prev_node = unsafe { &*prev };
            let link = unsafe { Marked::from_raw(draft) };
            if prev_node
                .next
                .compare_exchange(cur, link, Ordering::Release, Ordering::Acquire, scope)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Walks from `start` to the first node sorting at or past `probe`.
    ///
    /// Returns the predecessor, the node reached (null at end of list) and
    /// whether it matches the probe exactly. On return slot 0 protects the
    /// reached node and slot 1 its predecessor. Marked nodes met on the way
    /// are unlinked, retired and counted out; any CAS interference restarts
    /// the walk from `start`.
    fn search<'g, Q>(
        &self,
        start: *const Node<K, V>,
        probe: &Probe<'_, Q>,
        scope: &'g HazardScope,
    ) -> (*const Node<K, V>, Marked<'g, Node<K, V>>, bool)
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        'restart: loop {
            let mut prev = start;
            // SAFETY: `start` is an anchor; anchors live as long as the map.
            let mut cur = unsafe { (*prev).next.load(Ordering::Acquire, scope) };

            loop {
                scope.protect(0, cur.ptr());
                // Re-validate after publishing the hazard: if `prev` still
                // links to `cur`, no reclaimer scan that could free `cur`
                // predates the publication.
                // SAFETY: `prev` is `start` or protected by slot 1.
                if unsafe { (*prev).next.load(Ordering::Acquire, scope) } != cur {
                    continue 'restart;
                }
                if cur.is_null() {
                    return (prev, cur, false);
                }

                // SAFETY: protected by slot 0 and re-validated above.
                let cur_node = unsafe { cur.deref() };
                let next = cur_node.next.load(Ordering::Acquire, scope);
                if next.is_marked() {
                    // Finish another thread's removal: swing `prev` past the
                    // marked node, then retire it.
                    let prev_node = unsafe { &*prev };
                    if prev_node
                        .next
                        .compare_exchange(
                            cur,
                            next.unmarked(),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                            scope,
                        )
                        .is_err()
                    {
                        continue 'restart;
                    }
                    if !cur_node.is_anchor() {
                        self.len.fetch_sub(1, Ordering::AcqRel);
                    }
                    // SAFETY: the CAS above unlinked the node; this is its
                    // sole retirement.
                    unsafe { petek::retire(cur.ptr()) };
                    petek::try_reclaim();
                    cur = next.unmarked();
                    continue;
                }

                if unsafe { (*prev).next.load(Ordering::Acquire, scope) } != cur {
                    continue 'restart;
                }
                match position(cur_node, probe) {
                    cmp::Ordering::Less => {}
                    ordering => return (prev, cur, ordering == cmp::Ordering::Equal),
                }

                // Advance. Rotate the hazards through slot 2 so the node
                // becoming `prev` is protected at every instant of the swap.
                let hp0 = scope.protected(0);
                let hp1 = scope.protected(1);
                scope.protect(2, hp0);
                scope.protect(0, hp1);
                scope.protect(1, hp0);
                scope.clear(2);

                prev = cur.ptr();
                cur = next;
            }
        }
    }
}

impl<K, V> Default for SplitOrderedMap<K, V, FixedState>
where
    K: Hash + Ord + 'static,
    V: Clone + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> fmt::Debug for SplitOrderedMap<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitOrderedMap")
            .field("len", &self.len.load(Ordering::Relaxed))
            .field(
                "bucket_count",
                &(1usize << self.exponent.load(Ordering::Relaxed)),
            )
            .finish_non_exhaustive()
    }
}

// SAFETY: all shared mutation goes through atomics; keys and values cross
// threads by move on insert and by clone on lookup.
unsafe impl<K: Send + Sync, V: Send + Sync, S: Send> Send for SplitOrderedMap<K, V, S> {}
// SAFETY: as above; the hasher is only read through `&self`.
unsafe impl<K: Send + Sync, V: Send + Sync, S: Sync> Sync for SplitOrderedMap<K, V, S> {}

impl<K, V, S> Drop for SplitOrderedMap<K, V, S> {
    fn drop(&mut self) {
        // Exclusive access: free every node still linked, marked or not.
        // Nodes unlinked earlier were retired and are freed by the reclaimer.
        let scope = petek::enter();
        let mut cur = self.directory.lookup(0);
        while !cur.is_null() {
            // SAFETY: no other thread can reach the list during drop.
            let next = unsafe { (*cur).next.load(Ordering::Acquire, &scope) };
            unsafe { drop(Box::from_raw(cur)) };
            cur = next.unmarked().ptr();
        }
    }
}
