//! Protection tests: a published hazard must keep a retired pointer alive
//! until the slot is cleared, and never a moment less.

use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Node whose destructor is observable from the outside.
struct TracedNode {
    value: usize,
    freed: Arc<AtomicBool>,
}

impl TracedNode {
    fn alloc(value: usize, freed: Arc<AtomicBool>) -> *mut Self {
        Box::into_raw(Box::new(Self { value, freed }))
    }
}

impl Drop for TracedNode {
    fn drop(&mut self) {
        self.freed.store(true, Ordering::Release);
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn hazard_blocks_free_until_released() {
    let freed = Arc::new(AtomicBool::new(false));
    let slot = Arc::new(AtomicPtr::new(TracedNode::alloc(42, freed.clone())));
    let held = Arc::new(AtomicBool::new(false));
    let retired = Arc::new(AtomicBool::new(false));

    let reader = {
        let slot = slot.clone();
        let freed = freed.clone();
        let held = held.clone();
        let retired = retired.clone();
        thread::spawn(move || {
            let scope = petek::enter();
            let mut ptr = slot.load(Ordering::Acquire);
            loop {
                scope.protect(0, ptr);
                let again = slot.load(Ordering::Acquire);
                if again == ptr {
                    break;
                }
                ptr = again;
            }
            held.store(true, Ordering::Release);

            while !retired.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(5));
            }

            // The writer has retired the node; our hazard must be the only
            // thing keeping it alive.
            assert!(!freed.load(Ordering::Acquire), "freed under a hazard");
            assert_eq!(unsafe { (*ptr).value }, 42);
        })
    };

    let writer = {
        let slot = slot.clone();
        let held = held.clone();
        let retired = retired.clone();
        thread::spawn(move || {
            while !held.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(5));
            }
            let old = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
            unsafe { petek::retire(old) };
            petek::try_reclaim();
            retired.store(true, Ordering::Release);
            // Thread exit drains the deferred list, yielding until the
            // reader's hazard clears.
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();

    assert!(
        freed.load(Ordering::Acquire),
        "retired node not freed after every hazard cleared"
    );
}

#[test]
fn protected_readback_matches_publication() {
    let scope = petek::enter();
    let ptr = Box::into_raw(Box::new(7u32));

    scope.protect(1, ptr);
    assert_eq!(scope.protected(1), ptr as *mut u8);

    scope.clear(1);
    assert!(scope.protected(1).is_null());

    drop(scope);
    unsafe { drop(Box::from_raw(ptr)) };
}

#[test]
fn scope_drop_clears_every_slot() {
    let ptr = Box::into_raw(Box::new(0u8));
    {
        let scope = petek::enter();
        for index in 0..petek::HAZARDS_PER_THREAD {
            scope.protect(index, ptr);
        }
    }
    let scope = petek::enter();
    for index in 0..petek::HAZARDS_PER_THREAD {
        assert!(scope.protected(index).is_null());
    }
    drop(scope);
    unsafe { drop(Box::from_raw(ptr)) };
}

#[test]
#[cfg_attr(miri, ignore)]
fn slot_rotation_keeps_a_pointer_covered() {
    // Mimics a list walk's advance step: the pointer moving from slot 0 to
    // slot 1 goes through slot 2 and is published somewhere at all times.
    let freed = Arc::new(AtomicBool::new(false));
    let node = TracedNode::alloc(1, freed.clone());

    let scope = petek::enter();
    scope.protect(0, node);

    let hp0 = scope.protected(0);
    scope.protect(2, hp0);
    scope.protect(0, std::ptr::null::<TracedNode>());
    scope.protect(1, hp0);
    scope.clear(2);
    assert_eq!(scope.protected(1), node as *mut u8);

    // Retiring it now must not free it: slot 1 still publishes the pointer.
    unsafe { petek::retire(node) };
    petek::try_reclaim();
    assert!(!freed.load(Ordering::Acquire));

    drop(scope);
    petek::flush();
    assert!(freed.load(Ordering::Acquire));
}
