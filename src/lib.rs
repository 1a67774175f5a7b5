//! Petek: hazard-pointer safe memory reclamation for lock-free data
//! structures.
//!
//! Every thread owns a small fixed group of hazard slots held in a
//! process-wide registry. Publishing a pointer into a slot declares "I am
//! about to dereference this"; a pointer handed to [`retire`] is freed only
//! once no slot anywhere publishes it. Readers pay one release store plus one
//! re-validating load per protected pointer; writers batch their deferred
//! frees and scan the registry at a bounded amortized rate.
//!
//! # Example
//!
//! ```rust
//! use std::sync::atomic::{AtomicPtr, Ordering};
//!
//! let shared = AtomicPtr::new(Box::into_raw(Box::new(42u32)));
//!
//! let scope = petek::enter();
//! let mut ptr = shared.load(Ordering::Acquire);
//! loop {
//!     scope.protect(0, ptr);
//!     // Re-validate after publishing: if the pointer is still installed,
//!     // no reclaimer can free it while the slot holds it.
//!     let again = shared.load(Ordering::Acquire);
//!     if again == ptr {
//!         break;
//!     }
//!     ptr = again;
//! }
//! assert_eq!(unsafe { *ptr }, 42);
//! drop(scope);
//!
//! // Unlink, then retire. The value is freed once no slot protects it.
//! let old = shared.swap(std::ptr::null_mut(), Ordering::AcqRel);
//! unsafe { petek::retire(old) };
//! petek::try_reclaim();
//! # petek::flush();
//! ```

#![warn(missing_docs)]

extern crate alloc;

mod guard;
mod retired;
mod slot;

pub use guard::{enter, flush, retire, try_reclaim, HazardScope, HAZARDS_PER_THREAD};
