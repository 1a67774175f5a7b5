//! Lock-free concurrent hash map built on a split-ordered list, with
//! hazard-pointer memory reclamation from [`petek`].
//!
//! All items live in one sorted lock-free linked list; logical buckets are
//! runs of that list headed by anchor nodes that a lazily allocated radix
//! directory locates in O(1) expected time. Growing the table only doubles a
//! bucket-count exponent: no item ever moves, the next anchor splits a run
//! in place. Insertion, lookup and removal are CAS-driven and non-blocking.
//!
//! # Example
//!
//! ```rust
//! use petek_map::SplitOrderedMap;
//!
//! let map = SplitOrderedMap::new();
//! assert!(map.insert("a", 1));
//! assert!(!map.insert("a", 2)); // overwrite, key already present
//! assert_eq!(map.get(&"a"), Some(2));
//! assert!(map.remove(&"a"));
//! assert!(map.is_empty());
//! ```

#![warn(missing_docs)]
#![no_std]

extern crate alloc;

mod atomic;
mod directory;
mod map;

pub use map::SplitOrderedMap;
