//! Retirement records.

/// Type-erased destructor invoked once a retired pointer is provably
/// unreachable.
pub(crate) type DropFn = unsafe fn(*mut u8);

/// A pointer handed to the reclaimer together with its destructor.
pub(crate) struct Retired {
    pub(crate) ptr: *mut u8,
    pub(crate) drop_fn: DropFn,
}

impl Retired {
    /// Run the destructor.
    ///
    /// # Safety
    ///
    /// The pointer must no longer be reachable by any thread and must not
    /// have been freed already.
    #[inline]
    pub(crate) unsafe fn free(self) {
        // SAFETY: forwarded to the caller.
        unsafe { (self.drop_fn)(self.ptr) }
    }
}
