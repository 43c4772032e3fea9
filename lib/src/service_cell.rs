//! Cross-crate service registration.
//!
//! [`crate::klog`]'s `BACKEND: AtomicPtr<()>` is the original instance of
//! this idiom: a lower layer exposes a slot, an upper layer fills it in
//! once at boot, and everyone else calls through it without a compile-time
//! dependency in that direction. `ServiceCell<T>` is that idiom lifted into
//! a reusable type, so `mk-core` can hand a vtable of scheduler hooks down
//! to `mk-lib`'s [`crate::waitqueue::WaitQueue`] without `mk-lib` ever
//! depending on `mk-core`.

use core::sync::atomic::{AtomicPtr, Ordering};

/// A write-once slot holding a `'static` reference to a `Copy` value,
/// typically a struct of function pointers.
///
/// `register()` is expected to run exactly once, early at boot, before any
/// concurrent access to `get()` is possible; later calls silently replace
/// the previous registration (useful in tests that re-register fresh
/// hooks between cases).
pub struct ServiceCell<T: 'static> {
    slot: AtomicPtr<T>,
}

impl<T: 'static> ServiceCell<T> {
    pub const fn new() -> Self {
        Self {
            slot: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Register the service implementation.
    pub fn register(&self, value: &'static T) {
        self.slot
            .store(value as *const T as *mut T, Ordering::Release);
    }

    /// Fetch the registered service, if any.
    #[inline]
    pub fn get(&self) -> Option<&'static T> {
        let ptr = self.slot.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: only `register` ever stores into this cell, and only
            // with a `&'static T` turned back into a raw pointer.
            Some(unsafe { &*ptr })
        }
    }

    #[inline]
    pub fn is_registered(&self) -> bool {
        !self.slot.load(Ordering::Acquire).is_null()
    }
}

impl<T: 'static> Default for ServiceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the stored pointer always comes from a `&'static T`; a `T: Sync`
// bound would be ideal but would infect every call site, and in practice
// every registered service here is a small table of function pointers.
unsafe impl<T: 'static> Sync for ServiceCell<T> {}
