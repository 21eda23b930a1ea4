//! Global allocator adapter.
//!
//! [`LockedHeap`] puts a [`FirstFitHeap`] behind a spin lock so that it can
//! be stored in a `static` and registered as the `#[global_allocator]`:
//!
//! ```rust,ignore
//! use stage2_heap::LockedHeap;
//!
//! #[global_allocator]
//! static HEAP: LockedHeap = LockedHeap::empty();
//!
//! unsafe extern "C" {
//!     static mut __heap_start: u8;
//!     static mut __heap_end: u8;
//! }
//!
//! pub fn init_heap() {
//!     unsafe {
//!         HEAP.init(&raw mut __heap_start, &raw mut __heap_end)
//!             .expect("linker script provides a usable heap");
//!     }
//! }
//! ```
//!
//! The lock only makes the heap shareable. It does not make it reentrant:
//! allocating from an interrupt handler that fired while the lock is held
//! spins forever.

use core::alloc::{GlobalAlloc, Layout};

use spin::{Mutex, MutexGuard};

use crate::{FirstFitHeap, InitError};

/// A [`FirstFitHeap`] that can be shared through a `static`.
pub struct LockedHeap {
    heap: Mutex<FirstFitHeap>,
}

impl Default for LockedHeap {
    fn default() -> Self {
        Self::empty()
    }
}

impl LockedHeap {
    /// Creates a locked heap without an arena.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            heap: Mutex::new(FirstFitHeap::new()),
        }
    }

    /// Hands the arena `start..end` over to the heap.
    ///
    /// # Errors
    ///
    /// See [`FirstFitHeap::init`].
    ///
    /// # Safety
    ///
    /// Same requirements as [`FirstFitHeap::init`].
    pub unsafe fn init(&self, start: *mut u8, end: *mut u8) -> Result<(), InitError> {
        unsafe { self.heap.lock().init(start, end) }
    }

    /// Locks the heap for direct use.
    pub fn lock(&self) -> MutexGuard<'_, FirstFitHeap> {
        self.heap.lock()
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.heap
            .lock()
            .alloc_aligned(layout.size(), layout.align())
            .unwrap_or_default()
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // The header in front of `ptr` records the block size.
        unsafe { self.heap.lock().free(ptr) }
    }
}
