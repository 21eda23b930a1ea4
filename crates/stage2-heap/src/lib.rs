//! Heap manager for the stage-2 boot runtime.
//!
//! The stage runs before any kernel, on a single core, without virtual memory
//! and without a host allocator. This crate manages the one heap it has: a
//! contiguous arena whose bounds come from the linker script. All bookkeeping
//! lives inside the arena itself.
//!
//! # Contents
//!
//! - [`FirstFitHeap`]: first-fit allocator over an address-ordered free list
//!   with alignment support and coalescing on free
//! - [`LockedHeap`]: spin-locked wrapper implementing
//!   [`GlobalAlloc`](core::alloc::GlobalAlloc)
//! - [`mem::copy`]: forward byte copy used by the rest of the stage
//!
//! # Usage Example
//!
//! ```rust
//! use stage2_heap::FirstFitHeap;
//!
//! let mut arena = vec![0u8; 1024];
//! let range = arena.as_mut_ptr_range();
//!
//! let mut heap = FirstFitHeap::new();
//! unsafe { heap.init(range.start, range.end) }.unwrap();
//!
//! let ptr = heap.alloc_aligned(64, 32).unwrap();
//! assert_eq!(ptr.addr() % 32, 0);
//!
//! unsafe {
//!     heap.free(ptr);
//! }
//! assert_eq!(heap.free_blocks().count(), 1);
//! ```
//!
//! # Contract
//!
//! The heap trusts its caller. Freeing a pointer that did not come from the
//! same heap, freeing twice, or passing an alignment that is not a power of
//! two is undefined behaviour; the `unsafe` operations document what the
//! caller has to uphold. Allocation failures are reported as `None` only,
//! without telling "out of memory" and "invalid request" apart.
//!
//! # Logging
//!
//! Diagnostics go through the [`log`] facade. The logger installed by the
//! stage must not allocate from the heap it is observing.

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod error;
mod first_fit;
mod locked;
pub mod mem;

pub use self::{
    error::InitError,
    first_fit::{FirstFitHeap, FreeBlocks, GRANULE, HEADER_SIZE, MIN_FREE_BLOCK_SIZE},
    locked::LockedHeap,
};
