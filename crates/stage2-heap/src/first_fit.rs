//! First-fit free list heap.
//!
//! This module provides the allocator used by the stage-2 runtime. It manages
//! a single arena handed over once at startup and keeps all of its
//! bookkeeping inside that arena.
//!
//! # Algorithm
//!
//! The heap uses a **first-fit** allocation strategy combined with an
//! **address-ordered free list**:
//!
//! - **Free List**: Free blocks form a singly-linked list sorted by address.
//!   Each free block stores its size and the address of the next free block in
//!   its own first bytes.
//! - **Allocation**: Walks the list from the lowest address and takes the
//!   first block that still has room for the request after reserving a header
//!   and honouring the alignment. Leftovers on either side of the allocation
//!   become new free blocks when they are large enough to stand alone.
//! - **Deallocation**: Recovers the block bounds from the header in front of
//!   the pointer, splices the block back into the list at its address and
//!   merges it with adjacent neighbours.
//!
//! # Memory Layout
//!
//! All block addresses and sizes are multiples of [`GRANULE`]. A free block
//! starts with a `FreeBlock` node. An allocated block carries an
//! `AllocHeader` in the granule right before the returned pointer:
//!
//! ```text
//! Allocated Block Layout:
//! ┌──────────────────┬───────────────────────┬───────────────────┬────────┐
//! │ padding          │ AllocHeader           │ payload           │ tail   │
//! │ (start_off bytes)│ ┌──────┬────────────┐ │                   │        │
//! │                  │ │ size │ start_off  │ │                   │        │
//! │                  │ └──────┴────────────┘ │                   │        │
//! └──────────────────┴───────────────────────┴───────────────────┴────────┘
//! ^ block start                              ^ returned pointer
//! ```
//!
//! Padding and tail are only part of the allocation when they are too small
//! to form a free block of their own ([`MIN_FREE_BLOCK_SIZE`]). There is no
//! allocated/free tag: a block is free exactly when it is reachable from the
//! list head.
//!
//! # Performance Characteristics
//!
//! - **Allocation**: O(n) where n is the number of free blocks
//! - **Deallocation**: O(n) where n is the number of free blocks
//! - **Memory Overhead**: 16 bytes per allocation for the header
//!
//! In debug builds the whole free list is re-validated after every mutation.

use core::{marker::PhantomData, ops::Range, ptr};

use snafu::ensure;

use crate::error::{AlreadyInitializedSnafu, ArenaTooSmallSnafu, EmptyArenaSnafu, InitError};

/// A node of the free list, stored at the start of the free block it
/// describes.
#[repr(C, align(16))]
#[derive(Debug)]
struct FreeBlock {
    /// Size of the free block in bytes, including this node
    size: usize,
    /// Next free block at a higher address, or null if this is the last one
    next: *mut Self,
}

/// Bookkeeping stored right before every pointer handed out by the heap.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy)]
struct AllocHeader {
    /// Total bytes reserved by the allocation, from the true block start to
    /// the block end
    size: usize,
    /// Distance from this header back to the true block start
    start_off: usize,
}

/// Unit of every block address and block size managed by the heap.
pub const GRANULE: usize = size_of::<FreeBlock>();

/// Bytes reserved in front of every allocation for its header.
pub const HEADER_SIZE: usize = size_of::<AllocHeader>();

/// Smallest span that is kept as a standalone free block.
///
/// Anything smaller cannot hold a header plus one granule of payload, so it
/// stays attached to the neighbouring allocation instead.
pub const MIN_FREE_BLOCK_SIZE: usize = HEADER_SIZE + GRANULE;

const _: () = assert!(size_of::<FreeBlock>() == align_of::<FreeBlock>());
const _: () = assert!(HEADER_SIZE == GRANULE);

impl FreeBlock {
    /// Writes a new unlinked free block at `block_ptr`.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `block_ptr` is aligned to [`GRANULE`]
    /// - `size` is a multiple of [`GRANULE`] and at least
    ///   [`MIN_FREE_BLOCK_SIZE`]
    /// - The memory region `block_ptr..block_ptr + size` is inside the arena
    ///   and not used by any allocation
    unsafe fn new(block_ptr: *mut u8, size: usize) -> *mut Self {
        #[expect(clippy::cast_ptr_alignment)]
        let block = block_ptr.cast::<Self>();
        debug_assert!(block.is_aligned(), "free block must be granule aligned");
        debug_assert!(
            size >= MIN_FREE_BLOCK_SIZE && size.is_multiple_of(GRANULE),
            "invalid free block size: {size}"
        );

        unsafe {
            block.write(Self {
                size,
                next: ptr::null_mut(),
            });
        }

        block
    }

    fn start(block: *mut Self) -> *mut u8 {
        block.cast()
    }

    /// Returns a pointer one byte past the end of the block.
    ///
    /// # Safety
    ///
    /// `block` must point to a valid `FreeBlock`.
    unsafe fn end(block: *mut Self) -> *mut u8 {
        unsafe { Self::start(block).map_addr(|addr| addr + (*block).size) }
    }

    /// Links `next_block` after `prev_block`, merging the two if they touch.
    ///
    /// Returns `prev_block`, or `next_block` if `prev_block` is null.
    ///
    /// # Safety
    ///
    /// Both pointers must be null or point to valid `FreeBlock`s, and
    /// `prev_block` must lie below `next_block`.
    unsafe fn concat(prev_block: *mut Self, next_block: *mut Self) -> *mut Self {
        if prev_block.is_null() {
            return next_block;
        }
        if next_block.is_null() {
            unsafe {
                (*prev_block).next = ptr::null_mut();
            }
            return prev_block;
        }

        unsafe {
            if ptr::eq(Self::end(prev_block), Self::start(next_block)) {
                (*prev_block).size += (*next_block).size;
                (*prev_block).next = (*next_block).next;
            } else {
                (*prev_block).next = next_block;
            }
        }

        prev_block
    }

    /// Finds where a payload of `size` bytes aligned to `align` would start
    /// inside `block`, leaving room for the header in front of it.
    ///
    /// Returns `None` if the aligned usable space of the block is smaller than
    /// `size`.
    ///
    /// # Safety
    ///
    /// `block` must point to a valid `FreeBlock`, `size` and `align` must be
    /// non-zero multiples of [`GRANULE`].
    unsafe fn aligned_payload(block: *mut Self, size: usize, align: usize) -> Option<*mut u8> {
        let start = Self::start(block);
        let end = unsafe { Self::end(block) };
        let payload = start
            .addr()
            .checked_add(HEADER_SIZE)?
            .checked_next_multiple_of(align)?;
        let usable = end.addr().saturating_sub(payload);
        (usable >= size).then(|| start.with_addr(payload))
    }
}

/// A first-fit heap over one contiguous arena.
///
/// The free list is kept sorted by address so that neighbours are known at
/// insertion time and adjacent free blocks are merged immediately on every
/// [`free`](Self::free).
///
/// # Thread Safety
///
/// The heap is `Send` but not `Sync`. Every mutating operation takes
/// `&mut self`; wrap it in [`LockedHeap`](crate::LockedHeap) to share it
/// through a `static`.
pub struct FirstFitHeap {
    free_list_head: *mut FreeBlock,
    arena: Range<usize>,
}

unsafe impl Send for FirstFitHeap {}

impl Default for FirstFitHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl FirstFitHeap {
    /// Creates a heap without an arena.
    ///
    /// Every allocation fails until [`init`](Self::init) succeeds.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            free_list_head: ptr::null_mut(),
            arena: 0..0,
        }
    }

    /// Hands the arena `start..end` over to the heap.
    ///
    /// The arena is trimmed inward to [`GRANULE`] boundaries and becomes a
    /// single free block.
    ///
    /// # Errors
    ///
    /// - [`InitError::AlreadyInitialized`] if the heap already owns an arena
    /// - [`InitError::EmptyArena`] if `end` is not above `start`
    /// - [`InitError::ArenaTooSmall`] if less than [`MIN_FREE_BLOCK_SIZE`]
    ///   bytes remain after trimming
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - The range `start..end` is valid for reads and writes
    /// - The range is not used by anything else for as long as the heap or
    ///   any pointer it returned is alive
    pub unsafe fn init(&mut self, start: *mut u8, end: *mut u8) -> Result<(), InitError> {
        ensure!(
            self.arena.is_empty(),
            AlreadyInitializedSnafu {
                start: self.arena.start,
                end: self.arena.end,
            }
        );
        ensure!(
            start < end,
            EmptyArenaSnafu {
                start: start.addr(),
                end: end.addr(),
            }
        );

        let arena_end = end.addr() / GRANULE * GRANULE;
        let arena_start = start
            .addr()
            .checked_next_multiple_of(GRANULE)
            .unwrap_or(arena_end);
        let usable = arena_end.saturating_sub(arena_start);
        ensure!(
            usable >= MIN_FREE_BLOCK_SIZE,
            ArenaTooSmallSnafu {
                start: start.addr(),
                end: end.addr(),
                usable,
            }
        );

        self.free_list_head = unsafe { FreeBlock::new(start.with_addr(arena_start), usable) };
        self.arena = arena_start..arena_end;
        log::debug!("heap arena {arena_start:#x}..{arena_end:#x} ({usable} bytes)");

        self.debug_check();
        Ok(())
    }

    /// Returns the trimmed arena managed by the heap.
    ///
    /// The range is empty before [`init`](Self::init).
    #[must_use]
    pub fn arena(&self) -> Range<usize> {
        self.arena.clone()
    }

    /// Iterates over the free blocks in address order.
    #[must_use]
    pub fn free_blocks(&self) -> FreeBlocks<'_> {
        FreeBlocks {
            current: self.free_list_head,
            _heap: PhantomData,
        }
    }

    /// Total bytes held by free blocks, including their node headers.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.free_blocks().map(|block| block.len()).sum()
    }

    /// Allocates `size` bytes aligned to the pointer width.
    ///
    /// See [`alloc_aligned`](Self::alloc_aligned).
    pub fn alloc(&mut self, size: usize) -> Option<*mut u8> {
        self.alloc_aligned(size, size_of::<usize>())
    }

    /// Allocates `size` bytes whose address is a multiple of `align`.
    ///
    /// Returns `None` if `size` or `align` is zero, or if no free block has
    /// enough aligned space left. The returned memory is not initialized.
    ///
    /// `align` must be a power of two. Other values trip a debug assertion;
    /// release builds round them up to a multiple of [`GRANULE`] and align to
    /// that instead.
    pub fn alloc_aligned(&mut self, size: usize, align: usize) -> Option<*mut u8> {
        if size == 0 || align == 0 {
            return None;
        }
        debug_assert!(
            align.is_power_of_two(),
            "alignment must be a power of two: {align}"
        );

        let size = size.checked_next_multiple_of(GRANULE)?;
        let align = align.checked_next_multiple_of(GRANULE)?;

        let mut prev_block = ptr::null_mut();
        let mut current_block = self.free_list_head;
        while !current_block.is_null() {
            unsafe {
                if let Some(payload) = FreeBlock::aligned_payload(current_block, size, align) {
                    self.carve(prev_block, current_block, payload, size);
                    self.debug_check();
                    return Some(payload);
                }
                prev_block = current_block;
                current_block = (*current_block).next;
            }
        }

        log::trace!("no free block fits {size} bytes aligned to {align}");
        None
    }

    /// Returns an allocation to the heap.
    ///
    /// The block is put back into the free list at its address and merged
    /// with the free blocks right before and after it. A null `ptr` is
    /// ignored.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `ptr` is null or was returned by [`alloc`](Self::alloc) or
    ///   [`alloc_aligned`](Self::alloc_aligned) on this heap
    /// - `ptr` has not been freed before
    /// - The memory behind `ptr` is not used anymore
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        unsafe {
            #[expect(clippy::cast_ptr_alignment)]
            let header_ptr = ptr.map_addr(|addr| addr - HEADER_SIZE).cast::<AllocHeader>();
            // The new free block may overwrite the header, keep a copy.
            let header = header_ptr.read();
            let block_start = header_ptr
                .cast::<u8>()
                .map_addr(|addr| addr - header.start_off);

            let mut prev_block = ptr::null_mut();
            let mut next_block = self.free_list_head;
            while !next_block.is_null() && FreeBlock::start(next_block) < block_start {
                prev_block = next_block;
                next_block = (*next_block).next;
            }

            let block = FreeBlock::new(block_start, header.size);
            let block = FreeBlock::concat(block, next_block);
            if prev_block.is_null() {
                self.free_list_head = block;
            } else {
                FreeBlock::concat(prev_block, block);
            }
        }

        self.debug_check();
    }

    /// Takes `payload..payload + size` out of `current_block`.
    ///
    /// Leftover space behind the payload becomes a new free block taking the
    /// place of `current_block` in the list. Leftover space in front of the
    /// header keeps `current_block` alive in a shrunk form. Leftovers too
    /// small to stand alone are reserved together with the payload.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `current_block` is in the free list right after `prev_block`, or is
    ///   the list head if `prev_block` is null
    /// - `payload` was computed by [`FreeBlock::aligned_payload`] for
    ///   `current_block` and `size`
    unsafe fn carve(
        &mut self,
        prev_block: *mut FreeBlock,
        current_block: *mut FreeBlock,
        payload: *mut u8,
        size: usize,
    ) {
        unsafe {
            let block_start = FreeBlock::start(current_block);
            let block_end = FreeBlock::end(current_block);
            let next_block = (*current_block).next;
            let header = payload.map_addr(|addr| addr - HEADER_SIZE);
            let payload_end = payload.map_addr(|addr| addr + size);

            let tail = block_end.addr() - payload_end.addr();
            let (successor, reserved_end) = if tail >= MIN_FREE_BLOCK_SIZE {
                let tail_block = FreeBlock::new(payload_end, tail);
                (*tail_block).next = next_block;
                (tail_block, payload_end)
            } else {
                (next_block, block_end)
            };
            if prev_block.is_null() {
                self.free_list_head = successor;
            } else {
                (*prev_block).next = successor;
            }

            let padding = header.addr() - block_start.addr();
            let start_off = if padding >= MIN_FREE_BLOCK_SIZE {
                (*current_block).size = padding;
                let current_block = FreeBlock::concat(current_block, successor);
                if prev_block.is_null() {
                    self.free_list_head = current_block;
                } else {
                    FreeBlock::concat(prev_block, current_block);
                }
                0
            } else {
                padding
            };

            // Written last: with no padding the header overlays `current_block`.
            let reserved_start = header.addr() - start_off;
            #[expect(clippy::cast_ptr_alignment)]
            let header = header.cast::<AllocHeader>();
            header.write(AllocHeader {
                size: reserved_end.addr() - reserved_start,
                start_off,
            });
        }
    }

    fn debug_check(&self) {
        if !cfg!(debug_assertions) {
            return;
        }

        let mut prev_end = None;
        for block in self.free_blocks() {
            debug_assert!(
                self.arena.start <= block.start && block.end <= self.arena.end,
                "free block {block:#x?} outside of arena {:#x?}",
                self.arena
            );
            debug_assert!(
                block.start.is_multiple_of(GRANULE) && block.len().is_multiple_of(GRANULE),
                "free block {block:#x?} is not granule aligned"
            );
            debug_assert!(
                block.len() >= MIN_FREE_BLOCK_SIZE,
                "free block {block:#x?} is too small"
            );
            if let Some(prev_end) = prev_end {
                debug_assert!(
                    prev_end < block.start,
                    "free block {block:#x?} is out of order or adjacent to its predecessor"
                );
            }
            prev_end = Some(block.end);
        }
    }
}

/// Iterator over the free blocks of a [`FirstFitHeap`], in address order.
///
/// Yields the address range covered by each free block.
pub struct FreeBlocks<'a> {
    current: *const FreeBlock,
    _heap: PhantomData<&'a FirstFitHeap>,
}

impl Iterator for FreeBlocks<'_> {
    type Item = Range<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current.is_null() {
            return None;
        }
        let block = unsafe { &*self.current };
        let start = self.current.addr();
        self.current = block.next;
        Some(start..start + block.size)
    }
}
