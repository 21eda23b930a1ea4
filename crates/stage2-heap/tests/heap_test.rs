#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]
#![cfg(test)]

use std::alloc::{self, Layout};

use stage2_heap::{FirstFitHeap, GRANULE, HEADER_SIZE, mem};

const ARENA_SIZE: usize = 256;
const ARENA_ALIGN: usize = 256;
const DEFAULT_ALIGN: usize = size_of::<usize>();

fn with_test_heap<F>(test_fn: F)
where
    F: FnOnce(&mut FirstFitHeap),
{
    unsafe {
        let layout = Layout::from_size_align(ARENA_SIZE, ARENA_ALIGN).unwrap();
        let arena_start = alloc::alloc(layout);
        assert!(!arena_start.is_null());
        arena_start.write_bytes(0, ARENA_SIZE);

        let mut heap = FirstFitHeap::new();
        heap.init(arena_start, arena_start.add(ARENA_SIZE)).unwrap();
        test_fn(&mut heap);

        alloc::dealloc(arena_start, layout);
    }
}

/// Number of `size` byte objects aligned to `align` that fit in the arena when
/// packed from its start.
fn max_object_count(size: usize, align: usize) -> usize {
    let size = size.next_multiple_of(GRANULE);
    let align = align.next_multiple_of(GRANULE);

    let mut offset = 0;
    let mut count = 0;
    loop {
        let end = (offset + HEADER_SIZE).next_multiple_of(align) + size;
        if end > ARENA_SIZE {
            break;
        }
        count += 1;
        offset = end;
    }
    count
}

fn fill(heap: &mut FirstFitHeap, size: usize, align: usize) -> Vec<*mut u8> {
    let count = max_object_count(size, align);
    let ptrs = (0..count)
        .map(|i| {
            heap.alloc_aligned(size, align)
                .unwrap_or_else(|| panic!("allocation failed: i={i}"))
        })
        .collect::<Vec<_>>();
    assert!(heap.alloc_aligned(size, align).is_none());
    ptrs
}

fn free_all(heap: &mut FirstFitHeap, ptrs: impl IntoIterator<Item = *mut u8>) {
    for ptr in ptrs {
        unsafe {
            heap.free(ptr);
        }
    }
}

#[test]
fn allocate_one_byte() {
    with_test_heap(|heap| {
        let ptr = heap.alloc(1).unwrap();
        assert_eq!(ptr.addr() % DEFAULT_ALIGN, 0);
    });
}

#[test]
fn allocate_128_bytes() {
    with_test_heap(|heap| {
        let ptr = heap.alloc(128).unwrap();
        assert_eq!(ptr.addr() % DEFAULT_ALIGN, 0);
    });
}

#[test]
fn allocate_zero_bytes() {
    with_test_heap(|heap| {
        assert!(heap.alloc(0).is_none());
    });
}

#[test]
fn allocate_larger_than_arena() {
    with_test_heap(|heap| {
        assert!(heap.alloc(ARENA_SIZE + 1).is_none());
    });
}

#[test]
fn allocate_arena_size_leaves_no_room_for_header() {
    with_test_heap(|heap| {
        assert!(heap.alloc(ARENA_SIZE).is_none());
    });
}

#[test]
fn allocate_max() {
    with_test_heap(|heap| {
        let ptr = heap.alloc(ARENA_SIZE - HEADER_SIZE).unwrap();
        assert_eq!(ptr.addr() % DEFAULT_ALIGN, 0);
        assert_eq!(heap.free_bytes(), 0);
    });
}

#[test]
fn fill_with_one_byte_objects() {
    with_test_heap(|heap| {
        let ptrs = fill(heap, 1, DEFAULT_ALIGN);
        assert_eq!(ptrs.len(), 8);
    });
}

#[test]
fn free_then_alloc_reuses_address() {
    with_test_heap(|heap| unsafe {
        let ptr1 = heap.alloc(1).unwrap();
        heap.free(ptr1);
        let ptr2 = heap.alloc(1).unwrap();
        assert_eq!(ptr1, ptr2);
    });
}

#[test]
fn free_fifth_of_eight_and_reuse() {
    with_test_heap(|heap| unsafe {
        let ptrs = (0..8).map(|_| heap.alloc(1).unwrap()).collect::<Vec<_>>();
        assert!(heap.alloc(1).is_none());

        heap.free(ptrs[4]);
        assert_eq!(heap.alloc(1), Some(ptrs[4]));
        assert!(heap.alloc(1).is_none());
    });
}

#[test]
fn fragmented_hole_only_fits_same_size() {
    with_test_heap(|heap| unsafe {
        let ptrs = fill(heap, 1, DEFAULT_ALIGN);
        assert!(ptrs.len() >= 3);

        heap.free(ptrs[ptrs.len() / 2]);

        assert!(heap.alloc(GRANULE + 1).is_none());
        assert_eq!(heap.alloc(1), Some(ptrs[ptrs.len() / 2]));
    });
}

#[test]
fn zero_alignment() {
    with_test_heap(|heap| {
        assert!(heap.alloc_aligned(1, 0).is_none());
        assert!(heap.alloc_aligned(0, 0).is_none());
    });
}

#[test]
fn fill_with_byte_aligned_objects() {
    with_test_heap(|heap| {
        let ptrs = fill(heap, 1, 1);
        assert_eq!(ptrs.len(), 8);
    });
}

#[test]
fn fill_with_64_byte_aligned_objects() {
    with_test_heap(|heap| {
        let ptrs = fill(heap, 1, 64);
        assert_eq!(ptrs.len(), 3);
        for ptr in &ptrs {
            assert_eq!(ptr.addr() % 64, 0);
        }

        free_all(heap, ptrs);
        assert_eq!(heap.free_blocks().count(), 1);
    });
}

#[test]
fn alignment_beyond_arena() {
    with_test_heap(|heap| {
        assert!(
            heap.alloc_aligned(ARENA_SIZE - HEADER_SIZE, ARENA_SIZE)
                .is_none()
        );
    });
}

#[test]
fn free_null() {
    with_test_heap(|heap| unsafe {
        heap.free(std::ptr::null_mut());
        assert_eq!(heap.free_bytes(), ARENA_SIZE);
    });
}

#[test]
fn refill_after_freeing_in_order() {
    with_test_heap(|heap| {
        let ptrs = fill(heap, 1, DEFAULT_ALIGN);
        free_all(heap, ptrs);
        fill(heap, 1, DEFAULT_ALIGN);
    });
}

#[test]
fn refill_after_freeing_in_reverse() {
    with_test_heap(|heap| {
        let ptrs = fill(heap, 1, DEFAULT_ALIGN);
        free_all(heap, ptrs.into_iter().rev());
        fill(heap, 1, DEFAULT_ALIGN);
    });
}

#[test]
fn refill_after_freeing_alternating() {
    with_test_heap(|heap| {
        let ptrs = fill(heap, 1, DEFAULT_ALIGN);
        let even = ptrs.iter().copied().step_by(2);
        let odd = ptrs.iter().copied().skip(1).step_by(2);
        free_all(heap, even.chain(odd));
        fill(heap, 1, DEFAULT_ALIGN);
    });
}

#[test]
fn refill_with_larger_objects() {
    with_test_heap(|heap| {
        let ptrs = fill(heap, 1, DEFAULT_ALIGN);
        free_all(heap, ptrs);

        let ptrs = fill(heap, GRANULE + 1, DEFAULT_ALIGN);
        assert_eq!(ptrs.len(), 5);
    });
}

#[test]
fn whole_arena_after_mixed_frees() {
    with_test_heap(|heap| {
        let small = heap.alloc(1).unwrap();
        let aligned = heap.alloc_aligned(1, 64).unwrap();
        let wide = heap.alloc(40).unwrap();
        let padded = heap.alloc_aligned(8, 32).unwrap();

        free_all(heap, [aligned, padded, small, wide]);

        assert_eq!(heap.free_blocks().count(), 1);
        assert!(heap.alloc(ARENA_SIZE - HEADER_SIZE).is_some());
    });
}

#[test]
fn allocations_do_not_overlap() {
    with_test_heap(|heap| unsafe {
        let sizes = [1, 20, 7, 33];
        let ptrs = sizes
            .iter()
            .zip(1_u8..)
            .map(|(&size, tag)| {
                let ptr = heap.alloc(size).unwrap();
                ptr.write_bytes(tag, size);
                (ptr, size, tag)
            })
            .collect::<Vec<_>>();

        for &(ptr, size, tag) in &ptrs {
            let bytes = std::slice::from_raw_parts(ptr, size);
            assert!(bytes.iter().all(|&b| b == tag));
        }
    });
}

#[test]
fn copy_into_allocation() {
    with_test_heap(|heap| unsafe {
        let src = [0_u8, 1, 2, 3, 4, 5, 6, 7, 8, 9];
        let dst = heap.alloc(src.len()).unwrap();

        assert_eq!(mem::copy(dst, src.as_ptr(), src.len()), dst);
        assert_eq!(std::slice::from_raw_parts(dst, src.len()), src);
    });
}
