//! Raw memory helpers shared with the rest of the stage.

/// Copies `size` bytes from `src` to `dst`, one byte at a time from the
/// lowest address upwards, and returns `dst`.
///
/// Overlapping ranges get forward-copy semantics: when `dst` lies inside
/// `src..src + size` above `src`, bytes already written are read again.
///
/// # Safety
///
/// The caller must ensure that:
///
/// - `src..src + size` is valid for reads
/// - `dst..dst + size` is valid for writes
pub unsafe fn copy(dst: *mut u8, src: *const u8, size: usize) -> *mut u8 {
    for offset in 0..size {
        unsafe {
            dst.add(offset).write(src.add(offset).read());
        }
    }
    dst
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy() {
        let src = [0_u8, 1, 2, 3, 4, 5, 6, 7, 8, 9];
        let mut dst = [0_u8; 10];

        let ret = unsafe { copy(dst.as_mut_ptr(), src.as_ptr(), src.len()) };

        assert_eq!(ret, dst.as_mut_ptr());
        assert_eq!(dst, src);
    }

    #[test]
    fn test_copy_zero_bytes() {
        let src = [1_u8; 4];
        let mut dst = [7_u8; 4];

        unsafe {
            copy(dst.as_mut_ptr(), src.as_ptr(), 0);
        }

        assert_eq!(dst, [7; 4]);
    }

    #[test]
    fn test_copy_forward_overlap() {
        let mut buf = [1_u8, 2, 3, 4, 5, 6];
        let base = buf.as_mut_ptr();

        // Each write lands one byte ahead of the next read.
        unsafe {
            copy(base.add(1), base, 5);
        }

        assert_eq!(buf, [1, 1, 1, 1, 1, 1]);
    }
}
