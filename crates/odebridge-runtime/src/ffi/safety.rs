//! Safe views over kernel-owned buffers
//!
//! Every pointer the kernel hands to a callback is checked once here and
//! turned into a slice or a column-major 2-D view with an explicit leading
//! dimension. Layout code downstream only ever sees those views.

use crate::error::{BridgeError, BridgeResult};
use crate::ffi::types::NativeInt;
use ndarray::{ArrayView2, ArrayViewMut2, ShapeBuilder};

/// Null pointer check for kernel input
pub fn check_null<T>(ptr: *const T, what: &str) -> BridgeResult<*const T> {
    if ptr.is_null() {
        Err(BridgeError::InternalInconsistency(format!(
            "kernel passed a null {}",
            what
        )))
    } else {
        Ok(ptr)
    }
}

/// Null pointer check for kernel output
pub fn check_null_mut<T>(ptr: *mut T, what: &str) -> BridgeResult<*mut T> {
    if ptr.is_null() {
        Err(BridgeError::InternalInconsistency(format!(
            "kernel passed a null {}",
            what
        )))
    } else {
        Ok(ptr)
    }
}

/// Read a by-reference scalar argument
///
/// # Safety
///
/// `ptr` must be null or valid for reads.
pub unsafe fn read_scalar<T: Copy>(ptr: *const T, what: &str) -> BridgeResult<T> {
    Ok(*check_null(ptr, what)?)
}

/// Read a by-reference count or index argument
///
/// # Safety
///
/// `ptr` must be null or valid for reads.
pub unsafe fn read_count<W: NativeInt>(ptr: *const W, what: &str) -> BridgeResult<usize> {
    read_scalar(ptr, what)?.to_usize()
}

/// Borrow `len` kernel-owned values
///
/// # Safety
///
/// `ptr` must be null or valid for `len` reads for the chosen lifetime.
pub unsafe fn slice_from_raw<'a>(ptr: *const f64, len: usize, what: &str) -> BridgeResult<&'a [f64]> {
    if len == 0 {
        return Ok(&[]);
    }
    Ok(std::slice::from_raw_parts(check_null(ptr, what)?, len))
}

/// Mutably borrow `len` kernel-owned values
///
/// # Safety
///
/// `ptr` must be null or valid for `len` writes for the chosen lifetime, and
/// not aliased by any other live reference.
pub unsafe fn slice_from_raw_mut<'a>(
    ptr: *mut f64,
    len: usize,
    what: &str,
) -> BridgeResult<&'a mut [f64]> {
    if len == 0 {
        return Ok(&mut []);
    }
    Ok(std::slice::from_raw_parts_mut(check_null_mut(ptr, what)?, len))
}

fn check_leading_dim(rows: usize, ld: usize) -> BridgeResult<()> {
    if ld < rows.max(1) {
        return Err(BridgeError::InternalInconsistency(format!(
            "leading dimension {} is smaller than {} rows",
            ld, rows
        )));
    }
    Ok(())
}

/// Column-major view of `rows x cols` values stored with leading dimension `ld`
pub fn column_major(data: &[f64], rows: usize, cols: usize, ld: usize) -> BridgeResult<ArrayView2<'_, f64>> {
    check_leading_dim(rows, ld)?;
    ArrayView2::from_shape((rows, cols).strides((1, ld)), data).map_err(|e| {
        BridgeError::InternalInconsistency(format!(
            "buffer of {} values cannot hold {}x{} with leading dimension {}: {}",
            data.len(),
            rows,
            cols,
            ld,
            e
        ))
    })
}

/// Mutable column-major view of `rows x cols` values stored with leading dimension `ld`
pub fn column_major_mut(
    data: &mut [f64],
    rows: usize,
    cols: usize,
    ld: usize,
) -> BridgeResult<ArrayViewMut2<'_, f64>> {
    check_leading_dim(rows, ld)?;
    let len = data.len();
    ArrayViewMut2::from_shape((rows, cols).strides((1, ld)), data).map_err(|e| {
        BridgeError::InternalInconsistency(format!(
            "buffer of {} values cannot hold {}x{} with leading dimension {}: {}",
            len, rows, cols, ld, e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_null_valid() {
        let x = 42;
        assert!(check_null(&x as *const i32, "x").is_ok());
    }

    #[test]
    fn test_check_null_invalid() {
        let result = check_null(std::ptr::null::<i32>(), "dimension");
        assert!(matches!(result, Err(BridgeError::InternalInconsistency(msg)) if msg.contains("dimension")));
    }

    #[test]
    fn test_check_null_mut_invalid() {
        assert!(check_null_mut(std::ptr::null_mut::<f64>(), "out").is_err());
    }

    #[test]
    fn test_read_count_rejects_negative() {
        let n: i32 = -3;
        assert!(unsafe { read_count(&n as *const i32, "n") }.is_err());
    }

    #[test]
    fn test_empty_slice_allows_null() {
        let slice = unsafe { slice_from_raw(std::ptr::null(), 0, "y") }.unwrap();
        assert!(slice.is_empty());
    }

    #[test]
    fn test_column_major_respects_leading_dim() {
        // 2x3 logical matrix stored with ld = 4; padding rows hold -1
        let data = [1.0, 2.0, -1.0, -1.0, 3.0, 4.0, -1.0, -1.0, 5.0, 6.0];
        let view = column_major(&data, 2, 3, 4).unwrap();
        assert_eq!(view[(0, 0)], 1.0);
        assert_eq!(view[(1, 1)], 4.0);
        assert_eq!(view[(1, 2)], 6.0);
    }

    #[test]
    fn test_column_major_rejects_short_buffer() {
        let data = [0.0; 5];
        assert!(column_major(&data, 2, 3, 2).is_err());
    }

    #[test]
    fn test_column_major_rejects_small_leading_dim() {
        let mut data = [0.0; 9];
        assert!(column_major_mut(&mut data, 3, 3, 2).is_err());
    }

    #[test]
    fn test_column_major_mut_writes_through() {
        let mut data = [0.0; 6];
        {
            let mut view = column_major_mut(&mut data, 2, 2, 3).unwrap();
            view[(1, 1)] = 7.0;
        }
        assert_eq!(data[4], 7.0);
    }
}
