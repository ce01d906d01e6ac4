//! Packing of call identifiers into the kernel's integer parameter array
//!
//! The kernel threads one integer array through every callback untouched.
//! A 64-bit build carries the identifier in a single cell; a 32-bit build
//! splits it into a low and a high half. This is the only place the two
//! widths differ.

use crate::error::{BridgeError, BridgeResult};
use crate::ffi::safety::check_null;
use crate::ffi::types::NativeInt;
use crate::registry::CallId;

/// Width-specific identifier packing
pub trait IdentifierCodec: Sized {
    /// Number of cells an identifier occupies
    const ID_CELLS: usize;

    fn pack(raw: u64, cells: &mut [Self]);

    fn unpack(cells: &[Self]) -> u64;
}

impl IdentifierCodec for i64 {
    const ID_CELLS: usize = 1;

    fn pack(raw: u64, cells: &mut [Self]) {
        cells[0] = raw as i64;
    }

    fn unpack(cells: &[Self]) -> u64 {
        cells[0] as u64
    }
}

impl IdentifierCodec for i32 {
    const ID_CELLS: usize = 2;

    fn pack(raw: u64, cells: &mut [Self]) {
        cells[0] = raw as u32 as i32;
        cells[1] = (raw >> 32) as u32 as i32;
    }

    fn unpack(cells: &[Self]) -> u64 {
        (cells[0] as u32 as u64) | ((cells[1] as u32 as u64) << 32)
    }
}

/// Integer parameter array handed to the kernel for one run
#[derive(Debug, Clone, PartialEq)]
pub struct IdSlot<W> {
    cells: [W; 2],
}

impl<W: NativeInt> IdSlot<W> {
    /// Cells actually carrying the identifier
    pub fn as_slice(&self) -> &[W] {
        &self.cells[..W::ID_CELLS]
    }

    /// Pointer passed as the kernel's integer parameter array
    pub fn as_mut_ptr(&mut self) -> *mut W {
        self.cells.as_mut_ptr()
    }
}

/// Pack an identifier for width `W`
pub fn encode<W: NativeInt>(id: CallId) -> IdSlot<W> {
    let mut cells = [W::default(); 2];
    W::pack(id.get(), &mut cells[..W::ID_CELLS]);
    IdSlot { cells }
}

/// Recover an identifier from its cells
pub fn decode<W: NativeInt>(cells: &[W]) -> BridgeResult<CallId> {
    if cells.len() < W::ID_CELLS {
        return Err(BridgeError::InternalInconsistency(format!(
            "identifier needs {} cells, got {}",
            W::ID_CELLS,
            cells.len()
        )));
    }
    let raw = W::unpack(&cells[..W::ID_CELLS]);
    CallId::new(raw).ok_or_else(|| {
        BridgeError::InternalInconsistency("kernel passed the reserved identifier 0".to_string())
    })
}

/// Recover an identifier straight from the kernel's parameter pointer
///
/// # Safety
///
/// `ptr` must be null or point to at least `W::ID_CELLS` readable cells.
pub unsafe fn decode_raw<W: NativeInt>(ptr: *const W) -> BridgeResult<CallId> {
    let ptr = check_null(ptr, "integer parameter array")?;
    decode(std::slice::from_raw_parts(ptr, W::ID_CELLS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(raw: u64) -> CallId {
        CallId::new(raw).unwrap()
    }

    #[test]
    fn test_wide_build_uses_one_cell() {
        let slot = encode::<i64>(id(42));
        assert_eq!(slot.as_slice(), &[42]);
    }

    #[test]
    fn test_narrow_build_splits_halves() {
        let slot = encode::<i32>(id(0x0000_0001_ffff_fffe));
        assert_eq!(slot.as_slice(), &[-2, 1]);
        assert_eq!(decode::<i32>(slot.as_slice()).unwrap(), id(0x0000_0001_ffff_fffe));
    }

    #[test]
    fn test_zero_is_rejected() {
        assert!(matches!(
            decode::<i64>(&[0]),
            Err(BridgeError::InternalInconsistency(_))
        ));
        assert!(decode::<i32>(&[0, 0]).is_err());
    }

    #[test]
    fn test_short_slot_is_rejected() {
        assert!(decode::<i32>(&[5]).is_err());
    }

    #[test]
    fn test_decode_raw_null() {
        let result = unsafe { decode_raw::<i64>(std::ptr::null()) };
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_raw_reads_slot() {
        let mut slot = encode::<i32>(id(u64::MAX));
        let decoded = unsafe { decode_raw::<i32>(slot.as_mut_ptr()) }.unwrap();
        assert_eq!(decoded, id(u64::MAX));
    }

    proptest! {
        #[test]
        fn prop_round_trip_both_widths(raw in 1u64..) {
            prop_assert_eq!(decode::<i64>(encode::<i64>(id(raw)).as_slice()).unwrap(), id(raw));
            prop_assert_eq!(decode::<i32>(encode::<i32>(id(raw)).as_slice()).unwrap(), id(raw));
        }
    }
}
