//! ABI types shared with the foreign kernel
//!
//! The kernel family comes in two builds that differ only in the width of
//! their integer arguments. Everything in the bridge is generic over
//! [`NativeInt`] and instantiated once per width:
//! - `i32`: classic Fortran `INTEGER`
//! - `i64`: `-fdefault-integer-8` builds
//!
//! Callback signatures follow the kernel's calling convention: every argument
//! is passed by reference.

use crate::error::{BridgeError, BridgeResult};
use crate::ffi::codec::IdentifierCodec;
use std::fmt::Debug;

/// Native integer type of a kernel build
pub trait NativeInt: IdentifierCodec + Copy + Default + Debug + PartialEq + Send + Sync + 'static {
    /// Width in bits, as written in configuration
    const WIDTH: u32;

    fn from_usize(n: usize) -> BridgeResult<Self>;

    /// Convert a kernel-supplied count or index; negative values are rejected
    fn to_usize(self) -> BridgeResult<usize>;

    fn from_i32(v: i32) -> Self;

    fn to_i64(self) -> i64;
}

impl NativeInt for i32 {
    const WIDTH: u32 = 32;

    fn from_usize(n: usize) -> BridgeResult<Self> {
        i32::try_from(n).map_err(|_| {
            BridgeError::layout(format!("{} does not fit a 32-bit kernel integer", n))
        })
    }

    fn to_usize(self) -> BridgeResult<usize> {
        usize::try_from(self).map_err(|_| {
            BridgeError::InternalInconsistency(format!("kernel passed negative count {}", self))
        })
    }

    fn from_i32(v: i32) -> Self {
        v
    }

    fn to_i64(self) -> i64 {
        self as i64
    }
}

impl NativeInt for i64 {
    const WIDTH: u32 = 64;

    fn from_usize(n: usize) -> BridgeResult<Self> {
        i64::try_from(n).map_err(|_| {
            BridgeError::layout(format!("{} does not fit a 64-bit kernel integer", n))
        })
    }

    fn to_usize(self) -> BridgeResult<usize> {
        usize::try_from(self).map_err(|_| {
            BridgeError::InternalInconsistency(format!("kernel passed negative count {}", self))
        })
    }

    fn from_i32(v: i32) -> Self {
        v as i64
    }

    fn to_i64(self) -> i64 {
        self
    }
}

/// Right-hand side: `(n, t, y, f_out, rpar, ipar)`
pub type RhsFn<W> =
    unsafe extern "C" fn(*const W, *const f64, *const f64, *mut f64, *mut f64, *mut W);

/// Jacobian: `(n, t, y, dfy_out, ldfy, rpar, ipar)`
pub type JacobianFn<W> =
    unsafe extern "C" fn(*const W, *const f64, *const f64, *mut f64, *const W, *mut f64, *mut W);

/// Mass matrix: `(n, am_out, lmas, rpar, ipar)`
pub type MassFn<W> = unsafe extern "C" fn(*const W, *mut f64, *const W, *mut f64, *mut W);

/// Step notification:
/// `(step_index, t_old, t_new, y, cont, lrc, n, rpar, ipar, irtrn_out)`
pub type SoloutFn<W> = unsafe extern "C" fn(
    *const W,
    *const f64,
    *const f64,
    *const f64,
    *const f64,
    *const W,
    *const W,
    *mut f64,
    *mut W,
    *mut W,
);

/// Continuous extension: `(component, t, cont, lrc) -> value`
///
/// `component` is 1-based, as the kernel expects.
pub type ContinuationFn<W> = unsafe extern "C" fn(*const W, *const f64, *const f64, *const W) -> f64;
