//! Shared test utilities
//!
//! `EulerKernel` stands in for a foreign integrator. It takes fixed explicit
//! Euler steps but talks to the bridge exactly like a real kernel: through
//! the `extern "C"` entry points, raw buffers and the integer parameter array.

#![allow(dead_code)]

use odebridge_runtime::ffi::{ContinuationFn, ForeignIntegrator, KernelCall, MassSpec, NativeInt};
use odebridge_runtime::BridgeResult;
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Mutex;

pub use pretty_assertions::{assert_eq, assert_ne};

thread_local! {
    static CONTINUATION_CALLS: Cell<usize> = const { Cell::new(0) };
}

/// Continuation queries issued on this thread
pub fn continuation_calls() -> usize {
    CONTINUATION_CALLS.with(Cell::get)
}

pub fn reset_continuation_calls() {
    CONTINUATION_CALLS.with(|c| c.set(0));
}

/// Continuation buffer layout used by the mock kernels:
/// `[t_old, t_new, y_old[0..n], y_new[0..n]]`
pub fn continuation_buffer(t_old: f64, t_new: f64, y_old: &[f64], y_new: &[f64]) -> Vec<f64> {
    let mut cont = vec![t_old, t_new];
    cont.extend_from_slice(y_old);
    cont.extend_from_slice(y_new);
    cont
}

/// Linear interpolation over a buffer built by `continuation_buffer`
///
/// # Safety
///
/// `cont` must hold `lrc` values laid out as above.
pub unsafe extern "C" fn linear_continuation<W: NativeInt>(
    i: *const W,
    x: *const f64,
    cont: *const f64,
    lrc: *const W,
) -> f64 {
    CONTINUATION_CALLS.with(|c| c.set(c.get() + 1));
    let lrc = (*lrc).to_i64() as usize;
    let cont = std::slice::from_raw_parts(cont, lrc);
    let n = (lrc - 2) / 2;
    let i = (*i).to_i64() as usize - 1;
    let (t_old, t_new) = (cont[0], cont[1]);
    let (y_old, y_new) = (cont[2 + i], cont[2 + n + i]);
    let theta = (*x - t_old) / (t_new - t_old);
    y_old + theta * (y_new - y_old)
}

/// Raw buffer a mock kernel handed to a matrix entry
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixCapture {
    pub ld: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

impl MatrixCapture {
    pub fn at(&self, row: usize, col: usize) -> f64 {
        self.data[row + col * self.ld]
    }
}

/// Fixed-step explicit Euler driven entirely through the bridge entry points
pub struct EulerKernel<W: NativeInt> {
    steps: usize,
    jacobian: Mutex<Option<MatrixCapture>>,
    mass: Mutex<Option<MatrixCapture>>,
    _width: PhantomData<W>,
}

impl<W: NativeInt> EulerKernel<W> {
    pub fn new(steps: usize) -> Self {
        Self {
            steps,
            jacobian: Mutex::new(None),
            mass: Mutex::new(None),
            _width: PhantomData,
        }
    }

    /// Last Jacobian buffer the kernel received
    pub fn last_jacobian(&self) -> Option<MatrixCapture> {
        self.jacobian.lock().unwrap().clone()
    }

    /// Mass buffer the kernel received
    pub fn mass(&self) -> Option<MatrixCapture> {
        self.mass.lock().unwrap().clone()
    }
}

impl<W: NativeInt> ForeignIntegrator for EulerKernel<W> {
    type Int = W;

    fn continuation(&self) -> ContinuationFn<W> {
        linear_continuation::<W>
    }

    fn integrate(&self, call: KernelCall<'_, W>) -> BridgeResult<i32> {
        let n = call.dimension;
        let free = n - call.split.m1();
        let nw = W::from_usize(n)?;
        let ipar = call.id_slot.as_mut_ptr();
        let mut rpar = 0.0;
        let mut t = *call.t;
        let h = (call.t_end - t) / self.steps as f64;
        let mut dy = vec![0.0; n];

        if call.mass != MassSpec::Identity {
            let rows = match call.mass {
                MassSpec::Banded(b) => 1 + b.lower + b.upper,
                _ => free,
            };
            let mut buffer = vec![f64::NAN; rows * free];
            let (fw, ldw) = (W::from_usize(free)?, W::from_usize(rows)?);
            unsafe { (call.entries.mass)(&fw, buffer.as_mut_ptr(), &ldw, &mut rpar, ipar) };
            *self.mass.lock().unwrap() = Some(MatrixCapture {
                ld: rows,
                cols: free,
                data: buffer,
            });
        }

        let mut cont = continuation_buffer(t, t, call.y, call.y);
        for step in 0..=self.steps {
            if step > 0 {
                let t_old = t;
                let y_old = call.y.to_vec();
                unsafe {
                    (call.entries.rhs)(&nw, &t, call.y.as_ptr(), dy.as_mut_ptr(), &mut rpar, ipar)
                };

                if call.user_jacobian {
                    let rows = match call.jacobian_band {
                        Some(b) => 1 + b.lower + b.upper,
                        None => free,
                    };
                    // one padding row exercises the leading dimension
                    let ld = rows + 1;
                    let mut buffer = vec![f64::NAN; ld * n];
                    let ldw = W::from_usize(ld)?;
                    unsafe {
                        (call.entries.jacobian)(
                            &nw,
                            &t,
                            call.y.as_ptr(),
                            buffer.as_mut_ptr(),
                            &ldw,
                            &mut rpar,
                            ipar,
                        )
                    };
                    *self.jacobian.lock().unwrap() = Some(MatrixCapture {
                        ld,
                        cols: n,
                        data: buffer,
                    });
                }

                for (y, d) in call.y.iter_mut().zip(&dy) {
                    *y += h * d;
                }
                t = if step == self.steps { call.t_end } else { t_old + h };
                cont = continuation_buffer(t_old, t, &y_old, call.y);
            }

            if call.output {
                let nr = W::from_usize(step + 1)?;
                let lrc = W::from_usize(cont.len())?;
                let t_old = cont[0];
                let mut irtrn = W::default();
                unsafe {
                    (call.entries.solout)(
                        &nr,
                        &t_old,
                        &t,
                        call.y.as_ptr(),
                        cont.as_ptr(),
                        &lrc,
                        &nw,
                        &mut rpar,
                        ipar,
                        &mut irtrn,
                    )
                };
                if irtrn.to_i64() < 0 {
                    *call.t = t;
                    return Ok(2);
                }
            }
        }

        *call.t = t;
        Ok(1)
    }
}
