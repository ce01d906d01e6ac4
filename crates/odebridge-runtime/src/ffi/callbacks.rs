//! Callback entry points handed to the kernel
//!
//! Four `extern "C"` entries, generic over the kernel's integer width:
//! - `rhs_entry`: right-hand side
//! - `jacobian_entry`: analytic Jacobian
//! - `mass_entry`: constant mass matrix
//! - `solout_entry`: step notification
//!
//! Each entry validates the raw arguments once, recovers the run from the
//! identifier in the integer parameter array and hands safe views to a
//! `handle_*` function. Nothing unwinds into the kernel: failures are latched
//! and the entry answers a neutral value (zero output, or stop for step
//! notifications).

use crate::context::{CallContext, ContinuationHandles, OutputMode, StepControl, StepEvent};
use crate::dense::DenseOutput;
use crate::diagnostics::LogLevel;
use crate::error::{panic_message, BridgeError, BridgeResult, CallableKind, UserError};
use crate::ffi::codec::decode_raw;
use crate::ffi::marshal;
use crate::ffi::safety::{column_major_mut, read_count, read_scalar, slice_from_raw, slice_from_raw_mut};
use crate::ffi::types::{JacobianFn, MassFn, NativeInt, RhsFn, SoloutFn};
use crate::matrix::{MatrixShape, StructuredMatrix};
use crate::registry::{active_registry, latch_scope_failure, lock_context, CallId, CallRegistry};
use std::panic::{self, AssertUnwindSafe};

/// Step-notification answer: keep integrating
pub const CONTINUE: i32 = 0;
/// Step-notification answer: stop after this step
pub const STOP: i32 = -1;

/// Bridge entry points for one integer width
pub struct EntryPoints<W: NativeInt> {
    pub rhs: RhsFn<W>,
    pub jacobian: JacobianFn<W>,
    pub mass: MassFn<W>,
    pub solout: SoloutFn<W>,
}

impl<W: NativeInt> Clone for EntryPoints<W> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<W: NativeInt> Copy for EntryPoints<W> {}

impl<W: NativeInt> EntryPoints<W> {
    pub fn bridge() -> Self {
        Self {
            rhs: rhs_entry::<W>,
            jacobian: jacobian_entry::<W>,
            mass: mass_entry::<W>,
            solout: solout_entry::<W>,
        }
    }
}

impl<W: NativeInt> Default for EntryPoints<W> {
    fn default() -> Self {
        Self::bridge()
    }
}

/// One accepted step as reported by the kernel
#[derive(Debug, Clone, Copy)]
pub(crate) struct StepNotice<'a> {
    pub(crate) index: u64,
    pub(crate) t_old: f64,
    pub(crate) t_new: f64,
    pub(crate) state: &'a [f64],
    pub(crate) handles: ContinuationHandles,
}

/// Run a user callable, turning errors and panics into a latched failure
fn guarded<R>(kind: CallableKind, f: impl FnOnce() -> Result<R, UserError>) -> BridgeResult<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(BridgeError::UserCallableFailure { kind, source }),
        Err(payload) => Err(BridgeError::from_panic(kind, payload)),
    }
}

/// Run `body` against the context of `id`
///
/// A failure inside `body` is latched on the context and reported as `None`.
/// Only a lookup failure comes back as `Err`.
fn with_context<R>(
    registry: &CallRegistry,
    id: CallId,
    body: impl FnOnce(&mut CallContext) -> BridgeResult<R>,
) -> BridgeResult<Option<R>> {
    let handle = registry.lookup(id)?;
    let mut ctx = lock_context(&handle);
    match body(&mut ctx) {
        Ok(value) => Ok(Some(value)),
        Err(err) => {
            ctx.latch(err);
            Ok(None)
        }
    }
}

/// Right-hand side for run `id`; `dy` is zeroed when the run has failed
pub fn handle_rhs(
    registry: &CallRegistry,
    id: CallId,
    t: f64,
    y: &[f64],
    dy: &mut [f64],
) -> BridgeResult<()> {
    let done = with_context(registry, id, |ctx| {
        ctx.counters.rhs += 1;
        if ctx.has_failed() {
            dy.fill(0.0);
            return Ok(());
        }
        ctx.diagnostics
            .emit(LogLevel::RHS, format_args!("f(t = {}) n = {}", t, y.len()));
        let rhs = &mut ctx.rhs;
        guarded(CallableKind::RightHandSide, || rhs(t, y, &mut *dy))
    })?;
    if done.is_none() {
        dy.fill(0.0);
    }
    Ok(())
}

/// Jacobian for run `id` into a kernel buffer with leading dimension `ld`
pub fn handle_jacobian(
    registry: &CallRegistry,
    id: CallId,
    t: f64,
    y: &[f64],
    buffer: &mut [f64],
    ld: usize,
) -> BridgeResult<()> {
    let done = with_context(registry, id, |ctx| {
        ctx.counters.jacobian += 1;
        if ctx.has_failed() {
            buffer.fill(0.0);
            return Ok(());
        }
        let shape = ctx.jacobian_shape()?;
        let mut out = column_major_mut(&mut *buffer, shape.buffer_rows(), shape.buffer_cols(), ld)?;
        let mut matrix = shape.zeros();
        let jacobian = ctx.jacobian.as_mut().ok_or_else(|| {
            BridgeError::InternalInconsistency(
                "kernel asked for a Jacobian the run does not provide".to_string(),
            )
        })?;
        guarded(CallableKind::Jacobian, || jacobian(t, y, &mut matrix))?;
        marshal::encode(&matrix, &shape, &mut out)?;
        ctx.diagnostics.emit(
            LogLevel::JACOBIAN,
            format_args!("J(t = {}) in {} block(s)", t, shape.block_count()),
        );
        Ok(())
    })?;
    if done.is_none() {
        buffer.fill(0.0);
    }
    Ok(())
}

/// Mass matrix of run `id` over `n` free components
pub fn handle_mass(
    registry: &CallRegistry,
    id: CallId,
    n: usize,
    buffer: &mut [f64],
    ld: usize,
) -> BridgeResult<()> {
    let done = with_context(registry, id, |ctx| {
        ctx.counters.mass += 1;
        let identity;
        let (matrix, shape) = match ctx.mass.as_ref() {
            Some(mass) => (mass, MatrixShape::of(mass)?),
            None => {
                identity = StructuredMatrix::identity(n);
                (&identity, MatrixShape::Full { rows: n, cols: n })
            }
        };
        if shape.buffer_cols() != n {
            return Err(BridgeError::InternalInconsistency(format!(
                "kernel asked for a mass matrix over {} components, run has {}",
                n,
                shape.buffer_cols()
            )));
        }
        let mut out = column_major_mut(&mut *buffer, shape.buffer_rows(), n, ld)?;
        marshal::encode(matrix, &shape, &mut out)?;
        ctx.diagnostics
            .emit(LogLevel::MASS, format_args!("M written, {} rows", shape.buffer_rows()));
        Ok(())
    })?;
    if done.is_none() {
        buffer.fill(0.0);
    }
    Ok(())
}

fn record_and_notify(ctx: &mut CallContext, notice: &StepNotice<'_>) -> BridgeResult<i32> {
    if ctx.has_failed() {
        return Ok(STOP);
    }
    ctx.counters.steps += 1;

    let step = &mut ctx.last_step;
    step.index = notice.index;
    step.t_old = notice.t_old;
    step.t_new = notice.t_new;
    step.state.clear();
    step.state.extend_from_slice(notice.state);
    step.handles = Some(notice.handles);

    let CallContext {
        output,
        output_mode,
        last_step,
        evaluator,
        diagnostics,
        ..
    } = ctx;
    diagnostics.emit(
        LogLevel::OUTPUT,
        format_args!(
            "step {} accepted: [{}, {}]",
            notice.index, notice.t_old, notice.t_new
        ),
    );

    let Some(output) = output.as_mut() else {
        return Ok(CONTINUE);
    };
    let dense = match (*output_mode, evaluator.as_ref()) {
        (OutputMode::Dense, Some(evaluator)) => {
            Some(DenseOutput::new(evaluator, &*last_step, &*diagnostics))
        }
        (OutputMode::Dense, None) => {
            return Err(BridgeError::InternalInconsistency(
                "dense output requested without an evaluator".to_string(),
            ))
        }
        _ => None,
    };
    let event = StepEvent {
        index: last_step.index,
        t_old: last_step.t_old,
        t_new: last_step.t_new,
        state: &last_step.state,
        dense,
    };

    match guarded(CallableKind::Output, || output(&event))? {
        StepControl::Continue => Ok(CONTINUE),
        StepControl::Stop => Ok(STOP),
        StepControl::ContinueWithStateChange => Err(BridgeError::UnsupportedCapability(
            "changing the state from a step notification is not supported by this kernel"
                .to_string(),
        )),
    }
}

/// Record an accepted step and run the output callable; answers the kernel flag
pub(crate) fn handle_step(registry: &CallRegistry, id: CallId, notice: StepNotice<'_>) -> BridgeResult<i32> {
    Ok(with_context(registry, id, |ctx| record_and_notify(ctx, &notice))?.unwrap_or(STOP))
}

fn abort_without_scope(entry: &str) -> ! {
    tracing::error!(
        target: "odebridge::bridge",
        entry,
        "kernel callback arrived on a thread with no active run"
    );
    std::process::abort()
}

/// Resolve the run of a callback and execute `body`
///
/// Failures not attributable to a context are latched on the thread's
/// registry scope and reported as `None`.
fn dispatch<W: NativeInt, R>(
    ipar: *const W,
    entry: &'static str,
    body: impl FnOnce(&CallRegistry, CallId) -> BridgeResult<R>,
) -> Option<R> {
    let Some(registry) = active_registry() else {
        abort_without_scope(entry)
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: the kernel passes back the parameter array it was given
        let id = unsafe { decode_raw(ipar) }?;
        body(&registry, id)
    }));
    let err = match outcome {
        Ok(Ok(value)) => return Some(value),
        Ok(Err(err)) => err,
        Err(payload) => BridgeError::InternalInconsistency(format!(
            "{} entry panicked: {}",
            entry,
            panic_message(payload.as_ref())
        )),
    };
    tracing::error!(target: "odebridge::bridge", entry, error = %err, "callback failed");
    latch_scope_failure(err);
    None
}

/// Right-hand side entry: `(n, t, y, f_out, rpar, ipar)`
///
/// # Safety
///
/// Must only be called by a kernel started by this crate, with buffers of the
/// lengths its calling convention specifies.
pub unsafe extern "C" fn rhs_entry<W: NativeInt>(
    n: *const W,
    t: *const f64,
    y: *const f64,
    f: *mut f64,
    _rpar: *mut f64,
    ipar: *mut W,
) {
    dispatch(ipar, "rhs", |registry, id| {
        let n = read_count(n, "dimension")?;
        let t = read_scalar(t, "time")?;
        let y = slice_from_raw(y, n, "state")?;
        let dy = slice_from_raw_mut(f, n, "derivative")?;
        let result = handle_rhs(registry, id, t, y, dy);
        if result.is_err() {
            dy.fill(0.0);
        }
        result
    });
}

/// Jacobian entry: `(n, t, y, dfy_out, ldfy, rpar, ipar)`
///
/// # Safety
///
/// Same contract as [`rhs_entry`]; `dfy` holds `ldfy * n` values.
pub unsafe extern "C" fn jacobian_entry<W: NativeInt>(
    n: *const W,
    t: *const f64,
    y: *const f64,
    dfy: *mut f64,
    ldfy: *const W,
    _rpar: *mut f64,
    ipar: *mut W,
) {
    dispatch(ipar, "jacobian", |registry, id| {
        let n = read_count(n, "dimension")?;
        let ld = read_count(ldfy, "Jacobian leading dimension")?;
        let t = read_scalar(t, "time")?;
        let y = slice_from_raw(y, n, "state")?;
        let buffer = slice_from_raw_mut(dfy, ld * n, "Jacobian buffer")?;
        let result = handle_jacobian(registry, id, t, y, buffer, ld);
        if result.is_err() {
            buffer.fill(0.0);
        }
        result
    });
}

/// Mass matrix entry: `(n, am_out, lmas, rpar, ipar)`
///
/// # Safety
///
/// Same contract as [`rhs_entry`]; `am` holds `lmas * n` values.
pub unsafe extern "C" fn mass_entry<W: NativeInt>(
    n: *const W,
    am: *mut f64,
    lmas: *const W,
    _rpar: *mut f64,
    ipar: *mut W,
) {
    dispatch(ipar, "mass", |registry, id| {
        let n = read_count(n, "dimension")?;
        let ld = read_count(lmas, "mass leading dimension")?;
        let buffer = slice_from_raw_mut(am, ld * n, "mass buffer")?;
        let result = handle_mass(registry, id, n, buffer, ld);
        if result.is_err() {
            buffer.fill(0.0);
        }
        result
    });
}

/// Step notification entry:
/// `(nr, t_old, t_new, y, cont, lrc, n, rpar, ipar, irtrn_out)`
///
/// # Safety
///
/// Same contract as [`rhs_entry`]; `cont` holds `lrc` values and stays valid
/// until the entry returns.
pub unsafe extern "C" fn solout_entry<W: NativeInt>(
    nr: *const W,
    t_old: *const f64,
    t_new: *const f64,
    y: *const f64,
    cont: *const f64,
    lrc: *const W,
    n: *const W,
    _rpar: *mut f64,
    ipar: *mut W,
    irtrn: *mut W,
) {
    let flag = dispatch(ipar, "solout", |registry, id| {
        let n = read_count(n, "dimension")?;
        let notice = StepNotice {
            index: read_count(nr, "step index")? as u64,
            t_old: read_scalar(t_old, "step start")?,
            t_new: read_scalar(t_new, "step end")?,
            state: slice_from_raw(y, n, "state")?,
            handles: ContinuationHandles::new(cont, read_count(lrc, "continuation length")?),
        };
        handle_step(registry, id, notice)
    })
    .unwrap_or(STOP);
    if !irtrn.is_null() {
        *irtrn = W::from_i32(flag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RhsCallable;
    use crate::ffi::codec::encode;
    use crate::matrix::{Bandwidths, StructureSplit};
    use crate::registry::RegistryScope;
    use ndarray::array;
    use std::sync::Arc;

    fn decay() -> RhsCallable {
        Box::new(|_t, y, dy| {
            for (d, v) in dy.iter_mut().zip(y) {
                *d = -v;
            }
            Ok(())
        })
    }

    fn failing() -> RhsCallable {
        Box::new(|_t, _y, _dy| Err("bad state".into()))
    }

    fn notice(state: &[f64]) -> StepNotice<'_> {
        StepNotice {
            index: 2,
            t_old: 0.0,
            t_new: 0.1,
            state,
            handles: ContinuationHandles::new(std::ptr::null(), 0),
        }
    }

    #[test]
    fn test_rhs_writes_derivative() {
        let registry = CallRegistry::new();
        let id = registry.register(CallContext::new(2, decay()));
        let mut dy = [9.0; 2];
        handle_rhs(&registry, id, 0.0, &[1.0, 2.0], &mut dy).unwrap();
        assert_eq!(dy, [-1.0, -2.0]);
    }

    #[test]
    fn test_rhs_failure_latched_and_zeroed() {
        let registry = CallRegistry::new();
        let id = registry.register(CallContext::new(2, failing()));
        let mut dy = [9.0; 2];
        handle_rhs(&registry, id, 0.0, &[1.0, 2.0], &mut dy).unwrap();
        assert_eq!(dy, [0.0, 0.0]);

        let handle = registry.unregister(id);
        let ctx = lock_context(&handle);
        assert!(matches!(
            ctx.failure,
            Some(BridgeError::UserCallableFailure {
                kind: CallableKind::RightHandSide,
                ..
            })
        ));
    }

    #[test]
    fn test_rhs_panic_latched() {
        let registry = CallRegistry::new();
        let ctx = CallContext::new(1, Box::new(|_t, _y, _dy| panic!("division by zero")));
        let id = registry.register(ctx);
        let mut dy = [1.0];
        handle_rhs(&registry, id, 0.0, &[1.0], &mut dy).unwrap();
        assert_eq!(dy, [0.0]);
        let handle = registry.lookup(id).unwrap();
        let failure = lock_context(&handle).take_failure().unwrap();
        assert!(failure.to_string().contains("division by zero"));
    }

    #[test]
    fn test_unknown_id_is_error() {
        let registry = CallRegistry::new();
        let id = CallId::new(77).unwrap();
        let mut dy = [0.0];
        assert!(matches!(
            handle_rhs(&registry, id, 0.0, &[1.0], &mut dy),
            Err(BridgeError::InternalInconsistency(_))
        ));
    }

    #[test]
    fn test_jacobian_blocks_written_side_by_side() {
        let registry = CallRegistry::new();
        let ctx = CallContext::new(4, decay())
            .with_split(StructureSplit::new(2, 2).unwrap())
            .with_jacobian_band(Bandwidths::new(0, 0))
            .with_jacobian(Box::new(|_t, _y, m| {
                if let StructuredMatrix::Blocks(blocks) = m {
                    for (k, block) in blocks.iter_mut().enumerate() {
                        block.set(0, 0, k as f64 + 1.0)?;
                        block.set(1, 1, k as f64 + 10.0)?;
                    }
                }
                Ok(())
            }));
        let id = registry.register(ctx);
        // leading dimension 2 for a 1-row banded buffer
        let mut buffer = [-1.0; 8];
        handle_jacobian(&registry, id, 0.0, &[0.0; 4], &mut buffer, 2).unwrap();
        assert_eq!(buffer, [1.0, -1.0, 10.0, -1.0, 2.0, -1.0, 11.0, -1.0]);
    }

    #[test]
    fn test_jacobian_without_callable_is_latched() {
        let registry = CallRegistry::new();
        let id = registry.register(CallContext::new(2, decay()));
        let mut buffer = [5.0; 4];
        handle_jacobian(&registry, id, 0.0, &[0.0; 2], &mut buffer, 2).unwrap();
        assert_eq!(buffer, [0.0; 4]);
        assert!(lock_context(&registry.lookup(id).unwrap()).has_failed());
    }

    #[test]
    fn test_mass_defaults_to_identity() {
        let registry = CallRegistry::new();
        let id = registry.register(CallContext::new(2, decay()));
        let mut buffer = [7.0; 4];
        handle_mass(&registry, id, 2, &mut buffer, 2).unwrap();
        assert_eq!(buffer, [1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_mass_full_matrix() {
        let registry = CallRegistry::new();
        let ctx = CallContext::new(2, decay())
            .with_mass(StructuredMatrix::Full(array![[2.0, 0.5], [0.0, 3.0]]));
        let id = registry.register(ctx);
        let mut buffer = [0.0; 4];
        handle_mass(&registry, id, 2, &mut buffer, 2).unwrap();
        assert_eq!(buffer, [2.0, 0.0, 0.5, 3.0]);
    }

    #[test]
    fn test_step_records_and_continues() {
        let registry = CallRegistry::new();
        let ctx = CallContext::new(2, decay()).with_output(
            OutputMode::StepOnly,
            Box::new(|event| {
                assert!(event.dense().is_none());
                Ok(StepControl::Continue)
            }),
        );
        let id = registry.register(ctx);
        let flag = handle_step(&registry, id, notice(&[1.0, 2.0])).unwrap();
        assert_eq!(flag, CONTINUE);

        let handle = registry.lookup(id).unwrap();
        let ctx = lock_context(&handle);
        assert_eq!(ctx.last_step().state, vec![1.0, 2.0]);
        assert_eq!(ctx.last_step().t_new, 0.1);
        assert_eq!(ctx.counters().steps, 1);
    }

    #[test]
    fn test_state_change_is_unsupported() {
        let registry = CallRegistry::new();
        let ctx = CallContext::new(1, decay()).with_output(
            OutputMode::StepOnly,
            Box::new(|_| Ok(StepControl::ContinueWithStateChange)),
        );
        let id = registry.register(ctx);
        assert_eq!(handle_step(&registry, id, notice(&[1.0])).unwrap(), STOP);
        // later steps keep answering stop
        assert_eq!(handle_step(&registry, id, notice(&[1.0])).unwrap(), STOP);

        let handle = registry.unregister(id);
        let mut ctx = lock_context(&handle);
        assert_eq!(ctx.counters().steps, 1);
        assert!(matches!(
            ctx.take_failure(),
            Some(BridgeError::UnsupportedCapability(_))
        ));
    }

    #[test]
    fn test_entry_with_stale_id_latches_on_scope() {
        let registry = Arc::new(CallRegistry::new());
        let stale = registry.register(CallContext::new(1, decay()));
        registry.unregister(stale);

        let scope = RegistryScope::enter(registry.clone());
        let mut slot = encode::<i32>(stale);
        let n = 1i32;
        let t = 0.0;
        let y = [1.0];
        let mut dy = [3.0];
        let mut rpar = 0.0;
        unsafe {
            rhs_entry::<i32>(&n, &t, y.as_ptr(), dy.as_mut_ptr(), &mut rpar, slot.as_mut_ptr());
        }
        assert_eq!(dy, [0.0]);
        assert!(matches!(
            scope.take_failure(),
            Some(BridgeError::InternalInconsistency(_))
        ));
    }

    #[test]
    fn test_solout_entry_answers_stop_on_failure() {
        let registry = Arc::new(CallRegistry::new());
        let ctx = CallContext::new(1, decay())
            .with_output(OutputMode::StepOnly, Box::new(|_| Err("disk full".into())));
        let id = registry.register(ctx);

        let _scope = RegistryScope::enter(registry.clone());
        let mut slot = encode::<i64>(id);
        let (nr, n, lrc) = (1i64, 1i64, 0i64);
        let (t_old, t_new) = (0.0, 0.5);
        let y = [1.0];
        let mut rpar = 0.0;
        let mut irtrn = 0i64;
        unsafe {
            solout_entry::<i64>(
                &nr,
                &t_old,
                &t_new,
                y.as_ptr(),
                std::ptr::null(),
                &lrc,
                &n,
                &mut rpar,
                slot.as_mut_ptr(),
                &mut irtrn,
            );
        }
        assert_eq!(irtrn, -1);
        assert!(lock_context(&registry.lookup(id).unwrap()).has_failed());
    }
}
