//! Dense output inside the last accepted step
//!
//! The evaluator is built once per run and is stateless: every evaluation
//! takes the step record explicitly. The output callable only ever reaches it
//! through a [`DenseOutput`] borrowed from the step-notification call, so the
//! kernel's continuation buffer cannot be read after it goes stale.

use crate::context::{ContinuationHandles, StepRecord};
use crate::diagnostics::{Diagnostics, LogLevel};
use crate::error::{BridgeError, BridgeResult};
use crate::ffi::types::{ContinuationFn, NativeInt};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Continuous extension routine of the kernel
pub trait ContinuationQuery: Send + Sync {
    /// Value of `component` (0-based) at time `t`
    fn query(&self, component: usize, t: f64, handles: &ContinuationHandles) -> BridgeResult<f64>;
}

/// Kernel continuation routine called through its C entry point
pub struct ForeignContinuation<W: NativeInt> {
    routine: ContinuationFn<W>,
    _width: PhantomData<W>,
}

impl<W: NativeInt> ForeignContinuation<W> {
    pub fn new(routine: ContinuationFn<W>) -> Self {
        Self {
            routine,
            _width: PhantomData,
        }
    }
}

impl<W: NativeInt> ContinuationQuery for ForeignContinuation<W> {
    fn query(&self, component: usize, t: f64, handles: &ContinuationHandles) -> BridgeResult<f64> {
        let index = W::from_usize(component + 1)?;
        let lrc = W::from_usize(handles.len)?;
        // SAFETY: handles come from the step notification currently on the
        // stack, so the kernel's buffer is live
        Ok(unsafe { (self.routine)(&index, &t, handles.buffer, &lrc) })
    }
}

/// Reconstructs the solution inside the last accepted step
///
/// Evaluation is reachable only through the [`DenseOutput`] lent to the
/// output callable:
///
/// ```compile_fail
/// use odebridge_runtime::{DenseOutputEvaluator, StepRecord};
///
/// fn outside(evaluator: &DenseOutputEvaluator, record: &StepRecord) {
///     let _ = evaluator.evaluate(record, 0.5);
/// }
/// ```
#[derive(Clone)]
pub struct DenseOutputEvaluator {
    query: Arc<dyn ContinuationQuery>,
    dimension: usize,
}

impl DenseOutputEvaluator {
    pub fn new(query: Arc<dyn ContinuationQuery>, dimension: usize) -> Self {
        Self { query, dimension }
    }

    /// Evaluator over a kernel continuation routine of width `W`
    pub fn foreign<W: NativeInt>(routine: ContinuationFn<W>, dimension: usize) -> Self {
        Self::new(Arc::new(ForeignContinuation::new(routine)), dimension)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// State at `t` within `[step.t_old, step.t_new]`
    ///
    /// At `t == step.t_new` the recorded state is returned without consulting
    /// the kernel. Anywhere else the kernel is queried once per component.
    pub(crate) fn evaluate(&self, step: &StepRecord, t: f64) -> BridgeResult<Vec<f64>> {
        if t == step.t_new {
            return Ok(step.state.clone());
        }
        let (lo, hi) = if step.t_old <= step.t_new {
            (step.t_old, step.t_new)
        } else {
            (step.t_new, step.t_old)
        };
        if !(lo..=hi).contains(&t) {
            return Err(BridgeError::DenseOutputRange {
                t,
                t_old: step.t_old,
                t_new: step.t_new,
            });
        }
        let handles = step.handles.as_ref().ok_or_else(|| {
            BridgeError::InternalInconsistency(format!(
                "step {} has no continuation buffer",
                step.index
            ))
        })?;
        (0..self.dimension)
            .map(|component| self.query.query(component, t, handles))
            .collect()
    }
}

impl fmt::Debug for DenseOutputEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DenseOutputEvaluator")
            .field("dimension", &self.dimension)
            .finish_non_exhaustive()
    }
}

/// Dense output handed to the output callable for one step
pub struct DenseOutput<'a> {
    evaluator: &'a DenseOutputEvaluator,
    step: &'a StepRecord,
    diagnostics: &'a Diagnostics,
}

impl<'a> DenseOutput<'a> {
    pub(crate) fn new(
        evaluator: &'a DenseOutputEvaluator,
        step: &'a StepRecord,
        diagnostics: &'a Diagnostics,
    ) -> Self {
        Self {
            evaluator,
            step,
            diagnostics,
        }
    }

    pub fn evaluate(&self, t: f64) -> BridgeResult<Vec<f64>> {
        self.diagnostics.emit(
            LogLevel::DENSE,
            format_args!("evaluate t = {} in step {}", t, self.step.index),
        );
        self.evaluator.evaluate(self.step, t)
    }

    /// `(t_old, t_new)` of the step
    pub fn interval(&self) -> (f64, f64) {
        (self.step.t_old, self.step.t_new)
    }
}
