//! Per-run context
//!
//! One [`CallContext`] exists for every foreign call in flight. It owns the
//! user callables and the mass matrix, records the most recent accepted step,
//! and holds the first failure raised while the kernel had control.

use crate::dense::{DenseOutput, DenseOutputEvaluator};
use crate::diagnostics::Diagnostics;
use crate::error::{BridgeError, BridgeResult, UserError};
use crate::matrix::{Bandwidths, MatrixShape, StructureSplit, StructuredMatrix};

/// `f(t, y, dy)`: write the derivative of `y` at `t` into `dy`
pub type RhsCallable = Box<dyn FnMut(f64, &[f64], &mut [f64]) -> Result<(), UserError> + Send>;

/// `jac(t, y, m)`: fill `m`, which arrives zeroed in the run's Jacobian shape
pub type JacobianCallable =
    Box<dyn FnMut(f64, &[f64], &mut StructuredMatrix) -> Result<(), UserError> + Send>;

/// Called after every accepted step
pub type OutputCallable =
    Box<dyn FnMut(&StepEvent<'_>) -> Result<StepControl, UserError> + Send>;

/// What the output callable is offered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    None,
    /// Step endpoints only
    StepOnly,
    /// Step endpoints plus interpolation inside the step
    Dense,
}

/// Answer of the output callable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepControl {
    Continue,
    Stop,
    /// Continue after the callable changed the state; not representable to
    /// the kernel
    ContinueWithStateChange,
}

/// Kernel-owned continuous extension buffer of the current step
///
/// Valid only until the kernel's next step notification. Handles are created
/// by the step-notification entry alone and never leave the crate:
///
/// ```compile_fail
/// let handles = odebridge_runtime::ContinuationHandles::new(std::ptr::null(), 0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContinuationHandles {
    pub(crate) buffer: *const f64,
    pub(crate) len: usize,
}

// The pointer is only read on the thread running the foreign call
unsafe impl Send for ContinuationHandles {}
unsafe impl Sync for ContinuationHandles {}

impl ContinuationHandles {
    pub(crate) fn new(buffer: *const f64, len: usize) -> Self {
        Self { buffer, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Most recent accepted step
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StepRecord {
    pub index: u64,
    pub t_old: f64,
    pub t_new: f64,
    pub state: Vec<f64>,
    pub(crate) handles: Option<ContinuationHandles>,
}

impl StepRecord {
    pub fn new(index: u64, t_old: f64, t_new: f64, state: Vec<f64>) -> Self {
        Self {
            index,
            t_old,
            t_new,
            state,
            handles: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_handles(mut self, handles: ContinuationHandles) -> Self {
        self.handles = Some(handles);
        self
    }
}

/// View of one accepted step handed to the output callable
pub struct StepEvent<'a> {
    pub index: u64,
    pub t_old: f64,
    pub t_new: f64,
    pub state: &'a [f64],
    pub(crate) dense: Option<DenseOutput<'a>>,
}

impl<'a> StepEvent<'a> {
    /// Interpolation inside this step; present in dense mode only
    pub fn dense(&self) -> Option<&DenseOutput<'a>> {
        self.dense.as_ref()
    }
}

/// Callback counts of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallCounters {
    pub rhs: u64,
    pub jacobian: u64,
    pub mass: u64,
    pub steps: u64,
}

/// State of one run
pub struct CallContext {
    pub(crate) dimension: usize,
    pub(crate) diagnostics: Diagnostics,
    pub(crate) split: StructureSplit,
    pub(crate) rhs: RhsCallable,
    pub(crate) jacobian: Option<JacobianCallable>,
    pub(crate) jacobian_band: Option<Bandwidths>,
    pub(crate) mass: Option<StructuredMatrix>,
    pub(crate) output: Option<OutputCallable>,
    pub(crate) output_mode: OutputMode,
    pub(crate) last_step: StepRecord,
    pub(crate) evaluator: Option<DenseOutputEvaluator>,
    pub(crate) failure: Option<BridgeError>,
    pub(crate) counters: CallCounters,
}

impl CallContext {
    pub fn new(dimension: usize, rhs: RhsCallable) -> Self {
        Self {
            dimension,
            diagnostics: Diagnostics::default(),
            split: StructureSplit::none(),
            rhs,
            jacobian: None,
            jacobian_band: None,
            mass: None,
            output: None,
            output_mode: OutputMode::None,
            last_step: StepRecord::default(),
            evaluator: None,
            failure: None,
            counters: CallCounters::default(),
        }
    }

    pub fn with_jacobian(mut self, jacobian: JacobianCallable) -> Self {
        self.jacobian = Some(jacobian);
        self
    }

    /// Bandwidths of the Jacobian; unset means a full Jacobian
    pub fn with_jacobian_band(mut self, band: Bandwidths) -> Self {
        self.jacobian_band = Some(band);
        self
    }

    /// Constant mass matrix over the `d - M1` free components; identity when unset
    pub fn with_mass(mut self, mass: StructuredMatrix) -> Self {
        self.mass = Some(mass);
        self
    }

    pub fn with_output(mut self, mode: OutputMode, output: OutputCallable) -> Self {
        self.output_mode = mode;
        self.output = Some(output);
        self
    }

    pub fn with_split(mut self, split: StructureSplit) -> Self {
        self.split = split;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub(crate) fn install_evaluator(&mut self, evaluator: DenseOutputEvaluator) {
        self.evaluator = Some(evaluator);
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn split(&self) -> StructureSplit {
        self.split
    }

    pub fn output_mode(&self) -> OutputMode {
        self.output_mode
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn last_step(&self) -> &StepRecord {
        &self.last_step
    }

    pub fn counters(&self) -> CallCounters {
        self.counters
    }

    pub fn has_jacobian(&self) -> bool {
        self.jacobian.is_some()
    }

    pub fn jacobian_band(&self) -> Option<Bandwidths> {
        self.jacobian_band
    }

    pub fn mass(&self) -> Option<&StructuredMatrix> {
        self.mass.as_ref()
    }

    /// Buffer shape of the Jacobian region
    pub fn jacobian_shape(&self) -> BridgeResult<MatrixShape> {
        MatrixShape::jacobian(self.dimension, self.split, self.jacobian_band)
    }

    /// Buffer shape of the mass matrix; `None` for the implicit identity
    pub fn mass_shape(&self) -> BridgeResult<Option<MatrixShape>> {
        self.mass.as_ref().map(MatrixShape::of).transpose()
    }

    /// Check every structural invariant before the run starts
    pub fn validate(&self) -> BridgeResult<()> {
        if self.dimension == 0 {
            return Err(BridgeError::layout("state dimension must be positive"));
        }
        let jacobian_band = self.jacobian_shape()?.bandwidths();
        if let Some(shape) = self.mass_shape()? {
            let region = self.dimension - self.split.m1();
            let ok = match shape {
                MatrixShape::Full { rows, cols } => rows == region && cols == region,
                MatrixShape::Banded(layout) => layout.rows == region,
                MatrixShape::Blocks { .. } => false,
            };
            if !ok {
                return Err(BridgeError::layout(format!(
                    "mass matrix must be a single {}x{} matrix",
                    region, region
                )));
            }
            // the kernel factors M and J in one storage scheme
            match (jacobian_band, shape.bandwidths()) {
                (Some(jac), Some(mass)) if mass.lower > jac.lower || mass.upper > jac.upper => {
                    return Err(BridgeError::layout(format!(
                        "mass bandwidths ({}, {}) exceed Jacobian bandwidths ({}, {})",
                        mass.lower, mass.upper, jac.lower, jac.upper
                    )));
                }
                (Some(_), None) => {
                    return Err(BridgeError::layout(
                        "a dense mass matrix requires a dense Jacobian",
                    ));
                }
                _ => {}
            }
        }
        if self.output_mode != OutputMode::None && self.output.is_none() {
            return Err(BridgeError::layout("output mode set without an output callable"));
        }
        Ok(())
    }

    /// Remember a failure; only the first one is kept
    pub(crate) fn latch(&mut self, err: BridgeError) {
        if self.failure.is_none() {
            tracing::debug!(target: "odebridge::bridge", error = %err, "latched failure");
            self.failure = Some(err);
        }
    }

    pub fn has_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub(crate) fn take_failure(&mut self) -> Option<BridgeError> {
        self.failure.take()
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("dimension", &self.dimension)
            .field("split", &self.split)
            .field("jacobian", &self.jacobian.is_some())
            .field("jacobian_band", &self.jacobian_band)
            .field("output_mode", &self.output_mode)
            .field("last_step", &self.last_step)
            .field("failure", &self.failure)
            .field("counters", &self.counters)
            .finish()
    }
}
