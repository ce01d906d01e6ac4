//! Run orchestration
//!
//! A [`Solver`] turns a [`Problem`] into one foreign integrator call:
//! 1. Validate the problem's structure
//! 2. Register its context and install the registry for this thread
//! 3. Call the kernel with the bridge entry points
//! 4. Retire the context, then surface the first latched failure or the
//!    kernel's status
//!
//! The context is retired on every path, including panics.

use crate::context::{CallContext, CallCounters, OutputMode, StepControl, StepEvent};
use crate::dense::DenseOutputEvaluator;
use crate::diagnostics::{Diagnostics, LogLevel};
use crate::error::{BridgeError, BridgeResult, UserError};
use crate::ffi::callbacks::EntryPoints;
use crate::ffi::caller::{ForeignIntegrator, KernelCall, MassSpec, Radau5Library};
use crate::ffi::codec::encode;
use crate::ffi::types::NativeInt;
use crate::matrix::{Bandwidths, MatrixShape, StructureSplit, StructuredMatrix};
use crate::registry::{lock_context, CallId, CallRegistry, ContextHandle, RegistryScope};
use odebridge_config::Config;
use std::sync::Arc;

/// Error control and starting step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerances {
    pub rtol: f64,
    pub atol: f64,
    pub initial_step: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            rtol: 1e-3,
            atol: 1e-6,
            initial_step: 1e-6,
        }
    }
}

impl Tolerances {
    pub fn new(rtol: f64, atol: f64) -> Self {
        Self {
            rtol,
            atol,
            ..Self::default()
        }
    }

    pub fn with_initial_step(mut self, h: f64) -> Self {
        self.initial_step = h;
        self
    }
}

/// How the kernel finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelStatus {
    /// Reached the end of the interval
    Completed,
    /// Stopped by the output callable
    Interrupted,
}

impl KernelStatus {
    /// Interpret a kernel status code
    pub fn from_code(code: i32) -> BridgeResult<Self> {
        match code {
            1 => Ok(KernelStatus::Completed),
            2 => Ok(KernelStatus::Interrupted),
            -1 => Err(kernel_failed(code, "input is not consistent")),
            -2 => Err(kernel_failed(code, "larger step budget needed")),
            -3 => Err(kernel_failed(code, "step size became too small")),
            -4 => Err(kernel_failed(code, "matrix is repeatedly singular")),
            c if c < 0 => Err(kernel_failed(code, "unknown failure")),
            c => Err(BridgeError::InternalInconsistency(format!(
                "kernel returned unexpected status {}",
                c
            ))),
        }
    }
}

fn kernel_failed(code: i32, reason: &'static str) -> BridgeError {
    BridgeError::KernelFailed { code, reason }
}

/// One integration problem
pub struct Problem {
    context: CallContext,
    t0: f64,
    y0: Vec<f64>,
    t_end: f64,
    tolerances: Tolerances,
    own_diagnostics: bool,
}

impl Problem {
    /// Integrate `rhs` from `(t0, y0)` to `t_end`
    pub fn new(
        t0: f64,
        y0: Vec<f64>,
        t_end: f64,
        rhs: impl FnMut(f64, &[f64], &mut [f64]) -> Result<(), UserError> + Send + 'static,
    ) -> Self {
        Self {
            context: CallContext::new(y0.len(), Box::new(rhs)),
            t0,
            y0,
            t_end,
            tolerances: Tolerances::default(),
            own_diagnostics: false,
        }
    }

    pub fn with_jacobian(
        mut self,
        jacobian: impl FnMut(f64, &[f64], &mut StructuredMatrix) -> Result<(), UserError>
            + Send
            + 'static,
    ) -> Self {
        self.context = self.context.with_jacobian(Box::new(jacobian));
        self
    }

    pub fn with_jacobian_band(mut self, lower: usize, upper: usize) -> Self {
        self.context = self.context.with_jacobian_band(Bandwidths::new(lower, upper));
        self
    }

    pub fn with_mass(mut self, mass: StructuredMatrix) -> Self {
        self.context = self.context.with_mass(mass);
        self
    }

    pub fn with_output(
        mut self,
        mode: OutputMode,
        output: impl FnMut(&StepEvent<'_>) -> Result<StepControl, UserError> + Send + 'static,
    ) -> Self {
        self.context = self.context.with_output(mode, Box::new(output));
        self
    }

    pub fn with_split(mut self, split: StructureSplit) -> Self {
        self.context = self.context.with_split(split);
        self
    }

    pub fn with_tolerances(mut self, tolerances: Tolerances) -> Self {
        self.tolerances = tolerances;
        self
    }

    /// Diagnostics for this run; takes precedence over the solver's defaults
    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.context = self.context.with_diagnostics(diagnostics);
        self.own_diagnostics = true;
        self
    }

    pub fn dimension(&self) -> usize {
        self.context.dimension()
    }

    /// Structural checks; a failing problem never reaches the kernel
    pub fn validate(&self) -> BridgeResult<()> {
        self.context.validate()
    }
}

/// Result of a finished run
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    /// Time the kernel stopped at
    pub t: f64,
    /// State at `t`
    pub y: Vec<f64>,
    pub status: KernelStatus,
    pub counters: CallCounters,
}

/// Unregisters a run when dropped, unless retired explicitly
struct RunGuard<'a> {
    registry: &'a CallRegistry,
    id: CallId,
    retired: bool,
}

impl RunGuard<'_> {
    fn retire(mut self) -> ContextHandle {
        self.retired = true;
        self.registry.unregister(self.id)
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.retired {
            self.registry.unregister(self.id);
        }
    }
}

fn mass_spec(shape: Option<MatrixShape>) -> MassSpec {
    match shape {
        None => MassSpec::Identity,
        Some(shape) => match shape.bandwidths() {
            Some(band) => MassSpec::Banded(band),
            None => MassSpec::Full,
        },
    }
}

/// Drives a foreign integrator through the callback bridge
pub struct Solver<K: ForeignIntegrator> {
    kernel: K,
    registry: Arc<CallRegistry>,
    diagnostics: Option<Diagnostics>,
}

impl<K: ForeignIntegrator> Solver<K> {
    /// Solver using the process-wide registry
    pub fn new(kernel: K) -> Self {
        Self::with_registry(kernel, CallRegistry::global())
    }

    pub fn with_registry(kernel: K, registry: Arc<CallRegistry>) -> Self {
        Self {
            kernel,
            registry,
            diagnostics: None,
        }
    }

    /// Diagnostics for every problem that does not bring its own
    pub fn with_default_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn registry(&self) -> &Arc<CallRegistry> {
        &self.registry
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn solve(&self, problem: Problem) -> BridgeResult<Solution> {
        let Problem {
            mut context,
            t0,
            mut y0,
            t_end,
            tolerances,
            own_diagnostics,
        } = problem;
        context.validate()?;
        if let (false, Some(defaults)) = (own_diagnostics, self.diagnostics.as_ref()) {
            context.diagnostics = defaults.clone();
        }

        let dimension = context.dimension();
        let split = context.split();
        let jacobian_band = context.jacobian_shape()?.bandwidths();
        let mass = mass_spec(context.mass_shape()?);
        let user_jacobian = context.has_jacobian();
        let output = context.output_mode() != OutputMode::None;
        if context.output_mode() == OutputMode::Dense {
            context.install_evaluator(DenseOutputEvaluator::foreign(
                self.kernel.continuation(),
                dimension,
            ));
        }
        let diagnostics = context.diagnostics().clone();

        let id = self.registry.register(context);
        let guard = RunGuard {
            registry: &self.registry,
            id,
            retired: false,
        };
        diagnostics.emit(
            LogLevel::GENERAL,
            format_args!(
                "run {} started: n = {}, t = {} -> {}",
                id, dimension, t0, t_end
            ),
        );

        let scope = RegistryScope::enter(self.registry.clone());
        let mut slot = encode::<K::Int>(id);
        let mut t = t0;
        let code = self.kernel.integrate(KernelCall {
            dimension,
            t: &mut t,
            y: &mut y0,
            t_end,
            tolerances,
            entries: EntryPoints::bridge(),
            user_jacobian,
            jacobian_band,
            mass,
            output,
            split,
            id_slot: &mut slot,
        });
        let scope_failure = scope.take_failure();
        drop(scope);

        let handle = guard.retire();
        let (context_failure, counters) = {
            let mut ctx = lock_context(&handle);
            (ctx.take_failure(), ctx.counters())
        };
        diagnostics.emit(
            LogLevel::GENERAL,
            format_args!(
                "run {} finished at t = {}: {} rhs, {} jacobian, {} steps",
                id, t, counters.rhs, counters.jacobian, counters.steps
            ),
        );

        if let Some(err) = scope_failure.or(context_failure) {
            tracing::debug!(target: "odebridge::solver", %id, error = %err, "run failed");
            return Err(err);
        }
        let status = KernelStatus::from_code(code?)?;
        Ok(Solution {
            t,
            y: y0,
            status,
            counters,
        })
    }
}

impl<W: NativeInt> Solver<Radau5Library<W>> {
    /// RADAU5 solver for the kernel named in configuration
    ///
    /// The `[logging]` section becomes the default diagnostics of every run.
    pub fn from_config(config: &Config) -> BridgeResult<Self> {
        Ok(Self::new(Radau5Library::from_config(config)?)
            .with_default_diagnostics(Diagnostics::from_config(config)))
    }
}
