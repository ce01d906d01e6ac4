//! odebridge runtime - callback bridge to stateful foreign ODE integrators
//!
//! This library lets Rust code drive an integrator kernel that only speaks
//! through function-pointer callbacks and flat buffers:
//! - Call registry recovering per-run context inside callbacks
//! - Banded and block-partitioned matrix marshaling
//! - Callback entry points for both kernel integer widths
//! - Dense output inside the last accepted step
//! - Run orchestration and RADAU5 kernel binding

/// Runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod context;
pub mod dense;
pub mod diagnostics;
pub mod error;
pub mod ffi;
pub mod matrix;
pub mod registry;
pub mod solver;

pub use context::{
    CallContext, CallCounters, ContinuationHandles, JacobianCallable, OutputCallable, OutputMode,
    RhsCallable, StepControl, StepEvent, StepRecord,
};
pub use dense::{ContinuationQuery, DenseOutput, DenseOutputEvaluator, ForeignContinuation};
pub use diagnostics::{Diagnostics, LogLevel, LogSink};
pub use error::{BridgeError, BridgeResult, CallableKind, UserError};
pub use matrix::{
    BandedLayout, BandedMatrix, Bandwidths, MatrixShape, StructureSplit, StructuredMatrix,
};
pub use registry::{CallId, CallRegistry, ContextHandle, RegistryScope};
pub use solver::{KernelStatus, Problem, Solution, Solver, Tolerances};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smoke() {
        assert_eq!(VERSION, "0.1.0");
    }
}
