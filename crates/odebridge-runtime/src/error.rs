//! Error taxonomy for the bridge
//!
//! Every failure surfaces to the application that started the run. Failures
//! that happen inside a foreign callback are latched and raised only after the
//! foreign call has returned.

use crate::ffi::loader::LoadError;
use crate::registry::CallId;
use odebridge_config::ConfigError;
use std::any::Any;
use std::fmt;
use thiserror::Error;

/// Error produced by user code (right-hand side, Jacobian, output callable)
pub type UserError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Which user callable failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallableKind {
    RightHandSide,
    Jacobian,
    Output,
}

impl fmt::Display for CallableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallableKind::RightHandSide => write!(f, "right-hand side"),
            CallableKind::Jacobian => write!(f, "Jacobian"),
            CallableKind::Output => write!(f, "output"),
        }
    }
}

/// Bridge errors
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Identifier unknown to the registry, or bookkeeping is otherwise broken
    #[error("internal inconsistency: {0}")]
    InternalInconsistency(String),

    /// User code asked for something the kernel cannot do from inside a callback
    #[error("unsupported capability: {0}")]
    UnsupportedCapability(String),

    /// A user callable returned an error or panicked inside a callback
    #[error("{kind} callable failed: {source}")]
    UserCallableFailure {
        kind: CallableKind,
        #[source]
        source: UserError,
    },

    /// Banded or blocked structure violates its invariants
    #[error("layout violation: {0}")]
    LayoutViolation(String),

    /// Dense output requested outside the last accepted step
    #[error("dense output at t = {t} is outside the step [{t_old}, {t_new}]")]
    DenseOutputRange { t: f64, t_old: f64, t_new: f64 },

    /// The kernel returned a negative status code
    #[error("kernel failed with status {code} ({reason})")]
    KernelFailed { code: i32, reason: &'static str },

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BridgeError {
    pub(crate) fn unknown_call(id: CallId) -> Self {
        BridgeError::InternalInconsistency(format!("call {} is not registered", id))
    }

    pub(crate) fn layout(msg: impl Into<String>) -> Self {
        BridgeError::LayoutViolation(msg.into())
    }

    /// Wrap a caught panic payload as a user callable failure
    pub(crate) fn from_panic(kind: CallableKind, payload: Box<dyn Any + Send>) -> Self {
        BridgeError::UserCallableFailure {
            kind,
            source: format!("panicked: {}", panic_message(payload.as_ref())).into(),
        }
    }
}

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
