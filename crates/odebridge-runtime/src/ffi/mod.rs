//! Boundary with the foreign integrator
//!
//! - Kernel ABI types, generic over integer width (`types`)
//! - Identifier packing into the integer parameter array (`codec`)
//! - Checked views over kernel buffers (`safety`)
//! - Matrix layout conversion (`marshal`)
//! - Callback entry points (`callbacks`)
//! - Kernel loading and the integrator call (`loader`, `caller`)
//!
//! # Safety
//!
//! Raw pointers from the kernel are validated in `safety` and never leave
//! this module as anything but slices and `ndarray` views.

pub mod callbacks;
pub mod caller;
pub mod codec;
pub mod loader;
pub mod marshal;
pub mod safety;
pub mod types;

pub use callbacks::{
    handle_jacobian, handle_mass, handle_rhs, jacobian_entry, mass_entry, rhs_entry,
    solout_entry, EntryPoints, CONTINUE, STOP,
};
pub use caller::{
    radau5_workspace, ForeignIntegrator, KernelCall, MassSpec, Radau5Library, Radau5Structure,
};
pub use codec::{decode, encode, IdSlot, IdentifierCodec};
pub use loader::{LibraryLoader, LoadError};
pub use types::{ContinuationFn, JacobianFn, MassFn, NativeInt, RhsFn, SoloutFn};
