//! Issuing the foreign integrator call
//!
//! [`ForeignIntegrator`] is the seam between the run orchestrator and a
//! concrete kernel. [`Radau5Library`] binds the RADAU5 family: it resolves
//! the integrator and its continuous extension from a shared library, sizes
//! the kernel workspace and passes every argument by reference.

use crate::error::{BridgeError, BridgeResult};
use crate::ffi::callbacks::EntryPoints;
use crate::ffi::codec::IdSlot;
use crate::ffi::loader::{resolve_symbol, LibraryLoader, LoadError};
use crate::ffi::types::{ContinuationFn, JacobianFn, MassFn, NativeInt, RhsFn, SoloutFn};
use crate::matrix::{Bandwidths, StructureSplit};
use crate::solver::Tolerances;
use libloading::Library;
use odebridge_config::Config;
use std::path::Path;
use std::sync::Arc;

/// Storage of the mass matrix as announced to the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MassSpec {
    #[default]
    Identity,
    Full,
    Banded(Bandwidths),
}

/// Everything one foreign integrator call needs
pub struct KernelCall<'a, W: NativeInt> {
    pub dimension: usize,
    pub t: &'a mut f64,
    pub y: &'a mut [f64],
    pub t_end: f64,
    pub tolerances: Tolerances,
    pub entries: EntryPoints<W>,
    /// The kernel calls the Jacobian entry instead of differencing
    pub user_jacobian: bool,
    /// Bandwidths of the Jacobian buffer; `None` for dense storage
    pub jacobian_band: Option<Bandwidths>,
    pub mass: MassSpec,
    /// The kernel calls the step-notification entry after every step
    pub output: bool,
    pub split: StructureSplit,
    pub id_slot: &'a mut IdSlot<W>,
}

/// A foreign integrator of one integer width
pub trait ForeignIntegrator {
    type Int: NativeInt;

    /// Continuous extension routine, valid inside step notifications
    fn continuation(&self) -> ContinuationFn<Self::Int>;

    /// Run the kernel to completion and return its status code
    fn integrate(&self, call: KernelCall<'_, Self::Int>) -> BridgeResult<i32>;
}

/// `RADAU5(N, FCN, X, Y, XEND, H, RTOL, ATOL, ITOL, JAC, IJAC, MLJAC, MUJAC,
/// MAS, IMAS, MLMAS, MUMAS, SOLOUT, IOUT, WORK, LWORK, IWORK, LIWORK, RPAR,
/// IPAR, IDID)`
pub type Radau5Fn<W> = unsafe extern "C" fn(
    *const W,
    RhsFn<W>,
    *mut f64,
    *mut f64,
    *const f64,
    *mut f64,
    *const f64,
    *const f64,
    *const W,
    JacobianFn<W>,
    *const W,
    *const W,
    *const W,
    MassFn<W>,
    *const W,
    *const W,
    *const W,
    SoloutFn<W>,
    *const W,
    *mut f64,
    *const W,
    *mut W,
    *const W,
    *mut f64,
    *mut W,
    *mut W,
);

/// Workspace lengths `(LWORK, LIWORK)` the kernel requires
///
/// Linear systems only involve the `N - M1` free components, so their
/// factorization storage shrinks accordingly.
pub fn radau5_workspace(
    dimension: usize,
    split: StructureSplit,
    jacobian_band: Option<Bandwidths>,
    mass: MassSpec,
) -> (usize, usize) {
    let n = dimension;
    let free = n - split.m1();
    let (ljac, le) = match jacobian_band {
        None => (free, free),
        Some(b) => (b.lower + b.upper + 1, 2 * b.lower + b.upper + 1),
    };
    let lmas = match mass {
        MassSpec::Identity => 0,
        MassSpec::Full => free,
        MassSpec::Banded(b) => b.lower + b.upper + 1,
    };
    let lwork = n * (ljac + 12) + free * (lmas + 3 * le) + 20;
    let liwork = 3 * n + 20;
    (lwork, liwork)
}

/// Integer structure arguments of one RADAU5 call
///
/// The kernel reads a bandwidth equal to `N - M1` as "full", so dense
/// Jacobians and mass matrices are announced with that value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Radau5Structure {
    pub mljac: usize,
    pub mujac: usize,
    pub imas: usize,
    pub mlmas: usize,
    pub mumas: usize,
    /// `IWORK(9)`
    pub m1: usize,
    /// `IWORK(10)`
    pub m2: usize,
}

impl Radau5Structure {
    pub fn new(
        dimension: usize,
        split: StructureSplit,
        jacobian_band: Option<Bandwidths>,
        mass: MassSpec,
    ) -> Self {
        let free = dimension - split.m1();
        let (mljac, mujac) = match jacobian_band {
            None => (free, free),
            Some(b) => (b.lower, b.upper),
        };
        let (imas, mlmas, mumas) = match mass {
            MassSpec::Identity => (0, free, 0),
            MassSpec::Full => (1, free, free),
            MassSpec::Banded(b) => (1, b.lower, b.upper),
        };
        Self {
            mljac,
            mujac,
            imas,
            mlmas,
            mumas,
            m1: split.m1(),
            m2: split.m2(),
        }
    }

    /// Store the special-structure sizes in the kernel's integer workspace
    pub fn write_iwork<W: NativeInt>(&self, iwork: &mut [W]) -> BridgeResult<()> {
        if iwork.len() < 10 {
            return Err(BridgeError::InternalInconsistency(format!(
                "integer workspace of {} cells is too short",
                iwork.len()
            )));
        }
        iwork[8] = W::from_usize(self.m1)?;
        iwork[9] = W::from_usize(self.m2)?;
        Ok(())
    }
}

/// RADAU5 kernel resolved from a shared library
pub struct Radau5Library<W: NativeInt> {
    integrator: Radau5Fn<W>,
    continuation: ContinuationFn<W>,
    _library: Arc<Library>,
}

impl<W: NativeInt> Radau5Library<W> {
    /// Resolve both entry points from `library`
    pub fn open(
        loader: &mut LibraryLoader,
        library: &Path,
        integrator_symbol: &str,
        continuation_symbol: &str,
    ) -> Result<Self, LoadError> {
        let handle = loader.load(library)?;
        // SAFETY: the symbols are the RADAU5 entry points of a build with
        // integer width W
        let integrator = unsafe { resolve_symbol::<Radau5Fn<W>>(&handle, library, integrator_symbol)? };
        let continuation =
            unsafe { resolve_symbol::<ContinuationFn<W>>(&handle, library, continuation_symbol)? };
        Ok(Self {
            integrator,
            continuation,
            _library: handle,
        })
    }

    /// Resolve the kernel named in configuration
    pub fn from_config(config: &Config) -> BridgeResult<Self> {
        if config.int_width() != W::WIDTH {
            return Err(LoadError::WidthMismatch {
                configured: config.int_width(),
                expected: W::WIDTH,
            }
            .into());
        }
        let library = config.kernel_library().ok_or(LoadError::NotConfigured)?;
        let mut loader = LibraryLoader::with_search_paths(config.search_paths());
        Ok(Self::open(
            &mut loader,
            library,
            config.integrator_symbol(),
            config.continuation_symbol(),
        )?)
    }
}

impl<W: NativeInt> ForeignIntegrator for Radau5Library<W> {
    type Int = W;

    fn continuation(&self) -> ContinuationFn<W> {
        self.continuation
    }

    fn integrate(&self, call: KernelCall<'_, W>) -> BridgeResult<i32> {
        let n = W::from_usize(call.dimension)?;
        if call.y.len() != call.dimension {
            return Err(BridgeError::layout(format!(
                "initial state has {} components, dimension is {}",
                call.y.len(),
                call.dimension
            )));
        }

        let structure =
            Radau5Structure::new(call.dimension, call.split, call.jacobian_band, call.mass);
        let mljac = W::from_usize(structure.mljac)?;
        let mujac = W::from_usize(structure.mujac)?;
        let imas = W::from_usize(structure.imas)?;
        let mlmas = W::from_usize(structure.mlmas)?;
        let mumas = W::from_usize(structure.mumas)?;
        let ijac = W::from_i32(call.user_jacobian as i32);
        let iout = W::from_i32(call.output as i32);
        let itol = W::from_i32(0);

        let (lwork_len, liwork_len) =
            radau5_workspace(call.dimension, call.split, call.jacobian_band, call.mass);
        let mut work = vec![0.0f64; lwork_len];
        let mut iwork = vec![W::default(); liwork_len];
        structure.write_iwork(&mut iwork)?;
        let lwork = W::from_usize(lwork_len)?;
        let liwork = W::from_usize(liwork_len)?;

        let mut h = call.tolerances.initial_step;
        let rtol = call.tolerances.rtol;
        let atol = call.tolerances.atol;
        let mut rpar = 0.0f64;
        let mut idid = W::default();

        tracing::debug!(
            target: "odebridge::kernel",
            n = call.dimension,
            lwork = lwork_len,
            liwork = liwork_len,
            "calling RADAU5"
        );

        // SAFETY: every pointer refers to a live local or borrowed buffer of
        // the length the kernel expects for these arguments
        unsafe {
            (self.integrator)(
                &n,
                call.entries.rhs,
                call.t,
                call.y.as_mut_ptr(),
                &call.t_end,
                &mut h,
                &rtol,
                &atol,
                &itol,
                call.entries.jacobian,
                &ijac,
                &mljac,
                &mujac,
                call.entries.mass,
                &imas,
                &mlmas,
                &mumas,
                call.entries.solout,
                &iout,
                work.as_mut_ptr(),
                &lwork,
                iwork.as_mut_ptr(),
                &liwork,
                &mut rpar,
                call.id_slot.as_mut_ptr(),
                &mut idid,
            );
        }

        Ok(idid.to_i64() as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    // full Jacobian, identity mass: N*(N+12) + N*(3N) + 20
    #[case(4, 0, 0, None, MassSpec::Identity, 4 * 16 + 4 * 12 + 20)]
    // banded Jacobian (1, 1), full mass
    #[case(5, 0, 0, Some(Bandwidths::new(1, 1)), MassSpec::Full, 5 * 15 + 5 * (5 + 12) + 20)]
    // special structure shrinks the linear-algebra part
    #[case(6, 4, 2, None, MassSpec::Identity, 6 * 14 + 2 * 6 + 20)]
    fn test_workspace_sizes(
        #[case] n: usize,
        #[case] m1: usize,
        #[case] m2: usize,
        #[case] band: Option<Bandwidths>,
        #[case] mass: MassSpec,
        #[case] expected: usize,
    ) {
        let split = StructureSplit::new(m1, m2).unwrap();
        let (lwork, liwork) = radau5_workspace(n, split, band, mass);
        assert_eq!(lwork, expected);
        assert_eq!(liwork, 3 * n + 20);
    }

    fn structure(
        n: usize,
        m1: usize,
        m2: usize,
        band: Option<Bandwidths>,
        mass: MassSpec,
    ) -> Radau5Structure {
        Radau5Structure::new(n, StructureSplit::new(m1, m2).unwrap(), band, mass)
    }

    #[test]
    fn test_full_mass_under_split_uses_free_size() {
        let s = structure(4, 2, 2, None, MassSpec::Full);
        assert_eq!((s.mljac, s.mujac), (2, 2));
        assert_eq!((s.imas, s.mlmas, s.mumas), (1, 2, 2));
        assert_eq!((s.m1, s.m2), (2, 2));
    }

    #[rstest]
    #[case(3, 0, 0, None, MassSpec::Identity, (3, 3, 0, 3, 0))]
    #[case(3, 0, 0, None, MassSpec::Full, (3, 3, 1, 3, 3))]
    #[case(5, 0, 0, Some(Bandwidths::new(2, 1)), MassSpec::Banded(Bandwidths::new(1, 0)), (2, 1, 1, 1, 0))]
    #[case(6, 4, 2, Some(Bandwidths::new(1, 1)), MassSpec::Identity, (1, 1, 0, 2, 0))]
    #[case(6, 4, 2, Some(Bandwidths::new(1, 1)), MassSpec::Banded(Bandwidths::new(1, 0)), (1, 1, 1, 1, 0))]
    #[case(6, 3, 3, None, MassSpec::Full, (3, 3, 1, 3, 3))]
    fn test_structure_arguments(
        #[case] n: usize,
        #[case] m1: usize,
        #[case] m2: usize,
        #[case] band: Option<Bandwidths>,
        #[case] mass: MassSpec,
        #[case] expected: (usize, usize, usize, usize, usize),
    ) {
        let s = structure(n, m1, m2, band, mass);
        assert_eq!((s.mljac, s.mujac, s.imas, s.mlmas, s.mumas), expected);
    }

    #[test]
    fn test_iwork_carries_split() {
        let s = structure(6, 4, 2, None, MassSpec::Identity);
        let mut iwork = vec![0i32; 3 * 6 + 20];
        s.write_iwork(&mut iwork).unwrap();
        assert_eq!(&iwork[8..10], &[4, 2]);
        assert!(iwork[..8].iter().chain(&iwork[10..]).all(|&v| v == 0));

        let mut wide = vec![0i64; 38];
        structure(6, 0, 0, None, MassSpec::Identity)
            .write_iwork(&mut wide)
            .unwrap();
        assert_eq!(&wide[8..10], &[0, 0]);
    }

    #[test]
    fn test_iwork_too_short() {
        let s = structure(2, 0, 0, None, MassSpec::Identity);
        let mut iwork = vec![0i64; 9];
        assert!(matches!(
            s.write_iwork(&mut iwork),
            Err(BridgeError::InternalInconsistency(_))
        ));
    }

    #[test]
    fn test_from_config_checks_width() {
        let config = Config::default();
        let result = Radau5Library::<i32>::from_config(&config);
        assert!(matches!(
            result,
            Err(BridgeError::Load(LoadError::WidthMismatch {
                configured: 64,
                expected: 32
            }))
        ));
    }

    #[test]
    fn test_from_config_requires_library() {
        let result = Radau5Library::<i64>::from_config(&Config::default());
        assert!(matches!(result, Err(BridgeError::Load(LoadError::NotConfigured))));
    }
}
