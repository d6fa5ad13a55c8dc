//! Smooth particle-mesh Ewald for Coulomb and dispersion interactions.

pub mod bspline;
pub mod fft;
pub mod solver;
pub mod spread;

pub use bspline::{BSplineModuliCache, ParticleSplines, bspline_moduli};
pub use fft::{Fft3d, RustFft3d};
pub use solver::{
    MeshGrids, MeshKind, MeshPipeline, ReciprocalSpaceSolver, SolverPhase, dispersion_coefficient,
};
pub use spread::{GridIndexSort, SpreadStrategy, StableKeySort};
