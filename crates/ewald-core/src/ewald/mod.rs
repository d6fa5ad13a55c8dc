//! Ewald splitting parameters, plain Ewald summation and the dispersion tail correction.

pub mod dispersion;
pub mod ewald_sum;
pub mod parameters;

pub use dispersion::dispersion_correction_coefficient;
pub use ewald_sum::EwaldSumSolver;
pub use parameters::{EwaldParameterDeriver, find_legal_dimension};
