//! Physical and numerical constants shared by the Ewald kernels.
//!
//! Units are nm, kJ/mol and elementary charges throughout.

pub const PI: f64 = std::f64::consts::PI;
pub const SQRT_PI: f64 = 1.772_453_850_905_516_f64;
pub const TWO_OVER_SQRT_PI: f64 = std::f64::consts::FRAC_2_SQRT_PI;

/// Coulomb prefactor 1/(4 pi eps0) in kJ nm / (mol e^2).
pub const ONE_4PI_EPS0: f64 = 138.935_456_f64;

pub const DEFAULT_EWALD_ERROR_TOLERANCE: f64 = 5.0e-4;
pub const DEFAULT_PME_ORDER: usize = 5;
pub const MIN_PME_GRID_DIMENSION: usize = 6;
pub const LEGAL_FFT_FACTORS: [usize; 4] = [2, 3, 5, 7];

/// B-spline moduli below this value are replaced by the mean of their neighbours.
pub const BSPLINE_MODULUS_FLOOR: f64 = 1.0e-7;

/// Fixed-point scale (2^32) for order-independent force and charge accumulation.
pub const FIXED_POINT_SCALE: f64 = 4_294_967_296.0;

pub const PARTICLE_PADDING: usize = 32;
pub const MAX_EWALD_KMAX: usize = 1000;
