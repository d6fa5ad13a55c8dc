//! Small numeric helpers shared across the Ewald kernels.

use statrs::function::erf;

pub fn relative_difference(lhs: f64, rhs: f64, relative_floor: f64) -> f64 {
    let scale = lhs.abs().max(rhs.abs()).max(relative_floor);
    (lhs - rhs).abs() / scale
}

pub fn within_tolerance(
    lhs: f64,
    rhs: f64,
    abs_tol: f64,
    rel_tol: f64,
    relative_floor: f64,
) -> bool {
    let abs_diff = (lhs - rhs).abs();
    abs_diff <= abs_tol || relative_difference(lhs, rhs, relative_floor) <= rel_tol
}

pub fn erfc(x: f64) -> f64 {
    erf::erfc(x)
}

pub fn erf(x: f64) -> f64 {
    erf::erf(x)
}

/// Polynomial damping `exp(-x^2) (1 + x^2 + x^4 / 2)` that appears in the dispersion Ewald
/// split and in the dispersion alpha criterion.
pub fn dispersion_damping(x: f64) -> f64 {
    let x2 = x * x;
    (-x2).exp() * (1.0 + x2 + 0.5 * x2 * x2)
}

/// Smallest integer `>= minimum` whose prime factors all belong to `factors`.
pub fn smallest_smooth_number(minimum: usize, factors: &[usize]) -> usize {
    let mut candidate = minimum.max(1);
    loop {
        let mut remainder = candidate;
        for &factor in factors {
            while remainder % factor == 0 {
                remainder /= factor;
            }
        }
        if remainder == 1 {
            return candidate;
        }
        candidate += 1;
    }
}
