//! Derivation of splitting parameters and grid sizes from a cutoff and an error tolerance.

use tracing::debug;

use crate::common::constants::{
    LEGAL_FFT_FACTORS, MAX_EWALD_KMAX, MIN_PME_GRID_DIMENSION, PI,
};
use crate::domain::{EwaldError, EwaldResult, PeriodicBox, PmeParameters};
use crate::numerics::{dispersion_damping, smallest_smooth_number};

/// Smallest FFT-friendly dimension (prime factors 2, 3, 5 and 7 only) that is `>= minimum`.
pub fn find_legal_dimension(minimum: usize) -> usize {
    smallest_smooth_number(minimum, &LEGAL_FFT_FACTORS)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EwaldParameterDeriver {
    cutoff: f64,
    tolerance: f64,
}

impl EwaldParameterDeriver {
    pub fn new(cutoff: f64, tolerance: f64) -> EwaldResult<Self> {
        if !(cutoff > 0.0 && cutoff.is_finite()) {
            return Err(EwaldError::configuration(
                "EWALD.CUTOFF",
                format!("cutoff must be positive and finite, got {cutoff}"),
            ));
        }
        if !(tolerance > 0.0 && tolerance < 0.5) {
            return Err(EwaldError::configuration(
                "EWALD.TOLERANCE",
                format!("error tolerance must lie in (0, 0.5), got {tolerance}"),
            ));
        }

        Ok(Self { cutoff, tolerance })
    }

    pub const fn cutoff(&self) -> f64 {
        self.cutoff
    }

    pub const fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// `alpha = sqrt(-ln(2 tol)) / cutoff`.
    pub fn electrostatic_alpha(&self) -> f64 {
        (-(2.0 * self.tolerance).ln()).sqrt() / self.cutoff
    }

    /// Alpha at which the dispersion damping `exp(-x^2)(1 + x^2 + x^4/2)` with `x = alpha rc`
    /// equals the tolerance.
    pub fn dispersion_alpha(&self) -> f64 {
        let mut low = 0.0_f64;
        let mut high = 1.0_f64;
        while dispersion_damping(high) > self.tolerance {
            high *= 2.0;
        }
        for _ in 0..200 {
            let mid = 0.5 * (low + high);
            if dispersion_damping(mid) > self.tolerance {
                low = mid;
            } else {
                high = mid;
            }
            if high - low <= 1.0e-14 * high {
                break;
            }
        }

        0.5 * (low + high) / self.cutoff
    }

    fn grid_for(&self, alpha: f64, scale: f64, periodic_box: &PeriodicBox) -> [usize; 3] {
        let denominator = 3.0 * self.tolerance.powf(0.2);
        periodic_box.diagonal().map(|length| {
            let size = (scale * alpha * length / denominator).ceil() as usize;
            find_legal_dimension(size.max(MIN_PME_GRID_DIMENSION))
        })
    }

    pub fn pme_parameters(&self, periodic_box: &PeriodicBox) -> PmeParameters {
        let alpha = self.electrostatic_alpha();
        let parameters = PmeParameters {
            alpha,
            grid: self.grid_for(alpha, 2.0, periodic_box),
        };
        debug!(alpha, grid = ?parameters.grid, "derived PME parameters");
        parameters
    }

    pub fn lj_pme_parameters(&self, periodic_box: &PeriodicBox) -> PmeParameters {
        let alpha = self.dispersion_alpha();
        let parameters = PmeParameters {
            alpha,
            grid: self.grid_for(alpha, 1.0, periodic_box),
        };
        debug!(alpha, grid = ?parameters.grid, "derived LJ-PME parameters");
        parameters
    }

    /// Per-axis wave-vector bound for plain Ewald summation, always odd.
    pub fn ewald_kmax(&self, alpha: f64, periodic_box: &PeriodicBox) -> [usize; 3] {
        periodic_box.diagonal().map(|width| {
            let error = |k: usize| {
                let k = k as f64;
                let temp = k * PI / (width * alpha);
                0.05 * (width * alpha).sqrt() * k * (-temp * temp).exp()
            };
            let mut kmax = 1;
            while kmax < MAX_EWALD_KMAX && error(kmax) > self.tolerance {
                kmax += 1;
            }
            if kmax % 2 == 0 { kmax + 1 } else { kmax }
        })
    }

    /// Explicit parameters win when their alpha is nonzero; grid sizes are then rounded up to
    /// legal FFT dimensions.
    pub fn resolve(
        explicit: Option<PmeParameters>,
        derived: impl FnOnce() -> PmeParameters,
    ) -> EwaldResult<PmeParameters> {
        match explicit {
            Some(parameters) if parameters.alpha != 0.0 => {
                if !(parameters.alpha > 0.0 && parameters.alpha.is_finite()) {
                    return Err(EwaldError::configuration(
                        "EWALD.ALPHA",
                        format!("explicit alpha must be positive, got {}", parameters.alpha),
                    ));
                }
                if parameters.grid.contains(&0) {
                    return Err(EwaldError::configuration(
                        "EWALD.GRID",
                        format!("explicit grid {:?} has a zero dimension", parameters.grid),
                    ));
                }
                Ok(PmeParameters {
                    alpha: parameters.alpha,
                    grid: parameters.grid.map(find_legal_dimension),
                })
            }
            _ => Ok(derived()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{EwaldParameterDeriver, find_legal_dimension};
    use crate::common::constants::MIN_PME_GRID_DIMENSION;
    use crate::domain::{PeriodicBox, PmeParameters};
    use crate::numerics::dispersion_damping;

    fn is_legal(size: usize) -> bool {
        let mut remainder = size;
        for factor in [2, 3, 5, 7] {
            while remainder % factor == 0 {
                remainder /= factor;
            }
        }
        remainder == 1
    }

    #[test]
    fn electrostatic_alpha_matches_closed_form() {
        let deriver = EwaldParameterDeriver::new(1.0, 5.0e-4).expect("deriver should build");
        let expected = (-(1.0e-3_f64).ln()).sqrt();
        assert!((deriver.electrostatic_alpha() - expected).abs() <= 1.0e-12);
    }

    #[test]
    fn derived_grids_are_legal_and_large_enough() {
        let periodic_box = PeriodicBox::rectangular(2.0, 3.1, 5.7).expect("box should be valid");
        for tolerance in [1.0e-3, 5.0e-4, 1.0e-5] {
            for cutoff in [0.8, 1.0, 1.2] {
                let deriver =
                    EwaldParameterDeriver::new(cutoff, tolerance).expect("deriver should build");
                for parameters in [
                    deriver.pme_parameters(&periodic_box),
                    deriver.lj_pme_parameters(&periodic_box),
                ] {
                    for size in parameters.grid {
                        assert!(size >= MIN_PME_GRID_DIMENSION);
                        assert!(is_legal(size), "{size} is not a legal FFT size");
                    }
                }
            }
        }
    }

    #[test]
    fn pme_grid_follows_alpha_and_box_length() {
        let periodic_box = PeriodicBox::rectangular(2.0, 2.0, 2.0).expect("box should be valid");
        let deriver = EwaldParameterDeriver::new(0.9, 5.0e-4).expect("deriver should build");
        let parameters = deriver.pme_parameters(&periodic_box);
        let raw = (2.0 * parameters.alpha * 2.0 / (3.0 * 5.0e-4_f64.powf(0.2))).ceil() as usize;

        assert_eq!(parameters.grid, [find_legal_dimension(raw); 3]);
    }

    #[test]
    fn dispersion_alpha_solves_damping_equation() {
        let deriver = EwaldParameterDeriver::new(1.2, 5.0e-4).expect("deriver should build");
        let alpha = deriver.dispersion_alpha();
        assert!((dispersion_damping(alpha * 1.2) - 5.0e-4).abs() <= 1.0e-10);
    }

    #[test]
    fn ewald_kmax_is_odd_and_grows_with_tighter_tolerance() {
        let periodic_box = PeriodicBox::rectangular(2.0, 2.0, 3.0).expect("box should be valid");
        let loose = EwaldParameterDeriver::new(1.0, 1.0e-3).expect("deriver should build");
        let tight = EwaldParameterDeriver::new(1.0, 1.0e-6).expect("deriver should build");
        let loose_kmax = loose.ewald_kmax(loose.electrostatic_alpha(), &periodic_box);
        let tight_kmax = tight.ewald_kmax(tight.electrostatic_alpha(), &periodic_box);

        for (loose, tight) in loose_kmax.into_iter().zip(tight_kmax) {
            assert_eq!(loose % 2, 1);
            assert_eq!(tight % 2, 1);
            assert!(tight >= loose);
        }
    }

    #[test]
    fn explicit_parameters_are_legalized_and_zero_alpha_derives() {
        let resolved = EwaldParameterDeriver::resolve(
            Some(PmeParameters {
                alpha: 3.0,
                grid: [11, 13, 32],
            }),
            || unreachable!("explicit alpha must not derive"),
        )
        .expect("explicit parameters should resolve");
        assert_eq!(resolved.grid, [12, 14, 32]);

        let derived = PmeParameters {
            alpha: 2.5,
            grid: [20, 20, 20],
        };
        let resolved = EwaldParameterDeriver::resolve(
            Some(PmeParameters {
                alpha: 0.0,
                grid: [0, 0, 0],
            }),
            || derived,
        )
        .expect("zero alpha should derive");
        assert_eq!(resolved, derived);
    }

    #[test]
    fn rejects_out_of_range_inputs() {
        assert!(EwaldParameterDeriver::new(0.0, 5.0e-4).is_err());
        assert!(EwaldParameterDeriver::new(1.0, 0.0).is_err());
        assert!(EwaldParameterDeriver::new(1.0, 0.7).is_err());
    }
}
