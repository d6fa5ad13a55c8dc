//! Direct-space pair terms for excluded and exception pairs.
//!
//! The reciprocal-space sum includes every pair, so each excluded pair gets a correction that
//! removes its smooth long-range part. Exceptions with explicit parameters also get their own
//! plain Coulomb plus Lennard-Jones term.

use tracing::trace;

use crate::common::constants::{ONE_4PI_EPS0, TWO_OVER_SQRT_PI};
use crate::device::{DeviceBuffer, ForceAccumulator};
use crate::domain::geometry::{dot3, scale3, sub3};
use crate::domain::{EwaldError, EwaldResult, PeriodicBox, Vec3};
use crate::framework::BondedInteraction;
use crate::numerics::erf;
use crate::params::PairParameters;
use crate::pme::dispersion_coefficient;

/// `exp(-y) * sum_{n >= first} y^n / n!`, evaluated without cancellation for small `y`.
fn exponential_tail(y: f64, first: u32) -> f64 {
    if y < 0.5 {
        let mut term = 1.0;
        for n in 1..=first {
            term *= y / n as f64;
        }
        let mut sum = 0.0_f64;
        let mut n = first;
        while term > 1.0e-18 * sum.max(f64::MIN_POSITIVE) {
            sum += term;
            n += 1;
            term *= y / n as f64;
        }
        (-y).exp() * sum
    } else {
        let mut term = 1.0;
        let mut head = 0.0;
        for n in 0..first {
            head += term;
            term *= y / (n + 1) as f64;
        }
        1.0 - (-y).exp() * head
    }
}

/// Energy and `-(dE/dr) / r` of the excluded-pair Coulomb correction `-k q_i q_j erf(a r) / r`.
pub fn coulomb_exclusion(scaled_charge_product: f64, alpha: f64, r: f64) -> (f64, f64) {
    if r <= f64::EPSILON {
        return (-scaled_charge_product * alpha * TWO_OVER_SQRT_PI, 0.0);
    }
    let alpha_r = alpha * r;
    let erf_term = erf(alpha_r);
    let gaussian = TWO_OVER_SQRT_PI * alpha * (-alpha_r * alpha_r).exp();
    let energy = -scaled_charge_product * erf_term / r;
    let force_scale = scaled_charge_product * (gaussian / (r * r) - erf_term / (r * r * r));
    (energy, force_scale)
}

/// Energy and `-(dE/dr) / r` of the excluded-pair dispersion correction
/// `C6 (1 - exp(-x^2)(1 + x^2 + x^4/2)) / r^6` with `x = a r`.
pub fn dispersion_exclusion(c6: f64, alpha: f64, r: f64) -> (f64, f64) {
    if r <= f64::EPSILON {
        return (c6 * alpha.powi(6) / 6.0, 0.0);
    }
    let y = alpha * alpha * r * r;
    let inverse_r6 = 1.0 / (r * r).powi(3);
    let energy = c6 * exponential_tail(y, 3) * inverse_r6;
    let force_scale = 6.0 * c6 * exponential_tail(y, 4) * inverse_r6 / (r * r);
    (energy, force_scale)
}

/// Energy and `-(dE/dr) / r` of a plain Coulomb plus 12-6 Lennard-Jones pair.
pub fn exception_pair(parameters: &PairParameters, r: f64) -> (f64, f64) {
    let inverse_r2 = 1.0 / (r * r);
    let inverse_r = inverse_r2.sqrt();
    let coulomb = ONE_4PI_EPS0 * parameters.charge_product * inverse_r;
    let sigma2 = parameters.sigma * parameters.sigma * inverse_r2;
    let sigma6 = sigma2 * sigma2 * sigma2;
    let lj = 4.0 * parameters.epsilon * (sigma6 * sigma6 - sigma6);
    let lj_force = 4.0 * parameters.epsilon * (12.0 * sigma6 * sigma6 - 6.0 * sigma6);
    (coulomb + lj, (coulomb + lj_force) * inverse_r2)
}

fn pair_geometry(
    periodic_box: &PeriodicBox,
    positions: &[Vec3],
    pair: [usize; 2],
    periodic: bool,
) -> EwaldResult<(Vec3, f64)> {
    let [first, second] = pair;
    let (Some(a), Some(b)) = (positions.get(first), positions.get(second)) else {
        return Err(EwaldError::internal(
            "PAIR.INDEX",
            format!("pair ({first}, {second}) outside {} positions", positions.len()),
        ));
    };
    let mut delta = sub3(*b, *a);
    if periodic {
        delta = periodic_box.minimum_image(delta);
    }
    Ok((delta, dot3(delta, delta).sqrt()))
}

fn apply_pair_force(forces: Option<&ForceAccumulator>, pair: [usize; 2], delta: Vec3, scale: f64) {
    if let Some(forces) = forces {
        let force = scale3(delta, scale);
        forces.add(pair[1], force);
        forces.add(pair[0], scale3(force, -1.0));
    }
}

/// Removes the reciprocal-space contribution of excluded pairs on one device's shard.
#[derive(Debug)]
pub struct DirectSpaceExclusionCorrector {
    pairs: Vec<[usize; 2]>,
    alpha: f64,
    dispersion_alpha: Option<f64>,
    charges: DeviceBuffer<f64>,
    sigma_epsilon: DeviceBuffer<[f64; 2]>,
}

impl DirectSpaceExclusionCorrector {
    pub fn new(
        pairs: Vec<[usize; 2]>,
        alpha: f64,
        dispersion_alpha: Option<f64>,
        charges: DeviceBuffer<f64>,
        sigma_epsilon: DeviceBuffer<[f64; 2]>,
    ) -> Self {
        Self {
            pairs,
            alpha,
            dispersion_alpha,
            charges,
            sigma_epsilon,
        }
    }

    pub fn pairs(&self) -> &[[usize; 2]] {
        &self.pairs
    }
}

impl BondedInteraction for DirectSpaceExclusionCorrector {
    fn name(&self) -> &'static str {
        "exclusion-correction"
    }

    fn num_terms(&self) -> usize {
        self.pairs.len()
    }

    fn evaluate(
        &self,
        periodic_box: &PeriodicBox,
        positions: &[Vec3],
        forces: Option<&ForceAccumulator>,
    ) -> EwaldResult<f64> {
        let charges = self.charges.read();
        let sigma_epsilon = self.sigma_epsilon.read();
        let mut energy = 0.0;

        for &pair in &self.pairs {
            let (delta, r) = pair_geometry(periodic_box, positions, pair, true)?;
            let [first, second] = pair;

            let scaled = ONE_4PI_EPS0 * charges[first] * charges[second];
            let (mut pair_energy, mut force_scale) = if scaled != 0.0 {
                coulomb_exclusion(scaled, self.alpha, r)
            } else {
                (0.0, 0.0)
            };
            if let Some(alpha) = self.dispersion_alpha {
                let [sigma_a, epsilon_a] = sigma_epsilon[first];
                let [sigma_b, epsilon_b] = sigma_epsilon[second];
                let c6 = dispersion_coefficient(sigma_a, epsilon_a)
                    * dispersion_coefficient(sigma_b, epsilon_b);
                if c6 != 0.0 {
                    let (dispersion_energy, dispersion_scale) = dispersion_exclusion(c6, alpha, r);
                    pair_energy += dispersion_energy;
                    force_scale += dispersion_scale;
                }
            }

            apply_pair_force(forces, pair, delta, force_scale);
            energy += pair_energy;
        }

        trace!(pairs = self.pairs.len(), energy, "exclusion corrections");
        Ok(energy)
    }
}

/// Explicit direct-space interaction of non-degenerate exceptions on one device's shard.
#[derive(Debug)]
pub struct ExceptionInteraction {
    pairs: Vec<[usize; 2]>,
    parameters: DeviceBuffer<PairParameters>,
    use_periodic: bool,
}

impl ExceptionInteraction {
    pub fn new(
        pairs: Vec<[usize; 2]>,
        parameters: DeviceBuffer<PairParameters>,
        use_periodic: bool,
    ) -> Self {
        Self {
            pairs,
            parameters,
            use_periodic,
        }
    }
}

impl BondedInteraction for ExceptionInteraction {
    fn name(&self) -> &'static str {
        "exception-interaction"
    }

    fn num_terms(&self) -> usize {
        self.pairs.len()
    }

    fn evaluate(
        &self,
        periodic_box: &PeriodicBox,
        positions: &[Vec3],
        forces: Option<&ForceAccumulator>,
    ) -> EwaldResult<f64> {
        let parameters = self.parameters.read();
        let mut energy = 0.0;

        for (pair, parameters) in self.pairs.iter().zip(parameters.iter()) {
            let (delta, r) = pair_geometry(periodic_box, positions, *pair, self.use_periodic)?;
            if r <= f64::EPSILON {
                return Err(EwaldError::device(
                    "EXCEPTION.COINCIDENT",
                    format!("exception particles {:?} are at the same position", pair),
                ));
            }
            let (pair_energy, force_scale) = exception_pair(parameters, r);
            apply_pair_force(forces, *pair, delta, force_scale);
            energy += pair_energy;
        }

        Ok(energy)
    }
}
