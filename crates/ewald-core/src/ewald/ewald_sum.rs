//! Reciprocal-space Coulomb energy by direct summation over wave vectors.

use num_complex::Complex64;
use rayon::prelude::*;

use crate::common::constants::{ONE_4PI_EPS0, PI};
use crate::device::ForceAccumulator;
use crate::domain::geometry::dot3;
use crate::domain::{PeriodicBox, Vec3};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EwaldSumSolver {
    alpha: f64,
    kmax: [usize; 3],
}

struct WaveTerm {
    k: Vec3,
    weight: f64,
    structure_factor: Complex64,
}

impl EwaldSumSolver {
    pub const fn new(alpha: f64, kmax: [usize; 3]) -> Self {
        Self { alpha, kmax }
    }

    pub const fn alpha(&self) -> f64 {
        self.alpha
    }

    pub const fn kmax(&self) -> [usize; 3] {
        self.kmax
    }

    fn wave_vectors(&self, periodic_box: &PeriodicBox) -> Vec<(Vec3, f64)> {
        let recip = periodic_box.reciprocal();
        let [kx, ky, kz] = self.kmax.map(|k| k.saturating_sub(1) as i64);
        let inverse_four_alpha2 = 1.0 / (4.0 * self.alpha * self.alpha);

        let mut vectors = Vec::new();
        for mx in -kx..=kx {
            for my in -ky..=ky {
                for mz in -kz..=kz {
                    if mx == 0 && my == 0 && mz == 0 {
                        continue;
                    }
                    let (mx, my, mz) = (mx as f64, my as f64, mz as f64);
                    let k = [
                        2.0 * PI * mx * recip[0][0],
                        2.0 * PI * (mx * recip[1][0] + my * recip[1][1]),
                        2.0 * PI * (mx * recip[2][0] + my * recip[2][1] + mz * recip[2][2]),
                    ];
                    let k2 = dot3(k, k);
                    vectors.push((k, (-k2 * inverse_four_alpha2).exp() / k2));
                }
            }
        }

        vectors
    }

    /// Returns the reciprocal-space energy and, when `forces` is given, adds the matching
    /// forces into it.
    pub fn compute(
        &self,
        periodic_box: &PeriodicBox,
        positions: &[Vec3],
        charges: &[f64],
        forces: Option<&ForceAccumulator>,
    ) -> f64 {
        let volume = periodic_box.volume();
        let terms: Vec<WaveTerm> = self
            .wave_vectors(periodic_box)
            .into_par_iter()
            .map(|(k, weight)| {
                let structure_factor = positions
                    .iter()
                    .zip(charges)
                    .map(|(position, charge)| Complex64::from_polar(*charge, dot3(k, *position)))
                    .sum();
                WaveTerm {
                    k,
                    weight,
                    structure_factor,
                }
            })
            .collect();

        let energy_prefactor = ONE_4PI_EPS0 * 2.0 * PI / volume;
        let energy = energy_prefactor
            * terms
                .iter()
                .map(|term| term.weight * term.structure_factor.norm_sqr())
                .sum::<f64>();

        if let Some(forces) = forces {
            let force_prefactor = ONE_4PI_EPS0 * 4.0 * PI / volume;
            positions
                .par_iter()
                .zip(charges.par_iter())
                .enumerate()
                .for_each(|(index, (position, charge))| {
                    if *charge == 0.0 {
                        return;
                    }
                    let mut force = [0.0; 3];
                    for term in &terms {
                        let phase = Complex64::from_polar(1.0, dot3(term.k, *position));
                        let scale = term.weight * (term.structure_factor.conj() * phase).im;
                        for axis in 0..3 {
                            force[axis] += scale * term.k[axis];
                        }
                    }
                    forces.add(index, force.map(|value| value * force_prefactor * charge));
                });
        }

        energy
    }
}

#[cfg(test)]
mod tests {
    use super::EwaldSumSolver;
    use crate::device::ForceAccumulator;
    use crate::domain::PeriodicBox;

    #[test]
    fn forces_match_finite_difference_of_energy() {
        let periodic_box = PeriodicBox::rectangular(1.5, 1.7, 1.6).expect("box should be valid");
        let mut positions = vec![[0.1, 0.2, 0.3], [0.9, 1.1, 0.4], [0.5, 0.3, 1.2]];
        let charges = [0.6, -0.4, -0.2];
        let solver = EwaldSumSolver::new(2.5, [9, 9, 9]);

        let forces = ForceAccumulator::new(3);
        solver.compute(&periodic_box, &positions, &charges, Some(&forces));
        let analytic = forces.snapshot();

        let step = 1.0e-5;
        for axis in 0..3 {
            positions[1][axis] += step;
            let upper = solver.compute(&periodic_box, &positions, &charges, None);
            positions[1][axis] -= 2.0 * step;
            let lower = solver.compute(&periodic_box, &positions, &charges, None);
            positions[1][axis] += step;

            let numeric = -(upper - lower) / (2.0 * step);
            assert!(
                (numeric - analytic[1][axis]).abs() <= 1.0e-4 * numeric.abs().max(1.0),
                "axis {axis}: numeric {numeric} analytic {}",
                analytic[1][axis]
            );
        }
    }

    #[test]
    fn net_force_vanishes() {
        let periodic_box = PeriodicBox::rectangular(2.0, 2.0, 2.0).expect("box should be valid");
        let positions = vec![[0.1, 0.2, 0.3], [0.9, 1.1, 0.4], [1.5, 0.3, 1.2], [1.9, 1.9, 0.1]];
        let charges = [0.5, -0.5, 0.25, -0.25];
        let forces = ForceAccumulator::new(4);
        EwaldSumSolver::new(3.0, [11, 11, 11]).compute(
            &periodic_box,
            &positions,
            &charges,
            Some(&forces),
        );

        let total = forces
            .snapshot()
            .into_iter()
            .fold([0.0; 3], |sum, force| [sum[0] + force[0], sum[1] + force[1], sum[2] + force[2]]);
        for component in total {
            assert!(component.abs() <= 1.0e-6, "net force {component}");
        }
    }
}
