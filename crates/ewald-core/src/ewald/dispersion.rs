//! Long-range Lennard-Jones tail correction for truncated dispersion.

use std::collections::BTreeMap;

use crate::common::constants::PI;
use crate::domain::ParticleParameters;

/// Coefficient `C` such that the isotropic tail correction energy is `C / V`.
///
/// Particles are grouped into `(sigma, epsilon)` classes and the Lorentz-Berthelot mixed
/// `eps sigma^12` and `eps sigma^6` are averaged over every unordered pair, self pairs included.
pub fn dispersion_correction_coefficient(particles: &[ParticleParameters], cutoff: f64) -> f64 {
    let num_particles = particles.len();
    if num_particles == 0 {
        return 0.0;
    }

    let mut classes: BTreeMap<(u64, u64), usize> = BTreeMap::new();
    for particle in particles {
        *classes
            .entry((particle.sigma.to_bits(), particle.epsilon.to_bits()))
            .or_default() += 1;
    }
    let classes: Vec<(f64, f64, f64)> = classes
        .into_iter()
        .map(|((sigma, epsilon), count)| {
            (f64::from_bits(sigma), f64::from_bits(epsilon), count as f64)
        })
        .collect();

    let mut repulsive = 0.0;
    let mut attractive = 0.0;
    for (i, &(sigma_i, epsilon_i, count_i)) in classes.iter().enumerate() {
        for &(sigma_j, epsilon_j, count_j) in &classes[i..] {
            let pair_count = if sigma_i == sigma_j && epsilon_i == epsilon_j {
                count_i * (count_i + 1.0) / 2.0
            } else {
                count_i * count_j
            };
            let sigma = 0.5 * (sigma_i + sigma_j);
            let epsilon = (epsilon_i * epsilon_j).sqrt();
            let sigma6 = sigma.powi(6);
            repulsive += pair_count * epsilon * sigma6 * sigma6;
            attractive += pair_count * epsilon * sigma6;
        }
    }

    let n = num_particles as f64;
    let num_pairs = n * (n + 1.0) / 2.0;
    repulsive /= num_pairs;
    attractive /= num_pairs;

    8.0 * n * n * PI * (repulsive / (9.0 * cutoff.powi(9)) - attractive / (3.0 * cutoff.powi(3)))
}
