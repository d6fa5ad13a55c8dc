#![allow(dead_code)]

use ewald_core::common::constants::ONE_4PI_EPS0;
use ewald_core::domain::geometry::{dot3, sub3};
use ewald_core::numerics::{erfc, within_tolerance};
use ewald_core::{
    DeviceCapabilities, Evaluation, EvaluationFlags, LogicalContext, NonbondedForceDefinition,
    NonbondedMethod, ParticleParameters, PeriodicBox, PlatformOptions, PmeParameters, Vec3,
};

pub const BOX_EDGE: f64 = 3.0;

pub fn cubic_box() -> PeriodicBox {
    PeriodicBox::rectangular(BOX_EDGE, BOX_EDGE, BOX_EDGE).expect("box should be valid")
}

pub fn positions() -> Vec<Vec3> {
    vec![
        [0.31, 0.42, 0.27],
        [0.95, 0.60, 0.35],
        [1.72, 1.15, 0.88],
        [2.41, 0.37, 1.93],
        [0.58, 2.22, 1.46],
        [1.33, 2.71, 2.35],
        [2.12, 1.84, 2.63],
        [2.77, 2.58, 0.51],
    ]
}

pub fn charges() -> Vec<f64> {
    vec![0.6, -0.6, 0.45, -0.45, 0.3, -0.3, 0.52, -0.52]
}

/// Neutral point-charge system without Lennard-Jones terms.
pub fn coulomb_force(method: NonbondedMethod, cutoff: f64) -> NonbondedForceDefinition {
    NonbondedForceDefinition {
        method,
        cutoff,
        use_dispersion_correction: false,
        particles: charges()
            .into_iter()
            .map(|charge| ParticleParameters::new(charge, 0.3, 0.0))
            .collect(),
        ..NonbondedForceDefinition::default()
    }
}

pub fn pme_force(alpha: f64, grid: usize) -> NonbondedForceDefinition {
    NonbondedForceDefinition {
        pme_parameters: Some(PmeParameters {
            alpha,
            grid: [grid; 3],
        }),
        ..coulomb_force(NonbondedMethod::Pme, 1.4)
    }
}

/// Coulomb plus Lennard-Jones system for LJ-PME.
pub fn dispersion_force() -> NonbondedForceDefinition {
    let particles = charges()
        .into_iter()
        .enumerate()
        .map(|(index, charge)| {
            ParticleParameters::new(charge, 0.28 + 0.01 * index as f64, 0.4 + 0.05 * index as f64)
        })
        .collect();
    NonbondedForceDefinition {
        method: NonbondedMethod::LjPme,
        cutoff: 1.2,
        pme_parameters: Some(PmeParameters {
            alpha: 3.0,
            grid: [40; 3],
        }),
        lj_pme_parameters: Some(PmeParameters {
            alpha: 2.5,
            grid: [32; 3],
        }),
        particles,
        ..NonbondedForceDefinition::default()
    }
}

pub fn context_with(
    force: &NonbondedForceDefinition,
    options: &PlatformOptions,
    devices: &[DeviceCapabilities],
) -> LogicalContext {
    let mut context = LogicalContext::new(force, cubic_box(), options, devices, None)
        .expect("context should build");
    context
        .set_positions(&positions())
        .expect("positions should load");
    context
}

pub fn context(force: &NonbondedForceDefinition) -> LogicalContext {
    context_with(force, &PlatformOptions::default(), &[DeviceCapabilities::default()])
}

pub fn evaluate(context: &mut LogicalContext) -> Evaluation {
    context
        .evaluate(EvaluationFlags::all())
        .expect("evaluation should succeed")
}

/// Minimum-image `erfc` pair sum inside `cutoff`, skipping `excluded` pairs.
pub fn direct_space(
    alpha: f64,
    cutoff: f64,
    excluded: &[[usize; 2]],
) -> (f64, Vec<Vec3>) {
    let periodic_box = cubic_box();
    let positions = positions();
    let charges = charges();
    let mut energy = 0.0;
    let mut forces = vec![[0.0; 3]; positions.len()];

    for i in 0..positions.len() {
        for j in (i + 1)..positions.len() {
            if excluded.contains(&[i, j]) || excluded.contains(&[j, i]) {
                continue;
            }
            let delta = periodic_box.minimum_image(sub3(positions[j], positions[i]));
            let r = dot3(delta, delta).sqrt();
            if r >= cutoff {
                continue;
            }
            let qq = ONE_4PI_EPS0 * charges[i] * charges[j];
            let screened = erfc(alpha * r);
            energy += qq * screened / r;
            let gaussian = std::f64::consts::FRAC_2_SQRT_PI * alpha * (-(alpha * r).powi(2)).exp();
            let scale = qq * (screened / r + gaussian) / (r * r);
            for axis in 0..3 {
                forces[i][axis] -= scale * delta[axis];
                forces[j][axis] += scale * delta[axis];
            }
        }
    }

    (energy, forces)
}

pub fn add_forces(lhs: &[Vec3], rhs: &[Vec3]) -> Vec<Vec3> {
    lhs.iter()
        .zip(rhs)
        .map(|(a, b)| [a[0] + b[0], a[1] + b[1], a[2] + b[2]])
        .collect()
}

pub fn assert_energy_close(actual: f64, expected: f64, rel_tol: f64, label: &str) {
    assert!(
        within_tolerance(actual, expected, 1.0e-9, rel_tol, 1.0),
        "{label}: energy {actual} differs from {expected}"
    );
}

pub fn assert_forces_close(actual: &[Vec3], expected: &[Vec3], abs_tol: f64, label: &str) {
    assert_eq!(actual.len(), expected.len(), "{label}: force count");
    for (index, (lhs, rhs)) in actual.iter().zip(expected).enumerate() {
        for axis in 0..3 {
            assert!(
                (lhs[axis] - rhs[axis]).abs() <= abs_tol,
                "{label}: particle {index} axis {axis}: {} vs {}",
                lhs[axis],
                rhs[axis]
            );
        }
    }
}
