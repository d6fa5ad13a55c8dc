mod common;

use common::{
    add_forces, assert_energy_close, assert_forces_close, charges, context, coulomb_force,
    cubic_box, direct_space, evaluate, pme_force, positions,
};
use ewald_core::common::constants::{ONE_4PI_EPS0, SQRT_PI};
use ewald_core::device::ForceAccumulator;
use ewald_core::domain::geometry::{dot3, sub3};
use ewald_core::ewald::EwaldSumSolver;
use ewald_core::numerics::erfc;
use ewald_core::{
    DeviceCapabilities, EvaluationFlags, ExceptionRecord, LogicalContext,
    NonbondedForceDefinition, NonbondedMethod, ParticleParameters, PeriodicBox, PlatformOptions,
    PmeParameters, Vec3,
};

const CUTOFF: f64 = 1.4;

/// Madelung constant of the rock-salt lattice, referred to the nearest-neighbour distance.
const ROCK_SALT_MADELUNG: f64 = 1.747_564_594_633_182;

/// Reciprocal sum plus self energy from explicit wave-vector summation.
fn reference_long_range(alpha: f64) -> (f64, Vec<Vec3>) {
    let positions = positions();
    let charges = charges();
    let forces = ForceAccumulator::new(positions.len());
    let reciprocal = EwaldSumSolver::new(alpha, [14; 3]).compute(
        &cubic_box(),
        &positions,
        &charges,
        Some(&forces),
    );
    let self_energy = -ONE_4PI_EPS0 * alpha / SQRT_PI
        * charges.iter().map(|charge| charge * charge).sum::<f64>();
    (reciprocal + self_energy, forces.snapshot())
}

/// Plain minimum-image Coulomb energy and forces of the given pairs.
fn bare_pairs(pairs: &[[usize; 2]]) -> (f64, Vec<Vec3>) {
    let periodic_box = cubic_box();
    let positions = positions();
    let charges = charges();
    let mut energy = 0.0;
    let mut forces = vec![[0.0; 3]; positions.len()];
    for &[i, j] in pairs {
        let delta = periodic_box.minimum_image(sub3(positions[j], positions[i]));
        let r = dot3(delta, delta).sqrt();
        let qq = ONE_4PI_EPS0 * charges[i] * charges[j];
        energy += qq / r;
        for axis in 0..3 {
            let component = qq * delta[axis] / (r * r * r);
            forces[j][axis] += component;
            forces[i][axis] -= component;
        }
    }
    (energy, forces)
}

#[test]
fn pme_total_matches_explicit_ewald_summation() {
    let alpha = 3.0;
    let mut context = context(&pme_force(alpha, 64));
    let result = evaluate(&mut context);
    let (direct_energy, direct_forces) = direct_space(alpha, CUTOFF, &[]);

    let (reference_energy, reference_forces) = reference_long_range(alpha);
    assert_energy_close(
        result.energy + direct_energy,
        reference_energy + direct_energy,
        1.0e-5,
        "pme vs ewald sum",
    );
    assert_forces_close(
        &add_forces(&result.forces, &direct_forces),
        &add_forces(&reference_forces, &direct_forces),
        5.0e-2,
        "pme vs ewald sum",
    );
}

#[test]
fn total_energy_is_independent_of_alpha() {
    let totals: Vec<(f64, Vec<Vec3>)> = [3.0, 3.6]
        .into_iter()
        .map(|alpha| {
            let result = evaluate(&mut context(&pme_force(alpha, 64)));
            let (direct_energy, direct_forces) = direct_space(alpha, CUTOFF, &[]);
            (
                result.energy + direct_energy,
                add_forces(&result.forces, &direct_forces),
            )
        })
        .collect();

    assert_energy_close(totals[0].0, totals[1].0, 1.0e-5, "alpha 3.0 vs 3.6");
    assert_forces_close(&totals[0].1, &totals[1].1, 5.0e-2, "alpha 3.0 vs 3.6");
}

#[test]
fn plain_ewald_method_agrees_with_pme() {
    let mut ewald_force = coulomb_force(NonbondedMethod::Ewald, CUTOFF);
    ewald_force.ewald_error_tolerance = 1.0e-6;
    let mut ewald = context(&ewald_force);
    let ewald_alpha = ewald.kernel(0).expect("device 0").alpha();
    let ewald_result = evaluate(&mut ewald);
    let (ewald_direct, _) = direct_space(ewald_alpha, CUTOFF, &[]);

    let mut pme = context(&pme_force(3.0, 64));
    let pme_result = evaluate(&mut pme);
    let (pme_direct, _) = direct_space(3.0, CUTOFF, &[]);

    assert!(ewald_alpha > 2.0 && ewald_alpha < 3.0, "derived alpha {ewald_alpha}");
    assert_energy_close(
        ewald_result.energy + ewald_direct,
        pme_result.energy + pme_direct,
        1.0e-5,
        "ewald vs pme",
    );
}

#[test]
fn excluded_pairs_lose_exactly_their_nearest_image_coulomb_term() {
    let alpha = 3.0;
    let excluded = [[0, 1], [2, 5]];
    let mut force = pme_force(alpha, 64);
    force.exceptions = excluded.iter().copied().map(ExceptionRecord::exclusion).collect();

    let result = evaluate(&mut context(&force));
    let (direct_energy, direct_forces) = direct_space(alpha, CUTOFF, &excluded);
    let total_energy = result.energy + direct_energy;
    let total_forces = add_forces(&result.forces, &direct_forces);

    let (long_range, long_range_forces) = reference_long_range(alpha);
    let (full_direct, full_direct_forces) = direct_space(alpha, CUTOFF, &[]);
    let (bare, bare_forces) = bare_pairs(&excluded);
    let expected_energy = long_range + full_direct - bare;
    let expected_forces: Vec<Vec3> = add_forces(&long_range_forces, &full_direct_forces)
        .iter()
        .zip(&bare_forces)
        .map(|(total, pair)| [total[0] - pair[0], total[1] - pair[1], total[2] - pair[2]])
        .collect();

    assert_energy_close(total_energy, expected_energy, 1.0e-5, "exclusions");
    assert_forces_close(&total_forces, &expected_forces, 5.0e-2, "exclusions");
}

/// Conventional rock-salt cell: four cations on the fcc sites, four anions shifted by a/2.
fn rock_salt_cell(lattice: f64) -> (Vec<Vec3>, Vec<f64>) {
    let fcc = [[0.0, 0.0, 0.0], [0.0, 0.5, 0.5], [0.5, 0.0, 0.5], [0.5, 0.5, 0.0]];
    let mut positions = Vec::new();
    let mut charges = Vec::new();
    for (shift, charge) in [(0.0, 1.0), (0.5, -1.0)] {
        for site in fcc {
            positions.push(site.map(|fraction: f64| ((fraction + shift) % 1.0) * lattice));
            charges.push(charge);
        }
    }
    (positions, charges)
}

/// Screened Coulomb sum over every image pair closer than `cutoff`.
fn screened_image_sum(
    positions: &[Vec3],
    charges: &[f64],
    lattice: f64,
    alpha: f64,
    cutoff: f64,
) -> f64 {
    let mut energy = 0.0;
    for i in 0..positions.len() {
        for j in 0..positions.len() {
            for n in 0..27 {
                let image = [n / 9, (n / 3) % 3, n % 3].map(|k| (k as f64 - 1.0) * lattice);
                if i == j && image == [0.0; 3] {
                    continue;
                }
                let delta = sub3(sub3(positions[j], positions[i]), image);
                let r = dot3(delta, delta).sqrt();
                if r < cutoff {
                    energy += 0.5 * ONE_4PI_EPS0 * charges[i] * charges[j] * erfc(alpha * r) / r;
                }
            }
        }
    }
    energy
}

#[test]
fn rock_salt_cell_reproduces_the_madelung_energy() {
    let lattice = 2.0;
    let alpha = 5.0;
    let cutoff = 0.9;
    let (positions, charges) = rock_salt_cell(lattice);
    let force = NonbondedForceDefinition {
        method: NonbondedMethod::Pme,
        cutoff,
        use_dispersion_correction: false,
        pme_parameters: Some(PmeParameters {
            alpha,
            grid: [64; 3],
        }),
        particles: charges
            .iter()
            .map(|&charge| ParticleParameters::new(charge, 0.3, 0.0))
            .collect(),
        ..NonbondedForceDefinition::default()
    };
    let periodic_box =
        PeriodicBox::rectangular(lattice, lattice, lattice).expect("box should be valid");
    let mut context = LogicalContext::new(
        &force,
        periodic_box,
        &PlatformOptions::default(),
        &[DeviceCapabilities::default()],
        None,
    )
    .expect("context should build");
    context
        .set_positions(&positions)
        .expect("positions should load");
    let result = context
        .evaluate(EvaluationFlags::all())
        .expect("evaluation should succeed");

    let nearest = 0.5 * lattice;
    let ion_pairs = positions.len() as f64 / 2.0;
    let expected = -ion_pairs * ROCK_SALT_MADELUNG * ONE_4PI_EPS0 / nearest;
    let total = result.energy + screened_image_sum(&positions, &charges, lattice, alpha, cutoff);

    assert_energy_close(total, expected, 1.0e-5, "rock salt");
    assert_forces_close(&result.forces, &vec![[0.0; 3]; positions.len()], 1.0e-3, "rock salt");
}
