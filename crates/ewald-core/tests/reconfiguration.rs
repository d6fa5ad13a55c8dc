mod common;

use common::{
    assert_energy_close, assert_forces_close, context, context_with, dispersion_force, evaluate,
    pme_force,
};
use ewald_core::{
    DeviceCapabilities, EwaldErrorCategory, ExceptionRecord, NonbondedForceDefinition,
    ParticleParameters, PlatformOptions,
};

fn with_exceptions(mut force: NonbondedForceDefinition) -> NonbondedForceDefinition {
    force.exceptions = vec![
        ExceptionRecord::exclusion([0, 1]),
        ExceptionRecord::new([2, 3], -0.1, 0.3, 0.0),
        ExceptionRecord::exclusion([4, 5]),
    ];
    force
}

#[test]
fn identical_update_leaves_results_unchanged() {
    let force = with_exceptions(pme_force(3.0, 40));
    let mut context = context(&force);
    let before = evaluate(&mut context);

    context
        .update_parameters(&force)
        .expect("identical parameters should apply");
    let after = evaluate(&mut context);

    assert_energy_close(after.energy, before.energy, 1.0e-10, "identical update");
    assert_forces_close(&after.forces, &before.forces, 1.0e-9, "identical update");
}

#[test]
fn changed_charges_match_a_fresh_context() {
    let force = with_exceptions(pme_force(3.0, 40));
    let mut updated = force.clone();
    updated.particles[0].charge = 0.8;
    updated.particles[1].charge = -0.8;
    updated.exceptions[1].charge_product = -0.25;

    let mut context = context(&force);
    evaluate(&mut context);
    context
        .update_parameters(&updated)
        .expect("charge changes should apply");
    let reconfigured = evaluate(&mut context);
    let fresh = evaluate(&mut common::context(&updated));

    assert_energy_close(reconfigured.energy, fresh.energy, 1.0e-10, "updated charges");
    assert_forces_close(&reconfigured.forces, &fresh.forces, 1.0e-6, "updated charges");
}

#[test]
fn dispersion_correction_follows_updated_parameters() {
    let mut force = pme_force(3.0, 32);
    force.use_dispersion_correction = true;
    for particle in &mut force.particles {
        particle.epsilon = 0.5;
    }
    let mut context = context(&force);
    let before = context
        .kernel(0)
        .expect("device 0")
        .dispersion_correction_coefficient();

    for particle in &mut force.particles {
        particle.epsilon = 0.8;
    }
    context
        .update_parameters(&force)
        .expect("epsilon changes should apply");
    let after = context
        .kernel(0)
        .expect("device 0")
        .dispersion_correction_coefficient();

    assert!(before < 0.0, "attractive correction expected, got {before}");
    assert!((after / before - 0.8 / 0.5).abs() <= 1.0e-12);
}

#[test]
fn particle_count_cannot_change() {
    let force = pme_force(3.0, 32);
    let mut context = context(&force);
    let mut grown = force.clone();
    grown.particles.push(ParticleParameters::new(0.0, 0.3, 0.0));

    let error = context
        .update_parameters(&grown)
        .expect_err("particle count changed");
    assert_eq!(error.category(), EwaldErrorCategory::ReconfigurationError);
    assert_eq!(error.placeholder(), "RECONFIGURE.PARTICLE_COUNT");
}

#[test]
fn exclusion_cannot_become_an_interacting_exception() {
    let force = with_exceptions(pme_force(3.0, 32));
    let mut context = context(&force);
    let mut promoted = force.clone();
    promoted.exceptions[0].charge_product = 0.05;

    let error = context
        .update_parameters(&promoted)
        .expect_err("interacting exception count changed");
    assert_eq!(error.placeholder(), "RECONFIGURE.EXCEPTION_COUNT");
}

#[test]
fn exclusion_set_cannot_change() {
    let force = with_exceptions(pme_force(3.0, 32));
    let mut context = context(&force);
    let mut moved = force.clone();
    moved.exceptions[2] = ExceptionRecord::exclusion([4, 6]);

    let error = context
        .update_parameters(&moved)
        .expect_err("exclusions changed");
    assert_eq!(error.placeholder(), "RECONFIGURE.EXCLUSIONS");
}

#[test]
fn rejected_update_leaves_every_device_unchanged() {
    let mut force = pme_force(3.0, 32);
    force.exceptions = vec![
        ExceptionRecord::new([0, 2], 0.1, 0.3, 0.0),
        ExceptionRecord::new([1, 3], -0.1, 0.3, 0.0),
        ExceptionRecord::new([2, 4], 0.05, 0.3, 0.0),
        ExceptionRecord::new([3, 5], -0.05, 0.3, 0.0),
        ExceptionRecord::exclusion([4, 6]),
    ];
    let mut context = context_with(
        &force,
        &PlatformOptions::default(),
        &[DeviceCapabilities::default(); 2],
    );
    let before = evaluate(&mut context);

    let mut swapped = force.clone();
    swapped.particles[0].charge = 5.0;
    swapped.exceptions[3] = ExceptionRecord::exclusion([3, 5]);
    swapped.exceptions[4] = ExceptionRecord::new([4, 6], 0.05, 0.3, 0.0);
    let error = context
        .update_parameters(&swapped)
        .expect_err("second shard's pairs changed");
    assert_eq!(error.category(), EwaldErrorCategory::ReconfigurationError);
    assert_eq!(error.placeholder(), "RECONFIGURE.EXCEPTION_PAIRS");

    for device in 0..2 {
        let charge = context
            .kernel(device)
            .expect("device should exist")
            .table()
            .base_particles()[0]
            .charge;
        assert!((charge - 0.6).abs() <= 1.0e-15, "device {device} charge {charge}");
    }
    let after = evaluate(&mut context);
    assert_energy_close(after.energy, before.energy, 1.0e-10, "rejected update");
    assert_forces_close(&after.forces, &before.forces, 1.0e-9, "rejected update");
}

#[test]
fn charges_cannot_be_introduced_later() {
    let mut force = dispersion_force();
    for particle in &mut force.particles {
        particle.charge = 0.0;
    }
    let mut context = context(&force);
    let mut charged = force.clone();
    charged.particles[0].charge = 0.2;
    charged.particles[1].charge = -0.2;

    let error = context
        .update_parameters(&charged)
        .expect_err("charges were introduced");
    assert_eq!(error.placeholder(), "RECONFIGURE.CHARGES_ADDED");
}
