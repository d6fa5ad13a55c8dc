//! Per-particle and per-exception parameter arrays, including offsets driven by global
//! parameters.
//!
//! Effective parameters are `base + sum(value(global) * offset)`. The table uploads them to the
//! device buffers whenever a global value changes, after a reconfiguration, and on every
//! step while any offset exists.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::device::{DeviceBuffer, ExecutionQueue};
use crate::domain::{
    EwaldError, EwaldResult, ExceptionRecord, GlobalParameters, NonbondedForceDefinition,
    OffsetTarget, ParticleParameters,
};
use crate::shard::{DeviceShardSplitter, ShardRange};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PairParameters {
    pub charge_product: f64,
    pub sigma: f64,
    pub epsilon: f64,
}

impl From<&ExceptionRecord> for PairParameters {
    fn from(record: &ExceptionRecord) -> Self {
        Self {
            charge_product: record.charge_product,
            sigma: record.sigma,
            epsilon: record.epsilon,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct OffsetEntry {
    parameter: usize,
    charge: f64,
    sigma: f64,
    epsilon: f64,
}

/// Offsets grouped by entity in compressed rows: entity `i` owns
/// `entries[starts[i]..starts[i + 1]]`.
#[derive(Debug, Clone, Default, PartialEq)]
struct OffsetTable {
    starts: Vec<usize>,
    entries: Vec<OffsetEntry>,
}

impl OffsetTable {
    fn build(count: usize, items: Vec<(usize, OffsetEntry)>) -> Self {
        let mut starts = vec![0usize; count + 1];
        for (entity, _) in &items {
            starts[entity + 1] += 1;
        }
        for entity in 0..count {
            starts[entity + 1] += starts[entity];
        }

        let mut cursor = starts.clone();
        let mut slots: Vec<Option<OffsetEntry>> = vec![None; items.len()];
        for (entity, entry) in items {
            slots[cursor[entity]] = Some(entry);
            cursor[entity] += 1;
        }

        Self {
            starts,
            entries: slots.into_iter().flatten().collect(),
        }
    }

    fn for_entity(&self, entity: usize) -> &[OffsetEntry] {
        &self.entries[self.starts[entity]..self.starts[entity + 1]]
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Coefficients of the host-side Ewald self energy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelfEnergyScales {
    /// `k_e alpha / sqrt(pi)`, multiplied by `-q^2`.
    pub coulomb: f64,
    /// `alpha_d^6 / 3`, multiplied by `eps sigma^6`.
    pub dispersion: Option<f64>,
}

impl SelfEnergyScales {
    pub fn evaluate(&self, particles: &[ParticleParameters]) -> f64 {
        particles
            .iter()
            .map(|particle| {
                let mut energy = -self.coulomb * particle.charge * particle.charge;
                if let Some(dispersion) = self.dispersion {
                    energy += dispersion * particle.epsilon * particle.sigma.powi(6);
                }
                energy
            })
            .sum()
    }
}

/// Device-resident views of the effective parameters.
#[derive(Debug, Clone)]
pub struct ParameterArrays {
    pub charges: DeviceBuffer<f64>,
    pub sigma_epsilon: DeviceBuffer<[f64; 2]>,
    pub exception_parameters: DeviceBuffer<PairParameters>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TablePlacement {
    pub device_index: usize,
    pub device_count: usize,
    pub padded_particles: usize,
}

#[derive(Debug)]
pub struct ParameterTable {
    placement: TablePlacement,
    has_coulomb: bool,
    has_lennard_jones: bool,
    base_particles: Vec<ParticleParameters>,
    interacting: Vec<usize>,
    interacting_pairs: Vec<[usize; 2]>,
    shard: ShardRange,
    exception_pairs: Vec<[usize; 2]>,
    base_exceptions: Vec<PairParameters>,
    parameter_names: Vec<String>,
    cached_values: Vec<f64>,
    particle_offsets: OffsetTable,
    exception_offsets: OffsetTable,
    self_energy_scales: Option<SelfEnergyScales>,
    self_energy: f64,
    dirty: Arc<AtomicBool>,
    arrays: ParameterArrays,
}

/// A parameter update that passed every topology check and can be applied without failing.
#[derive(Debug)]
pub struct Reconfiguration {
    interacting: Vec<usize>,
}

struct OffsetLayout {
    names: Vec<String>,
    particle_offsets: OffsetTable,
    exception_offsets: OffsetTable,
}

/// Original indices of exceptions that need a direct-space term: a nonzero charge product or
/// epsilon, or any offset that could make them nonzero.
fn interacting_exceptions(force: &NonbondedForceDefinition) -> Vec<usize> {
    let mut with_offsets = vec![false; force.exceptions.len()];
    for offset in &force.offsets {
        if offset.target == OffsetTarget::Exception {
            with_offsets[offset.index] = true;
        }
    }

    force
        .exceptions
        .iter()
        .enumerate()
        .filter(|(index, exception)| exception.carries_interaction() || with_offsets[*index])
        .map(|(index, _)| index)
        .collect()
}

fn offset_layout(
    force: &NonbondedForceDefinition,
    interacting: &[usize],
    shard: ShardRange,
) -> OffsetLayout {
    let mut names: Vec<String> = Vec::new();
    let mut index_of = |name: &str| match names.iter().position(|known| known == name) {
        Some(index) => index,
        None => {
            names.push(name.to_string());
            names.len() - 1
        }
    };

    let mut local_exception = vec![None; force.exceptions.len()];
    for (position, original) in interacting.iter().enumerate() {
        if shard.contains(position) {
            local_exception[*original] = Some(position - shard.start);
        }
    }

    let mut particle_items = Vec::new();
    let mut exception_items = Vec::new();
    for target in [OffsetTarget::Particle, OffsetTarget::Exception] {
        for offset in force.offsets.iter().filter(|offset| offset.target == target) {
            let entry = OffsetEntry {
                parameter: index_of(&offset.parameter),
                charge: offset.charge,
                sigma: offset.sigma,
                epsilon: offset.epsilon,
            };
            match target {
                OffsetTarget::Particle => particle_items.push((offset.index, entry)),
                OffsetTarget::Exception => {
                    if let Some(local) = local_exception[offset.index] {
                        exception_items.push((local, entry));
                    }
                }
            }
        }
    }

    OffsetLayout {
        names,
        particle_offsets: OffsetTable::build(force.num_particles(), particle_items),
        exception_offsets: OffsetTable::build(shard.len(), exception_items),
    }
}

impl ParameterTable {
    pub fn configure(
        force: &NonbondedForceDefinition,
        placement: TablePlacement,
        self_energy_scales: Option<SelfEnergyScales>,
    ) -> EwaldResult<Self> {
        force.validate()?;
        let num_particles = force.num_particles();
        let interacting = interacting_exceptions(force);
        let shard = DeviceShardSplitter::new(interacting.len(), placement.device_count)?
            .share(placement.device_index);
        let layout = offset_layout(force, &interacting, shard);

        let interacting_pairs: Vec<[usize; 2]> = interacting
            .iter()
            .map(|index| force.exceptions[*index].particles)
            .collect();
        let exception_pairs = interacting_pairs[shard.range()].to_vec();
        let base_exceptions: Vec<PairParameters> = interacting[shard.range()]
            .iter()
            .map(|index| PairParameters::from(&force.exceptions[*index]))
            .collect();

        let padded = placement.padded_particles.max(num_particles);
        let arrays = ParameterArrays {
            charges: DeviceBuffer::filled("charges", padded, 0.0),
            sigma_epsilon: DeviceBuffer::filled("sigma-epsilon", padded, [0.0, 0.0]),
            exception_parameters: DeviceBuffer::filled(
                "exception-parameters",
                shard.len(),
                PairParameters::default(),
            ),
        };

        debug!(
            device = placement.device_index,
            particles = num_particles,
            interacting_exceptions = interacting.len(),
            shard_start = shard.start,
            shard_end = shard.end,
            parameters = layout.names.len(),
            "configured parameter table"
        );

        Ok(Self {
            placement,
            has_coulomb: force.has_charges(),
            has_lennard_jones: force.has_lennard_jones(),
            base_particles: force.particles.clone(),
            interacting,
            interacting_pairs,
            shard,
            exception_pairs,
            base_exceptions,
            cached_values: vec![0.0; layout.names.len()],
            parameter_names: layout.names,
            particle_offsets: layout.particle_offsets,
            exception_offsets: layout.exception_offsets,
            self_energy_scales,
            self_energy: 0.0,
            dirty: Arc::new(AtomicBool::new(true)),
            arrays,
        })
    }

    pub fn num_particles(&self) -> usize {
        self.base_particles.len()
    }

    pub const fn has_coulomb(&self) -> bool {
        self.has_coulomb
    }

    pub const fn has_lennard_jones(&self) -> bool {
        self.has_lennard_jones
    }

    pub fn has_offsets(&self) -> bool {
        !self.particle_offsets.is_empty() || !self.exception_offsets.is_empty()
    }

    pub fn base_particles(&self) -> &[ParticleParameters] {
        &self.base_particles
    }

    pub fn parameter_names(&self) -> &[String] {
        &self.parameter_names
    }

    pub fn cached_values(&self) -> &[f64] {
        &self.cached_values
    }

    pub const fn shard(&self) -> ShardRange {
        self.shard
    }

    pub fn interacting_exception_count(&self) -> usize {
        self.interacting.len()
    }

    pub fn exception_pairs(&self) -> &[[usize; 2]] {
        &self.exception_pairs
    }

    pub fn arrays(&self) -> &ParameterArrays {
        &self.arrays
    }

    pub const fn self_energy(&self) -> f64 {
        self.self_energy
    }

    pub fn set_self_energy_scales(&mut self, scales: Option<SelfEnergyScales>) {
        self.self_energy_scales = scales;
        self.mark_dirty();
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn effective_particles(&self) -> Vec<ParticleParameters> {
        self.base_particles
            .par_iter()
            .enumerate()
            .map(|(index, base)| {
                let mut particle = *base;
                for entry in self.particle_offsets.for_entity(index) {
                    let value = self.cached_values[entry.parameter];
                    particle.charge += value * entry.charge;
                    particle.sigma += value * entry.sigma;
                    particle.epsilon += value * entry.epsilon;
                }
                particle
            })
            .collect()
    }

    pub fn effective_exceptions(&self) -> Vec<PairParameters> {
        self.base_exceptions
            .iter()
            .enumerate()
            .map(|(index, base)| {
                let mut pair = *base;
                for entry in self.exception_offsets.for_entity(index) {
                    let value = self.cached_values[entry.parameter];
                    pair.charge_product += value * entry.charge;
                    pair.sigma += value * entry.sigma;
                    pair.epsilon += value * entry.epsilon;
                }
                pair
            })
            .collect()
    }

    /// Pulls the current global values and, if anything needs it, enqueues an upload of the
    /// effective parameters on `queue`. Returns whether an upload was enqueued.
    pub fn refresh(
        &mut self,
        globals: &GlobalParameters,
        queue: &ExecutionQueue,
    ) -> EwaldResult<bool> {
        let mut changed = false;
        for (name, cached) in self.parameter_names.iter().zip(self.cached_values.iter_mut()) {
            let value = globals.get(name).ok_or_else(|| {
                EwaldError::configuration(
                    "PARAMS.UNKNOWN_GLOBAL",
                    format!("global parameter '{name}' has no value in this context"),
                )
            })?;
            if value != *cached {
                *cached = value;
                changed = true;
            }
        }
        if changed {
            self.mark_dirty();
        }
        if !self.is_dirty() && !self.has_offsets() {
            return Ok(false);
        }

        let particles = self.effective_particles();
        let exceptions = self.effective_exceptions();
        self.self_energy = self
            .self_energy_scales
            .map_or(0.0, |scales| scales.evaluate(&particles));
        trace!(
            device = self.placement.device_index,
            self_energy = self.self_energy,
            "recomputed effective parameters"
        );

        let charges: Vec<f64> = particles.iter().map(|particle| particle.charge).collect();
        let sigma_epsilon: Vec<[f64; 2]> = particles
            .iter()
            .map(|particle| [particle.sigma, particle.epsilon])
            .collect();
        let arrays = self.arrays.clone();
        let dirty = Arc::clone(&self.dirty);
        queue.enqueue("upload-parameters", move || {
            arrays.charges.upload(&charges);
            arrays.sigma_epsilon.upload(&sigma_epsilon);
            arrays.exception_parameters.upload(&exceptions);
            dirty.store(false, Ordering::Release);
            Ok(())
        });

        Ok(true)
    }

    /// Replaces base parameters and offsets while keeping the interaction topology fixed.
    pub fn reconfigure(&mut self, force: &NonbondedForceDefinition) -> EwaldResult<()> {
        let update = self.check_reconfiguration(force)?;
        self.apply_reconfiguration(force, update);
        Ok(())
    }

    /// Checks `force` against the configured topology without touching any state. The whole
    /// interacting-exception list is compared, so every device reaches the same verdict.
    pub fn check_reconfiguration(
        &self,
        force: &NonbondedForceDefinition,
    ) -> EwaldResult<Reconfiguration> {
        force.validate()?;
        if force.num_particles() != self.num_particles() {
            return Err(EwaldError::reconfiguration(
                "RECONFIGURE.PARTICLE_COUNT",
                format!(
                    "number of particles changed from {} to {}",
                    self.num_particles(),
                    force.num_particles()
                ),
            ));
        }
        if !self.has_coulomb && force.has_charges() {
            return Err(EwaldError::reconfiguration(
                "RECONFIGURE.CHARGES_ADDED",
                "charges cannot be introduced into a force that had none",
            ));
        }
        if !self.has_lennard_jones && force.has_lennard_jones() {
            return Err(EwaldError::reconfiguration(
                "RECONFIGURE.LJ_ADDED",
                "Lennard-Jones interactions cannot be introduced into a force that had none",
            ));
        }

        let interacting = interacting_exceptions(force);
        if interacting.len() != self.interacting.len() {
            return Err(EwaldError::reconfiguration(
                "RECONFIGURE.EXCEPTION_COUNT",
                format!(
                    "number of non-excluded exceptions changed from {} to {}",
                    self.interacting.len(),
                    interacting.len()
                ),
            ));
        }
        let pairs_match = interacting
            .iter()
            .zip(&self.interacting_pairs)
            .all(|(index, pair)| force.exceptions[*index].particles == *pair);
        if !pairs_match {
            return Err(EwaldError::reconfiguration(
                "RECONFIGURE.EXCEPTION_PAIRS",
                "the particles of a non-excluded exception changed",
            ));
        }
        Ok(Reconfiguration { interacting })
    }

    /// Applies an update returned by [`Self::check_reconfiguration`] for the same `force`.
    pub fn apply_reconfiguration(
        &mut self,
        force: &NonbondedForceDefinition,
        update: Reconfiguration,
    ) {
        let interacting = update.interacting;
        let layout = offset_layout(force, &interacting, self.shard);
        self.cached_values = layout
            .names
            .iter()
            .map(|name| {
                self.parameter_names
                    .iter()
                    .position(|known| known == name)
                    .map_or(0.0, |index| self.cached_values[index])
            })
            .collect();
        self.parameter_names = layout.names;
        self.particle_offsets = layout.particle_offsets;
        self.exception_offsets = layout.exception_offsets;
        self.base_particles = force.particles.clone();
        self.base_exceptions = interacting[self.shard.range()]
            .iter()
            .map(|index| PairParameters::from(&force.exceptions[*index]))
            .collect();
        self.interacting = interacting;
        self.mark_dirty();
    }
}
