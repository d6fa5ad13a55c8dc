//! Per-device nonbonded force kernel.
//!
//! Configuration derives the Ewald parameters, builds the parameter table and registers the
//! direct-space exception and exclusion terms with the bonded framework. Each evaluation then
//! refreshes parameters and launches the reciprocal-space backend chosen at configuration:
//! plain Ewald sums, the mesh (optionally on a secondary queue) or a host CPU PME.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::common::config::PlatformOptions;
use crate::common::constants::{ONE_4PI_EPS0, SQRT_PI};
use crate::cpu_pme::{CpuFallbackBridge, CpuPmeFactory, CpuPmeRequest, PmeIo};
use crate::device::{
    DeviceBuffer, DeviceContext, EnergyAccumulator, ExecutionQueue, ForceAccumulator,
};
use crate::domain::{
    EvaluationFlags, EwaldError, EwaldResult, GlobalParameters, NonbondedForceDefinition,
    NonbondedMethod, PeriodicBox, PmeParameters, Vec3,
};
use crate::ewald::{EwaldParameterDeriver, EwaldSumSolver, dispersion_correction_coefficient};
use crate::exclusions::{DirectSpaceExclusionCorrector, ExceptionInteraction};
use crate::framework::BondedUtilities;
use crate::overlap::AsyncQueueOverlapCoordinator;
use crate::params::{
    ParameterArrays, ParameterTable, Reconfiguration, SelfEnergyScales, TablePlacement,
};
use crate::pme::bspline::validate_order;
use crate::pme::{
    MeshKind, ReciprocalSpaceSolver, SpreadStrategy, StableKeySort, dispersion_coefficient,
};
use crate::shard::DeviceShardSplitter;

const ELECTROSTATIC_STAGES: [&str; 6] = [
    "pme-grid-index",
    "pme-spread-charge",
    "pme-forward-fft",
    "pme-convolution",
    "pme-inverse-fft",
    "pme-interpolate-force",
];

const DISPERSION_STAGES: [&str; 6] = [
    "pme-dispersion-grid-index",
    "pme-dispersion-spread",
    "pme-dispersion-forward-fft",
    "pme-dispersion-convolution",
    "pme-dispersion-inverse-fft",
    "pme-dispersion-interpolate-force",
];

/// Scalars a checkpoint needs to confirm it belongs to this configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DerivedScalars {
    pub alpha: f64,
    pub dispersion_alpha: f64,
    pub grid: Option<[usize; 3]>,
    pub dispersion_grid: Option<[usize; 3]>,
}

enum ReciprocalBackend {
    None,
    Ewald(EwaldSumSolver),
    Mesh {
        solver: Arc<Mutex<ReciprocalSpaceSolver>>,
        kinds: Vec<MeshKind>,
        overlap: Option<AsyncQueueOverlapCoordinator>,
    },
    Cpu(CpuFallbackBridge),
}

impl ReciprocalBackend {
    const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Ewald(_) => "ewald",
            Self::Mesh { overlap: None, .. } => "mesh",
            Self::Mesh { overlap: Some(_), .. } => "mesh-overlapped",
            Self::Cpu(_) => "cpu-pme",
        }
    }
}

/// Inputs one mesh step reads when its kernels run.
struct MeshStep {
    periodic_box: PeriodicBox,
    arrays: ParameterArrays,
    positions: DeviceBuffer<Vec3>,
    forces: Option<Arc<ForceAccumulator>>,
    energy: Option<Arc<EnergyAccumulator>>,
}

/// Runs one stage under the solver lock, returning the meshes to `Idle` if it fails.
fn run_stage<T>(
    solver: &Mutex<ReciprocalSpaceSolver>,
    stage: impl FnOnce(&mut ReciprocalSpaceSolver) -> EwaldResult<T>,
) -> EwaldResult<T> {
    let mut solver = solver.lock();
    let result = stage(&mut solver);
    if result.is_err() {
        solver.reset();
    }
    result
}

fn enqueue_mesh_step(
    queue: &ExecutionQueue,
    solver: &Arc<Mutex<ReciprocalSpaceSolver>>,
    kinds: &[MeshKind],
    step: &MeshStep,
) {
    for &kind in kinds {
        let names = match kind {
            MeshKind::Electrostatic => ELECTROSTATIC_STAGES,
            MeshKind::Dispersion => DISPERSION_STAGES,
        };

        let mesh = Arc::clone(solver);
        let positions = step.positions.clone();
        let arrays = step.arrays.clone();
        let periodic_box = step.periodic_box;
        queue.enqueue(names[0], move || {
            let positions = positions.read();
            let quantities = match kind {
                MeshKind::Electrostatic => arrays.charges.download(),
                MeshKind::Dispersion => arrays
                    .sigma_epsilon
                    .read()
                    .iter()
                    .map(|&[sigma, epsilon]| dispersion_coefficient(sigma, epsilon))
                    .collect(),
            };
            run_stage(&mesh, |solver| {
                solver.assign_indices(kind, periodic_box, &positions, quantities)
            })
        });

        let mesh = Arc::clone(solver);
        queue.enqueue(names[1], move || run_stage(&mesh, |solver| solver.spread(kind)));

        let mesh = Arc::clone(solver);
        queue.enqueue(names[2], move || {
            run_stage(&mesh, |solver| solver.forward_transform(kind))
        });

        let mesh = Arc::clone(solver);
        let energy = step.energy.clone();
        queue.enqueue(names[3], move || {
            let value = run_stage(&mesh, |solver| solver.convolve(kind, energy.is_some()))?;
            if let Some(energy) = &energy {
                energy.add(value);
            }
            Ok(())
        });

        let mesh = Arc::clone(solver);
        queue.enqueue(names[4], move || {
            run_stage(&mesh, |solver| solver.inverse_transform(kind))
        });

        let mesh = Arc::clone(solver);
        let forces = step.forces.clone();
        queue.enqueue(names[5], move || {
            run_stage(&mesh, |solver| {
                solver.interpolate_forces(kind, forces.as_deref())
            })
        });
    }
}

fn dispersion_correction(force: &NonbondedForceDefinition, device_index: usize) -> f64 {
    let applies = matches!(
        force.method,
        NonbondedMethod::CutoffPeriodic | NonbondedMethod::Ewald | NonbondedMethod::Pme
    );
    if force.use_dispersion_correction && device_index == 0 && applies {
        dispersion_correction_coefficient(&force.particles, force.cutoff)
    } else {
        0.0
    }
}

fn exclusion_pairs(force: &NonbondedForceDefinition) -> Vec<[usize; 2]> {
    force
        .exceptions
        .iter()
        .map(|exception| exception.particles)
        .collect()
}

pub struct NonbondedForceKernel {
    device: Arc<DeviceContext>,
    method: NonbondedMethod,
    alpha: f64,
    dispersion_alpha: f64,
    pme: Option<PmeParameters>,
    lj_pme: Option<PmeParameters>,
    table: ParameterTable,
    exclusion_pairs: Vec<[usize; 2]>,
    dispersion_coefficient: f64,
    strategy: SpreadStrategy,
    backend: ReciprocalBackend,
}

impl std::fmt::Debug for NonbondedForceKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonbondedForceKernel")
            .field("device", &self.device.index())
            .field("method", &self.method)
            .field("alpha", &self.alpha)
            .field("backend", &self.backend.as_str())
            .finish_non_exhaustive()
    }
}

impl NonbondedForceKernel {
    pub fn initialize(
        device: Arc<DeviceContext>,
        force: &NonbondedForceDefinition,
        options: &PlatformOptions,
        cpu_pme: Option<&dyn CpuPmeFactory>,
        bonded: &mut BondedUtilities,
    ) -> EwaldResult<Self> {
        force.validate()?;
        validate_order(options.pme_order)?;
        if force.num_particles() != device.num_particles() {
            return Err(EwaldError::configuration(
                "KERNEL.PARTICLE_COUNT",
                format!(
                    "force defines {} particles but the device holds {}",
                    force.num_particles(),
                    device.num_particles()
                ),
            ));
        }

        let method = force.method;
        let periodic_box = device.periodic_box();
        let is_primary = device.index() == 0;

        let mut alpha = 0.0;
        let mut dispersion_alpha = 0.0;
        let mut pme = None;
        let mut lj_pme = None;
        let mut ewald_kmax = None;
        if method.uses_ewald_splitting() {
            let deriver = EwaldParameterDeriver::new(force.cutoff, force.ewald_error_tolerance)?;
            if method == NonbondedMethod::Ewald {
                alpha = deriver.electrostatic_alpha();
                ewald_kmax = Some(deriver.ewald_kmax(alpha, &periodic_box));
            } else {
                let parameters = EwaldParameterDeriver::resolve(force.pme_parameters, || {
                    deriver.pme_parameters(&periodic_box)
                })?;
                alpha = parameters.alpha;
                pme = Some(parameters);
                if method == NonbondedMethod::LjPme {
                    let parameters = EwaldParameterDeriver::resolve(force.lj_pme_parameters, || {
                        deriver.lj_pme_parameters(&periodic_box)
                    })?;
                    dispersion_alpha = parameters.alpha;
                    lj_pme = Some(parameters);
                }
            }
        }

        let self_energy_scales = (is_primary && method.uses_ewald_splitting()).then(|| {
            SelfEnergyScales {
                coulomb: ONE_4PI_EPS0 * alpha / SQRT_PI,
                dispersion: (method == NonbondedMethod::LjPme)
                    .then(|| dispersion_alpha.powi(6) / 3.0),
            }
        });
        let table = ParameterTable::configure(
            force,
            TablePlacement {
                device_index: device.index(),
                device_count: device.device_count(),
                padded_particles: device.padded_num_particles(),
            },
            self_energy_scales,
        )?;
        let arrays = table.arrays().clone();

        if force.include_direct_space {
            if method.uses_ewald_splitting() && !force.exceptions.is_empty() {
                let share = DeviceShardSplitter::new(force.exceptions.len(), device.device_count())?
                    .share(device.index());
                let pairs = force.exceptions[share.range()]
                    .iter()
                    .map(|exception| exception.particles)
                    .collect();
                bonded.add_interaction(Arc::new(DirectSpaceExclusionCorrector::new(
                    pairs,
                    alpha,
                    (method == NonbondedMethod::LjPme).then_some(dispersion_alpha),
                    arrays.charges.clone(),
                    arrays.sigma_epsilon.clone(),
                )));
            }
            if !table.exception_pairs().is_empty() {
                bonded.add_interaction(Arc::new(ExceptionInteraction::new(
                    table.exception_pairs().to_vec(),
                    arrays.exception_parameters.clone(),
                    method.is_periodic() && force.exceptions_use_periodic,
                )));
            }
        }

        let strategy = SpreadStrategy::for_capabilities(device.capabilities());
        let backend = if !is_primary {
            ReciprocalBackend::None
        } else {
            match (method, ewald_kmax) {
                (NonbondedMethod::Ewald, Some(kmax)) if table.has_coulomb() => {
                    ReciprocalBackend::Ewald(EwaldSumSolver::new(alpha, kmax))
                }
                (NonbondedMethod::Pme | NonbondedMethod::LjPme, _) => Self::mesh_backend(
                    &device,
                    method,
                    pme.filter(|_| table.has_coulomb()),
                    lj_pme.filter(|_| table.has_lennard_jones()),
                    options,
                    cpu_pme,
                    strategy,
                    &arrays,
                )?,
                _ => ReciprocalBackend::None,
            }
        };

        let dispersion_coefficient = dispersion_correction(force, device.index());
        info!(
            device = device.index(),
            method = %method,
            alpha,
            grid = ?pme.map(|parameters| parameters.grid),
            dispersion_alpha,
            dispersion_grid = ?lj_pme.map(|parameters| parameters.grid),
            ?strategy,
            backend = backend.as_str(),
            bonded_terms = bonded.len(),
            "configured nonbonded kernel"
        );

        Ok(Self {
            device,
            method,
            alpha,
            dispersion_alpha,
            pme,
            lj_pme,
            table,
            exclusion_pairs: exclusion_pairs(force),
            dispersion_coefficient,
            strategy,
            backend,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn mesh_backend(
        device: &Arc<DeviceContext>,
        method: NonbondedMethod,
        electrostatic: Option<PmeParameters>,
        dispersion: Option<PmeParameters>,
        options: &PlatformOptions,
        cpu_pme: Option<&dyn CpuPmeFactory>,
        strategy: SpreadStrategy,
        arrays: &ParameterArrays,
    ) -> EwaldResult<ReciprocalBackend> {
        if electrostatic.is_none() && dispersion.is_none() {
            return Ok(ReciprocalBackend::None);
        }

        if let (true, NonbondedMethod::Pme, Some(parameters)) =
            (options.use_cpu_pme, method, electrostatic)
        {
            let request = CpuPmeRequest {
                num_particles: device.num_particles(),
                parameters,
                order: options.pme_order,
            };
            let io = PmeIo::new(Arc::clone(device), arrays.charges.clone());
            if let Some(bridge) = CpuFallbackBridge::attach(cpu_pme, &request, io) {
                return Ok(ReciprocalBackend::Cpu(bridge));
            }
        }

        let solver = ReciprocalSpaceSolver::new(
            electrostatic,
            dispersion,
            options.pme_order,
            strategy,
            Box::new(StableKeySort),
        )?;
        let kinds = [
            (MeshKind::Electrostatic, electrostatic.is_some()),
            (MeshKind::Dispersion, dispersion.is_some()),
        ]
        .into_iter()
        .filter_map(|(kind, enabled)| enabled.then_some(kind))
        .collect();
        let overlap = if AsyncQueueOverlapCoordinator::is_eligible(
            options,
            device.capabilities(),
            false,
        ) {
            Some(AsyncQueueOverlapCoordinator::new(device)?)
        } else {
            None
        };

        Ok(ReciprocalBackend::Mesh {
            solver: Arc::new(Mutex::new(solver)),
            kinds,
            overlap,
        })
    }

    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }

    pub const fn method(&self) -> NonbondedMethod {
        self.method
    }

    pub const fn alpha(&self) -> f64 {
        self.alpha
    }

    pub const fn dispersion_alpha(&self) -> f64 {
        self.dispersion_alpha
    }

    pub const fn dispersion_correction_coefficient(&self) -> f64 {
        self.dispersion_coefficient
    }

    pub fn table(&self) -> &ParameterTable {
        &self.table
    }

    pub const fn spread_strategy(&self) -> SpreadStrategy {
        self.strategy
    }

    pub const fn uses_overlap(&self) -> bool {
        matches!(
            self.backend,
            ReciprocalBackend::Mesh {
                overlap: Some(_),
                ..
            }
        )
    }

    pub const fn uses_cpu_pme(&self) -> bool {
        matches!(self.backend, ReciprocalBackend::Cpu(_))
    }

    /// Refreshes parameters and launches the reciprocal-space work for one evaluation.
    ///
    /// Returns the energy that has no device-side computation: the Ewald self energy and the
    /// long-range dispersion correction.
    pub fn execute(
        &mut self,
        globals: &GlobalParameters,
        flags: EvaluationFlags,
    ) -> EwaldResult<f64> {
        let recomputed = self.table.refresh(globals, self.device.primary())?;
        if recomputed {
            debug!(device = self.device.index(), "uploaded effective parameters");
        }
        let periodic_box = self.device.periodic_box();
        let mut energy = if flags.include_reciprocal {
            self.table.self_energy()
        } else {
            0.0
        };

        if flags.include_reciprocal {
            let device = Arc::clone(&self.device);
            let arrays = self.table.arrays().clone();
            match &mut self.backend {
                ReciprocalBackend::None => {}
                ReciprocalBackend::Ewald(solver) => {
                    let solver = *solver;
                    let positions = device.positions().clone();
                    let forces = flags.include_forces.then(|| Arc::clone(device.forces()));
                    let target = flags.include_energy.then(|| Arc::clone(device.energy()));
                    device.primary().enqueue("ewald-reciprocal", move || {
                        let positions = positions.read();
                        let charges = arrays.charges.read();
                        let value = solver.compute(
                            &periodic_box,
                            &positions,
                            &charges[..positions.len()],
                            forces.as_deref(),
                        );
                        if let Some(target) = target {
                            target.add(value);
                        }
                        Ok(())
                    });
                }
                ReciprocalBackend::Mesh {
                    solver,
                    kinds,
                    overlap,
                } => {
                    let mut step = MeshStep {
                        periodic_box,
                        arrays,
                        positions: device.positions().clone(),
                        forces: flags.include_forces.then(|| Arc::clone(device.forces())),
                        energy: flags.include_energy.then(|| Arc::clone(device.energy())),
                    };
                    match overlap {
                        Some(overlap) => {
                            overlap.publish_parameters(device.primary());
                            if flags.include_energy {
                                step.energy = Some(Arc::clone(overlap.energy_buffer()));
                            }
                            enqueue_mesh_step(overlap.queue(), solver, kinds, &step);
                            overlap.publish_energy();
                        }
                        None => enqueue_mesh_step(device.primary(), solver, kinds, &step),
                    }
                }
                ReciprocalBackend::Cpu(bridge) => bridge.begin(flags.include_energy)?,
            }
        }

        if self.dispersion_coefficient != 0.0 && flags.include_direct {
            energy += self.dispersion_coefficient / periodic_box.volume();
        }
        Ok(energy)
    }

    /// Completes the reciprocal-space work started by [`execute`](Self::execute): merges the
    /// secondary-queue energy or collects the CPU PME result.
    pub fn finish_computation(&mut self, flags: EvaluationFlags) -> EwaldResult<f64> {
        if !flags.include_reciprocal {
            return Ok(0.0);
        }
        match &mut self.backend {
            ReciprocalBackend::Mesh {
                overlap: Some(overlap),
                ..
            } => {
                overlap.merge_energy(&self.device, flags.include_energy);
                Ok(0.0)
            }
            ReciprocalBackend::Cpu(bridge) => bridge.finish(flags.include_forces),
            _ => Ok(0.0),
        }
    }

    /// Waits for any secondary queue owned by this kernel.
    pub fn synchronize(&self) -> EwaldResult<()> {
        match &self.backend {
            ReciprocalBackend::Mesh {
                overlap: Some(overlap),
                ..
            } => overlap.finish(),
            _ => Ok(()),
        }
    }

    /// Replaces particle and exception parameters without changing the interaction topology.
    pub fn copy_parameters_to_context(
        &mut self,
        force: &NonbondedForceDefinition,
    ) -> EwaldResult<()> {
        let update = self.check_parameters(force)?;
        self.apply_parameters(force, update);
        Ok(())
    }

    /// Validates a parameter update against this kernel without changing it.
    pub fn check_parameters(
        &self,
        force: &NonbondedForceDefinition,
    ) -> EwaldResult<Reconfiguration> {
        if exclusion_pairs(force) != self.exclusion_pairs {
            return Err(EwaldError::reconfiguration(
                "RECONFIGURE.EXCLUSIONS",
                "the set of excluded particle pairs changed",
            ));
        }
        self.table.check_reconfiguration(force)
    }

    pub fn apply_parameters(&mut self, force: &NonbondedForceDefinition, update: Reconfiguration) {
        self.table.apply_reconfiguration(force, update);
        self.dispersion_coefficient = dispersion_correction(force, self.device.index());
        info!(
            device = self.device.index(),
            dispersion_coefficient = self.dispersion_coefficient,
            "updated nonbonded parameters"
        );
    }

    pub fn pme_parameters(&self) -> EwaldResult<PmeParameters> {
        if self.method != NonbondedMethod::Pme {
            return Err(EwaldError::configuration(
                "KERNEL.NOT_PME",
                format!("context uses {} rather than PME", self.method),
            ));
        }
        if let ReciprocalBackend::Cpu(bridge) = &self.backend {
            return Ok(bridge.parameters());
        }
        self.pme.ok_or_else(|| {
            EwaldError::internal("KERNEL.NO_GRID", "PME parameters were never derived")
        })
    }

    pub fn lj_pme_parameters(&self) -> EwaldResult<PmeParameters> {
        if self.method != NonbondedMethod::LjPme {
            return Err(EwaldError::configuration(
                "KERNEL.NOT_LJPME",
                format!("context uses {} rather than LJ-PME", self.method),
            ));
        }
        self.lj_pme.ok_or_else(|| {
            EwaldError::internal("KERNEL.NO_GRID", "LJ-PME parameters were never derived")
        })
    }

    pub fn derived_scalars(&self) -> DerivedScalars {
        DerivedScalars {
            alpha: self.alpha,
            dispersion_alpha: self.dispersion_alpha,
            grid: self.pme.map(|parameters| parameters.grid),
            dispersion_grid: self.lj_pme.map(|parameters| parameters.grid),
        }
    }

    /// Accepts a checkpoint only if it matches the scalars this kernel derived itself; the
    /// grids and bonded terms are sized from them at configuration.
    pub fn restore_derived_scalars(&self, scalars: &DerivedScalars) -> EwaldResult<()> {
        let current = self.derived_scalars();
        if scalars.grid != current.grid || scalars.dispersion_grid != current.dispersion_grid {
            return Err(EwaldError::configuration(
                "CHECKPOINT.GRID",
                format!(
                    "checkpoint grids {:?}/{:?} differ from configured {:?}/{:?}",
                    scalars.grid, scalars.dispersion_grid, current.grid, current.dispersion_grid
                ),
            ));
        }
        let same = |lhs: f64, rhs: f64| (lhs - rhs).abs() <= 1.0e-12 * rhs.abs().max(1.0);
        if !same(scalars.alpha, current.alpha)
            || !same(scalars.dispersion_alpha, current.dispersion_alpha)
        {
            return Err(EwaldError::configuration(
                "CHECKPOINT.ALPHA",
                format!(
                    "checkpoint alpha {}/{} differs from configured {}/{}",
                    scalars.alpha,
                    scalars.dispersion_alpha,
                    current.alpha,
                    current.dispersion_alpha
                ),
            ));
        }
        Ok(())
    }
}
