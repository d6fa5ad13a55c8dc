//! Host-resident PME as a drop-in replacement for the device mesh.
//!
//! A [`CpuPmeFactory`] is probed once while the nonbonded kernel is configured. When the probe
//! fails the bridge is simply not attached and the device mesh runs instead; nothing is
//! retried on later steps.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::device::{DeviceBuffer, DeviceContext, ForceAccumulator};
use crate::domain::{EwaldError, EwaldResult, PeriodicBox, PmeParameters, Vec3};
use crate::pme::{MeshKind, ReciprocalSpaceSolver, SpreadStrategy, StableKeySort};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuPmeRequest {
    pub num_particles: usize,
    pub parameters: PmeParameters,
    pub order: usize,
}

#[derive(Debug, Error)]
pub enum CpuPmeUnavailable {
    #[error("no CPU PME implementation is available")]
    Missing,
    #[error("CPU PME implementation rejected the configuration: {0}")]
    Rejected(String),
}

pub trait CpuPmeFactory: Send + Sync {
    fn create(&self, request: &CpuPmeRequest) -> Result<Box<dyn CpuPmeKernel>, CpuPmeUnavailable>;
}

/// Asynchronous reciprocal-space evaluation over `(x, y, z, charge)` records.
pub trait CpuPmeKernel: Send {
    fn begin(
        &mut self,
        posq: Vec<[f64; 4]>,
        periodic_box: PeriodicBox,
        include_energy: bool,
    ) -> EwaldResult<()>;

    /// Waits for the computation started by `begin` and returns its energy and forces.
    fn finish(&mut self) -> EwaldResult<(f64, Vec<Vec3>)>;

    fn parameters(&self) -> PmeParameters;
}

/// Moves particle data between the device buffers and host memory.
#[derive(Debug)]
pub struct PmeIo {
    device: Arc<DeviceContext>,
    charges: DeviceBuffer<f64>,
    force_staging: DeviceBuffer<Vec3>,
}

impl PmeIo {
    pub fn new(device: Arc<DeviceContext>, charges: DeviceBuffer<f64>) -> Self {
        let force_staging =
            DeviceBuffer::filled("cpu-pme-forces", device.num_particles(), [0.0; 3]);
        Self {
            device,
            charges,
            force_staging,
        }
    }

    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }

    /// Reads positions and effective charges back once every queued upload has landed.
    pub fn export_positions(&self) -> EwaldResult<Vec<[f64; 4]>> {
        self.device.primary().finish()?;
        let positions = self.device.positions().download();
        let charges = self.charges.read();
        Ok(positions
            .iter()
            .zip(charges.iter())
            .map(|(position, charge)| [position[0], position[1], position[2], *charge])
            .collect())
    }

    /// Stages host forces and enqueues the kernel that adds them into the shared buffer.
    pub fn import_forces(&self, forces: Vec<Vec3>) -> EwaldResult<()> {
        if forces.len() != self.device.num_particles() {
            return Err(EwaldError::device(
                "CPU_PME.FORCE_COUNT",
                format!(
                    "CPU PME returned {} forces for {} particles",
                    forces.len(),
                    self.device.num_particles()
                ),
            ));
        }
        self.force_staging.replace(forces);
        let staging = self.force_staging.clone();
        let target = Arc::clone(self.device.forces());
        self.device.primary().enqueue("import-cpu-pme-forces", move || {
            target.add_all(&staging.read());
            Ok(())
        });
        Ok(())
    }
}

#[derive(Debug)]
pub struct CpuFallbackBridge {
    kernel: Box<dyn CpuPmeKernel>,
    io: PmeIo,
    pending: bool,
}

impl std::fmt::Debug for dyn CpuPmeKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuPmeKernel")
            .field("parameters", &self.parameters())
            .finish()
    }
}

impl CpuFallbackBridge {
    /// Probes `factory` once. `None` means the caller keeps the device mesh.
    pub fn attach(
        factory: Option<&dyn CpuPmeFactory>,
        request: &CpuPmeRequest,
        io: PmeIo,
    ) -> Option<Self> {
        let outcome = match factory {
            Some(factory) => factory.create(request),
            None => Err(CpuPmeUnavailable::Missing),
        };
        match outcome {
            Ok(kernel) => {
                info!(
                    alpha = request.parameters.alpha,
                    grid = ?request.parameters.grid,
                    "using CPU PME for reciprocal space"
                );
                Some(Self {
                    kernel,
                    io,
                    pending: false,
                })
            }
            Err(reason) => {
                info!(%reason, "CPU PME unavailable, falling back to device mesh");
                None
            }
        }
    }

    pub fn begin(&mut self, include_energy: bool) -> EwaldResult<()> {
        let posq = self.io.export_positions()?;
        let periodic_box = self.io.device().periodic_box();
        self.kernel.begin(posq, periodic_box, include_energy)?;
        self.pending = true;
        Ok(())
    }

    /// Collects the pending host result. Returns zero energy when nothing was started.
    pub fn finish(&mut self, include_forces: bool) -> EwaldResult<f64> {
        if !self.pending {
            return Ok(0.0);
        }
        self.pending = false;
        let (energy, forces) = self.kernel.finish()?;
        if include_forces {
            self.io.import_forces(forces)?;
        }
        debug!(energy, "collected CPU PME result");
        Ok(energy)
    }

    pub fn parameters(&self) -> PmeParameters {
        self.kernel.parameters()
    }
}

/// CPU PME provider backed by [`ReciprocalSpaceSolver`] on a background thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostPmeFactory;

impl CpuPmeFactory for HostPmeFactory {
    fn create(&self, request: &CpuPmeRequest) -> Result<Box<dyn CpuPmeKernel>, CpuPmeUnavailable> {
        let solver = ReciprocalSpaceSolver::new(
            Some(request.parameters),
            None,
            request.order,
            SpreadStrategy::Atomic,
            Box::new(StableKeySort),
        )
        .map_err(|error| CpuPmeUnavailable::Rejected(error.to_string()))?;

        Ok(Box::new(HostPmeKernel {
            solver: Arc::new(Mutex::new(solver)),
            parameters: request.parameters,
            num_particles: request.num_particles,
            worker: None,
        }))
    }
}

type HostResult = EwaldResult<(f64, Vec<Vec3>)>;

struct HostPmeKernel {
    solver: Arc<Mutex<ReciprocalSpaceSolver>>,
    parameters: PmeParameters,
    num_particles: usize,
    worker: Option<JoinHandle<HostResult>>,
}

impl CpuPmeKernel for HostPmeKernel {
    fn begin(
        &mut self,
        posq: Vec<[f64; 4]>,
        periodic_box: PeriodicBox,
        include_energy: bool,
    ) -> EwaldResult<()> {
        if self.worker.is_some() {
            return Err(EwaldError::device(
                "CPU_PME.BUSY",
                "CPU PME computation started while the previous one is still pending",
            ));
        }

        let solver = Arc::clone(&self.solver);
        let num_particles = self.num_particles;
        let worker = std::thread::Builder::new()
            .name("cpu-pme".to_string())
            .spawn(move || -> HostResult {
                let positions: Vec<Vec3> = posq.iter().map(|p| [p[0], p[1], p[2]]).collect();
                let charges: Vec<f64> = posq.iter().map(|p| p[3]).collect();
                let forces = ForceAccumulator::new(num_particles);
                let energy = solver.lock().compute(
                    MeshKind::Electrostatic,
                    periodic_box,
                    &positions,
                    charges,
                    include_energy,
                    Some(&forces),
                )?;
                Ok((energy, forces.snapshot()))
            })
            .map_err(|error| {
                EwaldError::device("CPU_PME.SPAWN", format!("failed to start CPU PME: {error}"))
            })?;
        self.worker = Some(worker);
        Ok(())
    }

    fn finish(&mut self) -> HostResult {
        let worker = self.worker.take().ok_or_else(|| {
            EwaldError::internal("CPU_PME.IDLE", "CPU PME finish without a pending computation")
        })?;
        worker
            .join()
            .map_err(|_| EwaldError::device("CPU_PME.PANIC", "CPU PME worker panicked"))?
    }

    fn parameters(&self) -> PmeParameters {
        self.parameters
    }
}
