//! A logical context spanning one or more devices that share force and energy buffers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::common::config::{PlatformOptions, SystemDescription};
use crate::cpu_pme::CpuPmeFactory;
use crate::device::{DeviceCapabilities, DeviceContext, EnergyAccumulator, ForceAccumulator};
use crate::domain::{
    EvaluationFlags, EwaldError, EwaldResult, GlobalParameters, NonbondedForceDefinition,
    PeriodicBox, Vec3,
};
use crate::framework::BondedUtilities;
use crate::kernel::NonbondedForceKernel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub energy: f64,
    pub forces: Vec<Vec3>,
}

struct DeviceSlot {
    device: Arc<DeviceContext>,
    kernel: NonbondedForceKernel,
    bonded: BondedUtilities,
}

pub struct LogicalContext {
    slots: Vec<DeviceSlot>,
    forces: Arc<ForceAccumulator>,
    energy: Arc<EnergyAccumulator>,
    globals: GlobalParameters,
    num_particles: usize,
}

impl std::fmt::Debug for LogicalContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalContext")
            .field("devices", &self.slots.len())
            .field("num_particles", &self.num_particles)
            .field("globals", &self.globals)
            .finish_non_exhaustive()
    }
}

impl LogicalContext {
    pub fn new(
        force: &NonbondedForceDefinition,
        periodic_box: PeriodicBox,
        options: &PlatformOptions,
        capabilities: &[DeviceCapabilities],
        cpu_pme: Option<&dyn CpuPmeFactory>,
    ) -> EwaldResult<Self> {
        if capabilities.is_empty() {
            return Err(EwaldError::configuration(
                "CONTEXT.NO_DEVICES",
                "a context needs at least one device",
            ));
        }

        let num_particles = force.num_particles();
        let forces = Arc::new(ForceAccumulator::new(num_particles));
        let energy = Arc::new(EnergyAccumulator::new());
        let mut slots = Vec::with_capacity(capabilities.len());
        for (index, device_capabilities) in capabilities.iter().enumerate() {
            let device = Arc::new(DeviceContext::new(
                index,
                capabilities.len(),
                *device_capabilities,
                num_particles,
                periodic_box,
                Arc::clone(&forces),
                Arc::clone(&energy),
            )?);
            let mut bonded = BondedUtilities::new();
            let kernel = NonbondedForceKernel::initialize(
                Arc::clone(&device),
                force,
                options,
                cpu_pme,
                &mut bonded,
            )?;
            slots.push(DeviceSlot {
                device,
                kernel,
                bonded,
            });
        }

        info!(
            devices = slots.len(),
            particles = num_particles,
            method = %force.method,
            "created logical context"
        );
        Ok(Self {
            slots,
            forces,
            energy,
            globals: force.global_parameters.clone(),
            num_particles,
        })
    }

    /// Builds a context from a JSON system description and loads its positions.
    pub fn from_description(
        description: &SystemDescription,
        cpu_pme: Option<&dyn CpuPmeFactory>,
    ) -> EwaldResult<Self> {
        let mut context = Self::new(
            &description.force,
            description.periodic_box,
            &description.platform,
            &description.devices,
            cpu_pme,
        )?;
        for (name, value) in description.global_parameters.iter() {
            context.set_global_parameter(name, value)?;
        }
        context.set_positions(&description.positions)?;
        Ok(context)
    }

    pub fn device_count(&self) -> usize {
        self.slots.len()
    }

    pub const fn num_particles(&self) -> usize {
        self.num_particles
    }

    pub fn kernel(&self, device: usize) -> Option<&NonbondedForceKernel> {
        self.slots.get(device).map(|slot| &slot.kernel)
    }

    pub fn global_parameters(&self) -> &GlobalParameters {
        &self.globals
    }

    pub fn set_positions(&mut self, positions: &[Vec3]) -> EwaldResult<()> {
        if positions.len() != self.num_particles {
            return Err(EwaldError::configuration(
                "CONTEXT.POSITIONS",
                format!(
                    "{} positions supplied for {} particles",
                    positions.len(),
                    self.num_particles
                ),
            ));
        }
        for slot in &self.slots {
            slot.device.positions().upload(positions);
        }
        Ok(())
    }

    pub fn set_periodic_box(&mut self, periodic_box: PeriodicBox) {
        for slot in &self.slots {
            slot.device.set_periodic_box(periodic_box);
        }
    }

    pub fn set_global_parameter(&mut self, name: &str, value: f64) -> EwaldResult<()> {
        if !self.globals.contains(name) {
            return Err(EwaldError::configuration(
                "CONTEXT.UNKNOWN_GLOBAL",
                format!("context defines no global parameter '{name}'"),
            ));
        }
        self.globals.set(name, value);
        Ok(())
    }

    /// Runs one force evaluation across every device and reads the shared buffers back.
    pub fn evaluate(&mut self, flags: EvaluationFlags) -> EwaldResult<Evaluation> {
        self.forces.clear();
        self.energy.clear();

        let launched = self.launch(flags);
        let drained = self.drain();
        let host_energy = launched?;
        drained?;

        let energy = if flags.include_energy {
            host_energy + self.energy.get()
        } else {
            0.0
        };
        let forces = if flags.include_forces {
            self.forces.snapshot()
        } else {
            Vec::new()
        };
        debug!(energy, "evaluated nonbonded force");
        Ok(Evaluation { energy, forces })
    }

    fn launch(&mut self, flags: EvaluationFlags) -> EwaldResult<f64> {
        let mut energy = 0.0;
        for slot in &mut self.slots {
            energy += slot.kernel.execute(&self.globals, flags)?;
        }
        if flags.include_direct {
            for slot in &self.slots {
                slot.bonded
                    .compute(&slot.device, flags.include_forces, flags.include_energy);
            }
        }
        for slot in &mut self.slots {
            energy += slot.kernel.finish_computation(flags)?;
        }
        Ok(energy)
    }

    /// Waits for every queue, reporting the first failure after all of them have drained.
    fn drain(&self) -> EwaldResult<()> {
        let mut first_error = None;
        for slot in &self.slots {
            for result in [slot.device.primary().finish(), slot.kernel.synchronize()] {
                if let Err(error) = result {
                    first_error.get_or_insert(error);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Pushes new particle and exception parameters to every device. Every device checks the
    /// update before any of them applies it, so a rejected update leaves the context unchanged.
    pub fn update_parameters(&mut self, force: &NonbondedForceDefinition) -> EwaldResult<()> {
        let updates = self
            .slots
            .iter()
            .map(|slot| slot.kernel.check_parameters(force))
            .collect::<EwaldResult<Vec<_>>>()?;
        for (slot, update) in self.slots.iter_mut().zip(updates) {
            slot.kernel.apply_parameters(force, update);
        }
        for (name, value) in force.global_parameters.iter() {
            if !self.globals.contains(name) {
                self.globals.set(name, value);
            }
        }
        Ok(())
    }
}
