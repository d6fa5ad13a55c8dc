//! Host-side model of an accelerator context.
//!
//! A [`DeviceContext`] owns a primary in-order queue, the position buffer for its copy of the
//! system and handles to the force and energy accumulators shared by every device of one
//! logical context.

pub mod buffer;
pub mod queue;

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::common::constants::PARTICLE_PADDING;
use crate::domain::{EwaldError, EwaldResult, PeriodicBox, Vec3};

pub use buffer::{DeviceBuffer, EnergyAccumulator, ForceAccumulator};
pub use queue::{ExecutionQueue, Marker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Host,
}

impl DeviceVendor {
    /// Vendors whose drivers run a second in-order queue concurrently with the first.
    pub const fn supports_concurrent_queues(self) -> bool {
        matches!(self, Self::Nvidia | Self::Amd | Self::Host)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceCapabilities {
    pub vendor: DeviceVendor,
    pub supports_64bit_atomics: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            vendor: DeviceVendor::Host,
            supports_64bit_atomics: true,
        }
    }
}

pub fn padded_count(count: usize) -> usize {
    count.div_ceil(PARTICLE_PADDING) * PARTICLE_PADDING
}

#[derive(Debug)]
pub struct DeviceContext {
    index: usize,
    device_count: usize,
    capabilities: DeviceCapabilities,
    num_particles: usize,
    primary: ExecutionQueue,
    positions: DeviceBuffer<Vec3>,
    periodic_box: RwLock<PeriodicBox>,
    forces: Arc<ForceAccumulator>,
    energy: Arc<EnergyAccumulator>,
}

impl DeviceContext {
    pub fn new(
        index: usize,
        device_count: usize,
        capabilities: DeviceCapabilities,
        num_particles: usize,
        periodic_box: PeriodicBox,
        forces: Arc<ForceAccumulator>,
        energy: Arc<EnergyAccumulator>,
    ) -> EwaldResult<Self> {
        if index >= device_count {
            return Err(EwaldError::internal(
                "DEVICE.INDEX",
                format!("device index {index} outside context of {device_count} devices"),
            ));
        }
        if forces.len() != num_particles {
            return Err(EwaldError::internal(
                "DEVICE.FORCE_BUFFER",
                format!(
                    "force buffer holds {} particles, expected {num_particles}",
                    forces.len()
                ),
            ));
        }

        Ok(Self {
            index,
            device_count,
            capabilities,
            num_particles,
            primary: ExecutionQueue::spawn(format!("device-{index}-primary"))?,
            positions: DeviceBuffer::filled("positions", num_particles, [0.0; 3]),
            periodic_box: RwLock::new(periodic_box),
            forces,
            energy,
        })
    }

    pub const fn index(&self) -> usize {
        self.index
    }

    pub const fn device_count(&self) -> usize {
        self.device_count
    }

    pub const fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    pub const fn num_particles(&self) -> usize {
        self.num_particles
    }

    pub fn padded_num_particles(&self) -> usize {
        padded_count(self.num_particles)
    }

    pub const fn primary(&self) -> &ExecutionQueue {
        &self.primary
    }

    pub fn positions(&self) -> &DeviceBuffer<Vec3> {
        &self.positions
    }

    pub fn periodic_box(&self) -> PeriodicBox {
        *self.periodic_box.read()
    }

    pub fn set_periodic_box(&self, periodic_box: PeriodicBox) {
        *self.periodic_box.write() = periodic_box;
    }

    pub fn forces(&self) -> &Arc<ForceAccumulator> {
        &self.forces
    }

    pub fn energy(&self) -> &Arc<EnergyAccumulator> {
        &self.energy
    }

    pub fn create_secondary_queue(&self) -> EwaldResult<ExecutionQueue> {
        ExecutionQueue::spawn(format!("device-{}-secondary", self.index))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{
        DeviceCapabilities, DeviceContext, EnergyAccumulator, ForceAccumulator, padded_count,
    };
    use crate::domain::PeriodicBox;

    #[test]
    fn padding_rounds_up_to_block_size() {
        assert_eq!(padded_count(0), 0);
        assert_eq!(padded_count(1), 32);
        assert_eq!(padded_count(32), 32);
        assert_eq!(padded_count(33), 64);
    }

    #[test]
    fn context_rejects_mismatched_force_buffer() {
        let periodic_box = PeriodicBox::rectangular(2.0, 2.0, 2.0).expect("box should be valid");
        let error = DeviceContext::new(
            0,
            1,
            DeviceCapabilities::default(),
            4,
            periodic_box,
            Arc::new(ForceAccumulator::new(3)),
            Arc::new(EnergyAccumulator::new()),
        )
        .expect_err("mismatched buffer must fail");
        assert_eq!(error.placeholder(), "DEVICE.FORCE_BUFFER");
    }
}
