//! Runs the reciprocal-space pipeline on a secondary queue so it overlaps the direct-space
//! work on the primary queue.
//!
//! Two handoffs order the queues against each other:
//!
//! * `publish_parameters`: the primary queue records a marker once the current parameters are
//!   uploaded and the secondary queue waits on it before its first mesh kernel.
//! * `publish_energy`: the secondary queue records a marker after its last mesh kernel and the
//!   primary queue waits on it before folding the mesh energy into the shared energy buffer.
//!
//! Forces need neither handoff because the force buffer accumulates in fixed point.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::common::config::PlatformOptions;
use crate::device::{DeviceCapabilities, DeviceContext, EnergyAccumulator, ExecutionQueue, Marker};
use crate::domain::EwaldResult;

#[derive(Debug)]
pub struct AsyncQueueOverlapCoordinator {
    queue: ExecutionQueue,
    energy: Arc<EnergyAccumulator>,
    pending_energy: Option<Marker>,
}

impl AsyncQueueOverlapCoordinator {
    pub fn is_eligible(
        options: &PlatformOptions,
        capabilities: &DeviceCapabilities,
        cpu_pme_active: bool,
    ) -> bool {
        !options.disable_pme_queue
            && !cpu_pme_active
            && capabilities.supports_64bit_atomics
            && capabilities.vendor.supports_concurrent_queues()
    }

    pub fn new(device: &DeviceContext) -> EwaldResult<Self> {
        let queue = device.create_secondary_queue()?;
        debug!(device = device.index(), queue = queue.name(), "reciprocal space overlap enabled");
        Ok(Self {
            queue,
            energy: Arc::new(EnergyAccumulator::new()),
            pending_energy: None,
        })
    }

    pub const fn queue(&self) -> &ExecutionQueue {
        &self.queue
    }

    /// Energy produced on the secondary queue, merged into the device buffer by
    /// [`merge_energy`](Self::merge_energy).
    pub fn energy_buffer(&self) -> &Arc<EnergyAccumulator> {
        &self.energy
    }

    /// Makes every later secondary-queue kernel wait for the work already submitted to
    /// `primary`.
    pub fn publish_parameters(&self, primary: &ExecutionQueue) {
        let ready = primary.record_marker();
        self.queue.wait_for(&ready);
        trace!(queue = self.queue.name(), "published parameters to secondary queue");
    }

    /// Marks the end of this step's mesh work on the secondary queue.
    pub fn publish_energy(&mut self) {
        self.pending_energy = Some(self.queue.record_marker());
    }

    /// Enqueues the energy merge on the device's primary queue. Returns `false` without
    /// touching either queue when energy was not requested.
    pub fn merge_energy(&mut self, device: &DeviceContext, include_energy: bool) -> bool {
        let pending = self.pending_energy.take();
        if !include_energy {
            return false;
        }
        let Some(marker) = pending else {
            return false;
        };

        device.primary().wait_for(&marker);
        let source = Arc::clone(&self.energy);
        let target = Arc::clone(device.energy());
        device.primary().enqueue("merge-pme-energy", move || {
            target.add(source.take());
            Ok(())
        });
        true
    }

    /// Blocks until the secondary queue drains, surfacing any mesh failure.
    pub fn finish(&self) -> EwaldResult<()> {
        self.queue.finish()
    }
}
