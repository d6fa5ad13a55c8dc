//! Registry of pairwise bonded-style interactions evaluated on a device's primary queue.

use std::sync::Arc;

use crate::device::{DeviceContext, ForceAccumulator};
use crate::domain::{EwaldResult, PeriodicBox, Vec3};

pub trait BondedInteraction: Send + Sync {
    fn name(&self) -> &'static str;

    fn num_terms(&self) -> usize;

    /// Adds forces into `forces` (when given) and returns the interaction energy.
    fn evaluate(
        &self,
        periodic_box: &PeriodicBox,
        positions: &[Vec3],
        forces: Option<&ForceAccumulator>,
    ) -> EwaldResult<f64>;
}

#[derive(Default)]
pub struct BondedUtilities {
    interactions: Vec<Arc<dyn BondedInteraction>>,
}

impl std::fmt::Debug for BondedUtilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.interactions.iter().map(|interaction| interaction.name()))
            .finish()
    }
}

impl BondedUtilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_interaction(&mut self, interaction: Arc<dyn BondedInteraction>) {
        self.interactions.push(interaction);
    }

    pub fn len(&self) -> usize {
        self.interactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interactions.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.interactions
            .iter()
            .map(|interaction| interaction.name())
            .collect()
    }

    /// Enqueues every non-empty interaction on the device's primary queue.
    pub fn compute(&self, device: &DeviceContext, include_forces: bool, include_energy: bool) {
        let periodic_box = device.periodic_box();
        for interaction in &self.interactions {
            if interaction.num_terms() == 0 {
                continue;
            }
            let interaction = Arc::clone(interaction);
            let positions = device.positions().clone();
            let forces = Arc::clone(device.forces());
            let energy = Arc::clone(device.energy());
            device.primary().enqueue(interaction.name(), move || {
                let positions = positions.read();
                let forces = include_forces.then_some(forces.as_ref());
                let value = interaction.evaluate(&periodic_box, &positions, forces)?;
                if include_energy {
                    energy.add(value);
                }
                Ok(())
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{BondedInteraction, BondedUtilities};
    use crate::device::{
        DeviceCapabilities, DeviceContext, EnergyAccumulator, ForceAccumulator,
    };
    use crate::domain::{EwaldResult, PeriodicBox, Vec3};

    struct Spring;

    impl BondedInteraction for Spring {
        fn name(&self) -> &'static str {
            "spring"
        }

        fn num_terms(&self) -> usize {
            1
        }

        fn evaluate(
            &self,
            _periodic_box: &PeriodicBox,
            positions: &[Vec3],
            forces: Option<&ForceAccumulator>,
        ) -> EwaldResult<f64> {
            let dx = positions[1][0] - positions[0][0];
            if let Some(forces) = forces {
                forces.add(0, [dx, 0.0, 0.0]);
                forces.add(1, [-dx, 0.0, 0.0]);
            }
            Ok(0.5 * dx * dx)
        }
    }

    #[test]
    fn compute_runs_interactions_on_primary_queue() {
        let periodic_box = PeriodicBox::rectangular(3.0, 3.0, 3.0).expect("box should be valid");
        let device = DeviceContext::new(
            0,
            1,
            DeviceCapabilities::default(),
            2,
            periodic_box,
            Arc::new(ForceAccumulator::new(2)),
            Arc::new(EnergyAccumulator::new()),
        )
        .expect("device should build");
        device.positions().upload(&[[0.0, 0.0, 0.0], [2.0, 0.0, 0.0]]);

        let mut bonded = BondedUtilities::new();
        bonded.add_interaction(Arc::new(Spring));
        bonded.compute(&device, true, true);
        device.primary().finish().expect("queue should drain");

        assert_eq!(bonded.names(), vec!["spring"]);
        assert!((device.energy().get() - 2.0).abs() <= 1.0e-12);
        assert_eq!(device.forces().snapshot()[1], [-2.0, 0.0, 0.0]);
    }
}
