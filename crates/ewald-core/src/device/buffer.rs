use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::common::constants::FIXED_POINT_SCALE;
use crate::domain::Vec3;

/// Shared handle to an array that lives "on the device".
///
/// Cloning the handle aliases the same storage, the way device buffer objects do.
#[derive(Debug)]
pub struct DeviceBuffer<T> {
    name: &'static str,
    data: Arc<RwLock<Vec<T>>>,
}

impl<T> Clone for DeviceBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            data: Arc::clone(&self.data),
        }
    }
}

impl<T: Clone> DeviceBuffer<T> {
    pub fn filled(name: &'static str, len: usize, value: T) -> Self {
        Self::from_vec(name, vec![value; len])
    }

    pub fn from_vec(name: &'static str, values: Vec<T>) -> Self {
        Self {
            name,
            data: Arc::new(RwLock::new(values)),
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces the leading elements with `values`, leaving any padding untouched.
    pub fn upload(&self, values: &[T]) {
        let mut data = self.data.write();
        let count = values.len().min(data.len());
        data[..count].clone_from_slice(&values[..count]);
    }

    pub fn replace(&self, values: Vec<T>) {
        *self.data.write() = values;
    }

    pub fn download(&self) -> Vec<T> {
        self.data.read().clone()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<T>> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<T>> {
        self.data.write()
    }
}

pub fn to_fixed(value: f64) -> i64 {
    (value * FIXED_POINT_SCALE).round() as i64
}

pub fn from_fixed(value: i64) -> f64 {
    value as f64 / FIXED_POINT_SCALE
}

/// Per-particle force buffer with 64-bit fixed-point components.
///
/// Integer addition commutes exactly, so the accumulated forces do not depend on the order
/// in which kernels or threads contribute.
#[derive(Debug)]
pub struct ForceAccumulator {
    components: Vec<AtomicI64>,
}

impl ForceAccumulator {
    pub fn new(num_particles: usize) -> Self {
        Self {
            components: (0..3 * num_particles).map(|_| AtomicI64::new(0)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.components.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn add(&self, index: usize, force: Vec3) {
        let base = 3 * index;
        for (axis, component) in force.into_iter().enumerate() {
            self.components[base + axis].fetch_add(to_fixed(component), Ordering::Relaxed);
        }
    }

    pub fn add_all(&self, forces: &[Vec3]) {
        for (index, force) in forces.iter().enumerate().take(self.len()) {
            self.add(index, *force);
        }
    }

    pub fn snapshot(&self) -> Vec<Vec3> {
        self.components
            .chunks_exact(3)
            .map(|chunk| {
                [
                    from_fixed(chunk[0].load(Ordering::Relaxed)),
                    from_fixed(chunk[1].load(Ordering::Relaxed)),
                    from_fixed(chunk[2].load(Ordering::Relaxed)),
                ]
            })
            .collect()
    }

    pub fn clear(&self) {
        for component in &self.components {
            component.store(0, Ordering::Relaxed);
        }
    }
}

/// Scalar energy buffer written by device kernels.
#[derive(Debug, Default)]
pub struct EnergyAccumulator {
    value: Mutex<f64>,
}

impl EnergyAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, energy: f64) {
        *self.value.lock() += energy;
    }

    pub fn get(&self) -> f64 {
        *self.value.lock()
    }

    pub fn take(&self) -> f64 {
        std::mem::take(&mut *self.value.lock())
    }

    pub fn clear(&self) {
        *self.value.lock() = 0.0;
    }
}
