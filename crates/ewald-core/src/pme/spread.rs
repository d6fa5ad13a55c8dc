//! Charge spreading onto the mesh.
//!
//! Two strategies produce the same grid: atomic fixed-point scatter when the device has
//! 64-bit atomics, and a gather over particles pre-sorted by grid cell otherwise.

use std::sync::atomic::{AtomicI64, Ordering};

use num_complex::Complex64;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::bspline::ParticleSplines;
use crate::device::DeviceCapabilities;
use crate::device::buffer::{from_fixed, to_fixed};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpreadStrategy {
    Atomic,
    Sorted,
}

impl SpreadStrategy {
    pub const fn for_capabilities(capabilities: &DeviceCapabilities) -> Self {
        if capabilities.supports_64bit_atomics {
            Self::Atomic
        } else {
            Self::Sorted
        }
    }
}

/// Sorts `(cell, particle)` keys by cell. Implementations must be stable.
pub trait GridIndexSort: Send + Sync {
    fn sort(&self, keys: &mut [(usize, usize)]);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StableKeySort;

impl GridIndexSort for StableKeySort {
    fn sort(&self, keys: &mut [(usize, usize)]) {
        keys.par_sort_by_key(|&(cell, _)| cell);
    }
}

fn flat_index(dimensions: [usize; 3], point: [usize; 3]) -> usize {
    (point[0] * dimensions[1] + point[1]) * dimensions[2] + point[2]
}

pub fn spread_atomic(
    splines: &ParticleSplines,
    quantities: &[f64],
    dimensions: [usize; 3],
    scratch: &[AtomicI64],
    grid: &mut [Complex64],
) {
    let order = splines.order();
    let [nx, ny, nz] = dimensions;

    (0..splines.len()).into_par_iter().for_each(|particle| {
        let quantity = quantities[particle];
        if quantity == 0.0 {
            return;
        }
        let base = splines.base(particle);
        let (theta_x, theta_y, theta_z) = (
            splines.theta(particle, 0),
            splines.theta(particle, 1),
            splines.theta(particle, 2),
        );
        for ix in 0..order {
            let x = (base[0] + ix) % nx;
            let wx = quantity * theta_x[ix];
            for iy in 0..order {
                let y = (base[1] + iy) % ny;
                let wxy = wx * theta_y[iy];
                for iz in 0..order {
                    let z = (base[2] + iz) % nz;
                    scratch[flat_index(dimensions, [x, y, z])]
                        .fetch_add(to_fixed(wxy * theta_z[iz]), Ordering::Relaxed);
                }
            }
        }
    });

    grid.par_iter_mut()
        .zip(scratch.par_iter())
        .for_each(|(value, fixed)| {
            *value = Complex64::new(from_fixed(fixed.swap(0, Ordering::Relaxed)), 0.0);
        });
}

pub fn spread_sorted(
    splines: &ParticleSplines,
    quantities: &[f64],
    dimensions: [usize; 3],
    sorter: &dyn GridIndexSort,
    keys: &mut Vec<(usize, usize)>,
    grid: &mut [Complex64],
) {
    let order = splines.order();
    let [nx, ny, nz] = dimensions;
    let total = nx * ny * nz;

    keys.clear();
    keys.extend((0..splines.len()).map(|particle| {
        (flat_index(dimensions, splines.base(particle)), particle)
    }));
    sorter.sort(keys);

    let mut cell_start = vec![0usize; total + 1];
    for &(cell, _) in keys.iter() {
        cell_start[cell + 1] += 1;
    }
    for cell in 0..total {
        cell_start[cell + 1] += cell_start[cell];
    }
    let keys = &keys[..];

    grid.par_iter_mut().enumerate().for_each(|(index, value)| {
        let point = [index / (ny * nz), (index / nz) % ny, index % nz];
        let mut sum = 0.0;
        for ix in 0..order {
            let bx = (point[0] + order * nx - ix) % nx;
            for iy in 0..order {
                let by = (point[1] + order * ny - iy) % ny;
                for iz in 0..order {
                    let bz = (point[2] + order * nz - iz) % nz;
                    let cell = flat_index(dimensions, [bx, by, bz]);
                    for &(_, particle) in &keys[cell_start[cell]..cell_start[cell + 1]] {
                        sum += quantities[particle]
                            * splines.theta(particle, 0)[ix]
                            * splines.theta(particle, 1)[iy]
                            * splines.theta(particle, 2)[iz];
                    }
                }
            }
        }
        *value = Complex64::new(sum, 0.0);
    });
}
