//! Cardinal B-spline weights and the per-axis moduli of their discrete Fourier transform.

use rayon::prelude::*;

use crate::common::constants::{BSPLINE_MODULUS_FLOOR, PI};
use crate::domain::{EwaldError, EwaldResult, PeriodicBox, Vec3};

pub const MIN_ORDER: usize = 3;
pub const MAX_ORDER: usize = 12;

pub fn validate_order(order: usize) -> EwaldResult<()> {
    if (MIN_ORDER..=MAX_ORDER).contains(&order) {
        Ok(())
    } else {
        Err(EwaldError::configuration(
            "PME.ORDER",
            format!("B-spline order must lie in [{MIN_ORDER}, {MAX_ORDER}], got {order}"),
        ))
    }
}

/// Fills `theta` with the `order` B-spline weights for fractional offset `offset` in `[0, 1)`
/// and `dtheta` with their derivatives.
pub fn bspline_weights(offset: f64, theta: &mut [f64], dtheta: &mut [f64]) {
    let order = theta.len();
    debug_assert!(order >= MIN_ORDER && dtheta.len() == order);

    theta[order - 1] = 0.0;
    theta[1] = offset;
    theta[0] = 1.0 - offset;
    for j in 3..order {
        raise_order(theta, j, offset);
    }

    dtheta[0] = -theta[0];
    for j in 1..order {
        dtheta[j] = theta[j - 1] - theta[j];
    }

    raise_order(theta, order, offset);
}

/// One step of the Cox-de Boor recursion from order `j - 1` to order `j`.
fn raise_order(theta: &mut [f64], j: usize, offset: f64) {
    let div = 1.0 / (j as f64 - 1.0);
    theta[j - 1] = div * offset * theta[j - 2];
    for k in 1..j - 1 {
        let kf = k as f64;
        theta[j - k - 1] = div
            * ((offset + kf) * theta[j - k - 2] + (j as f64 - kf - offset) * theta[j - k - 1]);
    }
    theta[0] *= div * (1.0 - offset);
}

/// `|sum_j b_j exp(2 pi i k j / size)|^2` for every `k`, where `b_j` are the B-spline values at
/// integer knots. Near-zero entries are replaced by the mean of their neighbours.
pub fn bspline_moduli(order: usize, size: usize) -> Vec<f64> {
    let mut theta = vec![0.0; order];
    let mut dtheta = vec![0.0; order];
    bspline_weights(0.0, &mut theta, &mut dtheta);

    let mut knots = vec![0.0; size];
    for (k, weight) in theta.iter().enumerate() {
        knots[(k + 1) % size] += weight;
    }

    let mut moduli: Vec<f64> = (0..size)
        .map(|k| {
            let (mut real, mut imaginary) = (0.0, 0.0);
            for (j, value) in knots.iter().enumerate() {
                let angle = 2.0 * PI * (k * j) as f64 / size as f64;
                real += value * angle.cos();
                imaginary += value * angle.sin();
            }
            real * real + imaginary * imaginary
        })
        .collect();

    for k in 0..size {
        if moduli[k] < BSPLINE_MODULUS_FLOOR {
            moduli[k] = 0.5 * (moduli[(k + size - 1) % size] + moduli[(k + 1) % size]);
        }
    }

    moduli
}

/// Per-axis B-spline moduli for one grid, computed once per grid size.
#[derive(Debug, Clone, PartialEq)]
pub struct BSplineModuliCache {
    order: usize,
    dimensions: [usize; 3],
    axes: [Vec<f64>; 3],
}

impl BSplineModuliCache {
    pub fn new(order: usize, dimensions: [usize; 3]) -> EwaldResult<Self> {
        validate_order(order)?;
        if dimensions.contains(&0) {
            return Err(EwaldError::configuration(
                "PME.GRID",
                format!("grid dimensions {dimensions:?} must be positive"),
            ));
        }

        Ok(Self {
            order,
            dimensions,
            axes: dimensions.map(|size| bspline_moduli(order, size)),
        })
    }

    pub const fn order(&self) -> usize {
        self.order
    }

    pub const fn dimensions(&self) -> [usize; 3] {
        self.dimensions
    }

    pub fn axis(&self, axis: usize) -> &[f64] {
        &self.axes[axis]
    }

    pub fn product(&self, index: [usize; 3]) -> f64 {
        self.axes[0][index[0]] * self.axes[1][index[1]] * self.axes[2][index[2]]
    }
}

/// Grid anchor and spline weights of every particle for one grid.
#[derive(Debug, Clone, Default)]
pub struct ParticleSplines {
    order: usize,
    base: Vec<[usize; 3]>,
    theta: Vec<f64>,
    dtheta: Vec<f64>,
}

impl ParticleSplines {
    pub fn new(order: usize) -> Self {
        Self {
            order,
            ..Self::default()
        }
    }

    pub const fn order(&self) -> usize {
        self.order
    }

    pub fn len(&self) -> usize {
        self.base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_empty()
    }

    pub fn assign(
        &mut self,
        periodic_box: &PeriodicBox,
        positions: &[Vec3],
        dimensions: [usize; 3],
    ) {
        let order = self.order;
        let stride = 3 * order;
        let recip = periodic_box.reciprocal();

        self.base.resize(positions.len(), [0; 3]);
        self.theta.resize(positions.len() * stride, 0.0);
        self.dtheta.resize(positions.len() * stride, 0.0);

        self.base
            .par_iter_mut()
            .zip(self.theta.par_chunks_mut(stride))
            .zip(self.dtheta.par_chunks_mut(stride))
            .zip(positions.par_iter())
            .for_each(|(((base, theta), dtheta), position)| {
                let fractional = periodic_box.fractional(*position, &recip);
                for axis in 0..3 {
                    let size = dimensions[axis];
                    let scaled = fractional[axis] * size as f64;
                    let index = (scaled as usize).min(size - 1);
                    base[axis] = index;
                    let window = axis * order..(axis + 1) * order;
                    bspline_weights(
                        scaled - index as f64,
                        &mut theta[window.clone()],
                        &mut dtheta[window],
                    );
                }
            });
    }

    pub fn base(&self, particle: usize) -> [usize; 3] {
        self.base[particle]
    }

    pub fn theta(&self, particle: usize, axis: usize) -> &[f64] {
        let start = (3 * particle + axis) * self.order;
        &self.theta[start..start + self.order]
    }

    pub fn dtheta(&self, particle: usize, axis: usize) -> &[f64] {
        let start = (3 * particle + axis) * self.order;
        &self.dtheta[start..start + self.order]
    }
}
