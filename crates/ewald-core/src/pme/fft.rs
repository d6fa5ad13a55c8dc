//! Three-dimensional complex FFT over row-major `[x][y][z]` grids.

use std::sync::Arc;

use num_complex::Complex64;
use rayon::prelude::*;
use rustfft::{Fft, FftPlanner};

use crate::domain::{EwaldError, EwaldResult};
use crate::ewald::find_legal_dimension;

/// FFT service used by the mesh pipelines.
///
/// The inverse transform is unnormalized, so `inverse(forward(x)) = N x`.
pub trait Fft3d: Send + Sync {
    fn dimensions(&self) -> [usize; 3];

    fn forward(&self, input: &[Complex64], output: &mut [Complex64]);

    fn inverse(&self, input: &[Complex64], output: &mut [Complex64]);
}

struct AxisPlans {
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

pub struct RustFft3d {
    dimensions: [usize; 3],
    plans: [AxisPlans; 3],
}

impl std::fmt::Debug for RustFft3d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustFft3d")
            .field("dimensions", &self.dimensions)
            .finish_non_exhaustive()
    }
}

impl RustFft3d {
    pub fn new(dimensions: [usize; 3]) -> EwaldResult<Self> {
        if let Some(size) = dimensions
            .iter()
            .copied()
            .find(|size| *size == 0 || find_legal_dimension(*size) != *size)
        {
            return Err(EwaldError::configuration(
                "FFT.ILLEGAL_DIMENSION",
                format!("grid dimension {size} is not a product of 2, 3, 5 and 7"),
            ));
        }

        let mut planner = FftPlanner::<f64>::new();
        let plans = dimensions.map(|size| AxisPlans {
            forward: planner.plan_fft_forward(size),
            inverse: planner.plan_fft_inverse(size),
        });

        Ok(Self { dimensions, plans })
    }

    fn plan(&self, axis: usize, inverse: bool) -> &dyn Fft<f64> {
        let plans = &self.plans[axis];
        if inverse {
            plans.inverse.as_ref()
        } else {
            plans.forward.as_ref()
        }
    }

    fn transform(&self, input: &[Complex64], output: &mut [Complex64], inverse: bool) {
        let [nx, ny, nz] = self.dimensions;
        let total = nx * ny * nz;
        output[..total].copy_from_slice(&input[..total]);
        let grid = &mut output[..total];

        let z_plan = self.plan(2, inverse);
        grid.par_chunks_exact_mut(nz)
            .for_each(|line| z_plan.process(line));

        let y_plan = self.plan(1, inverse);
        grid.par_chunks_exact_mut(ny * nz).for_each(|slab| {
            let mut line = vec![Complex64::default(); ny];
            for z in 0..nz {
                for (y, value) in line.iter_mut().enumerate() {
                    *value = slab[y * nz + z];
                }
                y_plan.process(&mut line);
                for (y, value) in line.iter().enumerate() {
                    slab[y * nz + z] = *value;
                }
            }
        });

        let x_plan = self.plan(0, inverse);
        let plane = ny * nz;
        let mut line = vec![Complex64::default(); nx];
        for offset in 0..plane {
            for (x, value) in line.iter_mut().enumerate() {
                *value = grid[x * plane + offset];
            }
            x_plan.process(&mut line);
            for (x, value) in line.iter().enumerate() {
                grid[x * plane + offset] = *value;
            }
        }
    }
}

impl Fft3d for RustFft3d {
    fn dimensions(&self) -> [usize; 3] {
        self.dimensions
    }

    fn forward(&self, input: &[Complex64], output: &mut [Complex64]) {
        self.transform(input, output, false);
    }

    fn inverse(&self, input: &[Complex64], output: &mut [Complex64]) {
        self.transform(input, output, true);
    }
}
