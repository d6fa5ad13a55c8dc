//! Reciprocal-space solver: spread, forward FFT, convolve, inverse FFT, interpolate.
//!
//! Each mesh (Coulomb and, for LJ-PME, dispersion) is a [`MeshPipeline`] whose stages must run
//! in order. Stage methods check the pipeline phase so that out-of-order calls fail instead of
//! reading a half-built grid. Both pipelines share one set of grid buffers.

use std::sync::atomic::AtomicI64;

use num_complex::Complex64;
use rayon::prelude::*;
use tracing::debug;

use super::bspline::{BSplineModuliCache, ParticleSplines, validate_order};
use super::fft::{Fft3d, RustFft3d};
use super::spread::{GridIndexSort, SpreadStrategy, spread_atomic, spread_sorted};
use crate::common::constants::{ONE_4PI_EPS0, PI, SQRT_PI};
use crate::device::ForceAccumulator;
use crate::domain::geometry::dot3;
use crate::domain::{EwaldError, EwaldResult, PeriodicBox, PmeParameters, Vec3};
use crate::numerics::erfc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeshKind {
    Electrostatic,
    Dispersion,
}

impl MeshKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Electrostatic => "electrostatic",
            Self::Dispersion => "dispersion",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverPhase {
    Idle,
    IndicesAssigned,
    Spread,
    ForwardTransformed,
    Convolved,
    InverseTransformed,
}

/// Per-particle coefficient whose pairwise product is the geometric-mean `C6 = 4 eps sigma^6`.
pub fn dispersion_coefficient(sigma: f64, epsilon: f64) -> f64 {
    2.0 * sigma.powi(3) * epsilon.sqrt()
}

#[derive(Debug, Default)]
pub struct MeshGrids {
    real: Vec<Complex64>,
    reciprocal: Vec<Complex64>,
    fixed: Vec<AtomicI64>,
    keys: Vec<(usize, usize)>,
}

impl MeshGrids {
    fn with_len(len: usize) -> Self {
        Self {
            real: vec![Complex64::default(); len],
            reciprocal: vec![Complex64::default(); len],
            fixed: (0..len).map(|_| AtomicI64::new(0)).collect(),
            keys: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.real.len()
    }

    pub fn is_empty(&self) -> bool {
        self.real.is_empty()
    }
}

pub struct MeshPipeline {
    kind: MeshKind,
    alpha: f64,
    dimensions: [usize; 3],
    moduli: BSplineModuliCache,
    fft: Box<dyn Fft3d>,
    splines: ParticleSplines,
    quantities: Vec<f64>,
    periodic_box: Option<PeriodicBox>,
    phase: SolverPhase,
}

impl std::fmt::Debug for MeshPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshPipeline")
            .field("kind", &self.kind)
            .field("alpha", &self.alpha)
            .field("dimensions", &self.dimensions)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl MeshPipeline {
    pub fn new(
        kind: MeshKind,
        parameters: PmeParameters,
        order: usize,
        fft: Box<dyn Fft3d>,
    ) -> EwaldResult<Self> {
        validate_order(order)?;
        if fft.dimensions() != parameters.grid {
            return Err(EwaldError::internal(
                "PME.FFT_DIMENSIONS",
                format!(
                    "FFT planned for {:?} but {} grid is {:?}",
                    fft.dimensions(),
                    kind.as_str(),
                    parameters.grid
                ),
            ));
        }

        Ok(Self {
            kind,
            alpha: parameters.alpha,
            dimensions: parameters.grid,
            moduli: BSplineModuliCache::new(order, parameters.grid)?,
            fft,
            splines: ParticleSplines::new(order),
            quantities: Vec::new(),
            periodic_box: None,
            phase: SolverPhase::Idle,
        })
    }

    pub const fn kind(&self) -> MeshKind {
        self.kind
    }

    pub const fn phase(&self) -> SolverPhase {
        self.phase
    }

    pub const fn parameters(&self) -> PmeParameters {
        PmeParameters {
            alpha: self.alpha,
            grid: self.dimensions,
        }
    }

    pub fn moduli(&self) -> &BSplineModuliCache {
        &self.moduli
    }

    fn total(&self) -> usize {
        self.dimensions.iter().product()
    }

    fn advance(&mut self, expected: SolverPhase, next: SolverPhase) -> EwaldResult<()> {
        if self.phase != expected {
            return Err(EwaldError::internal(
                "PME.PHASE",
                format!(
                    "{} mesh stage expected phase {:?} but pipeline is in {:?}",
                    self.kind.as_str(),
                    expected,
                    self.phase
                ),
            ));
        }
        self.phase = next;
        Ok(())
    }

    /// Abandons a partially executed step so the next one can start from `Idle`.
    pub fn reset(&mut self) {
        self.phase = SolverPhase::Idle;
    }

    pub fn assign_indices(
        &mut self,
        periodic_box: PeriodicBox,
        positions: &[Vec3],
        quantities: Vec<f64>,
    ) -> EwaldResult<()> {
        if quantities.len() < positions.len() {
            return Err(EwaldError::internal(
                "PME.QUANTITIES",
                format!(
                    "{} quantities for {} particles",
                    quantities.len(),
                    positions.len()
                ),
            ));
        }
        self.advance(SolverPhase::Idle, SolverPhase::IndicesAssigned)?;
        self.splines
            .assign(&periodic_box, positions, self.dimensions);
        self.quantities = quantities;
        self.periodic_box = Some(periodic_box);
        Ok(())
    }

    pub fn spread(
        &mut self,
        grids: &mut MeshGrids,
        strategy: SpreadStrategy,
        sorter: &dyn GridIndexSort,
    ) -> EwaldResult<()> {
        self.advance(SolverPhase::IndicesAssigned, SolverPhase::Spread)?;
        let total = self.total();
        match strategy {
            SpreadStrategy::Atomic => spread_atomic(
                &self.splines,
                &self.quantities,
                self.dimensions,
                &grids.fixed[..total],
                &mut grids.real[..total],
            ),
            SpreadStrategy::Sorted => spread_sorted(
                &self.splines,
                &self.quantities,
                self.dimensions,
                sorter,
                &mut grids.keys,
                &mut grids.real[..total],
            ),
        }
        Ok(())
    }

    pub fn forward_transform(&mut self, grids: &mut MeshGrids) -> EwaldResult<()> {
        self.advance(SolverPhase::Spread, SolverPhase::ForwardTransformed)?;
        let total = self.total();
        self.fft
            .forward(&grids.real[..total], &mut grids.reciprocal[..total]);
        Ok(())
    }

    /// Multiplies the transformed grid by the influence function and returns the mesh energy
    /// (zero when `include_energy` is false).
    pub fn convolve(&mut self, grids: &mut MeshGrids, include_energy: bool) -> EwaldResult<f64> {
        let periodic_box = self.periodic_box.ok_or_else(|| {
            EwaldError::internal("PME.NO_BOX", "convolution requested before index assignment")
        })?;
        self.advance(SolverPhase::ForwardTransformed, SolverPhase::Convolved)?;

        let recip = periodic_box.reciprocal();
        let volume = periodic_box.volume();
        let [nx, ny, nz] = self.dimensions;
        let total = self.total();
        let kind = self.kind;
        let alpha = self.alpha;
        let moduli = &self.moduli;

        let energy = grids.reciprocal[..total]
            .par_iter_mut()
            .enumerate()
            .map(|(index, value)| {
                let k = [index / (ny * nz), (index / nz) % ny, index % nz];
                let m = [
                    wrapped_frequency(k[0], nx),
                    wrapped_frequency(k[1], ny),
                    wrapped_frequency(k[2], nz),
                ];
                let mh = [
                    m[0] * recip[0][0],
                    m[0] * recip[1][0] + m[1] * recip[1][1],
                    m[0] * recip[2][0] + m[1] * recip[2][1] + m[2] * recip[2][2],
                ];
                let m2 = dot3(mh, mh);
                let denominator = moduli.product(k);
                let eterm = match kind {
                    MeshKind::Electrostatic if index == 0 => 0.0,
                    MeshKind::Electrostatic => {
                        ONE_4PI_EPS0 * (-PI * PI * m2 / (alpha * alpha)).exp()
                            / (PI * volume * m2 * denominator)
                    }
                    MeshKind::Dispersion => {
                        let b = PI * m2.sqrt() / alpha;
                        let b2 = b * b;
                        let shape =
                            (1.0 - 2.0 * b2) * (-b2).exp() + 2.0 * b2 * b * SQRT_PI * erfc(b);
                        -(PI * SQRT_PI * alpha.powi(3) * shape) / (3.0 * volume * denominator)
                    }
                };
                let energy = if include_energy {
                    0.5 * eterm * value.norm_sqr()
                } else {
                    0.0
                };
                *value *= eterm;
                energy
            })
            .sum::<f64>();

        debug!(mesh = kind.as_str(), energy, "convolved mesh");
        Ok(energy)
    }

    pub fn inverse_transform(&mut self, grids: &mut MeshGrids) -> EwaldResult<()> {
        self.advance(SolverPhase::Convolved, SolverPhase::InverseTransformed)?;
        let total = self.total();
        self.fft
            .inverse(&grids.reciprocal[..total], &mut grids.real[..total]);
        Ok(())
    }

    /// Interpolates mesh forces back to the particles and adds them to `forces`.
    pub fn interpolate_forces(
        &mut self,
        grids: &MeshGrids,
        forces: Option<&ForceAccumulator>,
    ) -> EwaldResult<()> {
        let periodic_box = self.periodic_box.ok_or_else(|| {
            EwaldError::internal("PME.NO_BOX", "interpolation requested before index assignment")
        })?;
        self.advance(SolverPhase::InverseTransformed, SolverPhase::Idle)?;
        let Some(forces) = forces else {
            return Ok(());
        };

        let recip = periodic_box.reciprocal();
        let order = self.splines.order();
        let dimensions = self.dimensions;
        let [nx, ny, nz] = dimensions;
        let scale = dimensions.map(|size| size as f64);
        let splines = &self.splines;
        let quantities = &self.quantities;
        let grid = &grids.real;

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
            let (dtheta_x, dtheta_y, dtheta_z) = (
                splines.dtheta(particle, 0),
                splines.dtheta(particle, 1),
                splines.dtheta(particle, 2),
            );

            let mut gradient = [0.0; 3];
            for ix in 0..order {
                let x = (base[0] + ix) % nx;
                for iy in 0..order {
                    let y = (base[1] + iy) % ny;
                    for iz in 0..order {
                        let z = (base[2] + iz) % nz;
                        let value = grid[(x * ny + y) * nz + z].re;
                        gradient[0] += dtheta_x[ix] * theta_y[iy] * theta_z[iz] * value;
                        gradient[1] += theta_x[ix] * dtheta_y[iy] * theta_z[iz] * value;
                        gradient[2] += theta_x[ix] * theta_y[iy] * dtheta_z[iz] * value;
                    }
                }
            }

            let [gx, gy, gz] = [
                gradient[0] * scale[0],
                gradient[1] * scale[1],
                gradient[2] * scale[2],
            ];
            forces.add(
                particle,
                [
                    -quantity * gx * recip[0][0],
                    -quantity * (gx * recip[1][0] + gy * recip[1][1]),
                    -quantity * (gx * recip[2][0] + gy * recip[2][1] + gz * recip[2][2]),
                ],
            );
        });

        Ok(())
    }
}

fn wrapped_frequency(index: usize, size: usize) -> f64 {
    if index <= size / 2 {
        index as f64
    } else {
        index as f64 - size as f64
    }
}

pub struct ReciprocalSpaceSolver {
    electrostatic: Option<MeshPipeline>,
    dispersion: Option<MeshPipeline>,
    grids: MeshGrids,
    strategy: SpreadStrategy,
    sorter: Box<dyn GridIndexSort>,
}

impl std::fmt::Debug for ReciprocalSpaceSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReciprocalSpaceSolver")
            .field("electrostatic", &self.electrostatic)
            .field("dispersion", &self.dispersion)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl ReciprocalSpaceSolver {
    pub fn new(
        electrostatic: Option<PmeParameters>,
        dispersion: Option<PmeParameters>,
        order: usize,
        strategy: SpreadStrategy,
        sorter: Box<dyn GridIndexSort>,
    ) -> EwaldResult<Self> {
        let build = |kind: MeshKind, parameters: Option<PmeParameters>| {
            parameters
                .map(|parameters| {
                    let fft = RustFft3d::new(parameters.grid)?;
                    MeshPipeline::new(kind, parameters, order, Box::new(fft))
                })
                .transpose()
        };
        let electrostatic = build(MeshKind::Electrostatic, electrostatic)?;
        let dispersion = build(MeshKind::Dispersion, dispersion)?;

        let len = electrostatic
            .iter()
            .chain(dispersion.iter())
            .map(MeshPipeline::total)
            .max()
            .unwrap_or(0);
        debug!(grid_len = len, ?strategy, "allocated shared mesh grids");

        Ok(Self {
            electrostatic,
            dispersion,
            grids: MeshGrids::with_len(len),
            strategy,
            sorter,
        })
    }

    pub const fn strategy(&self) -> SpreadStrategy {
        self.strategy
    }

    pub fn pipeline(&self, kind: MeshKind) -> Option<&MeshPipeline> {
        match kind {
            MeshKind::Electrostatic => self.electrostatic.as_ref(),
            MeshKind::Dispersion => self.dispersion.as_ref(),
        }
    }

    fn parts(
        &mut self,
        kind: MeshKind,
    ) -> EwaldResult<(&mut MeshPipeline, &mut MeshGrids, &dyn GridIndexSort)> {
        let pipeline = match kind {
            MeshKind::Electrostatic => self.electrostatic.as_mut(),
            MeshKind::Dispersion => self.dispersion.as_mut(),
        };
        let pipeline = pipeline.ok_or_else(|| {
            EwaldError::internal(
                "PME.NO_PIPELINE",
                format!("no {} mesh configured", kind.as_str()),
            )
        })?;
        Ok((pipeline, &mut self.grids, self.sorter.as_ref()))
    }

    pub fn assign_indices(
        &mut self,
        kind: MeshKind,
        periodic_box: PeriodicBox,
        positions: &[Vec3],
        quantities: Vec<f64>,
    ) -> EwaldResult<()> {
        let (pipeline, _, _) = self.parts(kind)?;
        pipeline.assign_indices(periodic_box, positions, quantities)
    }

    pub fn spread(&mut self, kind: MeshKind) -> EwaldResult<()> {
        let strategy = self.strategy;
        let (pipeline, grids, sorter) = self.parts(kind)?;
        pipeline.spread(grids, strategy, sorter)
    }

    pub fn forward_transform(&mut self, kind: MeshKind) -> EwaldResult<()> {
        let (pipeline, grids, _) = self.parts(kind)?;
        pipeline.forward_transform(grids)
    }

    pub fn convolve(&mut self, kind: MeshKind, include_energy: bool) -> EwaldResult<f64> {
        let (pipeline, grids, _) = self.parts(kind)?;
        pipeline.convolve(grids, include_energy)
    }

    pub fn inverse_transform(&mut self, kind: MeshKind) -> EwaldResult<()> {
        let (pipeline, grids, _) = self.parts(kind)?;
        pipeline.inverse_transform(grids)
    }

    pub fn interpolate_forces(
        &mut self,
        kind: MeshKind,
        forces: Option<&ForceAccumulator>,
    ) -> EwaldResult<()> {
        let (pipeline, grids, _) = self.parts(kind)?;
        pipeline.interpolate_forces(grids, forces)
    }

    /// Returns every configured mesh to `Idle` after a failed step.
    pub fn reset(&mut self) {
        for pipeline in self.electrostatic.iter_mut().chain(self.dispersion.iter_mut()) {
            pipeline.reset();
        }
    }

    /// Runs all stages of one mesh and returns its energy.
    pub fn compute(
        &mut self,
        kind: MeshKind,
        periodic_box: PeriodicBox,
        positions: &[Vec3],
        quantities: Vec<f64>,
        include_energy: bool,
        forces: Option<&ForceAccumulator>,
    ) -> EwaldResult<f64> {
        let result = self.run_stages(
            kind,
            periodic_box,
            positions,
            quantities,
            include_energy,
            forces,
        );
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn run_stages(
        &mut self,
        kind: MeshKind,
        periodic_box: PeriodicBox,
        positions: &[Vec3],
        quantities: Vec<f64>,
        include_energy: bool,
        forces: Option<&ForceAccumulator>,
    ) -> EwaldResult<f64> {
        self.assign_indices(kind, periodic_box, positions, quantities)?;
        self.spread(kind)?;
        self.forward_transform(kind)?;
        let energy = self.convolve(kind, include_energy)?;
        self.inverse_transform(kind)?;
        self.interpolate_forces(kind, forces)?;
        Ok(energy)
    }
}
