//! Smooth particle-mesh Ewald reciprocal-space electrostatics and dispersion.

pub mod common;
pub mod context;
pub mod cpu_pme;
pub mod device;
pub mod domain;
pub mod ewald;
pub mod exclusions;
pub mod framework;
pub mod kernel;
pub mod numerics;
pub mod overlap;
pub mod params;
pub mod pme;
pub mod shard;

pub use common::config::{PlatformOptions, SystemDescription, load_system_description};
pub use context::{Evaluation, LogicalContext};
pub use cpu_pme::{CpuFallbackBridge, CpuPmeFactory, CpuPmeKernel, HostPmeFactory};
pub use device::{DeviceCapabilities, DeviceVendor};
pub use domain::{
    EvaluationFlags, EwaldError, EwaldErrorCategory, EwaldResult, ExceptionRecord,
    GlobalParameters, NonbondedForceDefinition, NonbondedMethod, OffsetTarget, ParameterOffset,
    ParticleParameters, PeriodicBox, PmeParameters, Vec3,
};
pub use ewald::EwaldParameterDeriver;
pub use exclusions::DirectSpaceExclusionCorrector;
pub use kernel::{DerivedScalars, NonbondedForceKernel};
pub use overlap::AsyncQueueOverlapCoordinator;
pub use params::ParameterTable;
pub use pme::{BSplineModuliCache, ReciprocalSpaceSolver};
pub use shard::DeviceShardSplitter;
