pub mod errors;
pub mod geometry;

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::common::constants::DEFAULT_EWALD_ERROR_TOLERANCE;

pub use errors::{EwaldError, EwaldErrorCategory, EwaldResult};
pub use geometry::{PeriodicBox, Vec3};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NonbondedMethod {
    #[default]
    NoCutoff,
    CutoffNonPeriodic,
    CutoffPeriodic,
    Ewald,
    Pme,
    LjPme,
}

impl NonbondedMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoCutoff => "no-cutoff",
            Self::CutoffNonPeriodic => "cutoff-non-periodic",
            Self::CutoffPeriodic => "cutoff-periodic",
            Self::Ewald => "ewald",
            Self::Pme => "pme",
            Self::LjPme => "lj-pme",
        }
    }

    pub const fn is_periodic(self) -> bool {
        matches!(
            self,
            Self::CutoffPeriodic | Self::Ewald | Self::Pme | Self::LjPme
        )
    }

    /// Methods that split Coulomb interactions into direct and reciprocal parts.
    pub const fn uses_ewald_splitting(self) -> bool {
        matches!(self, Self::Ewald | Self::Pme | Self::LjPme)
    }

    pub const fn uses_mesh(self) -> bool {
        matches!(self, Self::Pme | Self::LjPme)
    }
}

impl Display for NonbondedMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ParticleParameters {
    pub charge: f64,
    pub sigma: f64,
    pub epsilon: f64,
}

impl ParticleParameters {
    pub const fn new(charge: f64, sigma: f64, epsilon: f64) -> Self {
        Self {
            charge,
            sigma,
            epsilon,
        }
    }
}

/// A particle pair whose interaction is replaced by explicit parameters.
///
/// Pairs with zero charge product and zero epsilon are pure exclusions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub particles: [usize; 2],
    pub charge_product: f64,
    pub sigma: f64,
    pub epsilon: f64,
}

impl ExceptionRecord {
    pub const fn new(
        particles: [usize; 2],
        charge_product: f64,
        sigma: f64,
        epsilon: f64,
    ) -> Self {
        Self {
            particles,
            charge_product,
            sigma,
            epsilon,
        }
    }

    pub const fn exclusion(particles: [usize; 2]) -> Self {
        Self::new(particles, 0.0, 1.0, 0.0)
    }

    pub fn carries_interaction(&self) -> bool {
        self.charge_product != 0.0 || self.epsilon != 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OffsetTarget {
    Particle,
    Exception,
}

/// Linear dependence of one entity's parameters on a named global parameter.
///
/// The effective parameters are `base + value * (charge, sigma, epsilon)` summed over every
/// offset that targets the entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterOffset {
    pub parameter: String,
    pub target: OffsetTarget,
    pub index: usize,
    #[serde(default)]
    pub charge: f64,
    #[serde(default)]
    pub sigma: f64,
    #[serde(default)]
    pub epsilon: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PmeParameters {
    pub alpha: f64,
    pub grid: [usize; 3],
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalParameters {
    values: BTreeMap<String, f64>,
}

impl GlobalParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn set(&mut self, name: impl Into<String>, value: f64) {
        self.values.insert(name.into(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(name, value)| (name.as_str(), *value))
    }
}

/// Which parts of the nonbonded energy a single evaluation should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluationFlags {
    pub include_forces: bool,
    pub include_energy: bool,
    pub include_direct: bool,
    pub include_reciprocal: bool,
}

impl EvaluationFlags {
    pub const fn all() -> Self {
        Self {
            include_forces: true,
            include_energy: true,
            include_direct: true,
            include_reciprocal: true,
        }
    }

    pub const fn reciprocal_only() -> Self {
        Self {
            include_direct: false,
            ..Self::all()
        }
    }

    pub const fn direct_only() -> Self {
        Self {
            include_reciprocal: false,
            ..Self::all()
        }
    }
}

impl Default for EvaluationFlags {
    fn default() -> Self {
        Self::all()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NonbondedForceDefinition {
    pub method: NonbondedMethod,
    pub cutoff: f64,
    pub ewald_error_tolerance: f64,
    pub pme_parameters: Option<PmeParameters>,
    pub lj_pme_parameters: Option<PmeParameters>,
    pub use_dispersion_correction: bool,
    pub include_direct_space: bool,
    pub exceptions_use_periodic: bool,
    pub particles: Vec<ParticleParameters>,
    pub exceptions: Vec<ExceptionRecord>,
    pub global_parameters: GlobalParameters,
    pub offsets: Vec<ParameterOffset>,
}

impl Default for NonbondedForceDefinition {
    fn default() -> Self {
        Self {
            method: NonbondedMethod::NoCutoff,
            cutoff: 1.0,
            ewald_error_tolerance: DEFAULT_EWALD_ERROR_TOLERANCE,
            pme_parameters: None,
            lj_pme_parameters: None,
            use_dispersion_correction: true,
            include_direct_space: true,
            exceptions_use_periodic: false,
            particles: Vec::new(),
            exceptions: Vec::new(),
            global_parameters: GlobalParameters::new(),
            offsets: Vec::new(),
        }
    }
}

impl NonbondedForceDefinition {
    pub fn num_particles(&self) -> usize {
        self.particles.len()
    }

    pub fn has_offsets(&self) -> bool {
        !self.offsets.is_empty()
    }

    pub fn has_charges(&self) -> bool {
        self.particles.iter().any(|particle| particle.charge != 0.0)
            || self
                .exceptions
                .iter()
                .any(|exception| exception.charge_product != 0.0)
            || self.offsets.iter().any(|offset| offset.charge != 0.0)
    }

    pub fn has_lennard_jones(&self) -> bool {
        self.particles.iter().any(|particle| particle.epsilon != 0.0)
            || self
                .exceptions
                .iter()
                .any(|exception| exception.epsilon != 0.0)
            || self.offsets.iter().any(|offset| offset.epsilon != 0.0)
    }

    /// Structural checks that do not depend on the evaluation platform.
    pub fn validate(&self) -> EwaldResult<()> {
        if self.method.uses_ewald_splitting() && self.cutoff <= 0.0 {
            return Err(EwaldError::configuration(
                "FORCE.CUTOFF",
                format!("cutoff must be positive, got {}", self.cutoff),
            ));
        }
        if !(self.ewald_error_tolerance > 0.0 && self.ewald_error_tolerance < 1.0) {
            return Err(EwaldError::configuration(
                "FORCE.TOLERANCE",
                format!(
                    "Ewald error tolerance must lie in (0, 1), got {}",
                    self.ewald_error_tolerance
                ),
            ));
        }

        let num_particles = self.num_particles();
        for (index, exception) in self.exceptions.iter().enumerate() {
            let [first, second] = exception.particles;
            if first >= num_particles || second >= num_particles || first == second {
                return Err(EwaldError::configuration(
                    "FORCE.EXCEPTION_PARTICLES",
                    format!(
                        "exception {index} references invalid particle pair ({first}, {second})"
                    ),
                ));
            }
        }

        for offset in &self.offsets {
            let limit = match offset.target {
                OffsetTarget::Particle => num_particles,
                OffsetTarget::Exception => self.exceptions.len(),
            };
            if offset.index >= limit {
                return Err(EwaldError::configuration(
                    "FORCE.OFFSET_INDEX",
                    format!(
                        "offset on '{}' targets {:?} {} but only {} exist",
                        offset.parameter, offset.target, offset.index, limit
                    ),
                ));
            }
            if !self.global_parameters.contains(&offset.parameter) {
                return Err(EwaldError::configuration(
                    "FORCE.OFFSET_PARAMETER",
                    format!(
                        "offset references undefined global parameter '{}'",
                        offset.parameter
                    ),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ExceptionRecord, NonbondedForceDefinition, NonbondedMethod, OffsetTarget,
        ParameterOffset, ParticleParameters,
    };

    fn two_particle_force() -> NonbondedForceDefinition {
        NonbondedForceDefinition {
            method: NonbondedMethod::Pme,
            particles: vec![
                ParticleParameters::new(0.5, 0.3, 0.0),
                ParticleParameters::new(-0.5, 0.3, 0.0),
            ],
            ..NonbondedForceDefinition::default()
        }
    }

    #[test]
    fn exclusion_records_carry_no_interaction() {
        assert!(!ExceptionRecord::exclusion([0, 1]).carries_interaction());
        assert!(ExceptionRecord::new([0, 1], 0.0, 0.3, 0.1).carries_interaction());
    }

    #[test]
    fn validate_rejects_offsets_on_undefined_parameters() {
        let mut force = two_particle_force();
        force.offsets.push(ParameterOffset {
            parameter: "lambda".to_string(),
            target: OffsetTarget::Particle,
            index: 1,
            charge: 0.5,
            sigma: 0.0,
            epsilon: 0.0,
        });

        let error = force.validate().expect_err("undefined parameter must fail");
        assert_eq!(error.placeholder(), "FORCE.OFFSET_PARAMETER");

        force.global_parameters.set("lambda", 0.0);
        force.validate().expect("defined parameter should validate");
    }

    #[test]
    fn method_is_parsed_from_kebab_case() {
        let method: NonbondedMethod =
            serde_json::from_str("\"lj-pme\"").expect("method should parse");
        assert_eq!(method, NonbondedMethod::LjPme);
        assert!(method.uses_mesh());
        assert!(!NonbondedMethod::CutoffPeriodic.uses_ewald_splitting());
    }
}
