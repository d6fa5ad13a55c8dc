//! Platform options and JSON system descriptions.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::constants::DEFAULT_PME_ORDER;
use crate::device::DeviceCapabilities;
use crate::domain::{GlobalParameters, NonbondedForceDefinition, PeriodicBox, Vec3};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformOptions {
    pub disable_pme_queue: bool,
    pub use_cpu_pme: bool,
    pub pme_order: usize,
}

impl Default for PlatformOptions {
    fn default() -> Self {
        Self {
            disable_pme_queue: false,
            use_cpu_pme: false,
            pme_order: DEFAULT_PME_ORDER,
        }
    }
}

/// Everything needed to build a logical context and evaluate it once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemDescription {
    pub periodic_box: PeriodicBox,
    pub positions: Vec<Vec3>,
    pub force: NonbondedForceDefinition,
    #[serde(default)]
    pub global_parameters: GlobalParameters,
    #[serde(default)]
    pub platform: PlatformOptions,
    #[serde(default = "default_devices")]
    pub devices: Vec<DeviceCapabilities>,
}

fn default_devices() -> Vec<DeviceCapabilities> {
    vec![DeviceCapabilities::default()]
}

#[derive(Debug, Error)]
pub enum SystemDescriptionError {
    #[error("failed to read system description '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse system description '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub fn load_system_description(
    path: impl AsRef<Path>,
) -> Result<SystemDescription, SystemDescriptionError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| SystemDescriptionError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    serde_json::from_str(&content).map_err(|source| SystemDescriptionError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
