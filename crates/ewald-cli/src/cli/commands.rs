use super::CliError;
use anyhow::Context;
use ewald_core::{
    CpuPmeFactory, DerivedScalars, DeviceCapabilities, EvaluationFlags, EwaldError,
    HostPmeFactory, LogicalContext, NonbondedMethod, SystemDescription, Vec3,
    load_system_description,
};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(clap::Args)]
pub(super) struct ParamsArgs {
    /// System description JSON path
    #[arg(long)]
    system: PathBuf,
}

#[derive(clap::Args)]
#[command(group(clap::ArgGroup::new("part").args(["direct_only", "reciprocal_only"])))]
pub(super) struct EvaluateArgs {
    /// System description JSON path
    #[arg(long)]
    system: PathBuf,

    /// Split the context across this many devices, cloning the first device's capabilities
    #[arg(long)]
    devices: Option<usize>,

    /// Run the reciprocal mesh on the main queue
    #[arg(long)]
    no_overlap: bool,

    /// Evaluate PME on the host instead of the device mesh
    #[arg(long)]
    cpu_pme: bool,

    /// Pretend the devices lack 64-bit atomics and spread charges by sorting
    #[arg(long)]
    no_atomics: bool,

    /// Report energy (default when neither --energy nor --forces is given)
    #[arg(long)]
    energy: bool,

    /// Report forces (default when neither --energy nor --forces is given)
    #[arg(long)]
    forces: bool,

    /// Skip the reciprocal-space part
    #[arg(long)]
    direct_only: bool,

    /// Skip the direct-space corrections
    #[arg(long)]
    reciprocal_only: bool,

    /// Write the JSON report here instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ParamsReport {
    method: NonbondedMethod,
    devices: usize,
    derived: DerivedScalars,
    overlap: bool,
    cpu_pme: bool,
    dispersion_correction: f64,
}

#[derive(Debug, Serialize)]
struct EvaluationReport {
    method: NonbondedMethod,
    devices: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    energy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    forces: Option<Vec<Vec3>>,
}

pub(super) fn run_params_command(args: ParamsArgs) -> Result<i32, CliError> {
    let description = load_description(&args.system)?;
    let context = build_context(&description)?;
    let kernel = context.kernel(0).ok_or_else(|| {
        CliError::Compute(EwaldError::internal("CLI.NO_KERNEL", "context has no device 0"))
    })?;

    let report = ParamsReport {
        method: kernel.method(),
        devices: context.device_count(),
        derived: kernel.derived_scalars(),
        overlap: kernel.uses_overlap(),
        cpu_pme: kernel.uses_cpu_pme(),
        dispersion_correction: kernel.dispersion_correction_coefficient(),
    };
    write_report(&report, None)?;
    Ok(0)
}

pub(super) fn run_evaluate_command(args: EvaluateArgs) -> Result<i32, CliError> {
    let mut description = load_description(&args.system)?;
    apply_overrides(&mut description, &args)?;
    let flags = evaluation_flags(&args);

    let mut context = build_context(&description)?;
    let evaluation = context.evaluate(flags).map_err(CliError::Compute)?;
    info!(
        energy = evaluation.energy,
        devices = context.device_count(),
        "evaluation finished"
    );

    let report = EvaluationReport {
        method: description.force.method,
        devices: context.device_count(),
        energy: flags.include_energy.then_some(evaluation.energy),
        forces: flags.include_forces.then_some(evaluation.forces),
    };
    write_report(&report, args.output.as_deref())?;
    Ok(0)
}

fn load_description(path: &Path) -> Result<SystemDescription, CliError> {
    load_system_description(path).map_err(|error| {
        CliError::Compute(EwaldError::configuration(
            "INPUT.SYSTEM_DESCRIPTION",
            error.to_string(),
        ))
    })
}

fn build_context(description: &SystemDescription) -> Result<LogicalContext, CliError> {
    let factory = HostPmeFactory;
    let cpu_pme = description
        .platform
        .use_cpu_pme
        .then_some(&factory as &dyn CpuPmeFactory);
    LogicalContext::from_description(description, cpu_pme).map_err(CliError::Compute)
}

fn apply_overrides(
    description: &mut SystemDescription,
    args: &EvaluateArgs,
) -> Result<(), CliError> {
    if let Some(count) = args.devices {
        if count == 0 {
            return Err(CliError::Usage("--devices must be at least 1".to_string()));
        }
        let template = description.devices.first().copied().unwrap_or_default();
        description.devices = vec![template; count];
    }
    if args.no_atomics {
        for device in &mut description.devices {
            *device = DeviceCapabilities {
                supports_64bit_atomics: false,
                ..*device
            };
        }
    }
    if args.no_overlap {
        description.platform.disable_pme_queue = true;
    }
    if args.cpu_pme {
        description.platform.use_cpu_pme = true;
    }
    Ok(())
}

fn evaluation_flags(args: &EvaluateArgs) -> EvaluationFlags {
    let (include_energy, include_forces) = if args.energy || args.forces {
        (args.energy, args.forces)
    } else {
        (true, true)
    };
    EvaluationFlags {
        include_energy,
        include_forces,
        include_direct: !args.reciprocal_only,
        include_reciprocal: !args.direct_only,
    }
}

fn write_report<T: Serialize>(report: &T, output: Option<&Path>) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(report).context("failed to serialize report")?;
    match output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create report directory '{}'", parent.display())
                })?;
            }
            fs::write(path, format!("{rendered}\n"))
                .with_context(|| format!("failed to write report '{}'", path.display()))?;
        }
        None => println!("{rendered}"),
    }
    Ok(())
}
