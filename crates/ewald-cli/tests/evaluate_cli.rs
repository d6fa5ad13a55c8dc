use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const SYSTEM: &str = r#"
{
  "periodic_box": [[2.5, 0.0, 0.0], [0.0, 2.5, 0.0], [0.0, 0.0, 2.5]],
  "positions": [[0.4, 0.5, 0.6], [1.3, 0.9, 0.7], [1.8, 2.0, 1.6], [0.7, 1.9, 2.1]],
  "force": {
    "method": "pme",
    "cutoff": 1.0,
    "use_dispersion_correction": false,
    "pme_parameters": { "alpha": 3.2, "grid": [32, 32, 32] },
    "particles": [
      { "charge": 0.8, "sigma": 0.3, "epsilon": 0.0 },
      { "charge": -0.8, "sigma": 0.3, "epsilon": 0.0 },
      { "charge": 0.5, "sigma": 0.3, "epsilon": 0.0 },
      { "charge": -0.5, "sigma": 0.3, "epsilon": 0.0 }
    ],
    "exceptions": [
      { "particles": [0, 1], "charge_product": 0.0, "sigma": 1.0, "epsilon": 0.0 }
    ]
  }
}
"#;

fn write_system(temp: &TempDir) -> PathBuf {
    let path = temp.path().join("system.json");
    fs::write(&path, SYSTEM).expect("system description should be written");
    path
}

fn run_cli(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ewald-rs"))
        .args(args)
        .output()
        .expect("binary should run")
}

fn stdout_json(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout should be JSON")
}

fn evaluate(system: &Path, extra: &[&str]) -> Value {
    let system = system.to_str().expect("utf-8 path");
    let mut args = vec!["evaluate", "--system", system];
    args.extend_from_slice(extra);
    stdout_json(&run_cli(&args))
}

fn energy(report: &Value) -> f64 {
    report["energy"].as_f64().expect("energy should be a number")
}

#[test]
fn evaluate_reports_energy_and_forces() {
    let temp = TempDir::new().expect("tempdir should be created");
    let report = evaluate(&write_system(&temp), &[]);

    assert_eq!(report["method"], "pme");
    assert_eq!(report["devices"], 1);
    assert!(energy(&report).is_finite());
    let forces = report["forces"].as_array().expect("forces array");
    assert_eq!(forces.len(), 4);
    assert!(forces.iter().all(|force| force.as_array().map(Vec::len) == Some(3)));
}

#[test]
fn energy_flag_omits_forces() {
    let temp = TempDir::new().expect("tempdir should be created");
    let report = evaluate(&write_system(&temp), &["--energy"]);

    assert!(report.get("forces").is_none());
    assert!(energy(&report).is_finite());
}

#[test]
fn execution_overrides_preserve_the_energy() {
    let temp = TempDir::new().expect("tempdir should be created");
    let system = write_system(&temp);
    let reference = energy(&evaluate(&system, &["--energy"]));

    for extra in [
        &["--energy", "--no-overlap"][..],
        &["--energy", "--devices", "2"][..],
        &["--energy", "--no-atomics"][..],
        &["--energy", "--cpu-pme"][..],
    ] {
        let value = energy(&evaluate(&system, extra));
        assert!(
            (value - reference).abs() <= 1.0e-6 * reference.abs().max(1.0),
            "{extra:?}: {value} vs {reference}"
        );
    }
}

#[test]
fn direct_and_reciprocal_parts_add_up() {
    let temp = TempDir::new().expect("tempdir should be created");
    let system = write_system(&temp);
    let total = energy(&evaluate(&system, &["--energy"]));
    let direct = energy(&evaluate(&system, &["--energy", "--direct-only"]));
    let reciprocal = energy(&evaluate(&system, &["--energy", "--reciprocal-only"]));

    assert!((direct + reciprocal - total).abs() <= 1.0e-8 * total.abs().max(1.0));
}

#[test]
fn output_flag_writes_report_file() {
    let temp = TempDir::new().expect("tempdir should be created");
    let system = write_system(&temp);
    let report_path = temp.path().join("reports/evaluation.json");
    let output = run_cli(&[
        "evaluate",
        "--system",
        system.to_str().expect("utf-8 path"),
        "--output",
        report_path.to_str().expect("utf-8 path"),
    ]);

    assert!(output.status.success());
    assert!(output.stdout.is_empty());
    let report: Value = serde_json::from_str(
        &fs::read_to_string(&report_path).expect("report should be written"),
    )
    .expect("report should be JSON");
    assert!(energy(&report).is_finite());
}

#[test]
fn params_reports_explicit_grid_and_alpha() {
    let temp = TempDir::new().expect("tempdir should be created");
    let system = write_system(&temp);
    let report = stdout_json(&run_cli(&[
        "params",
        "--system",
        system.to_str().expect("utf-8 path"),
    ]));

    assert_eq!(report["derived"]["grid"], serde_json::json!([32, 32, 32]));
    assert!((report["derived"]["alpha"].as_f64().expect("alpha") - 3.2).abs() <= 1.0e-12);
    assert_eq!(report["overlap"], true);
    assert_eq!(report["cpu_pme"], false);
}

#[test]
fn missing_system_file_exits_with_configuration_code() {
    let temp = TempDir::new().expect("tempdir should be created");
    let missing = temp.path().join("absent.json");
    let output = run_cli(&[
        "evaluate",
        "--system",
        missing.to_str().expect("utf-8 path"),
    ]);

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ERROR: [INPUT.SYSTEM_DESCRIPTION]"), "{stderr}");
    assert!(stderr.contains("FATAL EXIT CODE: 2"), "{stderr}");
}

#[test]
fn unknown_arguments_are_usage_errors() {
    let output = run_cli(&["evaluate", "--frobnicate"]);

    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("ERROR: [INPUT.CLI_USAGE]"));
}

#[test]
fn conflicting_parts_are_rejected() {
    let temp = TempDir::new().expect("tempdir should be created");
    let system = write_system(&temp);
    let output = run_cli(&[
        "evaluate",
        "--system",
        system.to_str().expect("utf-8 path"),
        "--direct-only",
        "--reciprocal-only",
    ]);

    assert_eq!(output.status.code(), Some(2));
}
