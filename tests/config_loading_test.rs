//! File-driven startup: loading, validation and environment overrides.

mod common;

use rust_fluidics::bootstrap::{self, ConfigPaths};
use rust_fluidics::config::{Settings, SystemType};
use rust_fluidics::{FlowStep, FluidSystem, OrchestratorState, Protocol};
use serial_test::serial;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

fn write_config(dir: &Path, settings: &str) {
    fs::write(dir.join("settings.toml"), settings).unwrap();
    fs::write(dir.join("system.toml"), common::SYSTEM.replace("\"legacy\"", "\"simulated\"")).unwrap();
    fs::write(dir.join("tubing.toml"), common::TUBING).unwrap();
}

#[test]
#[serial]
fn test_load_all_documents() {
    let dir = TempDir::new().unwrap();
    write_config(
        dir.path(),
        r#"
        [orchestrator]
        command_timeout = "750ms"
        "#,
    );

    let loaded = bootstrap::load(&ConfigPaths::in_dir(dir.path())).unwrap();
    assert_eq!(loaded.settings.orchestrator.command_timeout, Duration::from_millis(750));
    assert_eq!(loaded.system.system_type, SystemType::Simulated);
    assert_eq!(loaded.system.pumps[0].calibration, 1.0);
    assert_eq!(loaded.tubing.segments.len(), 5);
}

#[test]
#[serial]
fn test_serialized_defaults_load_back() {
    let dir = TempDir::new().unwrap();
    let defaults = toml::to_string(&Settings::default()).unwrap();
    write_config(dir.path(), &defaults);

    let loaded = bootstrap::load(&ConfigPaths::in_dir(dir.path())).unwrap();
    assert_eq!(loaded.settings, Settings::default());
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let dir = TempDir::new().unwrap();
    write_config(dir.path(), "[logging]\nlevel = \"info\"\n");

    std::env::set_var("FLUIDICS_LOGGING__LEVEL", "debug");
    let loaded = bootstrap::load(&ConfigPaths::in_dir(dir.path()));
    std::env::remove_var("FLUIDICS_LOGGING__LEVEL");

    assert_eq!(loaded.unwrap().settings.logging.level, "debug");
}

#[test]
#[serial]
fn test_bad_document_names_the_file() {
    let dir = TempDir::new().unwrap();
    write_config(dir.path(), "");
    fs::write(
        dir.path().join("tubing.toml"),
        common::TUBING.replace("volume = 30.0", "volume = -30.0"),
    )
    .unwrap();

    let err = bootstrap::load(&ConfigPaths::in_dir(dir.path())).unwrap_err();
    let report = format!("{err:#}");
    assert!(report.contains("tubing.toml"), "{report}");
    assert!(report.contains("p_chamber"), "{report}");
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_launch_simulated_system() {
    let dir = TempDir::new().unwrap();
    write_config(dir.path(), "");

    let orch = bootstrap::launch(&ConfigPaths::in_dir(dir.path())).await.unwrap();
    assert!(orch.system().is_connected());
    orch.start_protocol(Protocol::new("rinse").then(FlowStep::volume("wash buffer", "waste", 10.0, 30.0)))
        .await
        .unwrap();
    assert_eq!(orch.wait_settled().await.state, OrchestratorState::Completed);
    orch.shutdown().await.unwrap();
    assert!(!orch.system().is_connected());
}
