//! Startup from configuration files.
//!
//! Loads the three configuration documents, installs logging, builds the
//! network and the fluid system, and hands back an [`Orchestrator`] ready
//! for `start_orchestration`.

use crate::config::{Settings, SystemConfig, TubingConfig};
use crate::network::FluidicNetwork;
use crate::orchestrator::Orchestrator;
use crate::system::build_system;
use crate::tracing_setup;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Locations of the configuration documents.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub settings: PathBuf,
    pub system: PathBuf,
    pub tubing: PathBuf,
}

impl ConfigPaths {
    /// `settings.toml`, `system.toml` and `tubing.toml` inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            settings: dir.join("settings.toml"),
            system: dir.join("system.toml"),
            tubing: dir.join("tubing.toml"),
        }
    }
}

/// Validated configuration, not yet bound to hardware.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub settings: Settings,
    pub system: SystemConfig,
    pub tubing: TubingConfig,
}

pub fn load(paths: &ConfigPaths) -> anyhow::Result<LoadedConfig> {
    let settings = Settings::load_from(&paths.settings)
        .with_context(|| format!("loading settings from {}", paths.settings.display()))?;
    let system = SystemConfig::load_from(&paths.system)
        .with_context(|| format!("loading system from {}", paths.system.display()))?;
    let tubing = TubingConfig::load_from(&paths.tubing)
        .with_context(|| format!("loading tubing from {}", paths.tubing.display()))?;
    Ok(LoadedConfig {
        settings,
        system,
        tubing,
    })
}

/// Build the network and system. Touches no hardware.
pub fn build(config: &LoadedConfig) -> anyhow::Result<Orchestrator> {
    let network = FluidicNetwork::build(&config.tubing, &config.system)
        .context("building fluidic network")?;
    let orchestrator_config = config.settings.orchestrator.clone();
    let system = build_system(
        &config.system,
        Arc::new(network),
        orchestrator_config.command_timeout,
    );
    info!(
        system = system.name(),
        pumps = system.network().pumps().len(),
        valves = system.network().valves().len(),
        "fluid system built"
    );
    Ok(Orchestrator::new(system, orchestrator_config))
}

/// Load, install logging, build, and connect.
pub async fn launch(paths: &ConfigPaths) -> anyhow::Result<Orchestrator> {
    let config = load(paths)?;
    if let Err(err) = tracing_setup::init(&config.settings.logging) {
        debug!(error = %err, "keeping existing subscriber");
    }
    let orchestrator = build(&config)?;
    orchestrator
        .start_orchestration()
        .await
        .context("connecting to the fluid system")?;
    Ok(orchestrator)
}
