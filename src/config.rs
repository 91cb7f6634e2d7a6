//! Configuration System using Figment
//!
//! Three structured inputs are loaded independently:
//!
//! 1. [`Settings`]: logging and orchestrator behaviour (`fluidics.toml`,
//!    env prefix `FLUIDICS_`).
//! 2. [`SystemConfig`]: hardware family, serial port, reservoirs, pumps and
//!    valves (env prefix `FLUIDICS_SYSTEM_`).
//! 3. [`TubingConfig`]: network points and tubing segments with their dead
//!    volumes.
//!
//! Every loader validates after extraction and returns
//! [`FlowError::Configuration`] for anything malformed, so a network is
//! never partially constructed from bad input.
//!
//! Volumes are in µl, rates in µl/s.
//!
//! # Environment Variable Overrides
//!
//! ```text
//! FLUIDICS_LOGGING__LEVEL=debug
//! FLUIDICS_ORCHESTRATOR__COMMAND_TIMEOUT=500ms
//! FLUIDICS_SYSTEM_PORT=/dev/ttyUSB1
//! ```

use crate::error::{FlowError, FlowResult};
use crate::error_recovery::RetryPolicy;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

// ============================================================================
// Settings
// ============================================================================

/// Top-level engine settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Control loop behaviour
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound for a single hardware round trip
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Retry policy for transient communication failures
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Capacity of the event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            command_timeout: default_command_timeout(),
            retry: RetryPolicy::default(),
            event_capacity: default_event_capacity(),
        }
    }
}

// ============================================================================
// System topology
// ============================================================================

/// Hardware family driving the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemType {
    /// Daisy-chained syringe pumps and multi-position valves, ASCII framing
    Legacy,
    /// Current generation, checksummed line framing
    Current,
    /// In-process simulation, no port required
    Simulated,
}

/// System topology: reservoirs, pumps, valves and how to reach them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Which hardware family implements the fluid system
    pub system_type: SystemType,
    /// Serial port (e.g., "/dev/ttyUSB0", "COM3")
    #[serde(default)]
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Fluid sources
    #[serde(default)]
    pub reservoirs: Vec<ReservoirConfig>,
    /// Pumps, each bound to the tubing segments it drives
    #[serde(default)]
    pub pumps: Vec<PumpConfig>,
    /// Multi-position valves
    #[serde(default)]
    pub valves: Vec<ValveConfig>,
}

/// A named fluid source attached to a network point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservoirConfig {
    pub id: String,
    /// Fluid label, e.g. "wash buffer"
    pub fluid: String,
    /// Network point of kind `reservoir`
    pub point: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpConfig {
    pub id: String,
    /// Bus address as set on the device ('1'..'F')
    pub address: String,
    /// Maximum actual flow rate in µl/s
    pub max_rate: f64,
    /// Actual rate = commanded rate * calibration
    #[serde(default = "default_calibration")]
    pub calibration: f64,
    /// Tubing segments this pump drives
    pub segments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValveConfig {
    pub id: String,
    pub address: String,
    /// Network point of kind `valve`
    pub point: String,
    /// Segment connected to every position
    pub common: String,
    /// Selectable ports
    pub ports: Vec<ValvePortConfig>,
    /// Position the valve is assumed to hold after connecting
    #[serde(default)]
    pub initial_position: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValvePortConfig {
    pub position: u8,
    pub segment: String,
}

// ============================================================================
// Tubing topology
// ============================================================================

/// Role of a network point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointKind {
    Reservoir,
    /// Passive conflux, all incident segments connected
    Junction,
    Valve,
    /// Delivery target such as a sample chamber
    Chamber,
    Outlet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointConfig {
    pub name: String,
    pub kind: PointKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentConfig {
    pub id: String,
    pub from: String,
    pub to: String,
    /// Internal (dead) volume in µl
    pub volume: f64,
    /// Multiplier on volume/rate when computing transit time
    #[serde(default = "default_flow_factor")]
    pub flow_factor: f64,
    #[serde(default = "default_bidirectional")]
    pub bidirectional: bool,
}

/// Tubing topology: points and the segments joining them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TubingConfig {
    pub points: Vec<PointConfig>,
    pub segments: Vec<SegmentConfig>,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_event_capacity() -> usize {
    256
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_calibration() -> f64 {
    1.0
}

fn default_flow_factor() -> f64 {
    1.0
}

fn default_bidirectional() -> bool {
    true
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

fn extract<T: DeserializeOwned>(figment: Figment) -> FlowResult<T> {
    figment.extract().map_err(FlowError::from)
}

fn ensure_unique<'a>(what: &str, ids: impl IntoIterator<Item = &'a str>) -> FlowResult<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(FlowError::Configuration(format!("duplicate {what} '{id}'")));
        }
    }
    Ok(())
}

fn ensure_positive(what: &str, value: f64) -> FlowResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(FlowError::Configuration(format!(
            "{what} must be positive, got {value}"
        )))
    }
}

impl Settings {
    /// Load settings from a TOML file with `FLUIDICS_` environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> FlowResult<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed("FLUIDICS_").split("__")),
        )
    }

    /// Extract and validate settings from an arbitrary figment.
    pub fn from_figment(figment: Figment) -> FlowResult<Self> {
        let settings: Self = extract(figment)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks log level, timeout and retry policy.
    pub fn validate(&self) -> FlowResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(FlowError::Configuration(format!(
                "invalid log level '{}', expected one of {:?}",
                self.logging.level, valid_levels
            )));
        }
        if self.orchestrator.command_timeout.is_zero() {
            return Err(FlowError::Configuration(
                "orchestrator.command_timeout must be non-zero".into(),
            ));
        }
        if self.orchestrator.event_capacity == 0 {
            return Err(FlowError::Configuration(
                "orchestrator.event_capacity must be non-zero".into(),
            ));
        }
        self.orchestrator.retry.validate()
    }
}

impl SystemConfig {
    /// Load the system topology from a TOML file with `FLUIDICS_SYSTEM_`
    /// environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> FlowResult<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed("FLUIDICS_SYSTEM_")),
        )
    }

    pub fn from_figment(figment: Figment) -> FlowResult<Self> {
        let config: Self = extract(figment)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks ids, addresses and physical parameters. Cross references into
    /// the tubing are checked when the network is built.
    pub fn validate(&self) -> FlowResult<()> {
        if self.system_type != SystemType::Simulated {
            if self.port.trim().is_empty() {
                return Err(FlowError::Configuration(
                    "a serial port is required for hardware systems".into(),
                ));
            }
            if self.baud_rate == 0 {
                return Err(FlowError::Configuration("baud_rate must be non-zero".into()));
            }
        }
        ensure_unique("reservoir", self.reservoirs.iter().map(|r| r.id.as_str()))?;
        ensure_unique(
            "channel",
            self.pumps
                .iter()
                .map(|p| p.id.as_str())
                .chain(self.valves.iter().map(|v| v.id.as_str())),
        )?;
        ensure_unique(
            "bus address",
            self.pumps
                .iter()
                .map(|p| p.address.as_str())
                .chain(self.valves.iter().map(|v| v.address.as_str())),
        )?;

        for pump in &self.pumps {
            ensure_positive(&format!("pump '{}' max_rate", pump.id), pump.max_rate)?;
            ensure_positive(&format!("pump '{}' calibration", pump.id), pump.calibration)?;
            if pump.segments.is_empty() {
                return Err(FlowError::Configuration(format!(
                    "pump '{}' is not bound to any segment",
                    pump.id
                )));
            }
        }
        for valve in &self.valves {
            if valve.ports.is_empty() {
                return Err(FlowError::Configuration(format!(
                    "valve '{}' has no ports",
                    valve.id
                )));
            }
            let mut positions = HashSet::new();
            for port in &valve.ports {
                if !positions.insert(port.position) {
                    return Err(FlowError::Configuration(format!(
                        "valve '{}' declares position {} twice",
                        valve.id, port.position
                    )));
                }
                if port.segment == valve.common {
                    return Err(FlowError::Configuration(format!(
                        "valve '{}' uses its common segment as position {}",
                        valve.id, port.position
                    )));
                }
            }
            if let Some(initial) = valve.initial_position {
                if !positions.contains(&initial) {
                    return Err(FlowError::Configuration(format!(
                        "valve '{}' initial position {} is not a declared port",
                        valve.id, initial
                    )));
                }
            }
        }
        Ok(())
    }
}

impl TubingConfig {
    /// Load the tubing topology from a TOML file.
    pub fn load_from<P: AsRef<Path>>(path: P) -> FlowResult<Self> {
        Self::from_figment(Figment::new().merge(Toml::file(path.as_ref())))
    }

    pub fn from_figment(figment: Figment) -> FlowResult<Self> {
        let config: Self = extract(figment)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks names, endpoints and volumes.
    pub fn validate(&self) -> FlowResult<()> {
        if self.points.is_empty() {
            return Err(FlowError::Configuration("tubing declares no points".into()));
        }
        ensure_unique("point", self.points.iter().map(|p| p.name.as_str()))?;
        ensure_unique("segment", self.segments.iter().map(|s| s.id.as_str()))?;

        let names: HashSet<&str> = self.points.iter().map(|p| p.name.as_str()).collect();
        for seg in &self.segments {
            for end in [&seg.from, &seg.to] {
                if !names.contains(end.as_str()) {
                    return Err(FlowError::Configuration(format!(
                        "segment '{}' references unknown point '{}'",
                        seg.id, end
                    )));
                }
            }
            if seg.from == seg.to {
                return Err(FlowError::Configuration(format!(
                    "segment '{}' is a loop on '{}'",
                    seg.id, seg.from
                )));
            }
            if !seg.volume.is_finite() || seg.volume < 0.0 {
                return Err(FlowError::Configuration(format!(
                    "segment '{}' volume must be >= 0, got {}",
                    seg.id, seg.volume
                )));
            }
            ensure_positive(&format!("segment '{}' flow_factor", seg.id), seg.flow_factor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::providers::Serialized;

    const TUBING: &str = r#"
        [[points]]
        name = "R1"
        kind = "reservoir"

        [[points]]
        name = "chamber"
        kind = "chamber"

        [[segments]]
        id = "r1_chamber"
        from = "R1"
        to = "chamber"
        volume = 10.0
    "#;

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::from_figment(Figment::new()).unwrap();
        assert_eq!(settings.logging.level, "info");
        assert_eq!(settings.orchestrator.command_timeout, Duration::from_secs(2));
        assert_eq!(settings.orchestrator.retry.max_attempts, 3);
    }

    #[test]
    fn test_settings_humantime_and_retry() {
        let toml = r#"
            [logging]
            level = "debug"

            [orchestrator]
            command_timeout = "250ms"

            [orchestrator.retry]
            max_attempts = 5
            initial_backoff = "20ms"
        "#;
        let settings = Settings::from_figment(Figment::from(Toml::string(toml))).unwrap();
        assert_eq!(settings.orchestrator.command_timeout, Duration::from_millis(250));
        assert_eq!(settings.orchestrator.retry.max_attempts, 5);
        assert_eq!(
            settings.orchestrator.retry.initial_backoff,
            Duration::from_millis(20)
        );
        assert_eq!(settings.orchestrator.retry.multiplier, 2.0);
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut settings = Settings::default();
        settings.logging.level = "verbose".into();
        assert!(matches!(
            settings.validate(),
            Err(FlowError::Configuration(_))
        ));
    }

    #[test]
    fn test_tubing_parses_with_defaults() {
        let tubing = TubingConfig::from_figment(Figment::from(Toml::string(TUBING))).unwrap();
        assert_eq!(tubing.segments[0].flow_factor, 1.0);
        assert!(tubing.segments[0].bidirectional);
    }

    #[test]
    fn test_tubing_unknown_point_rejected() {
        let mut tubing = TubingConfig::from_figment(Figment::from(Toml::string(TUBING))).unwrap();
        tubing.segments[0].to = "nowhere".into();
        let err = tubing.validate().unwrap_err();
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn test_tubing_negative_volume_rejected() {
        let mut tubing = TubingConfig::from_figment(Figment::from(Toml::string(TUBING))).unwrap();
        tubing.segments[0].volume = -1.0;
        assert!(tubing.validate().is_err());
    }

    #[test]
    fn test_malformed_tubing_is_configuration_error() {
        let broken = "[[segments]]\nid = 3\n";
        let err = TubingConfig::from_figment(Figment::from(Toml::string(broken))).unwrap_err();
        assert!(matches!(err, FlowError::Configuration(_)));
    }

    #[test]
    fn test_system_requires_port_for_hardware() {
        let config = SystemConfig {
            system_type: SystemType::Legacy,
            port: String::new(),
            baud_rate: 9600,
            reservoirs: vec![],
            pumps: vec![],
            valves: vec![],
        };
        assert!(config.validate().is_err());

        let simulated = SystemConfig {
            system_type: SystemType::Simulated,
            ..config
        };
        assert!(simulated.validate().is_ok());
    }

    #[test]
    fn test_system_duplicate_address_rejected() {
        let pump = |id: &str| PumpConfig {
            id: id.into(),
            address: "1".into(),
            max_rate: 5.0,
            calibration: 1.0,
            segments: vec!["s".into()],
        };
        let config = SystemConfig {
            system_type: SystemType::Simulated,
            port: String::new(),
            baud_rate: 9600,
            reservoirs: vec![],
            pumps: vec![pump("a"), pump("b")],
            valves: vec![],
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("bus address"));
    }

    #[test]
    fn test_system_round_trips_through_figment() {
        let config = SystemConfig {
            system_type: SystemType::Current,
            port: "/dev/ttyUSB0".into(),
            baud_rate: 38400,
            reservoirs: vec![ReservoirConfig {
                id: "buffer".into(),
                fluid: "wash buffer".into(),
                point: "R1".into(),
            }],
            pumps: vec![],
            valves: vec![ValveConfig {
                id: "v1".into(),
                address: "2".into(),
                point: "V1".into(),
                common: "v1_out".into(),
                ports: vec![ValvePortConfig {
                    position: 1,
                    segment: "r1_v1".into(),
                }],
                initial_position: Some(1),
            }],
        };
        let loaded =
            SystemConfig::from_figment(Figment::from(Serialized::defaults(&config))).unwrap();
        assert_eq!(loaded, config);
    }
}
