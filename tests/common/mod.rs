//! Shared fixtures for integration tests.
//!
//! Two reservoirs feed a 2-port selector valve; one pump pushes the
//! selected fluid into the chamber and on to waste.
//!
//! ```text
//! R1 --5-- V --20-- P --30-- chamber --15-- waste
//! R2 --8--/
//! ```

#![allow(dead_code)]

use figment::providers::{Format, Toml};
use figment::Figment;
use rust_fluidics::config::{SystemConfig, SystemType, TubingConfig};
use rust_fluidics::FluidicNetwork;
use std::sync::Arc;

pub const TUBING: &str = r#"
[[points]]
name = "R1"
kind = "reservoir"

[[points]]
name = "R2"
kind = "reservoir"

[[points]]
name = "V"
kind = "valve"

[[points]]
name = "P"
kind = "junction"

[[points]]
name = "chamber"
kind = "chamber"

[[points]]
name = "waste"
kind = "outlet"

[[segments]]
id = "r1_v"
from = "R1"
to = "V"
volume = 5.0

[[segments]]
id = "r2_v"
from = "R2"
to = "V"
volume = 8.0

[[segments]]
id = "v_p"
from = "V"
to = "P"
volume = 20.0

[[segments]]
id = "p_chamber"
from = "P"
to = "chamber"
volume = 30.0

[[segments]]
id = "chamber_waste"
from = "chamber"
to = "waste"
volume = 15.0
"#;

pub const SYSTEM: &str = r#"
system_type = "legacy"
port = "/dev/ttyMOCK0"
baud_rate = 9600

[[reservoirs]]
id = "R1"
fluid = "wash buffer"
point = "R1"

[[reservoirs]]
id = "R2"
fluid = "imaging buffer"
point = "R2"

[[pumps]]
id = "pump_a"
address = "1"
max_rate = 10.0
segments = ["v_p", "p_chamber"]

[[valves]]
id = "selector"
address = "2"
point = "V"
common = "v_p"
initial_position = 1
ports = [
    { position = 1, segment = "r1_v" },
    { position = 2, segment = "r2_v" },
]
"#;

pub fn tubing() -> TubingConfig {
    TubingConfig::from_figment(Figment::from(Toml::string(TUBING))).unwrap()
}

pub fn system(system_type: SystemType) -> SystemConfig {
    let mut config = SystemConfig::from_figment(Figment::from(Toml::string(SYSTEM))).unwrap();
    config.system_type = system_type;
    config
}

pub fn network(system: &SystemConfig) -> Arc<FluidicNetwork> {
    Arc::new(FluidicNetwork::build(&tubing(), system).unwrap())
}
