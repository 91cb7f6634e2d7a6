//! Fluid systems: the network bound to live hardware.
//!
//! [`FluidSystem`] is the fixed capability set the orchestrator drives.
//! Variants:
//! - [`LegacySystem`]: daisy-chained syringe pumps and selector valves on
//!   the legacy ASCII framing
//! - [`CurrentSystem`]: current-generation devices on the checksummed line
//!   framing
//! - [`SimulatedSystem`]: no hardware, records calls, injects faults
//!
//! The variant is chosen once by [`build_system`] from
//! [`SystemConfig::system_type`](crate::config::SystemConfig).

mod bus;
mod current;
mod legacy;
mod simulated;

pub use bus::{BusSystem, ChannelSet, HardwareFamily};
pub use current::{Current, CurrentSystem};
pub use legacy::{Legacy, LegacySystem};
pub use simulated::{SimCall, SimOp, SimulatedSystem};

use crate::config::{SystemConfig, SystemType};
use crate::error::FlowResult;
use crate::hardware::{Connector, ObservedState, SerialConnector};
use crate::network::{FluidPath, FluidicNetwork, RoutingState};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Capability contract shared by every hardware family.
///
/// Methods take `&self`; implementations keep their mutable state behind
/// async locks so status queries can run alongside the control loop.
#[async_trait]
pub trait FluidSystem: Send + Sync {
    /// Variant name for logs.
    fn name(&self) -> &'static str;

    fn network(&self) -> &Arc<FluidicNetwork>;

    /// Open the link and run the variant's handshake. No-op when connected.
    async fn connect(&self) -> FlowResult<()>;

    async fn disconnect(&self) -> FlowResult<()>;

    fn is_connected(&self) -> bool;

    /// Move every valve on `path` to the position the path needs.
    async fn configure_route(&self, path: &FluidPath) -> FlowResult<()>;

    /// Set a pump's actual flow rate in µl/s. Zero stops the pump.
    async fn set_flow(&self, pump_id: &str, rate: f64) -> FlowResult<()>;

    /// Stop every channel, attempting all of them even if some fail.
    async fn stop_all(&self) -> FlowResult<()>;

    /// Current valve positions as last confirmed by hardware.
    async fn routing(&self) -> RoutingState;

    /// Ids of every pump and valve channel.
    fn channel_ids(&self) -> Vec<String>;

    /// Query one channel. Pump rates are reported as actual rates.
    async fn query(&self, channel_id: &str) -> FlowResult<ObservedState>;
}

/// Build the configured variant over serial ports.
pub fn build_system(
    config: &SystemConfig,
    network: Arc<FluidicNetwork>,
    command_timeout: Duration,
) -> Arc<dyn FluidSystem> {
    build_system_with(config, network, Arc::new(SerialConnector), command_timeout)
}

/// Build the configured variant over a caller-supplied connector.
pub fn build_system_with(
    config: &SystemConfig,
    network: Arc<FluidicNetwork>,
    connector: Arc<dyn Connector>,
    command_timeout: Duration,
) -> Arc<dyn FluidSystem> {
    match config.system_type {
        SystemType::Legacy => Arc::new(LegacySystem::new(
            Legacy,
            config,
            network,
            connector,
            command_timeout,
        )),
        SystemType::Current => Arc::new(CurrentSystem::new(
            Current,
            config,
            network,
            connector,
            command_timeout,
        )),
        SystemType::Simulated => Arc::new(SimulatedSystem::new(network)),
    }
}
