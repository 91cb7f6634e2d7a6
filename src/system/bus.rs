//! Fluid system over a shared device bus.
//!
//! The bus system owns the link, the channel set, and the routing state
//! mirrored from hardware. Everything that differs between hardware
//! generations (framing, connect handshake) lives in a [`HardwareFamily`].

use super::FluidSystem;
use crate::config::SystemConfig;
use crate::error::{FlowError, FlowResult, StopFailure};
use crate::hardware::transport::{shared, SharedTransport};
use crate::hardware::{
    BusChannel, ChannelKind, Connector, HardwareChannel, ObservedState, TargetState, WireCodec,
};
use crate::network::{FluidPath, FluidicNetwork, RoutingState};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Per-generation behaviour of a bus system.
#[async_trait]
pub trait HardwareFamily: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn codec(&self) -> Arc<dyn WireCodec>;

    /// Bring freshly created channels to a known state.
    async fn handshake(&self, channels: &ChannelSet) -> FlowResult<()>;
}

/// Live channels of a connected system, pumps first.
pub struct ChannelSet {
    bus: SharedTransport,
    pumps: Vec<Arc<dyn HardwareChannel>>,
    valves: Vec<Arc<dyn HardwareChannel>>,
}

impl ChannelSet {
    pub fn pumps(&self) -> &[Arc<dyn HardwareChannel>] {
        &self.pumps
    }

    pub fn valves(&self) -> &[Arc<dyn HardwareChannel>] {
        &self.valves
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn HardwareChannel>> {
        self.pumps.iter().chain(self.valves.iter())
    }

    fn get(&self, id: &str) -> Option<&Arc<dyn HardwareChannel>> {
        self.iter().find(|c| c.id() == id)
    }
}

pub struct BusSystem<F> {
    family: F,
    port: String,
    baud_rate: u32,
    network: Arc<FluidicNetwork>,
    connector: Arc<dyn Connector>,
    command_timeout: Duration,
    connected: AtomicBool,
    channels: RwLock<Option<ChannelSet>>,
    routing: Mutex<RoutingState>,
}

impl<F: HardwareFamily> BusSystem<F> {
    pub fn new(
        family: F,
        config: &SystemConfig,
        network: Arc<FluidicNetwork>,
        connector: Arc<dyn Connector>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            family,
            port: config.port.clone(),
            baud_rate: config.baud_rate,
            network,
            connector,
            command_timeout,
            connected: AtomicBool::new(false),
            channels: RwLock::new(None),
            routing: Mutex::new(RoutingState::new()),
        }
    }

    fn build_channels(&self, bus: SharedTransport) -> ChannelSet {
        let codec = self.family.codec();
        let make = |id: &str, kind, address: &str| -> Arc<dyn HardwareChannel> {
            Arc::new(BusChannel::new(
                id,
                kind,
                address,
                Arc::clone(&codec),
                Arc::clone(&bus),
                self.command_timeout,
            ))
        };
        let pumps = self
            .network
            .pumps()
            .iter()
            .map(|p| make(&p.id, ChannelKind::Pump, &p.address))
            .collect();
        let valves = self
            .network
            .valves()
            .iter()
            .map(|v| make(&v.id, ChannelKind::Valve, &v.address))
            .collect();
        ChannelSet { bus, pumps, valves }
    }

    /// Put valves at their declared initial positions and mirror the rest.
    async fn sync_routing(&self, channels: &ChannelSet) -> FlowResult<RoutingState> {
        let mut routing = RoutingState::new();
        for (spec, channel) in self.network.valves().iter().zip(channels.valves()) {
            match spec.initial_position {
                Some(pos) => {
                    channel.actuate(TargetState::Position(pos)).await?;
                    routing.set(spec.id.clone(), pos);
                }
                None => {
                    if let Some(pos) = channel.query().await?.position {
                        routing.set(spec.id.clone(), pos);
                    }
                }
            }
        }
        Ok(routing)
    }

    async fn open(&self) -> FlowResult<(ChannelSet, RoutingState)> {
        let transport = self.connector.connect(&self.port, self.baud_rate).await?;
        let channels = self.build_channels(shared(transport));
        let synced = match self.family.handshake(&channels).await {
            Ok(()) => self.sync_routing(&channels).await,
            Err(err) => Err(err),
        };
        match synced {
            Ok(routing) => Ok((channels, routing)),
            Err(err) => {
                if let Err(close_err) = channels.bus.lock().await.close().await {
                    warn!(error = %close_err, "closing link after failed handshake");
                }
                Err(err)
            }
        }
    }

    fn not_connected(&self) -> FlowError {
        FlowError::NotConnected(format!("{} system on '{}'", self.family.name(), self.port))
    }
}

#[async_trait]
impl<F: HardwareFamily> FluidSystem for BusSystem<F> {
    fn name(&self) -> &'static str {
        self.family.name()
    }

    fn network(&self) -> &Arc<FluidicNetwork> {
        &self.network
    }

    async fn connect(&self) -> FlowResult<()> {
        let mut slot = self.channels.write().await;
        if slot.is_some() {
            return Ok(());
        }
        info!(system = self.family.name(), port = %self.port, baud = self.baud_rate, "connecting");
        let (channels, routing) = self.open().await?;
        *self.routing.lock().await = routing;
        *slot = Some(channels);
        self.connected.store(true, Ordering::SeqCst);
        info!(system = self.family.name(), "connected");
        Ok(())
    }

    async fn disconnect(&self) -> FlowResult<()> {
        let mut slot = self.channels.write().await;
        self.connected.store(false, Ordering::SeqCst);
        let Some(channels) = slot.take() else {
            return Ok(());
        };
        *self.routing.lock().await = RoutingState::new();
        let mut bus = channels.bus.lock().await;
        bus.close()
            .await
            .map_err(|e| FlowError::Connection(format!("closing '{}': {e}", self.port)))?;
        info!(system = self.family.name(), "disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn configure_route(&self, path: &FluidPath) -> FlowResult<()> {
        let slot = self.channels.read().await;
        let channels = slot.as_ref().ok_or_else(|| self.not_connected())?;
        for (valve, position) in path.valve_settings() {
            if self.routing.lock().await.position(valve) == Some(*position) {
                continue;
            }
            let channel = channels
                .get(valve)
                .ok_or_else(|| FlowError::Routing(format!("no channel for valve '{valve}'")))?;
            // Unknown until the device confirms.
            self.routing.lock().await.clear(valve);
            channel.actuate(TargetState::Position(*position)).await?;
            self.routing.lock().await.set(valve.clone(), *position);
            debug!(valve = %valve, position, "valve switched");
        }
        Ok(())
    }

    async fn set_flow(&self, pump_id: &str, rate: f64) -> FlowResult<()> {
        let spec = self
            .network
            .pump(pump_id)
            .ok_or_else(|| FlowError::Routing(format!("unknown pump '{pump_id}'")))?;
        let slot = self.channels.read().await;
        let channel = slot
            .as_ref()
            .and_then(|c| c.get(pump_id))
            .ok_or_else(|| self.not_connected())?;
        let commanded = rate / spec.calibration;
        channel.actuate(TargetState::Rate(commanded)).await?;
        debug!(pump = %pump_id, rate, commanded, "flow set");
        Ok(())
    }

    async fn stop_all(&self) -> FlowResult<()> {
        let slot = self.channels.read().await;
        let Some(channels) = slot.as_ref() else {
            debug!("stop_all with no live channels");
            return Ok(());
        };
        let mut failures = Vec::new();
        for channel in channels.iter() {
            if let Err(err) = channel.stop().await {
                error!(channel = %channel.id(), error = %err, "channel did not stop");
                failures.push(StopFailure {
                    channel: channel.id().to_string(),
                    error: err,
                });
            }
        }
        if failures.is_empty() {
            info!(system = self.family.name(), "all channels stopped");
            Ok(())
        } else {
            Err(FlowError::StopFailed(failures))
        }
    }

    async fn routing(&self) -> RoutingState {
        self.routing.lock().await.clone()
    }

    fn channel_ids(&self) -> Vec<String> {
        self.network
            .pumps()
            .iter()
            .map(|p| p.id.clone())
            .chain(self.network.valves().iter().map(|v| v.id.clone()))
            .collect()
    }

    async fn query(&self, channel_id: &str) -> FlowResult<ObservedState> {
        let slot = self.channels.read().await;
        let channels = slot.as_ref().ok_or_else(|| self.not_connected())?;
        let channel = channels
            .get(channel_id)
            .ok_or_else(|| FlowError::Routing(format!("unknown channel '{channel_id}'")))?;
        let mut observed = channel.query().await?;
        if let (Some(rate), Some(spec)) = (observed.rate, self.network.pump(channel_id)) {
            observed.rate = Some(rate * spec.calibration);
        }
        Ok(observed)
    }
}
