//! Simulated fluid system.
//!
//! No hardware and no wire framing. Every call is recorded with the tokio
//! instant it arrived at, so tests can assert on ordering and timing under
//! a paused clock. Faults are injected per operation kind.

use super::FluidSystem;
use crate::error::{FlowError, FlowResult};
use crate::hardware::ObservedState;
use crate::network::{FluidPath, FluidicNetwork, RoutingState};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Operation kinds that accept injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    Connect,
    ConfigureRoute,
    SetFlow,
    StopAll,
    Query,
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq)]
pub enum SimCall {
    Connect,
    Disconnect,
    ConfigureRoute {
        from: String,
        to: String,
        valves: Vec<(String, u8)>,
    },
    SetFlow {
        pump: String,
        rate: f64,
    },
    StopAll,
    Query {
        channel: String,
    },
}

#[derive(Debug, Default)]
struct SimState {
    calls: Vec<(Instant, SimCall)>,
    faults: HashMap<SimOp, VecDeque<FlowError>>,
    unreachable: HashSet<String>,
    link_up: bool,
    rates: BTreeMap<String, f64>,
    routing: RoutingState,
}

impl SimState {
    fn take_fault(&mut self, op: SimOp) -> Option<FlowError> {
        self.faults.get_mut(&op)?.pop_front()
    }
}

pub struct SimulatedSystem {
    network: Arc<FluidicNetwork>,
    connected: AtomicBool,
    state: Mutex<SimState>,
}

impl SimulatedSystem {
    pub fn new(network: Arc<FluidicNetwork>) -> Self {
        Self {
            network,
            connected: AtomicBool::new(false),
            state: Mutex::new(SimState {
                link_up: true,
                ..SimState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `call`, then fail with the next injected fault for `op`, if any.
    fn enter(&self, op: SimOp, call: SimCall) -> FlowResult<MutexGuard<'_, SimState>> {
        let mut state = self.state();
        state.calls.push((Instant::now(), call));
        if let Some(err) = state.take_fault(op) {
            debug!(?op, error = %err, "injected fault");
            return Err(err);
        }
        if op != SimOp::Connect && !self.is_connected() {
            return Err(FlowError::NotConnected("simulated system".into()));
        }
        Ok(state)
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// Fail the next call of kind `op` with `error`.
    pub fn inject(&self, op: SimOp, error: FlowError) {
        self.state().faults.entry(op).or_default().push_back(error);
    }

    /// Fail the next `count` calls of kind `op` with a timeout.
    pub fn inject_timeouts(&self, op: SimOp, count: usize) {
        for _ in 0..count {
            self.inject(
                op,
                FlowError::Timeout {
                    channel: "simulated".into(),
                    timeout: Duration::from_millis(500),
                },
            );
        }
    }

    /// Make one channel stop answering queries.
    pub fn set_unreachable(&self, channel: &str, unreachable: bool) {
        let mut state = self.state();
        if unreachable {
            state.unreachable.insert(channel.to_string());
        } else {
            state.unreachable.remove(channel);
        }
    }

    /// Drop the link. Further calls fail until the link is restored and
    /// the system reconnected.
    pub fn set_link_up(&self, up: bool) {
        self.state().link_up = up;
        if !up {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn calls(&self) -> Vec<SimCall> {
        self.state().calls.iter().map(|(_, c)| c.clone()).collect()
    }

    /// Calls with the instant each one arrived.
    pub fn timeline(&self) -> Vec<(Instant, SimCall)> {
        self.state().calls.clone()
    }

    pub fn stop_all_count(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|(_, c)| matches!(c, SimCall::StopAll))
            .count()
    }

    /// Every `set_flow` call, failed attempts included.
    pub fn set_flow_calls(&self) -> Vec<(String, f64)> {
        self.state()
            .calls
            .iter()
            .filter_map(|(_, c)| match c {
                SimCall::SetFlow { pump, rate } => Some((pump.clone(), *rate)),
                _ => None,
            })
            .collect()
    }

    pub fn rate(&self, pump: &str) -> f64 {
        self.state().rates.get(pump).copied().unwrap_or(0.0)
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }
}

#[async_trait]
impl FluidSystem for SimulatedSystem {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn network(&self) -> &Arc<FluidicNetwork> {
        &self.network
    }

    async fn connect(&self) -> FlowResult<()> {
        let mut state = self.enter(SimOp::Connect, SimCall::Connect)?;
        if !state.link_up {
            return Err(FlowError::Connection("simulated link is down".into()));
        }
        if !self.connected.swap(true, Ordering::SeqCst) {
            state.routing = self.network.initial_routing();
            debug!("simulated system connected");
        }
        Ok(())
    }

    async fn disconnect(&self) -> FlowResult<()> {
        let mut state = self.state();
        state.calls.push((Instant::now(), SimCall::Disconnect));
        state.rates.clear();
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn configure_route(&self, path: &FluidPath) -> FlowResult<()> {
        let call = SimCall::ConfigureRoute {
            from: path.from().to_string(),
            to: path.to().to_string(),
            valves: path.valve_settings().to_vec(),
        };
        let mut state = self.enter(SimOp::ConfigureRoute, call)?;
        for (valve, position) in path.valve_settings() {
            let spec = self
                .network
                .valve(valve)
                .ok_or_else(|| FlowError::Routing(format!("no channel for valve '{valve}'")))?;
            if !spec.ports.contains_key(position) {
                return Err(FlowError::Rejected {
                    channel: valve.clone(),
                    message: format!("no position {position}"),
                });
            }
            state.routing.set(valve.clone(), *position);
        }
        Ok(())
    }

    async fn set_flow(&self, pump_id: &str, rate: f64) -> FlowResult<()> {
        let call = SimCall::SetFlow {
            pump: pump_id.to_string(),
            rate,
        };
        let mut state = self.enter(SimOp::SetFlow, call)?;
        let spec = self
            .network
            .pump(pump_id)
            .ok_or_else(|| FlowError::Routing(format!("unknown pump '{pump_id}'")))?;
        if !rate.is_finite() || rate < 0.0 || rate > spec.max_rate {
            return Err(FlowError::Rejected {
                channel: pump_id.to_string(),
                message: format!("rate {rate} outside 0..={}", spec.max_rate),
            });
        }
        state.rates.insert(pump_id.to_string(), rate);
        Ok(())
    }

    async fn stop_all(&self) -> FlowResult<()> {
        let mut state = self.state();
        state.calls.push((Instant::now(), SimCall::StopAll));
        state.rates.clear();
        match state.take_fault(SimOp::StopAll) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn routing(&self) -> RoutingState {
        self.state().routing.clone()
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
        let call = SimCall::Query {
            channel: channel_id.to_string(),
        };
        let state = self.enter(SimOp::Query, call)?;
        if state.unreachable.contains(channel_id) {
            return Err(FlowError::Timeout {
                channel: channel_id.to_string(),
                timeout: Duration::from_millis(500),
            });
        }
        if self.network.pump(channel_id).is_some() {
            let rate = state.rates.get(channel_id).copied().unwrap_or(0.0);
            return Ok(ObservedState {
                busy: rate > 0.0,
                rate: Some(rate),
                position: None,
            });
        }
        if self.network.valve(channel_id).is_some() {
            return Ok(ObservedState {
                busy: false,
                rate: None,
                position: state.routing.position(channel_id),
            });
        }
        Err(FlowError::Routing(format!("unknown channel '{channel_id}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::tests::selector_network;

    fn simulated() -> SimulatedSystem {
        let (tubing, sys) = selector_network();
        SimulatedSystem::new(Arc::new(FluidicNetwork::build(&tubing, &sys).unwrap()))
    }

    #[tokio::test]
    async fn test_calls_recorded_in_order() {
        let sim = simulated();
        sim.connect().await.unwrap();
        let path = sim
            .network()
            .resolve_path("R2", "chamber", &sim.routing().await)
            .unwrap();
        sim.configure_route(&path).await.unwrap();
        sim.set_flow("pump_a", 4.0).await.unwrap();
        sim.stop_all().await.unwrap();

        assert_eq!(
            sim.calls(),
            vec![
                SimCall::Connect,
                SimCall::ConfigureRoute {
                    from: "R2".into(),
                    to: "chamber".into(),
                    valves: vec![("selector".into(), 2)],
                },
                SimCall::SetFlow {
                    pump: "pump_a".into(),
                    rate: 4.0
                },
                SimCall::StopAll,
            ]
        );
        assert_eq!(sim.rate("pump_a"), 0.0);
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed_in_order() {
        let sim = simulated();
        sim.connect().await.unwrap();
        sim.inject_timeouts(SimOp::SetFlow, 2);

        assert!(sim.set_flow("pump_a", 1.0).await.unwrap_err().is_transient());
        assert!(sim.set_flow("pump_a", 1.0).await.unwrap_err().is_transient());
        sim.set_flow("pump_a", 1.0).await.unwrap();
        assert_eq!(sim.set_flow_calls().len(), 3);
    }

    #[tokio::test]
    async fn test_unreachable_channel_times_out() {
        let sim = simulated();
        sim.connect().await.unwrap();
        sim.set_unreachable("selector", true);
        assert!(matches!(
            sim.query("selector").await,
            Err(FlowError::Timeout { .. })
        ));
        assert_eq!(sim.query("pump_a").await.unwrap().rate, Some(0.0));
    }

    #[tokio::test]
    async fn test_link_loss() {
        let sim = simulated();
        sim.connect().await.unwrap();
        sim.set_link_up(false);
        assert!(matches!(
            sim.set_flow("pump_a", 1.0).await,
            Err(FlowError::NotConnected(_))
        ));
        assert!(matches!(sim.connect().await, Err(FlowError::Connection(_))));
    }
}
