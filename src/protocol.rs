//! In-memory protocol model.
//!
//! A protocol is an ordered list of steps. Flow steps move one fluid to one
//! network point; incubation steps hold with every pump idle. A flow step
//! marked `concurrent_with_next` shares a concurrency group with the step
//! after it.

use crate::compiler::{CommandKind, StepCompiler, WaitPurpose};
use crate::error::{FlowError, FlowResult};
use crate::network::FluidicNetwork;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// How much of a fluid a flow step delivers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Amount {
    Duration(#[serde(with = "humantime_serde")] Duration),
    /// Volume in µl
    Volume(f64),
}

/// Deliver `fluid` to `target` at `rate` µl/s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStep {
    /// Reservoir id or fluid label
    pub fluid: String,
    /// Network point receiving the fluid
    pub target: String,
    /// Actual flow rate in µl/s
    pub rate: f64,
    #[serde(flatten)]
    pub amount: Amount,
    #[serde(default)]
    pub concurrent_with_next: bool,
}

impl FlowStep {
    pub fn new(fluid: impl Into<String>, target: impl Into<String>, rate: f64, amount: Amount) -> Self {
        Self {
            fluid: fluid.into(),
            target: target.into(),
            rate,
            amount,
            concurrent_with_next: false,
        }
    }

    /// Deliver a volume (µl).
    pub fn volume(fluid: impl Into<String>, target: impl Into<String>, rate: f64, volume: f64) -> Self {
        Self::new(fluid, target, rate, Amount::Volume(volume))
    }

    /// Flow for a fixed time.
    pub fn timed(fluid: impl Into<String>, target: impl Into<String>, rate: f64, duration: Duration) -> Self {
        Self::new(fluid, target, rate, Amount::Duration(duration))
    }

    pub fn concurrent(mut self) -> Self {
        self.concurrent_with_next = true;
        self
    }

    /// Delivery time at the step's rate.
    ///
    /// # Errors
    /// `InvalidStep` for a non-positive or non-finite rate, duration or
    /// volume. Nothing is clamped.
    pub fn delivery_time(&self, step: usize) -> FlowResult<Duration> {
        let invalid = |reason: String| FlowError::InvalidStep { step, reason };
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(invalid(format!("rate must be positive, got {}", self.rate)));
        }
        match self.amount {
            Amount::Duration(d) if d.is_zero() => Err(invalid("duration must be positive".into())),
            Amount::Duration(d) => Ok(d),
            Amount::Volume(v) if !v.is_finite() || v <= 0.0 => {
                Err(invalid(format!("volume must be positive, got {v}")))
            }
            Amount::Volume(v) => Duration::try_from_secs_f64(v / self.rate).map_err(|_| {
                invalid(format!(
                    "{v} µl at {} µl/s exceeds the longest representable delivery",
                    self.rate
                ))
            }),
        }
    }

    /// Delivered volume in µl, derived from the rate when the step is timed.
    pub fn delivery_volume(&self) -> f64 {
        match self.amount {
            Amount::Duration(d) => d.as_secs_f64() * self.rate,
            Amount::Volume(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolStep {
    Flow(FlowStep),
    /// Hold with all pumps idle
    Incubate {
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
}

impl ProtocolStep {
    pub fn concurrent_with_next(&self) -> bool {
        match self {
            Self::Flow(step) => step.concurrent_with_next,
            Self::Incubate { .. } => false,
        }
    }
}

impl From<FlowStep> for ProtocolStep {
    fn from(step: FlowStep) -> Self {
        Self::Flow(step)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Protocol {
    #[serde(default)]
    pub name: String,
    pub steps: Vec<ProtocolStep>,
}

impl Protocol {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn then(mut self, step: impl Into<ProtocolStep>) -> Self {
        self.steps.push(step.into());
        self
    }

    pub fn incubate(mut self, duration: Duration) -> Self {
        self.steps.push(ProtocolStep::Incubate { duration });
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step index ranges of consecutive concurrency groups. A sequential
    /// step forms a group of one. A trailing concurrent flag is ignored.
    pub fn groups(&self) -> Vec<std::ops::Range<usize>> {
        let mut groups = Vec::new();
        let mut start = 0;
        for (i, step) in self.steps.iter().enumerate() {
            if !step.concurrent_with_next() || i + 1 == self.steps.len() {
                groups.push(start..i + 1);
                start = i + 1;
            }
        }
        groups
    }

    /// Volume (µl) each reservoir must hold for one run, keyed by reservoir
    /// id: every delivery plus the dead volume of each priming.
    ///
    /// Steps are compiled in order from the network's initial valve
    /// positions, so a path is charged again whenever another fluid has
    /// displaced it.
    pub fn reservoir_demand(&self, network: &Arc<FluidicNetwork>) -> FlowResult<BTreeMap<String, f64>> {
        let mut compiler = StepCompiler::new(Arc::clone(network));
        let mut routing = network.initial_routing();
        let mut demand = BTreeMap::new();
        for (index, step) in self.steps.iter().enumerate() {
            let ProtocolStep::Flow(flow) = step else {
                continue;
            };
            let reservoir = network.reservoir(&flow.fluid)?.id.clone();
            let compiled = compiler.compile(index, step, &routing, None)?;
            let mut volume = flow.delivery_volume();
            let mut route = None;
            for command in &compiled.commands {
                match &command.kind {
                    CommandKind::ConfigureRoute(path) => {
                        for (valve, position) in path.valve_settings() {
                            routing.set(valve.clone(), *position);
                        }
                        route = Some(path);
                    }
                    CommandKind::Wait {
                        purpose: WaitPurpose::Priming,
                        ..
                    } => volume += route.map_or(0.0, |path| path.dead_volume()),
                    _ => {}
                }
            }
            *demand.entry(reservoir).or_insert(0.0) += volume;
        }
        Ok(demand)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::tests::selector_network;

    #[test]
    fn test_volume_derives_duration() {
        let step = FlowStep::volume("buffer", "chamber", 5.0, 50.0);
        assert_eq!(step.delivery_time(0).unwrap(), Duration::from_secs(10));
        assert_eq!(step.delivery_volume(), 50.0);
    }

    #[test]
    fn test_duration_implies_volume() {
        let step = FlowStep::timed("buffer", "chamber", 2.5, Duration::from_secs(4));
        assert_eq!(step.delivery_volume(), 10.0);
    }

    #[test]
    fn test_non_positive_values_rejected() {
        for step in [
            FlowStep::volume("b", "c", 0.0, 10.0),
            FlowStep::volume("b", "c", -1.0, 10.0),
            FlowStep::volume("b", "c", 1.0, 0.0),
            FlowStep::timed("b", "c", 1.0, Duration::ZERO),
        ] {
            assert!(matches!(
                step.delivery_time(3),
                Err(FlowError::InvalidStep { step: 3, .. })
            ));
        }
    }

    #[test]
    fn test_unrepresentable_delivery_rejected() {
        let step = FlowStep::volume("R", "C", 1e-9, 1e15);
        assert!(matches!(
            step.delivery_time(4),
            Err(FlowError::InvalidStep { step: 4, .. })
        ));
    }

    #[test]
    fn test_concurrency_groups() {
        let protocol = Protocol::new("groups")
            .then(FlowStep::volume("a", "c", 1.0, 1.0).concurrent())
            .then(FlowStep::volume("b", "c", 1.0, 1.0))
            .incubate(Duration::from_secs(60))
            .then(FlowStep::volume("a", "c", 1.0, 1.0).concurrent());
        assert_eq!(protocol.groups(), vec![0..2, 2..3, 3..4]);
    }

    #[test]
    fn test_reservoir_demand_counts_priming() {
        let (tubing, sys) = selector_network();
        let network = Arc::new(FluidicNetwork::build(&tubing, &sys).unwrap());
        let protocol = Protocol::new("demand")
            .then(FlowStep::volume("buffer", "chamber", 5.0, 50.0))
            .then(FlowStep::volume("imager", "chamber", 5.0, 20.0))
            .incubate(Duration::from_secs(60))
            // imager displaced buffer from the shared tubing: primed again
            .then(FlowStep::volume("buffer", "chamber", 5.0, 10.0))
            // still primed
            .then(FlowStep::timed("buffer", "chamber", 2.0, Duration::from_secs(5)));

        let demand = protocol.reservoir_demand(&network).unwrap();
        // R1 -> chamber holds 55 µl, R2 -> chamber 58 µl.
        assert_eq!(demand.len(), 2);
        assert_eq!(demand["buffer"], 55.0 + 50.0 + 55.0 + 10.0 + 10.0);
        assert_eq!(demand["imager"], 58.0 + 20.0);
    }

    #[test]
    fn test_reservoir_demand_rejects_unknown_fluid() {
        let (tubing, sys) = selector_network();
        let network = Arc::new(FluidicNetwork::build(&tubing, &sys).unwrap());
        let protocol = Protocol::new("unknown").then(FlowStep::volume("ethanol", "chamber", 5.0, 1.0));
        assert!(matches!(
            protocol.reservoir_demand(&network),
            Err(FlowError::Routing(_))
        ));
    }

    #[test]
    fn test_protocol_document_shape() {
        let json = r#"{
            "name": "wash",
            "steps": [
                {"type": "flow", "fluid": "buffer", "target": "chamber", "rate": 5.0, "volume": 50.0},
                {"type": "incubate", "duration": "2m"},
                {"type": "flow", "fluid": "imager", "target": "chamber", "rate": 2.0,
                 "duration": "30s", "concurrent_with_next": true}
            ]
        }"#;
        let protocol: Protocol = serde_json::from_str(json).unwrap();
        assert_eq!(protocol.len(), 3);
        assert_eq!(
            protocol.steps[1],
            ProtocolStep::Incubate {
                duration: Duration::from_secs(120)
            }
        );
        let ProtocolStep::Flow(step) = &protocol.steps[2] else {
            panic!("expected a flow step");
        };
        assert_eq!(step.amount, Amount::Duration(Duration::from_secs(30)));
        assert!(step.concurrent_with_next);
    }
}
