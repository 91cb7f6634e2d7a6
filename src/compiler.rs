//! Step compilation.
//!
//! Turns one protocol step into the timed command sequence the orchestrator
//! dispatches:
//!
//! ```text
//! configure_route(path)      if the path is not primed or valves differ
//! wait(priming)              if the path is not primed with this fluid
//! set_flow(pump, rate)
//! wait(delivery)
//! set_flow(pump, 0)
//! ```
//!
//! The compiler keeps a "last primed fluid" marker per path. Priming a path
//! invalidates every marker whose path shares a segment with it, since the
//! shared tubing now holds the new fluid.

use crate::error::{FlowError, FlowResult};
use crate::network::{FluidPath, FluidicNetwork, RoutingState};
use crate::protocol::{FlowStep, Protocol, ProtocolStep};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// What a wait is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitPurpose {
    /// Displacing dead volume before delivery counts
    Priming,
    /// Delivering the step's fluid
    Delivery,
    Incubation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    ConfigureRoute(FluidPath),
    SetFlow { pump: String, rate: f64 },
    Wait { duration: Duration, purpose: WaitPurpose },
}

/// One primitive directive, scheduled relative to the start of its step.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledCommand {
    pub step: usize,
    pub offset: Duration,
    pub group: Option<usize>,
    pub kind: CommandKind,
}

/// Commands for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledStep {
    pub step: usize,
    pub group: Option<usize>,
    /// Pump driving the delivery, `None` for incubation
    pub pump: Option<String>,
    pub commands: Vec<CompiledCommand>,
}

impl CompiledStep {
    /// Offset at which the last command runs.
    pub fn total_duration(&self) -> Duration {
        self.commands
            .iter()
            .map(|c| match c.kind {
                CommandKind::Wait { duration, .. } => c.offset + duration,
                _ => c.offset,
            })
            .max()
            .unwrap_or_default()
    }

    /// Split around the delivery (or incubation) wait: commands before it,
    /// its duration, and commands after it.
    pub fn split_hold(&self) -> (&[CompiledCommand], Option<Duration>, &[CompiledCommand]) {
        let hold = self.commands.iter().position(|c| {
            matches!(
                c.kind,
                CommandKind::Wait {
                    purpose: WaitPurpose::Delivery | WaitPurpose::Incubation,
                    ..
                }
            )
        });
        match hold {
            Some(i) => {
                let duration = match self.commands[i].kind {
                    CommandKind::Wait { duration, .. } => Some(duration),
                    _ => None,
                };
                (&self.commands[..i], duration, &self.commands[i + 1..])
            }
            None => (&self.commands, None, &[]),
        }
    }
}

#[derive(Debug, Clone)]
struct PrimedMarker {
    reservoir: String,
    path: FluidPath,
}

/// Compiles protocol steps against a network, tracking primed paths.
#[derive(Debug)]
pub struct StepCompiler {
    network: Arc<FluidicNetwork>,
    primed: HashMap<(String, String), PrimedMarker>,
}

impl StepCompiler {
    pub fn new(network: Arc<FluidicNetwork>) -> Self {
        Self {
            network,
            primed: HashMap::new(),
        }
    }

    pub fn network(&self) -> &Arc<FluidicNetwork> {
        &self.network
    }

    /// Forget every priming marker. Used after a pause or an error, when
    /// tubing contents are no longer trusted.
    pub fn invalidate_all(&mut self) {
        if !self.primed.is_empty() {
            debug!(markers = self.primed.len(), "priming markers invalidated");
        }
        self.primed.clear();
    }

    /// True if `path` was last primed with `reservoir`'s fluid.
    pub fn is_primed(&self, path: &FluidPath, reservoir: &str) -> bool {
        self.primed
            .get(&(path.from().to_string(), path.to().to_string()))
            .is_some_and(|m| m.reservoir == reservoir && m.path.segments() == path.segments())
    }

    fn mark_primed(&mut self, path: &FluidPath, reservoir: &str) {
        self.primed.retain(|_, marker| !marker.path.overlaps(path));
        self.primed.insert(
            (path.from().to_string(), path.to().to_string()),
            PrimedMarker {
                reservoir: reservoir.to_string(),
                path: path.clone(),
            },
        );
    }

    /// Check every step without touching hardware.
    ///
    /// Paths are resolved against `routing`; later steps may still see a
    /// different routing when they run.
    pub fn validate(&self, protocol: &Protocol, routing: &RoutingState) -> FlowResult<()> {
        if protocol.is_empty() {
            return Err(FlowError::InvalidStep {
                step: 0,
                reason: "protocol has no steps".into(),
            });
        }
        for (index, step) in protocol.steps.iter().enumerate() {
            match step {
                ProtocolStep::Flow(flow) => {
                    flow.delivery_time(index)?;
                    self.plan(index, flow, routing)?;
                }
                ProtocolStep::Incubate { duration } if duration.is_zero() => {
                    return Err(FlowError::InvalidStep {
                        step: index,
                        reason: "incubation must be positive".into(),
                    });
                }
                ProtocolStep::Incubate { .. } => {}
            }
        }
        Ok(())
    }

    /// Resolve path and pump, enforcing the pump's rate limit.
    fn plan(&self, index: usize, step: &FlowStep, routing: &RoutingState) -> FlowResult<(String, FluidPath, String)> {
        let reservoir = self.network.reservoir(&step.fluid)?;
        let from = self.network.point_name(reservoir.point);
        let path = self.network.resolve_path(from, &step.target, routing)?;
        let pump = self.network.pump_for_path(&path).ok_or_else(|| {
            FlowError::Routing(format!("no pump drives the path {} -> {}", path.from(), path.to()))
        })?;
        if step.rate > pump.max_rate {
            return Err(FlowError::RateExceeded {
                step: index,
                pump: pump.id.clone(),
                rate: step.rate,
                max_rate: pump.max_rate,
            });
        }
        Ok((reservoir.id.clone(), path, pump.id.clone()))
    }

    /// Compile one step in full.
    pub fn compile(
        &mut self,
        index: usize,
        step: &ProtocolStep,
        routing: &RoutingState,
        group: Option<usize>,
    ) -> FlowResult<CompiledStep> {
        self.compile_remaining(index, step, routing, group, Duration::ZERO)
    }

    /// Compile a step of which `delivered` has already been delivered.
    /// Only the remainder is scheduled.
    pub fn compile_remaining(
        &mut self,
        index: usize,
        step: &ProtocolStep,
        routing: &RoutingState,
        group: Option<usize>,
        delivered: Duration,
    ) -> FlowResult<CompiledStep> {
        let flow = match step {
            ProtocolStep::Flow(flow) => flow,
            ProtocolStep::Incubate { duration } => {
                if duration.is_zero() {
                    return Err(FlowError::InvalidStep {
                        step: index,
                        reason: "incubation must be positive".into(),
                    });
                }
                let remaining = duration.saturating_sub(delivered);
                return Ok(CompiledStep {
                    step: index,
                    group,
                    pump: None,
                    commands: vec![CompiledCommand {
                        step: index,
                        offset: Duration::ZERO,
                        group,
                        kind: CommandKind::Wait {
                            duration: remaining,
                            purpose: WaitPurpose::Incubation,
                        },
                    }],
                });
            }
        };

        let delivery = flow.delivery_time(index)?.saturating_sub(delivered);
        let (reservoir, path, pump) = self.plan(index, flow, routing)?;
        let primed = self.is_primed(&path, &reservoir);

        let mut commands = Vec::with_capacity(5);
        let mut offset = Duration::ZERO;
        let mut push = |offset: Duration, kind: CommandKind| {
            commands.push(CompiledCommand {
                step: index,
                offset,
                group,
                kind,
            })
        };

        if !primed || !routing.satisfies(&path) {
            push(offset, CommandKind::ConfigureRoute(path.clone()));
        }
        if !primed {
            let priming = path.priming_time(flow.rate).ok_or_else(|| FlowError::InvalidStep {
                step: index,
                reason: format!(
                    "priming {:.1} µl at {} µl/s is not representable",
                    path.dead_volume(),
                    flow.rate
                ),
            })?;
            if !priming.is_zero() {
                push(
                    offset,
                    CommandKind::Wait {
                        duration: priming,
                        purpose: WaitPurpose::Priming,
                    },
                );
                offset += priming;
            }
            self.mark_primed(&path, &reservoir);
        }
        push(
            offset,
            CommandKind::SetFlow {
                pump: pump.clone(),
                rate: flow.rate,
            },
        );
        push(
            offset,
            CommandKind::Wait {
                duration: delivery,
                purpose: WaitPurpose::Delivery,
            },
        );
        offset += delivery;
        push(
            offset,
            CommandKind::SetFlow {
                pump: pump.clone(),
                rate: 0.0,
            },
        );

        trace!(step = index, pump = %pump, commands = commands.len(), primed, "step compiled");
        Ok(CompiledStep {
            step: index,
            group,
            pump: Some(pump),
            commands,
        })
    }
}
