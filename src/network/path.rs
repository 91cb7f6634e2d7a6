//! Shortest-volume path search.
//!
//! The search runs Dijkstra over (point, arriving segment) states so that
//! valve constraints can be enforced: flow through a valve must enter or
//! leave through its common segment, never port to port. Every state keeps
//! all equal-cost predecessors, which lets us enumerate the tied shortest
//! routes and disambiguate them with the current valve positions.

use super::{FluidicNetwork, RoutingState, SegmentId};
use crate::config::PointKind;
use crate::error::{FlowError, FlowResult};
use petgraph::stable_graph::NodeIndex;
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::Duration;

const EPSILON: f64 = 1e-9;
const MAX_CANDIDATES: usize = 64;

/// A resolved route through the network.
#[derive(Debug, Clone, PartialEq)]
pub struct FluidPath {
    from: String,
    to: String,
    points: Vec<NodeIndex>,
    segments: Vec<SegmentId>,
    valve_settings: Vec<(String, u8)>,
    dead_volume: f64,
    transit_volume: f64,
}

impl FluidPath {
    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    /// Points in flow order, endpoints included.
    pub fn points(&self) -> &[NodeIndex] {
        &self.points
    }

    /// Segments in flow order.
    pub fn segments(&self) -> &[SegmentId] {
        &self.segments
    }

    /// Valve positions the path needs, in flow order.
    pub fn valve_settings(&self) -> &[(String, u8)] {
        &self.valve_settings
    }

    /// Sum of segment volumes in µl.
    pub fn dead_volume(&self) -> f64 {
        self.dead_volume
    }

    /// Time to displace the dead volume at `rate` µl/s, weighted by each
    /// segment's flow factor. `None` when the rate is not positive or the
    /// time is not representable.
    pub fn priming_time(&self, rate: f64) -> Option<Duration> {
        if !rate.is_finite() || rate <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(self.transit_volume / rate).ok()
    }

    /// True if both paths share at least one segment.
    pub fn overlaps(&self, other: &FluidPath) -> bool {
        self.segments.iter().any(|s| other.segments.contains(s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct State {
    node: NodeIndex,
    via: Option<SegmentId>,
}

#[derive(Debug, Clone, Copy)]
struct Queued {
    cost: f64,
    state: State,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cost == other.cost
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Reversed for a min-heap.
    fn cmp(&self, other: &Self) -> Ordering {
        other.cost.total_cmp(&self.cost)
    }
}

fn same_cost(a: f64, b: f64) -> bool {
    (a - b).abs() <= EPSILON * a.abs().max(b.abs()).max(1.0)
}

impl FluidicNetwork {
    fn may_traverse(&self, node: NodeIndex, start: NodeIndex, via: Option<SegmentId>, next: SegmentId) -> bool {
        if via == Some(next) {
            return false;
        }
        if node != start && self.graph()[node].kind == PointKind::Reservoir {
            return false;
        }
        match (self.valve_at(node), via) {
            (Some(valve), Some(inbound)) => (inbound == valve.common) != (next == valve.common),
            _ => true,
        }
    }

    pub(crate) fn resolve_between(
        &self,
        from: NodeIndex,
        to: NodeIndex,
        routing: &RoutingState,
    ) -> FlowResult<FluidPath> {
        let from_name = self.point_name(from).to_string();
        let to_name = self.point_name(to).to_string();
        let unreachable = || FlowError::Unreachable {
            from: from_name.clone(),
            to: to_name.clone(),
        };
        if from == to {
            return Err(unreachable());
        }

        let start = State { node: from, via: None };
        let mut dist: HashMap<State, f64> = HashMap::from([(start, 0.0)]);
        let mut preds: HashMap<State, Vec<(State, SegmentId)>> = HashMap::new();
        let mut settled: HashSet<State> = HashSet::new();
        let mut heap = BinaryHeap::from([Queued { cost: 0.0, state: start }]);

        while let Some(Queued { cost, state }) = heap.pop() {
            if !settled.insert(state) || state.node == to {
                continue;
            }
            for edge in self.graph().edges_directed(state.node, Direction::Outgoing) {
                let seg = *edge.weight();
                if !self.may_traverse(state.node, from, state.via, seg) {
                    continue;
                }
                let next = State {
                    node: edge.target(),
                    via: Some(seg),
                };
                let next_cost = cost + self.segment(seg).volume;
                match dist.get(&next).copied() {
                    Some(known) if same_cost(known, next_cost) => {
                        preds.entry(next).or_default().push((state, seg));
                    }
                    Some(known) if known < next_cost => {}
                    _ => {
                        dist.insert(next, next_cost);
                        preds.insert(next, vec![(state, seg)]);
                        heap.push(Queued {
                            cost: next_cost,
                            state: next,
                        });
                    }
                }
            }
        }

        let best = dist
            .iter()
            .filter(|(s, _)| s.node == to)
            .map(|(_, c)| *c)
            .min_by(f64::total_cmp)
            .ok_or_else(unreachable)?;

        let mut candidates: Vec<Vec<(State, SegmentId)>> = Vec::new();
        for (state, cost) in &dist {
            if state.node == to && same_cost(*cost, best) {
                let mut trail = Vec::new();
                self.collect_routes(*state, start, &preds, &mut trail, &mut candidates);
            }
        }

        let mut paths: Vec<FluidPath> = Vec::new();
        for route in candidates {
            let path = self.materialize(&from_name, &to_name, from, &route);
            if !paths.iter().any(|p| p.segments == path.segments) {
                paths.push(path);
            }
        }

        match paths.len() {
            0 => Err(unreachable()),
            1 => Ok(paths.remove(0)),
            n => {
                let mut consistent: Vec<FluidPath> =
                    paths.into_iter().filter(|p| routing.satisfies(p)).collect();
                if consistent.len() == 1 {
                    Ok(consistent.remove(0))
                } else {
                    Err(FlowError::AmbiguousPath {
                        from: from_name,
                        to: to_name,
                        candidates: n,
                    })
                }
            }
        }
    }

    /// Walk predecessor lists back to the start, keeping only simple paths.
    /// `trail` holds the route from `state` to the target, reversed.
    fn collect_routes(
        &self,
        state: State,
        start: State,
        preds: &HashMap<State, Vec<(State, SegmentId)>>,
        trail: &mut Vec<(State, SegmentId)>,
        out: &mut Vec<Vec<(State, SegmentId)>>,
    ) {
        if out.len() >= MAX_CANDIDATES {
            return;
        }
        if state == start {
            out.push(trail.iter().rev().copied().collect());
            return;
        }
        let Some(list) = preds.get(&state) else {
            return;
        };
        for (prev, seg) in list {
            let revisits = prev.node == state.node
                || trail.iter().any(|(s, _)| s.node == prev.node);
            if revisits {
                continue;
            }
            trail.push((state, *seg));
            self.collect_routes(*prev, start, preds, trail, out);
            trail.pop();
        }
    }

    fn materialize(
        &self,
        from_name: &str,
        to_name: &str,
        from: NodeIndex,
        route: &[(State, SegmentId)],
    ) -> FluidPath {
        let mut points = vec![from];
        let mut segments = Vec::with_capacity(route.len());
        for (state, seg) in route {
            points.push(state.node);
            segments.push(*seg);
        }

        let mut valve_settings = Vec::new();
        for (i, node) in points.iter().enumerate() {
            let Some(valve) = self.valve_at(*node) else {
                continue;
            };
            let inbound = i.checked_sub(1).map(|j| segments[j]);
            let outbound = segments.get(i).copied();
            let port = [inbound, outbound]
                .into_iter()
                .flatten()
                .find(|s| *s != valve.common);
            if let Some(pos) = port.and_then(|s| valve.position_of(s)) {
                valve_settings.push((valve.id.clone(), pos));
            }
        }

        let dead_volume = segments.iter().map(|s| self.segment(*s).volume).sum();
        let transit_volume = segments
            .iter()
            .map(|s| {
                let seg = self.segment(*s);
                seg.volume * seg.flow_factor
            })
            .sum();

        FluidPath {
            from: from_name.to_string(),
            to: to_name.to_string(),
            points,
            segments,
            valve_settings,
            dead_volume,
            transit_volume,
        }
    }
}
