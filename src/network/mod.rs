//! Static model of the tubing network.
//!
//! Points (reservoirs, junctions, valves, chambers, outlets) and tubing
//! segments live in an arena graph addressed by stable indices; segments are
//! stored once and referenced from one directed edge, or two when the segment
//! is bidirectional. The network also carries the static descriptors of the
//! pumps and valves so that path resolution and step compilation never need
//! to talk to hardware.
//!
//! The network is built once from [`TubingConfig`] and [`SystemConfig`] and
//! is immutable afterwards. Construction is all-or-nothing: any inconsistency
//! yields an error and no network.

mod path;

pub use path::FluidPath;

use crate::config::{PointKind, SystemConfig, TubingConfig};
use crate::error::{FlowError, FlowResult};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::debug;

/// Index of a tubing segment in the network arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(pub(crate) usize);

/// A network point.
#[derive(Debug, Clone)]
pub struct Point {
    pub name: String,
    pub kind: PointKind,
}

/// A tubing segment between two points.
#[derive(Debug, Clone)]
pub struct Segment {
    pub id: String,
    pub from: NodeIndex,
    pub to: NodeIndex,
    /// Dead volume in µl
    pub volume: f64,
    pub flow_factor: f64,
    pub bidirectional: bool,
}

/// Named fluid source.
#[derive(Debug, Clone)]
pub struct Reservoir {
    pub id: String,
    pub fluid: String,
    pub point: NodeIndex,
}

/// Static description of a pump.
#[derive(Debug, Clone)]
pub struct PumpSpec {
    pub id: String,
    pub address: String,
    /// Maximum actual rate in µl/s
    pub max_rate: f64,
    pub calibration: f64,
    pub segments: Vec<SegmentId>,
}

/// Static description of a multi-position valve.
#[derive(Debug, Clone)]
pub struct ValveSpec {
    pub id: String,
    pub address: String,
    pub point: NodeIndex,
    pub common: SegmentId,
    pub ports: BTreeMap<u8, SegmentId>,
    pub initial_position: Option<u8>,
}

impl ValveSpec {
    /// Position that connects `segment` to the common segment.
    pub fn position_of(&self, segment: SegmentId) -> Option<u8> {
        self.ports
            .iter()
            .find_map(|(pos, seg)| (*seg == segment).then_some(*pos))
    }
}

/// Valve positions currently selected, keyed by valve id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingState {
    positions: BTreeMap<String, u8>,
}

impl RoutingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self, valve: &str) -> Option<u8> {
        self.positions.get(valve).copied()
    }

    pub fn set(&mut self, valve: impl Into<String>, position: u8) {
        self.positions.insert(valve.into(), position);
    }

    pub fn clear(&mut self, valve: &str) {
        self.positions.remove(valve);
    }

    /// True if every valve setting of `path` is already selected.
    pub fn satisfies(&self, path: &FluidPath) -> bool {
        path.valve_settings()
            .iter()
            .all(|(valve, pos)| self.position(valve) == Some(*pos))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u8)> {
        self.positions.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// The fluidic network.
#[derive(Debug)]
pub struct FluidicNetwork {
    graph: StableDiGraph<Point, SegmentId>,
    segments: Vec<Segment>,
    point_index: HashMap<String, NodeIndex>,
    segment_index: HashMap<String, SegmentId>,
    reservoirs: Vec<Reservoir>,
    pumps: Vec<PumpSpec>,
    valves: Vec<ValveSpec>,
    valve_at: HashMap<NodeIndex, usize>,
}

impl FluidicNetwork {
    /// Build and validate the network.
    ///
    /// # Errors
    /// - `Configuration` for malformed input or dangling references
    /// - `DisconnectedNetwork` if a point cannot be reached from any reservoir
    /// - `AmbiguousPath` if a reservoir reaches a chamber or outlet over
    ///   several equal-volume routes the initial valve positions cannot
    ///   separate
    pub fn build(tubing: &TubingConfig, system: &SystemConfig) -> FlowResult<Self> {
        tubing.validate()?;
        system.validate()?;

        let mut graph = StableDiGraph::new();
        let mut point_index = HashMap::new();
        for point in &tubing.points {
            let idx = graph.add_node(Point {
                name: point.name.clone(),
                kind: point.kind,
            });
            point_index.insert(point.name.clone(), idx);
        }

        let mut segments = Vec::with_capacity(tubing.segments.len());
        let mut segment_index = HashMap::new();
        for seg in &tubing.segments {
            let id = SegmentId(segments.len());
            let from = point_index[&seg.from];
            let to = point_index[&seg.to];
            graph.add_edge(from, to, id);
            if seg.bidirectional {
                graph.add_edge(to, from, id);
            }
            segments.push(Segment {
                id: seg.id.clone(),
                from,
                to,
                volume: seg.volume,
                flow_factor: seg.flow_factor,
                bidirectional: seg.bidirectional,
            });
            segment_index.insert(seg.id.clone(), id);
        }

        let mut network = Self {
            graph,
            segments,
            point_index,
            segment_index,
            reservoirs: Vec::new(),
            pumps: Vec::new(),
            valves: Vec::new(),
            valve_at: HashMap::new(),
        };
        network.bind_reservoirs(system)?;
        network.bind_valves(system)?;
        network.bind_pumps(system)?;
        network.check_connected()?;
        network.check_unambiguous()?;

        debug!(
            points = network.graph.node_count(),
            segments = network.segments.len(),
            reservoirs = network.reservoirs.len(),
            "fluidic network built"
        );
        Ok(network)
    }

    fn typed_point(&self, name: &str, kind: PointKind, owner: &str) -> FlowResult<NodeIndex> {
        let idx = self.point_index.get(name).copied().ok_or_else(|| {
            FlowError::Configuration(format!("{owner} references unknown point '{name}'"))
        })?;
        if self.graph[idx].kind != kind {
            return Err(FlowError::Configuration(format!(
                "{owner} point '{name}' is {:?}, expected {:?}",
                self.graph[idx].kind, kind
            )));
        }
        Ok(idx)
    }

    fn known_segment(&self, name: &str, owner: &str) -> FlowResult<SegmentId> {
        self.segment_index.get(name).copied().ok_or_else(|| {
            FlowError::Configuration(format!("{owner} references unknown segment '{name}'"))
        })
    }

    fn bind_reservoirs(&mut self, system: &SystemConfig) -> FlowResult<()> {
        if system.reservoirs.is_empty() {
            return Err(FlowError::Configuration("no reservoirs declared".into()));
        }
        for res in &system.reservoirs {
            let point =
                self.typed_point(&res.point, PointKind::Reservoir, &format!("reservoir '{}'", res.id))?;
            self.reservoirs.push(Reservoir {
                id: res.id.clone(),
                fluid: res.fluid.clone(),
                point,
            });
        }
        Ok(())
    }

    fn bind_valves(&mut self, system: &SystemConfig) -> FlowResult<()> {
        for cfg in &system.valves {
            let owner = format!("valve '{}'", cfg.id);
            let point = self.typed_point(&cfg.point, PointKind::Valve, &owner)?;
            if self.valve_at.contains_key(&point) {
                return Err(FlowError::Configuration(format!(
                    "{owner}: point '{}' already has a valve",
                    cfg.point
                )));
            }
            let common = self.known_segment(&cfg.common, &owner)?;
            let mut ports = BTreeMap::new();
            for port in &cfg.ports {
                ports.insert(port.position, self.known_segment(&port.segment, &owner)?);
            }

            let declared: HashSet<SegmentId> =
                ports.values().copied().chain(std::iter::once(common)).collect();
            let incident: HashSet<SegmentId> = self.incident_segments(point).collect();
            if let Some(seg) = declared.difference(&incident).next() {
                return Err(FlowError::Configuration(format!(
                    "{owner}: segment '{}' does not touch point '{}'",
                    self.segments[seg.0].id, cfg.point
                )));
            }
            if let Some(seg) = incident.difference(&declared).next() {
                return Err(FlowError::Configuration(format!(
                    "{owner}: segment '{}' is attached but not a declared port",
                    self.segments[seg.0].id
                )));
            }

            self.valve_at.insert(point, self.valves.len());
            self.valves.push(ValveSpec {
                id: cfg.id.clone(),
                address: cfg.address.clone(),
                point,
                common,
                ports,
                initial_position: cfg.initial_position,
            });
        }

        if let Some(idx) = self
            .graph
            .node_indices()
            .find(|idx| self.graph[*idx].kind == PointKind::Valve && !self.valve_at.contains_key(idx))
        {
            return Err(FlowError::Configuration(format!(
                "valve point '{}' has no valve configuration",
                self.graph[idx].name
            )));
        }
        Ok(())
    }

    fn bind_pumps(&mut self, system: &SystemConfig) -> FlowResult<()> {
        for cfg in &system.pumps {
            let owner = format!("pump '{}'", cfg.id);
            let segments = cfg
                .segments
                .iter()
                .map(|s| self.known_segment(s, &owner))
                .collect::<FlowResult<Vec<_>>>()?;
            self.pumps.push(PumpSpec {
                id: cfg.id.clone(),
                address: cfg.address.clone(),
                max_rate: cfg.max_rate,
                calibration: cfg.calibration,
                segments,
            });
        }
        Ok(())
    }

    fn incident_segments(&self, point: NodeIndex) -> impl Iterator<Item = SegmentId> + '_ {
        self.graph
            .edges_directed(point, Direction::Outgoing)
            .chain(self.graph.edges_directed(point, Direction::Incoming))
            .map(|e| *e.weight())
            .collect::<HashSet<_>>()
            .into_iter()
    }

    /// Every point must be reachable from at least one reservoir when
    /// segments are treated as undirected.
    fn check_connected(&self) -> FlowResult<()> {
        let mut seen: HashSet<NodeIndex> = HashSet::new();
        let mut queue: VecDeque<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|idx| self.graph[*idx].kind == PointKind::Reservoir)
            .collect();
        seen.extend(queue.iter().copied());
        while let Some(node) = queue.pop_front() {
            for next in self.graph.neighbors_undirected(node) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        match self.graph.node_indices().find(|idx| !seen.contains(idx)) {
            Some(idx) => Err(FlowError::DisconnectedNetwork(self.graph[idx].name.clone())),
            None => Ok(()),
        }
    }

    fn check_unambiguous(&self) -> FlowResult<()> {
        let routing = self.initial_routing();
        let targets: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|idx| matches!(self.graph[*idx].kind, PointKind::Chamber | PointKind::Outlet))
            .collect();
        for res in &self.reservoirs {
            for target in &targets {
                match self.resolve_between(res.point, *target, &routing) {
                    Ok(_) | Err(FlowError::Unreachable { .. }) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }

    /// Valve positions declared as `initial_position` in the configuration.
    pub fn initial_routing(&self) -> RoutingState {
        let mut routing = RoutingState::new();
        for valve in &self.valves {
            if let Some(pos) = valve.initial_position {
                routing.set(valve.id.clone(), pos);
            }
        }
        routing
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    /// Index of a point by name.
    pub fn point(&self, name: &str) -> FlowResult<NodeIndex> {
        self.point_index
            .get(name)
            .copied()
            .ok_or_else(|| FlowError::Routing(format!("unknown network point '{name}'")))
    }

    pub fn point_name(&self, idx: NodeIndex) -> &str {
        &self.graph[idx].name
    }

    pub fn segment(&self, id: SegmentId) -> &Segment {
        &self.segments[id.0]
    }

    pub fn segment_id(&self, name: &str) -> Option<SegmentId> {
        self.segment_index.get(name).copied()
    }

    pub fn reservoirs(&self) -> &[Reservoir] {
        &self.reservoirs
    }

    pub fn pumps(&self) -> &[PumpSpec] {
        &self.pumps
    }

    pub fn pump(&self, id: &str) -> Option<&PumpSpec> {
        self.pumps.iter().find(|p| p.id == id)
    }

    pub fn valves(&self) -> &[ValveSpec] {
        &self.valves
    }

    pub fn valve(&self, id: &str) -> Option<&ValveSpec> {
        self.valves.iter().find(|v| v.id == id)
    }

    pub(crate) fn valve_at(&self, point: NodeIndex) -> Option<&ValveSpec> {
        self.valve_at.get(&point).map(|i| &self.valves[*i])
    }

    pub(crate) fn graph(&self) -> &StableDiGraph<Point, SegmentId> {
        &self.graph
    }

    /// Find a reservoir by id, falling back to a unique fluid label.
    pub fn reservoir(&self, fluid_or_id: &str) -> FlowResult<&Reservoir> {
        if let Some(res) = self.reservoirs.iter().find(|r| r.id == fluid_or_id) {
            return Ok(res);
        }
        let mut by_label = self.reservoirs.iter().filter(|r| r.fluid == fluid_or_id);
        match (by_label.next(), by_label.next()) {
            (Some(res), None) => Ok(res),
            (Some(_), Some(_)) => Err(FlowError::Routing(format!(
                "fluid '{fluid_or_id}' is held by several reservoirs, name one by id"
            ))),
            (None, _) => Err(FlowError::Routing(format!(
                "no reservoir holds '{fluid_or_id}'"
            ))),
        }
    }

    /// The pump driving `path`: the first pump, in flow order, bound to one
    /// of the path's segments.
    pub fn pump_for_path(&self, path: &FluidPath) -> Option<&PumpSpec> {
        path.segments()
            .iter()
            .find_map(|seg| self.pumps.iter().find(|p| p.segments.contains(seg)))
    }

    // ------------------------------------------------------------------
    // Path queries
    // ------------------------------------------------------------------

    /// Resolve the canonical path between two named points.
    pub fn resolve_path(&self, from: &str, to: &str, routing: &RoutingState) -> FlowResult<FluidPath> {
        self.resolve_between(self.point(from)?, self.point(to)?, routing)
    }

    /// Dead volume on the canonical path between two points.
    pub fn dead_volume(&self, from: &str, to: &str) -> FlowResult<f64> {
        Ok(self
            .resolve_path(from, to, &self.initial_routing())?
            .dead_volume())
    }

    /// Time needed to displace the dead volume between two points at `rate`.
    pub fn priming_time(&self, from: &str, to: &str, rate: f64) -> FlowResult<Duration> {
        let path = self.resolve_path(from, to, &self.initial_routing())?;
        path.priming_time(rate).ok_or_else(|| {
            FlowError::Routing(format!("cannot prime '{from}' -> '{to}' at {rate} µl/s"))
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{
        PointConfig, PumpConfig, ReservoirConfig, SegmentConfig, SystemType, ValveConfig,
        ValvePortConfig,
    };

    pub(crate) fn point(name: &str, kind: PointKind) -> PointConfig {
        PointConfig {
            name: name.into(),
            kind,
        }
    }

    pub(crate) fn seg(id: &str, from: &str, to: &str, volume: f64) -> SegmentConfig {
        SegmentConfig {
            id: id.into(),
            from: from.into(),
            to: to.into(),
            volume,
            flow_factor: 1.0,
            bidirectional: true,
        }
    }

    pub(crate) fn system(reservoirs: &[(&str, &str)], pumps: Vec<PumpConfig>, valves: Vec<ValveConfig>) -> SystemConfig {
        SystemConfig {
            system_type: SystemType::Simulated,
            port: String::new(),
            baud_rate: 9600,
            reservoirs: reservoirs
                .iter()
                .map(|(id, pt)| ReservoirConfig {
                    id: (*id).into(),
                    fluid: format!("{id} fluid"),
                    point: (*pt).into(),
                })
                .collect(),
            pumps,
            valves,
        }
    }

    pub(crate) fn pump(id: &str, address: &str, max_rate: f64, segments: &[&str]) -> PumpConfig {
        PumpConfig {
            id: id.into(),
            address: address.into(),
            max_rate,
            calibration: 1.0,
            segments: segments.iter().map(|s| (*s).into()).collect(),
        }
    }

    /// Two reservoirs through a 2-port selector valve into a pump line.
    ///
    /// ```text
    /// R1 --5-- V --20-- P --30-- chamber --15-- waste
    /// R2 --8--/
    /// ```
    pub(crate) fn selector_network() -> (TubingConfig, SystemConfig) {
        let tubing = TubingConfig {
            points: vec![
                point("R1", PointKind::Reservoir),
                point("R2", PointKind::Reservoir),
                point("V", PointKind::Valve),
                point("P", PointKind::Junction),
                point("chamber", PointKind::Chamber),
                point("waste", PointKind::Outlet),
            ],
            segments: vec![
                seg("r1_v", "R1", "V", 5.0),
                seg("r2_v", "R2", "V", 8.0),
                seg("v_p", "V", "P", 20.0),
                seg("p_chamber", "P", "chamber", 30.0),
                seg("chamber_waste", "chamber", "waste", 15.0),
            ],
        };
        let valve = ValveConfig {
            id: "selector".into(),
            address: "2".into(),
            point: "V".into(),
            common: "v_p".into(),
            ports: vec![
                ValvePortConfig {
                    position: 1,
                    segment: "r1_v".into(),
                },
                ValvePortConfig {
                    position: 2,
                    segment: "r2_v".into(),
                },
            ],
            initial_position: Some(1),
        };
        let sys = system(
            &[("buffer", "R1"), ("imager", "R2")],
            vec![pump("pump_a", "1", 10.0, &["v_p", "p_chamber"])],
            vec![valve],
        );
        (tubing, sys)
    }

    #[test]
    fn test_dead_volume_sums_segments() {
        let (tubing, sys) = selector_network();
        let net = FluidicNetwork::build(&tubing, &sys).unwrap();
        assert_eq!(net.dead_volume("R1", "chamber").unwrap(), 55.0);
        assert_eq!(net.dead_volume("R2", "chamber").unwrap(), 58.0);
        assert_eq!(net.dead_volume("R1", "waste").unwrap(), 70.0);
    }

    #[test]
    fn test_dead_volume_symmetric_for_bidirectional_segments() {
        let (tubing, sys) = selector_network();
        let net = FluidicNetwork::build(&tubing, &sys).unwrap();
        for (a, b) in [("R1", "chamber"), ("P", "waste"), ("R2", "P")] {
            assert_eq!(
                net.dead_volume(a, b).unwrap(),
                net.dead_volume(b, a).unwrap(),
                "{a} <-> {b}"
            );
        }
    }

    #[test]
    fn test_path_through_valve_selects_position() {
        let (tubing, sys) = selector_network();
        let net = FluidicNetwork::build(&tubing, &sys).unwrap();
        let path = net
            .resolve_path("R2", "chamber", &RoutingState::new())
            .unwrap();
        assert_eq!(path.valve_settings(), &[("selector".to_string(), 2)]);
        assert_eq!(net.pump_for_path(&path).unwrap().id, "pump_a");
    }

    #[test]
    fn test_valve_blocks_port_to_port_shortcut() {
        let (tubing, sys) = selector_network();
        let net = FluidicNetwork::build(&tubing, &sys).unwrap();
        // R1 -> V -> R2 would need port-to-port flow, which a selector cannot do.
        let err = net.resolve_path("R1", "R2", &RoutingState::new()).unwrap_err();
        assert!(matches!(err, FlowError::Unreachable { .. }));
    }

    #[test]
    fn test_priming_time() {
        let (tubing, sys) = selector_network();
        let net = FluidicNetwork::build(&tubing, &sys).unwrap();
        assert_eq!(
            net.priming_time("R1", "chamber", 5.0).unwrap(),
            Duration::from_secs(11)
        );
    }

    #[test]
    fn test_directed_segment_is_one_way() {
        let (mut tubing, sys) = selector_network();
        tubing.segments[4].bidirectional = false;
        let net = FluidicNetwork::build(&tubing, &sys).unwrap();
        assert!(net.dead_volume("chamber", "waste").is_ok());
        assert!(matches!(
            net.dead_volume("waste", "chamber"),
            Err(FlowError::Unreachable { .. })
        ));
    }

    #[test]
    fn test_disconnected_point_rejected() {
        let (mut tubing, sys) = selector_network();
        tubing.points.push(point("island", PointKind::Chamber));
        let err = FluidicNetwork::build(&tubing, &sys).unwrap_err();
        assert_eq!(err, FlowError::DisconnectedNetwork("island".into()));
    }

    #[test]
    fn test_equal_paths_are_ambiguous() {
        // R -> J splits into two 10 µl branches that meet again at C.
        let tubing = TubingConfig {
            points: vec![
                point("R", PointKind::Reservoir),
                point("J", PointKind::Junction),
                point("K", PointKind::Junction),
                point("C", PointKind::Chamber),
            ],
            segments: vec![
                seg("r_j", "R", "J", 1.0),
                seg("j_c", "J", "C", 10.0),
                seg("j_k", "J", "K", 4.0),
                seg("k_c", "K", "C", 6.0),
            ],
        };
        let sys = system(&[("res", "R")], vec![pump("p", "1", 5.0, &["r_j"])], vec![]);
        let err = FluidicNetwork::build(&tubing, &sys).unwrap_err();
        assert!(matches!(err, FlowError::AmbiguousPath { candidates: 2, .. }));
    }

    #[test]
    fn test_valve_state_disambiguates_equal_paths() {
        // Two 10 µl routes from R to C, one through each port of valve V.
        let tubing = TubingConfig {
            points: vec![
                point("R", PointKind::Reservoir),
                point("J", PointKind::Junction),
                point("V", PointKind::Valve),
                point("C", PointKind::Chamber),
            ],
            segments: vec![
                seg("r_j", "R", "J", 1.0),
                seg("j_v_a", "J", "V", 4.0),
                seg("j_v_b", "J", "V", 4.0),
                seg("v_c", "V", "C", 6.0),
            ],
        };
        let valve = ValveConfig {
            id: "v".into(),
            address: "2".into(),
            point: "V".into(),
            common: "v_c".into(),
            ports: vec![
                ValvePortConfig {
                    position: 1,
                    segment: "j_v_a".into(),
                },
                ValvePortConfig {
                    position: 2,
                    segment: "j_v_b".into(),
                },
            ],
            initial_position: Some(2),
        };
        let sys = system(&[("res", "R")], vec![pump("p", "1", 5.0, &["r_j"])], vec![valve]);
        let net = FluidicNetwork::build(&tubing, &sys).unwrap();

        let path = net.resolve_path("R", "C", &net.initial_routing()).unwrap();
        assert_eq!(path.valve_settings(), &[("v".to_string(), 2)]);

        let err = net.resolve_path("R", "C", &RoutingState::new()).unwrap_err();
        assert!(matches!(err, FlowError::AmbiguousPath { .. }));
    }

    #[test]
    fn test_reservoir_lookup_by_id_and_label() {
        let (tubing, sys) = selector_network();
        let net = FluidicNetwork::build(&tubing, &sys).unwrap();
        assert_eq!(net.reservoir("imager").unwrap().id, "imager");
        assert_eq!(net.reservoir("buffer fluid").unwrap().id, "buffer");
        assert!(matches!(net.reservoir("ethanol"), Err(FlowError::Routing(_))));
    }

    #[test]
    fn test_undeclared_valve_segment_rejected() {
        let (mut tubing, sys) = selector_network();
        tubing.points.push(point("R3", PointKind::Reservoir));
        tubing.segments.push(seg("r3_v", "R3", "V", 3.0));
        let err = FluidicNetwork::build(&tubing, &sys).unwrap_err();
        assert!(err.to_string().contains("r3_v"));
    }

    #[test]
    fn test_unknown_pump_segment_rejected() {
        let (tubing, mut sys) = selector_network();
        sys.pumps[0].segments.push("missing".into());
        assert!(matches!(
            FluidicNetwork::build(&tubing, &sys),
            Err(FlowError::Configuration(_))
        ));
    }
}
