// topology.rs — Flattened work units, channels, and execution profiles
//
// Lowers the stream hierarchy into the primitive units that actually fire
// (filters and the splitter/joiner halves of split-joins and feedback loops)
// and the channels between them. The buffer simulator, the latency graph,
// and the DOT emitter all consume this view.
//
// Preconditions: `graph` was produced by `StreamGraphBuilder::build`.
// Postconditions: every unit port is connected to exactly one channel or to
//                 the program boundary; the feedback channel of each loop
//                 carries `delay` initial tokens.
// Failure modes: none (structure was validated at build time).
// Side effects: none.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::diag::{Result, ScheduleError};
use crate::id::StreamId;
use crate::stream::{Joiner, Rate, Splitter, StreamGraph, StreamKind};

// ── Public types ────────────────────────────────────────────────────────────

/// A primitive schedulable unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum WorkUnit {
    Filter(StreamId),
    Splitter(StreamId),
    Joiner(StreamId),
}

impl WorkUnit {
    /// The stream node this unit belongs to.
    pub fn stream(self) -> StreamId {
        match self {
            WorkUnit::Filter(id) | WorkUnit::Splitter(id) | WorkUnit::Joiner(id) => id,
        }
    }

    /// Display name: the filter's name, or `NAME.splitter` / `NAME.joiner`.
    pub fn name(self, graph: &StreamGraph) -> String {
        match self {
            WorkUnit::Filter(id) => graph.name(id).to_string(),
            WorkUnit::Splitter(id) => format!("{}.splitter", graph.name(id)),
            WorkUnit::Joiner(id) => format!("{}.joiner", graph.name(id)),
        }
    }

    /// Parse a display name back into a unit of `graph`.
    pub fn find(graph: &StreamGraph, name: &str) -> Result<WorkUnit> {
        let unknown = || ScheduleError::UnknownUnit {
            name: name.to_string(),
        };
        if let Some(stem) = name.strip_suffix(".splitter") {
            let id = graph.find(stem)?;
            return if graph.kind(id).has_splitter() {
                Ok(WorkUnit::Splitter(id))
            } else {
                Err(unknown())
            };
        }
        if let Some(stem) = name.strip_suffix(".joiner") {
            let id = graph.find(stem)?;
            return if graph.kind(id).has_splitter() {
                Ok(WorkUnit::Joiner(id))
            } else {
                Err(unknown())
            };
        }
        let id = graph.find(name)?;
        match graph.kind(id) {
            StreamKind::Filter(_) => Ok(WorkUnit::Filter(id)),
            _ => Err(unknown()),
        }
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkUnit::Filter(id) => write!(f, "filter {id}"),
            WorkUnit::Splitter(id) => write!(f, "splitter {id}"),
            WorkUnit::Joiner(id) => write!(f, "joiner {id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChannelId(pub usize);

/// A FIFO between an output port of one unit and an input port of another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    pub src: WorkUnit,
    pub src_port: usize,
    pub dst: WorkUnit,
    pub dst_port: usize,
    /// Items present before anything fires (feedback delay).
    pub initial: u64,
    /// The container whose composition created this channel.
    pub scope: StreamId,
    /// True for the loop-path → joiner edge of a feedback loop.
    pub feedback: bool,
}

/// Port rates of a single execution, indexed by port.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Execution {
    pub peek: Vec<u64>,
    pub pop: Vec<u64>,
    pub push: Vec<u64>,
}

impl Execution {
    fn of_rate(rate: &Rate) -> Self {
        Execution {
            peek: vec![rate.peek],
            pop: vec![rate.pop],
            push: vec![rate.push],
        }
    }

    fn of_splitter(splitter: &Splitter, ports: usize) -> Self {
        Execution {
            peek: vec![splitter.pop()],
            pop: vec![splitter.pop()],
            push: (0..ports).map(|p| splitter.push(p)).collect(),
        }
    }

    fn of_joiner(joiner: &Joiner) -> Self {
        Execution {
            peek: joiner.weights.clone(),
            pop: joiner.weights.clone(),
            push: vec![joiner.push()],
        }
    }
}

/// Execution sequence of a unit: `init` once, then `steady` cycling forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitProfile {
    pub init: Vec<Execution>,
    pub steady: Vec<Execution>,
}

impl UnitProfile {
    /// The `index`-th execution (0-based) over the whole lifetime.
    pub fn execution(&self, index: u64) -> &Execution {
        let init = self.init.len() as u64;
        if index < init {
            &self.init[index as usize]
        } else {
            let offset = (index - init) % self.steady.len() as u64;
            &self.steady[offset as usize]
        }
    }
}

/// Flattened view of a stream graph.
#[derive(Debug, Clone)]
pub struct Topology {
    units: Vec<WorkUnit>,
    channels: Vec<Channel>,
    ancestors: HashMap<WorkUnit, Vec<StreamId>>,
    inputs: HashMap<WorkUnit, Vec<Option<ChannelId>>>,
    outputs: HashMap<WorkUnit, Vec<Option<ChannelId>>>,
    profiles: HashMap<WorkUnit, UnitProfile>,
}

impl Topology {
    /// Single traversal of the whole program.
    pub fn build(graph: &StreamGraph) -> Topology {
        let mut ctx = TopologyCtx {
            graph,
            topo: Topology {
                units: Vec::new(),
                channels: Vec::new(),
                ancestors: HashMap::new(),
                inputs: HashMap::new(),
                outputs: HashMap::new(),
                profiles: HashMap::new(),
            },
        };
        ctx.visit(graph.root(), &[]);
        ctx.topo
    }

    /// Units in data-flow discovery order.
    pub fn units(&self) -> &[WorkUnit] {
        &self.units
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channel(&self, id: ChannelId) -> &Channel {
        &self.channels[id.0]
    }

    /// Enclosing containers of `unit`, outermost first. For a splitter or
    /// joiner the owning container is the last entry.
    pub fn ancestors(&self, unit: WorkUnit) -> &[StreamId] {
        self.ancestors.get(&unit).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Input channel per port (`None` = program input).
    pub fn inputs(&self, unit: WorkUnit) -> &[Option<ChannelId>] {
        self.inputs.get(&unit).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Output channel per port (`None` = program output).
    pub fn outputs(&self, unit: WorkUnit) -> &[Option<ChannelId>] {
        self.outputs.get(&unit).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn profile(&self, unit: WorkUnit) -> Option<&UnitProfile> {
        self.profiles.get(&unit)
    }

    /// True if `channel` connects two units that both lie inside `scope`.
    pub fn is_internal(&self, graph: &StreamGraph, channel: &Channel, scope: StreamId) -> bool {
        graph.is_within(channel.scope, scope)
    }
}

// ── Construction ────────────────────────────────────────────────────────────

struct TopologyCtx<'a> {
    graph: &'a StreamGraph,
    topo: Topology,
}

impl<'a> TopologyCtx<'a> {
    /// Returns the (top, bottom) units of `id`.
    fn visit(&mut self, id: StreamId, chain: &[StreamId]) -> (WorkUnit, WorkUnit) {
        let graph = self.graph;
        let mut inner = chain.to_vec();
        inner.push(id);
        let (top, bottom) = match graph.kind(id) {
            StreamKind::Filter(rates) => {
                let unit = WorkUnit::Filter(id);
                let profile = UnitProfile {
                    init: rates.prework.iter().map(Execution::of_rate).collect(),
                    steady: rates.phases.iter().map(Execution::of_rate).collect(),
                };
                self.add_unit(unit, chain.to_vec(), 1, 1, profile);
                (unit, unit)
            }
            StreamKind::Pipeline { children } => {
                let mut ends: Vec<(WorkUnit, WorkUnit)> = Vec::with_capacity(children.len());
                for &child in children {
                    ends.push(self.visit(child, &inner));
                }
                for pair in ends.windows(2) {
                    self.connect(pair[0].1, 0, pair[1].0, 0, 0, id, false);
                }
                match (ends.first(), ends.last()) {
                    (Some(first), Some(last)) => (first.0, last.1),
                    // Unreachable for validated graphs; treat as a pass-through.
                    _ => (WorkUnit::Filter(id), WorkUnit::Filter(id)),
                }
            }
            StreamKind::SplitJoin {
                splitter,
                joiner,
                branches,
            } => {
                let k = branches.len();
                let split = WorkUnit::Splitter(id);
                let join = WorkUnit::Joiner(id);
                self.add_unit(split, inner.clone(), 1, k, splitter_profile(splitter, k));
                let ends: Vec<(WorkUnit, WorkUnit)> =
                    branches.iter().map(|&b| self.visit(b, &inner)).collect();
                self.add_unit(join, inner.clone(), k, 1, joiner_profile(joiner));
                for (port, (top, bottom)) in ends.into_iter().enumerate() {
                    self.connect(split, port, top, 0, 0, id, false);
                    self.connect(bottom, 0, join, port, 0, id, false);
                }
                (split, join)
            }
            StreamKind::FeedbackLoop {
                joiner,
                body,
                splitter,
                loop_path,
                delay,
            } => {
                let split = WorkUnit::Splitter(id);
                let join = WorkUnit::Joiner(id);
                self.add_unit(join, inner.clone(), 2, 1, joiner_profile(joiner));
                let (body_top, body_bottom) = self.visit(*body, &inner);
                self.add_unit(split, inner.clone(), 1, 2, splitter_profile(splitter, 2));
                let (loop_top, loop_bottom) = self.visit(*loop_path, &inner);
                self.connect(join, 0, body_top, 0, 0, id, false);
                self.connect(body_bottom, 0, split, 0, 0, id, false);
                self.connect(split, 1, loop_top, 0, 0, id, false);
                self.connect(loop_bottom, 0, join, 1, *delay, id, true);
                (join, split)
            }
        };
        (top, bottom)
    }

    fn add_unit(
        &mut self,
        unit: WorkUnit,
        ancestors: Vec<StreamId>,
        in_ports: usize,
        out_ports: usize,
        profile: UnitProfile,
    ) {
        self.topo.units.push(unit);
        self.topo.ancestors.insert(unit, ancestors);
        self.topo.inputs.insert(unit, vec![None; in_ports]);
        self.topo.outputs.insert(unit, vec![None; out_ports]);
        self.topo.profiles.insert(unit, profile);
    }

    #[allow(clippy::too_many_arguments)]
    fn connect(
        &mut self,
        src: WorkUnit,
        src_port: usize,
        dst: WorkUnit,
        dst_port: usize,
        initial: u64,
        scope: StreamId,
        feedback: bool,
    ) {
        let id = ChannelId(self.topo.channels.len());
        self.topo.channels.push(Channel {
            id,
            src,
            src_port,
            dst,
            dst_port,
            initial,
            scope,
            feedback,
        });
        if let Some(slot) = self
            .topo
            .outputs
            .get_mut(&src)
            .and_then(|ports| ports.get_mut(src_port))
        {
            *slot = Some(id);
        }
        if let Some(slot) = self
            .topo
            .inputs
            .get_mut(&dst)
            .and_then(|ports| ports.get_mut(dst_port))
        {
            *slot = Some(id);
        }
    }
}

fn splitter_profile(splitter: &Splitter, ports: usize) -> UnitProfile {
    UnitProfile {
        init: Vec::new(),
        steady: vec![Execution::of_splitter(splitter, ports)],
    }
}

fn joiner_profile(joiner: &Joiner) -> UnitProfile {
    UnitProfile {
        init: Vec::new(),
        steady: vec![Execution::of_joiner(joiner)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Rate, StreamGraphBuilder};

    fn echo_loop() -> StreamGraph {
        let mut b = StreamGraphBuilder::new();
        let src = b.filter("Src", Rate::new(0, 0, 1));
        let body = b.filter("Body", Rate::new(2, 2, 2));
        let lp = b.filter("Back", Rate::new(1, 1, 1));
        let fl = b.feedback_loop(
            "Echo",
            Joiner::new(vec![1, 1]),
            body,
            Splitter::RoundRobin(vec![1, 1]),
            lp,
            3,
        );
        let sink = b.filter("Sink", Rate::new(1, 1, 0));
        let root = b.pipeline("Main", vec![src, fl, sink]);
        b.build(root).unwrap()
    }

    #[test]
    fn feedback_loop_wiring() {
        let g = echo_loop();
        let t = Topology::build(&g);
        let fl = g.find("Echo").unwrap();
        let names: Vec<String> = t.units().iter().map(|u| u.name(&g)).collect();
        assert_eq!(
            names,
            vec!["Src", "Echo.joiner", "Body", "Echo.splitter", "Back", "Sink"]
        );
        let feedback: Vec<&Channel> = t.channels().iter().filter(|c| c.feedback).collect();
        assert_eq!(feedback.len(), 1);
        assert_eq!(feedback[0].dst, WorkUnit::Joiner(fl));
        assert_eq!(feedback[0].dst_port, 1);
        assert_eq!(feedback[0].initial, 3);
        assert_eq!(t.ancestors(WorkUnit::Splitter(fl)), &[g.root(), fl]);
        // Src -> joiner and splitter -> Sink are created by the pipeline.
        let outer: Vec<&Channel> = t.channels().iter().filter(|c| c.scope == g.root()).collect();
        assert_eq!(outer.len(), 2);
        assert_eq!(outer[1].src, WorkUnit::Splitter(fl));
        assert_eq!(outer[1].src_port, 0);
    }

    #[test]
    fn unit_names_parse_back() {
        let g = echo_loop();
        let fl = g.find("Echo").unwrap();
        assert_eq!(
            WorkUnit::find(&g, "Echo.splitter").unwrap(),
            WorkUnit::Splitter(fl)
        );
        assert!(WorkUnit::find(&g, "Body.joiner").is_err());
        assert!(WorkUnit::find(&g, "Echo").is_err());
    }

    #[test]
    fn profile_cycles_steady_after_prework() {
        let mut b = StreamGraphBuilder::new();
        let f = b.phased_filter(
            "F",
            vec![Rate::new(3, 0, 0)],
            vec![Rate::new(1, 1, 0), Rate::new(0, 0, 2)],
        );
        let g = b.build(f).unwrap();
        let t = Topology::build(&g);
        let p = t.profile(WorkUnit::Filter(f)).unwrap();
        assert_eq!(p.execution(0).peek, vec![3]);
        assert_eq!(p.execution(1).pop, vec![1]);
        assert_eq!(p.execution(2).push, vec![2]);
        assert_eq!(p.execution(3).pop, vec![1]);
    }
}
