// simulate.rs — Buffer simulation at primitive-firing granularity
//
// Replays phasing schedules against the channels of a `Topology`, checking
// that every firing finds enough items to peek at before it pops. Used to
// certify buffer conservation of steady schedules.
//
// Preconditions: `schedules` were built for the same graph as `topology`.
// Postconditions: channel levels reflect every firing replayed so far.
// Failure modes: a firing that would underflow a channel is an Internal
//                error naming the unit and channel.
// Side effects: none.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::diag::{Result, ScheduleError};
use crate::id::StreamId;
use crate::schedule::{Firing, PhasingSchedule, ProgramSchedules, Stage};
use crate::stream::StreamGraph;
use crate::topology::{ChannelId, Topology, WorkUnit};

/// Channel occupancies plus per-unit execution counters.
#[derive(Debug, Clone)]
pub struct Simulator<'a> {
    graph: &'a StreamGraph,
    topology: &'a Topology,
    levels: Vec<u64>,
    executed: HashMap<WorkUnit, u64>,
}

impl<'a> Simulator<'a> {
    /// Every channel starts with its initial items.
    pub fn new(graph: &'a StreamGraph, topology: &'a Topology) -> Self {
        Simulator {
            graph,
            topology,
            levels: topology.channels().iter().map(|c| c.initial).collect(),
            executed: HashMap::new(),
        }
    }

    pub fn level(&self, channel: ChannelId) -> u64 {
        self.levels[channel.0]
    }

    pub fn levels(&self) -> &[u64] {
        &self.levels
    }

    /// Completed executions of `unit`.
    pub fn executions(&self, unit: WorkUnit) -> u64 {
        self.executed.get(&unit).copied().unwrap_or(0)
    }

    /// Levels of the channels created inside `scope`.
    pub fn internal_levels(&self, scope: StreamId) -> Vec<(ChannelId, u64)> {
        self.topology
            .channels()
            .iter()
            .filter(|c| self.topology.is_internal(self.graph, c, scope))
            .map(|c| (c.id, self.levels[c.id.0]))
            .collect()
    }

    fn tracked(&self, channel: ChannelId, scope: Option<StreamId>) -> bool {
        match scope {
            None => true,
            Some(scope) => {
                self.topology
                    .is_internal(self.graph, self.topology.channel(channel), scope)
            }
        }
    }

    /// Fire one phase of one unit. With `scope` set, channels outside that
    /// node are treated as unbounded.
    pub fn fire(&mut self, firing: &Firing, scope: Option<StreamId>) -> Result<()> {
        let unit = firing.unit;
        let profile = self.topology.profile(unit).ok_or_else(|| {
            ScheduleError::internal(format!("no execution profile for {}", unit.name(self.graph)))
        })?;
        let list = match firing.stage {
            Stage::Init => &profile.init,
            Stage::Steady => &profile.steady,
        };
        let exec = list.get(firing.phase).ok_or_else(|| {
            ScheduleError::internal(format!(
                "{} has no phase {} in its {:?} list",
                unit.name(self.graph),
                firing.phase,
                firing.stage
            ))
        })?;

        for (port, input) in self.topology.inputs(unit).iter().enumerate() {
            let Some(channel) = *input else { continue };
            if !self.tracked(channel, scope) {
                continue;
            }
            let (peek, pop) = (exec.peek[port], exec.pop[port]);
            let level = self.levels[channel.0];
            if level < peek {
                return Err(ScheduleError::internal(format!(
                    "{} peeks {peek} items on channel {} holding {level}",
                    unit.name(self.graph),
                    channel.0
                )));
            }
            self.levels[channel.0] = level - pop;
        }
        for (port, output) in self.topology.outputs(unit).iter().enumerate() {
            let Some(channel) = *output else { continue };
            if self.tracked(channel, scope) {
                self.levels[channel.0] += exec.push[port];
            }
        }
        *self.executed.entry(unit).or_default() += 1;
        trace!(unit = %unit.name(self.graph), stage = ?firing.stage, phase = firing.phase, "fire");
        Ok(())
    }

    pub fn run(&mut self, schedule: &PhasingSchedule, scope: Option<StreamId>) -> Result<()> {
        schedule.for_each_firing(&mut |firing| self.fire(firing, scope))
    }
}

// ── Conservation ────────────────────────────────────────────────────────────

/// Result of one conservation check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConservation {
    pub stream: StreamId,
    pub conserved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConservationReport {
    /// One entry per container, children before parents.
    pub nodes: Vec<NodeConservation>,
    /// Two root steady periods after init return to the same levels.
    pub program: bool,
}

impl ConservationReport {
    pub fn all_conserved(&self) -> bool {
        self.program && self.nodes.iter().all(|n| n.conserved)
    }

    pub fn violations(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.nodes.iter().filter(|n| !n.conserved).map(|n| n.stream)
    }
}

/// Run the root init schedule, then check that each container's steady
/// schedule and the whole program's steady schedule leave buffers unchanged.
pub fn check_conservation(
    graph: &StreamGraph,
    topology: &Topology,
    schedules: &ProgramSchedules,
) -> Result<ConservationReport> {
    let root = schedules.node(graph.root())?;
    let mut sim = Simulator::new(graph, topology);
    sim.run(&root.init, None)?;

    let mut nodes = Vec::new();
    for id in graph.post_order() {
        if !graph.kind(id).is_container() {
            continue;
        }
        let before = sim.internal_levels(id);
        let mut isolated = sim.clone();
        isolated.run(&schedules.node(id)?.steady, Some(id))?;
        let conserved = isolated.internal_levels(id) == before;
        if !conserved {
            debug!(stream = graph.name(id), "steady schedule does not conserve buffers");
        }
        nodes.push(NodeConservation {
            stream: id,
            conserved,
        });
    }

    let start = sim.levels().to_vec();
    sim.run(&root.steady, None)?;
    let once = sim.levels() == start.as_slice();
    sim.run(&root.steady, None)?;
    let twice = sim.levels() == start.as_slice();

    Ok(ConservationReport {
        nodes,
        program: once && twice,
    })
}
