// schedule.rs — Hierarchical phasing schedules for stream programs
//
// Builds an init schedule and a steady schedule for every node, bottom-up.
// A filter's schedule lists its phases; a container's schedule repeats its
// children's (shared) schedules in an order chosen by the phasing policy.
//
// Preconditions: `table` was produced by `balance` for the same graph.
// Postconditions: every node has both schedules; a container's steady
//                 schedule fires each part exactly its multiplicity.
// Failure modes: an order that stalls after balancing succeeded is reported
//                as an Internal error.
// Side effects: emits `tracing` debug events on policy fallback.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::balance::RateTable;
use crate::diag::{Result, ScheduleError};
use crate::flow::{LocalGraph, Order, Run, Slot};
use crate::id::StreamId;
use crate::simulate;
use crate::stream::{StreamGraph, StreamKind};
use crate::topology::{Topology, WorkUnit};

pub use crate::flow::Stage;

// ── Public types ────────────────────────────────────────────────────────────

/// Phase-ordering strategy used for steady schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhasingPolicy {
    /// Every part appears once per steady schedule, carrying its full count.
    #[default]
    SingleAppearance,
    /// Parts fire one at a time, most downstream first.
    MinLatency,
}

impl PhasingPolicy {
    pub fn label(self) -> &'static str {
        match self {
            PhasingPolicy::SingleAppearance => "single-appearance",
            PhasingPolicy::MinLatency => "min-latency",
        }
    }

    fn order(self) -> Order {
        match self {
            PhasingPolicy::SingleAppearance => Order::Blocked,
            PhasingPolicy::MinLatency => Order::DownstreamFirst,
        }
    }
}

/// One execution of one phase of a work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Firing {
    pub unit: WorkUnit,
    pub stage: Stage,
    /// Index into the unit's init or steady phase list.
    pub phase: usize,
}

impl Firing {
    fn label(&self, graph: &StreamGraph) -> String {
        let name = self.unit.name(graph);
        let phases = match (self.unit, graph.kind(self.unit.stream())) {
            (WorkUnit::Filter(_), StreamKind::Filter(rates)) => rates.phases.len(),
            _ => 1,
        };
        match self.stage {
            Stage::Init => format!("{name}:init#{}", self.phase),
            Stage::Steady if phases > 1 => format!("{name}#{}", self.phase),
            Stage::Steady => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Fire(Firing),
    Repeat {
        times: u64,
        schedule: Arc<PhasingSchedule>,
    },
}

/// Total firings per unit and stage.
pub type FiringCounts = BTreeMap<(WorkUnit, Stage), u64>;

/// An ordered list of phases; immutable once built and shared by `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhasingSchedule {
    pub node: StreamId,
    pub stage: Stage,
    phases: Vec<Phase>,
}

impl PhasingSchedule {
    fn single(node: StreamId, firing: Firing) -> Self {
        PhasingSchedule {
            node,
            stage: firing.stage,
            phases: vec![Phase::Fire(firing)],
        }
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn firing_counts(&self) -> FiringCounts {
        let mut counts = FiringCounts::new();
        self.accumulate(1, &mut counts);
        counts
    }

    fn accumulate(&self, k: u64, counts: &mut FiringCounts) {
        for phase in &self.phases {
            match phase {
                Phase::Fire(f) => {
                    let count = counts.entry((f.unit, f.stage)).or_default();
                    *count = count.saturating_add(k);
                }
                Phase::Repeat { times, schedule } => {
                    schedule.accumulate(k.saturating_mul(*times), counts)
                }
            }
        }
    }

    pub fn total_firings(&self) -> u64 {
        self.firing_counts().values().sum()
    }

    /// Visit every primitive firing in execution order.
    pub fn for_each_firing<E>(
        &self,
        visit: &mut impl FnMut(&Firing) -> std::result::Result<(), E>,
    ) -> std::result::Result<(), E> {
        for phase in &self.phases {
            match phase {
                Phase::Fire(f) => visit(f)?,
                Phase::Repeat { times, schedule } => {
                    for _ in 0..*times {
                        schedule.for_each_firing(visit)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn is_flat(&self) -> bool {
        self.phases.iter().all(|p| matches!(p, Phase::Fire(_)))
    }

    pub fn render<'a>(&'a self, graph: &'a StreamGraph) -> ScheduleDisplay<'a> {
        ScheduleDisplay {
            schedule: self,
            graph,
        }
    }
}

/// The init and steady schedule of one node.
#[derive(Debug, Clone)]
pub struct NodeSchedules {
    pub init: Arc<PhasingSchedule>,
    pub steady: Arc<PhasingSchedule>,
}

/// Schedules of every node of a program.
#[derive(Debug, Clone)]
pub struct ProgramSchedules {
    nodes: HashMap<StreamId, NodeSchedules>,
    root: StreamId,
    policy: PhasingPolicy,
}

impl ProgramSchedules {
    pub fn root(&self) -> StreamId {
        self.root
    }

    pub fn policy(&self) -> PhasingPolicy {
        self.policy
    }

    pub fn get(&self, id: StreamId) -> Option<&NodeSchedules> {
        self.nodes.get(&id)
    }

    pub fn node(&self, id: StreamId) -> Result<&NodeSchedules> {
        self.nodes
            .get(&id)
            .ok_or_else(|| ScheduleError::internal(format!("no schedule built for {id}")))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Build init and steady schedules for every node of `graph`.
pub fn build_schedules(
    graph: &StreamGraph,
    table: &RateTable,
    policy: PhasingPolicy,
) -> Result<ProgramSchedules> {
    let mut ctx = ScheduleCtx {
        graph,
        table,
        out: ProgramSchedules {
            nodes: HashMap::new(),
            root: graph.root(),
            policy,
        },
    };
    for id in graph.post_order() {
        let node = ctx.schedule_node(id)?;
        ctx.out.nodes.insert(id, node);
    }
    Ok(ctx.out)
}

// ── Verification ────────────────────────────────────────────────────────────

/// Machine-checkable evidence for schedule postconditions (S1-S3).
#[derive(Debug, Clone)]
pub struct ScheduleCert {
    /// S1: every stream node has an init and a steady schedule.
    pub s1_all_nodes_scheduled: bool,
    /// S2: steady firing totals match multiplicity-weighted child totals.
    pub s2_totals_match: bool,
    /// S3: steady schedules leave internal buffers unchanged.
    pub s3_buffers_conserved: bool,
}

impl crate::pass::StageCert for ScheduleCert {
    fn all_pass(&self) -> bool {
        self.s1_all_nodes_scheduled && self.s2_totals_match && self.s3_buffers_conserved
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("S1_all_nodes_scheduled", self.s1_all_nodes_scheduled),
            ("S2_totals_match", self.s2_totals_match),
            ("S3_buffers_conserved", self.s3_buffers_conserved),
        ]
    }
}

pub fn verify_schedules(
    graph: &StreamGraph,
    topology: &Topology,
    table: &RateTable,
    schedules: &ProgramSchedules,
) -> ScheduleCert {
    let s1 = graph.nodes().all(|n| schedules.get(n.id).is_some());
    let s2 = graph
        .nodes()
        .filter(|n| n.kind.is_container())
        .all(|n| totals_match(graph, table, schedules, n.id));
    let s3 = match simulate::check_conservation(graph, topology, schedules) {
        Ok(report) => report.all_conserved(),
        Err(err) => {
            debug!(%err, "conservation check failed to run");
            false
        }
    };
    ScheduleCert {
        s1_all_nodes_scheduled: s1,
        s2_totals_match: s2,
        s3_buffers_conserved: s3,
    }
}

/// S2 for one container.
fn totals_match(
    graph: &StreamGraph,
    table: &RateTable,
    schedules: &ProgramSchedules,
    id: StreamId,
) -> bool {
    let (Some(balance), Some(own)) = (table.get(id), schedules.get(id)) else {
        return false;
    };
    let mut expected = FiringCounts::new();
    for (i, child) in graph.kind(id).children().into_iter().enumerate() {
        let (Some(m), Some(sched)) = (balance.steady.children.get(i), schedules.get(child)) else {
            return false;
        };
        for (key, count) in sched.steady.firing_counts() {
            let total = expected.entry(key).or_default();
            *total = total.saturating_add(m.saturating_mul(count));
        }
    }
    if let Some(m) = balance.steady.splitter {
        expected.insert((WorkUnit::Splitter(id), Stage::Steady), m);
    }
    if let Some(m) = balance.steady.joiner {
        expected.insert((WorkUnit::Joiner(id), Stage::Steady), m);
    }
    expected.retain(|_, count| *count > 0);
    own.steady.firing_counts() == expected
}

// ── Internal context ────────────────────────────────────────────────────────

struct ScheduleCtx<'a> {
    graph: &'a StreamGraph,
    table: &'a RateTable,
    out: ProgramSchedules,
}

impl<'a> ScheduleCtx<'a> {
    fn schedule_node(&self, id: StreamId) -> Result<NodeSchedules> {
        if let StreamKind::Filter(rates) = self.graph.kind(id) {
            let unit = WorkUnit::Filter(id);
            let list = |stage: Stage, count: usize| PhasingSchedule {
                node: id,
                stage,
                phases: (0..count)
                    .map(|phase| Phase::Fire(Firing { unit, stage, phase }))
                    .collect(),
            };
            return Ok(NodeSchedules {
                init: Arc::new(list(Stage::Init, rates.prework.len())),
                steady: Arc::new(list(Stage::Steady, rates.phases.len())),
            });
        }
        self.schedule_container(id)
    }

    fn schedule_container(&self, id: StreamId) -> Result<NodeSchedules> {
        let name = self.graph.name(id);
        let balance = self.table.node(id)?;
        let local = self.table.local_graph(self.graph, id)?;

        let mut levels = local.initial_levels();
        let init_runs = local
            .sequence(
                &local.init_work(&balance.init.to_actors(&local)),
                &mut levels,
                Order::UpstreamFirst,
            )
            .ok_or_else(|| {
                ScheduleError::internal(format!("init order of '{name}' stalls after balancing"))
            })?;

        let steady_work = local.steady_work(&balance.steady.to_actors(&local));
        let order = self.out.policy.order();
        let mut after = levels.clone();
        let steady_runs = match local.sequence(&steady_work, &mut after, order) {
            Some(runs) => runs,
            None if order == Order::Blocked => {
                debug!(
                    stream = name,
                    "single-appearance order stalls; falling back to greedy order"
                );
                let mut after = levels.clone();
                local
                    .sequence(&steady_work, &mut after, Order::DownstreamFirst)
                    .ok_or_else(|| {
                        ScheduleError::internal(format!("steady order of '{name}' stalls"))
                    })?
            }
            None => {
                return Err(ScheduleError::internal(format!(
                    "steady order of '{name}' stalls"
                )))
            }
        };

        Ok(NodeSchedules {
            init: Arc::new(PhasingSchedule {
                node: id,
                stage: Stage::Init,
                phases: self.phases_of(id, &local, &init_runs)?,
            }),
            steady: Arc::new(PhasingSchedule {
                node: id,
                stage: Stage::Steady,
                phases: self.phases_of(id, &local, &steady_runs)?,
            }),
        })
    }

    fn phases_of(&self, id: StreamId, local: &LocalGraph, runs: &[Run]) -> Result<Vec<Phase>> {
        let children = self.graph.kind(id).children();
        let split = Arc::new(PhasingSchedule::single(
            id,
            Firing {
                unit: WorkUnit::Splitter(id),
                stage: Stage::Steady,
                phase: 0,
            },
        ));
        let join = Arc::new(PhasingSchedule::single(
            id,
            Firing {
                unit: WorkUnit::Joiner(id),
                stage: Stage::Steady,
                phase: 0,
            },
        ));
        runs.iter()
            .map(|run| {
                let schedule = match local.actors[run.actor].slot {
                    Slot::Child(i) => {
                        let child = children.get(i).ok_or_else(|| {
                            ScheduleError::internal(format!("missing child {i} of {id}"))
                        })?;
                        let own = self.out.node(*child)?;
                        match run.stage {
                            Stage::Init => Arc::clone(&own.init),
                            Stage::Steady => Arc::clone(&own.steady),
                        }
                    }
                    Slot::Splitter => Arc::clone(&split),
                    Slot::Joiner => Arc::clone(&join),
                };
                Ok(Phase::Repeat {
                    times: run.times,
                    schedule,
                })
            })
            .collect()
    }
}

// ── Display ─────────────────────────────────────────────────────────────────

pub struct ScheduleDisplay<'a> {
    schedule: &'a PhasingSchedule,
    graph: &'a StreamGraph,
}

impl fmt::Display for ScheduleDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.schedule.is_empty() {
            return writeln!(f, "(nothing)");
        }
        self.write_phases(f, self.schedule, 0)
    }
}

impl ScheduleDisplay<'_> {
    fn write_phases(
        &self,
        f: &mut fmt::Formatter<'_>,
        schedule: &PhasingSchedule,
        depth: usize,
    ) -> fmt::Result {
        let indent = "  ".repeat(depth);
        for phase in &schedule.phases {
            match phase {
                Phase::Fire(firing) => writeln!(f, "{indent}{}", firing.label(self.graph))?,
                Phase::Repeat { schedule, .. } if schedule.is_empty() => {}
                Phase::Repeat { times, schedule } if schedule.is_flat() => {
                    let labels: Vec<String> = schedule
                        .phases
                        .iter()
                        .filter_map(|p| match p {
                            Phase::Fire(firing) => Some(firing.label(self.graph)),
                            Phase::Repeat { .. } => None,
                        })
                        .collect();
                    writeln!(f, "{indent}{times}x {}", labels.join(" "))?;
                }
                Phase::Repeat { times, schedule } => {
                    let stage = match schedule.stage {
                        Stage::Init => "init",
                        Stage::Steady => "steady",
                    };
                    writeln!(
                        f,
                        "{indent}{times}x {} {stage}:",
                        self.graph.name(schedule.node)
                    )?;
                    self.write_phases(f, schedule, depth + 1)?;
                }
            }
        }
        Ok(())
    }
}

/// Init and steady schedules of the program root.
pub fn render_program(graph: &StreamGraph, schedules: &ProgramSchedules) -> Result<String> {
    let root = schedules.node(graph.root())?;
    Ok(format!(
        "init:\n{}steady:\n{}",
        indent_block(&root.init.render(graph).to_string()),
        indent_block(&root.steady.render(graph).to_string()),
    ))
}

fn indent_block(text: &str) -> String {
    text.lines().map(|line| format!("  {line}\n")).collect()
}
