// balance.rs — Rate balancing: steady multiplicities and init counts
//
// Walks the stream tree bottom-up. For every container it solves the
// balance equations of its direct children (and splitter/joiner) in exact
// rationals, derives the extra initialization firings that pre-fill
// internal buffers, and summarizes the container's own outer flows for its
// parent.
//
// Preconditions: `graph` is a validated StreamGraph.
// Postconditions: every node reachable from the root has a `NodeBalance`;
//                 all steady multiplicities are positive and minimal.
// Failure modes: UnschedulableRate (inconsistent or starved rates),
//                InsufficientDelay (feedback loop cannot start),
//                RateOverflow (a multiplicity or item total beyond u64).
// Side effects: emits `tracing` debug events per container.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use serde::Serialize;
use tracing::{debug, trace};

use crate::diag::{Result, ScheduleError};
use crate::flow::{ChildRates, Flow, InitError, LocalGraph, Order, Overflow, Slot, StreamRates};
use crate::id::StreamId;
use crate::rational::{normalize_to_integers, Fraction};
use crate::stream::{StreamGraph, StreamKind};

// ── Public types ────────────────────────────────────────────────────────────

/// Firing counts of a node's direct parts.
///
/// For a filter `children` holds one entry per phase (steady) or per prework
/// phase (init). For a feedback loop `children` is `[body, loop]`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Multiplicities {
    pub children: Vec<u64>,
    pub splitter: Option<u64>,
    pub joiner: Option<u64>,
}

impl Multiplicities {
    pub fn get(&self, slot: Slot) -> Option<u64> {
        match slot {
            Slot::Child(i) => self.children.get(i).copied(),
            Slot::Splitter => self.splitter,
            Slot::Joiner => self.joiner,
        }
    }

    fn from_actors(local: &LocalGraph, counts: &[u64]) -> Multiplicities {
        let mut out = Multiplicities::default();
        for (actor, &count) in local.actors.iter().zip(counts) {
            match actor.slot {
                Slot::Child(i) => {
                    if out.children.len() <= i {
                        out.children.resize(i + 1, 0);
                    }
                    out.children[i] = count;
                }
                Slot::Splitter => out.splitter = Some(count),
                Slot::Joiner => out.joiner = Some(count),
            }
        }
        out
    }

    /// Counts in the actor order of `local`.
    pub(crate) fn to_actors(&self, local: &LocalGraph) -> Vec<u64> {
        local
            .actors
            .iter()
            .map(|a| self.get(a.slot).unwrap_or(0))
            .collect()
    }
}

/// Balance results for one stream node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeBalance {
    pub rates: StreamRates,
    /// Steady firings of each part per steady execution of this node.
    pub steady: Multiplicities,
    /// Extra steady firings of each part during this node's initialization.
    pub init: Multiplicities,
    /// True if this node's init schedule fires anything.
    pub has_init: bool,
}

/// Balance results for every node of a program.
#[derive(Debug, Clone)]
pub struct RateTable {
    nodes: HashMap<StreamId, NodeBalance>,
    root: StreamId,
}

impl RateTable {
    pub fn root(&self) -> StreamId {
        self.root
    }

    pub fn get(&self, id: StreamId) -> Option<&NodeBalance> {
        self.nodes.get(&id)
    }

    pub fn node(&self, id: StreamId) -> Result<&NodeBalance> {
        self.nodes
            .get(&id)
            .ok_or_else(|| ScheduleError::internal(format!("no balance computed for {id}")))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Child rates of a container, in `StreamKind::children()` order.
    pub(crate) fn child_rates(&self, graph: &StreamGraph, id: StreamId) -> Result<Vec<ChildRates>> {
        graph
            .kind(id)
            .children()
            .into_iter()
            .map(|c| {
                let b = self.node(c)?;
                Ok(ChildRates {
                    rates: b.rates,
                    has_init: b.has_init,
                })
            })
            .collect()
    }

    /// Local dataflow graph of a container, rebuilt from cached child rates.
    pub(crate) fn local_graph(&self, graph: &StreamGraph, id: StreamId) -> Result<LocalGraph> {
        let children = self.child_rates(graph, id)?;
        Ok(LocalGraph::new(graph.kind(id), &children))
    }

    /// Tree rendering with multiplicities and flows.
    pub fn render<'a>(&'a self, graph: &'a StreamGraph) -> RateTableDisplay<'a> {
        RateTableDisplay { table: self, graph }
    }
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Balance every node of `graph`, children before parents.
pub fn balance(graph: &StreamGraph) -> Result<RateTable> {
    let mut ctx = BalanceCtx {
        graph,
        table: RateTable {
            nodes: HashMap::new(),
            root: graph.root(),
        },
    };
    for id in graph.post_order() {
        let result = ctx.balance_node(id)?;
        ctx.table.nodes.insert(id, result);
    }
    ctx.check_program_totals(graph.root(), 1)?;
    Ok(ctx.table)
}

// ── Feedback loops ──────────────────────────────────────────────────────────

/// Firing counts of the four parts of a feedback loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackCounts {
    pub body: u64,
    pub loop_path: u64,
    pub splitter: u64,
    pub joiner: u64,
}

impl FeedbackCounts {
    pub fn scaled(self, k: u64) -> FeedbackCounts {
        FeedbackCounts {
            body: self.body * k,
            loop_path: self.loop_path * k,
            splitter: self.splitter * k,
            joiner: self.joiner * k,
        }
    }
}

/// Per-firing rates around a feedback cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackBalance {
    pub body_pop: u64,
    pub body_push: u64,
    pub loop_pop: u64,
    pub loop_push: u64,
    /// Splitter output toward the loop path.
    pub split_push: u64,
    pub split_pop: u64,
    /// Joiner input from the loop path.
    pub join_pop: u64,
    pub join_push: u64,
}

impl FeedbackBalance {
    fn from_local(local: &LocalGraph) -> Option<FeedbackBalance> {
        let joiner = &local.actors[local.position(Slot::Joiner)?];
        let body = &local.actors[local.position(Slot::Child(0))?];
        let splitter = &local.actors[local.position(Slot::Splitter)?];
        let loop_path = &local.actors[local.position(Slot::Child(1))?];
        Some(FeedbackBalance {
            body_pop: body.steady.pop[0],
            body_push: body.steady.push[0],
            loop_pop: loop_path.steady.pop[0],
            loop_push: loop_path.steady.push[0],
            split_push: splitter.steady.push[1],
            split_pop: splitter.steady.pop[0],
            join_pop: joiner.steady.pop[1],
            join_push: joiner.steady.push[0],
        })
    }

    /// Rational firing counts (body, splitter, loop, joiner) when the body
    /// fires `body` times.
    fn fractions(&self, body: u64) -> std::result::Result<[Fraction; 4], String> {
        if body == 0 {
            return Err("the body must fire at least once".to_string());
        }
        let body = Fraction::from_integer(body);
        let split = body
            .scale(self.body_push, self.split_pop)
            .ok_or("the splitter consumes nothing per firing")?;
        let loop_frac = split
            .scale(self.split_push, self.loop_pop)
            .ok_or("the loop path consumes nothing per firing")?;
        let join = loop_frac
            .scale(self.loop_push, self.join_pop)
            .ok_or("the joiner takes nothing from the loop path")?;
        let round_trip = join
            .scale(self.join_push, self.body_pop)
            .ok_or("the body consumes nothing per firing")?;
        if round_trip != body {
            let ratio = &round_trip * &recip(&body);
            return Err(format!(
                "one trip around the cycle scales the body's input by {ratio} instead of 1"
            ));
        }
        if [&split, &loop_frac, &join].iter().any(|f| !f.is_positive()) {
            return Err("the cycle admits only the empty schedule".to_string());
        }
        Ok([body, split, loop_frac, join])
    }

    /// Minimal positive solution of the cycle's balance equations.
    pub fn solve(&self) -> std::result::Result<FeedbackCounts, CycleError> {
        let fractions = self.fractions(1).map_err(CycleError::Unbalanced)?;
        let ints = normalize_to_integers(&fractions);
        let mut out = [0u64; 4];
        for (slot, value) in out.iter_mut().zip(&ints) {
            *slot = Fraction::from_integer(value.clone())
                .to_u64()
                .ok_or(CycleError::Overflow)?;
        }
        Ok(FeedbackCounts {
            body: out[0],
            splitter: out[1],
            loop_path: out[2],
            joiner: out[3],
        })
    }

    /// The solution in which the body fires exactly `body` times, if it is
    /// integral.
    pub fn for_body_executions(&self, body: u64) -> Option<FeedbackCounts> {
        let [b, s, l, j] = self.fractions(body).ok()?;
        Some(FeedbackCounts {
            body: b.to_u64()?,
            splitter: s.to_u64()?,
            loop_path: l.to_u64()?,
            joiner: j.to_u64()?,
        })
    }
}

/// Why a feedback cycle has no usable solution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CycleError {
    #[error("{0}")]
    Unbalanced(String),
    #[error("multiplicity does not fit in 64 bits")]
    Overflow,
}

fn recip(f: &Fraction) -> Fraction {
    Fraction::new(f.denom().clone(), f.numer().clone()).unwrap_or_else(Fraction::zero)
}

// ── Internal context ────────────────────────────────────────────────────────

struct BalanceCtx<'a> {
    graph: &'a StreamGraph,
    table: RateTable,
}

impl<'a> BalanceCtx<'a> {
    fn balance_node(&self, id: StreamId) -> Result<NodeBalance> {
        let graph = self.graph;
        if let StreamKind::Filter(rates) = graph.kind(id) {
            return Ok(NodeBalance {
                rates: StreamRates {
                    init: Flow::of_phases(&rates.prework).map_err(|o| self.overflow(id, o))?,
                    steady: Flow::of_phases(&rates.phases).map_err(|o| self.overflow(id, o))?,
                },
                steady: Multiplicities {
                    children: vec![1; rates.phases.len()],
                    ..Default::default()
                },
                init: Multiplicities {
                    children: vec![1; rates.prework.len()],
                    ..Default::default()
                },
                has_init: !rates.prework.is_empty(),
            });
        }

        let local = self.table.local_graph(graph, id)?;
        let steady = match graph.kind(id) {
            StreamKind::FeedbackLoop { .. } => self.solve_feedback(id, &local)?,
            _ => self.solve_balance_ratios(id, &local)?,
        };
        let init = self.init_counts(id, &local, &steady)?;
        let rates = local
            .outer_rates(&steady, &init)
            .map_err(|o| self.overflow(id, o))?;
        let has_init = init.iter().any(|&n| n > 0) || local.actors.iter().any(|a| a.has_init);

        debug!(
            stream = graph.name(id),
            kind = graph.kind(id).label(),
            ?steady,
            ?init,
            "balanced container"
        );
        Ok(NodeBalance {
            rates,
            steady: Multiplicities::from_actors(&local, &steady),
            init: Multiplicities::from_actors(&local, &init),
            has_init,
        })
    }

    /// Primitive firings below `id` across its init and one steady
    /// execution, when `id` itself runs `times` such executions, must stay
    /// in range so schedules and simulations can count them.
    fn check_program_totals(&self, id: StreamId, times: u64) -> Result<()> {
        let node = self.table.node(id)?;
        let span = |steady: u64, init: u64, own_init: bool| {
            steady
                .checked_add(init)
                .and_then(|n| n.checked_add(u64::from(own_init)))
                .and_then(|n| n.checked_mul(times))
                .ok_or_else(|| self.overflow(id, Overflow))
        };
        if let StreamKind::Filter(rates) = self.graph.kind(id) {
            span(rates.phases.len() as u64, rates.prework.len() as u64, false)?;
            return Ok(());
        }
        let parts = [
            (node.steady.splitter, node.init.splitter),
            (node.steady.joiner, node.init.joiner),
        ];
        for (steady, init) in parts {
            if let Some(steady) = steady {
                span(steady, init.unwrap_or(0), false)?;
            }
        }
        for (i, child) in self.graph.kind(id).children().into_iter().enumerate() {
            let steady = node.steady.children.get(i).copied().unwrap_or(0);
            let init = node.init.children.get(i).copied().unwrap_or(0);
            let child_init = self.table.node(child)?.has_init;
            self.check_program_totals(child, span(steady, init, child_init)?)?;
        }
        Ok(())
    }

    fn slot_name(&self, id: StreamId, slot: Slot) -> String {
        match slot {
            Slot::Child(i) => self
                .graph
                .kind(id)
                .children()
                .get(i)
                .map(|&c| self.graph.name(c).to_string())
                .unwrap_or_else(|| format!("child {i}")),
            Slot::Splitter => format!("{}.splitter", self.graph.name(id)),
            Slot::Joiner => format!("{}.joiner", self.graph.name(id)),
        }
    }

    fn unschedulable(&self, id: StreamId, detail: String) -> ScheduleError {
        ScheduleError::UnschedulableRate {
            stream: self.graph.name(id).to_string(),
            detail,
        }
    }

    /// Ratio propagation over the container's channels, then verification
    /// and one LCM/GCD normalization.
    fn solve_balance_ratios(&self, id: StreamId, local: &LocalGraph) -> Result<Vec<u64>> {
        let n = local.actors.len();
        let mut ratio: Vec<Option<Fraction>> = vec![None; n];
        let mut queue = VecDeque::new();

        for start in 0..n {
            if ratio[start].is_some() {
                continue;
            }
            ratio[start] = Some(Fraction::one());
            queue.push_back(start);

            while let Some(current) = queue.pop_front() {
                let Some(cur) = ratio[current].clone() else {
                    continue;
                };
                for channel in &local.channels {
                    let p = local.actors[channel.src].steady.push[channel.src_port];
                    let c = local.actors[channel.dst].steady.pop[channel.dst_port];
                    let (neighbor, next) = if channel.src == current {
                        (channel.dst, cur.scale(p, c))
                    } else if channel.dst == current {
                        (channel.src, cur.scale(c, p))
                    } else {
                        continue;
                    };
                    if p == 0 && c == 0 {
                        continue;
                    }
                    if p == 0 || c == 0 {
                        return Err(self.unschedulable(
                            id,
                            format!(
                                "{} produces {p} items per firing but {} consumes {c}",
                                self.slot_name(id, local.actors[channel.src].slot),
                                self.slot_name(id, local.actors[channel.dst].slot),
                            ),
                        ));
                    }
                    if ratio[neighbor].is_none() {
                        ratio[neighbor] = next;
                        queue.push_back(neighbor);
                    }
                }
            }
        }

        let fractions: Vec<Fraction> = ratio
            .into_iter()
            .map(|r| r.unwrap_or_else(Fraction::one))
            .collect();
        self.verify_balance_equations(id, local, &fractions)?;

        let counts = normalize_to_integers(&fractions)
            .into_iter()
            .map(|v| {
                Fraction::from_integer(v)
                    .to_u64()
                    .ok_or_else(|| ScheduleError::RateOverflow {
                        stream: self.graph.name(id).to_string(),
                    })
            })
            .collect::<Result<Vec<u64>>>()?;
        if let Some(pos) = counts.iter().position(|&m| m == 0) {
            return Err(ScheduleError::internal(format!(
                "non-positive multiplicity for {} in '{}'",
                self.slot_name(id, local.actors[pos].slot),
                self.graph.name(id)
            )));
        }
        trace!(stream = self.graph.name(id), ?counts, "balance ratios");
        Ok(counts)
    }

    fn verify_balance_equations(
        &self,
        id: StreamId,
        local: &LocalGraph,
        ratio: &[Fraction],
    ) -> Result<()> {
        for channel in &local.channels {
            let p = local.actors[channel.src].steady.push[channel.src_port];
            let c = local.actors[channel.dst].steady.pop[channel.dst_port];
            let produced = ratio[channel.src].scale(p, 1);
            let consumed = ratio[channel.dst].scale(c, 1);
            if produced == consumed {
                continue;
            }
            return Err(self.unschedulable(
                id,
                format!(
                    "balance equation fails between {} (pushes {p}) and {} (pops {c}): \
                     branches disagree on the period",
                    self.slot_name(id, local.actors[channel.src].slot),
                    self.slot_name(id, local.actors[channel.dst].slot),
                ),
            ));
        }
        Ok(())
    }

    fn solve_feedback(&self, id: StreamId, local: &LocalGraph) -> Result<Vec<u64>> {
        let Some(cycle) = FeedbackBalance::from_local(local) else {
            return Err(ScheduleError::internal(format!(
                "feedback loop '{}' is missing a part",
                self.graph.name(id)
            )));
        };
        let counts = cycle.solve().map_err(|err| match err {
            CycleError::Unbalanced(detail) => self.unschedulable(id, detail),
            CycleError::Overflow => self.overflow(id, Overflow),
        })?;
        // Actor order: joiner, body, splitter, loop path.
        Ok(vec![
            counts.joiner,
            counts.body,
            counts.splitter,
            counts.loop_path,
        ])
    }

    fn overflow(&self, id: StreamId, _: Overflow) -> ScheduleError {
        ScheduleError::RateOverflow {
            stream: self.graph.name(id).to_string(),
        }
    }

    fn init_failed(&self, id: StreamId, err: InitError) -> ScheduleError {
        let InitError::Starved(s) = err else {
            return self.overflow(id, Overflow);
        };
        self.unschedulable(
            id,
            format!(
                "{} produces nothing in steady state but {} needs {} items before it can start",
                self.slot_name(id, s.producer),
                self.slot_name(id, s.consumer),
                s.needed
            ),
        )
    }

    fn init_counts(&self, id: StreamId, local: &LocalGraph, steady: &[u64]) -> Result<Vec<u64>> {
        let Some(loop_actor) = local.feedback_source() else {
            let counts = local.init_counts(&[]).map_err(|e| self.init_failed(id, e))?;
            local
                .check_traffic(&counts, steady)
                .map_err(|o| self.overflow(id, o))?;
            let mut levels = local.initial_levels();
            let init_ok = local
                .sequence(&local.init_work(&counts), &mut levels, Order::UpstreamFirst)
                .is_some();
            let steady_ok = init_ok
                && local
                    .sequence(&local.steady_work(steady), &mut levels, Order::Blocked)
                    .is_some();
            if !steady_ok {
                return Err(ScheduleError::internal(format!(
                    "initialization of '{}' leaves internal buffers short",
                    self.graph.name(id)
                )));
            }
            return Ok(counts);
        };

        let bound = steady[loop_actor]
            .checked_mul(2)
            .and_then(|b| b.checked_add(1))
            .ok_or_else(|| self.overflow(id, Overflow))?;
        for extra in 0..=bound {
            let counts = local
                .init_counts(&[(loop_actor, extra)])
                .map_err(|e| self.init_failed(id, e))?;
            local
                .check_traffic(&counts, steady)
                .map_err(|o| self.overflow(id, o))?;
            let mut levels = local.initial_levels();
            let runs_init = local
                .levels_after_init(&counts)
                .map_err(|o| self.overflow(id, o))?
                .is_some()
                && local
                    .sequence(&local.init_work(&counts), &mut levels, Order::UpstreamFirst)
                    .is_some();
            if runs_init
                && local
                    .sequence(&local.steady_work(steady), &mut levels, Order::DownstreamFirst)
                    .is_some()
            {
                debug!(
                    stream = self.graph.name(id),
                    extra_loop_firings = extra,
                    "feedback loop initialized"
                );
                return Ok(counts);
            }
        }
        let delay = match self.graph.kind(id) {
            StreamKind::FeedbackLoop { delay, .. } => *delay,
            _ => 0,
        };
        Err(ScheduleError::InsufficientDelay {
            stream: self.graph.name(id).to_string(),
            delay,
            detail: format!(
                "no initialization lets the cycle complete a steady period \
                 (tried up to {bound} extra loop-path firings)"
            ),
        })
    }
}

// ── Display ─────────────────────────────────────────────────────────────────

pub struct RateTableDisplay<'a> {
    table: &'a RateTable,
    graph: &'a StreamGraph,
}

impl fmt::Display for RateTableDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_node(f, self.graph.root(), 0, None)
    }
}

impl RateTableDisplay<'_> {
    fn write_node(
        &self,
        f: &mut fmt::Formatter<'_>,
        id: StreamId,
        depth: usize,
        counts: Option<(u64, u64)>,
    ) -> fmt::Result {
        let indent = "  ".repeat(depth);
        let Some(node) = self.table.get(id) else {
            return writeln!(f, "{indent}{} [unbalanced]", self.graph.name(id));
        };
        let counts = counts
            .map(|(m, n)| format!(" x{m} +{n}"))
            .unwrap_or_default();
        writeln!(
            f,
            "{indent}{} [{}]{counts} steady {} init {}",
            self.graph.name(id),
            self.graph.kind(id).label(),
            flow_text(node.rates.steady),
            flow_text(node.rates.init),
        )?;
        let part = |slot: Slot| {
            (
                node.steady.get(slot).unwrap_or(0),
                node.init.get(slot).unwrap_or(0),
            )
        };
        let name = self.graph.name(id);
        let inner = "  ".repeat(depth + 1);
        match self.graph.kind(id) {
            StreamKind::Filter(_) => Ok(()),
            StreamKind::Pipeline { children } => {
                for (i, &c) in children.iter().enumerate() {
                    self.write_node(f, c, depth + 1, Some(part(Slot::Child(i))))?;
                }
                Ok(())
            }
            StreamKind::SplitJoin { branches, .. } => {
                let (m, n) = part(Slot::Splitter);
                writeln!(f, "{inner}{name}.splitter x{m} +{n}")?;
                for (i, &c) in branches.iter().enumerate() {
                    self.write_node(f, c, depth + 1, Some(part(Slot::Child(i))))?;
                }
                let (m, n) = part(Slot::Joiner);
                writeln!(f, "{inner}{name}.joiner x{m} +{n}")
            }
            StreamKind::FeedbackLoop {
                body, loop_path, ..
            } => {
                let (m, n) = part(Slot::Joiner);
                writeln!(f, "{inner}{name}.joiner x{m} +{n}")?;
                self.write_node(f, *body, depth + 1, Some(part(Slot::Child(0))))?;
                let (m, n) = part(Slot::Splitter);
                writeln!(f, "{inner}{name}.splitter x{m} +{n}")?;
                self.write_node(f, *loop_path, depth + 1, Some(part(Slot::Child(1))))
            }
        }
    }
}

fn flow_text(flow: Flow) -> String {
    format!("{}/{}/{}", flow.peek, flow.pop, flow.push)
}
