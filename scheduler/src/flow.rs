// flow.rs — Token-flow accounting inside one container
//
// A container's direct children (plus its splitter and joiner, if any) form
// a small dataflow graph of "actors" joined by internal channels. This
// module models that graph: how many extra firings initialization needs,
// what the buffers hold afterwards, and in which order a set of firings can
// run without reading past the end of a buffer.
//
// Preconditions: child rates were computed bottom-up before the container.
// Postconditions: actors are stored in data-flow order, so every
//                 non-feedback channel runs from a lower to a higher index.
// Failure modes: `init_counts` reports a producer that can never satisfy its
//                consumer; `sequence` returns None when firings stall; any
//                count or item total beyond u64 reports `Overflow`.
// Side effects: none.

use serde::Serialize;

use crate::stream::{Rate, StreamKind};

// ── Public types ────────────────────────────────────────────────────────────

/// Items observed at a node's outer ports during one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Flow {
    pub peek: u64,
    pub pop: u64,
    pub push: u64,
}

impl Flow {
    /// Sequential composition of phases.
    pub fn of_phases(phases: &[Rate]) -> Result<Flow, Overflow> {
        let mut flow = Flow::default();
        for rate in phases {
            flow.peek = flow.peek.max(add(flow.pop, rate.peek)?);
            flow.pop = add(flow.pop, rate.pop)?;
            flow.push = add(flow.push, rate.push)?;
        }
        Ok(flow)
    }

    /// `times` back-to-back executions.
    pub fn repeated(self, times: u64) -> Result<Flow, Overflow> {
        if times == 0 {
            return Ok(Flow::default());
        }
        Ok(Flow {
            peek: add(mul(times - 1, self.pop)?, self.peek)?,
            pop: mul(times, self.pop)?,
            push: mul(times, self.push)?,
        })
    }
}

/// An item count or firing count that does not fit in a `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow;

fn add(a: u64, b: u64) -> Result<u64, Overflow> {
    a.checked_add(b).ok_or(Overflow)
}

fn mul(a: u64, b: u64) -> Result<u64, Overflow> {
    a.checked_mul(b).ok_or(Overflow)
}

/// Init and steady flows of one stream node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StreamRates {
    pub init: Flow,
    pub steady: Flow,
}

/// Execution stage of a firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Stage {
    Init,
    Steady,
}

/// Position of an actor within its container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Slot {
    Child(usize),
    Splitter,
    Joiner,
}

/// What a container needs to know about each direct child.
#[derive(Debug, Clone, Copy)]
pub struct ChildRates {
    pub rates: StreamRates,
    /// True if the child's init schedule fires anything.
    pub has_init: bool,
}

// ── Local dataflow graph ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub(crate) struct PortFlows {
    pub peek: Vec<u64>,
    pub pop: Vec<u64>,
    pub push: Vec<u64>,
}

impl PortFlows {
    fn single(flow: Flow) -> Self {
        PortFlows {
            peek: vec![flow.peek],
            pop: vec![flow.pop],
            push: vec![flow.push],
        }
    }

    fn zeros(inputs: usize, outputs: usize) -> Self {
        PortFlows {
            peek: vec![0; inputs],
            pop: vec![0; inputs],
            push: vec![0; outputs],
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct LocalActor {
    pub slot: Slot,
    pub init: PortFlows,
    pub steady: PortFlows,
    pub has_init: bool,
    /// Channel per input port; `None` is the container's own input.
    pub inputs: Vec<Option<usize>>,
    /// Channel per output port; `None` is the container's own output.
    pub outputs: Vec<Option<usize>>,
}

impl LocalActor {
    fn flows(&self, stage: Stage) -> &PortFlows {
        match stage {
            Stage::Init => &self.init,
            Stage::Steady => &self.steady,
        }
    }

    /// Items that must sit on input `port` before this actor runs its init
    /// and `extra` steady firings, with enough left over for its first
    /// steady firing afterwards.
    fn needed_on(&self, port: usize, extra: u64) -> Result<u64, Overflow> {
        let (ipk, ip) = (self.init.peek[port], self.init.pop[port]);
        let (spk, sp) = (self.steady.peek[port], self.steady.pop[port]);
        Ok(ipk.max(add(add(ip, mul(extra, sp)?)?, spk.saturating_sub(sp))?))
    }

    /// Items pushed on output `port` by the init stage plus `times` steady
    /// firings.
    fn pushed(&self, port: usize, times: u64) -> Result<u64, Overflow> {
        add(self.init.push[port], mul(times, self.steady.push[port])?)
    }

    /// Items popped from input `port` by the init stage plus `times` steady
    /// firings.
    fn popped(&self, port: usize, times: u64) -> Result<u64, Overflow> {
        add(self.init.pop[port], mul(times, self.steady.pop[port])?)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct LocalChannel {
    pub src: usize,
    pub src_port: usize,
    pub dst: usize,
    pub dst_port: usize,
    pub initial: u64,
    pub feedback: bool,
}

/// Remaining firings of one actor.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Work {
    pub init: bool,
    pub steady: u64,
}

/// Consecutive firings of one actor in one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Run {
    pub actor: usize,
    pub stage: Stage,
    pub times: u64,
}

/// Firing-order policy for `LocalGraph::sequence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Order {
    /// Each actor once, in data-flow order, with all of its work.
    Blocked,
    /// One firing at a time, preferring the most upstream ready actor.
    UpstreamFirst,
    /// One firing at a time, preferring the most downstream ready actor.
    DownstreamFirst,
}

/// A producer whose steady output is zero but whose consumer still needs data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Starved {
    pub producer: Slot,
    pub consumer: Slot,
    pub needed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InitError {
    Starved(Starved),
    Overflow,
}

impl From<Overflow> for InitError {
    fn from(_: Overflow) -> Self {
        InitError::Overflow
    }
}

#[derive(Debug, Clone)]
pub(crate) struct LocalGraph {
    pub actors: Vec<LocalActor>,
    pub channels: Vec<LocalChannel>,
    /// Actor reading the container's input on port 0.
    pub top: usize,
    /// Actor and port writing the container's output.
    pub bottom: (usize, usize),
}

impl LocalGraph {
    /// Build the local graph of a container. `children` are indexed like
    /// `StreamKind::children()`.
    pub fn new(kind: &StreamKind, children: &[ChildRates]) -> LocalGraph {
        let mut graph = LocalGraph {
            actors: Vec::new(),
            channels: Vec::new(),
            top: 0,
            bottom: (0, 0),
        };
        match kind {
            StreamKind::Filter(_) => {}
            StreamKind::Pipeline { .. } => {
                for (i, child) in children.iter().enumerate() {
                    graph.add_child(i, child);
                }
                for i in 1..children.len() {
                    graph.connect(i - 1, 0, i, 0, 0, false);
                }
                graph.bottom = (children.len().saturating_sub(1), 0);
            }
            StreamKind::SplitJoin {
                splitter, joiner, ..
            } => {
                let k = children.len();
                graph.actors.push(LocalActor {
                    slot: Slot::Splitter,
                    init: PortFlows::zeros(1, k),
                    steady: PortFlows {
                        peek: vec![splitter.pop()],
                        pop: vec![splitter.pop()],
                        push: (0..k).map(|p| splitter.push(p)).collect(),
                    },
                    has_init: false,
                    inputs: vec![None],
                    outputs: vec![None; k],
                });
                for (i, child) in children.iter().enumerate() {
                    graph.add_child(i, child);
                }
                graph.actors.push(joiner_actor(&joiner.weights));
                for i in 0..k {
                    graph.connect(0, i, 1 + i, 0, 0, false);
                    graph.connect(1 + i, 0, k + 1, i, 0, false);
                }
                graph.bottom = (k + 1, 0);
            }
            StreamKind::FeedbackLoop {
                joiner,
                splitter,
                delay,
                ..
            } => {
                graph.actors.push(joiner_actor(&joiner.weights));
                if let Some(body) = children.first() {
                    graph.add_child(0, body);
                }
                graph.actors.push(LocalActor {
                    slot: Slot::Splitter,
                    init: PortFlows::zeros(1, 2),
                    steady: PortFlows {
                        peek: vec![splitter.pop()],
                        pop: vec![splitter.pop()],
                        push: vec![splitter.push(0), splitter.push(1)],
                    },
                    has_init: false,
                    inputs: vec![None],
                    outputs: vec![None, None],
                });
                if let Some(loop_path) = children.get(1) {
                    graph.add_child(1, loop_path);
                }
                graph.connect(0, 0, 1, 0, 0, false);
                graph.connect(1, 0, 2, 0, 0, false);
                graph.connect(2, 1, 3, 0, 0, false);
                graph.connect(3, 0, 0, 1, *delay, true);
                graph.bottom = (2, 0);
            }
        }
        graph
    }

    fn add_child(&mut self, index: usize, child: &ChildRates) {
        self.actors.push(LocalActor {
            slot: Slot::Child(index),
            init: PortFlows::single(child.rates.init),
            steady: PortFlows::single(child.rates.steady),
            has_init: child.has_init,
            inputs: vec![None],
            outputs: vec![None],
        });
    }

    fn connect(
        &mut self,
        src: usize,
        src_port: usize,
        dst: usize,
        dst_port: usize,
        initial: u64,
        feedback: bool,
    ) {
        let id = self.channels.len();
        self.channels.push(LocalChannel {
            src,
            src_port,
            dst,
            dst_port,
            initial,
            feedback,
        });
        self.actors[src].outputs[src_port] = Some(id);
        self.actors[dst].inputs[dst_port] = Some(id);
    }

    pub fn position(&self, slot: Slot) -> Option<usize> {
        self.actors.iter().position(|a| a.slot == slot)
    }

    /// Index of the feedback-path actor, if this is a feedback loop.
    pub fn feedback_source(&self) -> Option<usize> {
        self.channels.iter().find(|c| c.feedback).map(|c| c.src)
    }

    // ── Initialization ──

    /// Extra steady firings per actor needed before the steady state can
    /// start in blocked order. Actors listed in `fixed` keep the given count;
    /// every other actor fires just enough to satisfy its consumers.
    pub fn init_counts(&self, fixed: &[(usize, u64)]) -> Result<Vec<u64>, InitError> {
        let mut counts = vec![0u64; self.actors.len()];
        for &(actor, n) in fixed {
            counts[actor] = n;
        }
        for a in (0..self.actors.len()).rev() {
            if fixed.iter().any(|&(f, _)| f == a) {
                continue;
            }
            let actor = &self.actors[a];
            let mut extra = 0u64;
            for (port, out) in actor.outputs.iter().enumerate() {
                let Some(c) = *out else { continue };
                let channel = &self.channels[c];
                if channel.feedback {
                    continue;
                }
                let consumer = &self.actors[channel.dst];
                let needed = consumer.needed_on(channel.dst_port, counts[channel.dst])?;
                let supply = add(channel.initial, actor.init.push[port])?;
                if needed <= supply {
                    continue;
                }
                let rate = actor.steady.push[port];
                if rate == 0 {
                    return Err(InitError::Starved(Starved {
                        producer: actor.slot,
                        consumer: consumer.slot,
                        needed,
                    }));
                }
                extra = extra.max((needed - supply).div_ceil(rate));
            }
            counts[a] = extra;
        }
        Ok(counts)
    }

    /// Channel occupancies after every actor ran its init and `counts` extra
    /// steady firings. Inner None if some channel would go negative.
    pub fn levels_after_init(&self, counts: &[u64]) -> Result<Option<Vec<u64>>, Overflow> {
        let mut levels = Vec::with_capacity(self.channels.len());
        for c in &self.channels {
            let produced = self.actors[c.src].pushed(c.src_port, counts[c.src])?;
            let consumed = self.actors[c.dst].popped(c.dst_port, counts[c.dst])?;
            match add(c.initial, produced)?.checked_sub(consumed) {
                Some(level) => levels.push(level),
                None => return Ok(None),
            }
        }
        Ok(Some(levels))
    }

    /// Checks that running the init stages, `init` extra firings and then
    /// `steady` firings of every actor keeps all item totals in range, so
    /// `sequence` can track buffer levels without overflowing.
    pub fn check_traffic(&self, init: &[u64], steady: &[u64]) -> Result<(), Overflow> {
        for c in &self.channels {
            let src = &self.actors[c.src];
            let dst = &self.actors[c.dst];
            add(c.initial, src.pushed(c.src_port, add(init[c.src], steady[c.src])?)?)?;
            let popped = dst.popped(c.dst_port, add(init[c.dst], steady[c.dst])?)?;
            add(popped, dst.init.peek[c.dst_port].max(dst.steady.peek[c.dst_port]))?;
        }
        Ok(())
    }

    pub fn initial_levels(&self) -> Vec<u64> {
        self.channels.iter().map(|c| c.initial).collect()
    }

    pub fn init_work(&self, counts: &[u64]) -> Vec<Work> {
        self.actors
            .iter()
            .zip(counts)
            .map(|(a, &n)| Work {
                init: a.has_init,
                steady: n,
            })
            .collect()
    }

    pub fn steady_work(&self, multiplicities: &[u64]) -> Vec<Work> {
        multiplicities
            .iter()
            .map(|&n| Work {
                init: false,
                steady: n,
            })
            .collect()
    }

    // ── Outer flows ──

    /// Flows at the container's own ports, given steady multiplicities and
    /// init extra counts of its actors.
    pub fn outer_rates(&self, steady: &[u64], init: &[u64]) -> Result<StreamRates, Overflow> {
        let top = &self.actors[self.top];
        let (spk, sp) = (top.steady.peek[0], top.steady.pop[0]);
        let (ipk, ip) = (top.init.peek[0], top.init.pop[0]);
        let m = steady[self.top];
        let n = init[self.top];
        let (b, port) = self.bottom;
        let bottom = &self.actors[b];
        let steady_in = Flow {
            peek: spk,
            pop: sp,
            push: 0,
        }
        .repeated(m)?;
        let init_peek = if n > 0 {
            ipk.max(add(add(ip, mul(n - 1, sp)?)?, spk)?)
        } else {
            ipk
        };
        Ok(StreamRates {
            init: Flow {
                peek: init_peek,
                pop: top.popped(0, n)?,
                push: bottom.pushed(port, init[b])?,
            },
            steady: Flow {
                peek: steady_in.peek,
                pop: steady_in.pop,
                push: mul(steady[b], bottom.steady.push[port])?,
            },
        })
    }

    // ── Sequencing ──

    fn can_fire(&self, actor: usize, stage: Stage, levels: &[u64], times: u64) -> bool {
        if times == 0 {
            return true;
        }
        let a = &self.actors[actor];
        let flows = a.flows(stage);
        a.inputs.iter().enumerate().all(|(port, input)| match input {
            Some(c) => mul(times - 1, flows.pop[port])
                .and_then(|n| add(n, flows.peek[port]))
                .is_ok_and(|need| levels[*c] >= need),
            None => true,
        })
    }

    fn fire(&self, actor: usize, stage: Stage, levels: &mut [u64], times: u64) {
        let a = &self.actors[actor];
        let flows = a.flows(stage);
        for (port, input) in a.inputs.iter().enumerate() {
            if let Some(c) = input {
                levels[*c] = levels[*c].saturating_sub(times.saturating_mul(flows.pop[port]));
            }
        }
        for (port, output) in a.outputs.iter().enumerate() {
            if let Some(c) = output {
                levels[*c] = levels[*c].saturating_add(times.saturating_mul(flows.push[port]));
            }
        }
    }

    /// Order `work` so that every firing finds its input available, updating
    /// `levels` in place. Returns None if the firings stall.
    pub fn sequence(&self, work: &[Work], levels: &mut [u64], order: Order) -> Option<Vec<Run>> {
        let mut pending = work.to_vec();
        let mut runs: Vec<Run> = Vec::new();

        if order == Order::Blocked {
            for a in 0..self.actors.len() {
                if pending[a].init {
                    if !self.can_fire(a, Stage::Init, levels, 1) {
                        return None;
                    }
                    self.fire(a, Stage::Init, levels, 1);
                    push_run(&mut runs, a, Stage::Init, 1);
                }
                let times = pending[a].steady;
                if times > 0 {
                    if !self.can_fire(a, Stage::Steady, levels, times) {
                        return None;
                    }
                    self.fire(a, Stage::Steady, levels, times);
                    push_run(&mut runs, a, Stage::Steady, times);
                }
            }
            return Some(runs);
        }

        let n = self.actors.len();
        loop {
            let candidates: Box<dyn Iterator<Item = usize>> = match order {
                Order::DownstreamFirst => Box::new((0..n).rev()),
                _ => Box::new(0..n),
            };
            let mut chosen = None;
            for a in candidates {
                let stage = if pending[a].init {
                    Stage::Init
                } else if pending[a].steady > 0 {
                    Stage::Steady
                } else {
                    continue;
                };
                if self.can_fire(a, stage, levels, 1) {
                    chosen = Some((a, stage));
                    break;
                }
            }
            let Some((a, stage)) = chosen else {
                let done = pending.iter().all(|w| !w.init && w.steady == 0);
                return if done { Some(runs) } else { None };
            };
            self.fire(a, stage, levels, 1);
            match stage {
                Stage::Init => pending[a].init = false,
                Stage::Steady => pending[a].steady -= 1,
            }
            push_run(&mut runs, a, stage, 1);
        }
    }
}

fn joiner_actor(weights: &[u64]) -> LocalActor {
    let k = weights.len();
    LocalActor {
        slot: Slot::Joiner,
        init: PortFlows::zeros(k, 1),
        steady: PortFlows {
            peek: weights.to_vec(),
            pop: weights.to_vec(),
            push: vec![weights.iter().sum()],
        },
        has_init: false,
        inputs: vec![None; k],
        outputs: vec![None],
    }
}

fn push_run(runs: &mut Vec<Run>, actor: usize, stage: Stage, times: u64) {
    if let Some(last) = runs.last_mut() {
        if last.actor == actor && last.stage == stage {
            last.times += times;
            return;
        }
    }
    runs.push(Run {
        actor,
        stage,
        times,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::StreamId;
    use crate::stream::{Joiner, Splitter};

    fn child(peek: u64, pop: u64, push: u64) -> ChildRates {
        ChildRates {
            rates: StreamRates {
                init: Flow::default(),
                steady: Flow { peek, pop, push },
            },
            has_init: false,
        }
    }

    fn pipeline_kind(n: usize) -> StreamKind {
        StreamKind::Pipeline {
            children: (0..n as u32).map(StreamId).collect(),
        }
    }

    #[test]
    fn phase_composition_tracks_peek_window() {
        let flow = Flow::of_phases(&[Rate::new(3, 1, 0), Rate::new(2, 2, 1)]).unwrap();
        assert_eq!(flow, Flow { peek: 3, pop: 3, push: 1 });
        assert_eq!(
            Flow { peek: 3, pop: 1, push: 2 }.repeated(4),
            Ok(Flow { peek: 6, pop: 4, push: 8 })
        );
        assert_eq!(Flow { peek: 1, pop: 1, push: 1 << 62 }.repeated(4), Err(Overflow));
    }

    #[test]
    fn pipeline_without_peeking_needs_no_init() {
        let g = LocalGraph::new(&pipeline_kind(2), &[child(0, 0, 2), child(2, 2, 1)]);
        assert_eq!(g.init_counts(&[]).unwrap(), vec![0, 0]);
    }

    #[test]
    fn peeking_consumer_forces_upstream_prefill() {
        // B peeks 3 but pops 1: A must leave 2 items behind, A pushes 1 per firing.
        let g = LocalGraph::new(&pipeline_kind(2), &[child(0, 0, 1), child(3, 1, 1)]);
        let counts = g.init_counts(&[]).unwrap();
        assert_eq!(counts, vec![2, 0]);
        assert_eq!(g.levels_after_init(&counts), Ok(Some(vec![2])));
    }

    #[test]
    fn silent_producer_cannot_feed_peeking_consumer() {
        let g = LocalGraph::new(&pipeline_kind(2), &[child(0, 0, 0), child(2, 1, 1)]);
        let Err(InitError::Starved(starved)) = g.init_counts(&[]) else {
            panic!("expected a starved producer");
        };
        assert_eq!(starved.producer, Slot::Child(0));
        assert_eq!(starved.consumer, Slot::Child(1));
    }

    #[test]
    fn splitter_fills_every_branch() {
        let kind = StreamKind::SplitJoin {
            splitter: Splitter::RoundRobin(vec![1, 2]),
            joiner: Joiner::new(vec![1, 1]),
            branches: vec![StreamId(0), StreamId(1)],
        };
        // Branch 0 peeks 4 ahead of its pop of 1; branch 1 peeks 3 ahead of 1.
        let g = LocalGraph::new(&kind, &[child(5, 1, 1), child(4, 1, 1)]);
        let counts = g.init_counts(&[]).unwrap();
        // splitter: max(ceil(4/1), ceil(3/2)) = 4
        assert_eq!(counts, vec![4, 0, 0, 0]);
    }

    #[test]
    fn greedy_orders_interleave_but_blocked_does_not() {
        let g = LocalGraph::new(
            &pipeline_kind(3),
            &[child(0, 0, 1), child(1, 1, 1), child(1, 1, 0)],
        );
        let work = g.steady_work(&[2, 2, 2]);

        let mut levels = g.initial_levels();
        let blocked = g.sequence(&work, &mut levels, Order::Blocked).unwrap();
        assert_eq!(blocked.len(), 3);

        let mut levels = g.initial_levels();
        let eager = g.sequence(&work, &mut levels, Order::DownstreamFirst).unwrap();
        let actors: Vec<usize> = eager.iter().map(|r| r.actor).collect();
        assert_eq!(actors, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(levels, vec![0, 0]);
    }

    #[test]
    fn feedback_loop_stalls_without_delay() {
        let kind = StreamKind::FeedbackLoop {
            joiner: Joiner::new(vec![1, 1]),
            body: StreamId(0),
            splitter: Splitter::RoundRobin(vec![1, 1]),
            loop_path: StreamId(1),
            delay: 0,
        };
        let g = LocalGraph::new(&kind, &[child(2, 2, 2), child(1, 1, 1)]);
        assert_eq!(g.feedback_source(), Some(3));
        let work = g.steady_work(&[1, 1, 1, 1]);
        let mut levels = g.initial_levels();
        assert!(g
            .sequence(&work, &mut levels, Order::DownstreamFirst)
            .is_none());
    }
}
