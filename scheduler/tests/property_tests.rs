// Property-based tests for scheduler invariants.
//
// Six categories:
// 1. Buffer conservation: generated pipelines and split-joins schedule and
//    leave every buffer unchanged after a steady period, under both policies
// 2. Feedback homogeneity: scaling the body's executions scales every part
// 3. SDEP composability along pipeline chains
// 4. Directional exclusivity between units of a split-join
// 5. Back-edge exclusion inside feedback loops
// 6. Nested programs: feedback loops, split-joins and pipelines inside each
//    other; certificates, delay search and reachability across scopes
//
// Uses proptest with explicit configuration to prevent CI flakiness.

use proptest::prelude::*;
use streamsched::balance::{balance, FeedbackBalance, RateTable};
use streamsched::diag::ScheduleError;
use streamsched::id::StreamId;
use streamsched::latency::LatencyGraph;
use streamsched::pass::StageCert;
use streamsched::schedule::{build_schedules, verify_schedules, PhasingPolicy};
use streamsched::sdep::SdepData;
use streamsched::simulate::check_conservation;
use streamsched::stream::{Joiner, Rate, Splitter, StreamGraph, StreamGraphBuilder};
use streamsched::topology::{Topology, WorkUnit};

// ── Generators ──────────────────────────────────────────────────────────────

/// (extra peek, pop, push) of a chain filter.
fn arb_stage() -> impl Strategy<Value = (u64, u64, u64)> {
    (0u64..=2, 1u64..=4, 1u64..=4)
}

/// Source, chain stages, optional split-join, sink.
#[derive(Debug, Clone)]
struct ProgramShape {
    source_push: u64,
    stages: Vec<(u64, u64, u64)>,
    /// (splitter weight, joiner weight, rate multiplier) per branch.
    branches: Vec<(u64, u64, u64)>,
    sink_pop: u64,
}

fn arb_program() -> impl Strategy<Value = ProgramShape> {
    (
        1u64..=3,
        prop::collection::vec(arb_stage(), 1..=4),
        prop::collection::vec((1u64..=3, 1u64..=3, 1u64..=2), 0..=3),
        1u64..=3,
    )
        .prop_map(|(source_push, stages, branches, sink_pop)| ProgramShape {
            source_push,
            stages,
            branches,
            sink_pop,
        })
}

fn build_program(shape: &ProgramShape) -> StreamGraph {
    let mut b = StreamGraphBuilder::new();
    let mut children = vec![b.filter("Src", Rate::new(0, 0, shape.source_push))];
    for (i, &(extra, pop, push)) in shape.stages.iter().enumerate() {
        children.push(b.filter(format!("F{i}"), Rate::new(pop + extra, pop, push)));
    }
    if shape.branches.len() >= 2 {
        let branches = shape
            .branches
            .iter()
            .enumerate()
            .map(|(i, &(w, v, c))| b.filter(format!("B{i}"), Rate::new(w * c, w * c, v * c)))
            .collect();
        let split = shape.branches.iter().map(|&(w, _, _)| w).collect();
        let join = shape.branches.iter().map(|&(_, v, _)| v).collect();
        children.push(b.split_join(
            "SJ",
            Splitter::RoundRobin(split),
            Joiner::new(join),
            branches,
        ));
    }
    children.push(b.filter("Sink", Rate::new(shape.sink_pop, shape.sink_pop, 0)));
    let main = b.pipeline("Main", children);
    b.build(main).unwrap()
}

/// A feedback cycle whose round trip is balanced by construction.
fn arb_feedback() -> impl Strategy<Value = FeedbackBalance> {
    (1u64..=3, 1u64..=3, 1u64..=3, 1u64..=3, 1u64..=3, 1u64..=3).prop_map(
        |(s0, s1, j0, j1, loop_pop, loop_push)| FeedbackBalance {
            body_pop: s1 * loop_push * (j0 + j1),
            body_push: (s0 + s1) * loop_pop * j1,
            loop_pop,
            loop_push,
            split_push: s1,
            split_pop: s0 + s1,
            join_pop: j1,
            join_push: j0 + j1,
        },
    )
}

// ── 1. Conservation ─────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn generated_programs_conserve_buffers(shape in arb_program()) {
        let g = build_program(&shape);
        let topo = Topology::build(&g);
        let table = balance(&g).unwrap();
        for policy in [PhasingPolicy::SingleAppearance, PhasingPolicy::MinLatency] {
            let s = build_schedules(&g, &table, policy).unwrap();
            let report = check_conservation(&g, &topo, &s).unwrap();
            prop_assert!(report.all_conserved(), "{:?} under {:?}", report, policy);
            let cert = verify_schedules(&g, &topo, &table, &s);
            prop_assert!(cert.all_pass(), "{:?}", cert.obligations());
        }
    }

    // ── 2. Homogeneity ──

    #[test]
    fn feedback_scaling_is_homogeneous(cycle in arb_feedback(), k in 1u64..=5) {
        let base = cycle.solve().unwrap();
        prop_assert_eq!(cycle.for_body_executions(k * base.body), Some(base.scaled(k)));
    }
}

// ── 3. Composability ────────────────────────────────────────────────────────

fn chain(stages: &[(u64, u64, u64)]) -> (StreamGraph, Vec<WorkUnit>) {
    let mut b = StreamGraphBuilder::new();
    let ids: Vec<_> = stages
        .iter()
        .enumerate()
        .map(|(i, &(extra, pop, push))| b.filter(format!("F{i}"), Rate::new(pop + extra, pop, push)))
        .collect();
    let main = b.pipeline("Main", ids.clone());
    let g = b.build(main).unwrap();
    (g, ids.into_iter().map(WorkUnit::Filter).collect())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 48,
        max_shrink_iters: 100,
        .. ProptestConfig::default()
    })]

    #[test]
    fn sdep_composes_along_a_chain(
        stages in prop::collection::vec(arb_stage(), 3..=5),
        picks in (0usize..5, 0usize..5, 0usize..5),
    ) {
        let (g, units) = chain(&stages);
        let mut idx = [picks.0 % units.len(), picks.1 % units.len(), picks.2 % units.len()];
        idx.sort();
        let [up, mid, down] = idx.map(|i| units[i]);

        let lat = LatencyGraph::build(&g, &Topology::build(&g)).unwrap();
        let whole = lat.compute_sdep(up, down).unwrap();
        let first = lat.compute_sdep(up, mid).unwrap();
        let second = lat.compute_sdep(mid, down).unwrap();
        let composed = SdepData::compose(&first, &second);
        for n in 0..60 {
            prop_assert_eq!(whole.src_for_dst(n), first.src_for_dst(second.src_for_dst(n)));
            prop_assert_eq!(whole.src_for_dst(n), composed.src_for_dst(n));
        }
    }

    // ── 4. Directional exclusivity ──

    #[test]
    fn direction_is_exclusive(
        weights in prop::collection::vec((1u64..=3, 1u64..=3), 2..=4),
        tail in arb_stage(),
    ) {
        let mut b = StreamGraphBuilder::new();
        let src = b.filter("Src", Rate::new(0, 0, 1));
        let branches: Vec<_> = weights
            .iter()
            .enumerate()
            .map(|(i, &(w, v))| b.filter(format!("B{i}"), Rate::new(w, w, v)))
            .collect();
        let sj = b.split_join(
            "SJ",
            Splitter::RoundRobin(weights.iter().map(|&(w, _)| w).collect()),
            Joiner::new(weights.iter().map(|&(_, v)| v).collect()),
            branches.clone(),
        );
        let (extra, pop, push) = tail;
        let after = b.filter("Tail", Rate::new(pop + extra, pop, push));
        let main = b.pipeline("Main", vec![src, sj, after]);
        let g = b.build(main).unwrap();
        let topo = Topology::build(&g);
        let lat = LatencyGraph::build(&g, &topo).unwrap();

        for &a in topo.units() {
            for &c in topo.units() {
                let down = lat.is_downstream_path(a, c).unwrap();
                let up = lat.is_upstream_path(a, c).unwrap();
                prop_assert!(!(down && up), "{} and {} related both ways", a, c);
            }
        }
        for (i, &x) in branches.iter().enumerate() {
            for &y in &branches[i + 1..] {
                let (x, y) = (WorkUnit::Filter(x), WorkUnit::Filter(y));
                prop_assert!(!lat.is_downstream_path(x, y).unwrap());
                prop_assert!(!lat.is_upstream_path(x, y).unwrap());
            }
        }
    }

    // ── 5. Back-edge exclusion ──

    #[test]
    fn loop_joiner_is_never_downstream_of_its_splitter(
        cycle in arb_feedback(),
        delay in 1u64..=8,
    ) {
        let mut b = StreamGraphBuilder::new();
        let src = b.filter("Src", Rate::new(0, 0, 1));
        let body = b.filter("Body", Rate::new(cycle.body_pop, cycle.body_pop, cycle.body_push));
        let back = b.filter("Back", Rate::new(cycle.loop_pop, cycle.loop_pop, cycle.loop_push));
        let fl = b.feedback_loop(
            "Loop",
            Joiner::new(vec![cycle.join_push - cycle.join_pop, cycle.join_pop]),
            body,
            Splitter::RoundRobin(vec![cycle.split_pop - cycle.split_push, cycle.split_push]),
            back,
            delay,
        );
        let main = b.pipeline("Main", vec![src, fl]);
        let g = b.build(main).unwrap();
        let lat = LatencyGraph::build(&g, &Topology::build(&g)).unwrap();

        let splitter = WorkUnit::Splitter(fl);
        let joiner = WorkUnit::Joiner(fl);
        prop_assert!(lat.edges_between(splitter, joiner).unwrap().is_empty());
        prop_assert!(!lat.is_downstream_path(splitter, joiner).unwrap());
        prop_assert!(lat.is_upstream_path(splitter, joiner).unwrap());
        prop_assert!(!lat.is_downstream_path(WorkUnit::Filter(back), WorkUnit::Filter(body)).unwrap());
    }
}

// ── 6. Nested programs ──────────────────────────────────────────────────────

/// Every shape moves items one-for-one over a steady period, so any nesting
/// of them balances.
#[derive(Debug, Clone)]
enum Shape {
    Filter {
        extra: u64,
        rate: u64,
    },
    Pipeline(Vec<Shape>),
    /// (splitter and joiner weight, branch) per branch.
    SplitJoin(Vec<(u64, Shape)>),
    /// Joiner and splitter both use weights `[input, back]`.
    Loop {
        input: u64,
        back: u64,
        body: Box<Shape>,
        path: Box<Shape>,
        slack: u64,
    },
}

fn arb_shape() -> impl Strategy<Value = Shape> {
    let leaf = (0u64..=2, 1u64..=2).prop_map(|(extra, rate)| Shape::Filter { extra, rate });
    leaf.prop_recursive(3, 12, 3, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 1..=3).prop_map(Shape::Pipeline),
            prop::collection::vec((1u64..=2, inner.clone()), 2..=3).prop_map(Shape::SplitJoin),
            (1u64..=2, 1u64..=2, inner.clone(), inner, 1u64..=8).prop_map(
                |(input, back, body, path, slack)| Shape::Loop {
                    input,
                    back,
                    body: Box::new(body),
                    path: Box::new(path),
                    slack,
                }
            ),
        ]
    })
}

#[derive(Debug, Clone, Copy)]
struct LoopInfo {
    id: StreamId,
    back: u64,
    slack: u64,
}

/// Delay of the `index`-th loop built, given its generated slack.
type DelayFn<'a> = &'a dyn Fn(usize, u64) -> u64;

struct NestedBuilder<'a> {
    b: StreamGraphBuilder,
    next_name: usize,
    loops: Vec<LoopInfo>,
    delay: DelayFn<'a>,
}

impl NestedBuilder<'_> {
    fn name(&mut self, prefix: &str) -> String {
        self.next_name += 1;
        format!("{prefix}{}", self.next_name)
    }

    fn add(&mut self, shape: &Shape) -> StreamId {
        match shape {
            Shape::Filter { extra, rate } => {
                let name = self.name("F");
                self.b.filter(name, Rate::new(rate + extra, *rate, *rate))
            }
            Shape::Pipeline(children) => {
                let ids = children.iter().map(|c| self.add(c)).collect();
                let name = self.name("P");
                self.b.pipeline(name, ids)
            }
            Shape::SplitJoin(branches) => {
                let ids = branches.iter().map(|(_, c)| self.add(c)).collect();
                let weights: Vec<u64> = branches.iter().map(|&(w, _)| w).collect();
                let name = self.name("SJ");
                self.b.split_join(
                    name,
                    Splitter::RoundRobin(weights.clone()),
                    Joiner::new(weights),
                    ids,
                )
            }
            Shape::Loop {
                input,
                back,
                body,
                path,
                slack,
            } => {
                let body = self.add(body);
                let path = self.add(path);
                let name = self.name("L");
                let delay = (self.delay)(self.loops.len(), *slack);
                let id = self.b.feedback_loop(
                    name,
                    Joiner::new(vec![*input, *back]),
                    body,
                    Splitter::RoundRobin(vec![*input, *back]),
                    path,
                    delay,
                );
                self.loops.push(LoopInfo {
                    id,
                    back: *back,
                    slack: *slack,
                });
                id
            }
        }
    }
}

fn build_nested(shape: &Shape, delay: DelayFn<'_>) -> (StreamGraph, Vec<LoopInfo>) {
    let mut nb = NestedBuilder {
        b: StreamGraphBuilder::new(),
        next_name: 0,
        loops: Vec::new(),
        delay,
    };
    let src = nb.b.filter("Src", Rate::new(0, 0, 1));
    let inner = nb.add(shape);
    let sink = nb.b.filter("Sink", Rate::new(1, 1, 0));
    let main = nb.b.pipeline("Main", vec![src, inner, sink]);
    let g = nb.b.build(main).unwrap();
    (g, nb.loops)
}

/// Delay that covers every joiner firing of a loop's init and first steady
/// period, plus the generated slack.
fn live_delays(shape: &Shape) -> Vec<u64> {
    let (g, loops) = build_nested(shape, &|_, _| 1 << 20);
    let table: RateTable = balance(&g).unwrap();
    loops
        .iter()
        .map(|l| {
            let node = table.node(l.id).unwrap();
            let firings = node.steady.joiner.unwrap_or(0) + node.init.joiner.unwrap_or(0);
            firings * l.back + l.slack
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        max_shrink_iters: 100,
        .. ProptestConfig::default()
    })]

    #[test]
    fn nested_programs_pass_every_certificate(shape in arb_shape()) {
        let delays = live_delays(&shape);
        let (g, _) = build_nested(&shape, &|i, _| delays[i]);
        let topo = Topology::build(&g);
        let table = balance(&g).unwrap();
        for policy in [PhasingPolicy::SingleAppearance, PhasingPolicy::MinLatency] {
            let s = build_schedules(&g, &table, policy).unwrap();
            let cert = verify_schedules(&g, &topo, &table, &s);
            prop_assert!(cert.all_pass(), "{:?} under {:?}", cert.obligations(), policy);
            let report = check_conservation(&g, &topo, &s).unwrap();
            prop_assert!(report.all_conserved(), "{:?} under {:?}", report, policy);
        }
    }

    #[test]
    fn small_delays_either_schedule_or_report_insufficient_delay(shape in arb_shape()) {
        let (g, _) = build_nested(&shape, &|_, slack| slack);
        match balance(&g) {
            Ok(table) => {
                let topo = Topology::build(&g);
                for policy in [PhasingPolicy::SingleAppearance, PhasingPolicy::MinLatency] {
                    let s = build_schedules(&g, &table, policy).unwrap();
                    let cert = verify_schedules(&g, &topo, &table, &s);
                    prop_assert!(cert.all_pass(), "{:?} under {:?}", cert.obligations(), policy);
                }
            }
            Err(err) => prop_assert!(
                matches!(err, ScheduleError::InsufficientDelay { .. }),
                "unexpected error: {}",
                err
            ),
        }
    }

    #[test]
    fn nested_directions_are_exclusive_and_reach_across_scopes(shape in arb_shape()) {
        let delays = live_delays(&shape);
        let (g, _) = build_nested(&shape, &|i, _| delays[i]);
        let topo = Topology::build(&g);
        let lat = LatencyGraph::build(&g, &topo).unwrap();
        let src = WorkUnit::find(&g, "Src").unwrap();
        let sink = WorkUnit::find(&g, "Sink").unwrap();

        for &a in topo.units() {
            for &c in topo.units() {
                let down = lat.is_downstream_path(a, c).unwrap();
                let up = lat.is_upstream_path(a, c).unwrap();
                prop_assert!(
                    !(down && up),
                    "{} and {} related both ways",
                    a.name(&g),
                    c.name(&g)
                );
            }
            // Every unit, loop paths included, feeds the sink and is fed by
            // the source.
            if a != sink {
                prop_assert!(lat.is_downstream_path(a, sink).unwrap(), "{} -> Sink", a.name(&g));
                prop_assert!(!lat.is_upstream_path(a, sink).unwrap());
            }
            if a != src {
                prop_assert!(lat.is_downstream_path(src, a).unwrap(), "Src -> {}", a.name(&g));
            }
        }
    }
}
