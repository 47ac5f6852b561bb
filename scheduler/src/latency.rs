// latency.rs — Latency graph: cross-unit dependence queries
//
// One node per work unit, one edge per channel, each edge labelled with the
// SDEP function of its channel. Queries restrict themselves to the least
// common ancestor of the two units, cut the edges that close a cycle when
// that scope contains one, and compose edge functions along every surviving
// path.
//
// Preconditions: `topology` was built from `graph`.
// Postconditions: `compute_sdep(a, b)` relates executions of `a` to
//                 executions of `b` along forward paths only.
// Failure modes: NoPath when no forward path exists; Internal on divergent
//                ancestor chains or inconsistent parallel paths.
// Side effects: emits `tracing` trace events per edge and query.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

use petgraph::graph::{EdgeIndex, Graph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use tracing::trace;

use crate::diag::{Result, ScheduleError};
use crate::id::StreamId;
use crate::sdep::SdepData;
use crate::stream::StreamGraph;
use crate::topology::{Topology, WorkUnit};

/// A work unit and its enclosing containers, outermost first.
#[derive(Debug, Clone)]
pub struct LatencyNode {
    pub unit: WorkUnit,
    pub name: String,
    pub ancestors: Vec<StreamId>,
}

impl LatencyNode {
    fn within(&self, scope: StreamId) -> bool {
        self.ancestors.contains(&scope)
    }
}

/// A channel and its dependence function.
#[derive(Debug, Clone)]
pub struct LatencyEdge {
    pub src_port: usize,
    pub dst_port: usize,
    pub sdep: SdepData,
    pub scope: StreamId,
    pub feedback: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LatencyGraph {
    graph: Graph<LatencyNode, LatencyEdge>,
    index: HashMap<WorkUnit, NodeIndex>,
}

impl LatencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_unit(&mut self, unit: WorkUnit, name: String, ancestors: Vec<StreamId>) -> NodeIndex {
        if let Some(&idx) = self.index.get(&unit) {
            return idx;
        }
        let idx = self.graph.add_node(LatencyNode {
            unit,
            name,
            ancestors,
        });
        self.index.insert(unit, idx);
        idx
    }

    pub fn add_filter(
        &mut self,
        id: StreamId,
        name: String,
        ancestors: Vec<StreamId>,
    ) -> NodeIndex {
        self.add_unit(WorkUnit::Filter(id), name, ancestors)
    }

    /// `ancestors` ends with the owning container `id`.
    pub fn add_splitter(
        &mut self,
        id: StreamId,
        name: String,
        ancestors: Vec<StreamId>,
    ) -> NodeIndex {
        self.add_unit(WorkUnit::Splitter(id), name, ancestors)
    }

    /// `ancestors` ends with the owning container `id`.
    pub fn add_joiner(
        &mut self,
        id: StreamId,
        name: String,
        ancestors: Vec<StreamId>,
    ) -> NodeIndex {
        self.add_unit(WorkUnit::Joiner(id), name, ancestors)
    }

    pub fn add_edge(&mut self, src: NodeIndex, dst: NodeIndex, edge: LatencyEdge) -> EdgeIndex {
        self.graph.add_edge(src, dst, edge)
    }

    /// Latency graph of a whole program.
    pub fn build(graph: &StreamGraph, topology: &Topology) -> Result<LatencyGraph> {
        let mut latency = LatencyGraph::new();
        for &unit in topology.units() {
            let ancestors = topology.ancestors(unit).to_vec();
            let name = unit.name(graph);
            match unit {
                WorkUnit::Filter(id) => latency.add_filter(id, name, ancestors),
                WorkUnit::Splitter(id) => latency.add_splitter(id, name, ancestors),
                WorkUnit::Joiner(id) => latency.add_joiner(id, name, ancestors),
            };
        }
        for channel in topology.channels() {
            let missing = |unit: WorkUnit| {
                ScheduleError::internal(format!("no execution profile for {}", unit.name(graph)))
            };
            let src_profile = topology.profile(channel.src).ok_or_else(|| missing(channel.src))?;
            let dst_profile = topology.profile(channel.dst).ok_or_else(|| missing(channel.dst))?;
            let sdep = SdepData::for_channel(
                src_profile,
                channel.src_port,
                dst_profile,
                channel.dst_port,
                channel.initial,
            )?;
            trace!(
                src = %channel.src.name(graph),
                dst = %channel.dst.name(graph),
                %sdep,
                "latency edge"
            );
            let src = latency.node_index(channel.src)?;
            let dst = latency.node_index(channel.dst)?;
            latency.add_edge(
                src,
                dst,
                LatencyEdge {
                    src_port: channel.src_port,
                    dst_port: channel.dst_port,
                    sdep,
                    scope: channel.scope,
                    feedback: channel.feedback,
                },
            );
        }
        Ok(latency)
    }

    pub fn node_index(&self, unit: WorkUnit) -> Result<NodeIndex> {
        self.index
            .get(&unit)
            .copied()
            .ok_or_else(|| ScheduleError::UnknownUnit {
                name: unit.to_string(),
            })
    }

    pub fn node(&self, idx: NodeIndex) -> &LatencyNode {
        &self.graph[idx]
    }

    /// Display name of `unit`, falling back to its id form when unknown.
    pub fn name_of(&self, unit: WorkUnit) -> String {
        match self.index.get(&unit) {
            Some(&idx) => self.graph[idx].name.clone(),
            None => unit.to_string(),
        }
    }

    pub fn edge(&self, idx: EdgeIndex) -> &LatencyEdge {
        &self.graph[idx]
    }

    pub fn edge_endpoints(&self, idx: EdgeIndex) -> Option<(WorkUnit, WorkUnit)> {
        let (a, b) = self.graph.edge_endpoints(idx)?;
        Some((self.graph[a].unit, self.graph[b].unit))
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    // ── Scopes ──

    /// Least common ancestor of two units, found by walking both chains in
    /// lock-step. None when either unit has no enclosing container.
    pub fn lca(&self, a: WorkUnit, b: WorkUnit) -> Result<Option<StreamId>> {
        let ca = &self.graph[self.node_index(a)?].ancestors;
        let cb = &self.graph[self.node_index(b)?].ancestors;
        if let (Some(ra), Some(rb)) = (ca.first(), cb.first()) {
            if ra != rb {
                return Err(ScheduleError::internal(format!(
                    "ancestor chains of {} and {} start at different roots ({ra} vs {rb})",
                    self.name_of(a),
                    self.name_of(b)
                )));
            }
        }
        Ok(ca
            .iter()
            .zip(cb)
            .take_while(|(x, y)| x == y)
            .last()
            .map(|(x, _)| *x))
    }

    fn edge_in_scope(&self, edge: EdgeIndex, scope: StreamId) -> bool {
        self.graph
            .edge_endpoints(edge)
            .is_some_and(|(a, b)| self.graph[a].within(scope) && self.graph[b].within(scope))
    }

    /// Three-color DFS over the nodes and edges inside `scope`.
    pub fn has_cycle(&self, scope: StreamId) -> bool {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Color {
            Unvisited,
            Visiting,
            Done,
        }
        let mut color = vec![Color::Unvisited; self.graph.node_count()];
        for start in self.graph.node_indices() {
            if !self.graph[start].within(scope) || color[start.index()] != Color::Unvisited {
                continue;
            }
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>)> =
                vec![(start, self.scoped_successors(start, scope, &HashSet::new()))];
            color[start.index()] = Color::Visiting;
            while let Some((node, pending)) = stack.last_mut() {
                let Some(next) = pending.pop() else {
                    color[node.index()] = Color::Done;
                    stack.pop();
                    continue;
                };
                match color[next.index()] {
                    Color::Visiting => return true,
                    Color::Done => {}
                    Color::Unvisited => {
                        color[next.index()] = Color::Visiting;
                        let succ = self.scoped_successors(next, scope, &HashSet::new());
                        stack.push((next, succ));
                    }
                }
            }
        }
        false
    }

    fn scoped_successors(
        &self,
        node: NodeIndex,
        scope: StreamId,
        excluded: &HashSet<EdgeIndex>,
    ) -> Vec<NodeIndex> {
        self.graph
            .edges_directed(node, Direction::Outgoing)
            .filter(|e| !excluded.contains(&e.id()) && self.edge_in_scope(e.id(), scope))
            .map(|e| e.target())
            .collect()
    }

    /// Edges reachable from `start` in `direction` without leaving `scope`.
    pub fn visit_edges(
        &self,
        start: NodeIndex,
        direction: Direction,
        scope: StreamId,
        excluded: &HashSet<EdgeIndex>,
    ) -> HashSet<EdgeIndex> {
        let mut edges = HashSet::new();
        let mut seen = vec![false; self.graph.node_count()];
        let mut queue = VecDeque::from([start]);
        seen[start.index()] = true;
        while let Some(node) = queue.pop_front() {
            for e in self.graph.edges_directed(node, direction) {
                if excluded.contains(&e.id()) || !self.edge_in_scope(e.id(), scope) {
                    continue;
                }
                edges.insert(e.id());
                let next = match direction {
                    Direction::Outgoing => e.target(),
                    Direction::Incoming => e.source(),
                };
                if !seen[next.index()] {
                    seen[next.index()] = true;
                    queue.push_back(next);
                }
            }
        }
        edges
    }

    /// Edges of `scope` that close a cycle as seen from `start`.
    ///
    /// The feedback channel owned by `scope` itself is always cut, so inside
    /// a loop the forward direction runs joiner, body, splitter, loop path.
    /// Every other cycle is cut by a DFS rooted at `start`: an edge into a
    /// node on the current path points backwards. A loop entered from
    /// outside is thus cut at its own feedback edge, while a loop that
    /// contains `start` is cut at the edge returning to `start`.
    fn find_back_pointing_edges(&self, start: NodeIndex, scope: StreamId) -> HashSet<EdgeIndex> {
        let mut back: HashSet<EdgeIndex> = self
            .graph
            .edge_indices()
            .filter(|&e| {
                let edge = &self.graph[e];
                edge.feedback && edge.scope == scope
            })
            .collect();

        let outgoing = |node: NodeIndex, cut: &HashSet<EdgeIndex>| -> Vec<(EdgeIndex, NodeIndex)> {
            let mut out: Vec<_> = self
                .graph
                .edges_directed(node, Direction::Outgoing)
                .filter(|e| !cut.contains(&e.id()) && self.edge_in_scope(e.id(), scope))
                .map(|e| (e.id(), e.target()))
                .collect();
            out.reverse();
            out
        };

        let n = self.graph.node_count();
        let mut on_path = vec![false; n];
        let mut visited = vec![false; n];
        visited[start.index()] = true;
        on_path[start.index()] = true;
        let mut stack = vec![(start, outgoing(start, &back))];
        while let Some((node, pending)) = stack.last_mut() {
            let Some((edge, next)) = pending.pop() else {
                on_path[node.index()] = false;
                stack.pop();
                continue;
            };
            if on_path[next.index()] {
                back.insert(edge);
            } else if !visited[next.index()] {
                visited[next.index()] = true;
                on_path[next.index()] = true;
                let succ = outgoing(next, &back);
                stack.push((next, succ));
            }
        }
        back
    }

    // ── Queries ──

    /// Edges lying on some forward path from `up` to `down` inside their
    /// least common ancestor, in index order.
    pub fn edges_between(&self, up: WorkUnit, down: WorkUnit) -> Result<Vec<EdgeIndex>> {
        if up == down {
            return Ok(Vec::new());
        }
        let Some(scope) = self.lca(up, down)? else {
            return Ok(Vec::new());
        };
        let (u, d) = (self.node_index(up)?, self.node_index(down)?);

        let between = |excluded: &HashSet<EdgeIndex>| -> Vec<EdgeIndex> {
            let forward = self.visit_edges(u, Direction::Outgoing, scope, excluded);
            let backward = self.visit_edges(d, Direction::Incoming, scope, excluded);
            let mut edges: Vec<EdgeIndex> = forward.intersection(&backward).copied().collect();
            edges.sort();
            edges
        };

        let edges = between(&HashSet::new());
        if edges.is_empty() || !self.has_cycle(scope) {
            return Ok(edges);
        }
        let back = self.find_back_pointing_edges(u, scope);
        trace!(?scope, removed = back.len(), "dropping back-pointing edges");
        Ok(between(&back))
    }

    /// Dependence of `down`'s executions on `up`'s executions.
    pub fn compute_sdep(&self, up: WorkUnit, down: WorkUnit) -> Result<SdepData> {
        if up == down {
            return Ok(SdepData::identity());
        }
        let edges = self.edges_between(up, down)?;
        if edges.is_empty() {
            return Err(ScheduleError::NoPath {
                upstream: self.name_of(up),
                downstream: self.name_of(down),
            });
        }
        let (u, d) = (self.node_index(up)?, self.node_index(down)?);
        let retained: HashSet<EdgeIndex> = edges.iter().copied().collect();

        let mut pending: HashMap<NodeIndex, usize> = HashMap::new();
        for &e in &edges {
            if let Some((_, dst)) = self.graph.edge_endpoints(e) {
                *pending.entry(dst).or_default() += 1;
            }
        }

        let mut functions: HashMap<NodeIndex, SdepData> = HashMap::new();
        functions.insert(u, SdepData::identity());
        let mut ready = BTreeSet::from([u]);
        while let Some(node) = ready.pop_first() {
            let Some(reaching) = functions.get(&node).cloned() else {
                return Err(ScheduleError::internal(format!(
                    "node {} became ready without a dependence function",
                    self.graph[node].name
                )));
            };
            for e in self.graph.edges_directed(node, Direction::Outgoing) {
                if !retained.contains(&e.id()) {
                    continue;
                }
                let next = e.target();
                let along = SdepData::compose(&reaching, &e.weight().sdep);
                let merged = match functions.get(&next) {
                    Some(existing) => SdepData::merge(existing, &along)?,
                    None => along,
                };
                functions.insert(next, merged);
                let count = pending.entry(next).or_default();
                *count = count.saturating_sub(1);
                if *count == 0 {
                    ready.insert(next);
                }
            }
        }

        let result = functions.remove(&d).ok_or_else(|| {
            ScheduleError::internal(format!(
                "dependence propagation from {} never reached {}",
                self.name_of(up),
                self.name_of(down)
            ))
        })?;
        trace!(
            up = %self.graph[u].name,
            down = %self.graph[d].name,
            sdep = %result,
            "computed sdep"
        );
        Ok(result)
    }

    /// True if data flows from `a` to `b`.
    pub fn is_downstream_path(&self, a: WorkUnit, b: WorkUnit) -> Result<bool> {
        Ok(!self.edges_between(a, b)?.is_empty())
    }

    /// True if data flows from `b` to `a`.
    pub fn is_upstream_path(&self, a: WorkUnit, b: WorkUnit) -> Result<bool> {
        Ok(!self.edges_between(b, a)?.is_empty())
    }

    pub fn render<'a>(&'a self, graph: &'a StreamGraph) -> LatencyDisplay<'a> {
        LatencyDisplay {
            latency: self,
            graph,
        }
    }
}

pub struct LatencyDisplay<'a> {
    latency: &'a LatencyGraph,
    graph: &'a StreamGraph,
}

impl fmt::Display for LatencyDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = &self.latency.graph;
        writeln!(f, "nodes ({}):", g.node_count())?;
        for idx in g.node_indices() {
            let node = &g[idx];
            let chain: Vec<&str> = node.ancestors.iter().map(|a| self.graph.name(*a)).collect();
            writeln!(f, "  {} in {}", node.name, chain.join("/"))?;
        }
        writeln!(f, "edges ({}):", g.edge_count())?;
        for e in g.edge_references() {
            let edge = e.weight();
            writeln!(
                f,
                "  {}:{} -> {}:{}{} {}",
                g[e.source()].name,
                edge.src_port,
                g[e.target()].name,
                edge.dst_port,
                if edge.feedback { " (feedback)" } else { "" },
                edge.sdep
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Joiner, Rate, Splitter, StreamGraphBuilder};

    fn echo() -> (StreamGraph, LatencyGraph) {
        let mut b = StreamGraphBuilder::new();
        let src = b.filter("Src", Rate::new(0, 0, 1));
        let body = b.filter("Body", Rate::new(2, 2, 2));
        let back = b.filter("Back", Rate::new(1, 1, 1));
        let fl = b.feedback_loop(
            "Echo",
            Joiner::new(vec![1, 1]),
            body,
            Splitter::RoundRobin(vec![1, 1]),
            back,
            1,
        );
        let sink = b.filter("Sink", Rate::new(1, 1, 0));
        let main = b.pipeline("Main", vec![src, fl, sink]);
        let g = b.build(main).unwrap();
        let topo = Topology::build(&g);
        let latency = LatencyGraph::build(&g, &topo).unwrap();
        (g, latency)
    }

    fn unit(g: &StreamGraph, name: &str) -> WorkUnit {
        WorkUnit::find(g, name).unwrap()
    }

    #[test]
    fn lca_walks_chains_in_lock_step() {
        let (g, lat) = echo();
        let main = g.find("Main").unwrap();
        let echo = g.find("Echo").unwrap();
        assert_eq!(lat.lca(unit(&g, "Src"), unit(&g, "Sink")).unwrap(), Some(main));
        assert_eq!(lat.lca(unit(&g, "Body"), unit(&g, "Back")).unwrap(), Some(echo));
        assert_eq!(
            lat.lca(unit(&g, "Echo.joiner"), unit(&g, "Body")).unwrap(),
            Some(echo)
        );
    }

    #[test]
    fn cycles_are_local_to_the_loop() {
        let (g, lat) = echo();
        assert!(lat.has_cycle(g.find("Echo").unwrap()));
        assert!(lat.has_cycle(g.find("Main").unwrap()));
        assert!(!lat.has_cycle(g.find("Body").unwrap()));
    }

    #[test]
    fn feedback_edge_never_carries_forward_dependence() {
        let (g, lat) = echo();
        let split = unit(&g, "Echo.splitter");
        let join = unit(&g, "Echo.joiner");
        assert!(lat.edges_between(split, join).unwrap().is_empty());
        assert!(lat.is_downstream_path(join, split).unwrap());
        assert!(!lat.is_upstream_path(join, split).unwrap());
    }

    #[test]
    fn directions_are_exclusive_inside_the_loop() {
        let (g, lat) = echo();
        let body = unit(&g, "Body");
        let back = unit(&g, "Back");
        assert!(lat.is_downstream_path(body, back).unwrap());
        assert!(!lat.is_upstream_path(body, back).unwrap());
        assert!(lat.is_upstream_path(back, body).unwrap());
    }

    #[test]
    fn sdep_through_pipeline_and_loop() {
        let (g, lat) = echo();
        let src = unit(&g, "Src");
        let sink = unit(&g, "Sink");
        let sdep = lat.compute_sdep(src, sink).unwrap();
        // One item per stage: sink execution n needs n source executions.
        assert_eq!(sdep.prefix(4), vec![1, 2, 3, 4]);
        assert_eq!(lat.compute_sdep(sink, sink).unwrap(), SdepData::identity());
    }

    #[test]
    fn loop_path_reaches_units_after_the_loop() {
        let (g, lat) = echo();
        let back = unit(&g, "Back");
        let sink = unit(&g, "Sink");
        assert!(lat.is_downstream_path(back, sink).unwrap());
        assert!(!lat.is_upstream_path(back, sink).unwrap());
        assert!(lat.is_upstream_path(sink, back).unwrap());
        // The delay token feeds the first joiner firing, so Sink's first
        // execution needs no Back execution at all.
        let sdep = lat.compute_sdep(back, sink).unwrap();
        assert_eq!(sdep.prefix(4), vec![0, 1, 2, 3]);
    }

    #[test]
    fn nested_loop_path_reaches_the_outer_loop_path() {
        let mut b = StreamGraphBuilder::new();
        let src = b.filter("Src", Rate::new(0, 0, 1));
        let ibody = b.filter("IBody", Rate::new(2, 2, 2));
        let iback = b.filter("IBack", Rate::new(1, 1, 1));
        let inner = b.feedback_loop(
            "Inner",
            Joiner::new(vec![1, 1]),
            ibody,
            Splitter::RoundRobin(vec![1, 1]),
            iback,
            1,
        );
        let oback = b.filter("OBack", Rate::new(1, 1, 1));
        let outer = b.feedback_loop(
            "Outer",
            Joiner::new(vec![1, 1]),
            inner,
            Splitter::RoundRobin(vec![1, 1]),
            oback,
            1,
        );
        let sink = b.filter("Sink", Rate::new(1, 1, 0));
        let main = b.pipeline("Main", vec![src, outer, sink]);
        let g = b.build(main).unwrap();
        let lat = LatencyGraph::build(&g, &Topology::build(&g)).unwrap();

        let (iback, oback) = (unit(&g, "IBack"), unit(&g, "OBack"));
        assert_eq!(lat.lca(iback, oback).unwrap(), Some(g.find("Outer").unwrap()));
        assert!(lat.is_downstream_path(iback, oback).unwrap());
        assert!(!lat.is_upstream_path(iback, oback).unwrap());
        assert!(lat.is_downstream_path(iback, unit(&g, "Sink")).unwrap());
        // The outer feedback edge stays cut inside the outer loop.
        assert!(lat
            .edges_between(unit(&g, "Outer.splitter"), unit(&g, "Outer.joiner"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn errors_name_units_by_stream_name() {
        let mut b = StreamGraphBuilder::new();
        let x = b.filter("X", Rate::new(1, 1, 1));
        let y = b.filter("Y", Rate::new(1, 1, 1));
        let sj = b.split_join("SJ", Splitter::Duplicate, Joiner::new(vec![1, 1]), vec![x, y]);
        let g = b.build(sj).unwrap();
        let lat = LatencyGraph::build(&g, &Topology::build(&g)).unwrap();
        match lat.compute_sdep(unit(&g, "X"), unit(&g, "Y")) {
            Err(ScheduleError::NoPath {
                upstream,
                downstream,
            }) => {
                assert_eq!(upstream, "X");
                assert_eq!(downstream, "Y");
            }
            other => panic!("expected NoPath, got {other:?}"),
        }
    }

    #[test]
    fn unrelated_units_have_no_path() {
        let mut b = StreamGraphBuilder::new();
        let x = b.filter("X", Rate::new(1, 1, 1));
        let y = b.filter("Y", Rate::new(1, 1, 1));
        let sj = b.split_join("SJ", Splitter::Duplicate, Joiner::new(vec![1, 1]), vec![x, y]);
        let g = b.build(sj).unwrap();
        let lat = LatencyGraph::build(&g, &Topology::build(&g)).unwrap();
        let (ux, uy) = (unit(&g, "X"), unit(&g, "Y"));
        assert!(!lat.is_downstream_path(ux, uy).unwrap());
        assert!(!lat.is_upstream_path(ux, uy).unwrap());
        let err = lat.compute_sdep(ux, uy).unwrap_err();
        assert!(matches!(err, ScheduleError::NoPath { .. }));
    }

    #[test]
    fn parallel_branches_merge_to_the_slower_one() {
        let mut b = StreamGraphBuilder::new();
        let x = b.filter("X", Rate::new(1, 1, 1));
        let y = b.filter("Y", Rate::new(3, 1, 1));
        let sj = b.split_join("SJ", Splitter::Duplicate, Joiner::new(vec![1, 1]), vec![x, y]);
        let g = b.build(sj).unwrap();
        let lat = LatencyGraph::build(&g, &Topology::build(&g)).unwrap();
        let sdep = lat
            .compute_sdep(unit(&g, "SJ.splitter"), unit(&g, "SJ.joiner"))
            .unwrap();
        // Y peeks two items ahead, so the joiner's first firing needs three splits.
        assert_eq!(sdep.prefix(3), vec![3, 4, 5]);
    }
}
