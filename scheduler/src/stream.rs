// stream.rs — Hierarchical stream-graph model (arena + serde interchange)
//
// A stream program is a tree of filters composed into pipelines,
// split-joins and feedback loops. The tree is stored in an arena indexed by
// `StreamId`; nodes are immutable once `StreamGraphBuilder::build` returns.
//
// Preconditions: children are added to the builder before their parents.
// Postconditions: a built graph is a tree rooted at `root`, every node has
//                 exactly one parent (root: none), and all weight vectors
//                 match their container's shape.
// Failure modes: structural violations return `ScheduleError::MalformedGraph`.
// Side effects: none.

use serde::{Deserialize, Serialize};

use crate::diag::{Result, ScheduleError};
use crate::id::{IdAllocator, StreamId};

// ── Rates and split/join policies ──────────────────────────────────────────

/// Per-phase data rates of a filter.
///
/// `peek` counts the items that must be present before the phase runs; it is
/// never smaller than `pop` once normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rate {
    #[serde(default)]
    pub peek: u64,
    pub pop: u64,
    pub push: u64,
}

impl Rate {
    pub fn new(peek: u64, pop: u64, push: u64) -> Self {
        Rate { peek, pop, push }.normalized()
    }

    /// Raise a declared `peek < pop` to `pop`.
    pub fn normalized(self) -> Self {
        Rate {
            peek: self.peek.max(self.pop),
            ..self
        }
    }
}

/// How a split-join or feedback loop distributes its input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Splitter {
    /// Every output port receives a copy of each input item.
    Duplicate,
    /// Output port `i` receives the next `weights[i]` items in turn.
    RoundRobin(Vec<u64>),
}

impl Splitter {
    /// Items consumed per splitter firing.
    pub fn pop(&self) -> u64 {
        match self {
            Splitter::Duplicate => 1,
            Splitter::RoundRobin(weights) => weights.iter().sum(),
        }
    }

    /// Items produced on `port` per splitter firing.
    pub fn push(&self, port: usize) -> u64 {
        match self {
            Splitter::Duplicate => 1,
            Splitter::RoundRobin(weights) => weights.get(port).copied().unwrap_or(0),
        }
    }

    fn weight_count(&self) -> Option<usize> {
        match self {
            Splitter::Duplicate => None,
            Splitter::RoundRobin(weights) => Some(weights.len()),
        }
    }
}

/// Round-robin joiner: input port `i` contributes `weights[i]` items per firing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Joiner {
    pub weights: Vec<u64>,
}

impl Joiner {
    pub fn new(weights: Vec<u64>) -> Self {
        Joiner { weights }
    }

    pub fn pop(&self, port: usize) -> u64 {
        self.weights.get(port).copied().unwrap_or(0)
    }

    pub fn push(&self) -> u64 {
        self.weights.iter().sum()
    }
}

// ── Arena nodes ────────────────────────────────────────────────────────────

/// Phase lists of a primitive filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRates {
    /// Phases run exactly once, before the first steady phase.
    pub prework: Vec<Rate>,
    /// Phases run in order on every firing.
    pub phases: Vec<Rate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamKind {
    Filter(FilterRates),
    Pipeline {
        children: Vec<StreamId>,
    },
    SplitJoin {
        splitter: Splitter,
        joiner: Joiner,
        branches: Vec<StreamId>,
    },
    FeedbackLoop {
        joiner: Joiner,
        body: StreamId,
        splitter: Splitter,
        loop_path: StreamId,
        delay: u64,
    },
}

impl StreamKind {
    pub fn label(&self) -> &'static str {
        match self {
            StreamKind::Filter(_) => "filter",
            StreamKind::Pipeline { .. } => "pipeline",
            StreamKind::SplitJoin { .. } => "splitjoin",
            StreamKind::FeedbackLoop { .. } => "feedbackloop",
        }
    }

    /// Direct children in data-flow order (body before loop path).
    pub fn children(&self) -> Vec<StreamId> {
        match self {
            StreamKind::Filter(_) => Vec::new(),
            StreamKind::Pipeline { children } => children.clone(),
            StreamKind::SplitJoin { branches, .. } => branches.clone(),
            StreamKind::FeedbackLoop {
                body, loop_path, ..
            } => vec![*body, *loop_path],
        }
    }

    pub fn is_container(&self) -> bool {
        !matches!(self, StreamKind::Filter(_))
    }

    pub fn has_splitter(&self) -> bool {
        matches!(
            self,
            StreamKind::SplitJoin { .. } | StreamKind::FeedbackLoop { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct StreamNode {
    pub id: StreamId,
    pub name: String,
    pub parent: Option<StreamId>,
    pub kind: StreamKind,
}

/// Immutable hierarchical stream program.
#[derive(Debug, Clone)]
pub struct StreamGraph {
    nodes: Vec<StreamNode>,
    root: StreamId,
}

impl StreamGraph {
    pub fn root(&self) -> StreamId {
        self.root
    }

    pub fn node(&self, id: StreamId) -> &StreamNode {
        &self.nodes[id.index()]
    }

    pub fn get(&self, id: StreamId) -> Option<&StreamNode> {
        self.nodes.get(id.index())
    }

    pub fn name(&self, id: StreamId) -> &str {
        &self.node(id).name
    }

    pub fn kind(&self, id: StreamId) -> &StreamKind {
        &self.node(id).kind
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &StreamNode> {
        self.nodes.iter()
    }

    /// All nodes reachable from the root, children before parents.
    pub fn post_order(&self) -> Vec<StreamId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        self.collect_post_order(self.root, &mut order);
        order
    }

    fn collect_post_order(&self, id: StreamId, order: &mut Vec<StreamId>) {
        for child in self.kind(id).children() {
            self.collect_post_order(child, order);
        }
        order.push(id);
    }

    /// Containers enclosing `id`, outermost first. Excludes `id` itself.
    pub fn ancestors(&self, id: StreamId) -> Vec<StreamId> {
        let mut chain = Vec::new();
        let mut cursor = self.node(id).parent;
        while let Some(parent) = cursor {
            chain.push(parent);
            cursor = self.node(parent).parent;
        }
        chain.reverse();
        chain
    }

    /// True if `id` is `scope` or lies inside it.
    pub fn is_within(&self, id: StreamId, scope: StreamId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if current == scope {
                return true;
            }
            cursor = self.node(current).parent;
        }
        false
    }

    /// Find a node by display name. Fails if the name is missing or ambiguous.
    pub fn find(&self, name: &str) -> Result<StreamId> {
        let mut matches = self.nodes.iter().filter(|n| n.name == name);
        let Some(first) = matches.next() else {
            return Err(ScheduleError::UnknownUnit {
                name: name.to_string(),
            });
        };
        if matches.next().is_some() {
            return Err(ScheduleError::UnknownUnit {
                name: format!("{name} (ambiguous: several streams share this name)"),
            });
        }
        Ok(first.id)
    }

    // ── Interchange ──

    pub fn from_json(text: &str) -> Result<StreamGraph> {
        let decl: StreamDecl = serde_json::from_str(text)?;
        StreamGraph::from_decl(&decl)
    }

    pub fn from_decl(decl: &StreamDecl) -> Result<StreamGraph> {
        let mut builder = StreamGraphBuilder::new();
        let root = builder.add_decl(decl);
        builder.build(root)
    }

    /// Canonical nested description of this graph.
    pub fn to_decl(&self) -> StreamDecl {
        self.decl_of(self.root)
    }

    fn decl_of(&self, id: StreamId) -> StreamDecl {
        let node = self.node(id);
        let body = match &node.kind {
            StreamKind::Filter(rates) => DeclBody::Filter {
                prework: rates.prework.clone(),
                phases: rates.phases.clone(),
            },
            StreamKind::Pipeline { children } => DeclBody::Pipeline {
                children: children.iter().map(|&c| self.decl_of(c)).collect(),
            },
            StreamKind::SplitJoin {
                splitter,
                joiner,
                branches,
            } => DeclBody::SplitJoin {
                splitter: splitter.clone(),
                joiner: joiner.clone(),
                branches: branches.iter().map(|&c| self.decl_of(c)).collect(),
            },
            StreamKind::FeedbackLoop {
                joiner,
                body,
                splitter,
                loop_path,
                delay,
            } => DeclBody::FeedbackLoop {
                joiner: joiner.clone(),
                body: Box::new(self.decl_of(*body)),
                splitter: splitter.clone(),
                loop_path: Box::new(self.decl_of(*loop_path)),
                delay: *delay,
            },
        };
        StreamDecl {
            name: node.name.clone(),
            body,
        }
    }

    /// Compact JSON of `to_decl()`; stable for identical graphs.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(&self.to_decl()).unwrap_or_default()
    }
}

// ── Serde description ──────────────────────────────────────────────────────

/// Nested, human-writable description of a stream program.
///
/// ```json
/// {"name": "Main", "kind": "pipeline", "children": [
///   {"name": "A", "kind": "filter", "phases": [{"pop": 0, "push": 2}]},
///   {"name": "B", "kind": "filter", "phases": [{"peek": 1, "pop": 2, "push": 1}]}
/// ]}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDecl {
    pub name: String,
    #[serde(flatten)]
    pub body: DeclBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeclBody {
    Filter {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        prework: Vec<Rate>,
        phases: Vec<Rate>,
    },
    Pipeline {
        children: Vec<StreamDecl>,
    },
    SplitJoin {
        splitter: Splitter,
        joiner: Joiner,
        branches: Vec<StreamDecl>,
    },
    FeedbackLoop {
        joiner: Joiner,
        body: Box<StreamDecl>,
        splitter: Splitter,
        #[serde(rename = "loop")]
        loop_path: Box<StreamDecl>,
        #[serde(default)]
        delay: u64,
    },
}

// ── Builder ────────────────────────────────────────────────────────────────

/// Bottom-up constructor for `StreamGraph`.
#[derive(Debug, Default)]
pub struct StreamGraphBuilder {
    ids: IdAllocator,
    nodes: Vec<StreamNode>,
}

impl StreamGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, name: impl Into<String>, kind: StreamKind) -> StreamId {
        let id = self.ids.alloc_stream();
        self.nodes.push(StreamNode {
            id,
            name: name.into(),
            parent: None,
            kind,
        });
        id
    }

    /// Single-phase filter without prework.
    pub fn filter(&mut self, name: impl Into<String>, rate: Rate) -> StreamId {
        self.phased_filter(name, Vec::new(), vec![rate])
    }

    pub fn phased_filter(
        &mut self,
        name: impl Into<String>,
        prework: Vec<Rate>,
        phases: Vec<Rate>,
    ) -> StreamId {
        let rates = FilterRates {
            prework: prework.into_iter().map(Rate::normalized).collect(),
            phases: phases.into_iter().map(Rate::normalized).collect(),
        };
        self.push(name, StreamKind::Filter(rates))
    }

    pub fn pipeline(&mut self, name: impl Into<String>, children: Vec<StreamId>) -> StreamId {
        self.push(name, StreamKind::Pipeline { children })
    }

    pub fn split_join(
        &mut self,
        name: impl Into<String>,
        splitter: Splitter,
        joiner: Joiner,
        branches: Vec<StreamId>,
    ) -> StreamId {
        self.push(
            name,
            StreamKind::SplitJoin {
                splitter,
                joiner,
                branches,
            },
        )
    }

    pub fn feedback_loop(
        &mut self,
        name: impl Into<String>,
        joiner: Joiner,
        body: StreamId,
        splitter: Splitter,
        loop_path: StreamId,
        delay: u64,
    ) -> StreamId {
        self.push(
            name,
            StreamKind::FeedbackLoop {
                joiner,
                body,
                splitter,
                loop_path,
                delay,
            },
        )
    }

    fn add_decl(&mut self, decl: &StreamDecl) -> StreamId {
        match &decl.body {
            DeclBody::Filter { prework, phases } => {
                self.phased_filter(&decl.name, prework.clone(), phases.clone())
            }
            DeclBody::Pipeline { children } => {
                let ids = children.iter().map(|c| self.add_decl(c)).collect();
                self.pipeline(&decl.name, ids)
            }
            DeclBody::SplitJoin {
                splitter,
                joiner,
                branches,
            } => {
                let ids = branches.iter().map(|c| self.add_decl(c)).collect();
                self.split_join(&decl.name, splitter.clone(), joiner.clone(), ids)
            }
            DeclBody::FeedbackLoop {
                joiner,
                body,
                splitter,
                loop_path,
                delay,
            } => {
                let body = self.add_decl(body);
                let loop_path = self.add_decl(loop_path);
                self.feedback_loop(
                    &decl.name,
                    joiner.clone(),
                    body,
                    splitter.clone(),
                    loop_path,
                    *delay,
                )
            }
        }
    }

    /// Link parents, validate structure, and freeze the graph.
    pub fn build(mut self, root: StreamId) -> Result<StreamGraph> {
        if root.index() >= self.nodes.len() {
            return Err(malformed(
                &root.to_string(),
                "root was not created by this builder",
            ));
        }
        for index in 0..self.nodes.len() {
            let id = self.nodes[index].id;
            for child in self.nodes[index].kind.children() {
                if child >= id {
                    return Err(malformed(
                        &self.nodes[index].name,
                        &format!("child {child} must be created before its parent"),
                    ));
                }
                let slot = &mut self.nodes[child.index()];
                if slot.parent.is_some() {
                    return Err(malformed(&slot.name, "stream is used more than once"));
                }
                slot.parent = Some(id);
            }
        }
        for node in &self.nodes {
            if node.id != root && node.parent.is_none() {
                return Err(malformed(&node.name, "stream is not part of the program"));
            }
            validate_shape(node)?;
        }
        if self.nodes[root.index()].parent.is_some() {
            return Err(malformed(
                &self.nodes[root.index()].name,
                "root is nested inside another stream",
            ));
        }
        Ok(StreamGraph {
            nodes: self.nodes,
            root,
        })
    }
}

fn malformed(stream: &str, detail: &str) -> ScheduleError {
    ScheduleError::MalformedGraph {
        stream: stream.to_string(),
        detail: detail.to_string(),
    }
}

fn validate_shape(node: &StreamNode) -> Result<()> {
    if let StreamKind::SplitJoin {
        splitter, joiner, ..
    }
    | StreamKind::FeedbackLoop {
        splitter, joiner, ..
    } = &node.kind
    {
        let split_weights = match splitter {
            Splitter::Duplicate => &[][..],
            Splitter::RoundRobin(weights) => weights.as_slice(),
        };
        let total = |w: &[u64]| w.iter().try_fold(0u64, |acc, &x| acc.checked_add(x));
        if total(split_weights).is_none() || total(&joiner.weights).is_none() {
            return Err(malformed(&node.name, "weights sum beyond 64 bits"));
        }
    }
    match &node.kind {
        StreamKind::Filter(rates) => {
            if rates.phases.is_empty() {
                return Err(malformed(&node.name, "filter declares no steady phases"));
            }
        }
        StreamKind::Pipeline { children } => {
            if children.is_empty() {
                return Err(malformed(&node.name, "pipeline has no children"));
            }
        }
        StreamKind::SplitJoin {
            splitter,
            joiner,
            branches,
        } => {
            if branches.is_empty() {
                return Err(malformed(&node.name, "split-join has no branches"));
            }
            if let Some(n) = splitter.weight_count() {
                if n != branches.len() {
                    return Err(malformed(
                        &node.name,
                        &format!("splitter has {n} weights for {} branches", branches.len()),
                    ));
                }
            }
            if joiner.weights.len() != branches.len() {
                return Err(malformed(
                    &node.name,
                    &format!(
                        "joiner has {} weights for {} branches",
                        joiner.weights.len(),
                        branches.len()
                    ),
                ));
            }
        }
        StreamKind::FeedbackLoop {
            joiner, splitter, ..
        } => {
            if joiner.weights.len() != 2 {
                return Err(malformed(
                    &node.name,
                    "feedback joiner needs exactly 2 weights (input, loop)",
                ));
            }
            if splitter.weight_count().is_some_and(|n| n != 2) {
                return Err(malformed(
                    &node.name,
                    "feedback splitter needs exactly 2 weights (output, loop)",
                ));
            }
        }
    }
    Ok(())
}
