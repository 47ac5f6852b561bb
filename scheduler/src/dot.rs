// dot.rs — Graphviz DOT output for stream programs
//
// Renders the stream hierarchy as nested clusters, one per container, with
// every work unit as a node and every channel as an edge.
//
// Preconditions: `topology` (and `schedules`, when given) were built for
//                `graph`.
// Postconditions: returns a valid DOT string representing the program.
// Failure modes: none (pure string formatting).
// Side effects: none.

use std::collections::HashMap;
use std::fmt::{self, Write};

use crate::flow::Flow;
use crate::id::StreamId;
use crate::schedule::{ProgramSchedules, Stage};
use crate::stream::{Splitter, StreamGraph, StreamKind};
use crate::topology::{Topology, WorkUnit};

/// Emit the program as a Graphviz DOT string. With `schedules`, units are
/// labelled with their firings per steady period of the whole program.
pub fn emit_dot(
    graph: &StreamGraph,
    topology: &Topology,
    schedules: Option<&ProgramSchedules>,
) -> String {
    let mut firings: HashMap<WorkUnit, u64> = HashMap::new();
    if let Some(root) = schedules.and_then(|s| s.get(graph.root())) {
        for ((unit, stage), count) in root.steady.firing_counts() {
            if stage == Stage::Steady {
                *firings.entry(unit).or_default() += count;
            }
        }
    }

    let mut buf = String::new();
    let _ = write_dot(&mut buf, graph, topology, &firings);
    buf
}

fn write_dot(
    buf: &mut String,
    graph: &StreamGraph,
    topology: &Topology,
    firings: &HashMap<WorkUnit, u64>,
) -> fmt::Result {
    writeln!(buf, "digraph stream {{")?;
    writeln!(buf, "    rankdir=TB;")?;
    writeln!(buf, "    node [fontname=\"Helvetica\", fontsize=10];")?;
    writeln!(buf, "    edge [fontname=\"Helvetica\", fontsize=9];")?;
    writeln!(buf)?;

    write_stream(buf, graph, firings, graph.root(), "    ")?;

    writeln!(buf)?;
    for channel in topology.channels() {
        let src = dot_node_id(channel.src);
        let dst = dot_node_id(channel.dst);
        if channel.feedback {
            writeln!(
                buf,
                "    {src} -> {dst} [style=dashed, label=\"delay {}\"];",
                channel.initial
            )?;
        } else {
            writeln!(buf, "    {src} -> {dst};")?;
        }
    }

    writeln!(buf, "}}")
}

fn write_stream(
    buf: &mut String,
    graph: &StreamGraph,
    firings: &HashMap<WorkUnit, u64>,
    id: StreamId,
    indent: &str,
) -> fmt::Result {
    let kind = graph.kind(id);
    if let StreamKind::Filter(rates) = kind {
        let unit = WorkUnit::Filter(id);
        let rates_text = match Flow::of_phases(&rates.phases) {
            Ok(flow) => format!("{}/{}/{}", flow.peek, flow.pop, flow.push),
            Err(_) => "overflow".to_string(),
        };
        let mut label = format!("{}\\n{rates_text}", escape(graph.name(id)));
        if let Some(n) = firings.get(&unit) {
            let _ = write!(label, " x{n}");
        }
        return writeln!(
            buf,
            "{indent}{} [label=\"{label}\", shape=box];",
            dot_node_id(unit)
        );
    }

    writeln!(buf, "{indent}subgraph cluster_{} {{", id.0)?;
    writeln!(
        buf,
        "{indent}    label=\"{} ({})\";",
        escape(graph.name(id)),
        kind.label()
    )?;
    writeln!(buf, "{indent}    style=rounded;")?;
    writeln!(buf, "{indent}    color=gray50;")?;
    let inner = format!("{indent}    ");
    match kind {
        StreamKind::SplitJoin {
            splitter, joiner, ..
        }
        | StreamKind::FeedbackLoop {
            splitter, joiner, ..
        } => {
            let split = WorkUnit::Splitter(id);
            let join = WorkUnit::Joiner(id);
            writeln!(
                buf,
                "{inner}{} [label=\"{}\", shape=triangle];",
                dot_node_id(split),
                unit_label(split_label(splitter), firings.get(&split))
            )?;
            writeln!(
                buf,
                "{inner}{} [label=\"{}\", shape=invtriangle];",
                dot_node_id(join),
                unit_label(weights_label("join", &joiner.weights), firings.get(&join))
            )?;
        }
        _ => {}
    }
    for child in kind.children() {
        write_stream(buf, graph, firings, child, &inner)?;
    }
    writeln!(buf, "{indent}}}")
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// DOT node ID: `f<id>`, `s<id>` or `j<id>`.
fn dot_node_id(unit: WorkUnit) -> String {
    match unit {
        WorkUnit::Filter(id) => format!("f{}", id.0),
        WorkUnit::Splitter(id) => format!("s{}", id.0),
        WorkUnit::Joiner(id) => format!("j{}", id.0),
    }
}

fn split_label(splitter: &Splitter) -> String {
    match splitter {
        Splitter::Duplicate => "dup".to_string(),
        Splitter::RoundRobin(weights) => weights_label("split", weights),
    }
}

fn weights_label(prefix: &str, weights: &[u64]) -> String {
    let list: Vec<String> = weights.iter().map(u64::to_string).collect();
    format!("{prefix} {}", list.join(","))
}

fn unit_label(base: String, firings: Option<&u64>) -> String {
    match firings {
        Some(n) => format!("{base} x{n}"),
        None => base,
    }
}

fn escape(name: &str) -> String {
    name.replace('\\', "\\\\").replace('"', "\\\"")
}

// ── Tests ───────────────────────────────────────────────────────────────────
