// pass.rs — Pass descriptor module: metadata, dependency resolution, artifact IDs
//
// Declares the scheduler's passes (reading the stream graph is outside the
// runner), their dependency edges, and the artifacts they produce. Used by
// the scheduler driver to compute minimal pass subsets for each --emit target.

use std::collections::HashSet;

// ── Stage certificates ─────────────────────────────────────────────────────

/// Machine-checkable postconditions produced by a verifying pass.
pub trait StageCert {
    /// True if every obligation holds.
    fn all_pass(&self) -> bool;

    /// Obligation names paired with their outcome, in a stable order.
    fn obligations(&self) -> Vec<(&'static str, bool)>;
}

// ── Pass and Artifact identifiers ──────────────────────────────────────────

/// Identifies each scheduler pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    BuildTopology,
    Balance,
    Schedule,
    Verify,
    BuildLatencyGraph,
}

/// Machine-readable artifact identifiers. Each maps to a concrete type
/// in the scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    Topology,     // Topology
    Rates,        // RateTable
    Schedules,    // ProgramSchedules
    ScheduleCert, // ScheduleCert
    LatencyGraph, // LatencyGraph
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a scheduler pass.
pub struct PassDescriptor {
    /// Human-readable name for diagnostics/verbose output.
    pub name: &'static str,
    /// Pass dependencies (other passes whose outputs this pass consumes).
    pub inputs: &'static [PassId],
    /// Artifacts this pass produces.
    pub outputs: &'static [ArtifactId],
    /// What invalidates this pass's output.
    pub invalidation_key: &'static str,
    /// Pre/post conditions (documentation only).
    pub invariants: &'static str,
}

/// Return the static descriptor for a given pass.
pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::BuildTopology => PassDescriptor {
            name: "build_topology",
            inputs: &[],
            outputs: &[ArtifactId::Topology],
            invalidation_key: "stream graph",
            invariants: "every unit has an execution profile, every channel two endpoints",
        },
        PassId::Balance => PassDescriptor {
            name: "balance",
            inputs: &[],
            outputs: &[ArtifactId::Rates],
            invalidation_key: "stream graph",
            invariants: "multiplicities minimal and balanced, init counts cover peeking",
        },
        PassId::Schedule => PassDescriptor {
            name: "schedule",
            inputs: &[PassId::Balance],
            outputs: &[ArtifactId::Schedules],
            invalidation_key: "stream graph + rates + policy",
            invariants: "every node has an init and a steady phasing schedule",
        },
        PassId::Verify => PassDescriptor {
            name: "verify",
            inputs: &[PassId::BuildTopology, PassId::Schedule],
            outputs: &[ArtifactId::ScheduleCert],
            invalidation_key: "topology + rates + schedules",
            invariants: "S1-S3 obligations verified",
        },
        PassId::BuildLatencyGraph => PassDescriptor {
            name: "build_latency_graph",
            inputs: &[PassId::BuildTopology],
            outputs: &[ArtifactId::LatencyGraph],
            invalidation_key: "stream graph + topology",
            invariants: "one node per unit, one edge per channel with its sdep",
        },
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All pass IDs in declaration order (used for iteration).
pub const ALL_PASSES: [PassId; 5] = [
    PassId::BuildTopology,
    PassId::Balance,
    PassId::Schedule,
    PassId::Verify,
    PassId::BuildLatencyGraph,
];

/// Compute the minimal ordered set of passes needed to produce `terminal`.
/// Returns passes in topological (execution) order.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

/// Minimal ordered pass set covering several terminals.
pub fn required_passes_for(terminals: &[PassId]) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    for &terminal in terminals {
        visit(terminal, &mut visited, &mut order);
    }
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Tests ──────────────────────────────────────────────────────────────────
