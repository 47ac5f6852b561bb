// scheduler.rs — Scheduler state and pass orchestration
//
// Holds every pass artifact for one stream graph and runs the minimal set of
// passes for a given terminal PassId.
//
// Preconditions: the stream graph passed validation at construction.
// Postconditions: all artifacts for required passes are populated, or the
//                 failing pass and its diagnostic are recorded.
// Failure modes: any pass returning a ScheduleError; a schedule certificate
//                with a failed obligation.
// Side effects: emits one `tracing` span per pass with its timing.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info_span};

use crate::balance::{self, RateTable};
use crate::diag::{Diagnostic, Result, ScheduleError};
use crate::latency::LatencyGraph;
use crate::pass::{descriptor, required_passes_for, PassId, StageCert};
use crate::schedule::{self, PhasingPolicy, ProgramSchedules, ScheduleCert};
use crate::stream::StreamGraph;
use crate::topology::Topology;

// ── Configuration ──────────────────────────────────────────────────────────

/// Per-run scheduler options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Steady-state phase ordering.
    pub policy: PhasingPolicy,
    /// Certify schedules whenever they are built.
    pub verify: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            policy: PhasingPolicy::default(),
            verify: true,
        }
    }
}

// ── Provenance ─────────────────────────────────────────────────────────────

/// Provenance metadata for reproducible scheduling runs.
///
/// `graph_hash`: SHA-256 of `StreamGraph::canonical_json()`.
/// `scheduler_version`: crate version from `Cargo.toml`.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub graph_hash: [u8; 32],
    pub policy: PhasingPolicy,
    pub scheduler_version: &'static str,
}

impl Provenance {
    /// Hex string of the graph hash (64 characters).
    pub fn graph_hash_hex(&self) -> String {
        bytes_to_hex(&self.graph_hash)
    }

    /// Serialize provenance as a JSON string for `--emit build-info`.
    pub fn to_json(&self) -> String {
        format!(
            "{{\n  \"graph_hash\": \"{}\",\n  \"policy\": \"{}\",\n  \"scheduler_version\": \"{}\"\n}}\n",
            self.graph_hash_hex(),
            self.policy.label(),
            self.scheduler_version,
        )
    }
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

/// Compute provenance from the canonical form of the graph.
///
/// The canonical JSON is compact and independent of the input file's
/// formatting, so reformatted inputs hash the same.
pub fn compute_provenance(graph: &StreamGraph, policy: PhasingPolicy) -> Provenance {
    use sha2::{Digest, Sha256};

    let graph_hash = {
        let mut hasher = Sha256::new();
        hasher.update(graph.canonical_json().as_bytes());
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        hash
    };

    Provenance {
        graph_hash,
        policy,
        scheduler_version: env!("CARGO_PKG_VERSION"),
    }
}

// ── Artifact storage ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct Artifacts {
    pub topology: Option<Topology>,
    pub rates: Option<RateTable>,
    pub schedules: Option<ProgramSchedules>,
    pub cert: Option<ScheduleCert>,
    pub latency: Option<LatencyGraph>,
}

// ── Error type ─────────────────────────────────────────────────────────────

/// A pass failed. The rendered diagnostic is also kept in
/// `Scheduler::diagnostics`.
#[derive(Debug, Error)]
#[error("{} failed: {error}", pass_name(.failing_pass))]
pub struct PassError {
    pub failing_pass: PassId,
    #[source]
    pub error: ScheduleError,
}

fn pass_name(pass_id: &PassId) -> &'static str {
    descriptor(*pass_id).name
}

// ── Scheduler ──────────────────────────────────────────────────────────────

/// One scheduling run over one stream graph.
pub struct Scheduler {
    graph: StreamGraph,
    config: SchedulerConfig,
    pub artifacts: Artifacts,
    pub diagnostics: Vec<Diagnostic>,
    pub has_error: bool,
    provenance: Provenance,
    timings: Vec<(PassId, Duration)>,
}

impl Scheduler {
    pub fn new(graph: StreamGraph, config: SchedulerConfig) -> Self {
        let provenance = compute_provenance(&graph, config.policy);
        Scheduler {
            graph,
            config,
            artifacts: Artifacts::default(),
            diagnostics: Vec::new(),
            has_error: false,
            provenance,
            timings: Vec::new(),
        }
    }

    pub fn graph(&self) -> &StreamGraph {
        &self.graph
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// Wall-clock time of every pass run so far, in execution order.
    pub fn timings(&self) -> &[(PassId, Duration)] {
        &self.timings
    }

    /// Run the minimal set of passes to produce `terminal`. Passes whose
    /// artifacts already exist are not rerun.
    pub fn run(&mut self, terminal: PassId) -> std::result::Result<(), PassError> {
        self.run_all(&[terminal])
    }

    pub fn run_all(&mut self, terminals: &[PassId]) -> std::result::Result<(), PassError> {
        let mut passes = required_passes_for(terminals);
        if self.config.verify
            && passes.contains(&PassId::Schedule)
            && !passes.contains(&PassId::Verify)
        {
            let mut with_verify = terminals.to_vec();
            with_verify.push(PassId::Verify);
            passes = required_passes_for(&with_verify);
        }
        for pass_id in passes {
            if self.is_done(pass_id) {
                continue;
            }
            let name = descriptor(pass_id).name;
            let _span = info_span!("pass", name).entered();
            let t = Instant::now();
            let outcome = self.run_pass(pass_id);
            let elapsed = t.elapsed();
            self.timings.push((pass_id, elapsed));
            debug!(
                elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                ok = outcome.is_ok(),
                "{name} complete"
            );
            if let Err(error) = outcome {
                self.diagnostics.push(Diagnostic::from(&error));
                self.has_error = true;
                return Err(PassError {
                    failing_pass: pass_id,
                    error,
                });
            }
        }
        Ok(())
    }

    fn is_done(&self, pass_id: PassId) -> bool {
        match pass_id {
            PassId::BuildTopology => self.artifacts.topology.is_some(),
            PassId::Balance => self.artifacts.rates.is_some(),
            PassId::Schedule => self.artifacts.schedules.is_some(),
            PassId::Verify => self.artifacts.cert.is_some(),
            PassId::BuildLatencyGraph => self.artifacts.latency.is_some(),
        }
    }

    fn run_pass(&mut self, pass_id: PassId) -> Result<()> {
        match pass_id {
            PassId::BuildTopology => {
                let topology = Topology::build(&self.graph);
                debug!(
                    units = topology.units().len(),
                    channels = topology.channels().len(),
                    "topology built"
                );
                self.artifacts.topology = Some(topology);
            }
            PassId::Balance => {
                self.artifacts.rates = Some(balance::balance(&self.graph)?);
            }
            PassId::Schedule => {
                let schedules =
                    schedule::build_schedules(&self.graph, self.rates()?, self.config.policy)?;
                self.artifacts.schedules = Some(schedules);
            }
            PassId::Verify => {
                let cert = schedule::verify_schedules(
                    &self.graph,
                    self.topology()?,
                    self.rates()?,
                    self.schedules()?,
                );
                let failed: Vec<_> = cert
                    .obligations()
                    .into_iter()
                    .filter(|(_, ok)| !ok)
                    .map(|(name, _)| name)
                    .collect();
                self.artifacts.cert = Some(cert);
                if !failed.is_empty() {
                    return Err(ScheduleError::internal(format!(
                        "schedule verification failed: {}",
                        failed.join(", ")
                    )));
                }
            }
            PassId::BuildLatencyGraph => {
                let latency = LatencyGraph::build(&self.graph, self.topology()?)?;
                self.artifacts.latency = Some(latency);
            }
        }
        Ok(())
    }

    // ── Artifact access ──

    pub fn topology(&self) -> Result<&Topology> {
        self.artifacts
            .topology
            .as_ref()
            .ok_or_else(|| missing(PassId::BuildTopology))
    }

    pub fn rates(&self) -> Result<&RateTable> {
        self.artifacts
            .rates
            .as_ref()
            .ok_or_else(|| missing(PassId::Balance))
    }

    pub fn schedules(&self) -> Result<&ProgramSchedules> {
        self.artifacts
            .schedules
            .as_ref()
            .ok_or_else(|| missing(PassId::Schedule))
    }

    pub fn cert(&self) -> Result<&ScheduleCert> {
        self.artifacts
            .cert
            .as_ref()
            .ok_or_else(|| missing(PassId::Verify))
    }

    pub fn latency(&self) -> Result<&LatencyGraph> {
        self.artifacts
            .latency
            .as_ref()
            .ok_or_else(|| missing(PassId::BuildLatencyGraph))
    }
}

fn missing(pass_id: PassId) -> ScheduleError {
    ScheduleError::internal(format!(
        "artifact of pass {} requested before it ran",
        descriptor(pass_id).name
    ))
}
