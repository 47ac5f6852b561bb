use clap::Parser;
use std::path::{Path, PathBuf};
use std::process;

use streamsched::diag::{Diagnostic, ScheduleError};
use streamsched::dot::emit_dot;
use streamsched::pass::{PassId, StageCert};
use streamsched::schedule::{render_program, PhasingPolicy};
use streamsched::scheduler::{Scheduler, SchedulerConfig};
use streamsched::stream::StreamGraph;
use streamsched::topology::WorkUnit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum EmitStage {
    Rates,
    Schedule,
    Latency,
    Sdep,
    Dot,
    Verify,
    BuildInfo,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum PolicyArg {
    SingleAppearance,
    MinLatency,
}

impl From<PolicyArg> for PhasingPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::SingleAppearance => PhasingPolicy::SingleAppearance,
            PolicyArg::MinLatency => PhasingPolicy::MinLatency,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "streamsched",
    version,
    about = "Stream scheduler: balances rates, builds phasing schedules and SDEP tables for hierarchical stream graphs"
)]
struct Cli {
    /// Input stream graph (JSON)
    graph: PathBuf,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Schedule)]
    emit: EmitStage,

    /// Steady-state phasing policy (overrides --config)
    #[arg(long, value_enum)]
    policy: Option<PolicyArg>,

    /// Scheduler configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Upstream unit for --emit sdep (filter name, NAME.splitter or NAME.joiner)
    #[arg(long)]
    from: Option<String>,

    /// Downstream unit for --emit sdep
    #[arg(long)]
    to: Option<String>,

    /// Log pass progress to stderr (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    // ── Load configuration and graph ──
    let mut config = match &cli.config {
        Some(path) => match read_json::<SchedulerConfig>(path) {
            Ok(c) => c,
            Err(e) => fail(&e),
        },
        None => SchedulerConfig::default(),
    };
    if let Some(policy) = cli.policy {
        config.policy = policy.into();
    }

    let text = match std::fs::read_to_string(&cli.graph) {
        Ok(s) => s,
        Err(source) => fail(&ScheduleError::Io {
            path: cli.graph.display().to_string(),
            source,
        }),
    };
    let graph = match StreamGraph::from_json(&text) {
        Ok(g) => g,
        Err(e) => fail(&e),
    };
    tracing::debug!(
        graph = %cli.graph.display(),
        nodes = graph.len(),
        emit = ?cli.emit,
        policy = config.policy.label(),
        "loaded stream graph"
    );

    let mut scheduler = Scheduler::new(graph, config);
    match emit(&mut scheduler, &cli) {
        Ok(out) => print!("{out}"),
        Err(e) => fail(&e),
    }
}

fn emit(scheduler: &mut Scheduler, cli: &Cli) -> Result<String, ScheduleError> {
    let terminal = match cli.emit {
        EmitStage::Rates => Some(PassId::Balance),
        EmitStage::Schedule | EmitStage::Dot => Some(PassId::Schedule),
        EmitStage::Verify => Some(PassId::Verify),
        EmitStage::Latency | EmitStage::Sdep => Some(PassId::BuildLatencyGraph),
        EmitStage::BuildInfo => None,
    };
    if let Some(terminal) = terminal {
        let mut terminals = vec![terminal];
        if cli.emit == EmitStage::Dot {
            terminals.push(PassId::BuildTopology);
        }
        scheduler.run_all(&terminals).map_err(|e| e.error)?;
    }

    let graph = scheduler.graph();
    Ok(match cli.emit {
        EmitStage::Rates => scheduler.rates()?.render(graph).to_string(),
        EmitStage::Schedule => render_program(graph, scheduler.schedules()?)?,
        EmitStage::Latency => scheduler.latency()?.render(graph).to_string(),
        EmitStage::Sdep => {
            let (Some(from), Some(to)) = (&cli.from, &cli.to) else {
                eprintln!("streamsched: error: --emit sdep requires --from and --to");
                process::exit(2);
            };
            let up = WorkUnit::find(graph, from)?;
            let down = WorkUnit::find(graph, to)?;
            let sdep = scheduler.latency()?.compute_sdep(up, down)?;
            format!("{from} -> {to}: {sdep}\n")
        }
        EmitStage::Dot => emit_dot(graph, scheduler.topology()?, Some(scheduler.schedules()?)),
        EmitStage::Verify => {
            let mut out = String::new();
            for (name, ok) in scheduler.cert()?.obligations() {
                out.push_str(&format!("{name}: {}\n", if ok { "ok" } else { "FAILED" }));
            }
            out
        }
        EmitStage::BuildInfo => scheduler.provenance().to_json(),
    })
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ScheduleError> {
    let text = std::fs::read_to_string(path).map_err(|source| ScheduleError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_json::from_str(&text)?)
}

/// Print the diagnostic and exit: 2 for unreadable input, 1 otherwise.
fn fail(err: &ScheduleError) -> ! {
    eprintln!("streamsched: {}", Diagnostic::from(err));
    let code = match err {
        ScheduleError::Io { .. } | ScheduleError::Json(_) => 2,
        _ => 1,
    };
    process::exit(code);
}
