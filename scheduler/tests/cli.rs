// Command-line tests: emit stages, exit codes and reproducibility.
//
// These run the built `streamsched` binary over the graphs in `demos/` and
// check that identical inputs give byte-identical outputs.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn streamsched_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_streamsched"))
}

fn demos_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .join("demos")
}

fn demo(name: &str) -> String {
    demos_dir().join(name).to_str().unwrap().to_string()
}

fn run(args: &[&str]) -> Output {
    Command::new(streamsched_binary())
        .args(args)
        .output()
        .expect("failed to run streamsched")
}

fn run_ok(args: &[&str]) -> String {
    let output = run(args);
    assert!(
        output.status.success(),
        "streamsched failed with args {:?}\nstderr: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).expect("non-UTF8 output")
}

// ── Emit stages ─────────────────────────────────────────────────────────────

#[test]
fn emit_schedule_is_default() {
    let out = run_ok(&[&demo("pipeline.json")]);
    assert_eq!(out, "init:\n  (nothing)\nsteady:\n  1x A\n  1x B\n");
}

#[test]
fn emit_rates() {
    let out = run_ok(&["--emit", "rates", &demo("weighted_splitjoin.json")]);
    assert!(out.starts_with("Main [pipeline]"));
    assert!(out.contains("    SJ.splitter x1 +0\n"));
}

#[test]
fn emit_verify_lists_obligations() {
    let out = run_ok(&["--emit", "verify", &demo("feedback_echo.json")]);
    assert_eq!(
        out,
        "S1_all_nodes_scheduled: ok\nS2_totals_match: ok\nS3_buffers_conserved: ok\n"
    );
}

#[test]
fn emit_latency_marks_feedback_edge() {
    let out = run_ok(&["--emit", "latency", &demo("feedback_echo.json")]);
    assert_eq!(out.matches("(feedback)").count(), 1);
}

#[test]
fn emit_sdep_between_named_units() {
    let out = run_ok(&[
        "--emit",
        "sdep",
        "--from",
        "Src",
        "--to",
        "Echo.joiner",
        &demo("feedback_echo.json"),
    ]);
    assert_eq!(out, "Src -> Echo.joiner: [1] then +1 every 1\n");
}

#[test]
fn emit_dot_has_clusters() {
    let out = run_ok(&["--emit", "dot", &demo("feedback_echo.json")]);
    assert!(out.starts_with("digraph stream {"));
    assert_eq!(out.matches("subgraph cluster_").count(), 2);
    assert!(out.contains("style=dashed, label=\"delay 1\""));
}

#[test]
fn config_file_selects_policy() {
    let out = run_ok(&[
        "--emit",
        "build-info",
        "--config",
        &demo("config_min_latency.json"),
        &demo("pipeline.json"),
    ]);
    assert!(out.contains("\"policy\": \"min-latency\""));
    let overridden = run_ok(&[
        "--emit",
        "build-info",
        "--config",
        &demo("config_min_latency.json"),
        "--policy",
        "single-appearance",
        &demo("pipeline.json"),
    ]);
    assert!(overridden.contains("\"policy\": \"single-appearance\""));
}

// ── Exit codes ──────────────────────────────────────────────────────────────

#[test]
fn unschedulable_graph_exits_with_one() {
    let output = run(&[&demo("inconsistent_feedback.json")]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error[E0300]"), "{stderr}");
    assert!(stderr.contains("hint:"), "{stderr}");
}

#[test]
fn missing_input_exits_with_two() {
    let output = run(&[&demo("does_not_exist.json")]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn sdep_without_endpoints_exits_with_two() {
    let output = run(&["--emit", "sdep", &demo("pipeline.json")]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn unknown_unit_exits_with_one() {
    let output = run(&[
        "--emit",
        "sdep",
        "--from",
        "Nope",
        "--to",
        "B",
        &demo("pipeline.json"),
    ]);
    assert_eq!(output.status.code(), Some(1));
}

// ── Reproducibility ─────────────────────────────────────────────────────────

#[test]
fn same_graph_identical_outputs() {
    for emit in ["schedule", "rates", "latency", "dot", "build-info"] {
        let first = run_ok(&["--emit", emit, &demo("feedback_echo.json")]);
        let second = run_ok(&["--emit", emit, &demo("feedback_echo.json")]);
        assert_eq!(first, second, "--emit {emit} should be byte-identical across runs");
    }
}

#[test]
fn reformatted_graph_has_same_hash() {
    let original = std::fs::read_to_string(demos_dir().join("pipeline.json")).unwrap();
    let compact: serde_json::Value = serde_json::from_str(&original).unwrap();
    let path = std::env::temp_dir().join(format!("streamsched_compact_{}.json", std::process::id()));
    std::fs::write(&path, serde_json::to_string(&compact).unwrap()).unwrap();

    let a = run_ok(&["--emit", "build-info", &demo("pipeline.json")]);
    let b = run_ok(&["--emit", "build-info", path.to_str().unwrap()]);
    let _ = std::fs::remove_file(&path);
    assert_eq!(a, b);
}
