// CLI tests: run the nodeflow binary on the documents under demos/ and on
// small inline documents, checking printed values and exit codes.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::atomic::{AtomicUsize, Ordering};

fn project_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .to_path_buf()
}

fn nodeflow_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_nodeflow"))
}

fn demo(name: &str) -> PathBuf {
    project_root().join("demos").join(name)
}

static COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Write `contents` to a unique temp file.
fn temp_document(contents: &str) -> PathBuf {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!("nodeflow_cli_{}_{}.json", std::process::id(), n));
    std::fs::write(&path, contents).unwrap();
    path
}

fn run(args: &[&str], graph: &Path) -> Output {
    Command::new(nodeflow_binary())
        .arg(graph)
        .args(args)
        .output()
        .expect("failed to run nodeflow")
}

fn stdout_lines(output: &Output) -> Vec<String> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .collect()
}

// ── Values ──────────────────────────────────────────────────────────────────

#[test]
fn sum_demo_prints_values_and_commands() {
    let output = run(&[], &demo("sum.json"));
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(
        stdout_lines(&output),
        vec![
            "a.out = 3.0",
            "b.out = 4.0",
            "show.out = 7.0",
            "sum.out = 7.0",
            "draw(\"total\", 7.0) from n3",
        ]
    );
}

#[test]
fn foreach_demo_lists_top_level_outputs() {
    let output = run(&[], &demo("foreach.json"));
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(
        stdout_lines(&output),
        vec!["count.len = 2", "xs.out = [10.0, 20.0]", "loop.ys = [20.0, 40.0]"]
    );
}

#[test]
fn requested_output_only() {
    let output = run(&["--output", "choose.y"], &demo("conditional.json"));
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(stdout_lines(&output), vec!["choose.y = 4.0"]);
}

#[test]
fn time_flag_reaches_time_varying_nodes() {
    let doc = temp_document(
        r#"{"nodes": [{"id": "clock", "symbol": "Time"}, {"id": "twice", "symbol": "Double"}],
            "connections": [{"from": {"node": "clock", "port": "seconds"}, "to": {"node": "twice", "port": "x"}}]}"#,
    );
    let output = run(&["--time", "1.5", "-o", "twice.out"], &doc);
    assert!(output.status.success());
    assert_eq!(stdout_lines(&output), vec!["twice.out = 3.0"]);
}

// ── Emit stages ─────────────────────────────────────────────────────────────

#[test]
fn emit_dot() {
    let output = run(&["--emit", "dot"], &demo("foreach.json"));
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.starts_with("digraph nodeflow {"));
    assert!(text.contains("subgraph cluster_r0 {"));
}

#[test]
fn emit_json_reloads() {
    let output = run(&["--emit", "json"], &demo("conditional.json"));
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    let doc = nodeflow::document::GraphDocument::from_json(&text).unwrap();
    assert_eq!(doc.regions.len(), 1);
    assert_eq!(doc.nodes.len(), 5);
    assert_eq!(doc.connections.len(), 8);
}

// ── Failures ────────────────────────────────────────────────────────────────

#[test]
fn missing_file_exits_2() {
    let output = run(&[], &project_root().join("demos").join("does_not_exist.json"));
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn unknown_symbol_exits_2() {
    let doc = temp_document(r#"{"nodes": [{"id": "x", "symbol": "Integrate"}]}"#);
    let output = run(&[], &doc);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown symbol 'Integrate'"));
}

#[test]
fn unknown_output_exits_2() {
    let output = run(&["--output", "nowhere.out"], &demo("sum.json"));
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn compute_error_exits_1_with_diagnostic() {
    let doc = temp_document(
        r#"{"nodes": [{"id": "q", "symbol": "Divide",
            "inputs": {"a": {"kind": "float", "value": 1.0}, "b": {"kind": "float", "value": 0.0}}}]}"#,
    );
    let output = run(&[], &doc);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error[E0100]"), "stderr: {}", stderr);
    assert!(stderr.contains("division by zero"));
}

#[test]
fn recursion_limit_from_flag_exits_1() {
    let doc = temp_document(
        r#"{"nodes": [{"id": "a", "symbol": "Constant"}, {"id": "b", "symbol": "Negate"},
                      {"id": "c", "symbol": "Negate"}],
            "connections": [{"from": {"node": "a", "port": "out"}, "to": {"node": "b", "port": "x"}},
                            {"from": {"node": "b", "port": "out"}, "to": {"node": "c", "port": "x"}}]}"#,
    );
    let output = run(&["--max-depth", "1", "-o", "c.out"], &doc);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("recursion limit of 1 exceeded"));
}
