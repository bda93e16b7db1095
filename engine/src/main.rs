use clap::Parser;
use std::path::PathBuf;

use nodeflow::diag::has_errors;
use nodeflow::document::{load_graph, serialize_graph, GraphDocument, LoadedGraph};
use nodeflow::graph::OutputRef;
use nodeflow::{dot, library, Engine, EngineConfig};

#[derive(Debug, Clone, clap::ValueEnum)]
enum EmitStage {
    Value,
    Dot,
    Json,
}

#[derive(Parser, Debug)]
#[command(
    name = "nodeflow",
    version,
    about = "nodeflow — evaluates JSON dataflow graph documents against the standard operator library"
)]
struct Cli {
    /// Input graph document (.json)
    graph: PathBuf,

    /// Output to evaluate, as `node.port` or `region.result` (repeatable)
    #[arg(short, long)]
    output: Vec<String>,

    /// Evaluation time in seconds
    #[arg(short, long, default_value_t = 0.0)]
    time: f64,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Value)]
    emit: EmitStage,

    /// Engine configuration file (.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the pull recursion limit
    #[arg(long)]
    max_depth: Option<u32>,

    /// Print load and evaluation phases
    #[arg(long)]
    verbose: bool,
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("nodeflow: error: {}", message);
    std::process::exit(2);
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "nodeflow=debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    if cli.verbose {
        eprintln!("nodeflow: graph = {}", cli.graph.display());
        eprintln!("nodeflow: emit  = {:?}", cli.emit);
        eprintln!("nodeflow: time  = {}", cli.time);
    }

    // ── Configuration ──
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).unwrap_or_else(|e| fail(format!("{}: {}", path.display(), e)));
            EngineConfig::from_json(&text).unwrap_or_else(|e| fail(format!("{}: {}", path.display(), e)))
        }
        None => EngineConfig::default(),
    };
    if let Some(depth) = cli.max_depth {
        config.max_depth = depth;
    }

    // ── Load document ──
    let text = std::fs::read_to_string(&cli.graph).unwrap_or_else(|e| fail(format!("{}: {}", cli.graph.display(), e)));
    let doc = GraphDocument::from_json(&text).unwrap_or_else(|e| fail(format!("{}: {}", cli.graph.display(), e)));
    let lib = library::standard().unwrap_or_else(|e| fail(e));
    let loaded = load_graph(&doc, lib.types, lib.symbols).unwrap_or_else(|e| fail(e));

    if cli.verbose {
        eprintln!(
            "nodeflow: loaded {} instances, {} connections, {} regions",
            loaded.graph.instance_count(),
            loaded.graph.connection_count(),
            loaded.regions.len()
        );
        if let Ok(fingerprint) = doc.fingerprint() {
            eprintln!("nodeflow: fingerprint = {}", fingerprint);
        }
    }

    match cli.emit {
        EmitStage::Dot => {
            print!("{}", dot::emit_dot(&loaded.graph));
            return;
        }
        EmitStage::Json => {
            let json = serialize_graph(&loaded.graph)
                .to_json_pretty()
                .unwrap_or_else(|e| fail(e));
            println!("{}", json);
            return;
        }
        EmitStage::Value => {}
    }

    // ── Resolve outputs ──
    let (names, outputs) = resolve_outputs(&loaded, &cli.output);
    if cli.verbose {
        eprintln!("nodeflow: evaluating {} outputs", outputs.len());
    }

    // ── Evaluate ──
    let engine = Engine::new(loaded.graph, config);
    let ctx = engine.context(cli.time);
    let evaluations = match engine.evaluate_many(&outputs, &ctx) {
        Ok(evaluations) => evaluations,
        Err(e) => {
            eprintln!("nodeflow: evaluation error: {}", e);
            std::process::exit(1);
        }
    };

    let mut failed = false;
    for (name, evaluation) in names.iter().zip(&evaluations) {
        println!("{} = {}", name, evaluation.value);
        for diag in &evaluation.diagnostics {
            eprintln!("nodeflow: {}", diag);
        }
        failed |= has_errors(&evaluation.diagnostics);
        if cli.verbose {
            eprintln!("nodeflow: {}: {}", name, evaluation.stats);
        }
    }
    for command in engine.drain_commands() {
        println!("{}", command);
    }

    if failed {
        std::process::exit(1);
    }
}

/// Resolve requested paths. With none requested: every top-level node
/// output in name order, then every top-level region result.
fn resolve_outputs(loaded: &LoadedGraph, requested: &[String]) -> (Vec<String>, Vec<OutputRef>) {
    if requested.is_empty() {
        let mut names = Vec::new();
        let mut outputs = Vec::new();
        for (name, id) in &loaded.nodes {
            let Some(inst) = loaded.graph.instance(*id) else { continue };
            if inst.scope().is_some() {
                continue;
            }
            for (index, slot) in inst.outputs().iter().enumerate() {
                names.push(format!("{}.{}", name, slot.name()));
                outputs.push(OutputRef::new(*id, index));
            }
        }
        for (name, id) in &loaded.regions {
            let Some(region) = loaded.graph.region(*id) else { continue };
            if region.parent().is_some() {
                continue;
            }
            for (index, result) in region.results().iter().enumerate() {
                names.push(format!("{}.{}", name, result.name));
                outputs.push(OutputRef::new(region.exit, index));
            }
        }
        return (names, outputs);
    }
    let outputs = requested
        .iter()
        .map(|path| {
            loaded
                .output(path)
                .unwrap_or_else(|| fail(format!("no output named '{}'", path)))
        })
        .collect();
    (requested.to_vec(), outputs)
}
