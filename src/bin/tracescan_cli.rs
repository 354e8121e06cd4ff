use anyhow::{Context, Result};
use serde::Serialize;
use std::{env, fs};
use tracescan::{
    about,
    engine::{Engine, Operation, ProjectState, TraceEngine, Workflow},
    parameter::ParameterInfo,
};

const DEFAULT_STATE_PATH: &str = ".tracescan_state.json";

#[derive(Serialize)]
struct TraceSummary {
    id: String,
    name: String,
    samples: usize,
    bases: usize,
    clip_left: usize,
    clip_right: usize,
    strand: &'static str,
}

#[derive(Serialize)]
struct StateSummary {
    trace_count: usize,
    traces: Vec<TraceSummary>,
    parameters: Vec<ParameterInfo>,
}

fn usage() {
    eprintln!(
        "Usage:\n  \
  tracescan_cli --version\n  \
  tracescan_cli [--state PATH] capabilities\n  \
  tracescan_cli [--state PATH] parameters\n  \
  tracescan_cli [--state PATH] op '<operation-json>'\n  \
  tracescan_cli [--state PATH] workflow '<workflow-json>'\n  \
  tracescan_cli [--state PATH] state-summary\n  \
  tracescan_cli [--state PATH] export-state PATH\n  \
  tracescan_cli [--state PATH] import-state PATH\n\n  \
  Tip: pass @file.json instead of inline JSON; set RUST_LOG=info for progress"
    );
}

fn load_json_arg(value: &str) -> Result<String> {
    match value.strip_prefix('@') {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("Could not read JSON file '{path}'"))
        }
        None => Ok(value.to_string()),
    }
}

fn load_state(path: &str) -> Result<ProjectState> {
    if std::path::Path::new(path).exists() {
        Ok(ProjectState::load_from_path(path)?)
    } else {
        Ok(ProjectState::default())
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Could not serialize JSON output")?;
    println!("{text}");
    Ok(())
}

fn parse_global_state_arg(args: &[String]) -> (String, usize) {
    if args.len() >= 3 && args[1] == "--state" {
        return (args[2].clone(), 3);
    }
    (DEFAULT_STATE_PATH.to_string(), 1)
}

fn summarize_state(engine: &TraceEngine) -> StateSummary {
    let mut traces: Vec<TraceSummary> = engine
        .state()
        .traces
        .iter()
        .map(|(id, trace)| TraceSummary {
            id: id.to_string(),
            name: trace.name.clone(),
            samples: trace.len(),
            bases: trace.num_bases(),
            clip_left: trace.clip_left,
            clip_right: trace.clip_right,
            strand: trace.strand.as_str(),
        })
        .collect();
    traces.sort_by(|a, b| a.id.cmp(&b.id));

    StateSummary {
        trace_count: traces.len(),
        traces,
        parameters: engine.state().parameters.describe(),
    }
}

fn argument<'a>(args: &'a [String], idx: usize, what: &str) -> Result<&'a str> {
    match args.get(idx) {
        Some(arg) => Ok(arg.as_str()),
        None => {
            usage();
            anyhow::bail!("Missing {what}")
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    if let Err(e) = run() {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() <= 1 {
        usage();
        anyhow::bail!("Missing command");
    }
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("{}", about::version_cli_text());
        return Ok(());
    }

    let (state_path, cmd_idx) = parse_global_state_arg(&args);
    let command = argument(&args, cmd_idx, "command")?;

    match command {
        "capabilities" => print_json(&TraceEngine::capabilities()),
        "parameters" => {
            let state = load_state(&state_path)?;
            print_json(&state.parameters.describe())
        }
        "import-state" => {
            let source = argument(&args, cmd_idx + 1, "path for import-state")?;
            let state = ProjectState::load_from_path(source)?;
            state.save_to_path(&state_path)?;
            println!("Loaded state from '{source}' into '{state_path}'");
            Ok(())
        }
        "export-state" => {
            let target = argument(&args, cmd_idx + 1, "path for export-state")?;
            let state = load_state(&state_path)?;
            state.save_to_path(target)?;
            println!("Saved state from '{state_path}' to '{target}'");
            Ok(())
        }
        "state-summary" => {
            let engine = TraceEngine::from_state(load_state(&state_path)?);
            print_json(&summarize_state(&engine))
        }
        "op" => {
            let json = load_json_arg(argument(&args, cmd_idx + 1, "operation JSON")?)?;
            let op: Operation = serde_json::from_str(&json).context("Invalid operation JSON")?;

            let mut engine = TraceEngine::from_state(load_state(&state_path)?);
            let result = engine.apply(op)?;
            engine.state().save_to_path(&state_path)?;
            print_json(&result)
        }
        "workflow" => {
            let json = load_json_arg(argument(&args, cmd_idx + 1, "workflow JSON")?)?;
            let workflow: Workflow =
                serde_json::from_str(&json).context("Invalid workflow JSON")?;

            let mut engine = TraceEngine::from_state(load_state(&state_path)?);
            let results = engine.apply_workflow(workflow)?;
            engine.state().save_to_path(&state_path)?;
            print_json(&results)
        }
        _ => {
            usage();
            anyhow::bail!("Unknown command '{command}'")
        }
    }
}
