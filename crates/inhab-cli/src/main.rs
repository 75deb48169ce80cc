use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use inhab_core::run_paths;
use inhab_plan::{
    missing_targets, normalize_plan, score_inhabitation, validate_causality, NormalizeOptions,
};
use inhab_runner::{
    current_parent_pid, load_checkpoint, load_run_items, process_collaborators, RunConfig,
    RunGuards, RunOrchestrator, RunResult,
};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "inhab", version = "0.3.0", about = "Type inhabitation run harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run (or resume) an evaluation over a JSONL item manifest.
    Run {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        items: PathBuf,
        #[arg(long)]
        out_dir: PathBuf,
        #[arg(long)]
        resume: bool,
        /// Engine command line, split on whitespace. Overrides `engine_command`.
        #[arg(long)]
        engine: Option<String>,
        /// Planner command line, split on whitespace. Overrides `planner_command`.
        #[arg(long)]
        planner: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Repair a plan file and print the result with its corrections.
    Normalize {
        file: PathBuf,
        #[arg(long)]
        elide_placeholders: bool,
        #[arg(long)]
        json: bool,
    },
    /// Check a plan file's result references.
    Validate {
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Score created types against target types.
    Score {
        #[arg(long = "target")]
        targets: Vec<String>,
        #[arg(long = "created")]
        created: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Verify a checkpoint and print its aggregate.
    InspectCheckpoint {
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            config,
            items,
            out_dir,
            resume,
            engine,
            planner,
            json,
        } => {
            let mut run_config = RunConfig::load(&config)?;
            if let Some(engine) = engine {
                run_config.engine_command = split_command(&engine)?;
            }
            if let Some(planner) = planner {
                run_config.planner_command = split_command(&planner)?;
            }
            let result = execute_run(run_config, &items, &out_dir, resume)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "run_id": result.run_id,
                    "checkpoint": run_paths(&out_dir).checkpoint.display().to_string(),
                    "aggregate": result.aggregate,
                })));
            }
            print_run_summary(&result);
        }
        Commands::Normalize {
            file,
            elide_placeholders,
            json,
        } => {
            let raw = read_json(&file)?;
            let normalized = normalize_plan(&raw, &NormalizeOptions { elide_placeholders });
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "normalize",
                    "plan": normalized.plan,
                    "corrections": normalized.corrections,
                })));
            }
            println!("{}", serde_json::to_string_pretty(&normalized.plan)?);
            for c in &normalized.corrections {
                eprintln!(
                    "correction: call {} arg {}: {} ({})",
                    c.call_index,
                    c.arg_index,
                    c.kind.as_str(),
                    c.detail
                );
            }
        }
        Commands::Validate { file, json } => {
            let raw = read_json(&file)?;
            let validation = validate_causality(&raw);
            if json {
                return Ok(Some(json!({
                    "ok": validation.valid,
                    "command": "validate",
                    "validation": validation,
                })));
            }
            println!("valid: {}", validation.valid);
            println!("calls: {}", validation.call_count);
            println!(
                "result_references: {}/{} valid",
                validation.result_references_valid, validation.result_references_total
            );
            println!("causality_score: {:.3}", validation.causality_score);
            for error in &validation.errors {
                println!("  {}", error);
            }
            if !validation.valid {
                return Err(anyhow!("plan {} is not causally valid", file.display()));
            }
        }
        Commands::Score {
            targets,
            created,
            json,
        } => {
            let score = score_inhabitation(&targets, &created);
            let missing = missing_targets(&targets, &created);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "score",
                    "score": score,
                    "hit_rate": score.hit_rate(),
                    "missing": missing,
                })));
            }
            println!("targets: {}", score.targets);
            println!("created_distinct: {}", score.created_distinct);
            println!("created_hits: {}", score.created_hits);
            println!("missing: {}", score.missing);
            for t in &missing {
                println!("  {}", t);
            }
        }
        Commands::InspectCheckpoint { file, json } => {
            let result = load_checkpoint(&file)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "inspect-checkpoint",
                    "run_id": result.run_id,
                    "started_at": result.started_at,
                    "finished_at": result.finished_at,
                    "items": result.items.len(),
                    "aggregate": result.aggregate,
                })));
            }
            print_run_summary(&result);
            for item in &result.items {
                println!(
                    "  {} attempts={} hits={}/{} {}",
                    item.item_id,
                    item.attempts,
                    item.score.created_hits,
                    item.score.targets,
                    item.error.as_deref().unwrap_or("ok")
                );
            }
        }
    }
    Ok(None)
}

fn execute_run(config: RunConfig, items: &Path, out_dir: &Path, resume: bool) -> Result<RunResult> {
    let items = load_run_items(items)?;
    let paths = run_paths(out_dir);
    let guards = RunGuards::new()
        .with_deadline(config.run_deadline())
        .with_parent_pid(Some(current_parent_pid()));
    let cancel = guards.cancel_flag();
    ctrlc::set_handler(move || cancel.store(true, Ordering::SeqCst))
        .map_err(|e| anyhow!("failed to install Ctrl-C handler: {}", e))?;

    let collab = process_collaborators(&config, &paths)?;
    let mut orchestrator = if resume {
        RunOrchestrator::resume(config, out_dir, guards, collab)?
    } else {
        RunOrchestrator::new(config, out_dir, guards, collab)?
    };
    info!(items = items.len(), resume, "starting item loop");
    let result = orchestrator.run(&items)?;
    Ok(result.clone())
}

fn split_command(raw: &str) -> Result<Vec<String>> {
    let argv: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
    if argv.is_empty() {
        return Err(anyhow!("command must not be empty"));
    }
    Ok(argv)
}

fn read_json(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read {}: {}", path.display(), e))?;
    serde_json::from_str(&raw).map_err(|e| anyhow!("{} is not valid JSON: {}", path.display(), e))
}

fn print_run_summary(result: &RunResult) {
    let agg = &result.aggregate;
    println!("run_id: {}", result.run_id);
    println!("agent: {}", result.config.agent);
    println!("sim_mode: {}", result.config.sim_mode.as_str());
    println!(
        "items: {} ({} with errors, {} timed out)",
        agg.items_total, agg.items_with_error, agg.items_timed_out
    );
    println!("hits: {}/{}", agg.total_hits, agg.total_targets);
    match agg.avg_hit_rate {
        Some(rate) => println!("avg_hit_rate: {:.3}", rate),
        None => println!("avg_hit_rate: n/a"),
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Normalize { json, .. }
        | Commands::Validate { json, .. }
        | Commands::Score { json, .. }
        | Commands::InspectCheckpoint { json, .. } => *json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "inhab", "run", "--config", "c.yaml", "--items", "i.jsonl", "--out-dir", "out",
            "--resume", "--engine", "sui-sandbox ptb", "--json",
        ])
        .expect("cli should parse");
        assert!(command_json_mode(&cli.command));
        match cli.command {
            Commands::Run {
                resume, engine, ..
            } => {
                assert!(resume);
                assert_eq!(
                    split_command(&engine.expect("engine")).expect("argv"),
                    vec!["sui-sandbox", "ptb"]
                );
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn score_accepts_repeated_types_with_commas() {
        let cli = Cli::try_parse_from([
            "inhab",
            "score",
            "--target",
            "0x2::table::Table<0x2::a::A, u64>",
            "--created",
            "0x2::table::Table<0x2::a::A, u8>",
        ])
        .expect("cli should parse");
        match run_command(cli.command).expect("score") {
            None => {}
            Some(other) => panic!("unexpected payload {}", other),
        }
    }

    #[test]
    fn json_error_shape() {
        let err = json_error("command_failed", "boom".to_string(), json!({}));
        assert_eq!(err["ok"], false);
        assert_eq!(err["error"]["code"], "command_failed");
        assert!(split_command("   ").is_err());
    }
}
