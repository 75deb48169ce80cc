//! Run loop for inhabitation evaluation: plans from a planner, repaired and
//! validated, dispatched to a simulation engine and scored against targets,
//! with a checkpoint rewritten as items complete.

pub mod checkpoint;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod guards;
pub mod inventory;
pub mod planner;
pub mod process;
pub mod result;
pub mod sink;

pub use checkpoint::{checkpoint_document, ensure_resumable, load_checkpoint, write_checkpoint};
pub use config::{RunConfig, SimMode};
pub use dispatch::{
    interpret_response, DispatchOutcome, ProcessSimulator, SimulationEngine, SimulationRequest,
    SimulationSuccess,
};
pub use error::{CheckpointError, DispatchError, GuardTripped, HarnessError};
pub use guards::{current_parent_pid, RunGuards};
pub use inventory::{
    fetch_inventory, resolve_placeholders, Inventory, OwnedObject, OwnedObjectPage,
    OwnedObjectSource, PlaceholderResolution, RpcOwnedObjectSource,
};
pub use planner::{
    obtain_plan, parse_planner_reply, CommandPlanner, InterfaceDisclosure, Planner, PlannerReply,
    PlannerRequest, PlanningContext,
};
pub use result::{
    load_run_items, AggregateMetrics, RunItem, RunItemResult, RunResult, RUN_RESULT_SCHEMA_VERSION,
};
pub use sink::{EventRow, EventSink, JsonlEventSink};

use anyhow::{anyhow, Result};
use chrono::Utc;
use inhab_core::{ensure_dir, run_paths, RunPaths};
use inhab_plan::{
    generate_variants, missing_targets, normalize_plan, score_inhabitation, validate_causality,
    NormalizeOptions, Plan, ValidatedPlan,
};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

/// External parties the orchestrator talks to.
pub struct Collaborators {
    pub planner: Box<dyn Planner>,
    pub engine: Box<dyn SimulationEngine>,
    pub inventory: Box<dyn OwnedObjectSource>,
    pub sink: Box<dyn EventSink>,
}

/// Builds the process-backed collaborators described by `config`.
pub fn process_collaborators(config: &RunConfig, paths: &RunPaths) -> Result<Collaborators> {
    Ok(Collaborators {
        planner: Box::new(CommandPlanner::new(
            config.planner_command.clone(),
            config.planner_timeout(),
        )?),
        engine: Box::new(ProcessSimulator::new(
            config.engine_command.clone(),
            &paths.scratch_dir,
            config.dispatch_timeout(),
        )?),
        inventory: Box::new(RpcOwnedObjectSource::new(
            &config.rpc_url,
            config.dispatch_timeout(),
        )?),
        sink: Box::new(JsonlEventSink::new(&paths.events)?),
    })
}

/// A plan that survived planning, normalization and validation.
struct PreparedPlan {
    plan: ValidatedPlan,
}

struct DispatchWin {
    variant: String,
    gas_budget: Option<u64>,
    success: SimulationSuccess,
}

pub struct RunOrchestrator {
    config: RunConfig,
    paths: RunPaths,
    guards: RunGuards,
    collab: Collaborators,
    result: RunResult,
    since_checkpoint: usize,
}

impl RunOrchestrator {
    /// Starts a fresh run in `out_dir`. Refuses to overwrite an existing checkpoint.
    pub fn new(
        config: RunConfig,
        out_dir: &Path,
        guards: RunGuards,
        collab: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        let paths = run_paths(out_dir);
        if paths.checkpoint.exists() {
            return Err(anyhow!(
                "checkpoint already exists at {}; resume it or choose another output directory",
                paths.checkpoint.display()
            ));
        }
        ensure_dir(&paths.out_dir)?;
        let now = Utc::now();
        let run_id = format!("run_{}", now.format("%Y%m%d_%H%M%S"));
        let result = RunResult::new(&run_id, &now.to_rfc3339(), config.clone());
        let payload = json!({
            "agent": config.agent,
            "seed": config.seed,
            "sim_mode": config.sim_mode.as_str(),
        });
        let mut orchestrator = Self {
            config,
            paths,
            guards,
            collab,
            result,
            since_checkpoint: 0,
        };
        orchestrator.emit("run_started", None, payload);
        info!(run_id = %orchestrator.result.run_id, out_dir = %out_dir.display(), "run started");
        Ok(orchestrator)
    }

    /// Continues the run checkpointed in `out_dir`. The checkpoint must verify
    /// and must have been produced by the same agent, seed and mode.
    pub fn resume(
        config: RunConfig,
        out_dir: &Path,
        guards: RunGuards,
        collab: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        let paths = run_paths(out_dir);
        let mut result = load_checkpoint(&paths.checkpoint)?;
        ensure_resumable(&result.config, &config)?;
        result.config = config.clone();
        result.finished_at = None;
        let completed = result.items.len();
        let mut orchestrator = Self {
            config,
            paths,
            guards,
            collab,
            result,
            since_checkpoint: 0,
        };
        orchestrator.emit("run_resumed", None, json!({ "completed_items": completed }));
        info!(
            run_id = %orchestrator.result.run_id,
            completed,
            "resuming run from checkpoint"
        );
        Ok(orchestrator)
    }

    pub fn result(&self) -> &RunResult {
        &self.result
    }

    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    /// Processes `items` in order, skipping ids already in the result.
    ///
    /// Item failures are recorded and the run moves on. A guard trip, an
    /// exceeded error threshold, or an item failure with `continue_on_error`
    /// off ends the run with an error after the checkpoint is written.
    pub fn run(&mut self, items: &[RunItem]) -> Result<&RunResult> {
        let completed = self.result.completed_ids();
        for item in items {
            if completed.contains(&item.id) {
                debug!(item_id = %item.id, "item already completed; skipping");
                continue;
            }
            if let Err(trip) = self.guards.check() {
                return Err(self.abort_on_guard(anyhow!(trip), Some(item.id.as_str())));
            }

            self.emit(
                "item_started",
                Some(item.id.as_str()),
                json!({ "targets": item.targets.len() }),
            );
            let outcome = match self.run_item(item) {
                Ok(outcome) => outcome,
                Err(err) => return Err(self.abort_on_guard(err, Some(item.id.as_str()))),
            };
            let failed = outcome.error.clone();
            self.emit(
                "item_finished",
                Some(item.id.as_str()),
                json!({
                    "attempts": outcome.attempts,
                    "error": outcome.error,
                    "timed_out": outcome.timed_out,
                    "targets": outcome.score.targets,
                    "hits": outcome.score.created_hits,
                    "elapsed_seconds": outcome.elapsed_seconds,
                }),
            );
            info!(
                item_id = %item.id,
                attempts = outcome.attempts,
                hits = outcome.score.created_hits,
                targets = outcome.score.targets,
                error = outcome.error.as_deref().unwrap_or(""),
                "item finished"
            );
            self.result.items.push(outcome);
            self.since_checkpoint += 1;
            if self.since_checkpoint >= self.config.checkpoint_every {
                self.checkpoint()?;
            }

            if let Some(error) = failed {
                let errors = self.result.error_count();
                if let Some(max_errors) = self.config.max_errors {
                    if errors > max_errors {
                        self.checkpoint()?;
                        return Err(anyhow!(
                            "run aborted: {} item errors exceed max_errors={}",
                            errors,
                            max_errors
                        ));
                    }
                }
                if !self.config.continue_on_error {
                    self.checkpoint()?;
                    return Err(anyhow!(
                        "run aborted: item '{}' failed and continue_on_error is off: {}",
                        item.id,
                        error
                    ));
                }
            }
        }

        self.result.finished_at = Some(Utc::now().to_rfc3339());
        self.checkpoint()?;
        let aggregate = serde_json::to_value(&self.result.aggregate).unwrap_or(Value::Null);
        self.emit("run_finished", None, aggregate);
        if let Err(err) = self.collab.sink.flush() {
            warn!(error = %err, "failed to flush event log");
        }
        info!(
            run_id = %self.result.run_id,
            items = self.result.items.len(),
            errors = self.result.aggregate.items_with_error,
            elapsed_seconds = self.guards.elapsed().as_secs_f64(),
            "run finished"
        );
        Ok(&self.result)
    }

    fn abort_on_guard(&mut self, err: anyhow::Error, item_id: Option<&str>) -> anyhow::Error {
        if err.downcast_ref::<GuardTripped>().is_some() {
            warn!(error = %err, "guard tripped; aborting run");
            self.emit("guard_tripped", item_id, json!({ "reason": err.to_string() }));
        }
        if let Err(checkpoint_err) = self.checkpoint() {
            warn!(error = %checkpoint_err, "checkpoint after abort failed");
        }
        err
    }

    fn checkpoint(&mut self) -> Result<()> {
        self.result.refresh();
        let checksum = write_checkpoint(&self.paths.checkpoint, &self.result)?;
        self.since_checkpoint = 0;
        debug!(path = %self.paths.checkpoint.display(), checksum = %checksum, "checkpoint written");
        self.emit(
            "checkpoint_written",
            None,
            json!({ "checksum": checksum, "items": self.result.items.len() }),
        );
        Ok(())
    }

    fn emit(&mut self, event: &str, item_id: Option<&str>, payload: Value) {
        let row = EventRow::new(event, &self.result.run_id, item_id, payload);
        if let Err(err) = self.collab.sink.append(&row) {
            warn!(event, error = %err, "failed to append event");
        }
    }

    /// Drives one item to a terminal state. Every item-level failure ends up
    /// in the returned result; `Err` is reserved for run-fatal guard trips.
    fn run_item(&mut self, item: &RunItem) -> Result<RunItemResult> {
        let started = Instant::now();
        let mut out = RunItemResult::new(&item.id);
        let mut disclosure = InterfaceDisclosure::new(&item.interface);
        let mut feedback: Option<String> = None;
        let mut prepared: Option<PreparedPlan> = None;

        for attempt in 1..=self.config.max_attempts {
            self.guards.check()?;
            out.attempts = attempt;
            match self.prepare_plan(item, attempt, feedback.as_deref(), &mut disclosure, &mut out) {
                Ok(plan) => {
                    prepared = Some(plan);
                    break;
                }
                Err(err) => {
                    if let Some(harness) = err.downcast_ref::<HarnessError>() {
                        warn!(item_id = %item.id, attempt, error = %harness, "harness error; re-prompting");
                        self.emit(
                            "harness_error",
                            Some(item.id.as_str()),
                            json!({ "attempt": attempt, "error": harness.0 }),
                        );
                        feedback = Some(harness.0.clone());
                        continue;
                    }
                    out.error = Some(err.to_string());
                    return Ok(finish_item(out, item, started));
                }
            }
        }

        let Some(prepared) = prepared else {
            out.error = Some(
                HarnessError::new(feedback.unwrap_or_else(|| "no plan produced".to_string()))
                    .to_string(),
            );
            return Ok(finish_item(out, item, started));
        };

        self.dispatch_and_score(item, prepared, &mut out)?;
        Ok(finish_item(out, item, started))
    }

    /// One attempt at a usable plan. Unusable planner output comes
    /// back as a `HarnessError` so the caller can re-prompt.
    fn prepare_plan(
        &mut self,
        item: &RunItem,
        attempt: usize,
        feedback: Option<&str>,
        disclosure: &mut InterfaceDisclosure,
        out: &mut RunItemResult,
    ) -> Result<PreparedPlan> {
        let ctx = PlanningContext {
            item_id: &item.id,
            targets: &item.targets,
            seed: self.config.seed,
            attempt,
            feedback,
        };
        out.causality_score = None;
        let calls_before = out.planning_calls;
        let planned = obtain_plan(
            self.collab.planner.as_mut(),
            disclosure,
            &ctx,
            self.config.max_planning_calls,
            &mut out.planning_calls,
        );
        self.emit(
            "planner_call",
            Some(item.id.as_str()),
            json!({
                "attempt": attempt,
                "calls": out.planning_calls - calls_before,
                "ok": planned.is_ok(),
            }),
        );
        let raw = planned?;

        let options = NormalizeOptions {
            elide_placeholders: self.config.sim_mode == SimMode::BuildOnly,
        };
        let normalized = normalize_plan(&raw, &options);
        out.corrections = normalized.corrections;
        if !out.corrections.is_empty() {
            debug!(item_id = %item.id, corrections = out.corrections.len(), "plan normalized");
        }

        // Checked on the untyped plan; the score is kept when the plan is rejected.
        let validation = validate_causality(&normalized.plan);
        out.causality_score = Some(validation.causality_score);
        if !validation.valid {
            return Err(anyhow!(HarnessError::new(validation.errors.join("; "))));
        }

        let plan = Plan::from_value(&normalized.plan).map_err(|e| HarnessError::new(e.to_string()))?;
        let plan = ValidatedPlan::new(plan).map_err(|violation| HarnessError::new(violation.message))?;
        Ok(PreparedPlan { plan })
    }

    fn dispatch_and_score(
        &mut self,
        item: &RunItem,
        prepared: PreparedPlan,
        out: &mut RunItemResult,
    ) -> Result<()> {
        let requested = self.config.sim_mode;
        let mut mode = requested;
        let mut base = prepared.plan;

        if base.plan().placeholder_count() > 0 {
            let inventory = fetch_inventory(self.collab.inventory.as_ref(), &self.config.sender);
            let resolution = resolve_placeholders(base.plan(), &inventory);
            if !resolution.complete {
                debug!(
                    item_id = %item.id,
                    unresolved = ?resolution.unresolved,
                    "placeholders left unresolved"
                );
                if requested == SimMode::DryRun {
                    mode = SimMode::DevInspect;
                }
            }
            base = match ValidatedPlan::new(resolution.plan) {
                Ok(plan) => plan,
                Err(violation) => {
                    out.error = Some(violation.to_string());
                    return Ok(());
                }
            };
        }

        let variants = generate_variants(&base, &self.config.sender, self.config.max_variants);
        let ladder = self.config.gas_ladder();
        let mut last_failure: Option<String> = None;
        let mut win: Option<DispatchWin> = None;

        'variants: for variant in &variants {
            for gas_budget in &ladder {
                self.guards.check()?;
                let request = SimulationRequest {
                    rpc_url: self.config.rpc_url.clone(),
                    sender: self.config.sender.clone(),
                    mode,
                    plan: variant.plan.plan().clone(),
                    gas_budget: *gas_budget,
                    gas_coin: self.config.gas_coin.clone(),
                    bytecode_dir: item.bytecode_dir.clone(),
                };
                let outcome = match self.collab.engine.simulate(&request) {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        out.error = Some(DispatchError::Failed(err.to_string()).to_string());
                        return Ok(());
                    }
                };
                self.emit(
                    "dispatch",
                    Some(item.id.as_str()),
                    json!({
                        "variant": variant.name,
                        "gas_budget": gas_budget,
                        "mode": mode.as_str(),
                        "outcome": outcome.label(),
                    }),
                );
                match outcome {
                    DispatchOutcome::Success(success) => {
                        win = Some(DispatchWin {
                            variant: variant.name.clone(),
                            gas_budget: *gas_budget,
                            success,
                        });
                        break 'variants;
                    }
                    DispatchOutcome::Timeout { timeout } => {
                        out.timed_out = true;
                        out.error = Some(DispatchError::Timeout(timeout).to_string());
                        return Ok(());
                    }
                    failure @ DispatchOutcome::ProcessFailure { .. } => {
                        debug!(item_id = %item.id, variant = %variant.name, gas_budget = ?gas_budget, "engine failed; next gas rung");
                        last_failure = Some(failure.describe());
                    }
                    failure @ DispatchOutcome::MalformedOutput { .. } => {
                        debug!(item_id = %item.id, variant = %variant.name, "engine output malformed; next variant");
                        last_failure = Some(failure.describe());
                        continue 'variants;
                    }
                }
            }
        }

        let Some(win) = win else {
            out.error = Some(
                DispatchError::Failed(
                    last_failure.unwrap_or_else(|| "no dispatch attempted".to_string()),
                )
                .to_string(),
            );
            return Ok(());
        };

        let created = win.success.all_created_types();
        out.score = score_inhabitation(&item.targets, &created);
        out.missing_types = missing_targets(&item.targets, &created);
        out.hit_rate = out.score.hit_rate();
        out.sim_mode_used = Some(win.success.mode_used);
        out.mode_fallback = win.success.mode_used != requested;
        out.variant_used = Some(win.variant);
        out.gas_budget_used = win.gas_budget;
        if self.config.include_created_types {
            let mut types = created;
            types.sort();
            types.dedup();
            out.created_types = types;
        }
        Ok(())
    }
}

/// Items that never reached a successful simulation still count their
/// targets, all of them missing.
fn finish_item(mut out: RunItemResult, item: &RunItem, started: Instant) -> RunItemResult {
    if out.sim_mode_used.is_none() {
        out.score = score_inhabitation::<String, String>(&item.targets, &[]);
        out.hit_rate = out.score.hit_rate();
        out.missing_types = missing_targets::<String, String>(&item.targets, &[]);
    }
    out.elapsed_seconds = started.elapsed().as_secs_f64();
    out
}
