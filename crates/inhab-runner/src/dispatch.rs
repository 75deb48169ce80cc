use crate::config::SimMode;
use crate::process::{command_from_argv, run_with_timeout, ProcessOutcome};
use anyhow::{anyhow, Result};
use inhab_core::{ensure_dir, truncate_excerpt};
use inhab_plan::Plan;
use inhab_schemas::{compile_schema, SIM_RESPONSE_SCHEMA};
use jsonschema::JSONSchema;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationRequest {
    pub rpc_url: String,
    pub sender: String,
    pub mode: SimMode,
    pub plan: Plan,
    pub gas_budget: Option<u64>,
    pub gas_coin: Option<String>,
    pub bytecode_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationSuccess {
    /// `dryRun` payload when present, otherwise `devInspect`, otherwise null.
    pub effects: Value,
    pub created_types: Vec<String>,
    pub static_created_types: Vec<String>,
    pub mode_used: SimMode,
}

impl SimulationSuccess {
    /// Dynamic and statically inferred created types, in that order.
    pub fn all_created_types(&self) -> Vec<String> {
        self.created_types
            .iter()
            .chain(self.static_created_types.iter())
            .cloned()
            .collect()
    }
}

/// Every way one engine invocation can end. Callers match on this instead of
/// on subprocess errors.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Success(SimulationSuccess),
    Timeout {
        timeout: Duration,
    },
    ProcessFailure {
        exit_code: Option<i32>,
        stderr_excerpt: String,
    },
    MalformedOutput {
        reason: String,
        excerpt: String,
    },
}

impl DispatchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Timeout { .. } => "timeout",
            Self::ProcessFailure { .. } => "process_failure",
            Self::MalformedOutput { .. } => "malformed_output",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Success(success) => format!("success ({})", success.mode_used.as_str()),
            Self::Timeout { timeout } => {
                format!("engine did not respond within {}s", timeout.as_secs_f64())
            }
            Self::ProcessFailure {
                exit_code,
                stderr_excerpt,
            } => format!(
                "engine exited with status {}: {}",
                exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr_excerpt
            ),
            Self::MalformedOutput { reason, excerpt } => {
                format!("engine output unusable ({}): {}", reason, excerpt)
            }
        }
    }
}

/// A single-shot simulation call. Gas retries live in the orchestrator.
pub trait SimulationEngine {
    fn simulate(&mut self, request: &SimulationRequest) -> Result<DispatchOutcome>;
}

/// Runs an external engine binary, one subprocess per request.
pub struct ProcessSimulator {
    argv: Vec<String>,
    scratch_dir: PathBuf,
    timeout: Duration,
    next_slot: u64,
    response_schema: JSONSchema,
}

impl ProcessSimulator {
    pub fn new(argv: Vec<String>, scratch_dir: &Path, timeout: Duration) -> Result<Self> {
        if argv.is_empty() {
            return Err(anyhow!("engine command must not be empty"));
        }
        ensure_dir(scratch_dir)?;
        Ok(Self {
            argv,
            scratch_dir: scratch_dir.to_path_buf(),
            timeout,
            next_slot: 0,
            response_schema: compile_schema(SIM_RESPONSE_SCHEMA)?,
        })
    }

    fn request_path(&mut self) -> PathBuf {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.scratch_dir.join(format!("ptb_spec_{:06}.json", slot))
    }
}

impl SimulationEngine for ProcessSimulator {
    fn simulate(&mut self, request: &SimulationRequest) -> Result<DispatchOutcome> {
        let path = self.request_path();
        fs::write(&path, serde_json::to_vec_pretty(&request.plan)?)?;
        let _guard = RequestFileGuard { path: path.clone() };

        let mut cmd = command_from_argv(&self.argv)?;
        cmd.arg("--rpc-url")
            .arg(&request.rpc_url)
            .arg("--sender")
            .arg(&request.sender)
            .arg("--mode")
            .arg(request.mode.as_str())
            .arg("--ptb-spec")
            .arg(&path);
        if let Some(budget) = request.gas_budget {
            cmd.arg("--gas-budget").arg(budget.to_string());
        }
        if let Some(coin) = request.gas_coin.as_deref() {
            cmd.arg("--gas-coin").arg(coin);
        }
        if let Some(dir) = request.bytecode_dir.as_deref() {
            cmd.arg("--bytecode-package-dir").arg(dir);
        }

        debug!(
            request = %path.display(),
            mode = request.mode.as_str(),
            gas_budget = ?request.gas_budget,
            "invoking simulation engine"
        );
        let outcome = match run_with_timeout(cmd, None, self.timeout)? {
            ProcessOutcome::TimedOut => DispatchOutcome::Timeout {
                timeout: self.timeout,
            },
            ProcessOutcome::Exited {
                exit_code: Some(0),
                stdout,
                ..
            } => interpret_response(&stdout, request.mode, &self.response_schema),
            ProcessOutcome::Exited {
                exit_code, stderr, ..
            } => DispatchOutcome::ProcessFailure {
                exit_code,
                stderr_excerpt: truncate_excerpt(&stderr),
            },
        };
        Ok(outcome)
    }
}

struct RequestFileGuard {
    path: PathBuf,
}

impl Drop for RequestFileGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Turns engine stdout into an outcome. Never fails: anything unusable is
/// reported as `MalformedOutput`.
pub fn interpret_response(stdout: &str, requested: SimMode, schema: &JSONSchema) -> DispatchOutcome {
    let malformed = |reason: String| DispatchOutcome::MalformedOutput {
        reason,
        excerpt: truncate_excerpt(stdout),
    };
    let value: Value = match serde_json::from_str(stdout.trim()) {
        Ok(value) => value,
        Err(err) => return malformed(format!("not JSON: {}", err)),
    };
    if !value.is_object() {
        return malformed("response is not a JSON object".to_string());
    }
    if let Err(errors) = schema.validate(&value) {
        let msgs: Vec<String> = errors.map(|e| e.to_string()).collect();
        return malformed(format!("schema violation: {}", msgs.join("; ")));
    }

    let effects = ["dryRun", "devInspect"]
        .iter()
        .filter_map(|key| value.get(*key))
        .find(|v| v.is_object())
        .cloned()
        .unwrap_or(Value::Null);
    let mode_used = value
        .get("modeUsed")
        .and_then(Value::as_str)
        .and_then(|raw| SimMode::parse(raw).ok())
        .unwrap_or(requested);

    DispatchOutcome::Success(SimulationSuccess {
        effects,
        created_types: string_list(&value, "createdObjectTypes"),
        static_created_types: string_list(&value, "staticCreatedObjectTypes"),
        mode_used,
    })
}

fn string_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
