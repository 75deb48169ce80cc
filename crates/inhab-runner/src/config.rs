use anyhow::{anyhow, Result};
use inhab_core::{
    parse_optional_positive_u64_env, INHAB_ENV_CHECKPOINT_EVERY,
    INHAB_ENV_DISPATCH_TIMEOUT_SECONDS, INHAB_ENV_RUN_DEADLINE_SECONDS,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SimMode {
    #[serde(rename = "dry-run")]
    DryRun,
    #[serde(rename = "dev-inspect")]
    DevInspect,
    #[serde(rename = "build-only")]
    BuildOnly,
}

impl SimMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DryRun => "dry-run",
            Self::DevInspect => "dev-inspect",
            Self::BuildOnly => "build-only",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim() {
            "dry-run" => Ok(Self::DryRun),
            "dev-inspect" => Ok(Self::DevInspect),
            "build-only" => Ok(Self::BuildOnly),
            other => Err(anyhow!(
                "unsupported simulation mode: {} (expected dry-run|dev-inspect|build-only)",
                other
            )),
        }
    }
}

fn default_sim_mode() -> SimMode {
    SimMode::DryRun
}

fn default_max_attempts() -> usize {
    3
}

fn default_max_planning_calls() -> usize {
    4
}

fn default_max_variants() -> usize {
    6
}

fn default_checkpoint_every() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_dispatch_timeout_seconds() -> u64 {
    120
}

fn default_planner_timeout_seconds() -> u64 {
    300
}

/// Everything that shapes one run. Echoed verbatim into the checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub agent: String,
    #[serde(default)]
    pub seed: u64,
    pub rpc_url: String,
    pub sender: String,
    #[serde(default = "default_sim_mode")]
    pub sim_mode: SimMode,
    #[serde(default)]
    pub gas_budget: Option<u64>,
    #[serde(default)]
    pub gas_budget_ladder: Vec<u64>,
    #[serde(default)]
    pub gas_coin: Option<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_max_planning_calls")]
    pub max_planning_calls: usize,
    #[serde(default = "default_max_variants")]
    pub max_variants: usize,
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
    #[serde(default)]
    pub max_errors: Option<usize>,
    #[serde(default = "default_true")]
    pub continue_on_error: bool,
    #[serde(default)]
    pub run_deadline_seconds: Option<u64>,
    #[serde(default = "default_dispatch_timeout_seconds")]
    pub dispatch_timeout_seconds: u64,
    #[serde(default = "default_planner_timeout_seconds")]
    pub planner_timeout_seconds: u64,
    #[serde(default)]
    pub include_created_types: bool,
    #[serde(default)]
    pub engine_command: Vec<String>,
    #[serde(default)]
    pub planner_command: Vec<String>,
}

impl RunConfig {
    /// Loads YAML (JSON is accepted as a YAML subset) and applies env overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read run config {}: {}", path.display(), e))?;
        let mut config: RunConfig = serde_yaml::from_str(&raw)
            .map_err(|e| anyhow!("invalid run config {}: {}", path.display(), e))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(seconds) = parse_optional_positive_u64_env(INHAB_ENV_DISPATCH_TIMEOUT_SECONDS)? {
            self.dispatch_timeout_seconds = seconds;
        }
        if let Some(seconds) = parse_optional_positive_u64_env(INHAB_ENV_RUN_DEADLINE_SECONDS)? {
            self.run_deadline_seconds = Some(seconds);
        }
        if let Some(every) = parse_optional_positive_u64_env(INHAB_ENV_CHECKPOINT_EVERY)? {
            self.checkpoint_every = every as usize;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.trim().is_empty() {
            return Err(anyhow!("run config: agent must not be empty"));
        }
        if self.sender.trim().is_empty() {
            return Err(anyhow!("run config: sender must not be empty"));
        }
        for (name, value) in [
            ("max_attempts", self.max_attempts),
            ("max_planning_calls", self.max_planning_calls),
            ("max_variants", self.max_variants),
            ("checkpoint_every", self.checkpoint_every),
        ] {
            if value == 0 {
                return Err(anyhow!("run config: {} must be > 0", name));
            }
        }
        if self.dispatch_timeout_seconds == 0 {
            return Err(anyhow!("run config: dispatch_timeout_seconds must be > 0"));
        }
        if self.gas_budget == Some(0) || self.gas_budget_ladder.contains(&0) {
            return Err(anyhow!("run config: gas budgets must be > 0"));
        }
        Ok(())
    }

    /// Gas budgets to try in order: the base budget (or the engine default
    /// when unset) first, then the remaining ladder values ascending.
    pub fn gas_ladder(&self) -> Vec<Option<u64>> {
        let mut rest: Vec<u64> = self
            .gas_budget_ladder
            .iter()
            .copied()
            .filter(|budget| Some(*budget) != self.gas_budget)
            .collect();
        rest.sort_unstable();
        rest.dedup();
        let mut ladder = vec![self.gas_budget];
        ladder.extend(rest.into_iter().map(Some));
        ladder
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_seconds)
    }

    pub fn planner_timeout(&self) -> Duration {
        Duration::from_secs(self.planner_timeout_seconds)
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_deadline_seconds.map(Duration::from_secs)
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> RunConfig {
    RunConfig {
        agent: "test-agent".to_string(),
        seed: 7,
        rpc_url: "http://127.0.0.1:9".to_string(),
        sender: "0xa11ce".to_string(),
        sim_mode: SimMode::DryRun,
        gas_budget: Some(10_000_000),
        gas_budget_ladder: vec![],
        gas_coin: None,
        max_attempts: 3,
        max_planning_calls: 4,
        max_variants: 6,
        checkpoint_every: 1,
        max_errors: None,
        continue_on_error: true,
        run_deadline_seconds: None,
        dispatch_timeout_seconds: 5,
        planner_timeout_seconds: 5,
        include_created_types: false,
        engine_command: vec![],
        planner_command: vec![],
    }
}
