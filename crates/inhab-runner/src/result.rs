use crate::config::{RunConfig, SimMode};
use anyhow::{anyhow, Result};
use inhab_plan::{Correction, InhabitationScore};
use inhab_schemas::{compile_schema, validate_against, RUN_ITEM_SCHEMA};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const RUN_RESULT_SCHEMA_VERSION: &str = "run_result_v1";

/// One package to inhabit: its interface and the types the planner must create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunItem {
    pub id: String,
    #[serde(default)]
    pub interface: Value,
    pub targets: Vec<String>,
    #[serde(default)]
    pub bytecode_dir: Option<PathBuf>,
}

/// Reads a JSONL manifest, validating each line and rejecting duplicate ids.
pub fn load_run_items(path: &Path) -> Result<Vec<RunItem>> {
    let raw = fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read run items {}: {}", path.display(), e))?;
    let schema = compile_schema(RUN_ITEM_SCHEMA)?;
    let mut seen = HashSet::new();
    let mut items = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let what = format!("{}:{}", path.display(), idx + 1);
        let value: Value =
            serde_json::from_str(line).map_err(|e| anyhow!("{} is not valid JSON: {}", what, e))?;
        validate_against(&schema, &value, &what)?;
        let item: RunItem = serde_json::from_value(value)?;
        if !seen.insert(item.id.clone()) {
            return Err(anyhow!("{}: duplicate item id '{}'", what, item.id));
        }
        items.push(item);
    }
    Ok(items)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunItemResult {
    pub item_id: String,
    pub score: InhabitationScore,
    #[serde(default)]
    pub hit_rate: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
    pub elapsed_seconds: f64,
    pub timed_out: bool,
    pub attempts: usize,
    #[serde(default)]
    pub planning_calls: usize,
    #[serde(default)]
    pub sim_mode_used: Option<SimMode>,
    #[serde(default)]
    pub mode_fallback: bool,
    #[serde(default)]
    pub created_types: Vec<String>,
    #[serde(default)]
    pub missing_types: Vec<String>,
    #[serde(default)]
    pub corrections: Vec<Correction>,
    #[serde(default)]
    pub causality_score: Option<f64>,
    #[serde(default)]
    pub variant_used: Option<String>,
    #[serde(default)]
    pub gas_budget_used: Option<u64>,
}

impl RunItemResult {
    pub fn new(item_id: &str) -> Self {
        Self {
            item_id: item_id.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    pub items_total: usize,
    pub items_with_error: usize,
    pub items_timed_out: usize,
    pub items_with_hits: usize,
    pub total_targets: usize,
    pub total_hits: usize,
    /// Mean hit rate over items that declared at least one target.
    pub avg_hit_rate: Option<f64>,
    pub max_hit_rate: Option<f64>,
    pub avg_created_distinct: f64,
    pub total_attempts: usize,
    pub mode_fallbacks: usize,
    pub avg_elapsed_seconds: f64,
}

impl AggregateMetrics {
    pub fn from_items(items: &[RunItemResult]) -> Self {
        let mut agg = Self {
            items_total: items.len(),
            ..Self::default()
        };
        if items.is_empty() {
            return agg;
        }
        let mut rates = Vec::new();
        let mut created_sum = 0usize;
        let mut elapsed_sum = 0f64;
        for item in items {
            if item.error.is_some() {
                agg.items_with_error += 1;
            }
            if item.timed_out {
                agg.items_timed_out += 1;
            }
            if item.score.created_hits > 0 {
                agg.items_with_hits += 1;
            }
            if item.mode_fallback {
                agg.mode_fallbacks += 1;
            }
            agg.total_targets += item.score.targets;
            agg.total_hits += item.score.created_hits;
            agg.total_attempts += item.attempts;
            created_sum += item.score.created_distinct;
            elapsed_sum += item.elapsed_seconds;
            if let Some(rate) = item.score.hit_rate() {
                rates.push(rate);
            }
        }
        let n = items.len() as f64;
        agg.avg_created_distinct = created_sum as f64 / n;
        agg.avg_elapsed_seconds = elapsed_sum / n;
        if !rates.is_empty() {
            agg.avg_hit_rate = Some(rates.iter().sum::<f64>() / rates.len() as f64);
            agg.max_hit_rate = rates.iter().copied().reduce(f64::max);
        }
        agg
    }
}

/// Full state of a run. Rewritten in its entirety on every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub schema_version: String,
    pub run_id: String,
    pub started_at: String,
    #[serde(default)]
    pub finished_at: Option<String>,
    pub config: RunConfig,
    pub items: Vec<RunItemResult>,
    pub aggregate: AggregateMetrics,
}

impl RunResult {
    pub fn new(run_id: &str, started_at: &str, config: RunConfig) -> Self {
        Self {
            schema_version: RUN_RESULT_SCHEMA_VERSION.to_string(),
            run_id: run_id.to_string(),
            started_at: started_at.to_string(),
            finished_at: None,
            config,
            items: Vec::new(),
            aggregate: AggregateMetrics::default(),
        }
    }

    pub fn completed_ids(&self) -> HashSet<String> {
        self.items.iter().map(|item| item.item_id.clone()).collect()
    }

    pub fn error_count(&self) -> usize {
        self.items.iter().filter(|item| item.error.is_some()).count()
    }

    /// Sorts items by id and recomputes the aggregate.
    pub fn refresh(&mut self) {
        self.items.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        self.aggregate = AggregateMetrics::from_items(&self.items);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn scored(id: &str, targets: usize, hits: usize) -> RunItemResult {
        RunItemResult {
            score: InhabitationScore {
                targets,
                created_distinct: hits + 1,
                created_hits: hits,
                missing: targets - hits,
            },
            attempts: 1,
            elapsed_seconds: 2.0,
            ..RunItemResult::new(id)
        }
    }

    #[test]
    fn aggregate_counts_and_averages() {
        let mut errored = scored("c", 0, 0);
        errored.error = Some("dispatch timeout".to_string());
        errored.timed_out = true;
        errored.attempts = 3;
        let mut fallback = scored("b", 2, 1);
        fallback.mode_fallback = true;
        let items = vec![scored("a", 1, 1), fallback, errored];

        let agg = AggregateMetrics::from_items(&items);
        assert_eq!(agg.items_total, 3);
        assert_eq!(agg.items_with_error, 1);
        assert_eq!(agg.items_timed_out, 1);
        assert_eq!(agg.items_with_hits, 2);
        assert_eq!(agg.total_targets, 3);
        assert_eq!(agg.total_hits, 2);
        assert_eq!(agg.avg_hit_rate, Some(0.75));
        assert_eq!(agg.max_hit_rate, Some(1.0));
        assert_eq!(agg.total_attempts, 5);
        assert_eq!(agg.mode_fallbacks, 1);
        assert_eq!(agg.avg_elapsed_seconds, 2.0);
        assert!((agg.avg_created_distinct - 5.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn empty_aggregate_has_no_rates() {
        let agg = AggregateMetrics::from_items(&[]);
        assert_eq!(agg.items_total, 0);
        assert_eq!(agg.avg_hit_rate, None);
        assert_eq!(agg.avg_elapsed_seconds, 0.0);
    }

    #[test]
    fn run_items_manifest_is_validated() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("inhab_items_{}", nanos));
        fs::create_dir_all(&dir).expect("dir");

        let good = dir.join("good.jsonl");
        fs::write(
            &good,
            "{\"id\":\"a\",\"targets\":[\"0x2::a::A\"],\"interface\":{\"summary\":\"s\"}}\n\n{\"id\":\"b\",\"targets\":[]}\n",
        )
        .expect("write");
        let items = load_run_items(&good).expect("items");
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].interface, Value::Null);

        let dup = dir.join("dup.jsonl");
        fs::write(&dup, "{\"id\":\"a\",\"targets\":[]}\n{\"id\":\"a\",\"targets\":[]}\n")
            .expect("write");
        assert!(load_run_items(&dup)
            .expect_err("duplicate")
            .to_string()
            .contains("duplicate item id"));

        let invalid = dir.join("invalid.jsonl");
        fs::write(&invalid, "{\"id\":\"\",\"targets\":[]}\n").expect("write");
        assert!(load_run_items(&invalid)
            .expect_err("empty id")
            .to_string()
            .contains("failed schema validation"));
        let _ = fs::remove_dir_all(&dir);
    }
}
