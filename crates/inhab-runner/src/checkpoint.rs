use crate::config::RunConfig;
use crate::error::CheckpointError;
use crate::result::RunResult;
use anyhow::Result;
use inhab_core::{atomic_write_json_pretty, canonical_json_digest};
use inhab_schemas::{compile_schema, RUN_RESULT_SCHEMA};
use serde_json::Value;
use std::fs;
use std::path::Path;

const CHECKSUM_KEY: &str = "checksum";

/// Serializes `result` (items sorted, aggregate recomputed) and stamps the
/// checksum over the document without its checksum field.
pub fn checkpoint_document(result: &RunResult) -> Result<Value> {
    let mut snapshot = result.clone();
    snapshot.refresh();
    let mut doc = serde_json::to_value(&snapshot)?;
    let checksum = canonical_json_digest(&doc);
    if let Some(map) = doc.as_object_mut() {
        map.insert(CHECKSUM_KEY.to_string(), Value::String(checksum));
    }
    Ok(doc)
}

/// Atomically replaces the checkpoint with the full current result.
/// Returns the checksum written.
pub fn write_checkpoint(path: &Path, result: &RunResult) -> Result<String> {
    let doc = checkpoint_document(result)?;
    atomic_write_json_pretty(path, &doc)?;
    Ok(doc
        .get(CHECKSUM_KEY)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string())
}

/// Loads and verifies a checkpoint. Corruption of any kind is an error; a
/// damaged file is never partially trusted.
pub fn load_checkpoint(path: &Path) -> Result<RunResult, CheckpointError> {
    let unreadable = |reason: String| CheckpointError::Unreadable {
        path: path.to_path_buf(),
        reason,
    };
    let bytes = fs::read(path).map_err(|e| unreadable(e.to_string()))?;
    let mut doc: Value =
        serde_json::from_slice(&bytes).map_err(|e| unreadable(format!("invalid JSON: {}", e)))?;

    let recorded = doc
        .as_object_mut()
        .and_then(|map| map.remove(CHECKSUM_KEY))
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| unreadable("missing checksum".to_string()))?;
    let computed = canonical_json_digest(&doc);
    if recorded != computed {
        return Err(CheckpointError::ChecksumMismatch {
            path: path.to_path_buf(),
            recorded,
            computed,
        });
    }

    let schema = compile_schema(RUN_RESULT_SCHEMA).map_err(|e| unreadable(e.to_string()))?;
    if let Some(map) = doc.as_object_mut() {
        map.insert(CHECKSUM_KEY.to_string(), Value::String(recorded));
    }
    if let Err(errors) = schema.validate(&doc) {
        let msgs: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(unreadable(format!("schema violation: {}", msgs.join("; "))));
    }
    if let Some(map) = doc.as_object_mut() {
        map.remove(CHECKSUM_KEY);
    }
    serde_json::from_value(doc).map_err(|e| unreadable(e.to_string()))
}

/// A checkpoint may only be resumed by a run with the same identity.
pub fn ensure_resumable(checkpoint: &RunConfig, current: &RunConfig) -> Result<(), CheckpointError> {
    if checkpoint.agent != current.agent {
        return Err(CheckpointError::ConfigMismatch {
            field: "agent",
            checkpoint: checkpoint.agent.clone(),
            current: current.agent.clone(),
        });
    }
    if checkpoint.seed != current.seed {
        return Err(CheckpointError::ConfigMismatch {
            field: "seed",
            checkpoint: checkpoint.seed.to_string(),
            current: current.seed.to_string(),
        });
    }
    if checkpoint.sim_mode != current.sim_mode {
        return Err(CheckpointError::ConfigMismatch {
            field: "sim_mode",
            checkpoint: checkpoint.sim_mode.as_str().to_string(),
            current: current.sim_mode.as_str().to_string(),
        });
    }
    Ok(())
}
