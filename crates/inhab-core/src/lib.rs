use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const INHAB_CHECKPOINT_FILENAME: &str = "run_result.json";
pub const INHAB_EVENTS_FILENAME: &str = "events.jsonl";
pub const INHAB_SCRATCH_DIRNAME: &str = "scratch";

pub const INHAB_ENV_DISPATCH_TIMEOUT_SECONDS: &str = "INHAB_DISPATCH_TIMEOUT_SECONDS";
pub const INHAB_ENV_RUN_DEADLINE_SECONDS: &str = "INHAB_RUN_DEADLINE_SECONDS";
pub const INHAB_ENV_CHECKPOINT_EVERY: &str = "INHAB_CHECKPOINT_EVERY";

const MAX_EXCERPT_CHARS: usize = 512;

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub out_dir: PathBuf,
    pub checkpoint: PathBuf,
    pub events: PathBuf,
    pub scratch_dir: PathBuf,
}

pub fn run_paths(out_dir: &Path) -> RunPaths {
    RunPaths {
        out_dir: out_dir.to_path_buf(),
        checkpoint: out_dir.join(INHAB_CHECKPOINT_FILENAME),
        events: out_dir.join(INHAB_EVENTS_FILENAME),
        scratch_dir: out_dir.join(INHAB_SCRATCH_DIRNAME),
    }
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    format!("sha256:{}", sha256_hex(bytes))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Serializes `value` with object keys sorted at every depth, so structurally
/// equal documents always produce identical bytes.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => out.push_str(&Value::String(s.clone()).to_string()),
        Value::Array(arr) => {
            out.push('[');
            for (idx, item) in arr.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (idx, (key, item)) in entries.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
    }
}

pub fn canonical_json_digest(value: &Value) -> String {
    sha256_bytes(canonical_json(value).as_bytes())
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Writes to a sibling temp file, fsyncs, then renames over `path`. Readers
/// observe either the previous contents or the new contents, never a mix.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Single-line excerpt of subprocess output, capped for error messages.
pub fn truncate_excerpt(raw: &str) -> String {
    let normalized = raw.trim().replace('\n', " ");
    if normalized.chars().count() <= MAX_EXCERPT_CHARS {
        return normalized;
    }
    normalized.chars().take(MAX_EXCERPT_CHARS).collect()
}

pub fn parse_optional_positive_u64_env(name: &str) -> Result<Option<u64>> {
    let raw = match std::env::var(name) {
        Ok(value) => value,
        Err(std::env::VarError::NotPresent) => return Ok(None),
        Err(err) => return Err(anyhow!("{} could not be read: {}", name, err)),
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let parsed = trimmed
        .parse::<u64>()
        .map_err(|_| anyhow!("{} must be a positive integer, got '{}'", name, trimmed))?;
    if parsed == 0 {
        return Err(anyhow!("{} must be > 0", name));
    }
    Ok(Some(parsed))
}
