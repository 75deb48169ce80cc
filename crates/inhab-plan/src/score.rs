use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;

const CANONICAL_ADDRESS_HEX_LEN: usize = 64;

fn type_address_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // An address is the token at the start of a type or right after `<`, `,`
    // or whitespace, immediately followed by `::`.
    RE.get_or_init(|| {
        Regex::new(r"(^|[<,\s])((?:0[xX])?[0-9a-fA-F]+)::").expect("type address pattern")
    })
}

/// Pads a hex address to the canonical 32-byte `0x`-prefixed lowercase form.
///
/// Input that is not hex is returned trimmed but otherwise untouched. Hex
/// longer than 32 bytes keeps its length (only case and prefix are fixed).
pub fn canonicalize_address(addr: &str) -> String {
    let trimmed = addr.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return trimmed.to_string();
    }
    let lower = hex.to_ascii_lowercase();
    if lower.len() > CANONICAL_ADDRESS_HEX_LEN {
        return format!("0x{}", lower);
    }
    format!("0x{:0>width$}", lower, width = CANONICAL_ADDRESS_HEX_LEN)
}

/// Canonicalizes every embedded address while keeping generic arguments.
pub fn canonical_full_type(type_str: &str) -> String {
    type_address_re()
        .replace_all(type_str.trim(), |caps: &regex::Captures<'_>| {
            format!("{}{}::", &caps[1], canonicalize_address(&caps[2]))
        })
        .into_owned()
}

/// Canonical type with generic arguments stripped:
/// `0x2::coin::Coin<0x2::sui::SUI>` becomes `0x00..02::coin::Coin`.
pub fn canonical_base_type(type_str: &str) -> String {
    let base = type_str.split('<').next().unwrap_or(type_str);
    canonical_full_type(base.trim())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InhabitationScore {
    pub targets: usize,
    pub created_distinct: usize,
    pub created_hits: usize,
    pub missing: usize,
}

impl InhabitationScore {
    pub fn hit_rate(&self) -> Option<f64> {
        if self.targets == 0 {
            return None;
        }
        Some(self.created_hits as f64 / self.targets as f64)
    }
}

fn canonical_base_set<S: AsRef<str>>(types: &[S]) -> BTreeSet<String> {
    types
        .iter()
        .map(|t| t.as_ref().trim())
        .filter(|t| !t.is_empty())
        .map(canonical_base_type)
        .collect()
}

pub fn score_inhabitation<T: AsRef<str>, C: AsRef<str>>(
    targets: &[T],
    created: &[C],
) -> InhabitationScore {
    let targets = canonical_base_set(targets);
    let created = canonical_base_set(created);
    let hits = targets.intersection(&created).count();
    InhabitationScore {
        targets: targets.len(),
        created_distinct: created.len(),
        created_hits: hits,
        missing: targets.len() - hits,
    }
}

/// Canonical target base types not present among `created`, sorted.
pub fn missing_targets<T: AsRef<str>, C: AsRef<str>>(targets: &[T], created: &[C]) -> Vec<String> {
    let created = canonical_base_set(created);
    canonical_base_set(targets)
        .into_iter()
        .filter(|t| !created.contains(t))
        .collect()
}
