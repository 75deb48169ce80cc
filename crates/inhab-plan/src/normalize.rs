use crate::model::{dummy_object_id, PLACEHOLDER_KEY};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::OnceLock;

const OWNED_OBJECT_KEY: &str = "imm_or_owned_object";
const OBJECT_KEY_SYNONYMS: &[&str] = &["object", "object_id"];
const INTEGER_KEYS: &[&str] = &["u8", "u16", "u32", "u64"];
const INTEGER_VECTOR_KEYS: &[&str] = &["vector_u8", "vector_u16", "vector_u32", "vector_u64"];
/// Keys that can only belong to an argument, in the order they are lifted
/// when written directly on a call.
const ARGUMENT_KEYS: &[&str] = &[
    "imm_or_owned_object",
    "object",
    "object_id",
    PLACEHOLDER_KEY,
    "shared_object",
    "result",
    "nested_result",
    "bool",
    "u8",
    "u16",
    "u32",
    "u64",
    "address",
    "vector_bool",
    "vector_u8",
    "vector_u16",
    "vector_u32",
    "vector_u64",
    "vector_address",
    "vector_u8_utf8",
    "vector_u8_hex",
];

fn bare_hex_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-fA-F]{1,64}$").expect("bare hex pattern"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionKind {
    ObjectKindRename,
    FlattenedArguments,
    IntegerString,
    ResultIndexString,
    AddressPrefix,
    BooleanString,
    PlaceholderElision,
}

impl CorrectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ObjectKindRename => "object_kind_rename",
            Self::FlattenedArguments => "flattened_arguments",
            Self::IntegerString => "integer_string",
            Self::ResultIndexString => "result_index_string",
            Self::AddressPrefix => "address_prefix",
            Self::BooleanString => "boolean_string",
            Self::PlaceholderElision => "placeholder_elision",
        }
    }
}

/// One rewrite applied to planner output, located by call and argument index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correction {
    pub call_index: usize,
    pub arg_index: usize,
    pub kind: CorrectionKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeOptions {
    /// Swap placeholders for deterministic dummy object ids. Only useful where
    /// no real ownership resolution happens (static analysis, offline checks).
    pub elide_placeholders: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub plan: Value,
    pub corrections: Vec<Correction>,
}

/// Best-effort repair of planner output into the canonical plan shape.
///
/// Shapes that are not recognized are passed through untouched; this never
/// fails. Applying it to its own output records no further corrections.
pub fn normalize_plan(raw: &Value, options: &NormalizeOptions) -> Normalized {
    let mut plan = raw.clone();
    let mut corrections = Vec::new();

    if let Some(calls) = plan.get_mut("calls").and_then(Value::as_array_mut) {
        for (call_idx, call) in calls.iter_mut().enumerate() {
            let Some(call_obj) = call.as_object_mut() else {
                continue;
            };
            if !call_obj.contains_key("args") {
                if let Some(detail) = lift_flattened_arguments(call_obj) {
                    corrections.push(Correction {
                        call_index: call_idx,
                        arg_index: 0,
                        kind: CorrectionKind::FlattenedArguments,
                        detail,
                    });
                }
            }
            let Some(args) = call_obj.get_mut("args").and_then(Value::as_array_mut) else {
                continue;
            };
            for (arg_idx, arg) in args.iter_mut().enumerate() {
                let Some(arg_obj) = arg.as_object_mut() else {
                    continue;
                };
                let mut emit = |kind: CorrectionKind, detail: String| {
                    corrections.push(Correction {
                        call_index: call_idx,
                        arg_index: arg_idx,
                        kind,
                        detail,
                    })
                };
                normalize_argument(arg_obj, options, &mut emit);
            }
        }
    }

    Normalized { plan, corrections }
}

fn normalize_argument(
    arg: &mut Map<String, Value>,
    options: &NormalizeOptions,
    emit: &mut impl FnMut(CorrectionKind, String),
) {
    let renamed_from = rename_object_synonym(arg);

    if let Some(detail) = coerce_integer_strings(arg) {
        emit(CorrectionKind::IntegerString, detail);
    }
    if let Some(detail) = coerce_result_indices(arg) {
        emit(CorrectionKind::ResultIndexString, detail);
    }
    match (repair_address_prefixes(arg), renamed_from) {
        (Some(detail), Some(from)) => emit(
            CorrectionKind::AddressPrefix,
            format!("{} (renamed '{}' to '{}')", detail, from, OWNED_OBJECT_KEY),
        ),
        (Some(detail), None) => emit(CorrectionKind::AddressPrefix, detail),
        (None, Some(from)) => emit(
            CorrectionKind::ObjectKindRename,
            format!("renamed '{}' to '{}'", from, OWNED_OBJECT_KEY),
        ),
        (None, None) => {}
    }
    if let Some(detail) = coerce_mutability_flag(arg) {
        emit(CorrectionKind::BooleanString, detail);
    }
    if options.elide_placeholders {
        if let Some(detail) = elide_placeholder(arg) {
            emit(CorrectionKind::PlaceholderElision, detail);
        }
    }
}

/// Moves argument keys written on the call itself into an `args` array,
/// one single-key argument per key.
fn lift_flattened_arguments(call: &mut Map<String, Value>) -> Option<String> {
    let mut lifted = Vec::new();
    let mut args = Vec::new();
    for key in ARGUMENT_KEYS {
        if let Some(value) = call.remove(*key) {
            let mut arg = Map::new();
            arg.insert(key.to_string(), value);
            args.push(Value::Object(arg));
            lifted.push(*key);
        }
    }
    if args.is_empty() {
        return None;
    }
    call.insert("args".to_string(), Value::Array(args));
    Some(format!("moved {} from the call into args", lifted.join(", ")))
}

fn rename_object_synonym(arg: &mut Map<String, Value>) -> Option<&'static str> {
    if arg.contains_key(OWNED_OBJECT_KEY) {
        return None;
    }
    for synonym in OBJECT_KEY_SYNONYMS {
        if let Some(value) = arg.remove(*synonym) {
            arg.insert(OWNED_OBJECT_KEY.to_string(), value);
            return Some(*synonym);
        }
    }
    None
}

fn parse_unsigned(raw: &str) -> Option<Value> {
    raw.trim().parse::<u64>().ok().map(Value::from)
}

fn parse_signed(raw: &str) -> Option<Value> {
    raw.trim().parse::<i64>().ok().map(Value::from)
}

fn coerce_integer_strings(arg: &mut Map<String, Value>) -> Option<String> {
    let mut changed = Vec::new();
    for key in INTEGER_KEYS {
        if let Some(slot) = arg.get_mut(*key) {
            if let Some(parsed) = slot.as_str().and_then(parse_unsigned) {
                *slot = parsed;
                changed.push(key.to_string());
            }
        }
    }
    for key in INTEGER_VECTOR_KEYS {
        if let Some(Value::Array(items)) = arg.get_mut(*key) {
            let mut touched = false;
            for item in items.iter_mut() {
                if let Some(parsed) = item.as_str().and_then(parse_unsigned) {
                    *item = parsed;
                    touched = true;
                }
            }
            if touched {
                changed.push(key.to_string());
            }
        }
    }
    if changed.is_empty() {
        return None;
    }
    Some(format!("coerced integer strings in {}", changed.join(", ")))
}

fn coerce_result_indices(arg: &mut Map<String, Value>) -> Option<String> {
    let mut changed = Vec::new();
    if let Some(slot) = arg.get_mut("result") {
        if let Some(parsed) = slot.as_str().and_then(parse_signed) {
            *slot = parsed;
            changed.push("result");
        }
    }
    if let Some(Value::Array(parts)) = arg.get_mut("nested_result") {
        let mut touched = false;
        for part in parts.iter_mut() {
            if let Some(parsed) = part.as_str().and_then(parse_signed) {
                *part = parsed;
                touched = true;
            }
        }
        if touched {
            changed.push("nested_result");
        }
    }
    if changed.is_empty() {
        return None;
    }
    Some(format!("coerced index strings in {}", changed.join(", ")))
}

fn prefix_bare_hex(slot: &mut Value) -> bool {
    let Some(raw) = slot.as_str() else {
        return false;
    };
    if !bare_hex_re().is_match(raw) {
        return false;
    }
    let prefixed = format!("0x{}", raw);
    *slot = Value::String(prefixed);
    true
}

fn repair_address_prefixes(arg: &mut Map<String, Value>) -> Option<String> {
    let mut changed = Vec::new();
    for key in ["address", OWNED_OBJECT_KEY] {
        if let Some(slot) = arg.get_mut(key) {
            if prefix_bare_hex(slot) {
                changed.push(key.to_string());
            }
        }
    }
    if let Some(Value::Array(items)) = arg.get_mut("vector_address") {
        let mut touched = false;
        for item in items.iter_mut() {
            touched |= prefix_bare_hex(item);
        }
        if touched {
            changed.push("vector_address".to_string());
        }
    }
    if let Some(slot) = arg
        .get_mut("shared_object")
        .and_then(Value::as_object_mut)
        .and_then(|shared| shared.get_mut("id"))
    {
        if prefix_bare_hex(slot) {
            changed.push("shared_object.id".to_string());
        }
    }
    if changed.is_empty() {
        return None;
    }
    Some(format!("added 0x prefix to {}", changed.join(", ")))
}

fn parse_bool_string(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn coerce_mutability_flag(arg: &mut Map<String, Value>) -> Option<String> {
    let slot = arg
        .get_mut("shared_object")
        .and_then(Value::as_object_mut)
        .and_then(|shared| shared.get_mut("mutable"))?;
    let raw = slot.as_str()?.to_string();
    let parsed = parse_bool_string(&raw)?;
    *slot = Value::Bool(parsed);
    Some(format!(
        "coerced shared_object.mutable '{}' to {}",
        raw, parsed
    ))
}

fn elide_placeholder(arg: &mut Map<String, Value>) -> Option<String> {
    let type_tag = arg.get(PLACEHOLDER_KEY)?.as_str()?.to_string();
    let dummy = dummy_object_id(&type_tag);
    arg.clear();
    arg.insert(OWNED_OBJECT_KEY.to_string(), Value::String(dummy.clone()));
    Some(format!("placeholder '{}' replaced with {}", type_tag, dummy))
}
