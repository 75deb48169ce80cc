use crate::causality::{validate_causality, CausalityValidation, CausalityViolation};
use crate::score::canonical_full_type;
use inhab_core::{canonical_json, sha256_hex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Argument key marking an owned object that still has to be found in the
/// acting party's inventory. The value names the required type.
pub const PLACEHOLDER_KEY: &str = "$smi_placeholder";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub calls: Vec<Call>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Call {
    pub target: String,
    #[serde(default)]
    pub type_args: Vec<String>,
    #[serde(default)]
    pub args: Vec<Argument>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedObjectRef {
    pub id: String,
    pub mutable: bool,
}

/// One call argument. Exactly one tag is set per instance; the JSON form is
/// a single-key object such as `{"u64": 7}` or `{"nested_result": [0, 1]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Argument {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Address(String),
    VectorBool(Vec<bool>),
    VectorU8(Vec<u8>),
    VectorU16(Vec<u16>),
    VectorU32(Vec<u32>),
    VectorU64(Vec<u64>),
    VectorAddress(Vec<String>),
    VectorU8Utf8(String),
    VectorU8Hex(String),
    ImmOrOwnedObject(String),
    #[serde(rename = "$smi_placeholder")]
    Placeholder(String),
    SharedObject(SharedObjectRef),
    Result(u16),
    NestedResult(u16, u16),
}

impl Argument {
    /// Index of the call whose output this argument consumes, if any.
    pub fn result_reference(&self) -> Option<u16> {
        match self {
            Self::Result(idx) | Self::NestedResult(idx, _) => Some(*idx),
            _ => None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Placeholder(_))
    }
}

#[derive(Debug, Clone, Error)]
#[error("shape violation: {message}")]
pub struct ShapeError {
    pub message: String,
}

impl Plan {
    pub fn from_value(value: &Value) -> Result<Self, ShapeError> {
        Self::deserialize(value).map_err(|err| ShapeError {
            message: err.to_string(),
        })
    }

    pub fn to_value(&self) -> Value {
        // Every field is a plain string/number/bool/vec, so serialization is total.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Stable-key serialization used to compare plans structurally.
    pub fn canonical_key(&self) -> String {
        canonical_json(&self.to_value())
    }

    pub fn placeholder_count(&self) -> usize {
        self.calls
            .iter()
            .flat_map(|call| call.args.iter())
            .filter(|arg| arg.is_placeholder())
            .count()
    }
}

/// A plan whose result references have been proven causal. The wrapped plan
/// is never handed out mutably; rewrites always produce a new value.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedPlan {
    plan: Plan,
    causality: CausalityValidation,
}

impl ValidatedPlan {
    pub fn new(plan: Plan) -> Result<Self, CausalityViolation> {
        let causality = validate_causality(&plan.to_value());
        if !causality.valid {
            return Err(CausalityViolation::from_validation(causality));
        }
        Ok(Self { plan, causality })
    }

    /// Applies `rewrite` to every argument that is not a result reference.
    /// Replacements that would introduce a result reference are ignored, so
    /// the reference graph and its validation carry over unchanged.
    pub fn rewrite_inputs(&self, mut rewrite: impl FnMut(&Argument) -> Option<Argument>) -> Self {
        let mut plan = self.plan.clone();
        for arg in plan.calls.iter_mut().flat_map(|call| call.args.iter_mut()) {
            if arg.result_reference().is_some() {
                continue;
            }
            if let Some(replacement) = rewrite(arg) {
                if replacement.result_reference().is_none() {
                    *arg = replacement;
                }
            }
        }
        Self {
            plan,
            causality: self.causality.clone(),
        }
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn causality(&self) -> &CausalityValidation {
        &self.causality
    }

    pub fn into_plan(self) -> Plan {
        self.plan
    }
}

/// Deterministic stand-in object id for a placeholder of `type_tag`.
pub fn dummy_object_id(type_tag: &str) -> String {
    format!(
        "0x{}",
        sha256_hex(canonical_full_type(type_tag).as_bytes())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plan_round_trips_every_argument_tag() {
        let raw = json!({"calls": [
            {"target": "0x2::coin::zero", "type_args": ["0x2::sui::SUI"], "args": []},
            {"target": "0x2::pkg::f", "type_args": [], "args": [
                {"u64": 1000}, {"bool": true}, {"address": "0x1"},
                {"vector_u64": [1, 2]}, {"vector_address": ["0x2"]},
                {"vector_u8_utf8": "name"}, {"imm_or_owned_object": "0xabc"},
                {"$smi_placeholder": "0x2::coin::Coin<0x2::sui::SUI>"},
                {"shared_object": {"id": "0x6", "mutable": false}},
                {"result": 0}, {"nested_result": [0, 1]}
            ]}
        ]});
        let plan = Plan::from_value(&raw).expect("plan should parse");
        assert_eq!(plan.calls.len(), 2);
        assert!(plan.calls[0].args.is_empty());
        assert_eq!(plan.calls[1].args[9], Argument::Result(0));
        assert_eq!(plan.calls[1].args[10], Argument::NestedResult(0, 1));
        assert_eq!(plan.placeholder_count(), 1);
        assert_eq!(plan.to_value(), raw);
    }

    #[test]
    fn unknown_argument_tag_is_a_shape_error() {
        let err = Plan::from_value(&json!({"calls": [{"target": "0x2::m::f", "args": [{"u256": "1"}]}]}))
            .expect_err("unknown tag should fail");
        assert!(err.to_string().starts_with("shape violation:"));
    }

    #[test]
    fn argument_keys_left_on_a_call_are_a_shape_error() {
        let err = Plan::from_value(&json!({"calls": [
            {"target": "0x2::m::f", "imm_or_owned_object": "0x123", "u64": 1000}
        ]}))
        .expect_err("stray call keys must not be dropped");
        assert!(err.to_string().starts_with("shape violation:"));
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn validated_plan_rejects_forward_reference() {
        let plan = Plan::from_value(&json!({"calls": [
            {"target": "0x2::m::f", "args": [{"result": 0}]}
        ]}))
        .expect("plan");
        let err = ValidatedPlan::new(plan).expect_err("self reference must fail");
        assert!(err.to_string().contains("causality violation"));
    }

    #[test]
    fn rewrite_inputs_leaves_references_alone() {
        let plan = Plan::from_value(&json!({"calls": [
            {"target": "0x2::m::a", "args": [{"u64": 1}]},
            {"target": "0x2::m::b", "args": [{"result": 0}, {"u64": 2}]}
        ]}))
        .expect("plan");
        let validated = ValidatedPlan::new(plan).expect("causal");
        let rewritten = validated.rewrite_inputs(|arg| match arg {
            Argument::U64(_) => Some(Argument::Result(5)),
            Argument::Result(_) => Some(Argument::U64(9)),
            _ => None,
        });
        assert_eq!(rewritten, validated);

        let bumped = validated.rewrite_inputs(|arg| match arg {
            Argument::U64(v) => Some(Argument::U64(v + 10)),
            _ => None,
        });
        assert_eq!(bumped.plan().calls[1].args, vec![Argument::Result(0), Argument::U64(12)]);
        assert_eq!(validated.plan().calls[1].args[1], Argument::U64(2));
    }

    #[test]
    fn dummy_id_is_address_shaped_and_format_insensitive() {
        let a = dummy_object_id("0x2::coin::Coin<0x2::sui::SUI>");
        let b = dummy_object_id("0x0000000000000000000000000000000000000000000000000000000000000002::coin::Coin<0x2::sui::SUI>");
        assert_eq!(a, b);
        assert_eq!(a.len(), 66);
        assert!(a.starts_with("0x"));
    }
}
