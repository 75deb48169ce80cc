use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Graded outcome of checking a plan's intra-plan data flow. `causality_score`
/// is kept even for invalid plans so partial credit can be computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalityValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub call_count: usize,
    pub result_references_total: usize,
    pub result_references_valid: usize,
    pub causality_score: f64,
}

impl CausalityValidation {
    fn rejected(message: String) -> Self {
        Self {
            valid: false,
            errors: vec![message],
            call_count: 0,
            result_references_total: 0,
            result_references_valid: 0,
            causality_score: 1.0,
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CausalityViolation {
    pub message: String,
    pub validation: CausalityValidation,
}

impl CausalityViolation {
    pub(crate) fn from_validation(validation: CausalityValidation) -> Self {
        let message = validation
            .errors
            .first()
            .cloned()
            .unwrap_or_else(|| "causality violation: plan rejected".to_string());
        Self {
            message,
            validation,
        }
    }
}

enum RefCheck {
    Valid,
    Invalid(String),
}

/// Checks every `result` / `nested_result` reference against its call index.
/// Never fails; malformed input is reported through `errors`.
pub fn validate_causality(plan: &Value) -> CausalityValidation {
    let calls = match plan.get("calls") {
        Some(Value::Array(calls)) => calls,
        Some(_) => {
            return CausalityValidation::rejected(
                "shape violation: 'calls' must be an array".to_string(),
            )
        }
        None => {
            return CausalityValidation::rejected(
                "shape violation: plan must be an object with a 'calls' array".to_string(),
            )
        }
    };

    let mut errors = Vec::new();
    let mut total = 0usize;
    let mut valid_refs = 0usize;

    for (call_idx, call) in calls.iter().enumerate() {
        let Some(call_obj) = call.as_object() else {
            errors.push(format!(
                "shape violation: call {} is not an object",
                call_idx
            ));
            continue;
        };
        // Without an `args` array, references written on the call itself count.
        let args = match call_obj.get("args") {
            None => std::slice::from_ref(call),
            Some(Value::Array(args)) => args.as_slice(),
            Some(_) => {
                errors.push(format!(
                    "shape violation: call {} 'args' is not an array",
                    call_idx
                ));
                continue;
            }
        };
        for (arg_idx, arg) in args.iter().enumerate() {
            let Some(arg_obj) = arg.as_object() else {
                errors.push(format!(
                    "shape violation: call {} arg {} is not an object",
                    call_idx, arg_idx
                ));
                continue;
            };
            let check = if let Some(reference) = arg_obj.get("result") {
                Some(check_reference(reference, call_idx, "result"))
            } else if let Some(nested) = arg_obj.get("nested_result") {
                Some(match nested.as_array().and_then(|parts| parts.first()) {
                    Some(first) => check_reference(first, call_idx, "nested_result"),
                    None => RefCheck::Invalid(format!(
                        "wrong type: nested_result must be a non-empty array, got {}",
                        nested
                    )),
                })
            } else {
                None
            };
            match check {
                None => {}
                Some(RefCheck::Valid) => {
                    total += 1;
                    valid_refs += 1;
                }
                Some(RefCheck::Invalid(detail)) => {
                    total += 1;
                    errors.push(format!(
                        "causality violation: call {} arg {}: {}",
                        call_idx, arg_idx, detail
                    ));
                }
            }
        }
    }

    let causality_score = if total == 0 {
        1.0
    } else {
        valid_refs as f64 / total as f64
    };
    CausalityValidation {
        valid: errors.is_empty(),
        errors,
        call_count: calls.len(),
        result_references_total: total,
        result_references_valid: valid_refs,
        causality_score,
    }
}

fn check_reference(reference: &Value, call_idx: usize, key: &str) -> RefCheck {
    if let Some(idx) = reference.as_u64() {
        if idx < call_idx as u64 {
            return RefCheck::Valid;
        }
        return RefCheck::Invalid(format!(
            "forward/self reference: {} {} is not produced before call {}",
            key, idx, call_idx
        ));
    }
    if let Some(idx) = reference.as_i64() {
        return RefCheck::Invalid(format!("negative index: {} {}", key, idx));
    }
    RefCheck::Invalid(format!(
        "wrong type: {} index must be an integer, got {}",
        key, reference
    ))
}

/// Fail-fast wrapper surfacing the first violation as an error.
pub fn ensure_causal(plan: &Value) -> Result<CausalityValidation, CausalityViolation> {
    let validation = validate_causality(plan);
    if validation.valid {
        Ok(validation)
    } else {
        Err(CausalityViolation::from_validation(validation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn self_reference_in_second_call_is_a_violation() {
        let plan = json!({"calls": [
            {"target": "0x2::m::a", "args": []},
            {"target": "0x2::m::b", "args": [{"result": 1}]}
        ]});
        let v = validate_causality(&plan);
        assert!(!v.valid);
        assert!(v.errors[0].contains("causality violation"), "{:?}", v.errors);
        assert!(v.errors[0].contains("forward/self reference"));
        assert_eq!(v.result_references_total, 1);
        assert_eq!(v.result_references_valid, 0);
        assert_eq!(v.causality_score, 0.0);
        assert_eq!(v.call_count, 2);
    }

    #[test]
    fn references_on_a_call_without_args_are_checked() {
        let plan = json!({"calls": [
            {"target": "0x2::m::a"},
            {"target": "0x2::m::b", "result": 1},
            {"target": "0x2::m::c", "nested_result": [0, 0]}
        ]});
        let v = validate_causality(&plan);
        assert!(!v.valid);
        assert_eq!(v.result_references_total, 2);
        assert_eq!(v.result_references_valid, 1);
        assert!(v.errors[0].contains("call 1 arg 0"), "{:?}", v.errors);
        assert_eq!(v.causality_score, 0.5);
    }

    #[test]
    fn backward_references_are_valid() {
        let plan = json!({"calls": [
            {"target": "0x2::m::a"},
            {"target": "0x2::m::b", "args": [{"result": 0}]},
            {"target": "0x2::m::c", "args": [{"nested_result": [1, 0]}, {"result": 0}]}
        ]});
        let v = validate_causality(&plan);
        assert!(v.valid, "{:?}", v.errors);
        assert_eq!(v.result_references_total, 3);
        assert_eq!(v.causality_score, 1.0);
    }

    #[test]
    fn distinguishes_wrong_type_negative_and_forward() {
        let plan = json!({"calls": [
            {"target": "0x2::m::a"},
            {"target": "0x2::m::b", "args": [
                {"result": "0"}, {"result": -1}, {"nested_result": [5, 0]}, {"result": 0}
            ]}
        ]});
        let v = validate_causality(&plan);
        assert!(!v.valid);
        assert_eq!(v.errors.len(), 3);
        assert!(v.errors[0].contains("wrong type"));
        assert!(v.errors[1].contains("negative index"));
        assert!(v.errors[2].contains("forward/self reference"));
        assert_eq!(v.result_references_total, 4);
        assert_eq!(v.result_references_valid, 1);
        assert!((v.causality_score - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn no_references_scores_one_even_when_shape_is_broken() {
        let plan = json!({"calls": [42, {"target": "0x2::m::a", "args": ["x", {"u64": 1}]}]});
        let v = validate_causality(&plan);
        assert!(!v.valid);
        assert_eq!(v.errors.len(), 2);
        assert!(v.errors.iter().all(|e| e.starts_with("shape violation")));
        assert_eq!(v.result_references_total, 0);
        assert_eq!(v.causality_score, 1.0);
    }

    #[test]
    fn non_plan_top_level_is_rejected_with_zero_counts() {
        for raw in [json!([1, 2]), json!({"calls": "nope"}), json!("text")] {
            let v = validate_causality(&raw);
            assert!(!v.valid);
            assert_eq!(v.call_count, 0);
            assert_eq!(v.result_references_total, 0);
        }
    }

    #[test]
    fn ensure_causal_surfaces_first_violation() {
        let plan = json!({"calls": [{"target": "0x2::m::a", "args": [{"result": 3}, {"result": 4}]}]});
        let err = ensure_causal(&plan).expect_err("must fail");
        assert!(err.message.contains("result 3"));
        assert_eq!(err.validation.errors.len(), 2);
        assert!(ensure_causal(&json!({"calls": []})).is_ok());
    }
}
