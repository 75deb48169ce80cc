use crate::model::{Argument, ValidatedPlan};
use std::collections::HashSet;

const INT_SWEEP: &[u64] = &[0, 2, 10, 100];

#[derive(Debug, Clone, PartialEq)]
pub struct PlanVariant {
    pub name: String,
    pub plan: ValidatedPlan,
}

/// Deterministic fallback plans derived from `base`.
///
/// `base` always comes first. Each rewrite is kept only when it yields a
/// plan not already in the list (compared by canonical serialization), and
/// the list is capped at `max_variants`.
pub fn generate_variants(base: &ValidatedPlan, sender: &str, max_variants: usize) -> Vec<PlanVariant> {
    let mut seen = HashSet::new();
    let mut variants = Vec::new();

    let mut push = |name: String, plan: ValidatedPlan, variants: &mut Vec<PlanVariant>| {
        if variants.len() >= max_variants {
            return;
        }
        if seen.insert(plan.plan().canonical_key()) {
            variants.push(PlanVariant { name, plan });
        }
    };

    push("base".to_string(), base.clone(), &mut variants);
    push(
        "addr_sender".to_string(),
        substitute_addresses(base, sender),
        &mut variants,
    );
    for value in INT_SWEEP {
        push(
            format!("ints_{}", value),
            substitute_integers(base, *value),
            &mut variants,
        );
    }
    variants
}

fn substitute_addresses(base: &ValidatedPlan, sender: &str) -> ValidatedPlan {
    base.rewrite_inputs(|arg| match arg {
        Argument::Address(_) => Some(Argument::Address(sender.to_string())),
        Argument::VectorAddress(items) => Some(Argument::VectorAddress(vec![
            sender.to_string();
            items.len()
        ])),
        _ => None,
    })
}

fn substitute_integers(base: &ValidatedPlan, value: u64) -> ValidatedPlan {
    base.rewrite_inputs(|arg| match arg {
        Argument::U8(_) => u8::try_from(value).ok().map(Argument::U8),
        Argument::U16(_) => u16::try_from(value).ok().map(Argument::U16),
        Argument::U32(_) => u32::try_from(value).ok().map(Argument::U32),
        Argument::U64(_) => Some(Argument::U64(value)),
        _ => None,
    })
}
