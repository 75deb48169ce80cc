//! Plan shaping and scoring: everything between a planner's raw JSON and the
//! simulation engine that can be decided without I/O.

pub mod causality;
pub mod model;
pub mod normalize;
pub mod score;
pub mod variants;

pub use causality::{ensure_causal, validate_causality, CausalityValidation, CausalityViolation};
pub use model::{
    dummy_object_id, Argument, Call, Plan, ShapeError, SharedObjectRef, ValidatedPlan,
    PLACEHOLDER_KEY,
};
pub use normalize::{normalize_plan, Correction, CorrectionKind, NormalizeOptions, Normalized};
pub use score::{
    canonical_base_type, canonical_full_type, canonicalize_address, missing_targets, score_inhabitation,
    InhabitationScore,
};
pub use variants::{generate_variants, PlanVariant};
