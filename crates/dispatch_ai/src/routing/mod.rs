//! Request routing: condition scoring and rule-based model selection.

pub mod condition_evaluator;
mod rule_engine;

pub use condition_evaluator::{RuleScore, required_capabilities, score_condition, score_rule};
pub use rule_engine::*;
