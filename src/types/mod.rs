//! Core types for the policy adapters.

pub mod rule;
pub mod filter;

pub use rule::{Endpoint, PolicyType, RuleRecord, MAX_RULE_VALUES, RULE_FIELD_COUNT};
pub use filter::{Filter, BatchFilter, SqlPredicate};
