//! Policy storage backends.
//!
//! Two drivers implement [`PolicyAdapter`]:
//!
//! - [`KvAdapter`]: one key per rule under a hierarchical namespace.
//! - `SqlAdapter` (feature `sql`): one row per rule in a relational table.
//!
//! Both encode through [`crate::codec`], filter through
//! [`crate::types::filter`] and run loads through [`crate::preview`].

pub mod kv;
pub mod hierarchical;

#[cfg(feature = "sql")]
pub mod sql;

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;

use crate::model::PolicyModel;
use crate::types::{BatchFilter, RuleRecord};

/// Records per write call during a save.
pub const FLUSH_EVERY: usize = 1000;

/// Error type shared by all drivers.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// Relational store error (connectivity, syntax, transaction).
    #[cfg(feature = "sql")]
    #[error("Database error: {0}")]
    Database(sqlx::Error),
    /// Unique index rejected a duplicate rule.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),
    /// Key-value store error.
    #[error("Key-value store error: {0}")]
    Kv(#[from] kv::KvError),
    /// Filter argument of an unrecognised shape.
    #[error("unsupported filter type: {0}")]
    UnsupportedFilter(String),
    /// Field selector that would match nothing meaningful.
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),
    /// Rule that cannot be stored.
    #[error("Invalid rule: {0}")]
    InvalidRule(String),
    /// Adapter configuration rejected at construction.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// Operation on a transaction-bound adapter after its transaction ended.
    #[error("Transaction already finished")]
    TransactionClosed,
}

#[cfg(feature = "sql")]
impl From<sqlx::Error> for AdapterError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::ConstraintViolation(db.message().to_string())
            }
            _ => Self::Database(err),
        }
    }
}

/// How `save_policy` writes its chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveMode {
    /// Clear, then one independent write per chunk.
    ///
    /// A failure after the first chunk leaves a mix of old and new state.
    #[default]
    Chunked,
    /// Clear and every chunk in one transaction (relational) or one
    /// atomic commit (key-value).
    Transactional,
}

impl FromStr for SaveMode {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chunked" | "" => Ok(Self::Chunked),
            "transactional" | "atomic" => Ok(Self::Transactional),
            other => Err(AdapterError::InvalidConfig(format!(
                "unknown save mode {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for SaveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chunked => write!(f, "chunked"),
            Self::Transactional => write!(f, "transactional"),
        }
    }
}

/// Persistence contract the policy engine depends on.
///
/// Loads return records already filtered through
/// [`crate::preview::preview`]; the engine merges them into its model.
/// Backend errors propagate unchanged and are never retried.
#[async_trait]
pub trait PolicyAdapter: Send + Sync {
    /// Load every stored rule in backend-stable order.
    async fn load_policy(&self, model: &dyn PolicyModel) -> Result<Vec<RuleRecord>, AdapterError>;

    /// Load the rules matching any member of `filter`.
    ///
    /// Per-filter results are concatenated without deduplication. Marks
    /// the adapter as filtered for the rest of its lifetime.
    async fn load_filtered_policy(
        &self,
        model: &dyn PolicyModel,
        filter: &BatchFilter,
    ) -> Result<Vec<RuleRecord>, AdapterError>;

    /// Load with an untyped filter argument.
    ///
    /// Unrecognised shapes fail with [`AdapterError::UnsupportedFilter`]
    /// before the store is touched.
    async fn load_filtered_policy_value(
        &self,
        model: &dyn PolicyModel,
        filter: &serde_json::Value,
    ) -> Result<Vec<RuleRecord>, AdapterError> {
        let filter = BatchFilter::from_value(filter)?;
        self.load_filtered_policy(model, &filter).await
    }

    /// Whether a filtered load has happened on this adapter.
    fn is_filtered(&self) -> bool;

    /// Replace the whole stored rule set.
    async fn save_policy(&self, rules: &[RuleRecord]) -> Result<(), AdapterError>;

    /// Store one rule.
    async fn add_policy(&self, rule: &RuleRecord) -> Result<(), AdapterError>;

    /// Store several rules.
    async fn add_policies(&self, rules: &[RuleRecord]) -> Result<(), AdapterError>;

    /// Delete rules matching `pattern` on its non-empty fields.
    async fn remove_policy(&self, pattern: &RuleRecord) -> Result<(), AdapterError>;

    /// Delete rules matching any of `patterns`.
    async fn remove_policies(&self, patterns: &[RuleRecord]) -> Result<(), AdapterError>;

    /// Delete rules of `ptype` whose fields from `field_index` on equal
    /// `field_values`. `field_index == -1` deletes the whole type.
    async fn remove_filtered_policy(
        &self,
        ptype: &str,
        field_index: i32,
        field_values: &[String],
    ) -> Result<(), AdapterError>;

    /// Replace `old` with `new`.
    async fn update_policy(&self, old: &RuleRecord, new: &RuleRecord) -> Result<(), AdapterError>;

    /// Replace each `old[i]` with `new[i]`.
    async fn update_policies(
        &self,
        old: &[RuleRecord],
        new: &[RuleRecord],
    ) -> Result<(), AdapterError>;

    /// Delete the rules selected by `field_index`/`field_values`, insert
    /// `new_rules`, and return what was deleted.
    async fn update_filtered_policies(
        &self,
        ptype: &str,
        new_rules: &[RuleRecord],
        field_index: i32,
        field_values: &[String],
    ) -> Result<Vec<RuleRecord>, AdapterError>;
}

/// Reject a remove-filtered selector whose values are all empty.
///
/// Such a selector would silently widen to "every rule of the type";
/// callers that mean that pass `field_index == -1`.
pub(crate) fn check_selector(field_index: i32, field_values: &[String]) -> Result<(), AdapterError> {
    if field_index == -1 || field_values.iter().any(|v| !v.is_empty()) {
        Ok(())
    } else {
        Err(AdapterError::InvalidFilter(
            "field values cannot all be empty".to_string(),
        ))
    }
}

/// Reject records that could be written but never read back.
pub(crate) fn check_storable(rules: &[RuleRecord]) -> Result<(), AdapterError> {
    rules.iter().try_for_each(RuleRecord::ensure_storable)
}

/// Reject mismatched old/new lists for batch updates.
pub(crate) fn check_update_pairs(old: &[RuleRecord], new: &[RuleRecord]) -> Result<(), AdapterError> {
    if old.len() == new.len() {
        Ok(())
    } else {
        Err(AdapterError::InvalidRule(format!(
            "update needs one new rule per old rule, got {} old and {} new",
            old.len(),
            new.len()
        )))
    }
}

pub use kv::{InMemoryKv, KvBackend, KvError, KvOp};
pub use hierarchical::{KvAdapter, KvConfig};

#[cfg(feature = "sql")]
pub use sql::{Dialect, SqlAdapter, SqlConfig, TransactionOutcome, DEFAULT_DATABASE_URL};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_mode_parsing() {
        assert_eq!("chunked".parse::<SaveMode>().unwrap(), SaveMode::Chunked);
        assert_eq!("Transactional".parse::<SaveMode>().unwrap(), SaveMode::Transactional);
        assert_eq!("".parse::<SaveMode>().unwrap(), SaveMode::Chunked);
        assert!("eventually".parse::<SaveMode>().is_err());
        assert_eq!(SaveMode::Transactional.to_string(), "transactional");
    }

    #[test]
    fn test_check_selector() {
        assert!(check_selector(-1, &[]).is_ok());
        assert!(check_selector(0, &["alice".to_string()]).is_ok());
        assert!(matches!(
            check_selector(0, &[String::new(), String::new()]),
            Err(AdapterError::InvalidFilter(_))
        ));
        assert!(check_selector(1, &[]).is_err());
    }

    #[test]
    fn test_check_storable_rejects_blank_ptype() {
        let good = RuleRecord::new("p", ["alice", "data1", "read"]).unwrap();
        let blank = RuleRecord::new(" ", ["alice", "data1", "read"]).unwrap();
        assert!(check_storable(&[good.clone()]).is_ok());
        assert!(matches!(
            check_storable(&[good, blank]),
            Err(AdapterError::InvalidRule(_))
        ));
    }
}
