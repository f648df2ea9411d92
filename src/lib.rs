//! # rbac-policy-adapter
//!
//! Persistence for RBAC rule sets.
//!
//! A policy engine keeps its rules in memory and asks an adapter to load,
//! save and incrementally change them in a durable store. This crate
//! answers one question:
//!
//! > Given a rule set, how does it live in a table or a key namespace, and
//! > how do partial loads and edits map onto that store?
//!
//! ## Core Contract
//!
//! 1. A rule is a [`RuleRecord`]: a policy type plus up to six values
//! 2. Every backend implements [`PolicyAdapter`] with the same semantics
//! 3. Loaded batches pass through [`preview`] so malformed records never
//!    reach the engine
//!
//! ## Architecture
//!
//! ```text
//! PolicyModel ← preview ← load ─┐
//!                               ├─ SqlAdapter (Postgres / SQLite)
//! Filter / BatchFilter ─────────┤
//!                               └─ KvAdapter<B: KvBackend> ← KeyCodec
//! ```
//!
//! ## Ordering Guarantees
//!
//! - Relational loads come back in insertion order
//! - Key-value loads come back in ascending key order
//! - Filtered loads concatenate per-filter results without deduplication

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod types;
pub mod codec;
pub mod model;
pub mod preview;
pub mod canonical;
pub mod store;
pub mod telemetry;

// Re-exports
pub use types::{
    BatchFilter, Endpoint, Filter, PolicyType, RuleRecord, SqlPredicate, MAX_RULE_VALUES,
    RULE_FIELD_COUNT,
};
pub use codec::{CodecError, KeyCodec, KEY_SEPARATOR, RULE_COLUMNS};
pub use model::{default_model, ModelDefinition, ModelError, PolicyModel, DEFAULT_ADMIN_NAME};
pub use preview::preview;
pub use canonical::{rule_set_fingerprint, to_canonical_bytes};
pub use store::{
    AdapterError, InMemoryKv, KvAdapter, KvBackend, KvConfig, KvError, KvOp, PolicyAdapter,
    SaveMode, FLUSH_EVERY,
};
#[cfg(feature = "sql")]
pub use store::{Dialect, SqlAdapter, SqlConfig, TransactionOutcome, DEFAULT_DATABASE_URL};

/// Base name of the rule table and of the key namespace's table segment.
pub const RULE_TABLE_NAME: &str = "casbin_rule";

/// Default namespace prefix for the key-value driver.
pub const DEFAULT_NAMESPACE_PREFIX: &str = "/rbac";
