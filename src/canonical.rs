//! Canonical serialization for deterministic hashing.
//!
//! Rule sets come back from the backends in backend-specific order
//! (identity order for tables, key order for namespaces). The fingerprint
//! sorts before hashing so the same set hashes the same way everywhere.

use serde::Serialize;
use xxhash_rust::xxh64::xxh64;

use crate::types::RuleRecord;

/// Serialize a value to canonical JSON bytes for hashing.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}

/// Order-insensitive fingerprint of a rule set, as 16 hex digits.
///
/// Duplicates count: `[a, a]` and `[a]` fingerprint differently.
pub fn rule_set_fingerprint(records: &[RuleRecord]) -> String {
    let mut sorted: Vec<&RuleRecord> = records.iter().collect();
    sorted.sort();

    // Records are plain strings; serialization cannot fail.
    let bytes = to_canonical_bytes(&sorted).unwrap_or_default();
    format!("{:016x}", xxh64(&bytes, 0))
}
