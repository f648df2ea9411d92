//! Consistency preview for freshly loaded rule batches.
//!
//! A crash halfway through a chunked save can leave rows or keys whose
//! shape the model does not recognise. Rather than fail the whole load,
//! such records are dropped here before the batch reaches the engine.

use crate::model::PolicyModel;
use crate::types::RuleRecord;

/// Drop every record the model rejects, keeping the rest in order.
///
/// A record is checked by its contiguous non-empty value prefix, with the
/// section taken from the first character of its `ptype`. Returns the
/// number of dropped records.
pub fn preview(records: &mut Vec<RuleRecord>, model: &dyn PolicyModel) -> usize {
    let before = records.len();
    records.retain(|record| match record.section() {
        Some(section) => model.accepts(section, &record.ptype, record.prefix()),
        None => false,
    });

    let dropped = before - records.len();
    if dropped > 0 {
        tracing::warn!(
            dropped,
            kept = records.len(),
            "Dropped loaded rules that do not fit the policy model"
        );
    }
    dropped
}
