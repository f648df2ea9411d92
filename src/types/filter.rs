//! Partial-match filters over rule records.
//!
//! A [`Filter`] constrains any subset of the seven stored fields to a set of
//! allowed values. A [`BatchFilter`] ORs several filters together; its
//! results are concatenated per filter, never deduplicated.

use serde::{Deserialize, Serialize};

use super::rule::{RuleRecord, RULE_FIELD_COUNT};
use crate::codec::RULE_COLUMNS;
use crate::store::AdapterError;

/// Partial-match predicate over rule fields.
///
/// An empty list leaves the field unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Filter {
    /// Allowed policy types.
    pub ptype: Vec<String>,
    /// Allowed `v0` values.
    pub v0: Vec<String>,
    /// Allowed `v1` values.
    pub v1: Vec<String>,
    /// Allowed `v2` values.
    pub v2: Vec<String>,
    /// Allowed `v3` values.
    pub v3: Vec<String>,
    /// Allowed `v4` values.
    pub v4: Vec<String>,
    /// Allowed `v5` values.
    pub v5: Vec<String>,
}

impl Filter {
    /// Create an unconstrained filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Constrain `ptype`.
    pub fn with_ptype<S: Into<String>>(mut self, values: impl IntoIterator<Item = S>) -> Self {
        self.ptype = values.into_iter().map(Into::into).collect();
        self
    }

    /// Constrain value field `index` (0 for `v0`).
    ///
    /// Indices past `v5` are ignored.
    pub fn with_value<S: Into<String>>(
        mut self,
        index: usize,
        values: impl IntoIterator<Item = S>,
    ) -> Self {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        match index {
            0 => self.v0 = values,
            1 => self.v1 = values,
            2 => self.v2 = values,
            3 => self.v3 = values,
            4 => self.v4 = values,
            5 => self.v5 = values,
            _ => {}
        }
        self
    }

    /// Constraint sets in column order (`ptype`, `v0`..`v5`).
    pub fn constraints(&self) -> [&[String]; RULE_FIELD_COUNT] {
        [
            self.ptype.as_slice(),
            self.v0.as_slice(),
            self.v1.as_slice(),
            self.v2.as_slice(),
            self.v3.as_slice(),
            self.v4.as_slice(),
            self.v5.as_slice(),
        ]
    }

    /// True when no field is constrained.
    pub fn is_unconstrained(&self) -> bool {
        self.constraints().iter().all(|set| set.is_empty())
    }

    /// True iff every constrained field of `record` is in its allowed set.
    pub fn matches(&self, record: &RuleRecord) -> bool {
        self.constraints()
            .iter()
            .zip(record.fields())
            .all(|(allowed, value)| allowed.is_empty() || allowed.iter().any(|a| a == value))
    }
}

/// Ordered list of filters combined by logical OR.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchFilter {
    /// Member filters, queried in order.
    pub filters: Vec<Filter>,
}

impl BatchFilter {
    /// Create a batch from member filters.
    pub fn new(filters: Vec<Filter>) -> Self {
        Self { filters }
    }

    /// Parse an untyped filter argument.
    ///
    /// Accepts a filter object, an array of filter objects, or
    /// `{"filters": [...]}`. Anything else is an unsupported filter type.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, AdapterError> {
        use serde_json::Value;

        let unsupported = |e: serde_json::Error| AdapterError::UnsupportedFilter(e.to_string());
        match value {
            Value::Object(map) if map.contains_key("filters") => {
                serde_json::from_value(value.clone()).map_err(unsupported)
            }
            Value::Object(_) => serde_json::from_value::<Filter>(value.clone())
                .map(Self::from)
                .map_err(unsupported),
            Value::Array(_) => serde_json::from_value::<Vec<Filter>>(value.clone())
                .map(Self::new)
                .map_err(unsupported),
            other => Err(AdapterError::UnsupportedFilter(format!(
                "expected a filter object or list, got {}",
                json_kind(other)
            ))),
        }
    }

    /// True iff any member filter matches.
    pub fn matches(&self, record: &RuleRecord) -> bool {
        self.filters.iter().any(|f| f.matches(record))
    }
}

impl From<Filter> for BatchFilter {
    fn from(filter: Filter) -> Self {
        Self::new(vec![filter])
    }
}

impl From<Vec<Filter>> for BatchFilter {
    fn from(filters: Vec<Filter>) -> Self {
        Self::new(filters)
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// A SQL `WHERE` predicate with `$N` placeholders and its bound arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlPredicate {
    /// Conjunctive clauses, e.g. `v0 IN ($1, $2)`.
    pub clauses: Vec<String>,
    /// Arguments in placeholder order.
    pub args: Vec<String>,
}

impl SqlPredicate {
    /// Set-membership predicate for a filter, one clause per constrained field.
    ///
    /// Placeholders are numbered after `offset` existing arguments.
    pub fn for_filter(filter: &Filter, offset: usize) -> Self {
        let mut predicate = Self::default();
        for (column, allowed) in RULE_COLUMNS.iter().zip(filter.constraints()) {
            if allowed.is_empty() {
                continue;
            }
            let placeholders: Vec<String> = allowed
                .iter()
                .map(|value| predicate.bind(offset, value))
                .collect();
            predicate
                .clauses
                .push(format!("{} IN ({})", column, placeholders.join(", ")));
        }
        predicate
    }

    /// Equality predicate for a pattern record.
    ///
    /// `ptype` is always constrained; values only when non-empty.
    pub fn for_pattern(pattern: &RuleRecord, offset: usize) -> Self {
        let mut predicate = Self::default();
        for (i, (column, value)) in RULE_COLUMNS.iter().zip(pattern.fields()).enumerate() {
            if i > 0 && value.is_empty() {
                continue;
            }
            let placeholder = predicate.bind(offset, value);
            predicate.clauses.push(format!("{} = {}", column, placeholder));
        }
        predicate
    }

    /// Render as a `WHERE` suffix (empty when unconstrained).
    pub fn where_clause(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    fn bind(&mut self, offset: usize, value: &str) -> String {
        self.args.push(value.to_string());
        format!("${}", offset + self.args.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(values: &[&str]) -> RuleRecord {
        RuleRecord::new(values[0], values[1..].iter().copied()).unwrap()
    }

    #[test]
    fn test_unconstrained_matches_everything() {
        let filter = Filter::new();
        assert!(filter.is_unconstrained());
        assert!(filter.matches(&record(&["p", "alice", "data1", "read"])));
    }

    #[test]
    fn test_set_membership() {
        let filter = Filter::new().with_value(0, ["alice", "bob"]);
        assert!(filter.matches(&record(&["p", "alice", "data1", "read"])));
        assert!(filter.matches(&record(&["p", "bob", "data2", "write"])));
        assert!(!filter.matches(&record(&["p", "data2_admin", "data2", "read"])));
    }

    #[test]
    fn test_conjunction_across_fields() {
        let filter = Filter::new().with_ptype(["p"]).with_value(1, ["data2"]);
        assert!(filter.matches(&record(&["p", "bob", "data2", "write"])));
        assert!(!filter.matches(&record(&["g", "bob", "data2"])));
        assert!(!filter.matches(&record(&["p", "alice", "data1", "read"])));
    }

    #[test]
    fn test_batch_is_disjunction() {
        let batch = BatchFilter::new(vec![
            Filter::new().with_value(0, ["alice"]),
            Filter::new().with_value(1, ["data2"]),
        ]);
        assert!(batch.matches(&record(&["p", "alice", "data1", "read"])));
        assert!(batch.matches(&record(&["p", "bob", "data2", "write"])));
        assert!(!batch.matches(&record(&["p", "bob", "data3", "write"])));
    }

    #[test]
    fn test_from_value_single_filter() {
        let value = serde_json::json!({"v0": ["alice"]});
        let batch = BatchFilter::from_value(&value).unwrap();
        assert_eq!(batch.filters, vec![Filter::new().with_value(0, ["alice"])]);
    }

    #[test]
    fn test_from_value_list_and_batch() {
        let list = serde_json::json!([{"v0": ["alice"]}, {"v1": ["data2"]}]);
        assert_eq!(BatchFilter::from_value(&list).unwrap().filters.len(), 2);

        let batch = serde_json::json!({"filters": [{"ptype": ["g"]}]});
        assert_eq!(
            BatchFilter::from_value(&batch).unwrap().filters,
            vec![Filter::new().with_ptype(["g"])]
        );
    }

    #[test]
    fn test_from_value_rejects_unknown_shapes() {
        for value in [
            serde_json::json!("alice"),
            serde_json::json!(42),
            serde_json::json!({"subject": ["alice"]}),
            serde_json::json!([1, 2]),
        ] {
            let err = BatchFilter::from_value(&value).unwrap_err();
            assert!(matches!(err, AdapterError::UnsupportedFilter(_)), "{value}");
        }
    }

    #[test]
    fn test_sql_predicate_for_filter() {
        let filter = Filter::new().with_ptype(["p"]).with_value(0, ["alice", "bob"]);
        let predicate = SqlPredicate::for_filter(&filter, 0);
        assert_eq!(predicate.where_clause(), " WHERE ptype IN ($1) AND v0 IN ($2, $3)");
        assert_eq!(predicate.args, vec!["p", "alice", "bob"]);
    }

    #[test]
    fn test_sql_predicate_unconstrained_has_no_where() {
        let predicate = SqlPredicate::for_filter(&Filter::new(), 0);
        assert_eq!(predicate.where_clause(), "");
        assert!(predicate.args.is_empty());
    }

    #[test]
    fn test_sql_predicate_for_pattern_with_offset() {
        let pattern = RuleRecord::from_selector("p", 1, &["data2".to_string()]);
        let predicate = SqlPredicate::for_pattern(&pattern, 7);
        assert_eq!(predicate.clauses, vec!["ptype = $8", "v1 = $9"]);
        assert_eq!(predicate.args, vec!["p", "data2"]);
    }
}
