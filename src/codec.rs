//! Line codec: rule records to and from backend addresses.
//!
//! The relational backend stores one row per record over [`RULE_COLUMNS`];
//! the row codec lives with the driver. The hierarchical backend stores one
//! key per record:
//!
//! ```text
//! <namespace prefix>/<table>/<ptype>/<v0>/<v1>/...
//! ```
//!
//! Empty values are skipped when encoding, so records differing only in
//! trailing empty fields share a key. Segments are percent-escaped for `%`
//! and `/`, which keeps values containing the separator loss-free.

use crate::types::{Filter, RuleRecord, MAX_RULE_VALUES, RULE_FIELD_COUNT};

/// Stored column names in field order.
pub const RULE_COLUMNS: [&str; RULE_FIELD_COUNT] = ["ptype", "v0", "v1", "v2", "v3", "v4", "v5"];

/// Path separator for hierarchical keys.
pub const KEY_SEPARATOR: char = '/';

/// Error decoding a hierarchical key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Key does not live under the adapter's namespace root.
    #[error("key {key} is outside namespace {root}")]
    OutsideNamespace {
        /// Offending key.
        key: String,
        /// Expected root.
        root: String,
    },
    /// Key has more segments than a record has fields.
    #[error("key {0} has more than seven segments")]
    TooManySegments(String),
    /// Key has no policy type segment.
    #[error("key {0} has an empty policy type")]
    EmptyPolicyType(String),
}

/// Encoder/decoder for one key namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCodec {
    root: String,
}

impl KeyCodec {
    /// Create a codec rooted at `namespace_prefix` joined with `table_name`.
    pub fn new(namespace_prefix: &str, table_name: &str) -> Self {
        Self {
            root: join_root(namespace_prefix, table_name),
        }
    }

    /// Namespace root, e.g. `/rbac/casbin_rule`.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Prefix covering every key in the namespace.
    pub fn scan_all(&self) -> String {
        format!("{}{}", self.root, KEY_SEPARATOR)
    }

    /// Encode a record as a key.
    pub fn encode(&self, record: &RuleRecord) -> String {
        let mut key = self.scan_all();
        key.push_str(&escape_segment(&record.ptype));
        for value in record.values.iter().filter(|v| !v.is_empty()) {
            key.push(KEY_SEPARATOR);
            key.push_str(&escape_segment(value));
        }
        key
    }

    /// Decode a key back into a record.
    ///
    /// Missing trailing segments leave trailing values empty.
    pub fn decode(&self, key: &str) -> Result<RuleRecord, CodecError> {
        let rest = key
            .strip_prefix(self.root.as_str())
            .and_then(|r| r.strip_prefix(KEY_SEPARATOR))
            .ok_or_else(|| CodecError::OutsideNamespace {
                key: key.to_string(),
                root: self.root.clone(),
            })?;

        let segments: Vec<&str> = rest.split(KEY_SEPARATOR).collect();
        if segments.len() > RULE_FIELD_COUNT {
            return Err(CodecError::TooManySegments(key.to_string()));
        }
        if segments[0].is_empty() {
            return Err(CodecError::EmptyPolicyType(key.to_string()));
        }

        let mut record = RuleRecord {
            ptype: unescape_segment(segments[0]),
            values: Default::default(),
        };
        for (slot, segment) in record.values.iter_mut().zip(segments[1..].iter()) {
            *slot = unescape_segment(segment);
        }
        Ok(record)
    }

    /// Longest deterministic scan prefix for a filter.
    ///
    /// Walks fields in order and stops at the first one that is
    /// unconstrained or has more than one allowed value. The prefix is
    /// not segment-bounded (`.../p/alice` also covers `.../p/alice2`);
    /// callers post-filter scanned records.
    pub fn filter_prefix(&self, filter: &Filter) -> String {
        let segments = filter
            .constraints()
            .into_iter()
            .map_while(|allowed| match allowed {
                [only] if !only.is_empty() => Some(only.as_str()),
                _ => None,
            });
        self.prefix_of(segments)
    }

    /// Scan prefix for a pattern record: `ptype` plus its contiguous
    /// non-empty values.
    pub fn pattern_prefix(&self, pattern: &RuleRecord) -> String {
        let values = pattern.prefix().iter().map(String::as_str);
        self.prefix_of(std::iter::once(pattern.ptype.as_str()).chain(values))
    }

    fn prefix_of<'a>(&self, segments: impl Iterator<Item = &'a str>) -> String {
        let escaped: Vec<String> = segments
            .take(MAX_RULE_VALUES + 1)
            .map(escape_segment)
            .collect();
        format!("{}{}", self.scan_all(), escaped.join("/"))
    }
}

fn join_root(prefix: &str, table: &str) -> String {
    let parts: Vec<&str> = prefix
        .split(KEY_SEPARATOR)
        .chain(table.split(KEY_SEPARATOR))
        .filter(|s| !s.is_empty())
        .collect();
    let joined = parts.join("/");
    if prefix.starts_with(KEY_SEPARATOR) {
        format!("/{}", joined)
    } else {
        joined
    }
}

/// Escape `%` and `/` in a key segment.
pub fn escape_segment(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            _ => out.push(c),
        }
    }
    out
}

/// Reverse [`escape_segment`]. Unknown escapes are kept literally.
pub fn unescape_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut rest = segment;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("%25") {
            out.push('%');
            rest = &tail[3..];
        } else if tail.starts_with("%2F") || tail.starts_with("%2f") {
            out.push('/');
            rest = &tail[3..];
        } else {
            out.push('%');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}
