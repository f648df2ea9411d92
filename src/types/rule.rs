//! Rule records: the fixed-arity form of one policy or grouping line.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::store::AdapterError;

/// Number of positional value fields a record carries (`v0..v5`).
pub const MAX_RULE_VALUES: usize = 6;

/// Number of stored fields including `ptype`.
pub const RULE_FIELD_COUNT: usize = MAX_RULE_VALUES + 1;

/// One stored policy line.
///
/// Unused trailing values are empty strings. When a record is used as a
/// pattern (removals, filtered updates) an empty value means "any value".
///
/// Implements `Ord` over `(ptype, v0..v5)` so rule sets can be sorted
/// canonically.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuleRecord {
    /// Policy type tag (`p`, `g`, `g2`, ...).
    pub ptype: String,
    /// Positional values `v0..v5`.
    pub values: [String; MAX_RULE_VALUES],
}

impl RuleRecord {
    /// Build a record from a policy type and up to six values.
    pub fn new<I, S>(ptype: impl Into<String>, values: I) -> Result<Self, AdapterError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ptype = ptype.into();
        let mut record = Self {
            ptype,
            values: Default::default(),
        };

        for (i, value) in values.into_iter().enumerate() {
            if i >= MAX_RULE_VALUES {
                return Err(AdapterError::InvalidRule(format!(
                    "{} carries more than {} values",
                    record.ptype, MAX_RULE_VALUES
                )));
            }
            record.values[i] = value.into();
        }

        Ok(record)
    }

    /// Build a pattern from a field selector.
    ///
    /// Values are placed starting at `field_index`; positions outside
    /// `0..6` are ignored, so a negative index skips leading values.
    /// `field_index == -1` selects every record of `ptype`.
    pub fn from_selector(ptype: &str, field_index: i32, field_values: &[String]) -> Self {
        let mut pattern = Self {
            ptype: ptype.to_string(),
            values: Default::default(),
        };
        if field_index == -1 {
            return pattern;
        }

        for pos in 0..MAX_RULE_VALUES as i32 {
            if field_index > pos {
                continue;
            }
            let offset = (pos - field_index) as usize;
            if let Some(value) = field_values.get(offset) {
                pattern.values[pos as usize] = value.clone();
            }
        }
        pattern
    }

    /// Value at stored position `index`, where 0 is `ptype` and 1..=6 are `v0..v5`.
    pub fn field(&self, index: usize) -> Option<&str> {
        match index {
            0 => Some(&self.ptype),
            i if i <= MAX_RULE_VALUES => Some(&self.values[i - 1]),
            _ => None,
        }
    }

    /// All seven stored fields in column order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.ptype.as_str()).chain(self.values.iter().map(String::as_str))
    }

    /// Length of the contiguous non-empty prefix of `v0..v5`.
    pub fn arity(&self) -> usize {
        self.values.iter().take_while(|v| !v.is_empty()).count()
    }

    /// True if an empty value sits before a non-empty one.
    pub fn has_holes(&self) -> bool {
        self.arity() != self.trimmed_len()
    }

    /// The policy line as the engine sees it: values up to the last non-empty one.
    pub fn to_rule(&self) -> Vec<String> {
        self.values[..self.trimmed_len()].to_vec()
    }

    /// The contiguous non-empty prefix of `v0..v5`.
    pub fn prefix(&self) -> &[String] {
        &self.values[..self.arity()]
    }

    /// Section identifier derived from the first character of `ptype`.
    pub fn section(&self) -> Option<&str> {
        let first = self.ptype.chars().next()?;
        Some(&self.ptype[..first.len_utf8()])
    }

    /// Pattern match: every non-empty value of `pattern` must equal ours,
    /// and the policy types must be identical.
    pub fn matches_pattern(&self, pattern: &RuleRecord) -> bool {
        self.ptype == pattern.ptype
            && self
                .values
                .iter()
                .zip(pattern.values.iter())
                .all(|(ours, wanted)| wanted.is_empty() || ours == wanted)
    }

    /// Check the record can be written and read back unchanged.
    ///
    /// A blank `ptype` has no key segment or section, and a hole shifts
    /// later values left when the key is decoded.
    pub fn ensure_storable(&self) -> Result<(), AdapterError> {
        if self.ptype.trim().is_empty() {
            return Err(AdapterError::InvalidRule(format!(
                "rule [{}] has an empty policy type",
                self.values[..self.trimmed_len()].join(", ")
            )));
        }
        if self.has_holes() {
            return Err(AdapterError::InvalidRule(format!(
                "rule {} has an empty value before a non-empty one",
                self
            )));
        }
        Ok(())
    }

    /// Permission line `p, sub, obj, act` for an endpoint.
    pub fn for_endpoint(subject: &str, endpoint: &Endpoint) -> Self {
        let (object, action) = endpoint.object_action();
        Self::line(PolicyType::Policy, [subject.to_string(), object, action])
    }

    /// Grouping line `g, member, role` or `g2, member, group`.
    ///
    /// Passing [`PolicyType::Policy`] builds a two-value `p` line, which
    /// the default model rejects.
    pub fn grouping(kind: PolicyType, member: &str, role: &str) -> Self {
        Self::line(kind, [member.to_string(), role.to_string()])
    }

    fn line<const N: usize>(kind: PolicyType, values: [String; N]) -> Self {
        let mut record = Self {
            ptype: kind.name().to_string(),
            values: Default::default(),
        };
        for (slot, value) in record.values.iter_mut().zip(values) {
            *slot = value;
        }
        record
    }

    fn trimmed_len(&self) -> usize {
        self.values
            .iter()
            .rposition(|v| !v.is_empty())
            .map(|i| i + 1)
            .unwrap_or(0)
    }
}

impl fmt::Display for RuleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ptype)?;
        for value in self.to_rule() {
            write!(f, ", {}", value)?;
        }
        Ok(())
    }
}

/// The three policy types of the stock RBAC model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyType {
    /// Permission lines, `p`.
    Policy,
    /// Subject-to-role grouping, `g`.
    Role,
    /// Subject-to-group grouping, `g2`.
    Group,
}

impl PolicyType {
    /// The `ptype` tag stored with each rule.
    pub fn name(self) -> &'static str {
        match self {
            Self::Policy => "p",
            Self::Role => "g",
            Self::Group => "g2",
        }
    }
}

impl FromStr for PolicyType {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "p" => Ok(Self::Policy),
            "g" => Ok(Self::Role),
            "g2" => Ok(Self::Group),
            other => Err(AdapterError::InvalidRule(format!(
                "unknown policy type {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A service endpoint a permission line guards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoint {
    /// Fully qualified handler name, e.g. `Greeter.Hello`.
    pub name: String,
    /// Resource entity; takes precedence over `name` as the object.
    pub entity: String,
    /// Allowed methods, e.g. `GET`, `POST`.
    pub methods: Vec<String>,
}

impl Endpoint {
    /// Object and action for a permission line.
    ///
    /// The object is the entity, or the name when there is none. The
    /// action is the methods joined with `,`.
    pub fn object_action(&self) -> (String, String) {
        let object = if self.entity.is_empty() {
            self.name.clone()
        } else {
            self.entity.clone()
        };
        (object, self.methods.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_new_pads_trailing_values() {
        let record = RuleRecord::new("p", ["alice", "data1", "read"]).unwrap();
        assert_eq!(record.ptype, "p");
        assert_eq!(record.values[2], "read");
        assert_eq!(record.values[3], "");
        assert_eq!(record.arity(), 3);
        assert_eq!(record.to_rule(), strings(&["alice", "data1", "read"]));
    }

    #[test]
    fn test_new_rejects_seven_values() {
        let err = RuleRecord::new("p", ["a", "b", "c", "d", "e", "f", "g"]).unwrap_err();
        assert!(matches!(err, AdapterError::InvalidRule(_)));
    }

    #[test]
    fn test_holes() {
        let record = RuleRecord::new("p", ["alice", "", "read"]).unwrap();
        assert!(record.has_holes());
        assert_eq!(record.arity(), 1);
        assert_eq!(record.to_rule().len(), 3);
        assert_eq!(record.prefix(), &strings(&["alice"])[..]);
    }

    #[test]
    fn test_selector_from_zero() {
        let pattern = RuleRecord::from_selector("p", 0, &strings(&["data2_admin"]));
        assert_eq!(pattern.values[0], "data2_admin");
        assert_eq!(pattern.arity(), 1);
    }

    #[test]
    fn test_selector_with_offset() {
        let pattern = RuleRecord::from_selector("p", 1, &strings(&["data2", "read"]));
        assert_eq!(pattern.values[0], "");
        assert_eq!(pattern.values[1], "data2");
        assert_eq!(pattern.values[2], "read");
    }

    #[test]
    fn test_selector_negative_index_skips_leading_values() {
        let pattern = RuleRecord::from_selector("p", -2, &strings(&["x", "y", "alice", "data1"]));
        assert_eq!(pattern.values[0], "alice");
        assert_eq!(pattern.values[1], "data1");
        assert_eq!(pattern.values[2], "");
    }

    #[test]
    fn test_selector_minus_one_selects_whole_type() {
        let pattern = RuleRecord::from_selector("g", -1, &strings(&["ignored"]));
        assert_eq!(pattern, RuleRecord::new("g", Vec::<String>::new()).unwrap());
    }

    #[test]
    fn test_matches_pattern_wildcards() {
        let record = RuleRecord::new("p", ["data2_admin", "data2", "read"]).unwrap();
        let pattern = RuleRecord::from_selector("p", 1, &strings(&["data2"]));
        assert!(record.matches_pattern(&pattern));

        let other_type = RuleRecord::from_selector("g", 1, &strings(&["data2"]));
        assert!(!record.matches_pattern(&other_type));
    }

    #[test]
    fn test_section_and_display() {
        let record = RuleRecord::new("g2", ["alice", "admins"]).unwrap();
        assert_eq!(record.section(), Some("g"));
        assert_eq!(record.to_string(), "g2, alice, admins");
        assert_eq!(RuleRecord::default().section(), None);
    }

    #[test]
    fn test_fields_in_column_order() {
        let record = RuleRecord::new("p", ["alice"]).unwrap();
        let fields: Vec<_> = record.fields().collect();
        assert_eq!(fields, vec!["p", "alice", "", "", "", "", ""]);
        assert_eq!(record.field(1), Some("alice"));
        assert_eq!(record.field(7), None);
    }

    #[test]
    fn test_ensure_storable() {
        assert!(RuleRecord::new("p", ["alice", "data1", "read"])
            .unwrap()
            .ensure_storable()
            .is_ok());
        assert!(matches!(
            RuleRecord::new("", ["alice", "data1", "read"]).unwrap().ensure_storable(),
            Err(AdapterError::InvalidRule(_))
        ));
        assert!(RuleRecord::new("p", ["alice", "", "read"])
            .unwrap()
            .ensure_storable()
            .is_err());
    }

    #[test]
    fn test_policy_type_names() {
        for kind in [PolicyType::Policy, PolicyType::Role, PolicyType::Group] {
            assert_eq!(kind.name().parse::<PolicyType>().unwrap(), kind);
        }
        assert_eq!(PolicyType::Group.to_string(), "g2");
        assert!("g3".parse::<PolicyType>().is_err());
    }

    #[test]
    fn test_endpoint_lines() {
        let endpoint = Endpoint {
            name: "Greeter.Hello".to_string(),
            entity: String::new(),
            methods: strings(&["GET", "POST"]),
        };
        assert_eq!(
            RuleRecord::for_endpoint("alice", &endpoint).to_string(),
            "p, alice, Greeter.Hello, GET,POST"
        );

        let entity = Endpoint {
            entity: "orders".to_string(),
            ..endpoint
        };
        assert_eq!(entity.object_action().0, "orders");

        let role = RuleRecord::grouping(PolicyType::Role, "alice", "admin");
        assert_eq!(role, RuleRecord::new("g", ["alice", "admin"]).unwrap());
    }
}
