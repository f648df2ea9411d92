//! Policy model seam.
//!
//! The policy engine owns rule matching and role resolution. The adapters
//! only need one question answered: is a rule of this shape legal for
//! this policy type? [`PolicyModel`] is that question; [`ModelDefinition`]
//! answers it from the definition sections of a model text.

use std::collections::BTreeMap;

/// Administrator subject granted everything by [`default_model`].
pub const DEFAULT_ADMIN_NAME: &str = "admin";

/// Stock RBAC model: one policy type with subject/object/action, and two
/// two-place grouping types. `administrator`, `root` and `admin_name`
/// pass every request.
pub fn default_model(admin_name: &str) -> String {
    format!(
        r#"### rbac model
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act

[role_definition]
g = _, _
g2 = _, _

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = g(r.sub, p.sub) && g2(r.sub, p.sub) && r.obj == p.obj && r.act == p.act || r.sub == "administrator" || r.sub == "root" || r.sub == {admin:?}
"#,
        admin = admin_name
    )
}

/// Shape oracle provided by the policy engine.
pub trait PolicyModel: Send + Sync {
    /// Whether `rule` (values only, no ptype) is a legal line for `ptype`
    /// in `section` (`"p"` or `"g"`).
    fn accepts(&self, section: &str, ptype: &str, rule: &[String]) -> bool;
}

/// Error parsing a model text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// A definition line is not `key = tokens`.
    #[error("line {line}: expected `key = tokens`, got {text:?}")]
    MalformedLine {
        /// 1-based line number.
        line: usize,
        /// Offending text.
        text: String,
    },
    /// A definition has no tokens.
    #[error("line {line}: {key} has no tokens")]
    EmptyDefinition {
        /// 1-based line number.
        line: usize,
        /// Definition key.
        key: String,
    },
    /// The text defines no policy type at all.
    #[error("model defines no policy_definition entries")]
    NoPolicyDefinition,
}

/// Per-ptype arity for the `p` and `g` sections of a model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelDefinition {
    sections: BTreeMap<String, BTreeMap<String, usize>>,
}

impl ModelDefinition {
    /// Create an empty definition that accepts nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Definition of [`default_model`], whatever the admin name.
    pub fn default_rbac() -> Self {
        Self::new()
            .with_policy("p", 3)
            .with_role("g", 2)
            .with_role("g2", 2)
    }

    /// Add a policy type with the given arity.
    pub fn with_policy(mut self, ptype: &str, arity: usize) -> Self {
        self.define("p", ptype, arity);
        self
    }

    /// Add a grouping type with the given arity.
    pub fn with_role(mut self, ptype: &str, arity: usize) -> Self {
        self.define("g", ptype, arity);
        self
    }

    /// Parse the `[policy_definition]` and `[role_definition]` sections of
    /// a model text. Other sections are ignored.
    pub fn parse(text: &str) -> Result<Self, ModelError> {
        let mut definition = Self::new();
        let mut section: Option<&'static str> = None;

        for (i, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                section = match &line[1..line.len() - 1] {
                    "policy_definition" => Some("p"),
                    "role_definition" => Some("g"),
                    _ => None,
                };
                continue;
            }
            let Some(sec) = section else { continue };

            let (key, tokens) = line.split_once('=').ok_or_else(|| ModelError::MalformedLine {
                line: i + 1,
                text: line.to_string(),
            })?;
            let key = key.trim();
            let arity = tokens
                .split(',')
                .filter(|t| !t.trim().is_empty())
                .count();
            if key.is_empty() {
                return Err(ModelError::MalformedLine {
                    line: i + 1,
                    text: line.to_string(),
                });
            }
            if arity == 0 {
                return Err(ModelError::EmptyDefinition {
                    line: i + 1,
                    key: key.to_string(),
                });
            }
            definition.define(sec, key, arity);
        }

        if definition.sections.get("p").map_or(true, BTreeMap::is_empty) {
            return Err(ModelError::NoPolicyDefinition);
        }
        Ok(definition)
    }

    /// Declared arity of `ptype` in `section`.
    pub fn arity(&self, section: &str, ptype: &str) -> Option<usize> {
        self.sections.get(section)?.get(ptype).copied()
    }

    fn define(&mut self, section: &str, ptype: &str, arity: usize) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(ptype.to_string(), arity);
    }
}

impl PolicyModel for ModelDefinition {
    fn accepts(&self, section: &str, ptype: &str, rule: &[String]) -> bool {
        self.arity(section, ptype) == Some(rule.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_default_model() {
        let definition = ModelDefinition::parse(&default_model(DEFAULT_ADMIN_NAME)).unwrap();
        assert_eq!(definition, ModelDefinition::default_rbac());
        assert_eq!(definition.arity("p", "p"), Some(3));
        assert_eq!(definition.arity("g", "g2"), Some(2));
        assert_eq!(definition.arity("r", "r"), None);
    }

    #[test]
    fn test_default_model_admin_name() {
        let text = default_model("ops-root");
        assert!(text.contains(r#"|| r.sub == "ops-root""#));
        assert!(!text.contains(r#"r.sub == "admin""#));
        assert!(default_model(DEFAULT_ADMIN_NAME).contains(r#"r.sub == "admin""#));
        assert_eq!(
            ModelDefinition::parse(&text).unwrap(),
            ModelDefinition::default_rbac()
        );
    }

    #[test]
    fn test_accepts_by_shape() {
        let model = ModelDefinition::default_rbac();
        assert!(model.accepts("p", "p", &rule(&["alice", "data1", "read"])));
        assert!(!model.accepts("p", "p", &rule(&["alice", "data1"])));
        assert!(model.accepts("g", "g", &rule(&["alice", "admin"])));
        assert!(!model.accepts("p", "g", &rule(&["alice", "admin"])));
        assert!(!model.accepts("g", "g3", &rule(&["alice", "admin"])));
    }

    #[test]
    fn test_parse_domain_model() {
        let text = "[policy_definition]\np = sub, dom, obj, act\n[role_definition]\ng = _, _, _\n";
        let definition = ModelDefinition::parse(text).unwrap();
        assert_eq!(definition.arity("p", "p"), Some(4));
        assert_eq!(definition.arity("g", "g"), Some(3));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            ModelDefinition::parse("[policy_definition]\np sub, obj\n"),
            Err(ModelError::MalformedLine { line: 2, .. })
        ));
        assert!(matches!(
            ModelDefinition::parse("[policy_definition]\np = \n"),
            Err(ModelError::EmptyDefinition { .. })
        ));
        assert_eq!(
            ModelDefinition::parse("[role_definition]\ng = _, _\n"),
            Err(ModelError::NoPolicyDefinition)
        );
    }
}
