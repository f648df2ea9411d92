//! Hierarchical key-value driver.
//!
//! ## Configuration
//!
//! - `RBAC_KV_PREFIX`: namespace prefix (default: `/rbac`)
//! - `RBAC_SAVE_MODE`: `chunked` or `transactional` (default: chunked)
//!
//! ## Atomicity
//!
//! Every single operation maps to one backend call or one atomic
//! [`KvBackend::commit`]. `update_filtered_policies` needs two commits
//! (delete, then insert); a failure between them leaves the old rules
//! deleted and the new ones missing.
//!
//! Updates follow the relational driver: each `old` is a pattern, every
//! stored rule it matches is rewritten, and pairs apply in order so a
//! chain `a → b, b → c` ends at `c`. A pattern that matches nothing
//! writes nothing.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use super::kv::{KvBackend, KvOp};
use super::{check_selector, check_storable, check_update_pairs, AdapterError, PolicyAdapter, SaveMode, FLUSH_EVERY};
use crate::canonical::rule_set_fingerprint;
use crate::codec::KeyCodec;
use crate::model::PolicyModel;
use crate::preview::preview;
use crate::types::{BatchFilter, RuleRecord};
use crate::{DEFAULT_NAMESPACE_PREFIX, RULE_TABLE_NAME};

/// Configuration for the hierarchical driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvConfig {
    /// Namespace prefix the rule table hangs under (default: `/rbac`).
    pub namespace_prefix: String,
    /// Rule table segment (default: `casbin_rule`).
    pub table_name: String,
    /// Save strategy (default: chunked).
    pub save_mode: SaveMode,
}

impl KvConfig {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Result<Self, AdapterError> {
        Ok(Self {
            namespace_prefix: std::env::var("RBAC_KV_PREFIX")
                .unwrap_or_else(|_| DEFAULT_NAMESPACE_PREFIX.to_string()),
            table_name: RULE_TABLE_NAME.to_string(),
            save_mode: std::env::var("RBAC_SAVE_MODE")
                .ok()
                .map(|s| s.parse())
                .transpose()?
                .unwrap_or_default(),
        })
    }

    /// Use a different namespace prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.namespace_prefix = prefix.into();
        self
    }

    /// Use a different save strategy.
    pub fn with_save_mode(mut self, mode: SaveMode) -> Self {
        self.save_mode = mode;
        self
    }
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            namespace_prefix: DEFAULT_NAMESPACE_PREFIX.to_string(),
            table_name: RULE_TABLE_NAME.to_string(),
            save_mode: SaveMode::default(),
        }
    }
}

/// Policy adapter over a hierarchical key-value store.
///
/// Loads come back in ascending key order. Adding an existing rule
/// overwrites its key, so duplicates never occur and never error.
pub struct KvAdapter<B> {
    backend: B,
    codec: KeyCodec,
    save_mode: SaveMode,
    filtered: AtomicBool,
}

impl<B: KvBackend> KvAdapter<B> {
    /// Create an adapter, checking the store is reachable first.
    pub async fn new(backend: B, config: KvConfig) -> Result<Self, AdapterError> {
        if config.table_name.trim_matches('/').is_empty() {
            return Err(AdapterError::InvalidConfig(
                "table name cannot be empty".to_string(),
            ));
        }
        backend.ping().await?;

        let codec = KeyCodec::new(&config.namespace_prefix, &config.table_name);
        tracing::info!(
            root = codec.root(),
            save_mode = %config.save_mode,
            "Initialized key-value policy adapter"
        );

        Ok(Self {
            backend,
            codec,
            save_mode: config.save_mode,
            filtered: AtomicBool::new(false),
        })
    }

    /// The underlying store.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The key codec for this namespace.
    pub fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    /// Scan `prefix` and decode every key, skipping malformed ones.
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, RuleRecord)>, AdapterError> {
        let keys = self.backend.scan_prefix(prefix).await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            match self.codec.decode(&key) {
                Ok(record) => records.push((key, record)),
                Err(err) => tracing::warn!(error = %err, "Skipping malformed policy key"),
            }
        }
        Ok(records)
    }

    /// Keys of stored rules matching `pattern` on its non-empty fields.
    async fn matching_keys(&self, pattern: &RuleRecord) -> Result<Vec<(String, RuleRecord)>, AdapterError> {
        let prefix = self.codec.pattern_prefix(pattern);
        let mut matches = self.scan(&prefix).await?;
        matches.retain(|(_, record)| record.matches_pattern(pattern));
        Ok(matches)
    }

    async fn delete_matching(&self, patterns: &[RuleRecord]) -> Result<usize, AdapterError> {
        let mut ops = Vec::new();
        for pattern in patterns {
            for (key, _) in self.matching_keys(pattern).await? {
                ops.push(KvOp::Delete(key));
            }
        }
        let removed = ops.len();
        if !ops.is_empty() {
            self.backend.commit(ops).await?;
        }
        Ok(removed)
    }
}

#[async_trait]
impl<B: KvBackend> PolicyAdapter for KvAdapter<B> {
    async fn load_policy(&self, model: &dyn PolicyModel) -> Result<Vec<RuleRecord>, AdapterError> {
        let mut records: Vec<RuleRecord> = self
            .scan(&self.codec.scan_all())
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .collect();
        preview(&mut records, model);

        tracing::info!(
            root = self.codec.root(),
            rule_count = records.len(),
            fingerprint = %rule_set_fingerprint(&records),
            "Loaded policy"
        );
        Ok(records)
    }

    async fn load_filtered_policy(
        &self,
        model: &dyn PolicyModel,
        filter: &BatchFilter,
    ) -> Result<Vec<RuleRecord>, AdapterError> {
        let mut records = Vec::new();
        for f in &filter.filters {
            let prefix = self.codec.filter_prefix(f);
            records.extend(
                self.scan(&prefix)
                    .await?
                    .into_iter()
                    .map(|(_, record)| record)
                    .filter(|record| f.matches(record)),
            );
        }
        preview(&mut records, model);
        self.filtered.store(true, Ordering::SeqCst);

        tracing::debug!(
            root = self.codec.root(),
            filters = filter.filters.len(),
            rule_count = records.len(),
            "Loaded filtered policy"
        );
        Ok(records)
    }

    fn is_filtered(&self) -> bool {
        self.filtered.load(Ordering::SeqCst)
    }

    async fn save_policy(&self, rules: &[RuleRecord]) -> Result<(), AdapterError> {
        if self.is_filtered() {
            tracing::warn!(
                root = self.codec.root(),
                "Saving from a filtered adapter replaces rules that were never loaded"
            );
        }

        check_storable(rules)?;
        let keys: Vec<String> = rules.iter().map(|r| self.codec.encode(r)).collect();
        match self.save_mode {
            SaveMode::Chunked => {
                self.backend.delete_prefix(&self.codec.scan_all()).await?;
                for chunk in keys.chunks(FLUSH_EVERY) {
                    let ops = chunk.iter().cloned().map(KvOp::Put).collect();
                    self.backend.commit(ops).await?;
                }
            }
            SaveMode::Transactional => {
                let mut ops = Vec::with_capacity(keys.len() + 1);
                ops.push(KvOp::DeletePrefix(self.codec.scan_all()));
                ops.extend(keys.into_iter().map(KvOp::Put));
                self.backend.commit(ops).await?;
            }
        }

        tracing::info!(
            root = self.codec.root(),
            rule_count = rules.len(),
            save_mode = %self.save_mode,
            fingerprint = %rule_set_fingerprint(rules),
            "Saved policy"
        );
        Ok(())
    }

    async fn add_policy(&self, rule: &RuleRecord) -> Result<(), AdapterError> {
        check_storable(std::slice::from_ref(rule))?;
        self.backend.put(&self.codec.encode(rule)).await?;
        tracing::debug!(rule = %rule, "Added policy");
        Ok(())
    }

    async fn add_policies(&self, rules: &[RuleRecord]) -> Result<(), AdapterError> {
        check_storable(rules)?;
        if rules.is_empty() {
            return Ok(());
        }
        let ops = rules.iter().map(|r| KvOp::Put(self.codec.encode(r))).collect();
        self.backend.commit(ops).await?;
        tracing::debug!(rule_count = rules.len(), "Added policies");
        Ok(())
    }

    async fn remove_policy(&self, pattern: &RuleRecord) -> Result<(), AdapterError> {
        let removed = self.delete_matching(std::slice::from_ref(pattern)).await?;
        tracing::debug!(rule = %pattern, removed, "Removed policy");
        Ok(())
    }

    async fn remove_policies(&self, patterns: &[RuleRecord]) -> Result<(), AdapterError> {
        let removed = self.delete_matching(patterns).await?;
        tracing::debug!(patterns = patterns.len(), removed, "Removed policies");
        Ok(())
    }

    async fn remove_filtered_policy(
        &self,
        ptype: &str,
        field_index: i32,
        field_values: &[String],
    ) -> Result<(), AdapterError> {
        check_selector(field_index, field_values)?;
        let pattern = RuleRecord::from_selector(ptype, field_index, field_values);
        let removed = self.delete_matching(std::slice::from_ref(&pattern)).await?;
        tracing::debug!(ptype, field_index, removed, "Removed filtered policy");
        Ok(())
    }

    async fn update_policy(&self, old: &RuleRecord, new: &RuleRecord) -> Result<(), AdapterError> {
        self.update_policies(std::slice::from_ref(old), std::slice::from_ref(new))
            .await
    }

    async fn update_policies(
        &self,
        old: &[RuleRecord],
        new: &[RuleRecord],
    ) -> Result<(), AdapterError> {
        check_update_pairs(old, new)?;
        check_storable(new)?;

        let mut working: BTreeMap<String, RuleRecord> = BTreeMap::new();
        for pattern in old {
            working.extend(self.matching_keys(pattern).await?);
        }
        let before: BTreeSet<String> = working.keys().cloned().collect();

        let mut updated = 0;
        for (pattern, replacement) in old.iter().zip(new) {
            let hits: Vec<String> = working
                .iter()
                .filter(|(_, record)| record.matches_pattern(pattern))
                .map(|(key, _)| key.clone())
                .collect();
            if hits.is_empty() {
                continue;
            }
            for key in &hits {
                working.remove(key);
            }
            working.insert(self.codec.encode(replacement), replacement.clone());
            updated += hits.len();
        }

        let mut ops: Vec<KvOp> = working
            .keys()
            .filter(|key| !before.contains(*key))
            .cloned()
            .map(KvOp::Put)
            .collect();
        ops.extend(
            before
                .iter()
                .filter(|key| !working.contains_key(*key))
                .cloned()
                .map(KvOp::Delete),
        );
        if !ops.is_empty() {
            self.backend.commit(ops).await?;
        }
        tracing::debug!(rule_count = new.len(), updated, "Updated policies");
        Ok(())
    }

    async fn update_filtered_policies(
        &self,
        ptype: &str,
        new_rules: &[RuleRecord],
        field_index: i32,
        field_values: &[String],
    ) -> Result<Vec<RuleRecord>, AdapterError> {
        check_selector(field_index, field_values)?;
        check_storable(new_rules)?;
        let pattern = RuleRecord::from_selector(ptype, field_index, field_values);
        let matched = self.matching_keys(&pattern).await?;

        let (keys, removed): (Vec<String>, Vec<RuleRecord>) = matched.into_iter().unzip();
        if !keys.is_empty() {
            self.backend
                .commit(keys.into_iter().map(KvOp::Delete).collect())
                .await?;
        }
        if !new_rules.is_empty() {
            let puts = new_rules.iter().map(|r| KvOp::Put(self.codec.encode(r))).collect();
            self.backend.commit(puts).await?;
        }

        tracing::debug!(
            ptype,
            removed = removed.len(),
            inserted = new_rules.len(),
            "Updated filtered policies"
        );
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelDefinition;
    use crate::store::InMemoryKv;
    use crate::types::Filter;

    fn record(values: &[&str]) -> RuleRecord {
        RuleRecord::new(values[0], values[1..].iter().copied()).unwrap()
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn seed() -> Vec<RuleRecord> {
        vec![
            record(&["p", "alice", "data1", "read"]),
            record(&["p", "bob", "data2", "write"]),
            record(&["p", "data2_admin", "data2", "read"]),
            record(&["p", "data2_admin", "data2", "write"]),
            record(&["g", "alice", "data2_admin"]),
        ]
    }

    async fn seeded() -> KvAdapter<InMemoryKv> {
        let adapter = KvAdapter::new(InMemoryKv::new(), KvConfig::default()).await.unwrap();
        adapter.save_policy(&seed()).await.unwrap();
        adapter
    }

    #[tokio::test]
    async fn test_new_rejects_unreachable_store() {
        let kv = InMemoryKv::new();
        kv.disconnect();
        let err = KvAdapter::new(kv, KvConfig::default()).await.err().unwrap();
        assert!(matches!(err, AdapterError::Kv(_)));
    }

    #[tokio::test]
    async fn test_load_is_key_ordered() {
        let adapter = seeded().await;
        let model = ModelDefinition::default_rbac();
        let loaded = adapter.load_policy(&model).await.unwrap();
        assert_eq!(loaded.len(), 5);
        assert_eq!(loaded[0], record(&["g", "alice", "data2_admin"]));
        assert_eq!(loaded[1], record(&["p", "alice", "data1", "read"]));
    }

    #[tokio::test]
    async fn test_filter_prefix_does_not_leak_similar_values() {
        let adapter = seeded().await;
        adapter.add_policy(&record(&["p", "alice2", "data9", "read"])).await.unwrap();
        let model = ModelDefinition::default_rbac();

        let filter = Filter::new().with_ptype(["p"]).with_value(0, ["alice"]);
        let loaded = adapter.load_filtered_policy(&model, &filter.into()).await.unwrap();
        assert_eq!(loaded, vec![record(&["p", "alice", "data1", "read"])]);
        assert!(adapter.is_filtered());
    }

    #[tokio::test]
    async fn test_remove_with_interior_wildcard() {
        let adapter = seeded().await;
        adapter
            .remove_filtered_policy("p", 1, &strings(&["data2"]))
            .await
            .unwrap();
        let keys = adapter.backend().keys();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| !k.contains("data2/")));
    }

    #[tokio::test]
    async fn test_update_policy_replaces_old_key() {
        let adapter = seeded().await;
        adapter
            .update_policy(
                &record(&["p", "alice", "data1", "read"]),
                &record(&["p", "alice", "data1", "write"]),
            )
            .await
            .unwrap();
        let keys = adapter.backend().keys();
        assert!(keys.contains(&"/rbac/casbin_rule/p/alice/data1/write".to_string()));
        assert!(!keys.contains(&"/rbac/casbin_rule/p/alice/data1/read".to_string()));
    }

    #[tokio::test]
    async fn test_update_policies_rejects_mismatched_lists() {
        let adapter = seeded().await;
        let err = adapter
            .update_policies(&seed(), &seed()[..1])
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::InvalidRule(_)));
        assert_eq!(adapter.backend().len(), 5);
    }

    #[tokio::test]
    async fn test_malformed_keys_are_skipped_on_load() {
        let adapter = seeded().await;
        adapter
            .backend()
            .put("/rbac/casbin_rule/p/1/2/3/4/5/6/7/8")
            .await
            .unwrap();
        let model = ModelDefinition::default_rbac();
        assert_eq!(adapter.load_policy(&model).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_config_builders() {
        let config = KvConfig::default()
            .with_prefix("/tenants/acme")
            .with_save_mode(SaveMode::Transactional);
        let adapter = KvAdapter::new(InMemoryKv::new(), config).await.unwrap();
        assert_eq!(adapter.codec().root(), "/tenants/acme/casbin_rule");
    }
}
