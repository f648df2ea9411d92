//! Key-value primitives behind the hierarchical driver.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Error type for key-value backends.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KvError {
    /// Store unreachable or transport failure.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Store refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// One mutation inside an atomic [`KvBackend::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    /// Create or overwrite a key with an empty value.
    Put(String),
    /// Delete one key.
    Delete(String),
    /// Delete every key starting with the prefix.
    DeletePrefix(String),
}

/// Hierarchical key-value store.
///
/// Values are never read; existence of a key is the record.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Check the store is reachable.
    async fn ping(&self) -> Result<(), KvError>;

    /// Keys starting with `prefix`, ascending.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError>;

    /// Create or overwrite `key`.
    async fn put(&self, key: &str) -> Result<(), KvError>;

    /// Delete `key`; returns how many keys were removed (0 or 1).
    async fn delete(&self, key: &str) -> Result<u64, KvError>;

    /// Delete every key starting with `prefix`; returns how many.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, KvError>;

    /// Apply `ops` in order, all or nothing.
    async fn commit(&self, ops: Vec<KvOp>) -> Result<(), KvError>;
}

/// In-memory key-value store.
///
/// Uses a BTreeMap for ascending key order. Clones share one keyspace, so
/// several adapters can be pointed at the same store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryKv {
    keys: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    offline: Arc<AtomicBool>,
}

impl InMemoryKv {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`KvError::Unavailable`] until
    /// [`InMemoryKv::reconnect`].
    pub fn disconnect(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    /// Undo [`InMemoryKv::disconnect`].
    pub fn reconnect(&self) {
        self.offline.store(false, Ordering::SeqCst);
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    /// True if the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    /// Snapshot of all keys, ascending.
    pub fn keys(&self) -> Vec<String> {
        self.keys.read().keys().cloned().collect()
    }

    fn check_online(&self) -> Result<(), KvError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(KvError::Unavailable("in-memory store is disconnected".to_string()))
        } else {
            Ok(())
        }
    }
}

fn remove_prefix(keys: &mut BTreeMap<String, Vec<u8>>, prefix: &str) -> u64 {
    let doomed: Vec<String> = keys
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, _)| k.clone())
        .collect();
    for key in &doomed {
        keys.remove(key);
    }
    doomed.len() as u64
}

#[async_trait]
impl KvBackend for InMemoryKv {
    async fn ping(&self) -> Result<(), KvError> {
        self.check_online()
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        self.check_online()?;
        Ok(self
            .keys
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn put(&self, key: &str) -> Result<(), KvError> {
        self.check_online()?;
        self.keys.write().insert(key.to_string(), Vec::new());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<u64, KvError> {
        self.check_online()?;
        Ok(self.keys.write().remove(key).map_or(0, |_| 1))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, KvError> {
        self.check_online()?;
        Ok(remove_prefix(&mut self.keys.write(), prefix))
    }

    async fn commit(&self, ops: Vec<KvOp>) -> Result<(), KvError> {
        self.check_online()?;
        // Single write guard: readers see all of the ops or none.
        let mut keys = self.keys.write();
        for op in ops {
            match op {
                KvOp::Put(key) => {
                    keys.insert(key, Vec::new());
                }
                KvOp::Delete(key) => {
                    keys.remove(&key);
                }
                KvOp::DeletePrefix(prefix) => {
                    remove_prefix(&mut keys, &prefix);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scan_is_ascending_and_prefix_bounded() {
        let kv = InMemoryKv::new();
        kv.put("/a/b").await.unwrap();
        kv.put("/a/a").await.unwrap();
        kv.put("/b/a").await.unwrap();

        let keys = kv.scan_prefix("/a/").await.unwrap();
        assert_eq!(keys, vec!["/a/a", "/a/b"]);
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let kv = InMemoryKv::new();
        kv.put("/k").await.unwrap();
        kv.put("/k").await.unwrap();
        assert_eq!(kv.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_prefix_counts() {
        let kv = InMemoryKv::new();
        for key in ["/r/p/1", "/r/p/2", "/r/g/1"] {
            kv.put(key).await.unwrap();
        }
        assert_eq!(kv.delete_prefix("/r/p/").await.unwrap(), 2);
        assert_eq!(kv.delete("/r/g/1").await.unwrap(), 1);
        assert_eq!(kv.delete("/r/g/1").await.unwrap(), 0);
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn test_commit_applies_in_order() {
        let kv = InMemoryKv::new();
        kv.put("/r/old").await.unwrap();
        kv.commit(vec![
            KvOp::DeletePrefix("/r/".to_string()),
            KvOp::Put("/r/new".to_string()),
            KvOp::Put("/r/gone".to_string()),
            KvOp::Delete("/r/gone".to_string()),
        ])
        .await
        .unwrap();
        assert_eq!(kv.keys(), vec!["/r/new"]);
    }

    #[tokio::test]
    async fn test_disconnect_fails_every_call() {
        let kv = InMemoryKv::new();
        let shared = kv.clone();
        kv.disconnect();
        assert!(matches!(shared.ping().await, Err(KvError::Unavailable(_))));
        assert!(shared.put("/k").await.is_err());
        assert!(shared.commit(vec![]).await.is_err());

        kv.reconnect();
        shared.put("/k").await.unwrap();
        assert_eq!(kv.len(), 1);
    }
}
