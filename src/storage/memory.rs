use super::{StorageEngine, StorageSnapshot};
use crate::core::{Document, Namespace, PrimaryKey, ReplError, Result};
use crate::oplog::SubOp;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

type Collection = BTreeMap<String, Document>;

fn pk_key(pk: &PrimaryKey) -> String {
    // Stable ordering across scalar _id types; matches how the teacher's
    // in-memory table keys rows by the serialized primary key.
    pk.to_string()
}

/// A reference implementation of [`StorageEngine`] backed by an in-memory
/// `BTreeMap` per namespace, guarded by a single `RwLock`. No real MVCC:
/// `snapshot()` clones the current state, which is sufficient for the
/// single-process tests and demo node this crate ships, but not a stand-in
/// for a production storage engine.
#[derive(Default)]
pub struct InMemoryStorageEngine {
    collections: RwLock<std::collections::HashMap<String, Collection>>,
}

impl InMemoryStorageEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn shard_key_value<'a>(doc: &'a Document, key_field: &str) -> Option<&'a Value> {
        doc.get(key_field)
    }
}

#[async_trait]
impl StorageEngine for InMemoryStorageEngine {
    async fn apply_write(&self, op: &SubOp) -> Result<()> {
        let mut collections = self.collections.write().await;
        match op {
            SubOp::Insert { ns, row, .. } => {
                let pk = row.get("_id").cloned().ok_or_else(|| {
                    ReplError::Storage("insert missing _id".to_string())
                })?;
                let coll = collections.entry(ns.to_string()).or_default();
                coll.insert(pk_key(&pk), row.clone());
            }
            SubOp::Update { ns, pk, post, .. } => {
                let coll = collections.entry(ns.to_string()).or_default();
                coll.insert(pk_key(pk), post.clone());
            }
            SubOp::Delete { ns, pk, .. } => {
                if let Some(coll) = collections.get_mut(&ns.to_string()) {
                    coll.remove(&pk_key(pk));
                }
            }
            SubOp::CappedInsert { ns, pk, row } => {
                let coll = collections.entry(ns.to_string()).or_default();
                coll.insert(pk_key(pk), row.clone());
            }
            SubOp::CappedDelete { ns, pk } => {
                if let Some(coll) = collections.get_mut(&ns.to_string()) {
                    coll.remove(&pk_key(pk));
                }
            }
            SubOp::Command { .. } | SubOp::Comment { .. } => {}
        }
        Ok(())
    }

    async fn find(&self, ns: &Namespace, pk: &PrimaryKey) -> Result<Option<Document>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(&ns.to_string())
            .and_then(|coll| coll.get(&pk_key(pk)))
            .cloned())
    }

    async fn scan_all(&self, ns: &Namespace) -> Result<Vec<Document>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(&ns.to_string())
            .map(|coll| coll.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn scan_range(
        &self,
        ns: &Namespace,
        key_field: &str,
        min: &Value,
        max: &Value,
    ) -> Result<Vec<Document>> {
        let collections = self.collections.read().await;
        let Some(coll) = collections.get(&ns.to_string()) else {
            return Ok(Vec::new());
        };
        Ok(coll
            .values()
            .filter(|doc| {
                Self::shard_key_value(doc, key_field)
                    .map(|v| in_range(v, min, max))
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn delete_range(
        &self,
        ns: &Namespace,
        key_field: &str,
        min: &Value,
        max: &Value,
    ) -> Result<u64> {
        let mut collections = self.collections.write().await;
        let Some(coll) = collections.get_mut(&ns.to_string()) else {
            return Ok(0);
        };
        let doomed: Vec<String> = coll
            .iter()
            .filter(|(_, doc)| {
                Self::shard_key_value(doc, key_field)
                    .map(|v| in_range(v, min, max))
                    .unwrap_or(false)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            coll.remove(key);
        }
        Ok(doomed.len() as u64)
    }

    async fn snapshot(&self) -> Result<Arc<dyn StorageSnapshot>> {
        let collections = self.collections.read().await;
        Ok(Arc::new(InMemorySnapshot {
            collections: collections.clone(),
        }))
    }
}

fn in_range(v: &Value, min: &Value, max: &Value) -> bool {
    compare_values(v, min) != std::cmp::Ordering::Less
        && compare_values(v, max) == std::cmp::Ordering::Less
}

fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

struct InMemorySnapshot {
    collections: std::collections::HashMap<String, Collection>,
}

#[async_trait]
impl StorageSnapshot for InMemorySnapshot {
    async fn find(&self, ns: &Namespace, pk: &PrimaryKey) -> Option<Document> {
        self.collections
            .get(&ns.to_string())
            .and_then(|coll| coll.get(&pk_key(pk)))
            .cloned()
    }

    async fn scan_range(&self, ns: &Namespace, key_field: &str, min: &Value, max: &Value) -> Vec<Document> {
        let Some(coll) = self.collections.get(&ns.to_string()) else {
            return Vec::new();
        };
        coll.values()
            .filter(|doc| {
                InMemoryStorageEngine::shard_key_value(doc, key_field)
                    .map(|v| in_range(v, min, max))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Namespace;

    #[tokio::test]
    async fn insert_then_find_round_trips() {
        let engine = InMemoryStorageEngine::new();
        let ns: Namespace = "db.c".into();
        let row = serde_json::json!({"_id": 1, "v": "x"}).as_object().unwrap().clone();
        engine
            .apply_write(&SubOp::Insert {
                ns: ns.clone(),
                row: row.clone(),
                from_migrate: None,
            })
            .await
            .unwrap();
        let found = engine.find(&ns, &serde_json::json!(1)).await.unwrap();
        assert_eq!(found, Some(row));
    }

    #[tokio::test]
    async fn scan_range_respects_half_open_bounds() {
        let engine = InMemoryStorageEngine::new();
        let ns: Namespace = "db.c".into();
        for i in 0..5 {
            let row = serde_json::json!({"_id": i, "shard_key": i}).as_object().unwrap().clone();
            engine
                .apply_write(&SubOp::Insert { ns: ns.clone(), row, from_migrate: None })
                .await
                .unwrap();
        }
        let rows = engine
            .scan_range(&ns, "shard_key", &serde_json::json!(1), &serde_json::json!(4))
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
    }
}
