//! The external collaborator spec.md §1 calls "the transactional key/value
//! storage engine": snapshots, serializable transactions, and an ordered
//! cursor over user collections. Out of scope per spec.md, and narrowed
//! here to exactly the surface the rest of this crate calls through —
//! the teacher's `storage::engine::StorageEngine` trait shape
//! (create/insert/scan/schema), reshaped from SQL tables to document
//! collections keyed by `_id`.
//!
//! `InMemoryStorageEngine` is a minimal reference implementation used by
//! tests and the in-process demo node; a production deployment would
//! plug in a real engine behind the same trait.

mod memory;

pub use memory::InMemoryStorageEngine;

use crate::core::{Document, Namespace, PrimaryKey, Result};
use crate::oplog::SubOp;
use async_trait::async_trait;
use std::sync::Arc;

/// A read-only, point-in-time view of all collections, used by rollback's
/// remote-snapshot step (§4.8.8) and migration's donor clone (§4.9.3).
#[async_trait]
pub trait StorageSnapshot: Send + Sync {
    async fn find(&self, ns: &Namespace, pk: &PrimaryKey) -> Option<Document>;
    async fn scan_range(&self, ns: &Namespace, key_field: &str, min: &serde_json::Value, max: &serde_json::Value) -> Vec<Document>;
}

#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Applies one sub-operation to user collections. The caller (oplog
    /// applier, rollback, migration recipient) is responsible for pairing
    /// this with the corresponding oplog/side-log bookkeeping so that the
    /// whole unit is atomic from spec.md's perspective; the storage engine
    /// itself guarantees each individual call is durable and isolated.
    async fn apply_write(&self, op: &SubOp) -> Result<()>;

    async fn find(&self, ns: &Namespace, pk: &PrimaryKey) -> Result<Option<Document>>;

    /// Full scan of a namespace, used by initial sync's collection clone
    /// (§4.7) where there is no shard-key range to narrow by.
    async fn scan_all(&self, ns: &Namespace) -> Result<Vec<Document>>;

    /// Half-open range scan over the shard-key projection, used by chunk
    /// migration's `_migrateClone` (§4.9.3).
    async fn scan_range(
        &self,
        ns: &Namespace,
        key_field: &str,
        min: &serde_json::Value,
        max: &serde_json::Value,
    ) -> Result<Vec<Document>>;

    async fn delete_range(
        &self,
        ns: &Namespace,
        key_field: &str,
        min: &serde_json::Value,
        max: &serde_json::Value,
    ) -> Result<u64>;

    async fn snapshot(&self) -> Result<Arc<dyn StorageSnapshot>>;
}
