use super::SubOp;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Overflow side table for transactions too large to inline in a single
/// `OplogEntry` (spec.md §3 "oplog.refs"). Keyed by the entry's own id so a
/// single `OplogBody::Ref(id)` pointer round-trips back to its ops.
#[derive(Default)]
pub struct OplogRefs {
    chunks: RwLock<HashMap<Uuid, Vec<SubOp>>>,
}

impl OplogRefs {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn store(&self, ops: Vec<SubOp>) -> Uuid {
        let id = Uuid::new_v4();
        self.chunks.write().await.insert(id, ops);
        id
    }

    pub async fn load(&self, id: &Uuid) -> Option<Vec<SubOp>> {
        self.chunks.read().await.get(id).cloned()
    }

    /// Called once the owning `OplogEntry` has fallen off the retention
    /// window (spec.md §4.2 "trimByTimestamp" also reclaims refs).
    pub async fn remove(&self, id: &Uuid) {
        self.chunks.write().await.remove(id);
    }

    pub async fn len(&self) -> usize {
        self.chunks.read().await.len()
    }
}
