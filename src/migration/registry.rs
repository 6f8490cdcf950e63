use crate::core::{Namespace, ReplError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// The external service of record for chunk ownership (spec.md §1's
/// "config registry", §4.9/§4.10's critical-section commit). Modeled as a
/// CAS over `(namespace, version) -> owner`, grounded on the teacher's
/// `move_shard_leader` compare-and-swap in `persist::cluster`'s routing
/// table.
#[async_trait]
pub trait ConfigRegistry: Send + Sync {
    async fn current_version(&self, ns: &Namespace) -> Result<u64>;
    async fn current_owner(&self, ns: &Namespace) -> Result<String>;
    /// Commits chunk ownership to `new_owner`, succeeding only if
    /// `expected_version` matches the registry's current version for
    /// `ns` — the critical-section commit (spec.md §4.9.6). On mismatch
    /// returns `ChunkVersionMismatch` so the caller can refresh and abort.
    async fn commit_chunk_move(
        &self,
        ns: &Namespace,
        expected_version: u64,
        new_owner: String,
    ) -> Result<u64>;
}

#[derive(Default)]
pub struct InMemoryConfigRegistry {
    entries: RwLock<HashMap<String, (u64, String)>>,
}

impl InMemoryConfigRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, ns: &Namespace, initial_owner: impl Into<String>) {
        self.entries
            .write()
            .await
            .insert(ns.to_string(), (1, initial_owner.into()));
    }
}

#[async_trait]
impl ConfigRegistry for InMemoryConfigRegistry {
    async fn current_version(&self, ns: &Namespace) -> Result<u64> {
        self.entries
            .read()
            .await
            .get(&ns.to_string())
            .map(|(v, _)| *v)
            .ok_or_else(|| ReplError::NotFound(format!("no registry entry for {ns}")))
    }

    async fn current_owner(&self, ns: &Namespace) -> Result<String> {
        self.entries
            .read()
            .await
            .get(&ns.to_string())
            .map(|(_, owner)| owner.clone())
            .ok_or_else(|| ReplError::NotFound(format!("no registry entry for {ns}")))
    }

    async fn commit_chunk_move(
        &self,
        ns: &Namespace,
        expected_version: u64,
        new_owner: String,
    ) -> Result<u64> {
        let mut entries = self.entries.write().await;
        let current = entries
            .get(&ns.to_string())
            .cloned()
            .ok_or_else(|| ReplError::NotFound(format!("no registry entry for {ns}")))?;
        if current.0 != expected_version {
            return Err(ReplError::ChunkVersionMismatch {
                have: current.0,
                want: expected_version,
            });
        }
        let new_version = current.0 + 1;
        entries.insert(ns.to_string(), (new_version, new_owner));
        Ok(new_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commit_rejects_stale_version() {
        let registry = InMemoryConfigRegistry::new();
        let ns: Namespace = "db.c".into();
        registry.register(&ns, "donor").await;
        let result = registry.commit_chunk_move(&ns, 999, "recipient".to_string()).await;
        assert!(matches!(result, Err(ReplError::ChunkVersionMismatch { .. })));
        let ok = registry.commit_chunk_move(&ns, 1, "recipient".to_string()).await;
        assert_eq!(ok.unwrap(), 2);
        assert_eq!(registry.current_owner(&ns).await.unwrap(), "recipient");
    }
}
