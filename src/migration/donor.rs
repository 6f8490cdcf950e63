use super::registry::ConfigRegistry;
use super::sidelog::{compare, MigrateSideLog};
use crate::core::{Document, Namespace, ReplError, Result};
use crate::oplog::SubOp;
use crate::storage::StorageEngine;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

struct ActiveMigration {
    ns: Namespace,
    key_field: String,
    side_log: Arc<MigrateSideLog>,
    recipient: String,
}

/// The in-range key bounds of a migration currently committing ownership.
/// While set, `check_write_allowed` blocks new writes that fall inside the
/// range so a primary write can't land between the registry CAS and the
/// donor's local acknowledgment of the new owner (spec.md §4.9.6's
/// critical section).
struct CriticalRange {
    ns: Namespace,
    min: Value,
    max: Value,
}

/// The donor side of chunk migration (spec.md §4.9): serves the initial
/// clone, captures in-range writes to a side-log for the recipient's
/// catch-up loop, and performs the critical-section ownership commit.
pub struct MigrationDonor<S: StorageEngine> {
    storage: Arc<S>,
    registry: Arc<dyn ConfigRegistry>,
    active: RwLock<Option<ActiveMigration>>,
    critical_section: RwLock<Option<CriticalRange>>,
    /// Default to async cleanup: `waitForDelete` (SPEC_FULL.md §B.7) is
    /// opt-in, matching the original's historical default.
    wait_for_delete_default: bool,
}

impl<S: StorageEngine + 'static> MigrationDonor<S> {
    pub fn new(storage: Arc<S>, registry: Arc<dyn ConfigRegistry>) -> Self {
        MigrationDonor {
            storage,
            registry,
            active: RwLock::new(None),
            critical_section: RwLock::new(None),
            wait_for_delete_default: false,
        }
    }

    #[instrument(skip(self))]
    pub async fn start_donating(
        &self,
        ns: Namespace,
        key_field: impl Into<String>,
        min: Value,
        max: Value,
        recipient: impl Into<String>,
    ) -> Result<()> {
        let mut active = self.active.write().await;
        if active.is_some() {
            return Err(ReplError::Transient(
                "a migration is already in progress for this node".to_string(),
            ));
        }
        let key_field = key_field.into();
        *active = Some(ActiveMigration {
            ns,
            key_field: key_field.clone(),
            side_log: Arc::new(MigrateSideLog::new(key_field, min, max)),
            recipient: recipient.into(),
        });
        Ok(())
    }

    /// Hooked into the node's write path (applier and direct primary
    /// writes) so in-range mutations are captured while a migration is
    /// active. A no-op when no migration is in progress.
    pub async fn observe_write(&self, op: &SubOp) {
        if let Some(active) = self.active.read().await.as_ref() {
            if op.ns() == Some(&active.ns) {
                active.side_log.observe(op).await;
            }
        }
    }

    /// `_migrateClone`: the recipient's initial full scan of the migrating
    /// range (spec.md §4.9.3).
    pub async fn migrate_clone(
        &self,
        ns: &Namespace,
        key_field: &str,
        min: Value,
        max: Value,
    ) -> Result<Vec<Document>> {
        self.storage.scan_range(ns, key_field, &min, &max).await
    }

    /// `_transferMods`: drains whatever the side-log captured since the
    /// last drain.
    pub async fn transfer_mods(&self, ns: &Namespace) -> Result<Vec<SubOp>> {
        let active = self.active.read().await;
        match active.as_ref() {
            Some(a) if &a.ns == ns => Ok(a.side_log.drain().await),
            _ => Err(ReplError::NotFound(format!("no migration in progress for {ns}"))),
        }
    }

    /// Only the donor ever calls this: the recipient reaches it through
    /// `NodeEndpoint::commit_chunk_migration` rather than touching the
    /// registry itself (spec.md §4.9.6/§4.10.5). Blocks new in-range
    /// writes for the duration via `critical_section`, commits ownership,
    /// then deletes the donor's copy of the range — synchronously unless
    /// `wait_for_delete` is false, in which case deletion is left for the
    /// caller to schedule asynchronously (SPEC_FULL.md §B.7).
    #[instrument(skip(self))]
    pub async fn commit(&self, expected_version: u64, min: Value, max: Value, wait_for_delete: Option<bool>) -> Result<u64> {
        let active_guard = self.active.read().await;
        let active = active_guard
            .as_ref()
            .ok_or_else(|| ReplError::Transient("no migration to commit".to_string()))?;
        let ns = active.ns.clone();
        let key_field = active.key_field.clone();
        let recipient = active.recipient.clone();
        drop(active_guard);

        self.enter_critical_section(ns.clone(), min.clone(), max.clone()).await;
        let result = self
            .registry
            .commit_chunk_move(&ns, expected_version, recipient)
            .await;
        self.exit_critical_section().await;

        let new_version = match result {
            Ok(v) => v,
            Err(err) => return Err(err),
        };
        self.active.write().await.take();

        let wait = wait_for_delete.unwrap_or(self.wait_for_delete_default);
        if wait {
            self.storage.delete_range(&ns, &key_field, &min, &max).await?;
        } else {
            info!(ns = %ns, "deferring donor-side range delete (waitForDelete=false)");
            let storage = self.storage.clone();
            tokio::spawn(async move {
                if let Err(err) = storage.delete_range(&ns, &key_field, &min, &max).await {
                    warn!(error = %err, "deferred post-migration delete failed");
                }
            });
        }
        Ok(new_version)
    }

    async fn enter_critical_section(&self, ns: Namespace, min: Value, max: Value) {
        *self.critical_section.write().await = Some(CriticalRange { ns, min, max });
    }

    async fn exit_critical_section(&self) {
        *self.critical_section.write().await = None;
    }

    /// Hooked into the primary write path: while this node's critical
    /// section for `ns` is active, writes whose shard key falls in the
    /// migrating range must retry rather than land concurrently with the
    /// ownership CAS (spec.md §4.9.6).
    pub async fn check_write_allowed(&self, ns: &Namespace, value: &Value) -> Result<()> {
        if let Some(range) = self.critical_section.read().await.as_ref() {
            if &range.ns == ns
                && compare(value, &range.min) != std::cmp::Ordering::Less
                && compare(value, &range.max) == std::cmp::Ordering::Less
            {
                return Err(ReplError::RetryWithWriteLock);
            }
        }
        Ok(())
    }

    /// Aborts an in-progress migration (spec.md §4.9's abort path, e.g. on
    /// memory pressure from an unbounded side-log): drops captured state
    /// without touching the registry or local data.
    pub async fn abort(&self) {
        *self.active.write().await = None;
    }
}
