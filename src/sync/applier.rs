use crate::core::{ReplError, Result};
use crate::gtid::GtidManager;
use crate::oplog::{OplogEntry, OplogStore, SubOp};
use crate::storage::StorageEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, instrument, warn};

/// A node may fall behind by at most this many consecutive failures to
/// apply a single sub-operation before the applier gives up and drives the
/// node to `FATAL` (spec.md §7's ">100 consecutive apply failures").
const MAX_APPLY_RETRIES: u32 = 100;
const APPLY_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Applies oplog entries to user collections in strict GTID order, retrying
/// a bounded number of times on transient storage errors before crashing
/// the node (spec.md §4.4). Entries must be applied one at a time and in
/// order — concurrent appliers would let a later GTID land before an
/// earlier one, corrupting the frontier invariant — so `apply_entry` takes
/// an exclusive lock for its whole duration rather than racing multiple
/// in-flight applies the way a worker pool would.
pub struct Applier<S: StorageEngine> {
    storage: Arc<S>,
    oplog: Arc<OplogStore>,
    gtid: Arc<GtidManager>,
    apply_lock: Mutex<()>,
}

impl<S: StorageEngine + 'static> Applier<S> {
    pub fn new(storage: Arc<S>, oplog: Arc<OplogStore>, gtid: Arc<GtidManager>) -> Self {
        Applier {
            storage,
            oplog,
            gtid,
            apply_lock: Mutex::new(()),
        }
    }

    /// Applies one entry's sub-operations in order, bracketing the whole
    /// entry with `noteApplyingGTID`/`noteGTIDApplied` so the frontier
    /// never advances past work that has not actually landed.
    #[instrument(skip(self, entry), fields(gtid = %entry.gtid))]
    pub async fn apply_entry(&self, entry: &OplogEntry) -> Result<()> {
        let _guard = self.apply_lock.lock().await;
        self.gtid.note_applying_gtid(entry.gtid).await;
        let ops = self.oplog.resolve_ops(entry).await?;
        for op in &ops {
            self.apply_one_with_retry(op).await?;
        }
        self.oplog.mark_applied(entry.gtid).await?;
        self.gtid.note_gtid_applied(entry.gtid).await;
        Ok(())
    }

    async fn apply_one_with_retry(&self, op: &SubOp) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.storage.apply_write(op).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_fatal() => {
                    error!(error = %err, "applier hit a fatal storage error");
                    return Err(err);
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= MAX_APPLY_RETRIES {
                        error!(error = %err, attempt, "applier exhausted retries, crashing");
                        return Err(ReplError::Fatal(format!(
                            "exceeded {MAX_APPLY_RETRIES} consecutive apply failures: {err}"
                        )));
                    }
                    warn!(error = %err, attempt, backoff_ms = APPLY_RETRY_BACKOFF.as_millis() as u64, "retrying apply of sub-operation");
                    tokio::time::sleep(APPLY_RETRY_BACKOFF).await;
                }
            }
        }
    }

    /// Drains every already-unapplied entry currently in the oplog, in
    /// GTID order. Used right after initial sync and after catching up
    /// from a cold start; the steady-state path instead reacts to
    /// `OplogStore::subscribe` as entries arrive.
    pub async fn drain_unapplied(&self, entries: Vec<OplogEntry>) -> Result<()> {
        for entry in entries {
            if entry.a {
                continue;
            }
            self.apply_entry(&entry).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Namespace;
    use crate::gtid::Gtid;
    use crate::storage::InMemoryStorageEngine;

    #[tokio::test]
    async fn apply_entry_writes_through_and_marks_applied() {
        let storage = Arc::new(InMemoryStorageEngine::new());
        let oplog = Arc::new(OplogStore::new(60_000));
        let gtid_mgr = Arc::new(GtidManager::new());
        let ns: Namespace = "db.c".into();
        let row = serde_json::json!({"_id": 1}).as_object().unwrap().clone();
        let entry = oplog
            .append(
                Gtid::new(1, 1),
                100,
                false,
                vec![SubOp::Insert { ns: ns.clone(), row: row.clone(), from_migrate: None }],
            )
            .await
            .unwrap();

        let applier = Applier::new(storage.clone(), oplog.clone(), gtid_mgr);
        applier.apply_entry(&entry).await.unwrap();

        let found = storage.find(&ns, &serde_json::json!(1)).await.unwrap();
        assert_eq!(found, Some(row));
        let stored = oplog.find_by_gtid(Gtid::new(1, 1)).await.unwrap();
        assert!(stored.a);
    }
}
