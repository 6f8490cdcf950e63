use crate::core::{ReplError, Result};
use crate::gtid::GtidManager;
use crate::net::NodeTransport;
use crate::oplog::OplogStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

/// How long a sync source stays blacklisted after an error pulling from it
/// (SPEC_FULL.md §B.2, grounded on `bgsync.cpp`'s `BlacklistedSyncSource`).
const DEFAULT_BLACKLIST_MS: i64 = 30_000;

/// Fetches remote oplog entries from a chosen sync source and appends
/// them locally with `applied = false`, leaving the applier to drain them
/// (spec.md §4.3). Runs as a background task the way the teacher's
/// `RuntimeSnapshotWorker` drives `persist::runtime`'s replication
/// shipping loop — cancellable via `tokio::select!` around a shutdown
/// signal, not built here since it's owned by the node's top-level runtime.
pub struct BackgroundSync {
    transport: Arc<dyn NodeTransport>,
    oplog: Arc<OplogStore>,
    gtid: Arc<GtidManager>,
    blacklist: RwLock<HashMap<String, i64>>,
    batch_size: usize,
}

impl BackgroundSync {
    pub fn new(transport: Arc<dyn NodeTransport>, oplog: Arc<OplogStore>, gtid: Arc<GtidManager>) -> Self {
        BackgroundSync {
            transport,
            oplog,
            gtid,
            blacklist: RwLock::new(HashMap::new()),
            batch_size: 256,
        }
    }

    #[instrument(skip(self))]
    pub async fn blacklist_source(&self, host: &str, now_ms: i64, for_ms: Option<i64>) {
        let until = now_ms + for_ms.unwrap_or(DEFAULT_BLACKLIST_MS);
        self.blacklist.write().await.insert(host.to_string(), until);
        warn!(host, until, "blacklisted sync source");
    }

    pub async fn is_blacklisted(&self, host: &str, now_ms: i64) -> bool {
        self.blacklist
            .read()
            .await
            .get(host)
            .map(|until| now_ms < *until)
            .unwrap_or(false)
    }

    /// Picks the first non-blacklisted, non-self candidate. A real
    /// deployment would also weigh ping time and `slaveDelay`; this keeps
    /// to what spec.md's source-selection description requires.
    pub async fn choose_sync_source(&self, candidates: &[String], self_host: &str, now_ms: i64) -> Option<String> {
        for candidate in candidates {
            if candidate == self_host {
                continue;
            }
            if !self.is_blacklisted(candidate, now_ms).await {
                return Some(candidate.clone());
            }
        }
        None
    }

    /// Pulls everything after our current live GTID from `source` and
    /// appends it locally as unapplied. Returns the number of entries
    /// pulled. On a transport error the caller should blacklist `source`
    /// and retry against another candidate.
    #[instrument(skip(self))]
    pub async fn sync_once(&self, source: &str) -> Result<usize> {
        let live = self.gtid.get_live_state().await.live;

        // Before pulling anything new, confirm the source's chain still
        // agrees with ours at our own live point (spec.md §4.3.a). If it
        // doesn't — or the source no longer has that entry at all — this
        // node has diverged and must roll back rather than keep syncing.
        if !live.is_initial() {
            let remote_at_live = self
                .transport
                .oplog_entry_at(source, live)
                .await
                .map_err(|e| ReplError::Transient(format!("sync source {source} unreachable: {e}")))?
                .map(|e| (e.ts, e.h));
            if self.gtid.rollback_needed(remote_at_live).await {
                warn!(source, live = %live, "oplog divergence detected against sync source");
                return Err(ReplError::RollbackNeeded);
            }
        }

        let entries = self
            .transport
            .oplog_after(source, live, self.batch_size)
            .await
            .map_err(|e| ReplError::Transient(format!("sync source {source} unreachable: {e}")))?;
        let mut applied = 0usize;
        for entry in entries {
            let ops = match &entry.body {
                crate::oplog::OplogBody::Inline(ops) => ops.clone(),
                crate::oplog::OplogBody::Ref(_) => Vec::new(),
            };
            self.oplog
                .append(entry.gtid, entry.ts, false, ops)
                .await?;
            self.gtid.note_gtid_added(entry.gtid, entry.ts, entry.h).await;
            applied += 1;
        }
        if applied > 0 {
            info!(source, applied, "pulled entries from sync source");
        }
        Ok(applied)
    }
}
