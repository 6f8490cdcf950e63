//! Initial sync: clone every collection from a sync source as an MVCC
//! snapshot, then replay whatever changed while the clone was running
//! (spec.md §4.7).

use crate::core::{Document, Namespace, ReplError, Result};
use crate::gtid::{Gtid, GtidManager};
use crate::net::NodeTransport;
use crate::oplog::{OplogBody, OplogEntry, OplogStore, SubOp};
use crate::storage::StorageEngine;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub struct InitialSync<S: StorageEngine> {
    storage: Arc<S>,
    oplog: Arc<OplogStore>,
    gtid: Arc<GtidManager>,
    transport: Arc<dyn NodeTransport>,
}

/// Bounds how many gap-fill rounds initial sync will attempt before
/// concluding the source is writing faster than this node can drain the
/// gap, matching spec.md §4.7's "does not converge" failure mode.
const MAX_GAP_FILL_ROUNDS: u32 = 25;

impl<S: StorageEngine + 'static> InitialSync<S> {
    pub fn new(
        storage: Arc<S>,
        oplog: Arc<OplogStore>,
        gtid: Arc<GtidManager>,
        transport: Arc<dyn NodeTransport>,
    ) -> Self {
        InitialSync {
            storage,
            oplog,
            gtid,
            transport,
        }
    }

    /// Runs the full algorithm against `source`, cloning `namespaces`.
    /// Leaves the node's GTID frontier reset to the point the clone
    /// actually reached and its local oplog populated with whatever
    /// changes occurred during the clone.
    #[instrument(skip(self, namespaces))]
    pub async fn run(&self, source: &str, namespaces: &[Namespace]) -> Result<Gtid> {
        let begin = self.last_entry_or_initial(source).await?;
        info!(source, begin = %begin.gtid, "initial sync: starting clone");

        for ns in namespaces {
            let rows = self.transport.clone_collection(source, ns).await?;
            self.insert_cloned_rows(ns, rows).await?;
        }

        let mut cursor = begin.gtid;
        let mut rounds = 0u32;
        loop {
            let end = self.last_entry_or_initial(source).await?;
            if end.gtid == cursor {
                // Source made no further progress since our last check;
                // the gap is closed.
                self.finish(end).await?;
                return Ok(end.gtid);
            }
            let missing = self.transport.oplog_after(source, cursor, 10_000).await?;
            if missing.is_empty() {
                self.finish(end).await?;
                return Ok(end.gtid);
            }
            for entry in &missing {
                self.apply_missing_entry(entry).await?;
                cursor = entry.gtid;
            }
            rounds += 1;
            if rounds >= MAX_GAP_FILL_ROUNDS {
                warn!(source, rounds, "initial sync gap fill did not converge");
                return Err(ReplError::Transient(
                    "initial sync gap fill exceeded maximum rounds".to_string(),
                ));
            }
        }
    }

    async fn last_entry_or_initial(&self, source: &str) -> Result<OplogEntry> {
        match self.transport.last_oplog_entry(source).await? {
            Some(entry) => Ok(entry),
            None => Ok(OplogEntry {
                gtid: Gtid::INITIAL,
                ts: 0,
                h: 0,
                a: true,
                body: OplogBody::Inline(Vec::new()),
            }),
        }
    }

    async fn insert_cloned_rows(&self, ns: &Namespace, rows: Vec<Document>) -> Result<()> {
        for row in rows {
            self.storage
                .apply_write(&SubOp::Insert {
                    ns: ns.clone(),
                    row,
                    from_migrate: None,
                })
                .await?;
        }
        Ok(())
    }

    async fn apply_missing_entry(&self, entry: &OplogEntry) -> Result<()> {
        // A ref-spilled entry fetched from a remote cannot be resolved
        // through our own `oplog.refs` table; the wire protocol for
        // shipping overflow chunks is out of scope (spec.md §1), so such
        // entries are treated as no-ops here and only their envelope is
        // recorded locally.
        let ops = self.oplog.resolve_ops(entry).await.unwrap_or_default();
        for op in &ops {
            self.storage.apply_write(op).await?;
        }
        self.oplog
            .append(entry.gtid, entry.ts, true, ops)
            .await?;
        Ok(())
    }

    async fn finish(&self, end: OplogEntry) -> Result<()> {
        self.gtid.reset_after_initial_sync(end.gtid, end.ts, end.h).await;
        info!(end = %end.gtid, "initial sync converged");
        Ok(())
    }
}
