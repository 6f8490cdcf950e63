//! Exercises initial sync's clone-then-gap-fill algorithm against a source
//! whose oplog has entries past the point the collection clone captured.

use async_trait::async_trait;
use replicore::core::{Document, Namespace, PrimaryKey, Result};
use replicore::gtid::{Gtid, GtidManager};
use replicore::initial_sync::InitialSync;
use replicore::net::{
    GhostProgressReport, HeartbeatReply, HeartbeatRequest, NodeTransport, VoteReply, VoteRequest,
};
use replicore::oplog::{OplogBody, OplogEntry, OplogStore, SubOp};
use replicore::storage::{InMemoryStorageEngine, StorageEngine};
use std::sync::Arc;
use tokio::sync::Mutex;

/// A sync source with a fixed collection snapshot and a small, fixed oplog
/// tail representing writes that happened after the snapshot was taken.
struct FixedSource {
    rows: Vec<Document>,
    entries: Vec<OplogEntry>,
    last: OplogEntry,
    oplog_after_calls: Mutex<u32>,
    /// The first call to `last_oplog_entry` reports the source's position
    /// at the moment the collection clone began (before `last` was
    /// written); every call after that reports `last`, simulating the
    /// source advancing while the clone was in flight.
    last_entry_calls: Mutex<u32>,
}

#[async_trait]
impl NodeTransport for FixedSource {
    async fn heartbeat(&self, _target: &str, _req: HeartbeatRequest) -> Result<HeartbeatReply> {
        unimplemented!()
    }

    async fn request_vote(&self, _target: &str, _req: VoteRequest) -> Result<VoteReply> {
        unimplemented!()
    }

    async fn oplog_after(&self, _target: &str, after: Gtid, limit: usize) -> Result<Vec<OplogEntry>> {
        *self.oplog_after_calls.lock().await += 1;
        let mut out: Vec<OplogEntry> = self.entries.iter().filter(|e| e.gtid > after).cloned().collect();
        out.truncate(limit);
        Ok(out)
    }

    async fn oplog_entry_at(&self, _target: &str, gtid: Gtid) -> Result<Option<OplogEntry>> {
        Ok(self.entries.iter().find(|e| e.gtid == gtid).cloned())
    }

    async fn last_oplog_entry(&self, _target: &str) -> Result<Option<OplogEntry>> {
        let mut calls = self.last_entry_calls.lock().await;
        *calls += 1;
        if *calls == 1 {
            Ok(None)
        } else {
            Ok(Some(self.last.clone()))
        }
    }

    async fn fetch_document(&self, _target: &str, _ns: &Namespace, _pk: &PrimaryKey) -> Result<Option<Document>> {
        Ok(None)
    }

    async fn clone_collection(&self, _target: &str, _ns: &Namespace) -> Result<Vec<Document>> {
        Ok(self.rows.clone())
    }

    async fn migrate_clone(
        &self,
        _target: &str,
        _ns: &Namespace,
        _key_field: &str,
        _min: serde_json::Value,
        _max: serde_json::Value,
    ) -> Result<Vec<Document>> {
        Ok(Vec::new())
    }

    async fn transfer_mods(&self, _target: &str, _ns: &Namespace) -> Result<Vec<SubOp>> {
        Ok(Vec::new())
    }

    async fn commit_chunk_migration(
        &self,
        _target: &str,
        _ns: &Namespace,
        _expected_version: u64,
        _min: serde_json::Value,
        _max: serde_json::Value,
        _wait_for_delete: Option<bool>,
    ) -> Result<u64> {
        unimplemented!("not exercised by initial sync")
    }

    async fn report_ghost_progress(&self, _target: &str, _report: GhostProgressReport) -> Result<()> {
        Ok(())
    }

    async fn min_unapplied(&self, _target: &str) -> Result<Gtid> {
        Ok(Gtid::INITIAL)
    }
}

#[tokio::test]
async fn initial_sync_clones_then_fills_the_gap_to_convergence() {
    let ns: Namespace = "db.c".into();
    let cloned_row = serde_json::json!({"_id": 1, "v": "from-clone"}).as_object().unwrap().clone();

    let gap_row = serde_json::json!({"_id": 2, "v": "during-clone"}).as_object().unwrap().clone();
    let gap_op = SubOp::Insert { ns: ns.clone(), row: gap_row.clone(), from_migrate: None };
    let gap_entry = OplogEntry {
        gtid: Gtid::new(1, 1),
        ts: 100,
        h: 42,
        a: true,
        body: OplogBody::Inline(vec![gap_op]),
    };

    let source = Arc::new(FixedSource {
        rows: vec![cloned_row.clone()],
        entries: vec![gap_entry.clone()],
        last: gap_entry.clone(),
        oplog_after_calls: Mutex::new(0),
        last_entry_calls: Mutex::new(0),
    });

    let storage = Arc::new(InMemoryStorageEngine::new());
    let oplog = Arc::new(OplogStore::new(60_000));
    let gtid = Arc::new(GtidManager::new());
    let sync = InitialSync::new(storage.clone(), oplog.clone(), gtid.clone(), source);

    let landed = sync.run("source-host", &[ns.clone()]).await.unwrap();
    assert_eq!(landed, Gtid::new(1, 1));

    let rows = storage.scan_all(&ns).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.contains(&cloned_row));
    assert!(rows.contains(&gap_row));

    let frontier = gtid.get_live_state().await;
    assert_eq!(frontier.live, Gtid::new(1, 1));
    assert_eq!(frontier.applied, Gtid::new(1, 1));

    assert!(oplog.find_by_gtid(Gtid::new(1, 1)).await.is_some());
}
