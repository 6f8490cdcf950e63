//! Exercises rollback's divergence search, local undo, and remote
//! replacement against a `NodeTransport` double standing in for the sync
//! source.

use async_trait::async_trait;
use replicore::core::{Document, Namespace, PrimaryKey, Result};
use replicore::gtid::{Gtid, GtidManager};
use replicore::net::{
    GhostProgressReport, HeartbeatReply, HeartbeatRequest, NodeTransport, VoteReply, VoteRequest,
};
use replicore::oplog::{OplogEntry, OplogStore, SubOp};
use replicore::replset::{MemberConfig, ReplSetConfig, ReplSetController};
use replicore::rollback::{RollbackEngine, RollbackPhase};
use replicore::storage::{InMemoryStorageEngine, StorageEngine};
use std::sync::Arc;
use tokio::sync::Mutex;

/// A sync source whose own oplog and documents diverge from the node under
/// test partway through: it agrees up to `agree_upto`, then has a
/// completely different tail, and serves its own current document state.
/// `fetch_calls` counts every `fetch_document` call so a test can assert
/// rollback only reaches out for documents it truly can't reconstruct
/// locally.
struct DivergentSource {
    agree_upto: Gtid,
    agree_entry: OplogEntry,
    documents: std::collections::HashMap<(String, String), Document>,
    fetch_calls: Mutex<u32>,
}

#[async_trait]
impl NodeTransport for DivergentSource {
    async fn heartbeat(&self, _target: &str, _req: HeartbeatRequest) -> Result<HeartbeatReply> {
        unimplemented!()
    }

    async fn request_vote(&self, _target: &str, _req: VoteRequest) -> Result<VoteReply> {
        unimplemented!()
    }

    async fn oplog_after(&self, _target: &str, _after: Gtid, _limit: usize) -> Result<Vec<OplogEntry>> {
        Ok(Vec::new())
    }

    async fn oplog_entry_at(&self, _target: &str, gtid: Gtid) -> Result<Option<OplogEntry>> {
        if gtid == self.agree_upto {
            Ok(Some(self.agree_entry.clone()))
        } else {
            // Every other entry the source is asked about either never
            // existed on its chain, or existed with different (ts, h) —
            // modeled here as simply absent, which is the degenerate case
            // `find_divergence_point` also has to handle.
            Ok(None)
        }
    }

    async fn last_oplog_entry(&self, _target: &str) -> Result<Option<OplogEntry>> {
        Ok(Some(self.agree_entry.clone()))
    }

    async fn fetch_document(&self, _target: &str, ns: &Namespace, pk: &PrimaryKey) -> Result<Option<Document>> {
        *self.fetch_calls.lock().await += 1;
        Ok(self.documents.get(&(ns.to_string(), pk.to_string())).cloned())
    }

    async fn clone_collection(&self, _target: &str, _ns: &Namespace) -> Result<Vec<Document>> {
        Ok(Vec::new())
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
        unimplemented!("not exercised by rollback")
    }

    async fn report_ghost_progress(&self, _target: &str, _report: GhostProgressReport) -> Result<()> {
        Ok(())
    }

    async fn min_unapplied(&self, _target: &str) -> Result<Gtid> {
        Ok(Gtid::INITIAL)
    }
}

fn single_member_config() -> ReplSetConfig {
    ReplSetConfig {
        set_name: "rs0".to_string(),
        version: 1,
        members: vec![MemberConfig {
            id: 0,
            host: "node-host".to_string(),
            priority: 1.0,
            votes: 1,
            arbiter_only: false,
            hidden: false,
            build_indexes: true,
            slave_delay_secs: 0,
        }],
    }
}

#[tokio::test]
async fn rollback_undoes_diverged_writes_and_lands_on_the_agreed_gtid() {
    let ns: Namespace = "db.c".into();
    let storage = Arc::new(InMemoryStorageEngine::new());
    let oplog = Arc::new(OplogStore::new(60_000));
    let gtid = Arc::new(GtidManager::new());

    // Entry 1: the two chains agree here.
    let original_doc1 = serde_json::json!({"_id": 1, "v": "original"}).as_object().unwrap().clone();
    let original_doc2 = serde_json::json!({"_id": 2, "v": "original"}).as_object().unwrap().clone();
    let agree_ops = vec![
        SubOp::Insert { ns: ns.clone(), row: original_doc1.clone(), from_migrate: None },
        SubOp::Insert { ns: ns.clone(), row: original_doc2.clone(), from_migrate: None },
    ];
    for op in &agree_ops {
        storage.apply_write(op).await.unwrap();
    }
    let agree_entry = oplog.append(Gtid::new(1, 1), 100, true, agree_ops).await.unwrap();

    // Entry 2: only this node has it, made while partitioned from the rest
    // of the set. Doc 1's update carries a `pre`-image, so rollback can
    // revert it exactly without contacting the source. Doc 2's delete
    // carries none, so rollback must fetch the source's current version.
    let stray_doc1 = serde_json::json!({"_id": 1, "v": "stray-update"}).as_object().unwrap().clone();
    let stray_ops = vec![
        SubOp::Update {
            ns: ns.clone(),
            pk: serde_json::json!(1),
            pre: Some(original_doc1.clone()),
            post: stray_doc1.clone(),
            from_migrate: None,
        },
        SubOp::Delete {
            ns: ns.clone(),
            pk: serde_json::json!(2),
            pre: None,
            from_migrate: None,
        },
    ];
    for op in &stray_ops {
        storage.apply_write(op).await.unwrap();
    }
    oplog.append(Gtid::new(1, 2), 200, true, stray_ops).await.unwrap();

    // The source's authoritative state for document 2 has since moved on;
    // document 1 is deliberately absent since rollback must never ask for
    // it given it reconstructs locally.
    let mut documents = std::collections::HashMap::new();
    documents.insert(
        (ns.to_string(), serde_json::json!(2).to_string()),
        serde_json::json!({"_id": 2, "v": "source-current"}).as_object().unwrap().clone(),
    );
    let source = Arc::new(DivergentSource {
        agree_upto: Gtid::new(1, 1),
        agree_entry: agree_entry.clone(),
        documents,
        fetch_calls: Mutex::new(0),
    });

    let controller = Arc::new(ReplSetController::new("node-host", single_member_config(), gtid.clone()));
    controller.transition_to(replicore::replset::MemberState::Startup2).await.unwrap();
    controller.transition_to(replicore::replset::MemberState::Secondary).await.unwrap();

    let engine = RollbackEngine::new(storage.clone(), oplog.clone(), gtid.clone(), source.clone(), controller);
    let landed = engine.run("source-host", 1_000).await.unwrap();
    assert_eq!(landed, Gtid::new(1, 1));
    assert_eq!(engine.phase().await, RollbackPhase::NotStarted);

    // Document 1 reverted locally to its pre-divergence state.
    let doc1 = storage.find(&ns, &serde_json::json!(1)).await.unwrap().unwrap();
    assert_eq!(doc1.get("v").unwrap(), "original");

    // Document 2 reflects the source's current version, fetched remotely
    // exactly once.
    let doc2 = storage.find(&ns, &serde_json::json!(2)).await.unwrap().unwrap();
    assert_eq!(doc2.get("v").unwrap(), "source-current");
    assert_eq!(*source.fetch_calls.lock().await, 1);

    let frontier = gtid.get_live_state().await;
    assert_eq!(frontier.live, Gtid::new(1, 1));
}
