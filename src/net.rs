//! Node-to-node RPC surface (spec.md §6 "internal protocol"): heartbeats,
//! vote requests, oplog fetch, and the migration clone/transfer calls.
//! The wire format is explicitly out of scope, so this crate models the
//! surface as a trait and ships only an in-process implementation —
//! grounded on the teacher's `InMemoryRuntimeForwarder`, which plays the
//! same "directory of peer handles, called directly instead of over a
//! socket" role for `persist::cluster`'s shard routing.

use crate::core::{Document, Namespace, PrimaryKey, Result};
use crate::gtid::Gtid;
use crate::oplog::OplogEntry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub from: String,
    pub term: u64,
    pub config_version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatReply {
    pub term: u64,
    pub is_primary: bool,
    pub state: String,
    pub last_applied: Gtid,
    pub auth_ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub candidate: String,
    pub term: u64,
    pub last_gtid: Gtid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteReply {
    pub term: u64,
    pub vote_granted: bool,
    pub reason: Option<String>,
}

/// A downstream member's self-reported replication progress, relayed
/// upstream by whichever node it is chained through (spec.md §2 item 11).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GhostProgressReport {
    pub member: String,
    pub gtid: Gtid,
    pub ts: i64,
}

/// What a node exposes to peers. Implemented by the top-level node type;
/// called through [`NodeTransport`] rather than directly, so production
/// code never depends on being in the same process as its peers.
#[async_trait]
pub trait NodeEndpoint: Send + Sync {
    async fn handle_heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatReply>;
    async fn handle_vote_request(&self, req: VoteRequest) -> Result<VoteReply>;
    async fn oplog_after(&self, after: Gtid, limit: usize) -> Result<Vec<OplogEntry>>;
    async fn oplog_entry_at(&self, gtid: Gtid) -> Result<Option<OplogEntry>>;
    async fn last_oplog_entry(&self) -> Result<Option<OplogEntry>>;
    /// Re-fetches one document's current state, used by rollback to
    /// replace an unreconstructable document with the remote's version
    /// (spec.md §4.8.8).
    async fn fetch_document(&self, ns: &Namespace, pk: &PrimaryKey) -> Result<Option<Document>>;
    async fn clone_collection(&self, ns: &Namespace) -> Result<Vec<Document>>;
    async fn migrate_clone(
        &self,
        ns: &Namespace,
        key_field: &str,
        min: Value,
        max: Value,
    ) -> Result<Vec<Document>>;
    /// `_transferMods`: drains whatever the donor's side-log captured for
    /// the migrating range since the last drain (spec.md §4.9.4).
    async fn transfer_mods(&self, ns: &Namespace) -> Result<Vec<crate::oplog::SubOp>>;
    /// `_recvChunkCommit`: asks the donor to perform the critical-section
    /// CAS and range delete. Only the donor ever calls
    /// `ConfigRegistry::commit_chunk_move`; the recipient reaches it
    /// through this RPC instead of committing the registry itself
    /// (spec.md §4.9.6/§4.10.5).
    async fn commit_chunk_migration(
        &self,
        ns: &Namespace,
        expected_version: u64,
        min: Value,
        max: Value,
        wait_for_delete: Option<bool>,
    ) -> Result<u64>;
    /// Relays a downstream member's replication progress into this node's
    /// ghost-sync relay (spec.md §2 item 11).
    async fn report_ghost_progress(&self, report: GhostProgressReport) -> Result<()>;
    /// This node's own `minUnapplied`, used by rollback to confirm the
    /// divergence point it found does not predate what the sync source
    /// itself has already discarded (spec.md §4.8.4).
    async fn min_unapplied(&self) -> Result<Gtid>;
}

#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn heartbeat(&self, target: &str, req: HeartbeatRequest) -> Result<HeartbeatReply>;
    async fn request_vote(&self, target: &str, req: VoteRequest) -> Result<VoteReply>;
    async fn oplog_after(&self, target: &str, after: Gtid, limit: usize) -> Result<Vec<OplogEntry>>;
    async fn oplog_entry_at(&self, target: &str, gtid: Gtid) -> Result<Option<OplogEntry>>;
    async fn last_oplog_entry(&self, target: &str) -> Result<Option<OplogEntry>>;
    async fn fetch_document(&self, target: &str, ns: &Namespace, pk: &PrimaryKey) -> Result<Option<Document>>;
    async fn clone_collection(&self, target: &str, ns: &Namespace) -> Result<Vec<Document>>;
    async fn migrate_clone(
        &self,
        target: &str,
        ns: &Namespace,
        key_field: &str,
        min: Value,
        max: Value,
    ) -> Result<Vec<Document>>;
    async fn transfer_mods(&self, target: &str, ns: &Namespace) -> Result<Vec<crate::oplog::SubOp>>;
    async fn commit_chunk_migration(
        &self,
        target: &str,
        ns: &Namespace,
        expected_version: u64,
        min: Value,
        max: Value,
        wait_for_delete: Option<bool>,
    ) -> Result<u64>;
    async fn report_ghost_progress(&self, target: &str, report: GhostProgressReport) -> Result<()>;
    async fn min_unapplied(&self, target: &str) -> Result<Gtid>;
}

/// In-process directory of peer endpoints, used by tests and by the demo
/// multi-node binary. Mirrors `InMemoryRuntimeForwarder`'s "register then
/// dispatch by name" shape.
#[derive(Default)]
pub struct InMemoryNodeTransport {
    peers: RwLock<HashMap<String, Arc<dyn NodeEndpoint>>>,
}

impl InMemoryNodeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: impl Into<String>, endpoint: Arc<dyn NodeEndpoint>) {
        self.peers.write().await.insert(id.into(), endpoint);
    }

    async fn get(&self, target: &str) -> Result<Arc<dyn NodeEndpoint>> {
        self.peers
            .read()
            .await
            .get(target)
            .cloned()
            .ok_or_else(|| crate::core::ReplError::NotFound(format!("unknown peer {target}")))
    }
}

#[async_trait]
impl NodeTransport for InMemoryNodeTransport {
    async fn heartbeat(&self, target: &str, req: HeartbeatRequest) -> Result<HeartbeatReply> {
        self.get(target).await?.handle_heartbeat(req).await
    }

    async fn request_vote(&self, target: &str, req: VoteRequest) -> Result<VoteReply> {
        self.get(target).await?.handle_vote_request(req).await
    }

    async fn oplog_after(&self, target: &str, after: Gtid, limit: usize) -> Result<Vec<OplogEntry>> {
        self.get(target).await?.oplog_after(after, limit).await
    }

    async fn oplog_entry_at(&self, target: &str, gtid: Gtid) -> Result<Option<OplogEntry>> {
        self.get(target).await?.oplog_entry_at(gtid).await
    }

    async fn last_oplog_entry(&self, target: &str) -> Result<Option<OplogEntry>> {
        self.get(target).await?.last_oplog_entry().await
    }

    async fn fetch_document(&self, target: &str, ns: &Namespace, pk: &PrimaryKey) -> Result<Option<Document>> {
        self.get(target).await?.fetch_document(ns, pk).await
    }

    async fn clone_collection(&self, target: &str, ns: &Namespace) -> Result<Vec<Document>> {
        self.get(target).await?.clone_collection(ns).await
    }

    async fn migrate_clone(
        &self,
        target: &str,
        ns: &Namespace,
        key_field: &str,
        min: Value,
        max: Value,
    ) -> Result<Vec<Document>> {
        self.get(target)
            .await?
            .migrate_clone(ns, key_field, min, max)
            .await
    }

    async fn transfer_mods(&self, target: &str, ns: &Namespace) -> Result<Vec<crate::oplog::SubOp>> {
        self.get(target).await?.transfer_mods(ns).await
    }

    async fn commit_chunk_migration(
        &self,
        target: &str,
        ns: &Namespace,
        expected_version: u64,
        min: Value,
        max: Value,
        wait_for_delete: Option<bool>,
    ) -> Result<u64> {
        self.get(target)
            .await?
            .commit_chunk_migration(ns, expected_version, min, max, wait_for_delete)
            .await
    }

    async fn report_ghost_progress(&self, target: &str, report: GhostProgressReport) -> Result<()> {
        self.get(target).await?.report_ghost_progress(report).await
    }

    async fn min_unapplied(&self, target: &str) -> Result<Gtid> {
        self.get(target).await?.min_unapplied().await
    }
}
