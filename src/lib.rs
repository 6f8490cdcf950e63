//! Replication and sharded chunk-migration core for a document database
//! server: GTID assignment, the hash-chained oplog, the replica-set
//! member state machine, the producer/applier pipeline, initial sync,
//! rollback, and chunk migration.

pub mod config;
pub mod core;
pub mod ghost;
pub mod gtid;
pub mod initial_sync;
pub mod migration;
pub mod net;
pub mod oplog;
pub mod replinfo;
pub mod replset;
pub mod rollback;
pub mod storage;
pub mod sync;

use crate::config::NodeConfig;
use crate::core::{Document, Namespace, PrimaryKey, Result};
use crate::ghost::GhostSyncRelay;
use crate::gtid::{Gtid, GtidManager};
use crate::initial_sync::InitialSync;
use crate::migration::{ConfigRegistry, MigrationDonor, MigrationRecipient};
use crate::net::{
    GhostProgressReport, HeartbeatReply, HeartbeatRequest, NodeEndpoint, NodeTransport, VoteReply,
    VoteRequest,
};
use crate::oplog::{OplogEntry, OplogStore, SubOp};
use crate::replinfo::{PartitionThread, ReplInfoWriter};
use crate::replset::ReplSetController;
use crate::rollback::RollbackEngine;
use crate::storage::StorageEngine;
use crate::sync::{Applier, BackgroundSync};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Wires every module into one addressable node: the unit a test harness
/// or the demo binary creates one of per replica-set member and registers
/// with a shared [`net::InMemoryNodeTransport`].
pub struct ReplicaNode<S: StorageEngine> {
    pub host: String,
    pub storage: Arc<S>,
    pub oplog: Arc<OplogStore>,
    pub gtid: Arc<GtidManager>,
    pub controller: Arc<ReplSetController>,
    pub transport: Arc<dyn NodeTransport>,
    pub donor: Arc<MigrationDonor<S>>,
    pub registry: Arc<dyn ConfigRegistry>,
    pub replinfo: Arc<ReplInfoWriter>,
    pub ghost: Arc<GhostSyncRelay>,
    pub applier: Arc<Applier<S>>,
    pub background_sync: Arc<BackgroundSync>,
    pub rollback: Arc<RollbackEngine<S>>,
    pub initial_sync: Arc<InitialSync<S>>,
    oplog_retention_ms: i64,
}

impl<S: StorageEngine + 'static> ReplicaNode<S> {
    pub fn new(
        config: NodeConfig,
        storage: Arc<S>,
        transport: Arc<dyn NodeTransport>,
        registry: Arc<dyn ConfigRegistry>,
    ) -> Self {
        let gtid = Arc::new(GtidManager::new());
        let oplog = Arc::new(OplogStore::new(config.oplog_retention_ms));
        let controller = Arc::new(ReplSetController::new(
            config.host.clone(),
            config.repl_set.clone(),
            gtid.clone(),
        ));
        let applier = Arc::new(Applier::new(storage.clone(), oplog.clone(), gtid.clone()));
        let background_sync = Arc::new(BackgroundSync::new(transport.clone(), oplog.clone(), gtid.clone()));
        let replinfo = Arc::new(ReplInfoWriter::new(gtid.clone()));
        let rollback = Arc::new(RollbackEngine::new(
            storage.clone(),
            oplog.clone(),
            gtid.clone(),
            transport.clone(),
            controller.clone(),
        ));
        let initial_sync = Arc::new(InitialSync::new(
            storage.clone(),
            oplog.clone(),
            gtid.clone(),
            transport.clone(),
        ));
        let oplog_retention_ms = config.oplog_retention_ms;
        ReplicaNode {
            host: config.host.clone(),
            storage: storage.clone(),
            oplog,
            gtid,
            controller,
            transport,
            donor: Arc::new(MigrationDonor::new(storage.clone(), registry.clone())),
            registry,
            replinfo,
            ghost: Arc::new(GhostSyncRelay::new()),
            applier,
            background_sync,
            rollback,
            initial_sync,
            oplog_retention_ms,
        }
    }

    pub fn partition_thread(&self) -> PartitionThread {
        PartitionThread::new(self.oplog.clone(), self.oplog_retention_ms)
    }
}

#[async_trait]
impl<S: StorageEngine + 'static> NodeEndpoint for ReplicaNode<S> {
    async fn handle_heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatReply> {
        Ok(self.controller.handle_heartbeat_request(req).await)
    }

    async fn handle_vote_request(&self, req: VoteRequest) -> Result<VoteReply> {
        Ok(self.controller.handle_vote_request(req).await)
    }

    async fn oplog_after(&self, after: crate::gtid::Gtid, limit: usize) -> Result<Vec<OplogEntry>> {
        let mut entries = self.oplog.tail_from_gtid(after).await;
        entries.truncate(limit);
        Ok(entries)
    }

    async fn oplog_entry_at(&self, gtid: crate::gtid::Gtid) -> Result<Option<OplogEntry>> {
        Ok(self.oplog.find_by_gtid(gtid).await)
    }

    async fn last_oplog_entry(&self) -> Result<Option<OplogEntry>> {
        Ok(self.oplog.get_last_entry().await)
    }

    async fn fetch_document(&self, ns: &Namespace, pk: &PrimaryKey) -> Result<Option<Document>> {
        self.storage.find(ns, pk).await
    }

    async fn clone_collection(&self, ns: &Namespace) -> Result<Vec<Document>> {
        self.storage.scan_all(ns).await
    }

    async fn migrate_clone(
        &self,
        ns: &Namespace,
        key_field: &str,
        min: Value,
        max: Value,
    ) -> Result<Vec<Document>> {
        self.donor.migrate_clone(ns, key_field, min, max).await
    }

    async fn transfer_mods(&self, ns: &Namespace) -> Result<Vec<SubOp>> {
        self.donor.transfer_mods(ns).await
    }

    async fn commit_chunk_migration(
        &self,
        _ns: &Namespace,
        expected_version: u64,
        min: Value,
        max: Value,
        wait_for_delete: Option<bool>,
    ) -> Result<u64> {
        self.donor.commit(expected_version, min, max, wait_for_delete).await
    }

    async fn report_ghost_progress(&self, report: GhostProgressReport) -> Result<()> {
        self.ghost
            .record_downstream_progress(report.member, report.gtid, report.ts)
            .await;
        Ok(())
    }

    async fn min_unapplied(&self) -> Result<Gtid> {
        Ok(self.gtid.get_mins().await.1)
    }
}

/// Convenience constructor for the recipient side of a migration, sharing
/// this node's storage, transport and registry handles.
impl<S: StorageEngine + 'static> ReplicaNode<S> {
    pub fn migration_recipient(&self) -> MigrationRecipient<S> {
        MigrationRecipient::new(self.storage.clone(), self.transport.clone(), self.registry.clone())
    }
}
