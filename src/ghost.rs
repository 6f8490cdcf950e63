//! The ghost-sync relay (spec.md §2 item 11): in a chained-replication
//! topology a secondary may sync off another secondary instead of the
//! primary directly. The primary still needs to know how far every member
//! has replicated for write-concern acknowledgment, so whichever node a
//! chained member syncs through relays that member's reported GTID
//! upstream — a lightweight side-channel, not a full sync connection.
//! Grounded on the teacher's `InMemoryRuntimeForwarder` directory-of-peers
//! shape (`src/net.rs`), narrowed to a plain in-memory progress table plus
//! a relay call rather than a spawned task, since the cadence belongs to
//! the node's heartbeat loop (spec.md §4.1).

use crate::core::Result;
use crate::gtid::Gtid;
use crate::net::{GhostProgressReport, NodeTransport};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{info, instrument};

#[derive(Debug, Clone, Copy)]
struct DownstreamProgress {
    gtid: Gtid,
    ts: i64,
}

/// Tracks every downstream member currently chained through this node and
/// relays the slowest of them upstream toward the primary.
#[derive(Default)]
pub struct GhostSyncRelay {
    downstream: RwLock<HashMap<String, DownstreamProgress>>,
}

impl GhostSyncRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a downstream member's self-reported progress, delivered via
    /// `NodeEndpoint::report_ghost_progress`.
    #[instrument(skip(self))]
    pub async fn record_downstream_progress(&self, member: impl Into<String>, gtid: Gtid, ts: i64) {
        let member = member.into();
        self.downstream
            .write()
            .await
            .insert(member.clone(), DownstreamProgress { gtid, ts });
        info!(member, gtid = %gtid, "ghost relay recorded downstream progress");
    }

    /// The slowest tracked downstream member's `(gtid, ts)`, if any — the
    /// point this node's subtree of the chain cannot be considered past
    /// yet.
    pub async fn slowest_downstream(&self) -> Option<(Gtid, i64)> {
        self.downstream
            .read()
            .await
            .values()
            .min_by_key(|p| p.gtid)
            .map(|p| (p.gtid, p.ts))
    }

    pub async fn downstream_count(&self) -> usize {
        self.downstream.read().await.len()
    }

    /// Relays whichever is further behind — this node's own progress or
    /// its slowest downstream member's — to `upstream`. Called on the same
    /// cadence as the heartbeat loop whenever this node is itself syncing
    /// from another secondary rather than directly from the primary.
    #[instrument(skip(self, transport))]
    pub async fn relay_upstream(
        &self,
        transport: &dyn NodeTransport,
        upstream: &str,
        self_host: &str,
        self_gtid: Gtid,
        self_ts: i64,
    ) -> Result<()> {
        let (gtid, ts) = match self.slowest_downstream().await {
            Some((d_gtid, d_ts)) if d_gtid < self_gtid => (d_gtid, d_ts),
            _ => (self_gtid, self_ts),
        };
        transport
            .report_ghost_progress(
                upstream,
                GhostProgressReport {
                    member: self_host.to_string(),
                    gtid,
                    ts,
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Document, Namespace, PrimaryKey};
    use crate::net::{HeartbeatReply, HeartbeatRequest, VoteReply, VoteRequest};
    use crate::oplog::{OplogEntry, SubOp};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        reports: Mutex<Vec<(String, GhostProgressReport)>>,
    }

    #[async_trait]
    impl NodeTransport for RecordingTransport {
        async fn heartbeat(&self, _target: &str, _req: HeartbeatRequest) -> Result<HeartbeatReply> {
            unimplemented!()
        }
        async fn request_vote(&self, _target: &str, _req: VoteRequest) -> Result<VoteReply> {
            unimplemented!()
        }
        async fn oplog_after(&self, _target: &str, _after: Gtid, _limit: usize) -> Result<Vec<OplogEntry>> {
            Ok(Vec::new())
        }
        async fn oplog_entry_at(&self, _target: &str, _gtid: Gtid) -> Result<Option<OplogEntry>> {
            Ok(None)
        }
        async fn last_oplog_entry(&self, _target: &str) -> Result<Option<OplogEntry>> {
            Ok(None)
        }
        async fn fetch_document(&self, _target: &str, _ns: &Namespace, _pk: &PrimaryKey) -> Result<Option<Document>> {
            Ok(None)
        }
        async fn clone_collection(&self, _target: &str, _ns: &Namespace) -> Result<Vec<Document>> {
            Ok(Vec::new())
        }
        async fn migrate_clone(&self, _target: &str, _ns: &Namespace, _key_field: &str, _min: Value, _max: Value) -> Result<Vec<Document>> {
            Ok(Vec::new())
        }
        async fn transfer_mods(&self, _target: &str, _ns: &Namespace) -> Result<Vec<SubOp>> {
            Ok(Vec::new())
        }
        async fn commit_chunk_migration(&self, _target: &str, _ns: &Namespace, _expected_version: u64, _min: Value, _max: Value, _wait_for_delete: Option<bool>) -> Result<u64> {
            unimplemented!()
        }
        async fn report_ghost_progress(&self, target: &str, report: GhostProgressReport) -> Result<()> {
            self.reports.lock().await.push((target.to_string(), report));
            Ok(())
        }
        async fn min_unapplied(&self, _target: &str) -> Result<Gtid> {
            Ok(Gtid::INITIAL)
        }
    }

    #[tokio::test]
    async fn relays_the_slower_of_self_and_downstream() {
        let relay = GhostSyncRelay::new();
        relay.record_downstream_progress("chained-member", Gtid::new(1, 2), 100).await;
        assert_eq!(relay.downstream_count().await, 1);

        let transport = Arc::new(RecordingTransport::default());
        relay
            .relay_upstream(transport.as_ref(), "primary", "self", Gtid::new(1, 5), 500)
            .await
            .unwrap();

        let reports = transport.reports.lock().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, "primary");
        assert_eq!(reports[0].1.gtid, Gtid::new(1, 2));
    }

    #[tokio::test]
    async fn relays_self_progress_when_ahead_of_downstream() {
        let relay = GhostSyncRelay::new();
        relay.record_downstream_progress("chained-member", Gtid::new(1, 9), 900).await;

        let transport = Arc::new(RecordingTransport::default());
        relay
            .relay_upstream(transport.as_ref(), "primary", "self", Gtid::new(1, 5), 500)
            .await
            .unwrap();

        let reports = transport.reports.lock().await;
        assert_eq!(reports[0].1.gtid, Gtid::new(1, 5));
    }
}
