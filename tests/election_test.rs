//! Exercises the replica-set state machine and election across several
//! in-process nodes, wired through `InMemoryNodeTransport` the way a real
//! deployment would be wired through the network.

use async_trait::async_trait;
use replicore::core::{Document, Namespace, PrimaryKey, Result};
use replicore::gtid::{Gtid, GtidManager};
use replicore::net::{
    GhostProgressReport, HeartbeatReply, HeartbeatRequest, InMemoryNodeTransport, NodeEndpoint,
    NodeTransport, VoteReply, VoteRequest,
};
use replicore::oplog::{OplogEntry, SubOp};
use replicore::replset::{MemberConfig, ReplSetConfig, ReplSetController};
use std::sync::Arc;

/// A node stripped to just its replica-set controller, enough to exercise
/// heartbeats and elections without wiring a full storage engine.
struct ElectionOnlyNode {
    controller: Arc<ReplSetController>,
}

#[async_trait]
impl NodeEndpoint for ElectionOnlyNode {
    async fn handle_heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatReply> {
        Ok(self.controller.handle_heartbeat_request(req).await)
    }

    async fn handle_vote_request(&self, req: VoteRequest) -> Result<VoteReply> {
        Ok(self.controller.handle_vote_request(req).await)
    }

    async fn oplog_after(&self, _after: Gtid, _limit: usize) -> Result<Vec<OplogEntry>> {
        Ok(Vec::new())
    }

    async fn oplog_entry_at(&self, _gtid: Gtid) -> Result<Option<OplogEntry>> {
        Ok(None)
    }

    async fn last_oplog_entry(&self) -> Result<Option<OplogEntry>> {
        Ok(None)
    }

    async fn fetch_document(&self, _ns: &Namespace, _pk: &PrimaryKey) -> Result<Option<Document>> {
        Ok(None)
    }

    async fn clone_collection(&self, _ns: &Namespace) -> Result<Vec<Document>> {
        Ok(Vec::new())
    }

    async fn migrate_clone(
        &self,
        _ns: &Namespace,
        _key_field: &str,
        _min: serde_json::Value,
        _max: serde_json::Value,
    ) -> Result<Vec<Document>> {
        Ok(Vec::new())
    }

    async fn transfer_mods(&self, _ns: &Namespace) -> Result<Vec<SubOp>> {
        Ok(Vec::new())
    }

    async fn commit_chunk_migration(
        &self,
        _ns: &Namespace,
        _expected_version: u64,
        _min: serde_json::Value,
        _max: serde_json::Value,
        _wait_for_delete: Option<bool>,
    ) -> Result<u64> {
        unimplemented!("not exercised by election tests")
    }

    async fn report_ghost_progress(&self, _report: GhostProgressReport) -> Result<()> {
        Ok(())
    }

    async fn min_unapplied(&self) -> Result<Gtid> {
        Ok(Gtid::INITIAL)
    }
}

fn three_node_config() -> ReplSetConfig {
    ReplSetConfig {
        set_name: "rs0".to_string(),
        version: 1,
        members: vec![
            MemberConfig {
                id: 0,
                host: "a".to_string(),
                priority: 1.0,
                votes: 1,
                arbiter_only: false,
                hidden: false,
                build_indexes: true,
                slave_delay_secs: 0,
            },
            MemberConfig {
                id: 1,
                host: "b".to_string(),
                priority: 1.0,
                votes: 1,
                arbiter_only: false,
                hidden: false,
                build_indexes: true,
                slave_delay_secs: 0,
            },
            MemberConfig {
                id: 2,
                host: "c".to_string(),
                priority: 1.0,
                votes: 1,
                arbiter_only: false,
                hidden: false,
                build_indexes: true,
                slave_delay_secs: 0,
            },
        ],
    }
}

async fn make_node(host: &str, transport: &Arc<InMemoryNodeTransport>) -> Arc<ReplSetController> {
    let controller = Arc::new(ReplSetController::new(
        host,
        three_node_config(),
        Arc::new(GtidManager::new()),
    ));
    controller.complete_startup(transport.as_ref()).await.unwrap();
    transport
        .register(
            host,
            Arc::new(ElectionOnlyNode {
                controller: controller.clone(),
            }),
        )
        .await;
    controller
}

#[tokio::test]
async fn a_secondary_wins_election_with_a_clean_majority() {
    let transport = Arc::new(InMemoryNodeTransport::new());
    let a = make_node("a", &transport).await;
    let _b = make_node("b", &transport).await;
    let _c = make_node("c", &transport).await;

    let won = a.try_become_primary(transport.as_ref(), 1_000).await.unwrap();
    assert!(won);
    assert!(a.is_primary().await);
}

#[tokio::test]
async fn a_frozen_node_cannot_stand_for_election() {
    let transport = Arc::new(InMemoryNodeTransport::new());
    let a = make_node("a", &transport).await;
    let _b = make_node("b", &transport).await;
    let _c = make_node("c", &transport).await;

    a.freeze(60, 1_000);
    let won = a.try_become_primary(transport.as_ref(), 1_500).await.unwrap();
    assert!(!won);
    assert!(!a.is_primary().await);
}

#[tokio::test]
async fn heartbeat_observing_a_higher_term_demotes_the_primary() {
    let transport = Arc::new(InMemoryNodeTransport::new());
    let a = make_node("a", &transport).await;
    let b = make_node("b", &transport).await;
    let _c = make_node("c", &transport).await;

    assert!(a.try_become_primary(transport.as_ref(), 1_000).await.unwrap());
    assert!(a.is_primary().await);

    // `b` independently wins a later term (simulating a network partition
    // that let `b` see a stale view of `a`'s health).
    assert!(b.try_become_primary(transport.as_ref(), 2_000).await.unwrap());

    // The next heartbeat round `a` sends reveals `b`'s higher term and
    // demotes `a` back to secondary.
    a.heartbeat_round(transport.as_ref(), 3_000).await;
    assert!(!a.is_primary().await);
}

#[tokio::test]
async fn replset_status_reports_self_and_peer_rows_distinctly() {
    let transport = Arc::new(InMemoryNodeTransport::new());
    let a = make_node("a", &transport).await;
    let _b = make_node("b", &transport).await;
    let _c = make_node("c", &transport).await;

    a.heartbeat_round(transport.as_ref(), 5_000).await;
    let status = a.status_reply(5_000).await;
    let self_row = status.members.iter().find(|m| m.host == "a").unwrap();
    assert!(self_row.self_member);
    let peer_row = status.members.iter().find(|m| m.host == "b").unwrap();
    assert!(!peer_row.self_member);
}
