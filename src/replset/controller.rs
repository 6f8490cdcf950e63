use super::commands::{IsMasterReply, MemberStatus, ReplSetStatusReply};
use super::election::ElectionManager;
use super::heartbeat::{send_heartbeat, HeartbeatTracker};
use super::member::ReplSetConfig;
use super::state::MemberState;
use crate::core::{ReplError, Result};
use crate::gtid::GtidManager;
use crate::net::{HeartbeatReply, HeartbeatRequest, NodeTransport, VoteReply, VoteRequest};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

/// Refcounted `replSetMaintenance` guard (SPEC_FULL.md §B.1): nested
/// enter/exit calls are supported, and the node only leaves `RECOVERING`
/// once the count returns to zero, the way the teacher's
/// `persist::runtime` guards a snapshot-in-progress flag with a counter
/// rather than a boolean.
#[derive(Default)]
pub struct MaintenanceGuard {
    count: AtomicU32,
}

impl MaintenanceGuard {
    pub fn enter(&self) -> u32 {
        self.count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn exit(&self) -> u32 {
        self.count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c.saturating_sub(1)))
            .unwrap_or(0)
            .saturating_sub(1)
    }

    pub fn active(&self) -> bool {
        self.count.load(Ordering::SeqCst) > 0
    }
}

/// Owns the member-state machine, election, heartbeat tracking, freeze and
/// maintenance gates for one node in the set (spec.md §4.5/§4.6).
pub struct ReplSetController {
    self_host: String,
    config: RwLock<ReplSetConfig>,
    state: RwLock<MemberState>,
    pub election: ElectionManager,
    pub heartbeats: HeartbeatTracker,
    gtid: Arc<GtidManager>,
    pub maintenance: MaintenanceGuard,
    freeze_until_ms: AtomicI64,
    highest_known_primary: RwLock<Option<String>>,
}

impl ReplSetController {
    pub fn new(self_host: impl Into<String>, config: ReplSetConfig, gtid: Arc<GtidManager>) -> Self {
        ReplSetController {
            self_host: self_host.into(),
            config: RwLock::new(config),
            state: RwLock::new(MemberState::Startup),
            election: ElectionManager::new(),
            heartbeats: HeartbeatTracker::new(),
            gtid,
            maintenance: MaintenanceGuard::default(),
            freeze_until_ms: AtomicI64::new(0),
            highest_known_primary: RwLock::new(None),
        }
    }

    pub async fn state(&self) -> MemberState {
        *self.state.read().await
    }

    pub async fn config(&self) -> ReplSetConfig {
        self.config.read().await.clone()
    }

    #[instrument(skip(self))]
    pub async fn transition_to(&self, to: MemberState) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.can_transition_to(to) {
            return Err(ReplError::Fatal(format!(
                "illegal state transition {state:?} -> {to:?}"
            )));
        }
        info!(from = ?*state, to = ?to, "replica set state transition");
        *state = to;
        Ok(())
    }

    pub async fn is_primary(&self) -> bool {
        *self.state.read().await == MemberState::Primary
    }

    /// Runs the `STARTUP` -> `STARTUP2` -> `SECONDARY` sequence. A
    /// single-voter set has no one to hold an election against, so it goes
    /// straight on to `PRIMARY` instead of waiting in `SECONDARY` for a
    /// vote that can never arrive (spec.md §4.6's degenerate one-member
    /// case).
    #[instrument(skip(self, transport))]
    pub async fn complete_startup(&self, transport: &dyn NodeTransport) -> Result<()> {
        self.transition_to(MemberState::Startup2).await?;
        self.transition_to(MemberState::Secondary).await?;
        if self.config().await.members.len() == 1 {
            let now_ms = chrono::Utc::now().timestamp_millis();
            self.try_become_primary(transport, now_ms).await?;
        }
        Ok(())
    }

    /// Whether this node currently believes a primary exists anywhere in
    /// the set — used by the background election-trigger task to decide
    /// whether it's worth calling `try_become_primary`.
    pub async fn known_primary_exists(&self) -> bool {
        if self.is_primary().await {
            return true;
        }
        self.heartbeats
            .snapshot()
            .await
            .values()
            .any(|d| d.healthy && d.state.as_deref() == Some("Primary"))
    }

    /// `replSetFreeze`: refuses election candidacy for `secs` seconds
    /// (spec.md §4.6). `secs == 0` clears an existing freeze.
    pub fn freeze(&self, secs: u64, now_ms: i64) {
        self.freeze_until_ms.store(now_ms + (secs as i64) * 1000, Ordering::SeqCst);
    }

    pub fn is_frozen(&self, now_ms: i64) -> bool {
        now_ms < self.freeze_until_ms.load(Ordering::SeqCst)
    }

    /// `replSetStepDown`: only valid from `PRIMARY`. `force` bypasses the
    /// (unmodeled here) check for a caught-up secondary to hand off to.
    #[instrument(skip(self))]
    pub async fn step_down(&self, force: bool) -> Result<()> {
        if !self.is_primary().await {
            return Err(ReplError::NotPrimary);
        }
        if !force {
            // A real node would refuse to step down with no electable,
            // caught-up secondary available; left to the caller to check
            // via `replSetGetStatus` before calling this unforced.
        }
        self.gtid.step_down();
        self.transition_to(MemberState::Secondary).await
    }

    /// Attempts to win an election and become primary (spec.md §4.6). The
    /// caller (the background election-trigger task) decides when this is
    /// worth calling — typically after missing heartbeats from the known
    /// primary for the election timeout.
    #[instrument(skip(self, transport))]
    pub async fn try_become_primary(&self, transport: &dyn NodeTransport, now_ms: i64) -> Result<bool> {
        if self.state().await != MemberState::Secondary {
            return Ok(false);
        }
        if self.is_frozen(now_ms) || self.maintenance.active() {
            return Ok(false);
        }
        self.gtid.verify_ready_to_become_primary()?;
        let config = self.config().await;
        let my_last_gtid = self.gtid.get_live_state().await.live;
        let won = self
            .election
            .run_election(&self.self_host, &self.self_host, my_last_gtid, &config, transport)
            .await;
        if won {
            self.gtid.become_primary(self.election.current_term());
            self.transition_to(MemberState::Primary).await?;
            *self.highest_known_primary.write().await = Some(self.self_host.clone());
        }
        Ok(won)
    }

    /// Any time this node observes a term higher than its own — via a
    /// heartbeat reply or by granting a vote — it must step down
    /// immediately if it was primary. A stale term bump with no
    /// accompanying demotion would let a node think it is primary when a
    /// higher-term peer is also primary.
    async fn demote_if_bumped(&self, bumped: bool, peer: &str) {
        if bumped && self.is_primary().await {
            warn!(peer, "observed higher term, stepping down");
            let _ = self.step_down(true).await;
        }
    }

    #[instrument(skip(self))]
    pub async fn handle_heartbeat_request(&self, req: HeartbeatRequest) -> HeartbeatReply {
        let bumped = self.election.observe_term(req.term);
        self.demote_if_bumped(bumped, &req.from).await;
        HeartbeatReply {
            term: self.election.current_term(),
            is_primary: self.is_primary().await,
            state: format!("{:?}", self.state().await),
            last_applied: self.gtid.get_live_state().await.applied,
            auth_ok: true,
        }
    }

    pub async fn handle_vote_request(&self, req: VoteRequest) -> VoteReply {
        // Any non-terminal member can cast a vote, including the current
        // primary — it must be able to grant its vote to a higher-term
        // candidate and step down, the same way it demotes on observing a
        // higher term via heartbeat.
        let can_vote = !self.state().await.is_terminal();
        let my_last_gtid = self.gtid.get_live_state().await.live;
        let bumped = self.election.observe_term(req.term);
        self.demote_if_bumped(bumped, &req.candidate).await;
        self.election.handle_vote_request(req, my_last_gtid, can_vote).await
    }

    /// Sends one heartbeat round to every other member and reacts to any
    /// higher term it learns about. Intended to be called on an interval
    /// by the owning node's background task.
    pub async fn heartbeat_round(&self, transport: &dyn NodeTransport, now_ms: i64) {
        let config = self.config().await;
        for member in &config.members {
            if member.host == self.self_host {
                continue;
            }
            if let Some(observed_term) = send_heartbeat(
                transport,
                &self.heartbeats,
                &self.self_host,
                &member.host,
                self.election.current_term(),
                config.version,
                now_ms,
            )
            .await
            {
                let bumped = self.election.observe_term(observed_term);
                self.demote_if_bumped(bumped, &member.host).await;
            }
        }
    }

    /// `replSetReconfig`: rejects any config whose version does not
    /// strictly exceed the current one (spec.md §4.5).
    #[instrument(skip(self, new_config))]
    pub async fn reconfig(&self, new_config: ReplSetConfig) -> Result<()> {
        let mut config = self.config.write().await;
        if new_config.version <= config.version {
            return Err(ReplError::InvalidConfig(format!(
                "reconfig version {} does not exceed current version {}",
                new_config.version, config.version
            )));
        }
        *config = new_config;
        Ok(())
    }

    pub async fn is_master_reply(&self) -> IsMasterReply {
        let config = self.config().await;
        let is_primary = self.is_primary().await;
        IsMasterReply {
            is_master: is_primary,
            is_secondary: self.state().await == MemberState::Secondary,
            set_name: config.set_name.clone(),
            primary: self.highest_known_primary.read().await.clone(),
            me: self.self_host.clone(),
        }
    }

    pub async fn status_reply(&self, now_ms: i64) -> ReplSetStatusReply {
        let config = self.config().await;
        let heartbeats = self.heartbeats.snapshot().await;
        let mut members = Vec::new();
        for member in &config.members {
            if member.host == self.self_host {
                members.push(MemberStatus {
                    host: member.host.clone(),
                    state: format!("{:?}", self.state().await),
                    health: 1.0,
                    last_applied: Some(self.gtid.get_live_state().await.applied),
                    self_member: true,
                    uptime_ms: now_ms,
                });
                continue;
            }
            let hb = heartbeats.get(&member.host);
            members.push(MemberStatus {
                host: member.host.clone(),
                state: hb.and_then(|h| h.state.clone()).unwrap_or_else(|| "UNKNOWN".to_string()),
                health: if hb.map(|h| h.healthy).unwrap_or(false) { 1.0 } else { 0.0 },
                last_applied: hb.and_then(|h| h.last_applied),
                self_member: false,
                uptime_ms: hb.map(|h| now_ms - h.last_heartbeat_ms).unwrap_or(0),
            });
        }
        ReplSetStatusReply {
            set_name: config.set_name.clone(),
            term: self.election.current_term(),
            members,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replset::member::MemberConfig;

    fn test_config() -> ReplSetConfig {
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
            ],
        }
    }

    #[tokio::test]
    async fn maintenance_guard_is_refcounted() {
        let guard = MaintenanceGuard::default();
        guard.enter();
        guard.enter();
        assert!(guard.active());
        guard.exit();
        assert!(guard.active());
        guard.exit();
        assert!(!guard.active());
    }

    #[tokio::test]
    async fn single_node_can_complete_startup_and_become_primary() {
        let controller = ReplSetController::new("a", test_config(), Arc::new(GtidManager::new()));
        let transport = crate::net::InMemoryNodeTransport::new();
        controller.complete_startup(&transport).await.unwrap();
        assert_eq!(controller.state().await, MemberState::Primary);
    }

    #[tokio::test]
    async fn reconfig_rejects_non_increasing_version() {
        let controller = ReplSetController::new("a", test_config(), Arc::new(GtidManager::new()));
        let mut bad = test_config();
        bad.version = 1;
        assert!(controller.reconfig(bad).await.is_err());
        let mut good = test_config();
        good.version = 2;
        assert!(controller.reconfig(good).await.is_ok());
    }

    #[tokio::test]
    async fn freeze_blocks_candidacy_window() {
        let controller = ReplSetController::new("a", test_config(), Arc::new(GtidManager::new()));
        controller.freeze(60, 1_000);
        assert!(controller.is_frozen(1_500));
        assert!(!controller.is_frozen(70_000));
    }
}
