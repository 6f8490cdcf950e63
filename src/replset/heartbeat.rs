use crate::gtid::Gtid;
use crate::net::{HeartbeatReply, NodeTransport};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct MemberHeartbeatData {
    /// Network-reachability health. Independent of `auth_ok` (SPEC_FULL.md
    /// §B.4): a node that answers but fails authentication is still "up".
    pub healthy: bool,
    pub auth_ok: bool,
    pub state: Option<String>,
    pub term: u64,
    pub last_applied: Option<Gtid>,
    pub last_heartbeat_ms: i64,
    pub consecutive_failures: u32,
}

impl Default for MemberHeartbeatData {
    fn default() -> Self {
        MemberHeartbeatData {
            healthy: false,
            auth_ok: true,
            state: None,
            term: 0,
            last_applied: None,
            last_heartbeat_ms: 0,
            consecutive_failures: 0,
        }
    }
}

/// Liveness table for every peer, updated by the heartbeat loop and read
/// by `replSetGetStatus` (spec.md §4.5/§6) and by sync-source selection.
#[derive(Default)]
pub struct HeartbeatTracker {
    data: RwLock<HashMap<String, MemberHeartbeatData>>,
}

impl HeartbeatTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_success(&self, host: &str, reply: &HeartbeatReply, now_ms: i64) {
        let mut data = self.data.write().await;
        let entry = data.entry(host.to_string()).or_default();
        entry.healthy = true;
        entry.auth_ok = true;
        entry.state = Some(reply.state.clone());
        entry.term = reply.term;
        entry.last_applied = Some(reply.last_applied);
        entry.last_heartbeat_ms = now_ms;
        entry.consecutive_failures = 0;
    }

    /// Auth failures never clear `healthy`: the peer is reachable, just
    /// unauthenticated for this node's credentials (SPEC_FULL.md §B.4).
    pub async fn record_auth_failure(&self, host: &str, now_ms: i64) {
        let mut data = self.data.write().await;
        let entry = data.entry(host.to_string()).or_default();
        entry.healthy = true;
        entry.auth_ok = false;
        entry.last_heartbeat_ms = now_ms;
    }

    pub async fn record_failure(&self, host: &str) {
        let mut data = self.data.write().await;
        let entry = data.entry(host.to_string()).or_default();
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= 2 {
            entry.healthy = false;
        }
    }

    pub async fn is_healthy(&self, host: &str) -> bool {
        self.data
            .read()
            .await
            .get(host)
            .map(|d| d.healthy)
            .unwrap_or(false)
    }

    pub async fn snapshot(&self) -> HashMap<String, MemberHeartbeatData> {
        self.data.read().await.clone()
    }
}

/// One heartbeat attempt (spec.md §6 "heartbeat protocol"), recording the
/// outcome into `tracker` and returning the observed term, if any, so the
/// caller can feed it to the election manager's demotion check.
pub async fn send_heartbeat(
    transport: &dyn NodeTransport,
    tracker: &HeartbeatTracker,
    self_host: &str,
    target: &str,
    term: u64,
    config_version: u64,
    now_ms: i64,
) -> Option<u64> {
    let req = crate::net::HeartbeatRequest {
        from: self_host.to_string(),
        term,
        config_version,
    };
    match transport.heartbeat(target, req).await {
        Ok(reply) => {
            let observed = reply.term;
            if reply.auth_ok {
                tracker.record_success(target, &reply, now_ms).await;
            } else {
                tracker.record_auth_failure(target, now_ms).await;
            }
            Some(observed)
        }
        Err(_) => {
            tracker.record_failure(target).await;
            None
        }
    }
}
