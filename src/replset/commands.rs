use crate::gtid::Gtid;
use serde::{Deserialize, Serialize};

/// Reply to `isMaster` (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsMasterReply {
    pub is_master: bool,
    pub is_secondary: bool,
    pub set_name: String,
    pub primary: Option<String>,
    pub me: String,
}

/// One member's row in `replSetGetStatus` (spec.md §6). `self_member` is
/// set only on the row describing the responding node itself — the
/// optime reported there is always current, whereas peers' optimes are as
/// of the last heartbeat (SPEC_FULL.md §B.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberStatus {
    pub host: String,
    pub state: String,
    pub health: f64,
    pub last_applied: Option<Gtid>,
    pub self_member: bool,
    pub uptime_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplSetStatusReply {
    pub set_name: String,
    pub term: u64,
    pub members: Vec<MemberStatus>,
}
