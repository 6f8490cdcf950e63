use serde::{Deserialize, Serialize};

/// One voting/non-voting member of a replica set (spec.md §4.5 "member
/// config"). `priority` breaks ties during election freshness comparison;
/// `votes` of 0 means non-voting (still eligible to become primary only if
/// `priority` is also 0, i.e. never).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberConfig {
    pub id: u32,
    pub host: String,
    #[serde(default = "default_priority")]
    pub priority: f64,
    #[serde(default = "default_votes")]
    pub votes: u32,
    #[serde(default)]
    pub arbiter_only: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub build_indexes: bool,
    #[serde(default)]
    pub slave_delay_secs: u64,
}

fn default_priority() -> f64 {
    1.0
}

fn default_votes() -> u32 {
    1
}

impl MemberConfig {
    pub fn is_electable(&self) -> bool {
        !self.arbiter_only && self.priority > 0.0
    }
}

/// The replica set's configuration document (spec.md §4.5 "replSetReconfig").
/// `version` must strictly increase on every reconfigure; nodes reject a
/// config whose version does not exceed the one they hold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplSetConfig {
    pub set_name: String,
    pub version: u64,
    pub members: Vec<MemberConfig>,
}

impl ReplSetConfig {
    pub fn voting_member_count(&self) -> u32 {
        self.members.iter().map(|m| m.votes).sum()
    }

    pub fn member(&self, id: u32) -> Option<&MemberConfig> {
        self.members.iter().find(|m| m.id == id)
    }

    pub fn majority(&self) -> u32 {
        self.voting_member_count() / 2 + 1
    }
}
