//! Node configuration: the on-disk/CLI-supplied settings a node starts
//! with, as distinct from the replica-set config it negotiates with peers
//! at runtime (`replset::ReplSetConfig`).

use crate::replset::ReplSetConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub host: String,
    pub repl_set: ReplSetConfig,
    #[serde(default = "default_oplog_retention_ms")]
    pub oplog_retention_ms: i64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: u64,
}

fn default_oplog_retention_ms() -> i64 {
    24 * 60 * 60 * 1000
}

fn default_heartbeat_interval_ms() -> u64 {
    2_000
}

fn default_election_timeout_ms() -> u64 {
    10_000
}

impl NodeConfig {
    pub fn from_json_str(text: &str) -> crate::core::Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| crate::core::ReplError::InvalidConfig(e.to_string()))
    }
}
