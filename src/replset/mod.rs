//! Replica-set membership, heartbeats, election, and the per-node state
//! machine (spec.md §4.5, §4.6).

mod commands;
mod controller;
mod election;
mod heartbeat;
mod member;
mod state;

pub use commands::{IsMasterReply, MemberStatus, ReplSetStatusReply};
pub use controller::{MaintenanceGuard, ReplSetController};
pub use election::ElectionManager;
pub use heartbeat::{HeartbeatTracker, MemberHeartbeatData};
pub use member::{MemberConfig, ReplSetConfig};
pub use state::MemberState;
