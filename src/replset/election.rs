use crate::gtid::Gtid;
use crate::net::{NodeTransport, VoteReply, VoteRequest};
use crate::replset::member::ReplSetConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

/// Tracks the current term and this node's vote for it, and drives a
/// candidacy (spec.md §4.6). Freshness is decided purely by GTID
/// comparison — the candidate must hold a GTID at least as advanced as the
/// voter's — mirroring the term/index freshness check of a Raft-family
/// consensus module, which is the shape spec.md's election description
/// takes.
pub struct ElectionManager {
    current_term: AtomicU64,
    voted_for: Mutex<Option<(u64, String)>>,
}

impl Default for ElectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ElectionManager {
    pub fn new() -> Self {
        ElectionManager {
            current_term: AtomicU64::new(0),
            voted_for: Mutex::new(None),
        }
    }

    pub fn current_term(&self) -> u64 {
        self.current_term.load(Ordering::SeqCst)
    }

    /// Unconditionally bumps the term if `observed` is higher — used both
    /// when handling a vote request and when a heartbeat reveals a higher
    /// term elsewhere (SPEC_FULL.md §D: this is a one-way demotion signal,
    /// independent of any election in flight).
    pub fn observe_term(&self, observed: u64) -> bool {
        let mut bumped = false;
        let mut current = self.current_term.load(Ordering::SeqCst);
        while observed > current {
            match self.current_term.compare_exchange(
                current,
                observed,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    bumped = true;
                    break;
                }
                Err(actual) => current = actual,
            }
        }
        bumped
    }

    #[instrument(skip(self, my_last_gtid))]
    pub async fn handle_vote_request(
        &self,
        req: VoteRequest,
        my_last_gtid: Gtid,
        electable: bool,
    ) -> VoteReply {
        self.observe_term(req.term);
        let current_term = self.current_term();
        if req.term < current_term {
            return VoteReply {
                term: current_term,
                vote_granted: false,
                reason: Some("stale term".to_string()),
            };
        }
        if !electable {
            return VoteReply {
                term: current_term,
                vote_granted: false,
                reason: Some("not a voting member".to_string()),
            };
        }
        if req.last_gtid < my_last_gtid {
            return VoteReply {
                term: current_term,
                vote_granted: false,
                reason: Some("candidate is behind".to_string()),
            };
        }
        let mut voted_for = self.voted_for.lock().await;
        if let Some((term, candidate)) = voted_for.as_ref() {
            if *term == req.term && *candidate != req.candidate {
                return VoteReply {
                    term: current_term,
                    vote_granted: false,
                    reason: Some("already voted this term".to_string()),
                };
            }
        }
        *voted_for = Some((req.term, req.candidate.clone()));
        VoteReply {
            term: current_term,
            vote_granted: true,
            reason: None,
        }
    }

    /// Requests votes from every voting peer and returns `true` if a
    /// majority granted one, in which case `current_term` has already
    /// advanced to the contested term.
    #[instrument(skip(self, transport, config))]
    pub async fn run_election(
        &self,
        self_id: &str,
        self_host: &str,
        my_last_gtid: Gtid,
        config: &ReplSetConfig,
        transport: &dyn NodeTransport,
    ) -> bool {
        let term = self.current_term.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut voted_for = self.voted_for.lock().await;
            *voted_for = Some((term, self_host.to_string()));
        }
        let mut votes = 1u32; // self-vote
        let req = VoteRequest {
            candidate: self_host.to_string(),
            term,
            last_gtid: my_last_gtid,
        };
        for member in &config.members {
            if member.host == self_host || !member.is_electable() || member.votes == 0 {
                continue;
            }
            match transport.request_vote(&member.host, req.clone()).await {
                Ok(reply) => {
                    self.observe_term(reply.term);
                    if reply.vote_granted {
                        votes += member.votes;
                    }
                }
                Err(err) => warn!(peer = %member.host, error = %err, "vote request failed"),
            }
        }
        let won = votes >= config.majority();
        info!(self_id, term, votes, won, "election completed");
        won
    }
}
