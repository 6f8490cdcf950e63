use super::Gtid;
use crate::core::{ReplError, Result};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use tokio::sync::RwLock;

/// The `(live, unapplied, applied)` triple spec.md §4.1/§GLOSSARY calls the
/// "frontier", plus the running-hash chain tip needed to detect divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GtidFrontier {
    pub min_live: Gtid,
    pub live: Gtid,
    pub min_unapplied: Gtid,
    pub applied: Gtid,
}

/// Mints GTIDs for primary writes and is the sole authority for "did this
/// node diverge?" (spec.md §4.1). Every read is an async `RwLock` read the
/// way `TransactionManager`'s COW id sets are in the teacher's
/// `transaction::manager`; writers take the lock only for the duration of
/// the bookkeeping update.
pub struct GtidManager {
    is_primary: AtomicBool,
    term: AtomicU64,
    next_seq: AtomicU64,
    live: RwLock<Gtid>,
    applied: RwLock<Gtid>,
    /// GTIDs assigned/added but not yet confirmed durable by the caller
    /// (via `confirm_durable`). The minimum of this set is `min_live`.
    in_flight: RwLock<BTreeSet<Gtid>>,
    /// GTIDs added but not yet applied. The minimum is `min_unapplied`.
    unapplied: RwLock<BTreeSet<Gtid>>,
    /// GTIDs with an outstanding `noteApplyingGTID` bracket — the applier
    /// must retry until `noteGTIDApplied` is called for each.
    applying: RwLock<BTreeSet<Gtid>>,
    in_flight_txns: AtomicU64,
    last_ts: AtomicI64,
    last_hash: AtomicU64,
}

impl Default for GtidManager {
    fn default() -> Self {
        Self::new()
    }
}

impl GtidManager {
    pub fn new() -> Self {
        Self {
            is_primary: AtomicBool::new(false),
            term: AtomicU64::new(0),
            next_seq: AtomicU64::new(1),
            live: RwLock::new(Gtid::INITIAL),
            applied: RwLock::new(Gtid::INITIAL),
            in_flight: RwLock::new(BTreeSet::new()),
            unapplied: RwLock::new(BTreeSet::new()),
            applying: RwLock::new(BTreeSet::new()),
            in_flight_txns: AtomicU64::new(0),
            last_ts: AtomicI64::new(0),
            last_hash: AtomicU64::new(0),
        }
    }

    /// Called when this node wins an election: GTIDs minted from now on
    /// carry the new term.
    pub fn become_primary(&self, term: u64) {
        self.term.store(term, Ordering::SeqCst);
        self.next_seq.store(1, Ordering::SeqCst);
        self.is_primary.store(true, Ordering::SeqCst);
    }

    pub fn step_down(&self) {
        self.is_primary.store(false, Ordering::SeqCst);
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary.load(Ordering::SeqCst)
    }

    /// Mints the next GTID for a primary write. The caller is responsible
    /// for writing it into the oplog inside the same transaction that
    /// mutates user data (spec.md invariant in §3), then calling
    /// `confirm_durable` once that transaction commits.
    pub async fn assign_gtid(&self) -> Result<Gtid> {
        if !self.is_primary() {
            return Err(ReplError::NotPrimary);
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let gtid = Gtid::new(self.term.load(Ordering::SeqCst), seq);
        self.mark_live(gtid).await;
        self.in_flight.write().await.insert(gtid);
        Ok(gtid)
    }

    /// Called by the producer on a secondary once it has durably appended
    /// a remote entry to the local oplog with `applied=false`.
    pub async fn note_gtid_added(&self, gtid: Gtid, ts: i64, hash: u64) {
        self.mark_live(gtid).await;
        self.last_ts.store(ts, Ordering::SeqCst);
        self.last_hash.store(hash, Ordering::SeqCst);
        self.unapplied.write().await.insert(gtid);
    }

    /// A write transaction for `gtid` has committed durably; it is no
    /// longer part of the "in flight" set that bounds `min_live`.
    pub async fn confirm_durable(&self, gtid: Gtid) {
        self.in_flight.write().await.remove(&gtid);
    }

    async fn mark_live(&self, gtid: Gtid) {
        let mut live = self.live.write().await;
        if gtid > *live {
            *live = gtid;
        }
    }

    /// Opens the `noteApplyingGTID`/`noteGTIDApplied` bracket. Per spec.md
    /// §4.1, once this is called the applier MUST eventually call
    /// `note_gtid_applied` for the same GTID, retrying indefinitely;
    /// abandoning it leaks the frontier.
    pub async fn note_applying_gtid(&self, gtid: Gtid) {
        self.applying.write().await.insert(gtid);
    }

    pub async fn note_gtid_applied(&self, gtid: Gtid) {
        self.applying.write().await.remove(&gtid);
        self.unapplied.write().await.remove(&gtid);
        let mut applied = self.applied.write().await;
        if gtid > *applied {
            *applied = gtid;
        }
    }

    /// Returns `(min_live, min_unapplied)` for persistence by the repl-info
    /// writer (spec.md §4.11).
    pub async fn get_mins(&self) -> (Gtid, Gtid) {
        let live = *self.live.read().await;
        let min_live = self
            .in_flight
            .read()
            .await
            .iter()
            .next()
            .copied()
            .unwrap_or(live);
        let min_unapplied = self
            .unapplied
            .read()
            .await
            .iter()
            .next()
            .copied()
            .unwrap_or(live);
        (min_live, min_unapplied)
    }

    pub async fn get_live_state(&self) -> GtidFrontier {
        let (min_live, min_unapplied) = self.get_mins().await;
        GtidFrontier {
            min_live,
            live: *self.live.read().await,
            min_unapplied,
            applied: *self.applied.read().await,
        }
    }

    pub fn live_hash(&self) -> u64 {
        self.last_hash.load(Ordering::SeqCst)
    }

    pub fn live_ts(&self) -> i64 {
        self.last_ts.load(Ordering::SeqCst)
    }

    /// True iff the remote's claim about what it has stored at our live
    /// GTID does not match our own record, or it has nothing there at
    /// all — i.e. the remote's oplog does not extend our chain (spec.md
    /// §4.3.a, §4.8.2).
    pub async fn rollback_needed(&self, remote_entry_at_our_live: Option<(i64, u64)>) -> bool {
        if self.live.read().await.is_initial() {
            // Nothing committed locally yet; nothing to diverge from.
            return false;
        }
        match remote_entry_at_our_live {
            None => true,
            Some((ts, hash)) => {
                ts != self.last_ts.load(Ordering::SeqCst)
                    || hash != self.last_hash.load(Ordering::SeqCst)
            }
        }
    }

    /// Hard reset of the frontier, used by initial sync (§4.7) and the
    /// post-rollback reset (§4.8.12).
    pub async fn reset_after_initial_sync(&self, gtid: Gtid, ts: i64, hash: u64) {
        *self.live.write().await = gtid;
        *self.applied.write().await = gtid;
        self.in_flight.write().await.clear();
        self.unapplied.write().await.clear();
        self.applying.write().await.clear();
        self.last_ts.store(ts, Ordering::SeqCst);
        self.last_hash.store(hash, Ordering::SeqCst);
    }

    pub fn track_txn_begin(&self) {
        self.in_flight_txns.fetch_add(1, Ordering::SeqCst);
    }

    pub fn track_txn_end(&self) {
        self.in_flight_txns.fetch_sub(1, Ordering::SeqCst);
    }

    /// Asserts that no transaction is in-flight, required before a node
    /// may assert `PRIMARY` (spec.md §4.1).
    pub fn verify_ready_to_become_primary(&self) -> Result<()> {
        if self.in_flight_txns.load(Ordering::SeqCst) > 0 {
            return Err(ReplError::Transient(
                "cannot become primary while a transaction is in-flight".to_string(),
            ));
        }
        Ok(())
    }

    /// Advances `applied` to `live`; used only by a single-node set that
    /// starts as primary and therefore has nothing to replicate from.
    pub async fn catch_unapplied_to_live(&self) {
        let live = *self.live.read().await;
        *self.applied.write().await = live;
        self.unapplied.write().await.clear();
    }
}
