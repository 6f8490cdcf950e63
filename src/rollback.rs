//! Divergence detection and recovery (spec.md §4.8). A node that diverges
//! from its sync source walks its own oplog backward to find the last
//! entry both chains agree on, undoes everything after it, replaces every
//! document it can't reconstruct locally with the sync source's current
//! version, then replays forward from the divergence point so it lands on
//! the source's current position rather than stopping at the stale one.

use crate::core::{Namespace, PrimaryKey, ReplError, Result};
use crate::gtid::{Gtid, GtidManager};
use crate::net::NodeTransport;
use crate::oplog::{OplogBody, OplogEntry, OplogStore, SubOp};
use crate::replset::{MemberState, ReplSetController};
use crate::storage::StorageEngine;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

/// Persistent rollback status (spec.md §4.8.1). Once `Starting` is
/// entered the node has committed to completing a rollback: a crash
/// before reaching `SnapshotApplied` leaves no safe way to resume, so
/// restart recovery treats `Starting` as `Fatal` (SPEC_FULL.md §D,
/// recorded in DESIGN.md as an Open Question decision — no auto-resync).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackPhase {
    NotStarted,
    Starting,
    DocsRemoved,
    SnapshotApplied,
}

/// Caps how many distinct documents rollback will track for re-fetch
/// before giving up (SPEC_FULL.md §B.6): an unbounded docs-map risks
/// exhausting memory on a long divergence, and a rollback that large is
/// almost certainly better resolved by a fresh initial sync.
const DEFAULT_DOCS_MAP_CAP: usize = 50_000;

/// A local oplog history older than this relative to `now_ms` cannot be
/// trusted as a safe rollback anchor — the divergence search is aborted
/// rather than walking arbitrarily far back (spec.md §4.8.3's "too stale
/// to roll back" guard).
const MAX_ROLLBACK_AGE_MS: i64 = 30 * 60 * 1000;

/// Bounds the forward catch-up replay after the snapshot is applied, the
/// same way initial sync bounds its own gap-fill loop.
const MAX_FORWARD_CATCHUP_ROUNDS: u32 = 25;

pub struct RollbackEngine<S: StorageEngine> {
    storage: Arc<S>,
    oplog: Arc<OplogStore>,
    gtid: Arc<GtidManager>,
    transport: Arc<dyn NodeTransport>,
    controller: Arc<ReplSetController>,
    phase: RwLock<RollbackPhase>,
    docs_map_cap: usize,
    rollback_id: AtomicU64,
}

impl<S: StorageEngine + 'static> RollbackEngine<S> {
    pub fn new(
        storage: Arc<S>,
        oplog: Arc<OplogStore>,
        gtid: Arc<GtidManager>,
        transport: Arc<dyn NodeTransport>,
        controller: Arc<ReplSetController>,
    ) -> Self {
        RollbackEngine {
            storage,
            oplog,
            gtid,
            transport,
            controller,
            phase: RwLock::new(RollbackPhase::NotStarted),
            docs_map_cap: DEFAULT_DOCS_MAP_CAP,
            rollback_id: AtomicU64::new(0),
        }
    }

    pub async fn phase(&self) -> RollbackPhase {
        *self.phase.read().await
    }

    /// Runs the rollback to completion against `source`, returning the
    /// GTID the node lands on after the post-snapshot forward catch-up —
    /// not the raw divergence point, which is typically stale by the time
    /// the snapshot has finished applying. Every step past `Starting` is
    /// recorded so a caller inspecting `phase()` after a crash can tell how
    /// far it got.
    #[instrument(skip(self))]
    pub async fn run(&self, source: &str, now_ms: i64) -> Result<Gtid> {
        let id = self.rollback_id.fetch_add(1, Ordering::SeqCst) + 1;
        *self.phase.write().await = RollbackPhase::Starting;
        warn!(source, rollback_id = id, "rollback starting");
        self.controller.transition_to(MemberState::Rollback).await?;

        let divergence = self.find_divergence_point(source, now_ms).await?;
        info!(divergence = %divergence, rollback_id = id, "rollback found divergence point");

        let remote_min_unapplied = self.transport.min_unapplied(source).await.map_err(|e| {
            ReplError::RollbackImpossible(format!("could not confirm source's minUnapplied: {e}"))
        })?;
        if divergence < remote_min_unapplied {
            return Err(ReplError::RollbackImpossible(format!(
                "divergence point {divergence} predates source's minUnapplied {remote_min_unapplied}; source can no longer replay from there"
            )));
        }

        let docs_map = self.undo_local_writes(divergence).await?;
        *self.phase.write().await = RollbackPhase::DocsRemoved;

        self.replace_with_remote_versions(source, &docs_map).await?;
        *self.phase.write().await = RollbackPhase::SnapshotApplied;

        let landed = self.catch_up_forward(source, divergence).await?;
        let final_entry = if landed.is_initial() {
            OplogEntry {
                gtid: Gtid::INITIAL,
                ts: 0,
                h: 0,
                a: true,
                body: OplogBody::Inline(Vec::new()),
            }
        } else {
            self.oplog
                .find_by_gtid(landed)
                .await
                .ok_or_else(|| ReplError::Fatal("post-catch-up entry vanished during rollback".to_string()))?
        };
        self.gtid
            .reset_after_initial_sync(final_entry.gtid, final_entry.ts, final_entry.h)
            .await;

        self.controller.transition_to(MemberState::Recovering).await?;
        self.controller.transition_to(MemberState::Secondary).await?;
        *self.phase.write().await = RollbackPhase::NotStarted;
        info!(landed_on = %final_entry.gtid, rollback_id = id, "rollback complete");
        Ok(final_entry.gtid)
    }

    /// Walks this node's oplog backward, asking the source to confirm
    /// each entry's (ts, hash), until one matches — the first point the
    /// two chains agree on (spec.md §4.8.3). Aborts if the search would
    /// have to walk past `MAX_ROLLBACK_AGE_MS` of local history.
    async fn find_divergence_point(&self, source: &str, now_ms: i64) -> Result<Gtid> {
        let Some(local_last) = self.oplog.get_last_entry().await else {
            return Ok(Gtid::INITIAL);
        };
        let history = self.oplog.reverse_cursor_from_gtid(local_last.gtid).await;
        for entry in &history {
            if now_ms - entry.ts > MAX_ROLLBACK_AGE_MS {
                return Err(ReplError::RollbackImpossible(format!(
                    "divergence search exceeded max rollback age of {MAX_ROLLBACK_AGE_MS}ms"
                )));
            }
            match self.transport.oplog_entry_at(source, entry.gtid).await {
                Ok(Some(remote)) if remote.ts == entry.ts && remote.h == entry.h => {
                    return Ok(entry.gtid);
                }
                Ok(_) => continue,
                Err(err) => {
                    return Err(ReplError::RollbackImpossible(format!(
                        "could not reach sync source during divergence search: {err}"
                    )))
                }
            }
        }
        // No local entry matched; the only safe common point is nothing at
        // all, which is only acceptable if the remote's own history starts
        // at our first entry too. Treated as the degenerate full-rollback
        // case rather than `RollbackImpossible` so a fresh node (with a
        // short local history) can still roll back to empty.
        Ok(Gtid::INITIAL)
    }

    /// Reverses every local sub-operation strictly after `divergence` that
    /// can be reconstructed exactly from what it already carries (an
    /// insert, or an update/delete with a recorded `pre`-image). Anything
    /// else — an update or delete with no `pre`-image — cannot be undone
    /// locally and is instead added to the returned set so its
    /// authoritative state can be re-fetched from the source next.
    async fn undo_local_writes(&self, divergence: Gtid) -> Result<HashSet<(Namespace, String)>> {
        let to_undo = self.oplog.tail_from_gtid(divergence).await;
        let mut docs_map = HashSet::new();
        for entry in to_undo.iter().rev() {
            let ops = self.oplog.resolve_ops(entry).await.unwrap_or_default();
            for op in &ops {
                if reconstructable_locally(op) {
                    if let Some(reversed) = op.reversed() {
                        self.storage.apply_write(&reversed).await?;
                    } else if let SubOp::Delete { ns, pre: Some(pre), .. } = op {
                        self.storage
                            .apply_write(&SubOp::Insert {
                                ns: ns.clone(),
                                row: pre.clone(),
                                from_migrate: None,
                            })
                            .await?;
                    }
                    continue;
                }
                if let Some(ns) = op.ns() {
                    if let Some(pk) = sub_op_pk(op) {
                        docs_map.insert((ns.clone(), pk.to_string()));
                        if docs_map.len() > self.docs_map_cap {
                            return Err(ReplError::RollbackImpossible(format!(
                                "rollback docs map exceeded cap of {}",
                                self.docs_map_cap
                            )));
                        }
                    }
                }
            }
        }
        Ok(docs_map)
    }

    /// Re-fetches every touched document from the source and overwrites
    /// the local copy with it, discarding it locally if the source no
    /// longer has it (spec.md §4.8.8). A no-op, reaching out to the source
    /// zero times, when every touched document was locally reconstructable.
    async fn replace_with_remote_versions(
        &self,
        source: &str,
        docs_map: &HashSet<(Namespace, String)>,
    ) -> Result<()> {
        for (ns, pk_repr) in docs_map {
            let pk: PrimaryKey = serde_json::from_str(pk_repr).unwrap_or(serde_json::Value::Null);
            match self.transport.fetch_document(source, ns, &pk).await? {
                Some(doc) => {
                    self.storage
                        .apply_write(&SubOp::Update {
                            ns: ns.clone(),
                            pk: pk.clone(),
                            pre: None,
                            post: doc,
                            from_migrate: None,
                        })
                        .await?;
                }
                None => {
                    self.storage
                        .apply_write(&SubOp::Delete {
                            ns: ns.clone(),
                            pk: pk.clone(),
                            pre: None,
                            from_migrate: None,
                        })
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Replays everything the source has committed since `from`, landing
    /// the node on the source's current position rather than the stale
    /// divergence point (spec.md §4.8.12).
    async fn catch_up_forward(&self, source: &str, from: Gtid) -> Result<Gtid> {
        let mut cursor = from;
        let mut rounds = 0u32;
        loop {
            let missing = self
                .transport
                .oplog_after(source, cursor, 10_000)
                .await
                .map_err(|e| ReplError::RollbackImpossible(format!("lost source during forward catch-up: {e}")))?;
            if missing.is_empty() {
                return Ok(cursor);
            }
            for entry in &missing {
                let ops = match &entry.body {
                    OplogBody::Inline(ops) => ops.clone(),
                    OplogBody::Ref(_) => Vec::new(),
                };
                for op in &ops {
                    self.storage.apply_write(op).await?;
                }
                self.oplog.append(entry.gtid, entry.ts, true, ops).await?;
                cursor = entry.gtid;
            }
            rounds += 1;
            if rounds >= MAX_FORWARD_CATCHUP_ROUNDS {
                warn!(source, rounds, "rollback forward catch-up did not converge");
                return Err(ReplError::RollbackImpossible(
                    "forward catch-up after rollback exceeded maximum rounds".to_string(),
                ));
            }
        }
    }
}

/// An insert always undoes exactly via delete. An update or delete undoes
/// exactly only when it carries a `pre`-image to restore — without one,
/// `SubOp::reversed()` fabricates an empty result rather than the true
/// prior state, so that case must be treated as unreconstructable instead.
fn reconstructable_locally(op: &SubOp) -> bool {
    matches!(
        op,
        SubOp::Insert { .. } | SubOp::Update { pre: Some(_), .. } | SubOp::Delete { pre: Some(_), .. }
    )
}

fn sub_op_pk(op: &SubOp) -> Option<PrimaryKey> {
    match op {
        SubOp::Insert { row, .. } => row.get("_id").cloned(),
        SubOp::Update { pk, .. } | SubOp::Delete { pk, .. } => Some(pk.clone()),
        _ => None,
    }
}
