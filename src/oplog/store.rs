use super::{OplogBody, OplogEntry, OplogRefs, SubOp, OPLOG_REF_THRESHOLD};
use crate::core::{ReplError, Result};
use crate::gtid::Gtid;
use std::collections::BTreeMap;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, instrument};

/// One time-bounded slice of the oplog, created by `add_partition` and
/// dropped wholesale by `trim_by_timestamp` once all of its entries have
/// aged out. Grounded on the teacher's `journal_and_snapshot.rs` practice of
/// rotating to a fresh segment file rather than trimming a single growing
/// one (SPEC_FULL.md §B.5: capped-collection-style retention layered on
/// top of spec.md's time partitioning).
struct Partition {
    opened_at_ms: i64,
    entries: BTreeMap<Gtid, OplogEntry>,
}

/// The replicated, hash-chained, optionally time-partitioned operation log
/// (spec.md §4.2). Entries are kept in memory here; a production build
/// would persist each partition as its own collection the way the teacher
/// persists each journal segment as its own file.
pub struct OplogStore {
    partitions: RwLock<Vec<Partition>>,
    refs: OplogRefs,
    /// Broadcasts every newly-appended entry so the producer's remote tail
    /// and any local `tail_from_gtid` followers observe it without polling
    /// — the same role `recovery_and_backpressure.rs`'s notify channel
    /// plays for the teacher's replication stream.
    tail: broadcast::Sender<OplogEntry>,
    partitioned: std::sync::atomic::AtomicBool,
    retention_ms: i64,
}

impl OplogStore {
    pub fn new(retention_ms: i64) -> Self {
        let (tail, _) = broadcast::channel(1024);
        OplogStore {
            partitions: RwLock::new(vec![Partition {
                opened_at_ms: 0,
                entries: BTreeMap::new(),
            }]),
            refs: OplogRefs::new(),
            tail,
            partitioned: std::sync::atomic::AtomicBool::new(false),
            retention_ms,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OplogEntry> {
        self.tail.subscribe()
    }

    /// Appends an entry, spilling to `oplog.refs` first if it exceeds
    /// [`OPLOG_REF_THRESHOLD`]. The caller is expected to have already
    /// reserved the GTID and to call this inside the same storage
    /// transaction that mutates user collections (spec.md §3 invariant).
    #[instrument(skip(self, ops), fields(gtid = %gtid))]
    pub async fn append(&self, gtid: Gtid, ts: i64, applied: bool, ops: Vec<SubOp>) -> Result<OplogEntry> {
        let prev_hash = self.get_last_entry().await.map(|e| e.h).unwrap_or(0);
        let entry = if OplogEntry::needs_ref(&ops) {
            let h = OplogEntry::compute_hash(prev_hash, gtid, ts, &ops);
            let ref_id = self.refs.store(ops).await;
            OplogEntry {
                gtid,
                ts,
                h,
                a: applied,
                body: OplogBody::Ref(ref_id),
            }
        } else {
            OplogEntry::new_inline(prev_hash, gtid, ts, applied, ops)
        };
        let mut partitions = self.partitions.write().await;
        let current = partitions
            .last_mut()
            .expect("at least one partition always exists");
        current.entries.insert(gtid, entry.clone());
        let _ = self.tail.send(entry.clone());
        info!(gtid = %gtid, "appended oplog entry");
        Ok(entry)
    }

    /// Flips `a` to `true` once the applier has durably applied every
    /// sub-operation in this entry (spec.md §4.4).
    pub async fn mark_applied(&self, gtid: Gtid) -> Result<()> {
        let mut partitions = self.partitions.write().await;
        for partition in partitions.iter_mut() {
            if let Some(entry) = partition.entries.get_mut(&gtid) {
                entry.a = true;
                return Ok(());
            }
        }
        Err(ReplError::NotFound(format!("oplog entry {gtid} missing")))
    }

    pub async fn get_last_entry(&self) -> Option<OplogEntry> {
        let partitions = self.partitions.read().await;
        partitions
            .iter()
            .rev()
            .find_map(|p| p.entries.values().next_back().cloned())
    }

    pub async fn find_by_gtid(&self, gtid: Gtid) -> Option<OplogEntry> {
        let partitions = self.partitions.read().await;
        partitions.iter().find_map(|p| p.entries.get(&gtid).cloned())
    }

    /// Resolves an entry's ops, following the ref pointer if it spilled.
    pub async fn resolve_ops(&self, entry: &OplogEntry) -> Result<Vec<SubOp>> {
        match &entry.body {
            OplogBody::Inline(ops) => Ok(ops.clone()),
            OplogBody::Ref(id) => self
                .refs
                .load(id)
                .await
                .ok_or_else(|| ReplError::NotFound(format!("oplog ref {id} missing"))),
        }
    }

    /// All entries strictly after `gtid`, in order — the one-shot form of
    /// the producer's restartable forward cursor (spec.md §4.3).
    pub async fn tail_from_gtid(&self, gtid: Gtid) -> Vec<OplogEntry> {
        let partitions = self.partitions.read().await;
        partitions
            .iter()
            .flat_map(|p| p.entries.range((std::ops::Bound::Excluded(gtid), std::ops::Bound::Unbounded)))
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Walks backward from `gtid` (inclusive), oldest-last, for rollback's
    /// divergence search (spec.md §4.8.3).
    pub async fn reverse_cursor_from_gtid(&self, gtid: Gtid) -> Vec<OplogEntry> {
        let partitions = self.partitions.read().await;
        let mut out: Vec<OplogEntry> = partitions
            .iter()
            .flat_map(|p| p.entries.range(..=gtid))
            .map(|(_, e)| e.clone())
            .collect();
        out.reverse();
        out
    }

    /// Opens a fresh partition, used by the repl-info partition thread on a
    /// schedule (spec.md §4.11) once the current one exceeds its time
    /// window.
    #[instrument(skip(self))]
    pub async fn add_partition(&self, opened_at_ms: i64) {
        self.partitions.write().await.push(Partition {
            opened_at_ms,
            entries: BTreeMap::new(),
        });
        info!(opened_at_ms, "opened new oplog partition");
    }

    /// Drops whole partitions older than `older_than_ms`, reclaiming their
    /// ref-table chunks. Never trims the last remaining partition, since
    /// the oplog must always have a tail entry to anchor `getLastEntry`.
    #[instrument(skip(self))]
    pub async fn trim_by_timestamp(&self, older_than_ms: i64) -> u64 {
        let mut partitions = self.partitions.write().await;
        let mut trimmed = 0u64;
        while partitions.len() > 1 {
            let oldest_newest_ts = partitions[0]
                .entries
                .values()
                .next_back()
                .map(|e| e.ts)
                .unwrap_or(partitions[0].opened_at_ms);
            if oldest_newest_ts >= older_than_ms {
                break;
            }
            let removed = partitions.remove(0);
            for entry in removed.entries.values() {
                if let OplogBody::Ref(id) = &entry.body {
                    self.refs.remove(id).await;
                }
                trimmed += 1;
            }
        }
        if trimmed > 0 {
            info!(trimmed, older_than_ms, "trimmed oplog partitions");
        }
        trimmed
    }

    /// One-way switch from a single capped-style partition to genuine time
    /// partitioning once the oplog has grown past the point a single
    /// collection can serve efficiently (SPEC_FULL.md §B.5). `last_gtid` is
    /// recorded so the caller can verify no entry was lost in the swap.
    pub async fn convert_to_partitioned_if_necessary(&self, last_gtid: Gtid) -> Result<()> {
        if self.partitioned.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return Ok(());
        }
        if self.find_by_gtid(last_gtid).await.is_none() && !last_gtid.is_initial() {
            return Err(ReplError::Fatal(
                "oplog partition conversion would lose the last known entry".to_string(),
            ));
        }
        info!(retention_ms = self.retention_ms, "oplog converted to time-partitioned mode");
        Ok(())
    }
}
