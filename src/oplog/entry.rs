use crate::core::{Document, Namespace, PrimaryKey};
use crate::gtid::Gtid;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One replicated operation kind, carried inside an `OplogEntry::ops` list
/// (spec.md §3 "Oplog entry").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum SubOp {
    Insert {
        ns: Namespace,
        row: Document,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_migrate: Option<bool>,
    },
    Update {
        ns: Namespace,
        pk: PrimaryKey,
        pre: Option<Document>,
        post: Document,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_migrate: Option<bool>,
    },
    Delete {
        ns: Namespace,
        pk: PrimaryKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pre: Option<Document>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_migrate: Option<bool>,
    },
    CappedInsert {
        ns: Namespace,
        pk: PrimaryKey,
        row: Document,
    },
    CappedDelete {
        ns: Namespace,
        pk: PrimaryKey,
    },
    Command {
        ns: Namespace,
        command: Document,
    },
    Comment {
        text: String,
    },
}

impl SubOp {
    pub fn ns(&self) -> Option<&Namespace> {
        match self {
            SubOp::Insert { ns, .. }
            | SubOp::Update { ns, .. }
            | SubOp::Delete { ns, .. }
            | SubOp::CappedInsert { ns, .. }
            | SubOp::CappedDelete { ns, .. }
            | SubOp::Command { ns, .. } => Some(ns),
            SubOp::Comment { .. } => None,
        }
    }

    pub fn from_migrate(&self) -> bool {
        match self {
            SubOp::Insert { from_migrate, .. } | SubOp::Update { from_migrate, .. } => {
                from_migrate.unwrap_or(false)
            }
            SubOp::Delete { from_migrate, .. } => from_migrate.unwrap_or(false),
            _ => false,
        }
    }

    /// Reverses the effect of this operation for rollback (spec.md §4.8.5):
    /// an update's pre/post are swapped, insert becomes delete and vice
    /// versa. Returns `None` for ops that cannot be reversed (a reversed
    /// delete needs the pre-image, which the caller supplies separately).
    pub fn reversed(&self) -> Option<SubOp> {
        match self {
            SubOp::Update {
                ns,
                pk,
                pre,
                post,
                from_migrate,
            } => Some(SubOp::Update {
                ns: ns.clone(),
                pk: pk.clone(),
                pre: Some(post.clone()),
                post: pre.clone().unwrap_or_default(),
                from_migrate: *from_migrate,
            }),
            SubOp::Insert { ns, row, .. } => {
                let pk = row.get("_id").cloned().unwrap_or(serde_json::Value::Null);
                Some(SubOp::Delete {
                    ns: ns.clone(),
                    pk,
                    pre: Some(row.clone()),
                    from_migrate: None,
                })
            }
            SubOp::Command { .. } => None,
            _ => None,
        }
    }
}

/// Document stored in `oplog.rs`: `{_id: gtid, ts, h, a, ops|ref}` (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OplogEntry {
    #[serde(rename = "_id")]
    pub gtid: Gtid,
    /// Milliseconds since epoch.
    pub ts: i64,
    /// 64-bit running hash, chained from the previous entry.
    pub h: u64,
    /// True once successfully applied. Primaries write `true` immediately;
    /// the producer writes `false`, the applier flips it.
    pub a: bool,
    pub body: OplogBody,
}

/// Either the sub-operations are inlined, or they overflow into
/// `oplog.refs` and this entry carries only the pointer (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum OplogBody {
    Inline(Vec<SubOp>),
    Ref(Uuid),
}

/// Above this many sub-operations, a transaction spills to `oplog.refs`
/// (spec.md §2.3, §4.9 "spilling to migratelogref.sh" uses the same idea).
pub const OPLOG_REF_THRESHOLD: usize = 1000;

impl OplogEntry {
    /// Computes the running hash for an entry following `prev_hash`, the
    /// way spec.md §3's invariant describes: `h(entry_i) = H(h(entry_{i-1})
    /// || body(entry_i))`.
    pub fn compute_hash(prev_hash: u64, gtid: Gtid, ts: i64, ops: &[SubOp]) -> u64 {
        // FNV-1a, chained: matches the teacher's `stable_shard_for` style
        // of a dependency-free stable hash (persist/cluster/routing/shard_hash.rs).
        let mut hash = prev_hash ^ 0xcbf29ce484222325;
        let mut mix = |bytes: &[u8]| {
            for byte in bytes {
                hash ^= *byte as u64;
                hash = hash.wrapping_mul(0x100000001b3);
            }
        };
        mix(&gtid.term.to_le_bytes());
        mix(&gtid.seq.to_le_bytes());
        mix(&ts.to_le_bytes());
        if let Ok(json) = serde_json::to_vec(ops) {
            mix(&json);
        }
        hash
    }

    pub fn new_inline(prev_hash: u64, gtid: Gtid, ts: i64, applied: bool, ops: Vec<SubOp>) -> Self {
        let h = Self::compute_hash(prev_hash, gtid, ts, &ops);
        OplogEntry {
            gtid,
            ts,
            h,
            a: applied,
            body: OplogBody::Inline(ops),
        }
    }

    pub fn needs_ref(ops: &[SubOp]) -> bool {
        ops.len() > OPLOG_REF_THRESHOLD
    }
}
