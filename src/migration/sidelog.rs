use crate::oplog::SubOp;
use serde_json::Value;
use tokio::sync::RwLock;

/// Captures every write that lands in the migrating key range while a
/// chunk migration is in flight, so the recipient's `_transferMods`
/// catch-up loop can replay them after the initial clone (spec.md §4.9.2,
/// §3's "migrate side-log entry"; named after `migratelog.sh` /
/// `migratelogref.sh`). A single in-memory `Vec` drained on read is
/// sufficient here since overflow to a ref table is only needed for the
/// oplog itself, not this short-lived buffer.
#[derive(Default)]
pub struct MigrateSideLog {
    key_field: String,
    min: Value,
    max: Value,
    captured: RwLock<Vec<SubOp>>,
}

impl MigrateSideLog {
    pub fn new(key_field: impl Into<String>, min: Value, max: Value) -> Self {
        MigrateSideLog {
            key_field: key_field.into(),
            min,
            max,
            captured: RwLock::new(Vec::new()),
        }
    }

    fn in_range(&self, op: &SubOp) -> bool {
        let row = match op {
            SubOp::Insert { row, .. } => Some(row),
            SubOp::Update { post, .. } => Some(post),
            _ => None,
        };
        match row.and_then(|r| r.get(&self.key_field)) {
            Some(v) => compare(v, &self.min) != std::cmp::Ordering::Less && compare(v, &self.max) == std::cmp::Ordering::Less,
            None => matches!(op, SubOp::Delete { .. }),
        }
    }

    /// Called by the donor for every write to the migrating namespace
    /// while the migration is in progress; records it only if it falls
    /// inside the migrating range.
    pub async fn observe(&self, op: &SubOp) {
        if self.in_range(op) {
            self.captured.write().await.push(op.clone());
        }
    }

    /// Drains everything captured so far, for the recipient's next
    /// `_transferMods` round. An empty result signals the recipient it has
    /// fully caught up and the donor may enter the critical section.
    pub async fn drain(&self) -> Vec<SubOp> {
        std::mem::take(&mut *self.captured.write().await)
    }
}

pub(crate) fn compare(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Namespace;

    #[tokio::test]
    async fn only_in_range_writes_are_captured() {
        let sidelog = MigrateSideLog::new("shard_key", Value::from(0), Value::from(10));
        let ns: Namespace = "db.c".into();
        let in_range = SubOp::Insert {
            ns: ns.clone(),
            row: serde_json::json!({"_id": 1, "shard_key": 5}).as_object().unwrap().clone(),
            from_migrate: None,
        };
        let out_of_range = SubOp::Insert {
            ns: ns.clone(),
            row: serde_json::json!({"_id": 2, "shard_key": 50}).as_object().unwrap().clone(),
            from_migrate: None,
        };
        sidelog.observe(&in_range).await;
        sidelog.observe(&out_of_range).await;
        let drained = sidelog.drain().await;
        assert_eq!(drained.len(), 1);
        assert!(sidelog.drain().await.is_empty());
    }
}
