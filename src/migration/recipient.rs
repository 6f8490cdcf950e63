use super::registry::ConfigRegistry;
use crate::core::{Namespace, ReplError, Result};
use crate::net::NodeTransport;
use crate::storage::StorageEngine;
use crate::oplog::SubOp;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Bounds how many catch-up rounds the recipient will run before
/// concluding the donor's write rate exceeds what it can drain — the
/// "abort on memory pressure" scenario spec.md §8 calls out, modeled here
/// as a round budget rather than an actual memory check since the
/// side-log already bounds itself per migration.
const MAX_TRANSFER_ROUNDS: u32 = 50;

/// The recipient side of chunk migration (spec.md §4.10): pulls the
/// initial clone, then repeatedly pulls and applies side-log catch-up
/// batches until the donor reports nothing left, then asks the donor to
/// commit ownership.
pub struct MigrationRecipient<S: StorageEngine> {
    storage: Arc<S>,
    transport: Arc<dyn NodeTransport>,
    registry: Arc<dyn ConfigRegistry>,
}

impl<S: StorageEngine + 'static> MigrationRecipient<S> {
    pub fn new(storage: Arc<S>, transport: Arc<dyn NodeTransport>, registry: Arc<dyn ConfigRegistry>) -> Self {
        MigrationRecipient {
            storage,
            transport,
            registry,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(
        &self,
        donor: &str,
        _self_host: &str,
        ns: Namespace,
        key_field: &str,
        min: Value,
        max: Value,
        wait_for_delete: Option<bool>,
    ) -> Result<u64> {
        let expected_version = self.registry.current_version(&ns).await?;

        let initial = self
            .transport
            .migrate_clone(donor, &ns, key_field, min.clone(), max.clone())
            .await?;
        info!(ns = %ns, count = initial.len(), "migration recipient: initial clone complete");
        for row in initial {
            self.storage
                .apply_write(&SubOp::Insert { ns: ns.clone(), row, from_migrate: Some(true) })
                .await?;
        }

        let mut rounds = 0u32;
        loop {
            let mods = self.transport.transfer_mods(donor, &ns).await?;
            if mods.is_empty() {
                break;
            }
            for mut op in mods {
                mark_from_migrate(&mut op);
                self.storage.apply_write(&op).await?;
            }
            rounds += 1;
            if rounds >= MAX_TRANSFER_ROUNDS {
                warn!(ns = %ns, rounds, "migration recipient aborting: catch-up did not converge");
                return Err(ReplError::Transient(
                    "chunk migration catch-up exceeded maximum rounds".to_string(),
                ));
            }
        }

        let new_version = self
            .transport
            .commit_chunk_migration(donor, &ns, expected_version, min, max, wait_for_delete)
            .await?;
        info!(ns = %ns, new_version, "migration recipient: ownership committed");
        Ok(new_version)
    }
}

fn mark_from_migrate(op: &mut SubOp) {
    match op {
        SubOp::Insert { from_migrate, .. } | SubOp::Update { from_migrate, .. } | SubOp::Delete { from_migrate, .. } => {
            *from_migrate = Some(true);
        }
        _ => {}
    }
}
