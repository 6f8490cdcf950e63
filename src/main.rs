use clap::{Parser, Subcommand};
use replicore::config::NodeConfig;
use replicore::core::ReplError;
use replicore::net::InMemoryNodeTransport;
use replicore::migration::InMemoryConfigRegistry;
use replicore::storage::InMemoryStorageEngine;
use replicore::ReplicaNode;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "replicore-node")]
#[command(about = "Replica-set replication and chunk-migration node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Starts a single node using an in-memory storage engine and an
    /// in-process transport, driving its own heartbeat and oplog
    /// partition loops until interrupted. Useful for exercising the
    /// replication core without a real cluster.
    Serve {
        /// Path to a JSON-encoded `NodeConfig`.
        #[arg(long)]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config } => run_serve(&config).await?,
    }
    Ok(())
}

async fn run_serve(config_path: &str) -> Result<(), Box<dyn Error>> {
    let text = tokio::fs::read_to_string(config_path).await?;
    let config = NodeConfig::from_json_str(&text)?;

    let storage = Arc::new(InMemoryStorageEngine::new());
    let transport = Arc::new(InMemoryNodeTransport::new());
    let registry = Arc::new(InMemoryConfigRegistry::new());

    let node = Arc::new(ReplicaNode::new(
        config.clone(),
        storage,
        transport.clone(),
        registry,
    ));
    transport.register(node.host.clone(), node.clone()).await;

    node.controller.complete_startup(transport.as_ref()).await?;
    info!(host = %config.host, set = %config.repl_set.set_name, "node started");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let partitioner = Arc::new(node.partition_thread());
    let partition_interval = tokio::time::Duration::from_millis(config.oplog_retention_ms.max(1_000) as u64 / 24);
    let partition_task = tokio::spawn(partitioner.run_forever(partition_interval, shutdown_rx.clone()));

    let heartbeat_node = node.clone();
    let heartbeat_transport = transport.clone();
    let heartbeat_interval = tokio::time::Duration::from_millis(config.heartbeat_interval_ms);
    let mut heartbeat_shutdown = shutdown_rx.clone();
    let heartbeat_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    heartbeat_node.controller.heartbeat_round(heartbeat_transport.as_ref(), now_ms).await;
                    if !heartbeat_node.controller.known_primary_exists().await {
                        match heartbeat_node.controller.try_become_primary(heartbeat_transport.as_ref(), now_ms).await {
                            Ok(true) => info!("won election, became primary"),
                            Ok(false) => {}
                            Err(err) => warn!(error = %err, "election attempt failed"),
                        }
                    }
                }
                _ = heartbeat_shutdown.changed() => {
                    if *heartbeat_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    // Pulls oplog entries from the rest of the set and drains them into
    // local storage, falling back to a full rollback whenever the sync
    // source's chain no longer agrees with ours.
    let sync_node = node.clone();
    let sync_transport = transport.clone();
    let self_host = config.host.clone();
    let member_hosts: Vec<String> = config.repl_set.members.iter().map(|m| m.host.clone()).collect();
    let sync_interval = tokio::time::Duration::from_millis(config.heartbeat_interval_ms);
    let mut sync_shutdown = shutdown_rx.clone();
    let sync_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sync_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if sync_node.controller.is_primary().await {
                        continue;
                    }
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    let source = sync_node
                        .background_sync
                        .choose_sync_source(&member_hosts, &self_host, now_ms)
                        .await;
                    let Some(source) = source else { continue };

                    match sync_node.background_sync.sync_once(&source).await {
                        Ok(_) => {
                            let unapplied = sync_node.oplog.tail_from_gtid(sync_node.gtid.get_live_state().await.applied).await;
                            if let Err(err) = sync_node.applier.drain_unapplied(unapplied).await {
                                if err.is_fatal() {
                                    error!(error = %err, "applier crashed the node");
                                    break;
                                }
                                warn!(error = %err, "applier failed to drain entries");
                            }
                        }
                        Err(ReplError::RollbackNeeded) => {
                            warn!(source, "running rollback against sync source");
                            if let Err(err) = sync_node.rollback.run(&source, now_ms).await {
                                error!(error = %err, source, "rollback failed");
                                sync_node.background_sync.blacklist_source(&source, now_ms, None).await;
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, source, "sync failed, blacklisting source");
                            sync_node.background_sync.blacklist_source(&source, now_ms, None).await;
                        }
                    }
                }
                _ = sync_shutdown.changed() => {
                    if *sync_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(partition_task, heartbeat_task, sync_task);
    Ok(())
}
