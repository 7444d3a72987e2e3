use std::sync::Arc;

use clap::Parser;
use guardia_core::actors::cluster::{Capability, ClusterHandle};
use guardia_core::actors::command_runner::LocalExecutor;
use guardia_core::actors::external_commands::ExternalCommandHandle;
use guardia_core::actors::messages::{ClusterMessage, NotificationCommand};
use guardia_core::actors::notification::NotificationEngine;
use guardia_core::actors::persistence::SnapshotterHandle;
use guardia_core::actors::scheduler::{EndpointLookup, EndpointStatus, NoEndpoints, SchedulerHandle};
use guardia_core::checkable::{CheckableEvent, EventBus};
use guardia_core::config::{StorageConfig, Topology, read_config_file};
use guardia_core::persistence::ObjectStore;
use guardia_core::persistence::memory::MemoryStore;
#[cfg(feature = "storage-sqlite")]
use guardia_core::persistence::sqlite::SqliteStore;
use guardia_core::registry::{ObjectId, Registry};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let tgt = filter::Targets::new().with_targets(vec![("guardia_core", level), ("guardia_cored", level)]);
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr).compact())
        .with(tgt)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init(args.verbose);
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;
    let topology = config.resolve().await?;
    info!(
        hosts = topology.runtime.registry.all_host_ids().await.len(),
        services = topology.runtime.registry.all_service_ids().await.len(),
        "configuration resolved"
    );

    run_core(topology).await
}

/// Endpoint connectivity as it stood at config load; a real cluster
/// deployment would keep this live off `ClusterActor`'s connection state
/// instead of a fixed snapshot.
struct StaticEndpointLookup {
    by_id: std::collections::HashMap<ObjectId, (String, bool)>,
}

impl EndpointLookup for StaticEndpointLookup {
    fn status(&self, endpoint: ObjectId) -> Option<EndpointStatus> {
        self.by_id.get(&endpoint).map(|(_, connected)| EndpointStatus { connected: *connected, syncing: false })
    }
    fn name_of(&self, endpoint: ObjectId) -> Option<String> {
        self.by_id.get(&endpoint).map(|(name, _)| name.clone())
    }
}

/// Splits a registered checkable's own name back into `(host, service)`
/// for wire messages, undoing the "host!service" convention `config.rs`
/// uses when registering services.
async fn checkable_name_parts(registry: &Registry, checkable: ObjectId) -> Option<(String, Option<String>)> {
    if let Some(slot) = registry.get_host(checkable).await {
        return Some((slot.lock().await.name.clone(), None));
    }
    let slot = registry.get_service(checkable).await?;
    let name = slot.lock().await.name.clone();
    let (host, service) = name.split_once('!')?;
    Some((host.to_string(), Some(service.to_string())))
}

async fn build_store(storage: &StorageConfig) -> Arc<dyn ObjectStore> {
    match storage {
        StorageConfig::None => {
            info!("using in-memory storage (no persistence)");
            Arc::new(MemoryStore::new())
        }
        #[cfg(feature = "storage-sqlite")]
        StorageConfig::Sqlite { path } => match SqliteStore::new(path).await {
            Ok(store) => {
                info!(path = %path.display(), "sqlite object store opened");
                Arc::new(store)
            }
            Err(e) => {
                error!(error = %e, "failed to open sqlite object store, falling back to in-memory");
                Arc::new(MemoryStore::new())
            }
        },
        #[cfg(not(feature = "storage-sqlite"))]
        StorageConfig::Sqlite { .. } => {
            warn!("sqlite storage requested but the storage-sqlite feature is disabled, using in-memory");
            Arc::new(MemoryStore::new())
        }
    }
}

async fn run_core(topology: Topology) -> anyhow::Result<()> {
    let Topology {
        runtime,
        command_resolver,
        notification_directory,
        notifications_globally_enabled,
        endpoints,
        endpoint_ids,
        cluster_replay_horizon,
        storage,
        snapshot_interval,
        cold_startup_window,
    } = topology;

    let events = EventBus::default();
    let executor = Arc::new(LocalExecutor::new(runtime.max_concurrent_checks.load(std::sync::atomic::Ordering::Relaxed)));

    let cluster_handle = if endpoints.is_empty() {
        None
    } else {
        info!(count = endpoints.len(), "cluster messenger started");
        Some(ClusterHandle::spawn(endpoints.clone(), cluster_replay_horizon))
    };

    let endpoint_lookup: Arc<dyn EndpointLookup> = if endpoint_ids.is_empty() {
        Arc::new(NoEndpoints)
    } else {
        let connected_by_name: std::collections::HashMap<&str, bool> =
            endpoints.iter().map(|e| (e.name.as_str(), e.connected)).collect();
        let by_id = endpoint_ids
            .iter()
            .map(|(id, name)| (*id, (name.clone(), connected_by_name.get(name.as_str()).copied().unwrap_or(false))))
            .collect();
        Arc::new(StaticEndpointLookup { by_id })
    };

    let scheduler = SchedulerHandle::spawn(&runtime, events.clone(), executor.clone(), endpoint_lookup, command_resolver, cold_startup_window);
    info!("check scheduler started");

    let (notification_tx, notification_rx) = mpsc::channel::<NotificationCommand>(256);
    let notification_engine =
        NotificationEngine::new(notification_directory, runtime.clock.clone(), notification_rx, notifications_globally_enabled, executor, events.clone());
    tokio::spawn(notification_engine.run());
    info!("notification engine started");

    // Kept alive for the lifetime of `run_core` so the bus's channel stays
    // open; the demo binary has no inbound surface to submit through,
    // exactly as the packaging note says it isn't a CLI for the domain.
    let _external_commands =
        ExternalCommandHandle::spawn(runtime.registry.clone(), runtime.clock.clone(), events.clone(), scheduler.clone(), notification_tx.clone());
    info!("external command bus started");

    let store = build_store(&storage).await;
    let snapshotter = SnapshotterHandle::spawn(runtime.registry.clone(), store, runtime.clock.clone(), snapshot_interval);
    info!("snapshotter started");

    // spec §4.5 step 9: forward NotificationsRequested events from the
    // checkable state machine to the notification engine's own command
    // channel.
    let mut notification_event_rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match notification_event_rx.recv().await {
                Ok(CheckableEvent::NotificationsRequested { checkable, ntype, author, text, force }) => {
                    let _ = notification_tx.send(NotificationCommand::Requested { checkable, ntype, author, text, force }).await;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "notification event forwarder lagged behind the event bus");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // spec §4.10: mirror every new check result to endpoints configured
    // with the StateReplication capability.
    let replication_targets: Vec<String> =
        endpoints.iter().filter(|e| e.has_capability(Capability::StateReplication)).map(|e| e.name.clone()).collect();
    if let (Some(cluster), false) = (cluster_handle.clone(), replication_targets.is_empty()) {
        let registry = runtime.registry.clone();
        let mut replication_event_rx = events.subscribe();
        tokio::spawn(async move {
            loop {
                match replication_event_rx.recv().await {
                    Ok(CheckableEvent::NewCheckResult { checkable, result }) => {
                        let Some((host, service)) = checkable_name_parts(&registry, checkable).await else { continue };
                        let message = ClusterMessage::CheckResult { host, service, cr: result };
                        for target in &replication_targets {
                            if let Err(e) = cluster.sync_send(target.clone(), message.clone()).await {
                                warn!(endpoint = %target, error = %e, "state replication send failed");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "state replication forwarder lagged behind the event bus");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    for id in runtime.registry.active_checkables().await {
        scheduler.admit_now(id).await;
    }

    info!("all actors started, press Ctrl+C to shut down");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal, stopping actors..."),
        Err(err) => error!("unable to listen for shutdown signal: {err}"),
    }

    if let Err(e) = snapshotter.snapshot_now().await {
        warn!(error = %e, "final snapshot failed");
    }
    snapshotter.shutdown().await;
    scheduler.shutdown().await;
    if let Some(cluster) = cluster_handle {
        cluster.shutdown().await;
    }

    info!("all actors stopped, exiting");
    Ok(())
}
