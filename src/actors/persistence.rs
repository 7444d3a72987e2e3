//! Snapshotter actor (spec §4.11, ADDED)
//!
//! Periodically walks every active checkable in the [`Registry`] and
//! writes a [`Snapshot`] through the configured [`ObjectStore`], mirroring
//! the teacher's `StorageActor` polling-interval shape.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, warn};

use crate::actors::messages::SnapshotterCommand;
use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::persistence::{ObjectStore, Snapshot};
use crate::registry::Registry;

pub struct Snapshotter {
    registry: Arc<Registry>,
    store: Arc<dyn ObjectStore>,
    clock: Clock,
    command_rx: mpsc::Receiver<SnapshotterCommand>,
    interval: Duration,
}

impl Snapshotter {
    pub fn new(registry: Arc<Registry>, store: Arc<dyn ObjectStore>, clock: Clock, command_rx: mpsc::Receiver<SnapshotterCommand>, interval: Duration) -> Self {
        Self { registry, store, clock, command_rx, interval }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!(interval_secs = self.interval.as_secs(), "starting snapshotter");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.snapshot_now().await {
                        warn!(error = %e, "periodic snapshot failed");
                    }
                }
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(SnapshotterCommand::SnapshotNow { respond_to }) => {
                            let _ = respond_to.send(self.snapshot_now().await);
                        }
                        Some(SnapshotterCommand::Shutdown) | None => break,
                    }
                }
            }
        }

        if let Err(e) = self.snapshot_now().await {
            warn!(error = %e, "final snapshot on shutdown failed");
        }
        debug!("snapshotter stopped");
    }

    #[instrument(skip(self))]
    async fn snapshot_now(&self) -> CoreResult<()> {
        let mut hosts = Vec::new();
        for id in self.registry.all_host_ids().await {
            if let Some(slot) = self.registry.get_host(id).await {
                hosts.push((id, slot.lock().await.clone()));
            }
        }
        let mut services = Vec::new();
        for id in self.registry.all_service_ids().await {
            if let Some(slot) = self.registry.get_service(id).await {
                services.push((id, slot.lock().await.clone()));
            }
        }

        let snapshot = Snapshot { taken_at: self.clock.now(), hosts, services };
        self.store.write_snapshot(&snapshot).await.map_err(|e| CoreError::BadCheckResult { message: format!("snapshot write failed: {e}") })
    }
}

#[derive(Clone)]
pub struct SnapshotterHandle {
    sender: mpsc::Sender<SnapshotterCommand>,
}

impl SnapshotterHandle {
    pub fn spawn(registry: Arc<Registry>, store: Arc<dyn ObjectStore>, clock: Clock, interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(8);
        let snapshotter = Snapshotter::new(registry, store, clock, rx, interval);
        tokio::spawn(snapshotter.run());
        Self { sender: tx }
    }

    pub async fn snapshot_now(&self) -> CoreResult<()> {
        let (respond_to, rx) = oneshot::channel();
        self.sender
            .send(SnapshotterCommand::SnapshotNow { respond_to })
            .await
            .map_err(|_| CoreError::BadCheckResult { message: "snapshotter is gone".to_string() })?;
        rx.await.map_err(|_| CoreError::BadCheckResult { message: "snapshotter dropped the response".to_string() })?
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(SnapshotterCommand::Shutdown).await;
    }
}
