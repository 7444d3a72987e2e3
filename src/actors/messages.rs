//! Command types for actor communication (one `mpsc`-delivered enum per
//! actor, `oneshot` reply channels for request/response, a bare
//! `Shutdown` variant everywhere for graceful teardown).

use tokio::sync::oneshot;

use crate::checkable::{CheckResult, NotificationType};
use crate::error::CoreResult;
use crate::registry::ObjectId;

#[derive(Debug)]
pub enum SchedulerCommand {
    /// (Re)admit a checkable for scheduling, e.g. after config add or a
    /// manual reschedule. No-op if it's not Active in the registry.
    AdmitNow { checkable: ObjectId },
    /// spec §4.9 `RescheduleCheck`.
    Reschedule { checkable: ObjectId, next_check: f64, force: bool },
    Shutdown { respond_to: oneshot::Sender<()> },
}

#[derive(Debug)]
pub enum CommandRunnerCommand {
    Execute { checkable: ObjectId, spec: crate::actors::command_runner::CommandSpec, respond_to: oneshot::Sender<CoreResult<CheckResult>> },
    Shutdown,
}

#[derive(Debug)]
pub enum NotificationCommand {
    Requested { checkable: ObjectId, ntype: NotificationType, author: String, text: String, force: bool },
    /// spec §4.9 `DelayNotification`: push every notification attached to
    /// `checkable` out so none re-fires before `until`.
    Delay { checkable: ObjectId, until: f64 },
    Shutdown,
}

#[derive(Debug)]
pub enum ExternalCommand {
    ProcessCheckResult { host: String, service: Option<String>, result: CheckResult },
    AcknowledgeProblem { host: String, service: Option<String>, author: String, comment: String, sticky: bool, expiry: f64 },
    ScheduleDowntime { host: String, service: Option<String>, author: String, comment: String, start: f64, end: f64, fixed: bool, duration: f64 },
    SendCustomNotification { host: String, service: Option<String>, author: String, text: String },
    DelayNotification { host: String, service: Option<String>, until: f64 },
    RemoveDowntime { host: String, service: Option<String>, downtime: ObjectId },
    RemoveComment { host: String, service: Option<String>, comment: ObjectId },
    RescheduleCheck { host: String, service: Option<String>, at: f64, force: bool },
    ShutdownProcess,
    RestartProcess,
}

#[derive(Debug)]
pub struct ExternalCommandEnvelope {
    pub command: ExternalCommand,
    pub respond_to: oneshot::Sender<CoreResult<()>>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum ClusterMessage {
    #[serde(rename = "event::ExecuteCommand")]
    ExecuteCommand { host: String, service: Option<String>, command_type: String, command: Vec<String>, macros: serde_json::Value, deadline: f64 },
    #[serde(rename = "event::ExecutedCommand")]
    ExecutedCommand { host: String, service: Option<String>, execution: f64, check_result: CheckResult },
    #[serde(rename = "event::CheckResult")]
    CheckResult { host: String, service: Option<String>, cr: CheckResult },
    #[serde(rename = "event::SetNextCheck")]
    SetNextCheck { host: String, service: Option<String>, next_check: f64 },
    #[serde(rename = "event::SetForceNextCheck")]
    SetForceNextCheck { host: String, service: Option<String> },
    #[serde(rename = "event::SetAcknowledgement")]
    SetAcknowledgement { host: String, service: Option<String>, author: String, comment: String, sticky: bool, expiry: f64 },
    #[serde(rename = "event::ClearAcknowledgement")]
    ClearAcknowledgement { host: String, service: Option<String> },
    #[serde(rename = "event::SendNotifications")]
    SendNotifications { host: String, service: Option<String>, ntype: NotificationType },
    #[serde(rename = "event::NotificationSentToUser")]
    NotificationSentToUser { host: String, service: Option<String>, user: String },
    #[serde(rename = "event::NotificationSentToAllUsers")]
    NotificationSentToAllUsers { host: String, service: Option<String> },
}

#[derive(Debug)]
pub enum ClusterCommand {
    SyncSend { endpoint: String, message: ClusterMessage, respond_to: oneshot::Sender<CoreResult<()>> },
    HasCapability { endpoint: String, capability: crate::actors::cluster::Capability, respond_to: oneshot::Sender<bool> },
    Shutdown,
}

#[derive(Debug)]
pub enum SnapshotterCommand {
    SnapshotNow { respond_to: oneshot::Sender<CoreResult<()>> },
    Shutdown,
}
