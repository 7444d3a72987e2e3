//! External Command Bus (spec §4.9)
//!
//! Accepts structured admin operations from whatever external source
//! (operator UI, cluster peer); locates the target checkable by name and
//! applies the operation. Malformed or unknown input is rejected with
//! `ExternalCommandBadRequest`, never panics.

use tokio::sync::mpsc;
use tracing::{instrument, warn};

use crate::actors::messages::{ExternalCommand, ExternalCommandEnvelope, NotificationCommand};
use crate::actors::scheduler::SchedulerHandle;
use crate::checkable::{Acknowledgement, CheckResult, Downtime, EventBus, NotificationType};
use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::registry::{ObjectId, Registry};

/// Looked up checkable, host or service, located via `Host.GetByName` /
/// `Service.GetByNamePair` in spec terms. Returns the id together with
/// the already-resolved slot so callers don't pay for a second lookup.
async fn resolve_checkable(
    registry: &Registry,
    host: &str,
    service: Option<&str>,
) -> CoreResult<(ObjectId, std::sync::Arc<tokio::sync::Mutex<crate::checkable::CheckableCommon>>)> {
    match service {
        None => registry
            .get_host_by_name(host)
            .await
            .ok_or_else(|| CoreError::ExternalCommandBadRequest { message: format!("unknown host '{host}'") }),
        Some(svc) => registry
            .get_service_by_name(&format!("{host}!{svc}"))
            .await
            .ok_or_else(|| CoreError::ExternalCommandBadRequest { message: format!("unknown service '{host}!{svc}'") }),
    }
}

pub struct ExternalCommandBus {
    registry: std::sync::Arc<Registry>,
    clock: Clock,
    command_rx: mpsc::Receiver<ExternalCommandEnvelope>,
    events: EventBus,
    scheduler: SchedulerHandle,
    notification_tx: mpsc::Sender<NotificationCommand>,
}

impl ExternalCommandBus {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: std::sync::Arc<Registry>,
        clock: Clock,
        command_rx: mpsc::Receiver<ExternalCommandEnvelope>,
        events: EventBus,
        scheduler: SchedulerHandle,
        notification_tx: mpsc::Sender<NotificationCommand>,
    ) -> Self {
        Self { registry, clock, command_rx, events, scheduler, notification_tx }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        while let Some(envelope) = self.command_rx.recv().await {
            let result = self.dispatch(envelope.command).await;
            if let Err(e) = &result {
                warn!(error = %e, "rejecting external command");
            }
            let _ = envelope.respond_to.send(result);
        }
    }

    async fn dispatch(&self, command: ExternalCommand) -> CoreResult<()> {
        match command {
            ExternalCommand::ProcessCheckResult { host, service, result } => self.process_check_result(&host, service.as_deref(), result).await,
            ExternalCommand::AcknowledgeProblem { host, service, author, comment, sticky, expiry } => {
                self.acknowledge_problem(&host, service.as_deref(), &author, &comment, sticky, expiry).await
            }
            ExternalCommand::ScheduleDowntime { host, service, author, comment, start, end, fixed, duration } => {
                self.schedule_downtime(&host, service.as_deref(), &author, &comment, start, end, fixed, duration).await
            }
            ExternalCommand::SendCustomNotification { host, service, author, text } => {
                self.send_custom_notification(&host, service.as_deref(), author, text).await
            }
            ExternalCommand::DelayNotification { host, service, until } => self.delay_notification(&host, service.as_deref(), until).await,
            ExternalCommand::RemoveDowntime { host, service, downtime } => self.remove_downtime(&host, service.as_deref(), downtime).await,
            ExternalCommand::RemoveComment { host, service, comment } => self.remove_comment(&host, service.as_deref(), comment).await,
            ExternalCommand::RescheduleCheck { host, service, at, force } => self.reschedule_check(&host, service.as_deref(), at, force).await,
            ExternalCommand::ShutdownProcess | ExternalCommand::RestartProcess => Ok(()),
        }
    }

    async fn checkable_slot(&self, host: &str, service: Option<&str>) -> CoreResult<std::sync::Arc<tokio::sync::Mutex<crate::checkable::CheckableCommon>>> {
        let (_id, slot) = resolve_checkable(&self.registry, host, service).await?;
        Ok(slot)
    }

    async fn process_check_result(&self, host: &str, service: Option<&str>, result: CheckResult) -> CoreResult<()> {
        result.validate()?;
        let (id, slot) = resolve_checkable(&self.registry, host, service).await?;
        let mut checkable = slot.lock().await;
        crate::checkable::process_result(id, &mut checkable, result, self.clock.now(), &self.events)
    }

    /// spec §4.9 `SendCustomNotification`: routes a Custom-type
    /// notification request through the same channel scheduler-driven
    /// `NotificationsRequested` events use, forced past the interval gate.
    async fn send_custom_notification(&self, host: &str, service: Option<&str>, author: String, text: String) -> CoreResult<()> {
        let (id, _slot) = resolve_checkable(&self.registry, host, service).await?;
        self.notification_tx
            .send(NotificationCommand::Requested { checkable: id, ntype: NotificationType::Custom, author, text, force: true })
            .await
            .map_err(|_| CoreError::ExternalCommandBadRequest { message: "notification engine is gone".to_string() })
    }

    /// spec §4.9 `DelayNotification`.
    async fn delay_notification(&self, host: &str, service: Option<&str>, until: f64) -> CoreResult<()> {
        let (id, _slot) = resolve_checkable(&self.registry, host, service).await?;
        self.notification_tx
            .send(NotificationCommand::Delay { checkable: id, until })
            .await
            .map_err(|_| CoreError::ExternalCommandBadRequest { message: "notification engine is gone".to_string() })
    }

    async fn acknowledge_problem(&self, host: &str, service: Option<&str>, _author: &str, _comment: &str, sticky: bool, expiry: f64) -> CoreResult<()> {
        let slot = self.checkable_slot(host, service).await?;
        let mut checkable = slot.lock().await;
        checkable.acknowledgement = if sticky { Acknowledgement::Sticky } else { Acknowledgement::Normal };
        checkable.ack_expiry = expiry;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn schedule_downtime(
        &self,
        host: &str,
        service: Option<&str>,
        author: &str,
        comment: &str,
        start: f64,
        end: f64,
        fixed: bool,
        duration: f64,
    ) -> CoreResult<()> {
        let slot = self.checkable_slot(host, service).await?;
        let mut checkable = slot.lock().await;
        let id = ObjectId(checkable.downtimes.len() as u64 + 1);
        checkable.downtimes.push(Downtime {
            id,
            author: author.to_string(),
            comment: comment.to_string(),
            start,
            end,
            fixed,
            duration,
            trigger_parent: None,
            active: false,
        });
        Ok(())
    }

    async fn remove_downtime(&self, host: &str, service: Option<&str>, downtime: ObjectId) -> CoreResult<()> {
        let slot = self.checkable_slot(host, service).await?;
        let mut checkable = slot.lock().await;
        checkable.downtimes.retain(|d| d.id != downtime);
        Ok(())
    }

    async fn remove_comment(&self, host: &str, service: Option<&str>, comment: ObjectId) -> CoreResult<()> {
        let slot = self.checkable_slot(host, service).await?;
        let mut checkable = slot.lock().await;
        checkable.comments.retain(|c| c.id != comment);
        Ok(())
    }

    async fn reschedule_check(&self, host: &str, service: Option<&str>, at: f64, force: bool) -> CoreResult<()> {
        let (id, _slot) = resolve_checkable(&self.registry, host, service).await?;
        self.scheduler.reschedule(id, at, force).await;
        Ok(())
    }
}

#[derive(Clone)]
pub struct ExternalCommandHandle {
    sender: mpsc::Sender<ExternalCommandEnvelope>,
}

impl ExternalCommandHandle {
    pub fn spawn(
        registry: std::sync::Arc<Registry>,
        clock: Clock,
        events: EventBus,
        scheduler: SchedulerHandle,
        notification_tx: mpsc::Sender<NotificationCommand>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let bus = ExternalCommandBus::new(registry, clock, rx, events, scheduler, notification_tx);
        tokio::spawn(bus.run());
        Self { sender: tx }
    }

    pub async fn submit(&self, command: ExternalCommand) -> CoreResult<()> {
        let (respond_to, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(ExternalCommandEnvelope { command, respond_to })
            .await
            .map_err(|_| CoreError::ExternalCommandBadRequest { message: "external command bus is gone".to_string() })?;
        rx.await.map_err(|_| CoreError::ExternalCommandBadRequest { message: "external command bus dropped the response".to_string() })?
    }
}
