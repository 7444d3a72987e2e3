//! Notification Engine (spec §4.8)
//!
//! Fans a requested notification out to every `Notification` object
//! attached to a checkable, each filtering independently by type,
//! state, period, and interval before reaching its user set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::actors::command_runner::{CommandExecutor, CommandSpec};
use crate::actors::messages::NotificationCommand;
use crate::checkable::{CheckableEvent, EventBus, NotificationType};
use crate::clock::Clock;
use crate::macros::{MacroResolver, ResolverList, resolve_macros};
use crate::period::TimePeriod;
use crate::registry::ObjectId;

/// Default timeout for an invoked notification command; notification
/// commands have no per-command config the way check commands do, so
/// there is nothing to override this with yet.
const NOTIFICATION_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationState {
    Problem,
    Recovery,
    Any,
}

#[derive(Debug, Clone)]
pub struct User {
    pub name: String,
    pub enabled: bool,
    pub period: Option<ObjectId>,
    pub type_filter: Vec<NotificationType>,
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub id: ObjectId,
    pub checkable: ObjectId,
    pub command: String,
    pub users: Vec<ObjectId>,
    pub user_groups: Vec<String>,
    pub type_filter: Vec<NotificationType>,
    pub period: Option<ObjectId>,
    pub notification_interval: f64,
    pub last_notification: f64,
    pub next_notification: f64,
    pub notification_number: u32,
    pub paused: bool,
    pub sent_to_user: Vec<ObjectId>,
}

impl Notification {
    fn type_allowed(&self, ntype: NotificationType) -> bool {
        self.type_filter.is_empty() || self.type_filter.contains(&ntype)
    }
}

/// Queried by the engine for notification/user period and group lookups;
/// kept as a trait so this module doesn't need direct registry coupling.
pub trait NotificationDirectory: Send + Sync {
    fn period(&self, id: ObjectId) -> Option<TimePeriod>;
    fn user(&self, id: ObjectId) -> Option<User>;
    fn users_in_group(&self, group: &str) -> Vec<ObjectId>;
    fn notifications_for(&self, checkable: ObjectId) -> Vec<Notification>;
    fn save_notification(&self, notification: &Notification);
}

pub struct NotificationEngine<D: NotificationDirectory> {
    directory: D,
    clock: Clock,
    command_rx: mpsc::Receiver<NotificationCommand>,
    notifications_globally_enabled: bool,
    executor: Arc<dyn CommandExecutor>,
    events: EventBus,
}

#[derive(Debug, Clone)]
pub struct DeliveredNotification {
    pub notification: ObjectId,
    pub user: ObjectId,
    pub command: String,
}

impl<D: NotificationDirectory> NotificationEngine<D> {
    pub fn new(
        directory: D,
        clock: Clock,
        command_rx: mpsc::Receiver<NotificationCommand>,
        notifications_globally_enabled: bool,
        executor: Arc<dyn CommandExecutor>,
        events: EventBus,
    ) -> Self {
        Self { directory, clock, command_rx, notifications_globally_enabled, executor, events }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting notification engine");
        while let Some(cmd) = self.command_rx.recv().await {
            match cmd {
                NotificationCommand::Requested { checkable, ntype, author, text, force } => {
                    self.on_notifications_requested(checkable, ntype, &author, &text, force).await;
                }
                NotificationCommand::Delay { checkable, until } => {
                    self.on_delay_notification(checkable, until);
                }
                NotificationCommand::Shutdown => break,
            }
        }
        debug!("notification engine stopped");
    }

    /// spec §4.8 step 1-2: per-checkable notification gate and fan-out
    /// across every attached `Notification`.
    #[instrument(skip(self, author, text))]
    pub async fn on_notifications_requested(&self, checkable: ObjectId, ntype: NotificationType, author: &str, text: &str, force: bool) {
        if !self.notifications_globally_enabled && !force {
            info!(checkable = checkable.0, "notifications are globally disabled");
            return;
        }

        let notifications = self.directory.notifications_for(checkable);
        if notifications.is_empty() {
            debug!(checkable = checkable.0, "checkable has no notifications configured");
            return;
        }

        for mut notification in notifications {
            if notification.paused {
                continue;
            }
            let notification_id = notification.id;
            let delivered = self.begin_execute_notification(&mut notification, ntype, author, text, force);
            self.directory.save_notification(&notification);
            self.execute_delivered(checkable, notification_id, &delivered, ntype, author, text).await;
        }
    }

    /// spec §4.9 `DelayNotification`: push the interval gate so none of
    /// `checkable`'s notifications fire again before `until`.
    fn on_delay_notification(&self, checkable: ObjectId, until: f64) {
        for mut notification in self.directory.notifications_for(checkable) {
            notification.next_notification = notification.next_notification.max(until);
            let gated_last = if notification.notification_interval > 0.0 {
                until - notification.notification_interval
            } else {
                until
            };
            notification.last_notification = notification.last_notification.max(gated_last);
            self.directory.save_notification(&notification);
        }
    }

    /// spec §4.8 step 3-5: invokes `notification.command` via the Command
    /// Runner for every delivered user, resolving macros against the
    /// notification's own context, then emits the per-user and
    /// all-users-done completion events.
    #[instrument(skip(self, delivered, author, text))]
    async fn execute_delivered(
        &self,
        checkable: ObjectId,
        notification_id: ObjectId,
        delivered: &[DeliveredNotification],
        ntype: NotificationType,
        author: &str,
        text: &str,
    ) {
        if delivered.is_empty() {
            return;
        }

        for d in delivered {
            let resolvers: ResolverList = vec![
                (
                    "notification".to_string(),
                    MacroResolver::Dict(serde_json::json!({
                        "author": author,
                        "text": text,
                        "type": format!("{ntype:?}"),
                    })),
                ),
                ("user".to_string(), MacroResolver::Dict(serde_json::json!({"id": d.user.0}))),
            ];

            let resolved = match resolve_macros(&d.command, &resolvers, None, None) {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!(notification = notification_id.0, error = %e, "failed to resolve notification command macros");
                    continue;
                }
            };
            let argv: Vec<String> = resolved.split_whitespace().map(str::to_string).collect();
            if argv.is_empty() {
                warn!(notification = notification_id.0, "notification command resolved to an empty command line");
                continue;
            }

            let spec = CommandSpec::Plugin { command: argv, arg_spec: Vec::new(), timeout: NOTIFICATION_COMMAND_TIMEOUT };
            match self.executor.run(checkable, &spec, &resolvers, &self.clock).await {
                Ok(_) => {
                    debug!(user = d.user.0, command = %d.command, "notification command executed");
                    self.events.publish(CheckableEvent::NotificationSentToUser { checkable, notification: notification_id, user: d.user });
                }
                Err(e) => warn!(user = d.user.0, error = %e, "notification command failed"),
            }
        }

        self.events.publish(CheckableEvent::NotificationSentToAllUsers { checkable, notification: notification_id });
    }

    /// spec §4.8 step 3-5: `BeginExecuteNotification`.
    fn begin_execute_notification(
        &self,
        notification: &mut Notification,
        ntype: NotificationType,
        author: &str,
        text: &str,
        force: bool,
    ) -> Vec<DeliveredNotification> {
        let now = self.clock.now();

        if !notification.type_allowed(ntype) {
            return Vec::new();
        }
        if let Some(period_id) = notification.period {
            if let Some(period) = self.directory.period(period_id) {
                if !period.is_inside(now) {
                    debug!(notification = notification.id.0, "outside notification period, skipping");
                    return Vec::new();
                }
            }
        }
        if !force && notification.notification_interval > 0.0 && now < notification.last_notification + notification.notification_interval {
            debug!(notification = notification.id.0, "notification interval not yet elapsed");
            return Vec::new();
        }

        let mut user_ids: Vec<ObjectId> = notification.users.clone();
        for group in &notification.user_groups {
            user_ids.extend(self.directory.users_in_group(group));
        }
        user_ids.sort();
        user_ids.dedup();

        let mut delivered = Vec::new();
        for user_id in user_ids {
            let Some(user) = self.directory.user(user_id) else { continue };
            if !user.enabled {
                continue;
            }
            if let Some(period_id) = user.period {
                if let Some(period) = self.directory.period(period_id) {
                    if !period.is_inside(now) {
                        continue;
                    }
                }
            }
            if !user.type_filter.is_empty() && !user.type_filter.contains(&ntype) {
                continue;
            }

            delivered.push(DeliveredNotification { notification: notification.id, user: user_id, command: notification.command.clone() });
            if !notification.sent_to_user.contains(&user_id) {
                notification.sent_to_user.push(user_id);
            }
        }

        if delivered.is_empty() {
            warn!(notification = notification.id.0, author, text, "no eligible users for notification");
        } else {
            notification.notification_number += 1;
            notification.last_notification = now;
            notification.next_notification = if notification.notification_interval > 0.0 {
                now + notification.notification_interval
            } else {
                0.0
            };
        }

        delivered
    }
}

/// An in-memory [`NotificationDirectory`] used by tests.
pub struct MemoryDirectory {
    pub periods: HashMap<ObjectId, TimePeriod>,
    pub users: HashMap<ObjectId, User>,
    pub groups: HashMap<String, Vec<ObjectId>>,
    pub notifications: std::sync::Mutex<HashMap<ObjectId, Notification>>,
}

impl NotificationDirectory for MemoryDirectory {
    fn period(&self, id: ObjectId) -> Option<TimePeriod> {
        self.periods.get(&id).cloned()
    }
    fn user(&self, id: ObjectId) -> Option<User> {
        self.users.get(&id).cloned()
    }
    fn users_in_group(&self, group: &str) -> Vec<ObjectId> {
        self.groups.get(group).cloned().unwrap_or_default()
    }
    fn notifications_for(&self, checkable: ObjectId) -> Vec<Notification> {
        self.notifications.lock().unwrap().values().filter(|n| n.checkable == checkable).cloned().collect()
    }
    fn save_notification(&self, notification: &Notification) {
        self.notifications.lock().unwrap().insert(notification.id, notification.clone());
    }
}
