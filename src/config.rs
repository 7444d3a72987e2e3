//! Configuration tree and the `resolve()` pass (spec §1 excludes the
//! config *language* and loader as a scope boundary; this is the typed
//! object-definition surface that sits on the near side of that
//! boundary, analogous to `config::Config`/`config::ResolvedConfig`).
//!
//! JSON on disk, `serde`-deserialized into [`Config`], then [`Config::resolve`]
//! merges defaults, turns name references into [`ObjectId`]s, registers
//! every host/service/dependency/notification into the live [`Runtime`],
//! and hands back a [`Topology`] ready to wire into the actors.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::trace;

use crate::actors::cluster::{Capability, Endpoint};
use crate::actors::command_runner::CommandSpec;
use crate::actors::notification::{MemoryDirectory, Notification, User};
use crate::actors::scheduler::CommandResolver;
use crate::checkable::{CheckableCommon, EnableFlags, NotificationType};
use crate::dependency::{Dependency, implicit_host_dependency};
use crate::error::{CoreError, CoreResult};
use crate::macros::{ArgSpec, MacroResolver, ResolverList};
use crate::period::TimePeriod;
use crate::registry::ObjectId;
use crate::runtime::Runtime;

/// One argument of a `Plugin` command, mirroring [`ArgSpec`] in config form.
#[derive(Debug, Clone, Deserialize)]
pub struct ArgSpecConfig {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub set_if: Option<String>,
    #[serde(default)]
    pub repeat_key: bool,
    #[serde(default)]
    pub order: i64,
}

impl From<ArgSpecConfig> for ArgSpec {
    fn from(c: ArgSpecConfig) -> Self {
        ArgSpec { key: c.key, value: c.value, set_if: c.set_if, repeat_key: c.repeat_key, order: c.order }
    }
}

fn default_timeout_secs() -> f64 {
    60.0
}

/// Check command definitions (spec §4.7's command types), keyed by name
/// and referenced from `HostConfig`/`ServiceConfig::check_command`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandKind {
    Plugin {
        command: Vec<String>,
        #[serde(default)]
        arg_spec: Vec<ArgSpecConfig>,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: f64,
    },
    Dummy,
    Sleep,
    Null,
    IfwApi {
        base_url: String,
        command_name: String,
        #[serde(default)]
        arg_spec: Vec<ArgSpecConfig>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: CommandKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeRangeConfig {
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimePeriodConfig {
    pub name: String,
    #[serde(default)]
    pub ranges: Vec<TimeRangeConfig>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub type_filter: Vec<NotificationType>,
}

fn default_notification_interval() -> f64 {
    1800.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    pub host: String,
    #[serde(default)]
    pub service: Option<String>,
    pub command: String,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub user_groups: Vec<String>,
    #[serde(default)]
    pub type_filter: Vec<NotificationType>,
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default = "default_notification_interval")]
    pub interval_secs: f64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EnableFlagsConfig {
    pub active_checks: Option<bool>,
    pub passive_checks: Option<bool>,
    pub notifications: Option<bool>,
    pub flap_detection: Option<bool>,
    pub event_handler: Option<bool>,
    pub perfdata: Option<bool>,
}

impl EnableFlagsConfig {
    fn apply(&self, mut flags: EnableFlags) -> EnableFlags {
        if let Some(v) = self.active_checks {
            flags.active_checks = v;
        }
        if let Some(v) = self.passive_checks {
            flags.passive_checks = v;
        }
        if let Some(v) = self.notifications {
            flags.notifications = v;
        }
        if let Some(v) = self.flap_detection {
            flags.flap_detection = v;
        }
        if let Some(v) = self.event_handler {
            flags.event_handler = v;
        }
        if let Some(v) = self.perfdata {
            flags.perfdata = v;
        }
        flags
    }
}

fn default_check_interval() -> f64 {
    60.0
}

fn default_max_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    pub name: String,
    pub check_command: String,
    #[serde(default = "default_check_interval")]
    pub check_interval: f64,
    #[serde(default = "default_check_interval")]
    pub retry_interval: f64,
    #[serde(default = "default_max_attempts")]
    pub max_check_attempts: u32,
    #[serde(default)]
    pub check_period: Option<String>,
    #[serde(default)]
    pub check_timeout: f64,
    #[serde(default)]
    pub vars: JsonValue,
    #[serde(default)]
    pub command_endpoint: Option<String>,
    #[serde(default)]
    pub enabled: EnableFlagsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub host: String,
    pub check_command: String,
    #[serde(default = "default_check_interval")]
    pub check_interval: f64,
    #[serde(default = "default_check_interval")]
    pub retry_interval: f64,
    #[serde(default = "default_max_attempts")]
    pub max_check_attempts: u32,
    #[serde(default)]
    pub check_period: Option<String>,
    #[serde(default)]
    pub check_timeout: f64,
    #[serde(default)]
    pub vars: JsonValue,
    #[serde(default)]
    pub command_endpoint: Option<String>,
    #[serde(default)]
    pub enabled: EnableFlagsConfig,
}

/// Full checkable name as used by `registry.get_service_by_name` — "host!service".
fn service_full_name(host: &str, service: &str) -> String {
    format!("{host}!{service}")
}

#[derive(Debug, Clone, Deserialize)]
pub struct DependencyConfig {
    pub child_host: String,
    #[serde(default)]
    pub child_service: Option<String>,
    pub parent_host: String,
    #[serde(default)]
    pub parent_service: Option<String>,
    #[serde(default)]
    pub period: Option<String>,
    /// State names this dependency treats as "parent OK": any of
    /// `ok`/`up`, `warning`, `critical`/`down`, `unknown`. Empty means
    /// every state satisfies it.
    #[serde(default)]
    pub state_filter: Vec<String>,
    #[serde(default)]
    pub ignore_soft_states: bool,
    #[serde(default)]
    pub redundancy_group: Option<String>,
}

fn parse_state_filter(object: &str, names: &[String]) -> CoreResult<u32> {
    if names.is_empty() {
        return Ok(0b1111);
    }
    let mut mask = 0u32;
    for name in names {
        let bit = match name.as_str() {
            "ok" | "up" => 0,
            "warning" => 1,
            "critical" | "down" => 2,
            "unknown" => 3,
            other => {
                return Err(CoreError::ConfigValidation {
                    object: object.to_string(),
                    field: "state_filter".to_string(),
                    message: format!("unknown state name '{other}'"),
                });
            }
        };
        mask |= 1 << bit;
    }
    Ok(mask)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityConfig {
    IfwApiCheckCommand,
    ExecuteCommand,
    StateReplication,
}

impl From<CapabilityConfig> for Capability {
    fn from(c: CapabilityConfig) -> Self {
        match c {
            CapabilityConfig::IfwApiCheckCommand => Capability::IfwApiCheckCommand,
            CapabilityConfig::ExecuteCommand => Capability::ExecuteCommand,
            CapabilityConfig::StateReplication => Capability::StateReplication,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub capabilities: Vec<CapabilityConfig>,
}

fn default_replay_horizon_secs() -> u64 {
    900
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_replay_horizon_secs")]
    pub replay_horizon_secs: u64,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self { replay_horizon_secs: default_replay_horizon_secs(), endpoints: Vec::new() }
    }
}

/// Object store backend (spec §4.11), named after `StorageConfig` in the
/// teacher's config but storing snapshots/journal rather than metrics.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    None,
    Sqlite {
        #[serde(default = "default_sqlite_path")]
        path: std::path::PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::None
    }
}

fn default_sqlite_path() -> std::path::PathBuf {
    std::path::PathBuf::from("./guardia.db")
}

fn default_node_name() -> String {
    crate::util::get_node_name()
}

fn default_max_concurrent_checks() -> usize {
    crate::util::get_max_concurrent_checks()
}

fn default_cold_startup_window_secs() -> u64 {
    300
}

fn default_snapshot_interval_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_node_name")]
    pub node_name: String,
    #[serde(default = "default_max_concurrent_checks")]
    pub max_concurrent_checks: usize,
    #[serde(default = "default_cold_startup_window_secs")]
    pub cold_startup_window_secs: u64,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    #[serde(default = "default_true")]
    pub notifications_globally_enabled: bool,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub commands: Vec<CommandConfig>,
    #[serde(default)]
    pub time_periods: Vec<TimePeriodConfig>,
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub user_groups: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub notifications: Vec<NotificationConfig>,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub dependencies: Vec<DependencyConfig>,
}

pub fn read_config_file(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("invalid configuration file '{}': {e}", path.display()))
        .inspect(|config: &Config| trace!(?config, "loaded config"))
}

/// Resolves a checkable's `check_command` into a dispatchable
/// [`CommandSpec`], implementing the scheduler's [`CommandResolver`] seam.
/// `Remote`-endpoint checkables resolve straight to `CommandSpec::Remote`
/// regardless of the named command's local `CommandKind`; picking up the
/// command on the remote side is that endpoint's config, not ours.
pub struct ConfigCommandResolver {
    commands: HashMap<String, CommandKind>,
    endpoint_names: HashMap<ObjectId, String>,
    vars: HashMap<String, JsonValue>,
    node_name: String,
}

impl CommandResolver for ConfigCommandResolver {
    fn resolve(&self, checkable: &CheckableCommon) -> CoreResult<(CommandSpec, ResolverList)> {
        let vars = self.vars.get(&checkable.name).cloned().unwrap_or(JsonValue::Null);
        let resolvers: ResolverList = vec![
            ("host".to_string(), MacroResolver::Dict(serde_json::json!({ "name": checkable.name }))),
            ("vars".to_string(), MacroResolver::Dict(vars)),
        ];

        if let Some(endpoint) = checkable.command_endpoint {
            let name = self.endpoint_names.get(&endpoint).cloned().ok_or_else(|| CoreError::ConfigValidation {
                object: checkable.name.clone(),
                field: "command_endpoint".to_string(),
                message: "endpoint id has no known name".to_string(),
            })?;
            return Ok((CommandSpec::Remote { endpoint: name }, resolvers));
        }

        let kind = self.commands.get(&checkable.check_command).ok_or_else(|| CoreError::ConfigValidation {
            object: checkable.name.clone(),
            field: "check_command".to_string(),
            message: format!("unknown check command '{}'", checkable.check_command),
        })?;

        let spec = match kind {
            CommandKind::Plugin { command, arg_spec, timeout_secs } => CommandSpec::Plugin {
                command: command.clone(),
                arg_spec: arg_spec.iter().cloned().map(ArgSpec::from).collect(),
                timeout: Duration::from_secs_f64(*timeout_secs),
            },
            CommandKind::Dummy => CommandSpec::Dummy,
            CommandKind::Sleep => CommandSpec::Sleep,
            CommandKind::Null => CommandSpec::Null { node_name: self.node_name.clone() },
            CommandKind::IfwApi { base_url, command_name, arg_spec } => CommandSpec::IfwApi {
                base_url: base_url.clone(),
                command_name: command_name.clone(),
                arg_spec: arg_spec.iter().cloned().map(ArgSpec::from).collect(),
            },
        };
        Ok((spec, resolvers))
    }
}

/// Everything `resolve()` produces: a live [`Runtime`] with every
/// checkable/dependency/period registered, plus the trait objects and
/// plain data the demo binary wires into the actors.
pub struct Topology {
    pub runtime: Runtime,
    pub command_resolver: Arc<ConfigCommandResolver>,
    pub notification_directory: MemoryDirectory,
    pub notifications_globally_enabled: bool,
    pub endpoints: Vec<Endpoint>,
    pub endpoint_ids: HashMap<ObjectId, String>,
    pub cluster_replay_horizon: Duration,
    pub storage: StorageConfig,
    pub snapshot_interval: Duration,
    pub cold_startup_window: Duration,
}

impl Config {
    /// Merges defaults, resolves every name reference to an [`ObjectId`],
    /// and populates a fresh [`Runtime`] (spec §3 "Lifecycle": construct
    /// -> cross-link -> Start). Returns everything needed to wire up the
    /// scheduler, notification engine, cluster messenger and snapshotter.
    pub async fn resolve(self) -> CoreResult<Topology> {
        let runtime = Runtime::new(self.node_name.clone(), self.max_concurrent_checks);

        let mut period_ids: HashMap<String, ObjectId> = HashMap::new();
        {
            let mut periods = runtime.periods.lock().await;
            for p in &self.time_periods {
                let id = runtime.registry.alloc_id();
                let ranges = p.ranges.iter().map(|r| (r.start, r.end)).collect();
                periods.insert(id, TimePeriod { name: p.name.clone(), ranges });
                period_ids.insert(p.name.clone(), id);
            }
        }
        let lookup_period = |object: &str, name: &Option<String>| -> CoreResult<Option<ObjectId>> {
            match name {
                None => Ok(None),
                Some(n) => period_ids.get(n).copied().map(Some).ok_or_else(|| CoreError::ConfigValidation {
                    object: object.to_string(),
                    field: "period".to_string(),
                    message: format!("unknown time period '{n}'"),
                }),
            }
        };

        let mut user_ids: HashMap<String, ObjectId> = HashMap::new();
        let mut users: HashMap<ObjectId, User> = HashMap::new();
        for u in &self.users {
            let id = runtime.registry.alloc_id();
            let period = lookup_period(&u.name, &u.period)?;
            users.insert(id, User { name: u.name.clone(), enabled: u.enabled, period, type_filter: u.type_filter.clone() });
            user_ids.insert(u.name.clone(), id);
        }

        let mut groups: HashMap<String, Vec<ObjectId>> = HashMap::new();
        for (group, members) in &self.user_groups {
            let mut ids = Vec::with_capacity(members.len());
            for member in members {
                let id = user_ids.get(member).copied().ok_or_else(|| CoreError::ConfigValidation {
                    object: group.clone(),
                    field: "user_groups".to_string(),
                    message: format!("unknown user '{member}'"),
                })?;
                ids.push(id);
            }
            groups.insert(group.clone(), ids);
        }

        let mut endpoint_ids: HashMap<String, ObjectId> = HashMap::new();
        let mut endpoint_names: HashMap<ObjectId, String> = HashMap::new();
        let mut endpoints = Vec::with_capacity(self.cluster.endpoints.len());
        for e in self.cluster.endpoints {
            let id = runtime.registry.alloc_id();
            endpoint_ids.insert(e.name.clone(), id);
            endpoint_names.insert(id, e.name.clone());
            endpoints.push(Endpoint {
                name: e.name,
                url: e.url,
                connected: false,
                syncing: false,
                capabilities: e.capabilities.into_iter().map(Capability::from).collect(),
            });
        }

        let mut command_kinds: HashMap<String, CommandKind> = HashMap::new();
        for c in self.commands {
            command_kinds.insert(c.name, c.kind);
        }

        let mut vars: HashMap<String, JsonValue> = HashMap::new();
        let mut host_ids: HashMap<String, ObjectId> = HashMap::new();

        for h in &self.hosts {
            let mut common = CheckableCommon::new(h.name.clone(), h.check_command.clone());
            common.check_interval = h.check_interval;
            common.retry_interval = h.retry_interval;
            common.max_check_attempts = h.max_check_attempts;
            common.check_period = lookup_period(&h.name, &h.check_period)?;
            common.check_timeout = h.check_timeout;
            common.enabled = h.enabled.apply(EnableFlags::default());
            common.command_endpoint = match &h.command_endpoint {
                None => None,
                Some(n) => Some(*endpoint_ids.get(n).ok_or_else(|| CoreError::ConfigValidation {
                    object: h.name.clone(),
                    field: "command_endpoint".to_string(),
                    message: format!("unknown endpoint '{n}'"),
                })?),
            };

            let id = runtime.registry.register_host(h.name.clone(), common).await?;
            runtime.registry.activate_host(id).await;
            host_ids.insert(h.name.clone(), id);
            vars.insert(h.name.clone(), h.vars.clone());
        }

        let mut service_ids: HashMap<String, ObjectId> = HashMap::new();
        for s in &self.services {
            let host_id = *host_ids.get(&s.host).ok_or_else(|| CoreError::ConfigValidation {
                object: s.name.clone(),
                field: "host".to_string(),
                message: format!("unknown host '{}'", s.host),
            })?;

            let full_name = service_full_name(&s.host, &s.name);
            let mut common = CheckableCommon::new(full_name.clone(), s.check_command.clone());
            common.check_interval = s.check_interval;
            common.retry_interval = s.retry_interval;
            common.max_check_attempts = s.max_check_attempts;
            common.check_period = lookup_period(&full_name, &s.check_period)?;
            common.check_timeout = s.check_timeout;
            common.enabled = s.enabled.apply(EnableFlags::default());
            common.command_endpoint = match &s.command_endpoint {
                None => None,
                Some(n) => Some(*endpoint_ids.get(n).ok_or_else(|| CoreError::ConfigValidation {
                    object: full_name.clone(),
                    field: "command_endpoint".to_string(),
                    message: format!("unknown endpoint '{n}'"),
                })?),
            };

            let id = runtime.registry.register_service(full_name.clone(), common).await?;
            runtime.registry.activate_service(id).await;
            service_ids.insert(full_name.clone(), id);
            vars.insert(full_name.clone(), s.vars.clone());

            runtime.dependencies.register(implicit_host_dependency(id, host_id)).await;
        }

        let resolve_checkable = |host: &str, service: &Option<String>| -> CoreResult<ObjectId> {
            match service {
                None => host_ids.get(host).copied(),
                Some(svc) => service_ids.get(&service_full_name(host, svc)).copied(),
            }
            .ok_or_else(|| CoreError::ConfigValidation {
                object: host.to_string(),
                field: "checkable".to_string(),
                message: "unknown host/service reference".to_string(),
            })
        };

        for d in &self.dependencies {
            let child = resolve_checkable(&d.child_host, &d.child_service)?;
            let parent = resolve_checkable(&d.parent_host, &d.parent_service)?;
            let period = lookup_period(&d.parent_host, &d.period)?;
            let state_filter = parse_state_filter(&d.parent_host, &d.state_filter)?;

            runtime
                .dependencies
                .register(Dependency {
                    child,
                    parent,
                    period,
                    state_filter,
                    ignore_soft_states: d.ignore_soft_states,
                    redundancy_group: d.redundancy_group.clone(),
                })
                .await;
        }

        let mut notifications: HashMap<ObjectId, Notification> = HashMap::new();
        for n in &self.notifications {
            let checkable = resolve_checkable(&n.host, &n.service)?;
            let mut user_refs = Vec::with_capacity(n.users.len());
            for u in &n.users {
                let id = user_ids.get(u).copied().ok_or_else(|| CoreError::ConfigValidation {
                    object: n.host.clone(),
                    field: "notifications.users".to_string(),
                    message: format!("unknown user '{u}'"),
                })?;
                user_refs.push(id);
            }

            let id = runtime.registry.alloc_id();
            let notification = Notification {
                id,
                checkable,
                command: n.command.clone(),
                users: user_refs,
                user_groups: n.user_groups.clone(),
                type_filter: n.type_filter.clone(),
                period: lookup_period(&n.host, &n.period)?,
                notification_interval: n.interval_secs,
                last_notification: 0.0,
                next_notification: 0.0,
                notification_number: 0,
                paused: false,
                sent_to_user: Vec::new(),
            };
            notifications.insert(id, notification);

            let slot = match &n.service {
                None => runtime.registry.get_host(checkable).await,
                Some(_) => runtime.registry.get_service(checkable).await,
            };
            if let Some(slot) = slot {
                slot.lock().await.notifications.push(id);
            }
        }

        let periods_snapshot = runtime.periods.lock().await.clone();

        let command_resolver = Arc::new(ConfigCommandResolver {
            commands: command_kinds,
            endpoint_names: endpoint_names.clone(),
            vars,
            node_name: self.node_name.clone(),
        });

        let notification_directory =
            MemoryDirectory { periods: periods_snapshot, users, groups, notifications: std::sync::Mutex::new(notifications) };

        Ok(Topology {
            runtime,
            command_resolver,
            notification_directory,
            notifications_globally_enabled: self.notifications_globally_enabled,
            endpoints,
            endpoint_ids: endpoint_names,
            cluster_replay_horizon: Duration::from_secs(self.cluster.replay_horizon_secs),
            storage: self.storage,
            snapshot_interval: Duration::from_secs(self.snapshot_interval_secs),
            cold_startup_window: Duration::from_secs(self.cold_startup_window_secs),
        })
    }
}
