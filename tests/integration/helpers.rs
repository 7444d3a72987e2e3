//! Shared scaffolding for the integration suite.
//!
//! Every test builds a real `Runtime` with an injected `Clock` and wires
//! the actual actors (scheduler, dependency graph, event bus) together
//! instead of mocking them; the only test doubles here are the narrow
//! seams (`CommandResolver`, `EndpointLookup`) the core itself defines.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use guardia_core::actors::command_runner::{CommandExecutor, CommandSpec, LocalExecutor};
use guardia_core::actors::scheduler::{CommandResolver, EndpointLookup, EndpointStatus, NoEndpoints, SchedulerHandle, DEFAULT_COLD_STARTUP_WINDOW};
use guardia_core::checkable::{CheckableCommon, EventBus};
use guardia_core::clock::Clock;
use guardia_core::error::CoreResult;
use guardia_core::macros::ResolverList;
use guardia_core::registry::ObjectId;
use guardia_core::runtime::Runtime;

/// Resolves every checkable to the built-in `Null` command, same as the
/// scheduler's own unit tests.
pub struct NullResolver;

impl CommandResolver for NullResolver {
    fn resolve(&self, checkable: &CheckableCommon) -> CoreResult<(CommandSpec, ResolverList)> {
        Ok((CommandSpec::Null { node_name: checkable.name.clone() }, Vec::new()))
    }
}

/// Resolves every checkable to `Sleep`, reading `$sleep_time$` out of the
/// per-call resolver list built by [`sleep_resolver`].
pub struct SleepResolver;

impl CommandResolver for SleepResolver {
    fn resolve(&self, _checkable: &CheckableCommon) -> CoreResult<(CommandSpec, ResolverList)> {
        Ok((CommandSpec::Sleep, sleep_resolver(10.0)))
    }
}

pub fn sleep_resolver(seconds: f64) -> ResolverList {
    vec![("host".to_string(), guardia_core::macros::MacroResolver::Dict(serde_json::json!({"sleep_time": seconds.to_string()})))]
}

/// Every remote checkable resolves to `Remote { endpoint: "remote" }`; the
/// scheduler never actually hands this to the executor unless
/// `EndpointLookup` reports the endpoint connected, so the executor never
/// sees it in the cold-startup scenarios below.
pub struct RemoteResolver {
    pub endpoint: String,
}

impl CommandResolver for RemoteResolver {
    fn resolve(&self, _checkable: &CheckableCommon) -> CoreResult<(CommandSpec, ResolverList)> {
        Ok((CommandSpec::Remote { endpoint: self.endpoint.clone() }, Vec::new()))
    }
}

/// Fixed connectivity table keyed by endpoint id, for the remote
/// cold-startup scenarios.
pub struct FixedEndpoints(pub HashMap<ObjectId, EndpointStatus>);

impl EndpointLookup for FixedEndpoints {
    fn status(&self, endpoint: ObjectId) -> Option<EndpointStatus> {
        self.0.get(&endpoint).copied()
    }
    fn name_of(&self, _endpoint: ObjectId) -> Option<String> {
        Some("remote".to_string())
    }
}

pub async fn register_active_host(runtime: &Runtime, name: &str, interval: f64) -> ObjectId {
    let mut common = CheckableCommon::new(name, "check_dummy");
    common.check_interval = interval;
    common.retry_interval = interval;
    common.next_check = runtime.clock.now();
    let id = runtime.registry.register_host(name, common).await.unwrap();
    runtime.registry.activate_host(id).await;
    id
}

#[allow(clippy::too_many_arguments)]
pub fn spawn_scheduler(
    runtime: &Runtime,
    events: EventBus,
    executor: Arc<dyn CommandExecutor>,
    endpoints: Arc<dyn EndpointLookup>,
    resolver: Arc<dyn CommandResolver>,
    cold_startup_window: Duration,
) -> SchedulerHandle {
    SchedulerHandle::spawn(runtime, events, executor, endpoints, resolver, cold_startup_window)
}

pub fn spawn_default_scheduler(runtime: &Runtime, events: EventBus) -> SchedulerHandle {
    spawn_scheduler(runtime, events, Arc::new(LocalExecutor::new(64)), Arc::new(NoEndpoints), Arc::new(NullResolver), DEFAULT_COLD_STARTUP_WINDOW)
}

/// Advances the injected clock in small steps, yielding to the runtime
/// after each so scheduler/executor tasks woken by the advance actually
/// get to run before the next step. Lets "run the scheduler for N
/// seconds" scenarios execute without an N-second-long real sleep.
pub async fn advance_and_settle(clock: &Clock, total: f64, step: f64) {
    let mut remaining = total;
    while remaining > 0.0 {
        let this_step = step.min(remaining);
        clock.advance(this_step);
        tokio::time::sleep(Duration::from_millis(5)).await;
        remaining -= this_step;
    }
}
