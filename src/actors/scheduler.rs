//! Check Scheduler (spec §4.6)
//!
//! Drives a priority queue of Active checkables keyed by `next_check`,
//! admits each through `AdmitForCheck`, and fans execution out through a
//! pluggable [`CommandExecutor`]. Concurrency is `pending_checks` counted
//! against `max_concurrent_checks`, both shared with the rest of the
//! runtime so a config reload can resize the cap in place.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::actors::command_runner::{CommandExecutor, CommandSpec};
use crate::actors::messages::SchedulerCommand;
use crate::checkable::{CheckResult, CheckableCommon, CheckableEvent, EventBus, StateType};
use crate::clock::Clock;
use crate::dependency::{DependencyGraph, StateLookup};
use crate::error::CoreResult;
use crate::macros::ResolverList;
use crate::period::TimePeriod;
use crate::registry::{ObjectId, Registry};
use crate::runtime::Runtime;

/// spec §4.6 `RemoteColdStartup`'s default grace period.
pub const DEFAULT_COLD_STARTUP_WINDOW: Duration = Duration::from_secs(300);

/// Re-poll delay applied to an entry bounced for `ConcurrencyFull`. Keeps
/// the already-due entry from being popped again on the very next loop
/// iteration, which would busy-spin `run()` until a slot frees.
const CONCURRENCY_FULL_RETRY_DELAY: f64 = 1.0;

#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionReason {
    Admitted,
    ConcurrencyFull,
    ChecksDisabled,
    Unreachable,
    OutsideCheckPeriod { until: f64, period_name: String },
    RemoteColdStartup { synthesize_unknown: bool, endpoint_name: String },
}

/// Caches the last known `(raw_state, state_type)` per checkable so
/// `DependencyGraph::is_reachable`'s synchronous [`StateLookup`] doesn't
/// need a registry round-trip on every admission check. Kept current by
/// the scheduler itself right after every processed result.
#[derive(Default)]
pub struct StateCache(std::sync::Mutex<HashMap<ObjectId, (u8, StateType)>>);

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, id: ObjectId, raw_state: u8, state_type: StateType) {
        self.0.lock().unwrap().insert(id, (raw_state, state_type));
    }
}

impl StateLookup for StateCache {
    fn state_of(&self, id: ObjectId) -> Option<(u8, StateType)> {
        self.0.lock().unwrap().get(&id).copied()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EndpointStatus {
    pub connected: bool,
    pub syncing: bool,
}

/// Queried for `command_endpoint` connectivity; kept as a trait so the
/// scheduler doesn't depend on the Cluster Messenger directly, the same
/// seam [`CommandExecutor`] and `NotificationDirectory` already use.
pub trait EndpointLookup: Send + Sync {
    fn status(&self, endpoint: ObjectId) -> Option<EndpointStatus>;
    fn name_of(&self, endpoint: ObjectId) -> Option<String>;
}

/// An `EndpointLookup` for the common case of no remote checkables at
/// all: every `command_endpoint` lookup misses.
pub struct NoEndpoints;

impl EndpointLookup for NoEndpoints {
    fn status(&self, _endpoint: ObjectId) -> Option<EndpointStatus> {
        None
    }
    fn name_of(&self, _endpoint: ObjectId) -> Option<String> {
        None
    }
}

/// Resolves a checkable's `check_command` into a dispatchable
/// [`CommandSpec`] plus the macro resolvers it needs. Left to the caller
/// (ultimately config) so the scheduler never has to know the command
/// definition format.
pub trait CommandResolver: Send + Sync {
    fn resolve(&self, checkable: &CheckableCommon) -> CoreResult<(CommandSpec, ResolverList)>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct QueueEntry {
    next_check: f64,
    checkable: ObjectId,
}

impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.next_check.total_cmp(&other.next_check).then_with(|| self.checkable.cmp(&other.checkable))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct CheckOutcome {
    checkable: ObjectId,
    outcome: CoreResult<CheckResult>,
}

pub struct CheckScheduler {
    registry: Arc<Registry>,
    dependencies: Arc<DependencyGraph>,
    periods: Arc<Mutex<HashMap<ObjectId, TimePeriod>>>,
    clock: Clock,
    events: EventBus,
    executor: Arc<dyn CommandExecutor>,
    endpoints: Arc<dyn EndpointLookup>,
    command_resolver: Arc<dyn CommandResolver>,
    state_cache: Arc<StateCache>,
    queue: BinaryHeap<Reverse<QueueEntry>>,
    command_rx: mpsc::Receiver<SchedulerCommand>,
    result_tx: mpsc::Sender<CheckOutcome>,
    result_rx: mpsc::Receiver<CheckOutcome>,
    pending_checks: Arc<AtomicUsize>,
    max_concurrent_checks: Arc<AtomicUsize>,
    node_name: String,
    program_start: f64,
    cold_startup_window: Duration,
}

impl CheckScheduler {
    #[allow(clippy::too_many_arguments)]
    fn new(
        runtime: &Runtime,
        events: EventBus,
        executor: Arc<dyn CommandExecutor>,
        endpoints: Arc<dyn EndpointLookup>,
        command_resolver: Arc<dyn CommandResolver>,
        cold_startup_window: Duration,
        command_rx: mpsc::Receiver<SchedulerCommand>,
    ) -> Self {
        let (result_tx, result_rx) = mpsc::channel(256);
        Self {
            registry: runtime.registry.clone(),
            dependencies: runtime.dependencies.clone(),
            periods: runtime.periods.clone(),
            clock: runtime.clock.clone(),
            events,
            executor,
            endpoints,
            command_resolver,
            state_cache: Arc::new(StateCache::new()),
            queue: BinaryHeap::new(),
            command_rx,
            result_tx,
            result_rx,
            pending_checks: runtime.pending_checks.clone(),
            max_concurrent_checks: runtime.max_concurrent_checks.clone(),
            node_name: runtime.node_name.clone(),
            program_start: runtime.program_start,
            cold_startup_window,
        }
    }

    async fn lookup(&self, id: ObjectId) -> Option<Arc<tokio::sync::Mutex<CheckableCommon>>> {
        if let Some(slot) = self.registry.get_host(id).await {
            return Some(slot);
        }
        self.registry.get_service(id).await
    }

    async fn seed(&mut self) {
        for id in self.registry.active_checkables().await {
            let Some(slot) = self.lookup(id).await else { continue };
            let c = slot.lock().await;
            let (next_check, raw_state, state_type) = (c.next_check, c.raw_state, c.state_type);
            drop(c);
            self.state_cache.update(id, raw_state, state_type);
            self.queue.push(Reverse(QueueEntry { next_check, checkable: id }));
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting check scheduler");
        self.seed().await;

        loop {
            let wait_until = self.queue.peek().map(|Reverse(e)| e.next_check);

            match wait_until {
                None => {
                    tokio::select! {
                        Some(cmd) = self.command_rx.recv() => {
                            if self.handle_command(cmd).await { break; }
                        }
                        Some(outcome) = self.result_rx.recv() => {
                            self.on_check_outcome(outcome).await;
                        }
                        else => break,
                    }
                }
                Some(next_check) => {
                    let now = self.clock.now();
                    if next_check > now {
                        tokio::select! {
                            _ = self.clock.sleep_until(next_check) => {}
                            Some(cmd) = self.command_rx.recv() => {
                                if self.handle_command(cmd).await { break; }
                            }
                            Some(outcome) = self.result_rx.recv() => {
                                self.on_check_outcome(outcome).await;
                            }
                        }
                    } else {
                        let Reverse(entry) = self.queue.pop().expect("peeked entry must still be there");
                        self.process_entry(entry).await;
                    }
                }
            }
        }
        debug!("check scheduler stopped");
    }

    /// Returns `true` if the scheduler should stop.
    async fn handle_command(&mut self, cmd: SchedulerCommand) -> bool {
        match cmd {
            SchedulerCommand::AdmitNow { checkable } => {
                let Some(slot) = self.lookup(checkable).await else {
                    warn!(checkable = checkable.0, "admit_now for unknown checkable");
                    return false;
                };
                let next_check = slot.lock().await.next_check;
                self.queue.push(Reverse(QueueEntry { next_check, checkable }));
                false
            }
            SchedulerCommand::Reschedule { checkable, next_check, force } => {
                if let Some(slot) = self.lookup(checkable).await {
                    let mut c = slot.lock().await;
                    let old_next_check = c.next_check;
                    c.next_check = next_check;
                    c.force_next_check = force;
                    drop(c);
                    self.events.publish(CheckableEvent::NextCheckChanged { checkable, old_next_check });
                }
                self.queue.push(Reverse(QueueEntry { next_check, checkable }));
                false
            }
            SchedulerCommand::Shutdown { respond_to } => {
                let _ = respond_to.send(());
                true
            }
        }
    }

    async fn process_entry(&mut self, entry: QueueEntry) {
        let id = entry.checkable;
        let Some(slot) = self.lookup(id).await else {
            return;
        };

        let now = self.clock.now();
        let reason = self.admit_for_check(id, &slot, now).await;

        match reason {
            AdmissionReason::Admitted => {
                self.pending_checks.fetch_add(1, Ordering::SeqCst);
                let old_next_check;
                let next_check;
                {
                    let mut c = slot.lock().await;
                    old_next_check = c.next_check;
                    c.update_next_check();
                    next_check = c.next_check;
                }
                self.events.publish(CheckableEvent::NextCheckChanged { checkable: id, old_next_check });
                self.queue.push(Reverse(QueueEntry { next_check, checkable: id }));
                self.dispatch_check(id, slot).await;
            }
            AdmissionReason::ConcurrencyFull => {
                let next_check = now + CONCURRENCY_FULL_RETRY_DELAY;
                debug!(checkable = id.0, next_check, "concurrency full, backing off");
                self.queue.push(Reverse(QueueEntry { next_check, checkable: id }));
            }
            AdmissionReason::ChecksDisabled => {
                info!(checkable = id.0, "active checks disabled, skipping");
                self.reschedule_after_interval(id, &slot).await;
            }
            AdmissionReason::Unreachable => {
                info!(checkable = id.0, "dependency failed, skipping");
                self.reschedule_after_interval(id, &slot).await;
            }
            AdmissionReason::OutsideCheckPeriod { until, period_name } => {
                info!(checkable = id.0, period = %period_name, until, "not in check period, skipping");
                self.reschedule_to(id, &slot, until).await;
            }
            AdmissionReason::RemoteColdStartup { synthesize_unknown, endpoint_name } => {
                if synthesize_unknown {
                    self.inject_cold_startup_unknown(id, &slot, &endpoint_name).await;
                } else {
                    info!(checkable = id.0, endpoint = %endpoint_name, "remote endpoint not connected yet, skipping");
                }
                self.reschedule_after_interval(id, &slot).await;
            }
        }
    }

    /// spec §4.6 `AdmitForCheck`, evaluated in the documented order.
    async fn admit_for_check(&self, id: ObjectId, slot: &Arc<tokio::sync::Mutex<CheckableCommon>>, now: f64) -> AdmissionReason {
        if self.pending_checks.load(Ordering::SeqCst) >= self.max_concurrent_checks.load(Ordering::SeqCst) {
            return AdmissionReason::ConcurrencyFull;
        }

        let (active_checks, check_period, command_endpoint) = {
            let c = slot.lock().await;
            (c.enabled.active_checks, c.check_period, c.command_endpoint)
        };

        if !active_checks {
            return AdmissionReason::ChecksDisabled;
        }

        if !self.dependencies.is_reachable(id, self.state_cache.as_ref(), 0).await {
            return AdmissionReason::Unreachable;
        }

        if let Some(period_id) = check_period {
            let periods = self.periods.lock().await;
            if let Some(period) = periods.get(&period_id) {
                if !period.is_inside(now) {
                    return AdmissionReason::OutsideCheckPeriod { until: period.next_valid_end(now), period_name: period.name.clone() };
                }
            }
        }

        if let Some(endpoint_id) = command_endpoint {
            if let Some(status) = self.endpoints.status(endpoint_id) {
                if !status.connected && !status.syncing {
                    let name = self.endpoints.name_of(endpoint_id).unwrap_or_default();
                    let elapsed = now - self.program_start;
                    let synthesize_unknown = elapsed >= self.cold_startup_window.as_secs_f64();
                    return AdmissionReason::RemoteColdStartup { synthesize_unknown, endpoint_name: name };
                }
            }
        }

        AdmissionReason::Admitted
    }

    async fn reschedule_after_interval(&mut self, id: ObjectId, slot: &Arc<tokio::sync::Mutex<CheckableCommon>>) {
        let now = self.clock.now();
        let (old_next_check, next_check) = {
            let mut c = slot.lock().await;
            let old = c.next_check;
            c.next_check = now + c.check_interval.max(1.0);
            (old, c.next_check)
        };
        self.events.publish(CheckableEvent::NextCheckChanged { checkable: id, old_next_check });
        self.queue.push(Reverse(QueueEntry { next_check, checkable: id }));
    }

    async fn reschedule_to(&mut self, id: ObjectId, slot: &Arc<tokio::sync::Mutex<CheckableCommon>>, at: f64) {
        let old_next_check = {
            let mut c = slot.lock().await;
            let old = c.next_check;
            c.next_check = at;
            old
        };
        self.events.publish(CheckableEvent::NextCheckChanged { checkable: id, old_next_check });
        self.queue.push(Reverse(QueueEntry { next_check: at, checkable: id }));
    }

    async fn inject_cold_startup_unknown(&mut self, id: ObjectId, slot: &Arc<tokio::sync::Mutex<CheckableCommon>>, endpoint_name: &str) {
        let now = self.clock.now();
        let result = CheckResult {
            state: 3,
            exit_status: 3,
            output: format!("Remote Icinga instance '{endpoint_name}' is not connected to '{}'", self.node_name),
            performance_data: Vec::new(),
            schedule_start: now,
            schedule_end: now,
            execution_start: now,
            execution_end: now,
            command: Vec::new(),
            check_source: "scheduler".to_string(),
            active: true,
            vars_before: None,
            vars_after: None,
        };
        let mut c = slot.lock().await;
        if let Err(e) = crate::checkable::process_result(id, &mut c, result, now, &self.events) {
            warn!(checkable = id.0, error = %e, "rejected synthetic cold-startup result");
            return;
        }
        self.state_cache.update(id, c.raw_state, c.state_type);
    }

    #[instrument(skip(self, slot))]
    async fn dispatch_check(&self, id: ObjectId, slot: Arc<tokio::sync::Mutex<CheckableCommon>>) {
        let resolver = self.command_resolver.clone();
        let executor = self.executor.clone();
        let clock = self.clock.clone();
        let result_tx = self.result_tx.clone();

        tokio::spawn(async move {
            let spec_and_resolvers = {
                let c = slot.lock().await;
                resolver.resolve(&c)
            };
            let outcome = match spec_and_resolvers {
                Ok((spec, resolvers)) => executor.run(id, &spec, &resolvers, &clock).await,
                Err(e) => Err(e),
            };
            let _ = result_tx.send(CheckOutcome { checkable: id, outcome }).await;
        });
    }

    async fn on_check_outcome(&mut self, outcome: CheckOutcome) {
        self.pending_checks.fetch_sub(1, Ordering::SeqCst);
        let Some(slot) = self.lookup(outcome.checkable).await else {
            return;
        };

        let now = self.clock.now();
        let result = match outcome.outcome {
            Ok(r) => r,
            Err(e) => synth_error_result(&e, now),
        };

        let mut c = slot.lock().await;
        if let Err(e) = crate::checkable::process_result(outcome.checkable, &mut c, result, now, &self.events) {
            warn!(checkable = outcome.checkable.0, error = %e, "rejected check result");
            return;
        }
        self.state_cache.update(outcome.checkable, c.raw_state, c.state_type);
    }
}

fn synth_error_result(error: &crate::error::CoreError, now: f64) -> CheckResult {
    CheckResult {
        state: 3,
        exit_status: 3,
        output: error.to_string(),
        performance_data: Vec::new(),
        schedule_start: now,
        schedule_end: now,
        execution_start: now,
        execution_end: now,
        command: Vec::new(),
        check_source: "scheduler".to_string(),
        active: true,
        vars_before: None,
        vars_after: None,
    }
}

#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        runtime: &Runtime,
        events: EventBus,
        executor: Arc<dyn CommandExecutor>,
        endpoints: Arc<dyn EndpointLookup>,
        command_resolver: Arc<dyn CommandResolver>,
        cold_startup_window: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let scheduler = CheckScheduler::new(runtime, events, executor, endpoints, command_resolver, cold_startup_window, rx);
        tokio::spawn(scheduler.run());
        Self { sender: tx }
    }

    pub async fn admit_now(&self, checkable: ObjectId) {
        let _ = self.sender.send(SchedulerCommand::AdmitNow { checkable }).await;
    }

    pub async fn reschedule(&self, checkable: ObjectId, next_check: f64, force: bool) {
        let _ = self.sender.send(SchedulerCommand::Reschedule { checkable, next_check, force }).await;
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(SchedulerCommand::Shutdown { respond_to: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::command_runner::LocalExecutor;

    struct NullResolver;
    impl CommandResolver for NullResolver {
        fn resolve(&self, checkable: &CheckableCommon) -> CoreResult<(CommandSpec, ResolverList)> {
            Ok((CommandSpec::Null { node_name: checkable.name.clone() }, Vec::new()))
        }
    }

    fn test_scheduler(runtime: &Runtime) -> (CheckScheduler, mpsc::Sender<SchedulerCommand>) {
        let (tx, rx) = mpsc::channel(16);
        let scheduler = CheckScheduler::new(
            runtime,
            EventBus::default(),
            Arc::new(LocalExecutor::new(4)),
            Arc::new(NoEndpoints),
            Arc::new(NullResolver),
            DEFAULT_COLD_STARTUP_WINDOW,
            rx,
        );
        (scheduler, tx)
    }

    #[tokio::test]
    async fn checks_disabled_skips_admission() {
        let runtime = Runtime::new_for_test();
        let mut common = CheckableCommon::new("h1", "check_ping");
        common.enabled.active_checks = false;
        let id = runtime.registry.register_host("h1", common).await.unwrap();
        runtime.registry.activate_host(id).await;

        let (scheduler, _tx) = test_scheduler(&runtime);
        let slot = runtime.registry.get_host(id).await.unwrap();
        let reason = scheduler.admit_for_check(id, &slot, runtime.clock.now()).await;
        assert_eq!(reason, AdmissionReason::ChecksDisabled);
    }

    #[tokio::test]
    async fn concurrency_full_blocks_admission() {
        let runtime = Runtime::new_for_test();
        runtime.max_concurrent_checks.store(1, Ordering::SeqCst);
        runtime.pending_checks.store(1, Ordering::SeqCst);
        let id = runtime.registry.register_host("h1", CheckableCommon::new("h1", "check_ping")).await.unwrap();
        runtime.registry.activate_host(id).await;

        let (scheduler, _tx) = test_scheduler(&runtime);
        let slot = runtime.registry.get_host(id).await.unwrap();
        let reason = scheduler.admit_for_check(id, &slot, runtime.clock.now()).await;
        assert_eq!(reason, AdmissionReason::ConcurrencyFull);
    }

    #[tokio::test]
    async fn outside_check_period_reports_next_boundary() {
        let runtime = Runtime::new_for_test();
        runtime.clock.set_time(1_000.0);
        let period_id = ObjectId(999);
        runtime
            .periods
            .lock()
            .await
            .insert(period_id, TimePeriod { name: "business-hours".to_string(), ranges: vec![(2_000.0, 3_000.0)] });

        let mut common = CheckableCommon::new("h1", "check_ping");
        common.check_period = Some(period_id);
        let id = runtime.registry.register_host("h1", common).await.unwrap();
        runtime.registry.activate_host(id).await;

        let (scheduler, _tx) = test_scheduler(&runtime);
        let slot = runtime.registry.get_host(id).await.unwrap();
        let reason = scheduler.admit_for_check(id, &slot, runtime.clock.now()).await;
        assert_eq!(reason, AdmissionReason::OutsideCheckPeriod { until: 2_000.0, period_name: "business-hours".to_string() });
    }

    #[tokio::test]
    async fn admit_now_runs_an_overdue_check_to_completion() {
        let runtime = Runtime::new_for_test();
        let mut common = CheckableCommon::new("h1", "check_ping");
        common.next_check = 0.0;
        let id = runtime.registry.register_host("h1", common).await.unwrap();
        runtime.registry.activate_host(id).await;

        let handle = SchedulerHandle::spawn(
            &runtime,
            EventBus::default(),
            Arc::new(LocalExecutor::new(4)),
            Arc::new(NoEndpoints),
            Arc::new(NullResolver),
            DEFAULT_COLD_STARTUP_WINDOW,
        );
        handle.admit_now(id).await;

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let slot = runtime.registry.get_host(id).await.unwrap();
            if slot.lock().await.last_check_result.is_some() {
                break;
            }
        }

        let slot = runtime.registry.get_host(id).await.unwrap();
        let c = slot.lock().await;
        assert_eq!(c.raw_state, 0);
        assert!(c.last_check_result.as_ref().is_some_and(|r| r.output.starts_with("Hello from")));
        drop(c);

        handle.shutdown().await;
    }
}
