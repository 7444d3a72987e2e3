//! The scheduler never dispatches more commands at once than
//! `max_concurrent_checks` allows, and checks held back by the cap still
//! complete once a slot frees up rather than being dropped.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use guardia_core::actors::command_runner::{CommandSpec, LocalExecutor};
use guardia_core::actors::scheduler::{CommandResolver, NoEndpoints, DEFAULT_COLD_STARTUP_WINDOW};
use guardia_core::checkable::{CheckableCommon, CheckableEvent, EventBus};
use guardia_core::error::CoreResult;
use guardia_core::macros::ResolverList;
use guardia_core::runtime::Runtime;

use crate::helpers::*;

/// Resolves to a short `Sleep`, so the concurrency cap has time to bite
/// without the test waiting out a real multi-second command.
struct ShortSleepResolver;

impl CommandResolver for ShortSleepResolver {
    fn resolve(&self, _checkable: &CheckableCommon) -> CoreResult<(CommandSpec, ResolverList)> {
        Ok((CommandSpec::Sleep, sleep_resolver(0.2)))
    }
}

#[tokio::test]
async fn pending_checks_never_exceeds_the_concurrency_cap() {
    let runtime = Runtime::new_for_test();
    runtime.clock.set_time(20_000.0);
    runtime.max_concurrent_checks.store(2, Ordering::SeqCst);

    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(register_active_host(&runtime, &format!("h{i}"), 0.05).await);
    }

    let events = EventBus::default();
    let mut result_rx = events.subscribe();
    let scheduler = spawn_scheduler(
        &runtime,
        events,
        Arc::new(LocalExecutor::new(8)),
        Arc::new(NoEndpoints),
        Arc::new(ShortSleepResolver),
        DEFAULT_COLD_STARTUP_WINDOW,
    );
    for id in &ids {
        scheduler.admit_now(*id).await;
    }

    let mut observed_max = 0usize;
    let mut completed = std::collections::HashSet::new();
    for _ in 0..60 {
        runtime.clock.advance(0.05);
        tokio::time::sleep(Duration::from_millis(5)).await;
        observed_max = observed_max.max(runtime.pending_checks.load(Ordering::SeqCst));
        while let Ok(evt) = result_rx.try_recv() {
            if let CheckableEvent::NewCheckResult { checkable, .. } = evt {
                completed.insert(checkable);
            }
        }
        if completed.len() == ids.len() {
            break;
        }
    }

    assert!(observed_max <= 2, "pending_checks rose to {observed_max}, above the cap of 2");
    assert_eq!(completed.len(), ids.len(), "every checkable should eventually complete despite the cap, got {completed:?}");

    scheduler.shutdown().await;
}
