//! Admission-time failure paths: a child behind a hard-down parent, and a
//! remote-endpoint checkable during and after its cold-startup grace
//! window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use guardia_core::actors::command_runner::LocalExecutor;
use guardia_core::actors::scheduler::{EndpointStatus, DEFAULT_COLD_STARTUP_WINDOW};
use guardia_core::checkable::{CheckableCommon, CheckableEvent, EventBus, StateType};
use guardia_core::dependency::{Dependency, StateLookup};
use guardia_core::registry::ObjectId;
use guardia_core::runtime::Runtime;

use crate::helpers::*;

#[tokio::test]
async fn unreachable_child_never_executes_while_parent_is_hard_down() {
    let runtime = Runtime::new_for_test();
    runtime.clock.set_time(5_000.0);

    let mut p = CheckableCommon::new("p", "check_dummy");
    p.raw_state = 1;
    p.state_type = StateType::Hard;
    p.check_interval = 0.1;
    p.retry_interval = 0.1;
    p.next_check = runtime.clock.now() + 100_000.0; // never comes up for its own re-check
    let p_id = runtime.registry.register_host("p", p).await.unwrap();
    runtime.registry.activate_host(p_id).await;

    let c_id = register_active_host(&runtime, "c", 0.1).await;
    runtime
        .dependencies
        .register(Dependency {
            child: c_id,
            parent: p_id,
            period: None,
            state_filter: 1, // bit 0: only raw state 0 (Up/OK) satisfies this dependency
            ignore_soft_states: false,
            redundancy_group: None,
        })
        .await;

    struct DownOnly;
    impl StateLookup for DownOnly {
        fn state_of(&self, _id: ObjectId) -> Option<(u8, StateType)> {
            Some((1, StateType::Hard))
        }
    }
    assert!(!runtime.dependencies.is_reachable(c_id, &DownOnly, 0).await, "child must be unreachable while its parent is hard down");

    let events = EventBus::default();
    let mut result_rx = events.subscribe();
    let scheduler = spawn_default_scheduler(&runtime, events);
    scheduler.admit_now(c_id).await;

    advance_and_settle(&runtime.clock, 0.3, 0.01).await;

    let mut checks_for_c = 0u32;
    while let Ok(evt) = result_rx.try_recv() {
        if matches!(evt, CheckableEvent::NewCheckResult { checkable, .. } if checkable == c_id) {
            checks_for_c += 1;
        }
    }
    assert_eq!(checks_for_c, 0, "unreachable child must never produce a check result");

    scheduler.shutdown().await;
}

fn remote_host(runtime: &Runtime, endpoint: ObjectId) -> CheckableCommon {
    let mut h = CheckableCommon::new("h", "check_dummy");
    h.check_interval = 60.0;
    h.retry_interval = 60.0;
    h.command_endpoint = Some(endpoint);
    h.next_check = runtime.clock.now();
    h
}

#[tokio::test]
async fn remote_cold_startup_skips_silently_within_the_grace_window() {
    let runtime = Runtime::new_for_test();
    runtime.clock.set_time(10_000.0);
    let mut runtime = runtime;
    runtime.program_start = runtime.clock.now();

    let endpoint_id = runtime.registry.alloc_id();
    let h_id = runtime.registry.register_host("h", remote_host(&runtime, endpoint_id)).await.unwrap();
    runtime.registry.activate_host(h_id).await;

    let mut status = HashMap::new();
    status.insert(endpoint_id, EndpointStatus { connected: false, syncing: false });

    let events = EventBus::default();
    let mut result_rx = events.subscribe();
    let scheduler = spawn_scheduler(
        &runtime,
        events,
        Arc::new(LocalExecutor::new(4)),
        Arc::new(FixedEndpoints(status)),
        Arc::new(RemoteResolver { endpoint: "remote".to_string() }),
        DEFAULT_COLD_STARTUP_WINDOW,
    );
    scheduler.admit_now(h_id).await;

    advance_and_settle(&runtime.clock, 0.3, 0.05).await;

    assert!(result_rx.try_recv().is_err(), "cold-startup window must not deliver any result");

    let slot = runtime.registry.get_host(h_id).await.unwrap();
    assert!(slot.lock().await.last_check_result.is_none());

    scheduler.shutdown().await;
}

#[tokio::test]
async fn remote_cold_startup_synthesizes_unknown_after_the_grace_window() {
    let runtime = Runtime::new_for_test();
    runtime.clock.set_time(10_000.0);
    let mut runtime = runtime;
    runtime.program_start = runtime.clock.now() - 500.0; // past the default 300s grace window

    let endpoint_id = runtime.registry.alloc_id();
    let h_id = runtime.registry.register_host("h", remote_host(&runtime, endpoint_id)).await.unwrap();
    runtime.registry.activate_host(h_id).await;

    let mut status = HashMap::new();
    status.insert(endpoint_id, EndpointStatus { connected: false, syncing: false });

    let events = EventBus::default();
    let mut result_rx = events.subscribe();
    let node_name = runtime.node_name.clone();
    let scheduler = spawn_scheduler(
        &runtime,
        events,
        Arc::new(LocalExecutor::new(4)),
        Arc::new(FixedEndpoints(status)),
        Arc::new(RemoteResolver { endpoint: "remote".to_string() }),
        DEFAULT_COLD_STARTUP_WINDOW,
    );
    scheduler.admit_now(h_id).await;

    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut synthetic = None;
    while let Ok(evt) = result_rx.try_recv() {
        if let CheckableEvent::NewCheckResult { checkable, result } = evt {
            if checkable == h_id {
                synthetic = Some(result);
            }
        }
    }
    let result = synthetic.expect("a synthetic Unknown result should be produced once past the grace window");
    assert_eq!(result.state, 3);
    assert!(result.output.contains(&format!("is not connected to '{node_name}'")), "output was: {}", result.output);

    let slot = runtime.registry.get_host(h_id).await.unwrap();
    let c = slot.lock().await;
    let gap = c.next_check - runtime.clock.now();
    assert!(gap > 0.0 && gap <= 61.0, "next_check should land within about one interval, was +{gap}s");

    scheduler.shutdown().await;
}
