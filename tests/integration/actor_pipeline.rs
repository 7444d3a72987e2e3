//! A single stable checkable run end to end, plus a full scheduler ->
//! event bus -> snapshotter pipeline test, mirroring the teacher's own
//! collector-to-alert / collector-to-storage pipeline tests.

use std::time::Duration;

use guardia_core::actors::persistence::SnapshotterHandle;
use guardia_core::checkable::{CheckableEvent, EventBus};
use guardia_core::persistence::memory::MemoryStore;
use guardia_core::persistence::ObjectStore;
use guardia_core::runtime::Runtime;
use std::sync::Arc;

use crate::helpers::*;

/// A single stable checkable at interval=0.1s, run for 0.4s: about four
/// checks execute and `next_check - last_check` stays within one interval
/// plus its splay jitter.
#[tokio::test]
async fn single_stable_checkable_executes_on_schedule() {
    let runtime = Runtime::new_for_test();
    runtime.clock.set_time(1_000.0);
    let id = register_active_host(&runtime, "h", 0.1).await;

    let events = EventBus::default();
    let mut result_rx = events.subscribe();
    let scheduler = spawn_default_scheduler(&runtime, events);
    scheduler.admit_now(id).await;

    let mut finished = 0u32;
    for _ in 0..40 {
        runtime.clock.advance(0.01);
        tokio::time::sleep(Duration::from_millis(5)).await;
        while let Ok(evt) = result_rx.try_recv() {
            if matches!(evt, CheckableEvent::NewCheckResult { checkable, .. } if checkable == id) {
                finished += 1;
            }
        }
    }

    assert!((3..=5).contains(&finished), "expected ~4 finished checks over 0.4s, got {finished}");

    let slot = runtime.registry.get_host(id).await.unwrap();
    let c = slot.lock().await;
    assert_eq!(c.raw_state, 0, "Null command always reports Up/OK");
    let gap = c.next_check - c.last_check;
    assert!((0.1..=0.15).contains(&gap), "next_check - last_check was {gap}, expected [0.1, 0.15]");
    drop(c);

    scheduler.shutdown().await;
}

/// Every `NewCheckResult` the scheduler publishes ends up in the next
/// snapshot without the caller having to do anything beyond wiring the
/// two actors to the same registry.
#[tokio::test]
async fn scheduler_results_are_visible_to_the_snapshotter() {
    let runtime = Runtime::new_for_test();
    runtime.clock.set_time(2_000.0);
    let id = register_active_host(&runtime, "h", 0.05).await;

    let events = EventBus::default();
    let scheduler = spawn_default_scheduler(&runtime, events);
    scheduler.admit_now(id).await;

    for _ in 0..10 {
        runtime.clock.advance(0.02);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let snapshotter = SnapshotterHandle::spawn(runtime.registry.clone(), store.clone(), runtime.clock.clone(), Duration::from_secs(3600));
    snapshotter.snapshot_now().await.unwrap();

    let snapshot = store.load_snapshot().await.unwrap().expect("a snapshot was written");
    let (_, snapshotted) = snapshot.hosts.iter().find(|(hid, _)| *hid == id).expect("host present in snapshot");
    assert!(snapshotted.last_check_result.is_some(), "host should have a recorded check result by now");

    snapshotter.shutdown().await;
    scheduler.shutdown().await;
}
