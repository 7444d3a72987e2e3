//! Runtime context (spec §4.12, ADDED)
//!
//! A single `Runtime` is constructed once at startup and cloned (cheaply:
//! every field is an `Arc` or a plain `Clone` type) into every actor,
//! replacing a global-singleton application object with an explicit
//! context value threaded through constructors.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::dependency::DependencyGraph;
use crate::period::TimePeriod;
use crate::registry::{ObjectId, Registry};

#[derive(Clone)]
pub struct Runtime {
    pub clock: Clock,
    pub registry: Arc<Registry>,
    pub dependencies: Arc<DependencyGraph>,
    pub periods: Arc<Mutex<HashMap<ObjectId, TimePeriod>>>,
    pub node_name: String,
    pub program_start: f64,
    pub max_concurrent_checks: Arc<AtomicUsize>,
    pub pending_checks: Arc<AtomicUsize>,
}

impl Runtime {
    pub fn new(node_name: impl Into<String>, max_concurrent_checks: usize) -> Self {
        let clock = Clock::new();
        let program_start = clock.now();
        Self {
            clock,
            registry: Arc::new(Registry::new()),
            dependencies: Arc::new(DependencyGraph::new()),
            periods: Arc::new(Mutex::new(HashMap::new())),
            node_name: node_name.into(),
            program_start,
            max_concurrent_checks: Arc::new(AtomicUsize::new(max_concurrent_checks)),
            pending_checks: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// An isolated runtime for tests: a fresh clock (still real-time until
    /// the caller calls `set_time`), an empty registry, and a generous
    /// concurrency cap so scheduler tests aren't accidentally throttled.
    pub fn new_for_test() -> Self {
        Self::new("test-node", 64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cloned_runtimes_share_the_same_registry_and_counters() {
        let rt = Runtime::new_for_test();
        let cloned = rt.clone();

        cloned.pending_checks.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(rt.pending_checks.load(std::sync::atomic::Ordering::SeqCst), 1);

        assert!(Arc::ptr_eq(&rt.registry, &cloned.registry));
    }
}
