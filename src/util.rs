use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const NODE_NAME: &str = "NODE_NAME";

pub fn get_node_name() -> String {
    std::env::var(NODE_NAME).unwrap_or_else(|_| "localhost".to_string())
}

const MAX_CONCURRENT_CHECKS: &str = "MAX_CONCURRENT_CHECKS";

const DEFAULT_MAX_CONCURRENT_CHECKS: usize = 512;

pub fn get_max_concurrent_checks() -> usize {
    std::env::var(MAX_CONCURRENT_CHECKS)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_CONCURRENT_CHECKS)
}

/// Deterministic per-name jitter in `[0, interval * 0.1]`, seconds.
///
/// Keeps restarts from stampeding every checkable's next check onto the
/// same instant while staying reproducible for a given name.
pub fn splay(name: &str, interval: f64) -> f64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    let fraction = (hasher.finish() % 1000) as f64 / 1000.0;
    interval * 0.1 * fraction
}
