//! Property-based tests for the dependency graph and scheduling jitter.

use std::collections::HashMap;

use guardia_core::checkable::StateType;
use guardia_core::dependency::{Dependency, DependencyGraph, StateLookup};
use guardia_core::registry::ObjectId;
use guardia_core::util::splay;
use proptest::prelude::*;

struct FixedStates(HashMap<ObjectId, (u8, StateType)>);

impl StateLookup for FixedStates {
    fn state_of(&self, id: ObjectId) -> Option<(u8, StateType)> {
        self.0.get(&id).copied()
    }
}

proptest! {
    /// A non-redundant single-parent dependency is reachable exactly when
    /// the parent's raw state bit is set in the filter, independent of
    /// which bit or which state that happens to be.
    #[test]
    fn prop_single_parent_reachability_matches_state_filter_bit(
        raw_state in 0u8..4,
        state_filter in 0u32..16,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let graph = DependencyGraph::new();
            let child = ObjectId(1);
            let parent = ObjectId(2);
            graph.register(Dependency {
                child,
                parent,
                period: None,
                state_filter,
                ignore_soft_states: false,
                redundancy_group: None,
            }).await;

            let mut states = HashMap::new();
            states.insert(parent, (raw_state, StateType::Hard));
            let lookup = FixedStates(states);

            let expected = state_filter & (1 << raw_state) != 0;
            prop_assert_eq!(graph.is_reachable(child, &lookup, 0).await, expected);
            Ok(())
        })?;
    }

    /// Registering N dependencies under the same named redundancy group
    /// always collapses to exactly one group object, regardless of N or
    /// which parents are involved.
    #[test]
    fn prop_named_redundancy_group_is_always_a_single_group(member_count in 1usize..12) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let graph = DependencyGraph::new();
            let child = ObjectId(100);
            for i in 0..member_count {
                graph.register(Dependency {
                    child,
                    parent: ObjectId(200 + i as u64),
                    period: None,
                    state_filter: 1,
                    ignore_soft_states: false,
                    redundancy_group: Some("group".to_string()),
                }).await;
            }
            prop_assert_eq!(graph.registry_size().await, 1);
            Ok(())
        })?;
    }

    /// Children sharing a redundancy group name only share one group
    /// object while their composite-key sets are identical: splitting
    /// them into two distinct edge-set patterns always yields exactly
    /// two groups, regardless of how many children land in each pattern.
    #[test]
    fn prop_named_group_registry_size_tracks_distinct_edge_sets(pattern in prop::collection::vec(any::<bool>(), 1..10)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let graph = DependencyGraph::new();
            let parent_common = ObjectId(500);
            let parent_extra = ObjectId(501);

            for (i, extra) in pattern.iter().enumerate() {
                let child = ObjectId(600 + i as u64);
                graph.register(Dependency {
                    child,
                    parent: parent_common,
                    period: None,
                    state_filter: 1,
                    ignore_soft_states: false,
                    redundancy_group: Some("group".to_string()),
                }).await;
                if *extra {
                    graph.register(Dependency {
                        child,
                        parent: parent_extra,
                        period: None,
                        state_filter: 1,
                        ignore_soft_states: false,
                        redundancy_group: Some("group".to_string()),
                    }).await;
                }
            }

            let distinct_patterns = pattern.iter().collect::<std::collections::HashSet<_>>().len();
            prop_assert_eq!(graph.registry_size().await, distinct_patterns);
            Ok(())
        })?;
    }

    /// Plain (non-redundant) dependencies never share a group: N distinct
    /// children each registering one plain dependency produces N groups.
    #[test]
    fn prop_plain_dependencies_each_get_a_private_group(child_count in 1usize..12) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let graph = DependencyGraph::new();
            let parent = ObjectId(900);
            for i in 0..child_count {
                graph.register(Dependency {
                    child: ObjectId(i as u64),
                    parent,
                    period: None,
                    state_filter: 1,
                    ignore_soft_states: false,
                    redundancy_group: None,
                }).await;
            }
            prop_assert_eq!(graph.registry_size().await, child_count);
            Ok(())
        })?;
    }

    /// Splay jitter is deterministic per name and always lands in
    /// `[0, interval * 0.1]`.
    #[test]
    fn prop_splay_is_bounded_and_deterministic(
        name in "[a-z]{1,16}",
        interval in 1.0f64..3600.0,
    ) {
        let a = splay(&name, interval);
        let b = splay(&name, interval);
        prop_assert_eq!(a, b);
        prop_assert!(a >= 0.0);
        prop_assert!(a <= interval * 0.1);
    }
}

/// A dependency chain longer than the recursion guard is treated as
/// unreachable rather than overflowing the stack.
#[tokio::test]
async fn recursion_guard_trips_on_a_pathologically_long_chain() {
    let graph = DependencyGraph::new();
    let depth = 300u64;
    for i in 0..depth {
        graph
            .register(Dependency {
                child: ObjectId(i),
                parent: ObjectId(i + 1),
                period: None,
                state_filter: 1,
                ignore_soft_states: false,
                redundancy_group: None,
            })
            .await;
    }

    let mut states = HashMap::new();
    for i in 0..=depth {
        states.insert(ObjectId(i), (0u8, StateType::Hard));
    }
    let lookup = FixedStates(states);

    assert!(!graph.is_reachable(ObjectId(0), &lookup, 0).await, "a chain past the recursion guard must be treated as unreachable");
}
