//! Dependency Graph (spec §4.4)
//!
//! Each checkable carries a forward-edge list of [`GroupKey`]s it belongs
//! to. A single process-wide [`DependencyGraph`] owns every
//! [`DependencyGroup`], keyed so that dependencies sharing a named
//! redundancy group land in the same group object (true OR-semantics
//! across that group's members) while unnamed ("plain") dependencies each
//! get their own private group, so a checkable's overall reachability —
//! the AND across every group it belongs to — falls out of "every group
//! this child is in must be Ok".
//!
//! A named group's key is `(name, sorted multiset of member composite
//! keys)`, mirroring `DependencyGroup::RefreshRegistry`/`GetCompositeKey`
//! in the original: two children sharing a redundancy group name only
//! share one group object while their composite-key sets are identical.
//! As soon as one child's edge set diverges (an extra dependency, a
//! different check period, ...), `register`/`unregister` split it into
//! its own group; if two children's sets later become equal again they
//! merge back into one. This directly changes `registry_size()`, not
//! just internal bookkeeping.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::warn;

use crate::checkable::StateType;
use crate::registry::ObjectId;

/// Bitmask of the checkable states a dependency treats as "parent OK".
/// Bit `n` set means raw state `n` satisfies the dependency.
pub type StateFilter = u32;

pub const MAX_DEPENDENCY_RECURSION: u32 = 256;

/// Everything about a dependency that determines its availability,
/// independent of which child declared it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompositeKey {
    pub parent: ObjectId,
    pub period: Option<ObjectId>,
    pub state_filter: StateFilter,
    pub ignore_soft_states: bool,
}

#[derive(Debug, Clone)]
pub struct Dependency {
    pub child: ObjectId,
    pub parent: ObjectId,
    pub period: Option<ObjectId>,
    pub state_filter: StateFilter,
    pub ignore_soft_states: bool,
    /// `None` for a plain (non-redundant) dependency.
    pub redundancy_group: Option<String>,
}

impl Dependency {
    pub fn composite_key(&self) -> CompositeKey {
        CompositeKey {
            parent: self.parent,
            period: self.period,
            state_filter: self.state_filter,
            ignore_soft_states: self.ignore_soft_states,
        }
    }

    fn is_available(&self, parent_raw_state: u8, parent_state_type: StateType) -> bool {
        if self.ignore_soft_states && parent_state_type == StateType::Soft {
            return true;
        }
        self.state_filter & (1 << parent_raw_state) != 0
    }
}

/// Key a group is looked up by: named redundancy groups share one entry
/// per `(name, sorted composite keys of every member)` so two children
/// only share a group object while their edge sets are actually
/// identical; plain dependencies get one private entry per (child,
/// composite key) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum GroupKey {
    Named(String, Vec<CompositeKey>),
    Private(ObjectId, CompositeKey),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupState {
    Ok,
    Failed,
    Unreachable,
}

#[derive(Default)]
struct DependencyGroup {
    redundancy_group_name: Option<String>,
    members: Vec<Dependency>,
}

impl DependencyGroup {
    fn is_redundancy_group(&self) -> bool {
        self.redundancy_group_name.is_some()
    }

    fn dependencies_for_child(&self, child: ObjectId) -> Vec<&Dependency> {
        self.members.iter().filter(|d| d.child == child).collect()
    }
}

/// Something that can answer "what is this checkable's current raw state
/// and state type" — implemented by whatever holds the registry at the
/// call site, keeping this module free of locking concerns beyond its
/// own registry mutex.
pub trait StateLookup {
    fn state_of(&self, id: ObjectId) -> Option<(u8, StateType)>;
}

/// Process-wide dependency group registry (spec §5 "Dependency registry
/// lock": a single mutex covers Register/Unregister/GetRegistrySize).
#[derive(Default)]
pub struct DependencyGraph {
    groups: Mutex<HashMap<GroupKey, DependencyGroup>>,
    /// Forward edges: child -> group keys it belongs to.
    child_groups: Mutex<HashMap<ObjectId, Vec<GroupKey>>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `Named(name, _)` key `child` currently sits under for
    /// `name`, if any. A child belongs to at most one group per name.
    fn named_key_for_child(child_groups: &HashMap<ObjectId, Vec<GroupKey>>, child: ObjectId, name: &str) -> Option<GroupKey> {
        child_groups.get(&child)?.iter().find(|k| matches!(k, GroupKey::Named(n, _) if n == name)).cloned()
    }

    fn sorted_keys(members: &[Dependency]) -> Vec<CompositeKey> {
        let mut keys: Vec<CompositeKey> = members.iter().map(Dependency::composite_key).collect();
        keys.sort();
        keys
    }

    /// Register `dep`. Plain dependencies get their own private group;
    /// named dependencies recompute the child's full composite-key set
    /// for that name and place it in the (possibly new) group object
    /// matching that set, splitting off from whatever group the child
    /// was in before.
    pub async fn register(&self, dep: Dependency) {
        let child = dep.child;

        let Some(name) = dep.redundancy_group.clone() else {
            let key = GroupKey::Private(child, dep.composite_key());
            let mut groups = self.groups.lock().await;
            let group = groups.entry(key.clone()).or_insert_with(|| DependencyGroup { redundancy_group_name: None, members: Vec::new() });
            group.members.push(dep);
            drop(groups);

            let mut child_groups = self.child_groups.lock().await;
            let edges = child_groups.entry(child).or_default();
            if !edges.contains(&key) {
                edges.push(key);
            }
            return;
        };

        let mut groups = self.groups.lock().await;
        let mut child_groups = self.child_groups.lock().await;

        let mut members = Self::detach_child_from_named_group(&mut groups, &mut child_groups, child, &name);
        members.push(dep);

        let new_key = GroupKey::Named(name.clone(), Self::sorted_keys(&members));
        let group = groups.entry(new_key.clone()).or_insert_with(|| DependencyGroup { redundancy_group_name: Some(name), members: Vec::new() });
        group.members.extend(members);

        let edges = child_groups.entry(child).or_default();
        if !edges.contains(&new_key) {
            edges.push(new_key);
        }
    }

    /// Removes every member dependency `child` has in the named group
    /// `name` from its current group object (deleting that object if no
    /// other child is left in it), detaches the forward edge, and
    /// returns the removed members so the caller can re-key and
    /// reinsert them.
    fn detach_child_from_named_group(
        groups: &mut HashMap<GroupKey, DependencyGroup>,
        child_groups: &mut HashMap<ObjectId, Vec<GroupKey>>,
        child: ObjectId,
        name: &str,
    ) -> Vec<Dependency> {
        let Some(old_key) = Self::named_key_for_child(child_groups, child, name) else {
            return Vec::new();
        };

        let mut mine = Vec::new();
        if let Some(group) = groups.get_mut(&old_key) {
            let (this_child, rest) = std::mem::take(&mut group.members).into_iter().partition(|m: &Dependency| m.child == child);
            group.members = rest;
            mine = this_child;
            if group.members.is_empty() {
                groups.remove(&old_key);
            }
        }

        if let Some(edges) = child_groups.get_mut(&child) {
            edges.retain(|k| k != &old_key);
        }

        mine
    }

    /// Unregister `dep`, detaching the child from its group once no
    /// member dependencies for that child remain, and (for named
    /// groups) re-keying the child's remaining members if its
    /// composite-key set changed.
    pub async fn unregister(&self, dep: &Dependency) {
        let child = dep.child;

        let Some(name) = dep.redundancy_group.clone() else {
            let key = GroupKey::Private(child, dep.composite_key());
            let mut groups = self.groups.lock().await;
            let mut now_empty_for_child = false;
            if let Some(group) = groups.get_mut(&key) {
                if let Some(pos) = group.members.iter().position(|m| m.child == child && m.composite_key() == dep.composite_key()) {
                    group.members.remove(pos);
                }
                now_empty_for_child = !group.members.iter().any(|m| m.child == child);
                if group.members.is_empty() {
                    groups.remove(&key);
                }
            }
            drop(groups);

            if now_empty_for_child {
                let mut child_groups = self.child_groups.lock().await;
                if let Some(edges) = child_groups.get_mut(&child) {
                    edges.retain(|k| k != &key);
                }
            }
            return;
        };

        let mut groups = self.groups.lock().await;
        let mut child_groups = self.child_groups.lock().await;

        let mut remaining = Self::detach_child_from_named_group(&mut groups, &mut child_groups, child, &name);
        remaining.retain(|m| m.composite_key() != dep.composite_key());

        if remaining.is_empty() {
            return;
        }

        let new_key = GroupKey::Named(name.clone(), Self::sorted_keys(&remaining));
        let group = groups.entry(new_key.clone()).or_insert_with(|| DependencyGroup { redundancy_group_name: Some(name), members: Vec::new() });
        group.members.extend(remaining);

        let edges = child_groups.entry(child).or_default();
        if !edges.contains(&new_key) {
            edges.push(new_key);
        }
    }

    pub async fn registry_size(&self) -> usize {
        self.groups.lock().await.len()
    }

    /// spec §4.4 `GroupState`: Ok/Failed/Unreachable for one (group,
    /// child) pair, given already-resolved reachability of each member's
    /// parent (the caller recurses via [`DependencyGraph::is_reachable`]).
    fn group_state(
        group: &DependencyGroup,
        child: ObjectId,
        lookup: &impl StateLookup,
        parent_reachable: impl Fn(ObjectId) -> bool,
    ) -> GroupState {
        let dependencies = group.dependencies_for_child(child);
        let mut reachable = 0usize;
        let mut available = 0usize;

        for dep in &dependencies {
            if parent_reachable(dep.parent) {
                reachable += 1;
                if let Some((state, state_type)) = lookup.state_of(dep.parent) {
                    if dep.is_available(state, state_type) {
                        available += 1;
                    }
                }
            }
        }

        if group.is_redundancy_group() {
            if reachable == 0 {
                GroupState::Unreachable
            } else if available == 0 {
                GroupState::Failed
            } else {
                GroupState::Ok
            }
        } else if reachable < dependencies.len() {
            GroupState::Unreachable
        } else if available < dependencies.len() {
            GroupState::Failed
        } else {
            GroupState::Ok
        }
    }

    /// spec §4.4 `IsReachable`, recursing through parent dependencies
    /// with a 256-deep cycle guard.
    pub async fn is_reachable(&self, checkable: ObjectId, lookup: &impl StateLookup, depth: u32) -> bool {
        if depth > MAX_DEPENDENCY_RECURSION {
            warn!(checkable = checkable.0, depth, "dependency recursion guard tripped; marking unreachable");
            return false;
        }

        let keys = {
            let child_groups = self.child_groups.lock().await;
            child_groups.get(&checkable).cloned().unwrap_or_default()
        };

        for key in keys {
            let groups = self.groups.lock().await;
            let Some(group) = groups.get(&key) else { continue };
            let members: Vec<Dependency> = group.dependencies_for_child(checkable).into_iter().cloned().collect();
            drop(groups);

            let mut reachable_cache = HashMap::new();
            for dep in &members {
                if !reachable_cache.contains_key(&dep.parent) {
                    let r = Box::pin(self.is_reachable(dep.parent, lookup, depth + 1)).await;
                    reachable_cache.insert(dep.parent, r);
                }
            }

            let groups = self.groups.lock().await;
            let Some(group) = groups.get(&key) else { continue };
            let state = Self::group_state(group, checkable, lookup, |p| {
                reachable_cache.get(&p).copied().unwrap_or(false)
            });
            drop(groups);

            if state != GroupState::Ok {
                return false;
            }
        }

        true
    }
}

/// A service's implicit dependency on its own host (spec §4.4: "a
/// hard-Down host makes every service on it unreachable"). The caller
/// registering a service is responsible for also registering this.
pub fn implicit_host_dependency(service: ObjectId, host: ObjectId) -> Dependency {
    Dependency {
        child: service,
        parent: host,
        period: None,
        state_filter: 1 << crate::checkable::STATE_OK_OR_UP,
        ignore_soft_states: false,
        redundancy_group: None,
    }
}
