//! Object Registry (spec §4.2)
//!
//! The source models objects as a cyclic reference-counted graph
//! (checkable <-> notification <-> user, host <-> service, dependency
//! parent <-> child). Rust has no cheap equivalent, so objects live in a
//! typed arena and reference each other through [`ObjectId`] handles
//! resolved back through the owning [`Registry`] rather than through
//! owning pointers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{instrument, warn};

use crate::error::{CoreError, CoreResult};

/// Stable handle into a [`Registry`]. Cheap to copy, hash, and pass
/// across actor boundaries; resolving it back to the object it names
/// always goes through the registry that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

/// Activation lifecycle an object moves through after registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Inactive,
    Starting,
    Active,
    Paused,
    Stopping,
    Stopped,
}

struct Slot<T> {
    name: String,
    object: Arc<Mutex<T>>,
    lifecycle: Lifecycle,
}

/// A typed table of objects of one kind, keyed by [`ObjectId`] and by
/// name. One `Table<T>` per object type lives inside [`Registry`].
pub struct Table<T> {
    by_id: HashMap<ObjectId, Slot<T>>,
    by_name: HashMap<String, ObjectId>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            by_id: HashMap::new(),
            by_name: HashMap::new(),
        }
    }
}

impl<T> Table<T> {
    fn register(&mut self, id: ObjectId, kind: &str, name: String, object: T) -> CoreResult<()> {
        if self.by_name.contains_key(&name) {
            return Err(CoreError::DuplicateName {
                kind: kind.to_string(),
                name,
            });
        }
        self.by_name.insert(name.clone(), id);
        self.by_id.insert(
            id,
            Slot {
                name,
                object: Arc::new(Mutex::new(object)),
                lifecycle: Lifecycle::Inactive,
            },
        );
        Ok(())
    }

    fn get(&self, id: ObjectId) -> Option<Arc<Mutex<T>>> {
        self.by_id.get(&id).map(|slot| slot.object.clone())
    }

    fn get_by_name(&self, name: &str) -> Option<(ObjectId, Arc<Mutex<T>>)> {
        let id = *self.by_name.get(name)?;
        self.by_id.get(&id).map(|slot| (id, slot.object.clone()))
    }

    fn set_lifecycle(&mut self, id: ObjectId, lifecycle: Lifecycle) -> bool {
        match self.by_id.get_mut(&id) {
            Some(slot) => {
                slot.lifecycle = lifecycle;
                true
            }
            None => false,
        }
    }

    fn active_ids(&self) -> Vec<ObjectId> {
        self.by_id
            .iter()
            .filter(|(_, slot)| slot.lifecycle == Lifecycle::Active)
            .map(|(id, _)| *id)
            .collect()
    }

    fn all_ids(&self) -> Vec<ObjectId> {
        self.by_id.keys().copied().collect()
    }

    fn unregister(&mut self, id: ObjectId) -> Option<()> {
        let slot = self.by_id.remove(&id)?;
        self.by_name.remove(&slot.name);
        Some(())
    }
}

/// Holds one [`Table`] per object kind known to the core: hosts,
/// services, users, user groups, time periods, notification commands,
/// check commands, and cluster endpoints. Downstream crates that grow
/// new object kinds add a table here rather than threading a new map
/// through every actor constructor.
#[derive(Default)]
pub struct Registry {
    next_id: AtomicU64,
    hosts: Mutex<Table<crate::checkable::CheckableCommon>>,
    services: Mutex<Table<crate::checkable::CheckableCommon>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> ObjectId {
        ObjectId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Hand out a fresh [`ObjectId`] from the same counter hosts and
    /// services use, for object kinds (time periods, users, endpoints,
    /// notifications, check commands) that config load keeps in simpler
    /// side tables rather than a full [`Table`].
    pub fn alloc_id(&self) -> ObjectId {
        self.next_id()
    }

    #[instrument(skip(self, object))]
    pub async fn register_host(
        &self,
        name: impl Into<String>,
        object: crate::checkable::CheckableCommon,
    ) -> CoreResult<ObjectId> {
        let id = self.next_id();
        let mut table = self.hosts.lock().await;
        table.register(id, "host", name.into(), object)?;
        Ok(id)
    }

    #[instrument(skip(self, object))]
    pub async fn register_service(
        &self,
        name: impl Into<String>,
        object: crate::checkable::CheckableCommon,
    ) -> CoreResult<ObjectId> {
        let id = self.next_id();
        let mut table = self.services.lock().await;
        table.register(id, "service", name.into(), object)?;
        Ok(id)
    }

    pub async fn get_host(&self, id: ObjectId) -> Option<Arc<Mutex<crate::checkable::CheckableCommon>>> {
        self.hosts.lock().await.get(id)
    }

    pub async fn get_service(&self, id: ObjectId) -> Option<Arc<Mutex<crate::checkable::CheckableCommon>>> {
        self.services.lock().await.get(id)
    }

    pub async fn get_host_by_name(
        &self,
        name: &str,
    ) -> Option<(ObjectId, Arc<Mutex<crate::checkable::CheckableCommon>>)> {
        self.hosts.lock().await.get_by_name(name)
    }

    pub async fn get_service_by_name(
        &self,
        name: &str,
    ) -> Option<(ObjectId, Arc<Mutex<crate::checkable::CheckableCommon>>)> {
        self.services.lock().await.get_by_name(name)
    }

    pub async fn activate_host(&self, id: ObjectId) {
        if !self.hosts.lock().await.set_lifecycle(id, Lifecycle::Active) {
            warn!(id = id.0, "activate_host: unknown id");
        }
    }

    pub async fn activate_service(&self, id: ObjectId) {
        if !self.services.lock().await.set_lifecycle(id, Lifecycle::Active) {
            warn!(id = id.0, "activate_service: unknown id");
        }
    }

    pub async fn set_host_lifecycle(&self, id: ObjectId, lifecycle: Lifecycle) {
        self.hosts.lock().await.set_lifecycle(id, lifecycle);
    }

    pub async fn set_service_lifecycle(&self, id: ObjectId, lifecycle: Lifecycle) {
        self.services.lock().await.set_lifecycle(id, lifecycle);
    }

    /// All checkables (hosts and services) with lifecycle `Active`; the
    /// Scheduler only ever admits from this set (spec §4.2, §4.6).
    pub async fn active_checkables(&self) -> Vec<ObjectId> {
        let mut ids = self.hosts.lock().await.active_ids();
        ids.extend(self.services.lock().await.active_ids());
        ids
    }

    pub async fn all_host_ids(&self) -> Vec<ObjectId> {
        self.hosts.lock().await.all_ids()
    }

    pub async fn all_service_ids(&self) -> Vec<ObjectId> {
        self.services.lock().await.all_ids()
    }

    pub async fn unregister_host(&self, id: ObjectId) {
        self.hosts.lock().await.unregister(id);
    }

    pub async fn unregister_service(&self, id: ObjectId) {
        self.services.lock().await.unregister(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkable::CheckableCommon;

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let registry = Registry::new();
        registry
            .register_host("web1", CheckableCommon::new("web1", "check_ping"))
            .await
            .unwrap();

        let err = registry
            .register_host("web1", CheckableCommon::new("web1", "check_ping"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateName { .. }));
    }

    #[tokio::test]
    async fn only_active_checkables_are_returned() {
        let registry = Registry::new();
        let id = registry
            .register_host("web1", CheckableCommon::new("web1", "check_ping"))
            .await
            .unwrap();

        assert!(registry.active_checkables().await.is_empty());
        registry.activate_host(id).await;
        assert_eq!(registry.active_checkables().await, vec![id]);
    }

    #[tokio::test]
    async fn lookup_by_name_resolves_back_to_same_id() {
        let registry = Registry::new();
        let id = registry
            .register_service("web1!http", CheckableCommon::new("web1!http", "check_http"))
            .await
            .unwrap();

        let (found_id, _) = registry.get_service_by_name("web1!http").await.unwrap();
        assert_eq!(found_id, id);
    }
}
