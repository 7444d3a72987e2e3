//! In-memory `ObjectStore` (no persistence)
//!
//! Keeps the latest snapshot and the journal entries appended after it in
//! process memory. Used by tests and as the default when no concrete
//! store is configured.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{JournalEntry, ObjectStore, ObjectStoreResult, Snapshot};

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    snapshot: Option<Snapshot>,
    journal: Vec<JournalEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn write_snapshot(&self, snapshot: &Snapshot) -> ObjectStoreResult<()> {
        debug!(hosts = snapshot.hosts.len(), services = snapshot.services.len(), "writing snapshot");
        let mut state = self.state.lock().await;
        state.snapshot = Some(snapshot.clone());
        state.journal.clear();
        Ok(())
    }

    async fn append_journal(&self, entry: &JournalEntry) -> ObjectStoreResult<()> {
        self.state.lock().await.journal.push(entry.clone());
        Ok(())
    }

    async fn load_snapshot(&self) -> ObjectStoreResult<Option<Snapshot>> {
        Ok(self.state.lock().await.snapshot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_snapshot() {
        let store = MemoryStore::new();
        assert!(store.load_snapshot().await.unwrap().is_none());

        let snapshot = Snapshot {
            taken_at: 100.0,
            ..Default::default()
        };
        store.write_snapshot(&snapshot).await.unwrap();

        let loaded = store.load_snapshot().await.unwrap().unwrap();
        assert_eq!(loaded.taken_at, 100.0);
    }

    #[tokio::test]
    async fn journal_entries_are_cleared_by_the_next_snapshot() {
        let store = MemoryStore::new();
        store
            .append_journal(&JournalEntry {
                at: 1.0,
                object_id: crate::registry::ObjectId(1),
                attribute: "raw_state".to_string(),
                value: serde_json::json!(2),
            })
            .await
            .unwrap();

        store.write_snapshot(&Snapshot::default()).await.unwrap();
        assert!(store.state.lock().await.journal.is_empty());
    }
}
