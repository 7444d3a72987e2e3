//! Persisted state (spec §4.11, ADDED)
//!
//! `Registry` itself is in-memory only. The `ObjectStore` trait abstracts
//! over where a periodic snapshot of every active object, plus the
//! modified-attribute journal recorded between snapshots, actually lands.
//! The trait stays storage-agnostic; atomic (temp-file + rename) writes
//! are a property of a concrete file-backed implementation, not of the
//! trait itself.

pub mod error;
pub mod memory;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use error::{ObjectStoreError, ObjectStoreResult};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::checkable::CheckableCommon;
use crate::registry::ObjectId;

/// One point-in-time dump of every active checkable.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Snapshot {
    pub taken_at: f64,
    pub hosts: Vec<(ObjectId, CheckableCommon)>,
    pub services: Vec<(ObjectId, CheckableCommon)>,
}

/// One modified-attribute record appended between snapshots and replayed
/// on top of the last snapshot at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub at: f64,
    pub object_id: ObjectId,
    pub attribute: String,
    pub value: serde_json::Value,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn write_snapshot(&self, snapshot: &Snapshot) -> ObjectStoreResult<()>;
    async fn append_journal(&self, entry: &JournalEntry) -> ObjectStoreResult<()>;
    async fn load_snapshot(&self) -> ObjectStoreResult<Option<Snapshot>>;
}
