//! `SqliteStore` round-trips a snapshot and its journal through a real
//! on-disk database file.

use guardia_core::checkable::CheckableCommon;
use guardia_core::persistence::sqlite::SqliteStore;
use guardia_core::persistence::{JournalEntry, ObjectStore, Snapshot};
use guardia_core::registry::ObjectId;

#[tokio::test]
async fn snapshot_and_journal_survive_a_round_trip() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let db_path = dir.path().join("guardia.sqlite");
    let store = SqliteStore::new(&db_path).await.expect("failed to open sqlite store");

    assert!(store.load_snapshot().await.unwrap().is_none(), "a fresh store has no snapshot yet");

    let host_id = ObjectId(1);
    let snapshot = Snapshot {
        taken_at: 12345.0,
        hosts: vec![(host_id, CheckableCommon::new("h1", "check_dummy"))],
        services: Vec::new(),
    };
    store.write_snapshot(&snapshot).await.unwrap();

    let loaded = store.load_snapshot().await.unwrap().expect("snapshot should round-trip");
    assert_eq!(loaded.taken_at, 12345.0);
    assert_eq!(loaded.hosts.len(), 1);
    assert_eq!(loaded.hosts[0].1.name, "h1");

    store
        .append_journal(&JournalEntry {
            at: 12346.0,
            object_id: host_id,
            attribute: "raw_state".to_string(),
            value: serde_json::json!(1),
        })
        .await
        .unwrap();

    // `write_snapshot` clears the journal once its contents are folded
    // into the new snapshot baseline.
    store.write_snapshot(&snapshot).await.unwrap();
    let loaded_again = store.load_snapshot().await.unwrap().expect("snapshot should still be present");
    assert_eq!(loaded_again.taken_at, 12345.0);
}
