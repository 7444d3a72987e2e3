//! SQLite-backed `ObjectStore`
//!
//! One embedded database file holding the latest snapshot (a single JSON
//! blob, replaced wholesale on every write) and the journal entries
//! appended since. Good for a single-node deployment; clustered setups
//! should point every node at its own file.

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument};

use super::{JournalEntry, ObjectStore, ObjectStoreError, ObjectStoreResult, Snapshot};

pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> ObjectStoreResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();
        info!(path = %db_path_str, "opening sqlite object store");

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(ObjectStoreError::from)?;

        debug!("running object store migrations");
        sqlx::migrate!("./migrations").run(&pool).await.map_err(ObjectStoreError::from)?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl ObjectStore for SqliteStore {
    #[instrument(skip(self, snapshot))]
    async fn write_snapshot(&self, snapshot: &Snapshot) -> ObjectStoreResult<()> {
        let data = serde_json::to_string(snapshot)
            .map_err(|e| ObjectStoreError::SerializationError(e.to_string()))?;

        let mut tx = self.pool.begin().await.map_err(ObjectStoreError::from)?;

        sqlx::query(
            r#"
            INSERT INTO snapshots (id, taken_at, data) VALUES (1, ?, ?)
            ON CONFLICT (id) DO UPDATE SET taken_at = excluded.taken_at, data = excluded.data
            "#,
        )
        .bind(snapshot.taken_at)
        .bind(data)
        .execute(&mut *tx)
        .await
        .map_err(ObjectStoreError::from)?;

        sqlx::query("DELETE FROM journal_entries")
            .execute(&mut *tx)
            .await
            .map_err(ObjectStoreError::from)?;

        tx.commit().await.map_err(ObjectStoreError::from)?;
        Ok(())
    }

    async fn append_journal(&self, entry: &JournalEntry) -> ObjectStoreResult<()> {
        let value = serde_json::to_string(&entry.value)
            .map_err(|e| ObjectStoreError::SerializationError(e.to_string()))?;

        sqlx::query(
            "INSERT INTO journal_entries (at, object_id, attribute, value) VALUES (?, ?, ?, ?)",
        )
        .bind(entry.at)
        .bind(entry.object_id.0 as i64)
        .bind(&entry.attribute)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(ObjectStoreError::from)?;

        Ok(())
    }

    async fn load_snapshot(&self) -> ObjectStoreResult<Option<Snapshot>> {
        let row = sqlx::query("SELECT data FROM snapshots WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(ObjectStoreError::from)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let data: String = row.get("data");
        let snapshot = serde_json::from_str(&data)
            .map_err(|e| ObjectStoreError::SerializationError(e.to_string()))?;
        Ok(Some(snapshot))
    }
}

