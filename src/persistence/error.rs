//! Error types for object store operations

use std::fmt;

/// Result type alias for object store operations
pub type ObjectStoreResult<T> = Result<T, ObjectStoreError>;

/// Errors that can occur while snapshotting or replaying registry state
#[derive(Debug)]
pub enum ObjectStoreError {
    /// Connecting to the backing store failed
    ConnectionFailed(String),

    /// A read or write against the store failed
    QueryFailed(String),

    /// Schema migration failed
    MigrationFailed(String),

    /// Invalid store configuration
    InvalidConfig(String),

    /// Snapshot or journal entry serialization/deserialization error
    SerializationError(String),

    /// Backend-specific error not covered by the other variants
    BackendError(String),

    /// I/O error (file access, etc.)
    IoError(std::io::Error),

    /// The backend failed its health check
    UnhealthyBackend(String),
}

impl fmt::Display for ObjectStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectStoreError::ConnectionFailed(msg) => {
                write!(f, "failed to connect to object store: {}", msg)
            }
            ObjectStoreError::QueryFailed(msg) => write!(f, "object store operation failed: {}", msg),
            ObjectStoreError::MigrationFailed(msg) => write!(f, "object store migration failed: {}", msg),
            ObjectStoreError::InvalidConfig(msg) => write!(f, "invalid object store configuration: {}", msg),
            ObjectStoreError::SerializationError(msg) => {
                write!(f, "snapshot serialization error: {}", msg)
            }
            ObjectStoreError::BackendError(msg) => write!(f, "object store backend error: {}", msg),
            ObjectStoreError::IoError(err) => write!(f, "I/O error: {}", err),
            ObjectStoreError::UnhealthyBackend(msg) => write!(f, "object store backend unhealthy: {}", msg),
        }
    }
}

impl std::error::Error for ObjectStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ObjectStoreError::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ObjectStoreError {
    fn from(err: std::io::Error) -> Self {
        ObjectStoreError::IoError(err)
    }
}

#[cfg(feature = "storage-sqlite")]
impl From<sqlx::Error> for ObjectStoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(io_err) => ObjectStoreError::IoError(io_err),
            sqlx::Error::RowNotFound => ObjectStoreError::QueryFailed("no rows found".to_string()),
            _ => ObjectStoreError::QueryFailed(err.to_string()),
        }
    }
}

#[cfg(feature = "storage-sqlite")]
impl From<sqlx::migrate::MigrateError> for ObjectStoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        ObjectStoreError::MigrationFailed(err.to_string())
    }
}
