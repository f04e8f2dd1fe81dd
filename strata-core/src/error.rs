//! Error types for the persistence and migration layer

use crate::kind::EntityKind;
use crate::validate::IntegrityError;
use crate::version::SchemaVersion;

/// Result type for persistence and migration operations
pub type Result<T> = std::result::Result<T, StrataError>;

/// Errors that can occur while loading, migrating or saving local data
#[derive(Debug, thiserror::Error)]
pub enum StrataError {
    /// Fatal: the data was written by a build with a newer major schema.
    /// Nothing has been mutated; the user has to update the app.
    #[error(
        "'{kind}' was written by a newer app version (data v{loaded}, supported v{current}); \
         update the app before loading this data"
    )]
    MigrationVersionTooNew {
        kind: EntityKind,
        loaded: SchemaVersion,
        current: SchemaVersion,
    },

    /// A regular save was attempted while a full-dataset import holds the lock.
    #[error("Data import in progress, saving '{0}' is disabled")]
    ImportInProgress(EntityKind),

    /// A second import was started while one is already running.
    #[error("Another data import is already in progress")]
    ImportAlreadyRunning,

    #[error("Invalid data for '{kind}': {reason}")]
    InvalidData { kind: EntityKind, reason: String },

    /// Dataset refused before upload or import
    #[error("Invalid app data: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Gateway not loaded: call load() first")]
    NotLoaded,

    #[error("Unknown sync provider: {0}")]
    UnknownProvider(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StrataError {
    /// Errors after which retrying the same call cannot succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StrataError::MigrationVersionTooNew { .. })
    }
}

impl From<rusqlite::Error> for StrataError {
    fn from(e: rusqlite::Error) -> Self {
        StrataError::Database(e.to_string())
    }
}
