use gnode_shared::{LifecycleState, LocalId};
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// Illegal lifecycle change requested for an entity.
    #[error("Entity {local_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        local_id: LocalId,
        from: LifecycleState,
        to: LifecycleState,
    },

    /// A unique constraint rejected the write (e.g. duplicate username).
    #[error("Duplicate record: {0}")]
    Duplicate(String),

    /// Input rejected before reaching SQL (bad selection, empty name).
    #[error("Invalid input: {0}")]
    Invalid(String),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// UUID parsing error.
    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),

    /// Payload column could not be decoded.
    #[error("Payload error: {0}")]
    Json(#[from] serde_json::Error),

    /// Chrono parsing error.
    #[error("Timestamp parse error: {0}")]
    ChronoParse(#[from] chrono::ParseError),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
