//! Error types for the ingestion pipeline.

use thiserror::Error;

/// Errors that can occur while indexing.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Database error.
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    /// Protocol-layer error.
    #[error(transparent)]
    Atproto(#[from] lantern_atproto::AtprotoError),

    /// Record JSON could not be re-encoded for storage.
    #[error("record encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// A record that should exist by construction could not be found.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// The missing-record queue has shut down.
    #[error("missing-record queue closed")]
    QueueClosed,

    /// Sync configuration problem.
    #[error("sync config error: {0}")]
    SyncConfig(String),
}

impl IndexError {
    /// Whether a database error is a unique-constraint collision, which the
    /// ingest path treats as idempotent success.
    pub fn is_unique_violation(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Database(db) => db.is_unique_violation(),
            _ => false,
        }
    }
}
