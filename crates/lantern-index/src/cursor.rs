//! Per-stream cursor persistence.
//!
//! Cursors are keyed by the backend host string in `sequence_trackers`, so a
//! firehose and a jetstream backend can checkpoint independently.

use crate::{Db, IndexError};

/// Load the persisted cursor for a stream backend.
pub async fn load_stream_cursor(db: &Db, host: &str) -> Result<Option<i64>, IndexError> {
    Ok(
        sqlx::query_scalar("SELECT int_val FROM sequence_trackers WHERE key = $1")
            .bind(host)
            .fetch_optional(&db.hot)
            .await?,
    )
}

/// Persist the cursor for a stream backend.
pub async fn store_stream_cursor(db: &Db, host: &str, seq: i64) -> Result<(), IndexError> {
    sqlx::query(
        "INSERT INTO sequence_trackers (key, int_val) VALUES ($1, $2)
         ON CONFLICT (key) DO UPDATE SET int_val = EXCLUDED.int_val",
    )
    .bind(host)
    .bind(seq)
    .execute(&db.hot)
    .await?;
    Ok(())
}
