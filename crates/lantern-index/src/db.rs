//! Database handle: two pools over one Postgres database.
//!
//! The `crud` pool serves list queries and the rarely-hit operations; the
//! smaller `hot` pool is reserved for the ingest path's single-row upserts
//! and the count queries hydration fans out, so a burst of feed reads cannot
//! starve ingestion of connections.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::schema;
use crate::IndexError;

#[derive(Clone)]
pub struct Db {
    pub crud: PgPool,
    pub hot: PgPool,
}

impl Db {
    /// Connect both pools and bootstrap the schema.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, IndexError> {
        let crud = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        let hot = PgPoolOptions::new()
            .max_connections(max_connections.clamp(8, 32))
            .connect(database_url)
            .await?;

        sqlx::raw_sql(schema::SCHEMA).execute(&crud).await?;

        Ok(Self { crud, hot })
    }
}
