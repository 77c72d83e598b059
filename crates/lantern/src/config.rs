//! CLI configuration.

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "lantern")]
#[command(about = "Partial-index AppView scoped to one user's follow graph", long_about = None)]
pub struct Cli {
    /// Postgres connection URL.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Maximum database connections per pool. Defaults to the logical CPU
    /// count.
    #[arg(long, env = "LANTERN_MAX_DB_CONNECTIONS")]
    pub max_db_connections: Option<u32>,

    /// Handle of the principal whose follow graph scopes the index.
    #[arg(long, env = "LANTERN_HANDLE")]
    pub principal_handle: String,

    /// App password for the principal's PDS.
    #[arg(long, env = "LANTERN_PASSWORD")]
    pub principal_password: String,

    /// Path to a JSON sync config describing one or more stream backends.
    /// Defaults to a single firehose backend.
    #[arg(long, env = "LANTERN_SYNC_CONFIG")]
    pub sync_config: Option<String>,

    /// Address for the API server.
    #[arg(long, env = "LANTERN_LISTEN_ADDR", default_value = "0.0.0.0:4444")]
    pub listen_addr: String,
}

impl Cli {
    pub fn max_db_connections(&self) -> u32 {
        self.max_db_connections.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(8)
        })
    }
}
