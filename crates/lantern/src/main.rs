//! lantern: a partial-index AppView scoped to one user's follow graph.
//!
//! Startup order matters: schema bootstrap, principal login, relevance
//! bootstrap from the principal's follows, then the API server and the sync
//! engine. Shutdown drains in-flight handlers and flushes stream cursors.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use miette::{miette, IntoDiagnostic, Result};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use lantern_api::AppState;
use lantern_atproto::identity::{CachedDirectory, HttpDirectory, IdentityDirectory, DEFAULT_PLC_HOST};
use lantern_atproto::XrpcClient;
use lantern_index::sync::{SyncConfig, SyncEngine};
use lantern_index::{
    bootstrap, missing::MISSING_QUEUE_CAPACITY, Db, Indexer, MissingRecordFetcher,
    MissingRecordQueue, NotificationStore, RelevanceSet, RepoRegistry, RevGuard,
    DEFAULT_REPO_CACHE_CAPACITY, DEFAULT_REV_CACHE_CAPACITY,
};

mod config;

use config::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "lantern=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    run(cli).await
}

async fn run(cli: Cli) -> Result<()> {
    let db = Db::connect(&cli.database_url, cli.max_db_connections())
        .await
        .map_err(|e| miette!("failed to set up database: {e}"))?;

    let dir: Arc<dyn IdentityDirectory> = Arc::new(CachedDirectory::new(
        HttpDirectory::new(DEFAULT_PLC_HOST).map_err(|e| miette!("{e}"))?,
        100_000,
        Duration::from_secs(600),
    ));

    // Resolve the principal and log in to their PDS.
    let ident = dir
        .lookup_handle(&cli.principal_handle)
        .await
        .map_err(|e| miette!("failed to resolve principal handle: {e}"))?;
    let principal_did = ident.did.clone();

    let client = Arc::new(XrpcClient::new(&ident.pds).map_err(|e| miette!("{e}"))?);
    client
        .login(&cli.principal_handle, &cli.principal_password)
        .await
        .map_err(|e| miette!("failed to log in to principal PDS: {e}"))?;

    info!(did = %principal_did, pds = %ident.pds, "authenticated as principal");

    // Assemble the indexer.
    let (missing_queue, missing_rx) = MissingRecordQueue::new(MISSING_QUEUE_CAPACITY);
    let repos = RepoRegistry::new(db.clone(), DEFAULT_REPO_CACHE_CAPACITY);
    let principal_repo = repos
        .get_or_create(&principal_did)
        .await
        .map_err(|e| miette!("failed to get repo record for our own did: {e}"))?;

    let indexer = Arc::new(Indexer::new(
        db.clone(),
        repos,
        RelevanceSet::new(),
        RevGuard::new(db.clone(), DEFAULT_REV_CACHE_CAPACITY),
        NotificationStore::new(db.clone()),
        missing_queue,
        principal_repo,
    ));

    tokio::spawn(
        MissingRecordFetcher::new(Arc::clone(&indexer), Arc::clone(&dir), missing_rx).run(),
    );

    bootstrap::load_relevant_dids(&indexer, &client, &principal_did)
        .await
        .map_err(|e| miette!("failed to load relevant dids set: {e}"))?;

    // Sync configuration: a JSON file, or a single firehose backend.
    let sync_config = match &cli.sync_config {
        Some(path) => {
            let raw = std::fs::read_to_string(path).into_diagnostic()?;
            serde_json::from_str::<SyncConfig>(&raw).into_diagnostic()?
        }
        None => SyncConfig::default(),
    };

    let engine = SyncEngine::new(Arc::clone(&indexer), db.clone());

    // API server.
    let state = AppState::new(
        Arc::clone(&indexer),
        Arc::clone(&dir),
        Arc::clone(&client),
        engine.ingest_seq_handle(),
    );
    let router = lantern_api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&cli.listen_addr)
        .await
        .into_diagnostic()?;
    info!(addr = %cli.listen_addr, "API server listening");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = %e, "API server exited");
        }
    });

    // Shutdown on ctrl-c: consumers close their sockets, drain in-flight
    // handlers and flush cursors.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    engine
        .run(sync_config, shutdown_rx)
        .await
        .map_err(|e| miette!("sync engine failed: {e}"))?;

    Ok(())
}
