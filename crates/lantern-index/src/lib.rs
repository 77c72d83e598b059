//! Selective ingestion pipeline.
//!
//! This crate owns everything between the upstream event stream and the
//! relational tables:
//!
//! - **Db**: two connection pools over one Postgres database plus schema
//!   bootstrap
//! - **RepoRegistry**: DID ↔ internal id mapping with concurrent
//!   create-or-load
//! - **RelevanceSet**: the DIDs whose activity we index
//! - **RevGuard**: per-repo monotonic revision tracking
//! - **Indexer**: the record router and per-collection handlers
//! - **Missing records**: typed fetch queue that re-enters the router
//! - **NotificationStore**: the principal's notification ledger
//! - **Sync engine**: websocket tails with cursor persistence, liveness
//!   watchdog, reconnect backoff and a repo-partitioned scheduler

pub mod bootstrap;
mod cursor;
mod db;
mod error;
mod indexer;
pub mod missing;
pub mod models;
mod notifications;
mod relevance;
mod repos;
mod rev;
pub mod schema;
pub mod sync;

pub use cursor::{load_stream_cursor, store_stream_cursor};
pub use db::Db;
pub use error::IndexError;
pub use indexer::{Indexer, PostInfo};
pub use missing::{MissingRecord, MissingRecordFetcher, MissingRecordQueue, MissingRecordKind};
pub use notifications::{NotifKind, NotificationStore};
pub use relevance::RelevanceSet;
pub use repos::{RepoRegistry, DEFAULT_REPO_CACHE_CAPACITY};
pub use rev::{RevGuard, DEFAULT_REV_CACHE_CAPACITY};
