//! Shared server state.

use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use lantern_atproto::identity::IdentityDirectory;
use lantern_atproto::XrpcClient;
use lantern_index::Indexer;

use crate::hydration::Hydrator;

pub struct AppState {
    pub indexer: Arc<Indexer>,
    pub dir: Arc<dyn IdentityDirectory>,
    /// Authenticated client against the principal's PDS, used by the write
    /// proxy.
    pub client: Arc<XrpcClient>,
    pub hydrator: Arc<Hydrator>,
    /// Highest sequence number seen on ingest, for `/debug`.
    pub ingest_seq: Arc<AtomicI64>,
}

impl AppState {
    pub fn new(
        indexer: Arc<Indexer>,
        dir: Arc<dyn IdentityDirectory>,
        client: Arc<XrpcClient>,
        ingest_seq: Arc<AtomicI64>,
    ) -> Arc<Self> {
        let hydrator = Arc::new(Hydrator::new(Arc::clone(&indexer), Arc::clone(&dir)));
        Arc::new(Self {
            indexer,
            dir,
            client,
            hydrator,
            ingest_seq,
        })
    }
}
