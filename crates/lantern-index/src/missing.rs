//! Missing-record fetch queue.
//!
//! Ingestion and hydration both run into records we have not seen: reply
//! parents, quoted posts, profiles of authors we only know by reference. The
//! queue accepts an identifier (a DID for profiles, an AT-URI for posts and
//! feed generators — the type is inferred structurally), a worker resolves
//! the authority's origin host, pulls the single record, and re-enters it
//! through the record router with an empty revision.
//!
//! Callers that need the record before they can answer (the read path)
//! enqueue with `wait = true` and block on a one-shot signal that fires when
//! the fetch finishes, success or not.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use lantern_atproto::identity::IdentityDirectory;
use lantern_atproto::records::{
    FEEDGEN_COLLECTION, POST_COLLECTION, PROFILE_COLLECTION, PROFILE_RKEY,
};
use lantern_atproto::{AtUri, OpAction, RecordOp, XrpcClient};

use crate::{IndexError, Indexer};

/// Queue capacity: enough to absorb a hydration burst without backpressuring
/// the read path for long.
pub const MISSING_QUEUE_CAPACITY: usize = 1024;

/// What kind of record an identifier names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingRecordKind {
    Profile,
    Post,
    FeedGenerator,
}

impl MissingRecordKind {
    /// Infer the record type from the identifier shape.
    pub fn infer(identifier: &str) -> Self {
        if identifier.starts_with("did:") {
            return Self::Profile;
        }
        if identifier.starts_with("at://") {
            if identifier.contains(FEEDGEN_COLLECTION) {
                return Self::FeedGenerator;
            }
        }
        Self::Post
    }
}

/// A queued fetch request.
#[derive(Debug)]
pub struct MissingRecord {
    pub identifier: String,
    done: Option<oneshot::Sender<()>>,
}

/// Producer half of the queue.
#[derive(Clone)]
pub struct MissingRecordQueue {
    tx: mpsc::Sender<MissingRecord>,
}

impl MissingRecordQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MissingRecord>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Enqueue a record for fetching. With `wait = true` this blocks until
    /// the fetcher has finished with the item (whether or not the fetch
    /// succeeded).
    pub async fn track(&self, identifier: &str, wait: bool) -> Result<(), IndexError> {
        let (done_tx, done_rx) = if wait {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        self.tx
            .send(MissingRecord {
                identifier: identifier.to_string(),
                done: done_tx,
            })
            .await
            .map_err(|_| IndexError::QueueClosed)?;

        if let Some(rx) = done_rx {
            // A dropped sender still means the fetcher is done with us.
            let _ = rx.await;
        }

        Ok(())
    }
}

/// Worker that drains the queue.
pub struct MissingRecordFetcher {
    indexer: Arc<Indexer>,
    dir: Arc<dyn IdentityDirectory>,
    rx: mpsc::Receiver<MissingRecord>,
}

impl MissingRecordFetcher {
    pub fn new(
        indexer: Arc<Indexer>,
        dir: Arc<dyn IdentityDirectory>,
        rx: mpsc::Receiver<MissingRecord>,
    ) -> Self {
        Self { indexer, dir, rx }
    }

    /// Consume the queue until every producer is gone.
    pub async fn run(mut self) {
        while let Some(rec) = self.rx.recv().await {
            let kind = MissingRecordKind::infer(&rec.identifier);
            if let Err(e) = self.fetch(kind, &rec.identifier).await {
                warn!(
                    kind = ?kind,
                    identifier = %rec.identifier,
                    error = %e,
                    "failed to fetch missing record"
                );
            }
            // The waiter is released exactly once, success or failure.
            if let Some(done) = rec.done {
                let _ = done.send(());
            }
        }
        info!("missing-record fetcher shutting down");
    }

    async fn fetch(&self, kind: MissingRecordKind, identifier: &str) -> Result<(), IndexError> {
        match kind {
            MissingRecordKind::Profile => self.fetch_profile(identifier).await,
            MissingRecordKind::Post => self.fetch_record(identifier, POST_COLLECTION).await,
            MissingRecordKind::FeedGenerator => {
                self.fetch_record(identifier, FEEDGEN_COLLECTION).await
            }
        }
    }

    async fn fetch_profile(&self, did: &str) -> Result<(), IndexError> {
        // Touching a new DID grows the relevance set.
        self.indexer.relevance().add(did);

        let ident = self.dir.lookup_did(did).await?;
        let client = XrpcClient::new(&ident.pds)?;
        let rec = client
            .get_record(did, PROFILE_COLLECTION, PROFILE_RKEY)
            .await?;

        let op = RecordOp {
            action: OpAction::Update,
            collection: PROFILE_COLLECTION.to_string(),
            rkey: PROFILE_RKEY.to_string(),
            cid: rec.cid,
            record: Some(rec.value),
        };
        self.indexer.handle_op(did, "", &op).await
    }

    async fn fetch_record(&self, uri: &str, expect_collection: &str) -> Result<(), IndexError> {
        let puri = AtUri::parse(uri)?;
        let did = puri.authority.as_str();

        self.indexer.relevance().add(did);

        let ident = self.dir.lookup_did(did).await?;
        let client = XrpcClient::new(&ident.pds)?;
        let rec = client
            .get_record(did, &puri.collection, &puri.rkey)
            .await?;

        if puri.collection != expect_collection {
            warn!(uri = %uri, expected = %expect_collection, "fetched record collection differs from inferred kind");
        }

        let op = RecordOp {
            action: OpAction::Create,
            collection: puri.collection.clone(),
            rkey: puri.rkey.clone(),
            cid: rec.cid,
            record: Some(rec.value),
        };
        self.indexer.handle_op(did, "", &op).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_profile() {
        assert_eq!(
            MissingRecordKind::infer("did:plc:abc123"),
            MissingRecordKind::Profile
        );
        assert_eq!(
            MissingRecordKind::infer("did:web:example.com"),
            MissingRecordKind::Profile
        );
    }

    #[test]
    fn test_infer_post() {
        assert_eq!(
            MissingRecordKind::infer("at://did:plc:abc/app.bsky.feed.post/3xyz"),
            MissingRecordKind::Post
        );
    }

    #[test]
    fn test_infer_feed_generator() {
        assert_eq!(
            MissingRecordKind::infer("at://did:plc:abc/app.bsky.feed.generator/cool-feed"),
            MissingRecordKind::FeedGenerator
        );
    }

    #[test]
    fn test_infer_defaults_to_post() {
        assert_eq!(
            MissingRecordKind::infer("at://did:plc:abc/app.bsky.graph.list/3xyz"),
            MissingRecordKind::Post
        );
    }

    #[tokio::test]
    async fn test_track_without_wait_does_not_block() {
        let (queue, mut rx) = MissingRecordQueue::new(4);
        queue
            .track("at://did:plc:abc/app.bsky.feed.post/3xyz", false)
            .await
            .unwrap();
        let rec = rx.recv().await.unwrap();
        assert_eq!(rec.identifier, "at://did:plc:abc/app.bsky.feed.post/3xyz");
        assert!(rec.done.is_none());
    }

    #[tokio::test]
    async fn test_track_with_wait_blocks_until_signal() {
        let (queue, mut rx) = MissingRecordQueue::new(4);

        let consumer = tokio::spawn(async move {
            let rec = rx.recv().await.unwrap();
            assert!(rec.done.is_some());
            if let Some(done) = rec.done {
                done.send(()).unwrap();
            }
        });

        queue.track("did:plc:abc", true).await.unwrap();
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn test_track_with_wait_releases_on_dropped_signal() {
        let (queue, mut rx) = MissingRecordQueue::new(4);

        let consumer = tokio::spawn(async move {
            let rec = rx.recv().await.unwrap();
            drop(rec); // worker died before signalling
        });

        // Must not hang.
        queue.track("did:plc:abc", true).await.unwrap();
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn test_track_on_closed_queue_errors() {
        let (queue, rx) = MissingRecordQueue::new(4);
        drop(rx);
        let result = queue.track("did:plc:abc", false).await;
        assert!(matches!(result, Err(IndexError::QueueClosed)));
    }
}
