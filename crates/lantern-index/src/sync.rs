//! The sync engine: websocket tails feeding a repo-partitioned scheduler.
//!
//! One consumer task per configured backend. Each consumer recovers its
//! cursor from `sequence_trackers`, connects, and feeds commits into a
//! scheduler that partitions events by repo DID so ops for the same repo are
//! applied in order by a single worker. A liveness watchdog closes
//! connections that go quiet; the outer loop reconnects from the persisted
//! cursor with a linear backoff that resets once a connection has held for a
//! few seconds.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info, warn};

use lantern_atproto::firehose::{decode_frame, FirehoseMessage};
use lantern_atproto::jetstream::JetstreamEvent;
use lantern_atproto::CommitEvent;

use crate::cursor::{load_stream_cursor, store_stream_cursor};
use crate::{Db, IndexError, Indexer};

/// Default parallel scheduler sizing.
pub const DEFAULT_MAX_WORKERS: usize = 10;
pub const DEFAULT_QUEUE_SIZE: usize = 20;

/// How long a connection must hold before the failure counter resets.
const FAILURE_RESET_INTERVAL: Duration = Duration::from_secs(5);

/// Liveness watchdog: close the connection if no event arrives for this long.
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Persist the cursor every this many events.
const CURSOR_CHECKPOINT_INTERVAL: i64 = 1000;

/// Backoff after a quick connection failure.
pub fn delay_for_failure_count(failures: u32) -> Duration {
    let secs = (5 + 2 * failures as u64).min(30);
    Duration::from_secs(secs)
}

/// Sync backend configuration, loadable from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    pub backends: Vec<SyncBackend>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backends: vec![SyncBackend {
                kind: BackendType::Firehose,
                host: "bsky.network".to_string(),
                max_workers: None,
            }],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncBackend {
    #[serde(rename = "type")]
    pub kind: BackendType,
    pub host: String,
    #[serde(default)]
    pub max_workers: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Firehose,
    Jetstream,
}

// =============================================================================
// Partitioned scheduler
// =============================================================================

/// Delivers all events for the same repo to the same worker, which makes the
/// revision guard race-free without per-repo locking in the ingest path.
pub struct PartitionedScheduler {
    senders: Vec<mpsc::Sender<CommitEvent>>,
    failed: Arc<AtomicBool>,
}

impl PartitionedScheduler {
    pub fn new(indexer: Arc<Indexer>, workers: usize, queue_size: usize) -> Self {
        let workers = workers.max(1);
        let failed = Arc::new(AtomicBool::new(false));
        let mut senders = Vec::with_capacity(workers);

        for worker_id in 0..workers {
            let (tx, mut rx) = mpsc::channel::<CommitEvent>(queue_size.max(1));
            let indexer = Arc::clone(&indexer);
            let failed = Arc::clone(&failed);
            tokio::spawn(async move {
                while let Some(evt) = rx.recv().await {
                    // One retry for transient storage errors; a second
                    // failure poisons the connection so the outer loop
                    // reconnects and replays from the cursor.
                    if let Err(first) = indexer.handle_event(&evt).await {
                        warn!(worker = worker_id, did = %evt.did, error = %first, "event handler failed, retrying");
                        if let Err(second) = indexer.handle_event(&evt).await {
                            error!(worker = worker_id, did = %evt.did, error = %second, "event handler failed twice");
                            failed.store(true, Ordering::SeqCst);
                        }
                    }
                }
            });
            senders.push(tx);
        }

        Self { senders, failed }
    }

    /// Hand an event to its repo's worker.
    pub async fn submit(&self, evt: CommitEvent) -> Result<(), IndexError> {
        let mut hasher = DefaultHasher::new();
        evt.did.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.senders.len();
        self.senders[idx]
            .send(evt)
            .await
            .map_err(|_| IndexError::QueueClosed)
    }

    /// Whether a worker has hit a persistent failure.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Sync engine
// =============================================================================

pub struct SyncEngine {
    indexer: Arc<Indexer>,
    db: Db,
    /// Highest sequence number seen on ingest, exposed for debugging.
    ingest_seq: Arc<AtomicI64>,
}

impl SyncEngine {
    pub fn new(indexer: Arc<Indexer>, db: Db) -> Self {
        Self {
            indexer,
            db,
            ingest_seq: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn ingest_seq_handle(&self) -> Arc<AtomicI64> {
        Arc::clone(&self.ingest_seq)
    }

    /// Run all configured backends until shutdown.
    pub async fn run(
        &self,
        config: SyncConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), IndexError> {
        if config.backends.is_empty() {
            return Err(IndexError::SyncConfig("no sync backends configured".into()));
        }

        let mut handles = Vec::new();
        for backend in config.backends {
            let indexer = Arc::clone(&self.indexer);
            let db = self.db.clone();
            let ingest_seq = Arc::clone(&self.ingest_seq);
            let shutdown = shutdown.clone();
            let handle = tokio::spawn(async move {
                match backend.kind {
                    BackendType::Firehose => {
                        run_firehose(indexer, db, ingest_seq, backend, shutdown).await
                    }
                    BackendType::Jetstream => {
                        run_jetstream(indexer, db, ingest_seq, backend, shutdown).await
                    }
                }
            });
            handles.push(handle);
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "sync backend task panicked");
            }
        }
        Ok(())
    }
}

async fn run_firehose(
    indexer: Arc<Indexer>,
    db: Db,
    ingest_seq: Arc<AtomicI64>,
    backend: SyncBackend,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures: u32 = 0;
    loop {
        if *shutdown.borrow() {
            info!(host = %backend.host, "firehose consumer shutting down");
            return;
        }

        let started = Instant::now();
        let result = firehose_tail(
            &indexer,
            &db,
            &ingest_seq,
            &backend,
            &mut shutdown,
        )
        .await;

        match result {
            Ok(()) => {
                // Clean shutdown.
                return;
            }
            Err(e) => {
                error!(host = %backend.host, error = %e, "firehose connection lost");
            }
        }

        if started.elapsed() > FAILURE_RESET_INTERVAL {
            failures = 0;
            continue;
        }
        failures += 1;

        let delay = delay_for_failure_count(failures);
        warn!(host = %backend.host, delay = ?delay, "retrying firehose connection after delay");
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn firehose_tail(
    indexer: &Arc<Indexer>,
    db: &Db,
    ingest_seq: &AtomicI64,
    backend: &SyncBackend,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), IndexError> {
    let cursor = load_stream_cursor(db, &backend.host).await?.unwrap_or(0);
    let url = format!(
        "wss://{}/xrpc/com.atproto.sync.subscribeRepos?cursor={}",
        backend.host, cursor
    );

    info!(url = %url, cursor = cursor, "connecting to firehose");

    let (mut ws, _) = connect_async(&url)
        .await
        .map_err(|e| lantern_atproto::AtprotoError::WebSocket(format!("connect failed: {e}")))?;

    info!(host = %backend.host, "firehose connected");

    let workers = backend.max_workers.unwrap_or(DEFAULT_MAX_WORKERS);
    let scheduler = PartitionedScheduler::new(Arc::clone(indexer), workers, DEFAULT_QUEUE_SIZE);

    let mut last_seq = cursor;
    let mut last_stored = cursor;

    loop {
        if scheduler.has_failed() {
            return Err(lantern_atproto::AtprotoError::WebSocket(
                "event handler failure, reconnecting".into(),
            )
            .into());
        }

        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(host = %backend.host, "firehose received shutdown, flushing cursor");
                    let _ = ws.close(None).await;
                    if last_seq > 0 {
                        store_stream_cursor(db, &backend.host, last_seq).await?;
                    }
                    return Ok(());
                }
            }

            result = timeout(LIVENESS_TIMEOUT, ws.next()) => {
                match result {
                    Ok(Some(Ok(Message::Binary(data)))) => {
                        match decode_frame(&data).await {
                            Ok(FirehoseMessage::Commit(evt)) => {
                                if evt.seq > last_seq {
                                    last_seq = evt.seq;
                                    ingest_seq.store(evt.seq, Ordering::Relaxed);
                                    if evt.seq - last_stored >= CURSOR_CHECKPOINT_INTERVAL {
                                        store_stream_cursor(db, &backend.host, evt.seq).await?;
                                        last_stored = evt.seq;
                                    }
                                }
                                scheduler.submit(evt).await?;
                            }
                            Ok(msg @ FirehoseMessage::Error { .. }) => {
                                if msg.is_cursor_error() {
                                    warn!(host = %backend.host, "cursor invalid, resetting and reconnecting");
                                    store_stream_cursor(db, &backend.host, 0).await?;
                                }
                                return Err(lantern_atproto::AtprotoError::WebSocket(
                                    format!("error frame: {msg:?}"),
                                )
                                .into());
                            }
                            Ok(_) => {}
                            Err(e) => {
                                // Malformed frames are skipped; the cursor
                                // still advances with later events.
                                warn!(host = %backend.host, error = %e, "failed to decode firehose frame");
                            }
                        }
                    }
                    Ok(Some(Ok(Message::Ping(data)))) => {
                        ws.send(Message::Pong(data)).await.map_err(|e| {
                            lantern_atproto::AtprotoError::WebSocket(format!("pong failed: {e}"))
                        })?;
                    }
                    Ok(Some(Ok(Message::Close(_)))) => {
                        return Err(lantern_atproto::AtprotoError::WebSocket(
                            "connection closed by server".into(),
                        )
                        .into());
                    }
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => {
                        return Err(lantern_atproto::AtprotoError::WebSocket(format!(
                            "read error: {e}"
                        ))
                        .into());
                    }
                    Ok(None) => {
                        return Err(lantern_atproto::AtprotoError::WebSocket(
                            "stream ended".into(),
                        )
                        .into());
                    }
                    Err(_) => {
                        warn!(host = %backend.host, "no events for {}s, closing connection", LIVENESS_TIMEOUT.as_secs());
                        let _ = ws.close(None).await;
                        return Err(lantern_atproto::AtprotoError::WebSocket(
                            "liveness timeout".into(),
                        )
                        .into());
                    }
                }
            }
        }
    }
}

async fn run_jetstream(
    indexer: Arc<Indexer>,
    db: Db,
    ingest_seq: Arc<AtomicI64>,
    backend: SyncBackend,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures: u32 = 0;
    loop {
        if *shutdown.borrow() {
            info!(host = %backend.host, "jetstream consumer shutting down");
            return;
        }

        let started = Instant::now();
        let result = jetstream_tail(
            &indexer,
            &db,
            &ingest_seq,
            &backend,
            &mut shutdown,
        )
        .await;

        match result {
            Ok(()) => return,
            Err(e) => {
                error!(host = %backend.host, error = %e, "jetstream connection lost");
            }
        }

        if started.elapsed() > FAILURE_RESET_INTERVAL {
            failures = 0;
            continue;
        }
        failures += 1;

        let delay = delay_for_failure_count(failures);
        warn!(host = %backend.host, delay = ?delay, "retrying jetstream connection after delay");
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn jetstream_tail(
    indexer: &Arc<Indexer>,
    db: &Db,
    ingest_seq: &AtomicI64,
    backend: &SyncBackend,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), IndexError> {
    let cursor = load_stream_cursor(db, &backend.host).await?.unwrap_or(0);
    let url = if cursor > 0 {
        format!("wss://{}/subscribe?cursor={}", backend.host, cursor)
    } else {
        format!("wss://{}/subscribe", backend.host)
    };

    info!(url = %url, cursor = cursor, "connecting to jetstream");

    let (mut ws, _) = connect_async(&url)
        .await
        .map_err(|e| lantern_atproto::AtprotoError::WebSocket(format!("connect failed: {e}")))?;

    info!(host = %backend.host, "jetstream connected");

    let workers = backend.max_workers.unwrap_or(DEFAULT_MAX_WORKERS);
    let scheduler = PartitionedScheduler::new(Arc::clone(indexer), workers, DEFAULT_QUEUE_SIZE);

    let mut last_seq = cursor;
    let mut events_since_checkpoint: i64 = 0;

    loop {
        if scheduler.has_failed() {
            return Err(lantern_atproto::AtprotoError::WebSocket(
                "event handler failure, reconnecting".into(),
            )
            .into());
        }

        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(host = %backend.host, "jetstream received shutdown, flushing cursor");
                    let _ = ws.close(None).await;
                    if last_seq > 0 {
                        store_stream_cursor(db, &backend.host, last_seq).await?;
                    }
                    return Ok(());
                }
            }

            result = timeout(LIVENESS_TIMEOUT, ws.next()) => {
                match result {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        let event = match JetstreamEvent::parse(&text) {
                            Ok(event) => event,
                            Err(e) => {
                                warn!(host = %backend.host, error = %e, "failed to decode jetstream event");
                                continue;
                            }
                        };

                        if event.time_us > last_seq {
                            last_seq = event.time_us;
                            ingest_seq.store(event.time_us, Ordering::Relaxed);
                        }

                        events_since_checkpoint += 1;
                        if events_since_checkpoint >= CURSOR_CHECKPOINT_INTERVAL {
                            store_stream_cursor(db, &backend.host, last_seq).await?;
                            events_since_checkpoint = 0;
                        }

                        if let Some(evt) = event.into_commit_event() {
                            scheduler.submit(evt).await?;
                        }
                    }
                    Ok(Some(Ok(Message::Ping(data)))) => {
                        ws.send(Message::Pong(data)).await.map_err(|e| {
                            lantern_atproto::AtprotoError::WebSocket(format!("pong failed: {e}"))
                        })?;
                    }
                    Ok(Some(Ok(Message::Close(_)))) => {
                        return Err(lantern_atproto::AtprotoError::WebSocket(
                            "connection closed by server".into(),
                        )
                        .into());
                    }
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => {
                        return Err(lantern_atproto::AtprotoError::WebSocket(format!(
                            "read error: {e}"
                        ))
                        .into());
                    }
                    Ok(None) => {
                        return Err(lantern_atproto::AtprotoError::WebSocket(
                            "stream ended".into(),
                        )
                        .into());
                    }
                    Err(_) => {
                        warn!(host = %backend.host, "no events for {}s, closing connection", LIVENESS_TIMEOUT.as_secs());
                        let _ = ws.close(None).await;
                        return Err(lantern_atproto::AtprotoError::WebSocket(
                            "liveness timeout".into(),
                        )
                        .into());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_for_failure_count() {
        assert_eq!(delay_for_failure_count(0), Duration::from_secs(5));
        assert_eq!(delay_for_failure_count(1), Duration::from_secs(7));
        assert_eq!(delay_for_failure_count(4), Duration::from_secs(13));
        assert_eq!(delay_for_failure_count(12), Duration::from_secs(29));
        assert_eq!(delay_for_failure_count(13), Duration::from_secs(30));
        assert_eq!(delay_for_failure_count(100), Duration::from_secs(30));
    }

    #[test]
    fn test_sync_config_default_is_single_firehose() {
        let config = SyncConfig::default();
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.backends[0].kind, BackendType::Firehose);
        assert_eq!(config.backends[0].host, "bsky.network");
    }

    #[test]
    fn test_sync_config_parses_json() {
        let json = r#"{
            "backends": [
                {"type": "firehose", "host": "relay.example.com", "max_workers": 4},
                {"type": "jetstream", "host": "jetstream.example.com"}
            ]
        }"#;
        let config: SyncConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[0].kind, BackendType::Firehose);
        assert_eq!(config.backends[0].max_workers, Some(4));
        assert_eq!(config.backends[1].kind, BackendType::Jetstream);
        assert_eq!(config.backends[1].max_workers, None);
    }

    #[test]
    fn test_partition_is_stable_per_did() {
        // Same DID must always map to the same worker index.
        let mut h1 = DefaultHasher::new();
        "did:plc:alice".hash(&mut h1);
        let mut h2 = DefaultHasher::new();
        "did:plc:alice".hash(&mut h2);
        assert_eq!(h1.finish(), h2.finish());
    }
}
