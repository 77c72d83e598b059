//! Repo registry: DID ↔ internal id mapping.
//!
//! Contract: concurrent callers with the same DID see at most one database
//! insert and one resulting id. A bounded LRU maps DID → handle; the handle
//! carries its own async lock and the loaded row. The map's mutex is held
//! only long enough to insert the handle, so a slow first-time load for one
//! DID never blocks lookups for others.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::models::Repo;
use crate::{Db, IndexError};

struct RepoHandle {
    cell: tokio::sync::Mutex<Option<Repo>>,
}

pub struct RepoRegistry {
    db: Db,
    handles: Mutex<LruCache<String, Arc<RepoHandle>>>,
}

/// Default handle-cache capacity.
pub const DEFAULT_REPO_CACHE_CAPACITY: usize = 1_000_000;

impl RepoRegistry {
    pub fn new(db: Db, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            db,
            handles: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn handle_for(&self, did: &str) -> Arc<RepoHandle> {
        let mut handles = match self.handles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = handles.get(did) {
            return Arc::clone(handle);
        }
        let handle = Arc::new(RepoHandle {
            cell: tokio::sync::Mutex::new(None),
        });
        handles.put(did.to_string(), Arc::clone(&handle));
        handle
    }

    /// Load the repo row for a DID, creating it on first reference.
    ///
    /// A second concurrent caller for the same DID waits on the handle lock
    /// and observes the loaded result.
    pub async fn get_or_create(&self, did: &str) -> Result<Repo, IndexError> {
        let handle = self.handle_for(did);

        let mut cell = handle.cell.lock().await;
        if let Some(repo) = cell.as_ref() {
            return Ok(repo.clone());
        }

        let existing: Option<Repo> =
            sqlx::query_as("SELECT id, created_at, did FROM repos WHERE did = $1")
                .bind(did)
                .fetch_optional(&self.db.hot)
                .await?;

        let repo = match existing {
            Some(repo) => repo,
            None => {
                // Another process may insert concurrently; the conflict arm
                // turns that into a plain read of the winning row.
                sqlx::query_as(
                    "INSERT INTO repos (did) VALUES ($1)
                     ON CONFLICT (did) DO UPDATE SET did = EXCLUDED.did
                     RETURNING id, created_at, did",
                )
                .bind(did)
                .fetch_one(&self.db.crud)
                .await?
            }
        };

        *cell = Some(repo.clone());
        Ok(repo)
    }

    /// `DidToId`: resolve a DID to its stable internal id.
    pub async fn did_to_id(&self, did: &str) -> Result<i64, IndexError> {
        Ok(self.get_or_create(did).await?.id)
    }

    /// Load a repo by internal id. Uncached; callers on hot paths already
    /// hold the id they need.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<Repo>, IndexError> {
        Ok(
            sqlx::query_as("SELECT id, created_at, did FROM repos WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.db.crud)
                .await?,
        )
    }
}
