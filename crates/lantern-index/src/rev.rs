//! Per-repo revision guard.
//!
//! Revisions are sortable strings stamped by the authoring repo on every
//! commit; the comparison is plain string order. The cache holds the highest
//! revision applied per repo and is loaded lazily from `sync_infos` on cold
//! start. Ops that lose the comparison are dropped with all their side
//! effects, which is what keeps replays from double-applying notifications.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use crate::{Db, IndexError};

pub struct RevGuard {
    db: Db,
    cache: Mutex<LruCache<i64, String>>,
}

/// Default revision-cache capacity.
pub const DEFAULT_REV_CACHE_CAPACITY: usize = 1_000_000;

impl RevGuard {
    pub fn new(db: Db, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            db,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn cache_get(&self, repo_id: i64) -> Option<String> {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.get(&repo_id).cloned()
    }

    /// The highest revision applied for a repo, or empty when unknown.
    pub async fn rev_for_repo(&self, repo_id: i64) -> Result<String, IndexError> {
        if let Some(rev) = self.cache_get(repo_id) {
            return Ok(rev);
        }

        let rev: Option<String> =
            sqlx::query_scalar("SELECT COALESCE(rev, '') FROM sync_infos WHERE repo = $1")
                .bind(repo_id)
                .fetch_optional(&self.db.hot)
                .await?;
        let rev = rev.unwrap_or_default();

        if !rev.is_empty() {
            self.update(repo_id, &rev);
        }
        Ok(rev)
    }

    /// Whether an op at `rev` is stale and must be dropped.
    pub async fn is_stale(&self, repo_id: i64, rev: &str) -> Result<bool, IndexError> {
        if rev.is_empty() {
            // Replayed records (rescans, missing fetches) carry no revision
            // and never regress the guard.
            return Ok(false);
        }
        let last = self.rev_for_repo(repo_id).await?;
        Ok(!last.is_empty() && rev < last.as_str())
    }

    /// Record a newly applied revision. Empty revisions are ignored so
    /// replays cannot wipe the guard.
    pub fn update(&self, repo_id: i64, rev: &str) {
        if rev.is_empty() {
            return;
        }
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.put(repo_id, rev.to_string());
    }
}
