//! The record router.
//!
//! Commit events land here after the scheduler has partitioned them by repo.
//! Each op passes the revision guard, dispatches by collection to a typed
//! handler (see `handlers`), and finally advances the per-repo revision
//! cache. Stale ops are dropped silently, side effects included.

mod handlers;

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use tracing::{debug, warn};

use lantern_atproto::records::{
    BLOCK_COLLECTION, FEEDGEN_COLLECTION, FOLLOW_COLLECTION, LIKE_COLLECTION, LISTBLOCK_COLLECTION,
    LISTITEM_COLLECTION, LIST_COLLECTION, POSTGATE_COLLECTION, POST_COLLECTION, PROFILE_COLLECTION,
    REPOST_COLLECTION, STARTERPACK_COLLECTION, THREADGATE_COLLECTION,
};
use lantern_atproto::{AtUri, CommitEvent, OpAction, RecordOp};

use crate::missing::MissingRecordQueue;
use crate::models::{Post, Repo};
use crate::notifications::NotificationStore;
use crate::{Db, IndexError, RelevanceSet, RepoRegistry, RevGuard};

/// Cached identity of a post row: enough to wire up foreign keys without
/// loading the full record.
#[derive(Debug, Clone, Copy)]
pub struct PostInfo {
    pub id: i64,
    pub author: i64,
}

/// Default post-info cache capacity.
pub const DEFAULT_POST_CACHE_CAPACITY: usize = 1_000_000;

pub struct Indexer {
    db: Db,
    repos: RepoRegistry,
    relevance: RelevanceSet,
    revs: RevGuard,
    notifications: NotificationStore,
    missing: MissingRecordQueue,
    post_info: Mutex<LruCache<String, PostInfo>>,
    principal: Repo,
}

impl Indexer {
    pub fn new(
        db: Db,
        repos: RepoRegistry,
        relevance: RelevanceSet,
        revs: RevGuard,
        notifications: NotificationStore,
        missing: MissingRecordQueue,
        principal: Repo,
    ) -> Self {
        let capacity = NonZeroUsize::new(DEFAULT_POST_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            db,
            repos,
            relevance,
            revs,
            notifications,
            missing,
            post_info: Mutex::new(LruCache::new(capacity)),
            principal,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn repos(&self) -> &RepoRegistry {
        &self.repos
    }

    pub fn relevance(&self) -> &RelevanceSet {
        &self.relevance
    }

    pub fn notifications(&self) -> &NotificationStore {
        &self.notifications
    }

    pub fn missing(&self) -> &MissingRecordQueue {
        &self.missing
    }

    pub fn principal(&self) -> &Repo {
        &self.principal
    }

    /// Apply a commit event: every op in order, each behind the revision
    /// guard.
    pub async fn handle_event(&self, evt: &CommitEvent) -> Result<(), IndexError> {
        for op in &evt.ops {
            self.handle_op(&evt.did, &evt.rev, op).await?;
        }
        Ok(())
    }

    /// Apply a single op for a repo at a revision. Used by the event path
    /// and, with an empty rev, by replays (missing-record fetches, rescans).
    pub async fn handle_op(&self, did: &str, rev: &str, op: &RecordOp) -> Result<(), IndexError> {
        let repo = self.repos.get_or_create(did).await?;

        if self.revs.is_stale(repo.id, rev).await? {
            debug!(did = %did, rev = %rev, collection = %op.collection, rkey = %op.rkey, "dropping stale op");
            return Ok(());
        }

        match op.action {
            OpAction::Create => self.dispatch_create(&repo, rev, op).await?,
            OpAction::Update => self.dispatch_update(&repo, rev, op).await?,
            OpAction::Delete => self.dispatch_delete(&repo, op).await?,
        }

        self.revs.update(repo.id, rev);
        Ok(())
    }

    async fn dispatch_create(
        &self,
        repo: &Repo,
        rev: &str,
        op: &RecordOp,
    ) -> Result<(), IndexError> {
        let rkey = op.rkey.as_str();
        match op.collection.as_str() {
            POST_COLLECTION => self.create_post(repo, rkey, op).await,
            LIKE_COLLECTION => self.create_like(repo, rkey, op).await,
            REPOST_COLLECTION => self.create_repost(repo, rkey, op).await,
            FOLLOW_COLLECTION => self.create_follow(repo, rkey, op).await,
            BLOCK_COLLECTION => self.create_block(repo, rkey, op).await,
            LIST_COLLECTION => self.create_list(repo, rkey, op).await,
            LISTITEM_COLLECTION => self.create_listitem(repo, rkey, op).await,
            LISTBLOCK_COLLECTION => self.create_listblock(repo, rkey, op).await,
            PROFILE_COLLECTION => self.upsert_profile(repo, rev, op).await,
            FEEDGEN_COLLECTION => self.create_feed_generator(repo, rkey, op).await,
            THREADGATE_COLLECTION => self.create_threadgate(repo, rkey, op).await,
            POSTGATE_COLLECTION => self.create_postgate(repo, rkey, op).await,
            STARTERPACK_COLLECTION => self.create_starterpack(repo, rkey, op).await,
            other => {
                debug!(did = %repo.did, collection = %other, rkey = %rkey, "unrecognized record type");
                Ok(())
            }
        }
    }

    async fn dispatch_update(&self, repo: &Repo, rev: &str, op: &RecordOp) -> Result<(), IndexError> {
        match op.collection.as_str() {
            PROFILE_COLLECTION => self.upsert_profile(repo, rev, op).await,
            other => {
                debug!(did = %repo.did, collection = %other, rkey = %op.rkey, "unrecognized record type in update");
                Ok(())
            }
        }
    }

    async fn dispatch_delete(&self, repo: &Repo, op: &RecordOp) -> Result<(), IndexError> {
        let rkey = op.rkey.as_str();
        match op.collection.as_str() {
            POST_COLLECTION => self.delete_post(repo, rkey).await,
            LIKE_COLLECTION => self.delete_by_author_rkey(repo, rkey, "likes").await,
            REPOST_COLLECTION => self.delete_by_author_rkey(repo, rkey, "reposts").await,
            FOLLOW_COLLECTION => self.delete_by_author_rkey(repo, rkey, "follows").await,
            BLOCK_COLLECTION => self.delete_by_author_rkey(repo, rkey, "blocks").await,
            LIST_COLLECTION => self.delete_by_author_rkey(repo, rkey, "lists").await,
            LISTITEM_COLLECTION => self.delete_by_author_rkey(repo, rkey, "list_items").await,
            LISTBLOCK_COLLECTION => self.delete_by_author_rkey(repo, rkey, "list_blocks").await,
            STARTERPACK_COLLECTION => self.delete_by_author_rkey(repo, rkey, "starter_packs").await,
            PROFILE_COLLECTION => self.delete_profile(repo).await,
            FEEDGEN_COLLECTION => self.delete_by_author_rkey(repo, rkey, "feed_generators").await,
            THREADGATE_COLLECTION => self.delete_by_author_rkey(repo, rkey, "thread_gates").await,
            POSTGATE_COLLECTION => self.delete_by_author_rkey(repo, rkey, "post_gates").await,
            other => {
                warn!(did = %repo.did, collection = %other, rkey = %rkey, "delete of unrecognized record type");
                Ok(())
            }
        }
    }

    // =========================================================================
    // Placeholder posts
    // =========================================================================

    fn post_info_cache_get(&self, uri: &str) -> Option<PostInfo> {
        let mut cache = match self.post_info.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.get(uri).copied()
    }

    pub(crate) fn post_info_cache_put(&self, uri: &str, info: PostInfo) {
        let mut cache = match self.post_info.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.put(uri.to_string(), info);
    }

    /// `PostIdFor`: a stable post id for a URI, creating a placeholder row
    /// on miss.
    pub async fn post_id_for_uri(&self, uri: &str) -> Result<i64, IndexError> {
        Ok(self.post_info_for_uri(uri).await?.id)
    }

    /// Like [`Self::post_id_for_uri`] but also yields the author id.
    pub async fn post_info_for_uri(&self, uri: &str) -> Result<PostInfo, IndexError> {
        if let Some(info) = self.post_info_cache_get(uri) {
            return Ok(info);
        }

        let puri = AtUri::parse(uri)?;
        let repo = self.repos.get_or_create(&puri.authority).await?;

        if let Some(info) = self.try_load_post_info(repo.id, &puri.rkey).await? {
            self.post_info_cache_put(uri, info);
            return Ok(info);
        }

        // Concurrent inserts collide on (author, rkey); the conflict arm
        // means "someone else made it", so fall through to a re-read.
        let inserted: Option<(i64,)> = sqlx::query_as(
            "INSERT INTO posts (rkey, author, not_found) VALUES ($1, $2, true)
             ON CONFLICT (author, rkey) DO NOTHING
             RETURNING id",
        )
        .bind(&puri.rkey)
        .bind(repo.id)
        .fetch_optional(&self.db.hot)
        .await?;

        let info = match inserted {
            Some((id,)) => PostInfo { id, author: repo.id },
            None => self
                .try_load_post_info(repo.id, &puri.rkey)
                .await?
                .ok_or_else(|| {
                    IndexError::Invariant(format!(
                        "placeholder insert conflicted but row is missing: {} {}",
                        repo.id, puri.rkey
                    ))
                })?,
        };

        self.post_info_cache_put(uri, info);
        Ok(info)
    }

    async fn try_load_post_info(
        &self,
        author: i64,
        rkey: &str,
    ) -> Result<Option<PostInfo>, IndexError> {
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT id, author FROM posts WHERE author = $1 AND rkey = $2")
                .bind(author)
                .bind(rkey)
                .fetch_optional(&self.db.hot)
                .await?;
        Ok(row.map(|(id, author)| PostInfo { id, author }))
    }

    /// Load the full post row for a URI, creating a placeholder if the post
    /// is unknown. The read path uses this so foreign keys and thread links
    /// always have a row to land on.
    pub async fn get_post_by_uri(&self, uri: &str) -> Result<Post, IndexError> {
        let puri = AtUri::parse(uri)?;
        let repo = self.repos.get_or_create(&puri.authority).await?;

        if let Some(post) = self.load_post(repo.id, &puri.rkey).await? {
            self.post_info_cache_put(
                uri,
                PostInfo {
                    id: post.id,
                    author: post.author,
                },
            );
            return Ok(post);
        }

        sqlx::query(
            "INSERT INTO posts (rkey, author, not_found) VALUES ($1, $2, true)
             ON CONFLICT (author, rkey) DO NOTHING",
        )
        .bind(&puri.rkey)
        .bind(repo.id)
        .execute(&self.db.hot)
        .await?;

        let post = self.load_post(repo.id, &puri.rkey).await?.ok_or_else(|| {
            IndexError::Invariant(format!(
                "placeholder insert conflicted but row is missing: {} {}",
                repo.id, puri.rkey
            ))
        })?;

        self.post_info_cache_put(
            uri,
            PostInfo {
                id: post.id,
                author: post.author,
            },
        );
        Ok(post)
    }

    pub(crate) async fn load_post(
        &self,
        author: i64,
        rkey: &str,
    ) -> Result<Option<Post>, IndexError> {
        Ok(sqlx::query_as(
            "SELECT id, author, rkey, cid, not_found, raw, created, indexed,
                    reposting, reply_to, reply_to_usr, in_thread
             FROM posts WHERE author = $1 AND rkey = $2",
        )
        .bind(author)
        .bind(rkey)
        .fetch_optional(&self.db.crud)
        .await?)
    }

    /// Load a post row by internal id.
    pub async fn get_post_by_id(&self, id: i64) -> Result<Option<Post>, IndexError> {
        Ok(sqlx::query_as(
            "SELECT id, author, rkey, cid, not_found, raw, created, indexed,
                    reposting, reply_to, reply_to_usr, in_thread
             FROM posts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.db.crud)
        .await?)
    }

    // =========================================================================
    // Lists referenced before they are seen
    // =========================================================================

    pub(crate) async fn get_or_create_list_id(&self, uri: &str) -> Result<i64, IndexError> {
        let puri = AtUri::parse(uri)?;
        let repo = self.repos.get_or_create(&puri.authority).await?;

        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM lists WHERE author = $1 AND rkey = $2")
                .bind(repo.id)
                .bind(&puri.rkey)
                .fetch_optional(&self.db.crud)
                .await?;
        if let Some((id,)) = existing {
            return Ok(id);
        }

        let inserted: Option<(i64,)> = sqlx::query_as(
            "INSERT INTO lists (author, rkey) VALUES ($1, $2)
             ON CONFLICT (author, rkey) DO NOTHING
             RETURNING id",
        )
        .bind(repo.id)
        .bind(&puri.rkey)
        .fetch_optional(&self.db.crud)
        .await?;

        match inserted {
            Some((id,)) => Ok(id),
            None => {
                let row: Option<(i64,)> =
                    sqlx::query_as("SELECT id FROM lists WHERE author = $1 AND rkey = $2")
                        .bind(repo.id)
                        .bind(&puri.rkey)
                        .fetch_optional(&self.db.crud)
                        .await?;
                row.map(|(id,)| id).ok_or_else(|| {
                    IndexError::Invariant(format!(
                        "list insert conflicted but row is missing: {} {}",
                        repo.id, puri.rkey
                    ))
                })
            }
        }
    }
}
