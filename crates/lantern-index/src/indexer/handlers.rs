//! Per-collection record handlers.
//!
//! Every create handler follows the same pattern: decode the record (a
//! malformed record is logged and skipped, never fatal), gate on the
//! relevance set, then an idempotent upsert plus any notification side
//! effects. Deletes remove the row and are no-ops for rows we never indexed.

use chrono::Utc;
use serde::de::DeserializeOwned;
use tracing::warn;

use lantern_atproto::records::{
    parse_datetime_lenient, ActorProfile, FeedGeneratorRecord, FeedLike, FeedPost, FeedPostGate,
    FeedRepost, FeedThreadGate, GraphBlock, GraphFollow, GraphList, GraphListBlock, GraphListItem,
    GraphStarterPack, LIKE_COLLECTION, POST_COLLECTION, REPOST_COLLECTION,
};
use lantern_atproto::{record_uri, RecordOp};

use crate::models::Repo;
use crate::notifications::NotifKind;
use crate::{IndexError, Indexer};

use super::PostInfo;

impl Indexer {
    /// Decode a typed record from an op, treating malformed records as a
    /// skippable condition rather than an error.
    fn decode_record<T: DeserializeOwned>(&self, repo: &Repo, op: &RecordOp) -> Option<T> {
        let value = op.record.as_ref()?;
        match serde_json::from_value(value.clone()) {
            Ok(rec) => Some(rec),
            Err(e) => {
                warn!(
                    did = %repo.did,
                    collection = %op.collection,
                    rkey = %op.rkey,
                    error = %e,
                    "malformed record, skipping"
                );
                None
            }
        }
    }

    fn raw_bytes(&self, op: &RecordOp) -> Result<Vec<u8>, IndexError> {
        match op.record.as_ref() {
            Some(value) => Ok(serde_json::to_vec(value)?),
            None => Ok(Vec::new()),
        }
    }

    fn op_cid(&self, op: &RecordOp) -> String {
        op.cid.clone().unwrap_or_default()
    }

    // =========================================================================
    // Posts
    // =========================================================================

    pub(crate) async fn create_post(
        &self,
        repo: &Repo,
        rkey: &str,
        op: &RecordOp,
    ) -> Result<(), IndexError> {
        let Some(rec) = self.decode_record::<FeedPost>(repo, op) else {
            return Ok(());
        };

        // Relevance gate: a post matters if its author is relevant or it
        // replies into a relevant author's thread.
        let mut rel_idents: Vec<&str> = vec![&repo.did];
        if let Some(reply) = &rec.reply {
            rel_idents.push(&reply.parent.uri);
            rel_idents.push(&reply.root.uri);
        }
        if !self.relevance.any_relevant(rel_idents) {
            return Ok(());
        }

        // Idempotence: a non-placeholder row already carries this record.
        if self.check_post_exists(repo.id, rkey).await? {
            return Ok(());
        }

        let created = match parse_datetime_lenient(&rec.created_at) {
            Ok(t) => t,
            Err(e) => {
                warn!(did = %repo.did, rkey = %rkey, error = %e, "bad post timestamp, skipping");
                return Ok(());
            }
        };

        let uri = record_uri(&repo.did, POST_COLLECTION, rkey);
        let cid = self.op_cid(op);
        let raw = self.raw_bytes(op)?;

        let mut reply_to = 0i64;
        let mut reply_to_usr = 0i64;
        let mut in_thread = 0i64;

        if let Some(reply) = &rec.reply {
            let parent = self.post_info_for_uri(&reply.parent.uri).await?;
            reply_to = parent.id;
            reply_to_usr = parent.author;
            in_thread = self.post_id_for_uri(&reply.root.uri).await?;

            if reply_to_usr == self.principal.id {
                if let Err(e) = self
                    .notifications
                    .add(self.principal.id, repo.id, NotifKind::Reply, &uri, &cid)
                    .await
                {
                    warn!(uri = %uri, error = %e, "failed to create reply notification");
                }
            }
        }

        let mut reposting = 0i64;
        if let Some(quoted) = rec.quoted_post_uri() {
            reposting = self.post_id_for_uri(&quoted).await?;
        }

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO posts (author, rkey, cid, not_found, raw, created, indexed,
                                reposting, reply_to, reply_to_usr, in_thread)
             VALUES ($1, $2, $3, false, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (author, rkey)
             DO UPDATE SET
                 cid = EXCLUDED.cid,
                 not_found = false,
                 raw = EXCLUDED.raw,
                 created = EXCLUDED.created,
                 indexed = EXCLUDED.indexed,
                 reposting = EXCLUDED.reposting,
                 reply_to = EXCLUDED.reply_to,
                 reply_to_usr = EXCLUDED.reply_to_usr,
                 in_thread = EXCLUDED.in_thread
             RETURNING id",
        )
        .bind(repo.id)
        .bind(rkey)
        .bind(&cid)
        .bind(&raw)
        .bind(created)
        .bind(Utc::now())
        .bind(reposting)
        .bind(reply_to)
        .bind(reply_to_usr)
        .bind(in_thread)
        .fetch_one(&self.db.hot)
        .await?;

        for mention_did in rec.mention_dids() {
            let mentioned = match self.repos.get_or_create(&mention_did).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(did = %mention_did, error = %e, "failed to load repo for mention");
                    continue;
                }
            };
            if mentioned.id == self.principal.id {
                if let Err(e) = self
                    .notifications
                    .add(self.principal.id, repo.id, NotifKind::Mention, &uri, &cid)
                    .await
                {
                    warn!(uri = %uri, error = %e, "failed to create mention notification");
                }
            }
        }

        self.post_info_cache_put(&uri, PostInfo { id, author: repo.id });
        Ok(())
    }

    /// Whether a non-placeholder row already exists for `(author, rkey)`.
    /// Placeholders count as absent so the create path upgrades them.
    async fn check_post_exists(&self, author: i64, rkey: &str) -> Result<bool, IndexError> {
        let row: Option<(i64, bool)> =
            sqlx::query_as("SELECT id, not_found FROM posts WHERE author = $1 AND rkey = $2")
                .bind(author)
                .bind(rkey)
                .fetch_optional(&self.db.hot)
                .await?;
        Ok(matches!(row, Some((id, not_found)) if id != 0 && !not_found))
    }

    pub(crate) async fn delete_post(&self, repo: &Repo, rkey: &str) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM posts WHERE author = $1 AND rkey = $2")
            .bind(repo.id)
            .bind(rkey)
            .execute(&self.db.crud)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Likes and reposts
    // =========================================================================

    pub(crate) async fn create_like(
        &self,
        repo: &Repo,
        rkey: &str,
        op: &RecordOp,
    ) -> Result<(), IndexError> {
        let Some(rec) = self.decode_record::<FeedLike>(repo, op) else {
            return Ok(());
        };

        if !self.relevance.any_relevant([repo.did.as_str(), rec.subject.uri.as_str()]) {
            return Ok(());
        }

        let created = match parse_datetime_lenient(&rec.created_at) {
            Ok(t) => t,
            Err(e) => {
                warn!(did = %repo.did, rkey = %rkey, error = %e, "bad like timestamp, skipping");
                return Ok(());
            }
        };

        let subject = self.post_info_for_uri(&rec.subject.uri).await?;
        let cid = self.op_cid(op);

        let result = sqlx::query(
            "INSERT INTO likes (created, indexed, author, rkey, subject, cid)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(created)
        .bind(Utc::now())
        .bind(repo.id)
        .bind(rkey)
        .bind(subject.id)
        .bind(&cid)
        .execute(&self.db.hot)
        .await;

        if let Err(e) = result {
            if IndexError::is_unique_violation(&e) {
                return Ok(());
            }
            return Err(e.into());
        }

        if subject.author == self.principal.id {
            let uri = record_uri(&repo.did, LIKE_COLLECTION, rkey);
            if let Err(e) = self
                .notifications
                .add(self.principal.id, repo.id, NotifKind::Like, &uri, &cid)
                .await
            {
                warn!(uri = %uri, error = %e, "failed to create like notification");
            }
        }

        Ok(())
    }

    pub(crate) async fn create_repost(
        &self,
        repo: &Repo,
        rkey: &str,
        op: &RecordOp,
    ) -> Result<(), IndexError> {
        let Some(rec) = self.decode_record::<FeedRepost>(repo, op) else {
            return Ok(());
        };

        if !self.relevance.any_relevant([repo.did.as_str(), rec.subject.uri.as_str()]) {
            return Ok(());
        }

        let created = match parse_datetime_lenient(&rec.created_at) {
            Ok(t) => t,
            Err(e) => {
                warn!(did = %repo.did, rkey = %rkey, error = %e, "bad repost timestamp, skipping");
                return Ok(());
            }
        };

        let subject = self.post_info_for_uri(&rec.subject.uri).await?;

        let result = sqlx::query(
            "INSERT INTO reposts (created, indexed, author, rkey, subject)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(created)
        .bind(Utc::now())
        .bind(repo.id)
        .bind(rkey)
        .bind(subject.id)
        .execute(&self.db.hot)
        .await;

        if let Err(e) = result {
            if IndexError::is_unique_violation(&e) {
                return Ok(());
            }
            return Err(e.into());
        }

        if subject.author == self.principal.id {
            let uri = record_uri(&repo.did, REPOST_COLLECTION, rkey);
            if let Err(e) = self
                .notifications
                .add(self.principal.id, repo.id, NotifKind::Repost, &uri, &self.op_cid(op))
                .await
            {
                warn!(uri = %uri, error = %e, "failed to create repost notification");
            }
        }

        Ok(())
    }

    // =========================================================================
    // Graph records
    // =========================================================================

    pub(crate) async fn create_follow(
        &self,
        repo: &Repo,
        rkey: &str,
        op: &RecordOp,
    ) -> Result<(), IndexError> {
        let Some(rec) = self.decode_record::<GraphFollow>(repo, op) else {
            return Ok(());
        };

        if !self.relevance.any_relevant([repo.did.as_str(), rec.subject.as_str()]) {
            return Ok(());
        }

        let created = match parse_datetime_lenient(&rec.created_at) {
            Ok(t) => t,
            Err(e) => {
                warn!(did = %repo.did, rkey = %rkey, error = %e, "bad follow timestamp, skipping");
                return Ok(());
            }
        };

        let subject = self.repos.get_or_create(&rec.subject).await?;

        sqlx::query(
            "INSERT INTO follows (created, indexed, author, rkey, subject)
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT DO NOTHING",
        )
        .bind(created)
        .bind(Utc::now())
        .bind(repo.id)
        .bind(rkey)
        .bind(subject.id)
        .execute(&self.db.hot)
        .await?;

        Ok(())
    }

    pub(crate) async fn create_block(
        &self,
        repo: &Repo,
        rkey: &str,
        op: &RecordOp,
    ) -> Result<(), IndexError> {
        let Some(rec) = self.decode_record::<GraphBlock>(repo, op) else {
            return Ok(());
        };

        if !self.relevance.any_relevant([repo.did.as_str(), rec.subject.as_str()]) {
            return Ok(());
        }

        let created = match parse_datetime_lenient(&rec.created_at) {
            Ok(t) => t,
            Err(e) => {
                warn!(did = %repo.did, rkey = %rkey, error = %e, "bad block timestamp, skipping");
                return Ok(());
            }
        };

        let subject = self.repos.get_or_create(&rec.subject).await?;

        sqlx::query(
            "INSERT INTO blocks (created, indexed, author, rkey, subject)
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT DO NOTHING",
        )
        .bind(created)
        .bind(Utc::now())
        .bind(repo.id)
        .bind(rkey)
        .bind(subject.id)
        .execute(&self.db.crud)
        .await?;

        Ok(())
    }

    pub(crate) async fn create_list(
        &self,
        repo: &Repo,
        rkey: &str,
        op: &RecordOp,
    ) -> Result<(), IndexError> {
        let Some(rec) = self.decode_record::<GraphList>(repo, op) else {
            return Ok(());
        };

        if !self.relevance.any_relevant([repo.did.as_str()]) {
            return Ok(());
        }

        let created = match parse_datetime_lenient(&rec.created_at) {
            Ok(t) => t,
            Err(e) => {
                warn!(did = %repo.did, rkey = %rkey, error = %e, "bad list timestamp, skipping");
                return Ok(());
            }
        };

        let raw = self.raw_bytes(op)?;

        // A placeholder row may exist from a listitem reference; upgrade it.
        sqlx::query(
            "INSERT INTO lists (created, indexed, author, rkey, raw)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (author, rkey)
             DO UPDATE SET created = EXCLUDED.created, indexed = EXCLUDED.indexed,
                           raw = EXCLUDED.raw",
        )
        .bind(created)
        .bind(Utc::now())
        .bind(repo.id)
        .bind(rkey)
        .bind(&raw)
        .execute(&self.db.crud)
        .await?;

        Ok(())
    }

    pub(crate) async fn create_listitem(
        &self,
        repo: &Repo,
        rkey: &str,
        op: &RecordOp,
    ) -> Result<(), IndexError> {
        let Some(rec) = self.decode_record::<GraphListItem>(repo, op) else {
            return Ok(());
        };

        if !self.relevance.any_relevant([repo.did.as_str()]) {
            return Ok(());
        }

        let created = match parse_datetime_lenient(&rec.created_at) {
            Ok(t) => t,
            Err(e) => {
                warn!(did = %repo.did, rkey = %rkey, error = %e, "bad listitem timestamp, skipping");
                return Ok(());
            }
        };

        let subject = self.repos.get_or_create(&rec.subject).await?;
        let list_id = self.get_or_create_list_id(&rec.list).await?;

        sqlx::query(
            "INSERT INTO list_items (created, indexed, author, rkey, subject, list)
             VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT DO NOTHING",
        )
        .bind(created)
        .bind(Utc::now())
        .bind(repo.id)
        .bind(rkey)
        .bind(subject.id)
        .bind(list_id)
        .execute(&self.db.crud)
        .await?;

        Ok(())
    }

    pub(crate) async fn create_listblock(
        &self,
        repo: &Repo,
        rkey: &str,
        op: &RecordOp,
    ) -> Result<(), IndexError> {
        let Some(rec) = self.decode_record::<GraphListBlock>(repo, op) else {
            return Ok(());
        };

        if !self.relevance.any_relevant([repo.did.as_str(), rec.subject.as_str()]) {
            return Ok(());
        }

        let created = match parse_datetime_lenient(&rec.created_at) {
            Ok(t) => t,
            Err(e) => {
                warn!(did = %repo.did, rkey = %rkey, error = %e, "bad listblock timestamp, skipping");
                return Ok(());
            }
        };

        let list_id = self.get_or_create_list_id(&rec.subject).await?;

        sqlx::query(
            "INSERT INTO list_blocks (created, indexed, author, rkey, list)
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT DO NOTHING",
        )
        .bind(created)
        .bind(Utc::now())
        .bind(repo.id)
        .bind(rkey)
        .bind(list_id)
        .execute(&self.db.crud)
        .await?;

        Ok(())
    }

    pub(crate) async fn create_starterpack(
        &self,
        repo: &Repo,
        rkey: &str,
        op: &RecordOp,
    ) -> Result<(), IndexError> {
        let Some(rec) = self.decode_record::<GraphStarterPack>(repo, op) else {
            return Ok(());
        };

        if !self.relevance.any_relevant([repo.did.as_str()]) {
            return Ok(());
        }

        let created = match parse_datetime_lenient(&rec.created_at) {
            Ok(t) => t,
            Err(e) => {
                warn!(did = %repo.did, rkey = %rkey, error = %e, "bad starterpack timestamp, skipping");
                return Ok(());
            }
        };

        let list_id = self.get_or_create_list_id(&rec.list).await?;
        let raw = self.raw_bytes(op)?;

        sqlx::query(
            "INSERT INTO starter_packs (created, indexed, author, rkey, raw, list)
             VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT DO NOTHING",
        )
        .bind(created)
        .bind(Utc::now())
        .bind(repo.id)
        .bind(rkey)
        .bind(&raw)
        .bind(list_id)
        .execute(&self.db.crud)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Profiles and gates
    // =========================================================================

    pub(crate) async fn upsert_profile(
        &self,
        repo: &Repo,
        rev: &str,
        op: &RecordOp,
    ) -> Result<(), IndexError> {
        // Parse for validation only; the raw record is what hydration serves.
        let Some(_rec) = self.decode_record::<ActorProfile>(repo, op) else {
            return Ok(());
        };

        if !self.relevance.any_relevant([repo.did.as_str()]) {
            return Ok(());
        }

        let raw = self.raw_bytes(op)?;

        sqlx::query(
            "INSERT INTO profiles (repo, rev, raw, indexed) VALUES ($1, $2, $3, $4)
             ON CONFLICT (repo)
             DO UPDATE SET rev = EXCLUDED.rev, raw = EXCLUDED.raw, indexed = EXCLUDED.indexed",
        )
        .bind(repo.id)
        .bind(rev)
        .bind(&raw)
        .bind(Utc::now())
        .execute(&self.db.crud)
        .await?;

        Ok(())
    }

    pub(crate) async fn delete_profile(&self, repo: &Repo) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM profiles WHERE repo = $1")
            .bind(repo.id)
            .execute(&self.db.crud)
            .await?;
        Ok(())
    }

    pub(crate) async fn create_feed_generator(
        &self,
        repo: &Repo,
        rkey: &str,
        op: &RecordOp,
    ) -> Result<(), IndexError> {
        let Some(rec) = self.decode_record::<FeedGeneratorRecord>(repo, op) else {
            return Ok(());
        };

        if !self.relevance.any_relevant([repo.did.as_str()]) {
            return Ok(());
        }

        let created = match parse_datetime_lenient(&rec.created_at) {
            Ok(t) => t,
            Err(e) => {
                warn!(did = %repo.did, rkey = %rkey, error = %e, "bad feedgen timestamp, skipping");
                return Ok(());
            }
        };

        sqlx::query(
            "INSERT INTO feed_generators (created, indexed, author, rkey, did)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (author, rkey) DO UPDATE SET did = EXCLUDED.did",
        )
        .bind(created)
        .bind(Utc::now())
        .bind(repo.id)
        .bind(rkey)
        .bind(&rec.did)
        .execute(&self.db.crud)
        .await?;

        Ok(())
    }

    pub(crate) async fn create_threadgate(
        &self,
        repo: &Repo,
        rkey: &str,
        op: &RecordOp,
    ) -> Result<(), IndexError> {
        let Some(rec) = self.decode_record::<FeedThreadGate>(repo, op) else {
            return Ok(());
        };

        if !self.relevance.any_relevant([repo.did.as_str()]) {
            return Ok(());
        }

        let created = match parse_datetime_lenient(&rec.created_at) {
            Ok(t) => t,
            Err(e) => {
                warn!(did = %repo.did, rkey = %rkey, error = %e, "bad threadgate timestamp, skipping");
                return Ok(());
            }
        };

        let post_id = self.post_id_for_uri(&rec.post).await?;

        sqlx::query(
            "INSERT INTO thread_gates (created, indexed, author, rkey, post)
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT DO NOTHING",
        )
        .bind(created)
        .bind(Utc::now())
        .bind(repo.id)
        .bind(rkey)
        .bind(post_id)
        .execute(&self.db.crud)
        .await?;

        Ok(())
    }

    pub(crate) async fn create_postgate(
        &self,
        repo: &Repo,
        rkey: &str,
        op: &RecordOp,
    ) -> Result<(), IndexError> {
        let Some(rec) = self.decode_record::<FeedPostGate>(repo, op) else {
            return Ok(());
        };

        if !self.relevance.any_relevant([repo.did.as_str()]) {
            return Ok(());
        }

        let created = match parse_datetime_lenient(&rec.created_at) {
            Ok(t) => t,
            Err(e) => {
                warn!(did = %repo.did, rkey = %rkey, error = %e, "bad postgate timestamp, skipping");
                return Ok(());
            }
        };

        let subject = self.post_info_for_uri(&rec.post).await?;
        let raw = self.raw_bytes(op)?;

        sqlx::query(
            "INSERT INTO post_gates (created, indexed, author, rkey, subject, raw)
             VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT DO NOTHING",
        )
        .bind(created)
        .bind(Utc::now())
        .bind(repo.id)
        .bind(rkey)
        .bind(subject.id)
        .bind(&raw)
        .execute(&self.db.crud)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Deletes
    // =========================================================================

    /// Delete a record row by `(author, rkey)`. Deleting a row we never
    /// indexed is a no-op.
    pub(crate) async fn delete_by_author_rkey(
        &self,
        repo: &Repo,
        rkey: &str,
        table: &str,
    ) -> Result<(), IndexError> {
        // Table names come from the router's fixed dispatch, never input.
        let query = format!("DELETE FROM {table} WHERE author = $1 AND rkey = $2");
        sqlx::query(&query)
            .bind(repo.id)
            .bind(rkey)
            .execute(&self.db.crud)
            .await?;
        Ok(())
    }
}
