//! The notification ledger.
//!
//! Append-only, keyed by recipient, ordered by insertion id. The unread
//! count is everything newer than the recipient's seen watermark.

use chrono::{DateTime, Utc};

use crate::models::Notification;
use crate::{Db, IndexError};

/// Notification kinds the ledger records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifKind {
    Reply,
    Like,
    Repost,
    Mention,
}

impl NotifKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifKind::Reply => "reply",
            NotifKind::Like => "like",
            NotifKind::Repost => "repost",
            NotifKind::Mention => "mention",
        }
    }
}

#[derive(Clone)]
pub struct NotificationStore {
    db: Db,
}

impl NotificationStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Append a notification.
    pub async fn add(
        &self,
        for_repo: i64,
        author: i64,
        kind: NotifKind,
        source: &str,
        source_cid: &str,
    ) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT INTO notifications (for_repo, author, kind, source, source_cid)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(for_repo)
        .bind(author)
        .bind(kind.as_str())
        .bind(source)
        .bind(source_cid)
        .execute(&self.db.hot)
        .await?;
        Ok(())
    }

    /// List notifications for a recipient, newest first, paged by id.
    pub async fn list(
        &self,
        for_repo: i64,
        before_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Notification>, IndexError> {
        let rows = match before_id {
            Some(cursor) => {
                sqlx::query_as(
                    "SELECT id, created_at, for_repo, author, kind, source, source_cid
                     FROM notifications
                     WHERE for_repo = $1 AND id < $2
                     ORDER BY id DESC LIMIT $3",
                )
                .bind(for_repo)
                .bind(cursor)
                .bind(limit)
                .fetch_all(&self.db.crud)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT id, created_at, for_repo, author, kind, source, source_cid
                     FROM notifications
                     WHERE for_repo = $1
                     ORDER BY id DESC LIMIT $2",
                )
                .bind(for_repo)
                .bind(limit)
                .fetch_all(&self.db.crud)
                .await?
            }
        };
        Ok(rows)
    }

    /// The recipient's seen watermark, if one has been recorded.
    pub async fn seen_at(&self, repo_id: i64) -> Result<Option<DateTime<Utc>>, IndexError> {
        Ok(
            sqlx::query_scalar("SELECT seen_at FROM notification_seens WHERE repo = $1")
                .bind(repo_id)
                .fetch_optional(&self.db.hot)
                .await?,
        )
    }

    /// Count notifications newer than the recipient's watermark.
    pub async fn unread_count(&self, repo_id: i64) -> Result<i64, IndexError> {
        let seen = self
            .seen_at(repo_id)
            .await?
            .unwrap_or(DateTime::UNIX_EPOCH);
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM notifications WHERE for_repo = $1 AND created_at > $2",
        )
        .bind(repo_id)
        .bind(seen)
        .fetch_one(&self.db.hot)
        .await?;
        Ok(count)
    }

    /// Upsert the recipient's seen watermark.
    pub async fn update_seen(&self, repo_id: i64, at: DateTime<Utc>) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT INTO notification_seens (repo, seen_at) VALUES ($1, $2)
             ON CONFLICT (repo) DO UPDATE SET seen_at = EXCLUDED.seen_at",
        )
        .bind(repo_id)
        .bind(at)
        .execute(&self.db.crud)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        assert_eq!(NotifKind::Reply.as_str(), "reply");
        assert_eq!(NotifKind::Like.as_str(), "like");
        assert_eq!(NotifKind::Repost.as_str(), "repost");
        assert_eq!(NotifKind::Mention.as_str(), "mention");
    }
}
