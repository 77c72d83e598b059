//! Row types for the relational tables.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// A repository (one per authoring principal). Created on first reference,
/// never deleted.
#[derive(Debug, Clone, FromRow)]
pub struct Repo {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub did: String,
}

/// A post row. `not_found = true` with empty `raw` marks a placeholder that
/// exists only to receive foreign keys; a later authoritative create upgrades
/// it in place, keeping the same id.
#[derive(Debug, Clone, FromRow)]
pub struct Post {
    pub id: i64,
    pub author: i64,
    pub rkey: String,
    pub cid: String,
    pub not_found: bool,
    pub raw: Option<Vec<u8>>,
    pub created: DateTime<Utc>,
    pub indexed: DateTime<Utc>,
    /// Quoted post id, 0 when the post quotes nothing.
    pub reposting: i64,
    /// Parent post id, 0 for top-level posts.
    pub reply_to: i64,
    /// Parent post's author id, 0 for top-level posts.
    pub reply_to_usr: i64,
    /// Thread root post id, 0 for top-level posts.
    pub in_thread: i64,
}

impl Post {
    /// Whether this row carries real record content.
    pub fn has_content(&self) -> bool {
        !self.not_found && self.raw.as_ref().is_some_and(|r| !r.is_empty())
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Like {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub indexed: DateTime<Utc>,
    pub author: i64,
    pub rkey: String,
    pub subject: i64,
    pub cid: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct Repost {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub indexed: DateTime<Utc>,
    pub author: i64,
    pub rkey: String,
    pub subject: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct Follow {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub indexed: DateTime<Utc>,
    pub author: i64,
    pub rkey: String,
    pub subject: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct Block {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub indexed: DateTime<Utc>,
    pub author: i64,
    pub rkey: String,
    pub subject: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct List {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub indexed: DateTime<Utc>,
    pub author: i64,
    pub rkey: String,
    pub raw: Option<Vec<u8>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ListItem {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub indexed: DateTime<Utc>,
    pub author: i64,
    pub rkey: String,
    pub subject: i64,
    pub list: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct ListBlock {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub indexed: DateTime<Utc>,
    pub author: i64,
    pub rkey: String,
    pub list: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct StarterPack {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub indexed: DateTime<Utc>,
    pub author: i64,
    pub rkey: String,
    pub raw: Option<Vec<u8>>,
    pub list: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct FeedGenerator {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub indexed: DateTime<Utc>,
    pub author: i64,
    pub rkey: String,
    pub did: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct ThreadGate {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub indexed: DateTime<Utc>,
    pub author: i64,
    pub rkey: String,
    pub post: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct PostGate {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub indexed: DateTime<Utc>,
    pub author: i64,
    pub rkey: String,
    pub subject: i64,
    pub raw: Option<Vec<u8>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Profile {
    pub id: i64,
    pub indexed: DateTime<Utc>,
    pub repo: i64,
    pub rev: String,
    pub raw: Option<Vec<u8>>,
}

/// Per-repo bookkeeping.
#[derive(Debug, Clone, FromRow)]
pub struct SyncInfo {
    pub id: i64,
    pub repo: i64,
    pub follows_synced: bool,
    pub rev: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct Notification {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub for_repo: i64,
    pub author: i64,
    pub kind: String,
    pub source: String,
    pub source_cid: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct NotificationSeen {
    pub id: i64,
    pub repo: i64,
    pub seen_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_has_no_content() {
        let placeholder = Post {
            id: 1,
            author: 2,
            rkey: "3abc".into(),
            cid: String::new(),
            not_found: true,
            raw: None,
            created: DateTime::UNIX_EPOCH,
            indexed: DateTime::UNIX_EPOCH,
            reposting: 0,
            reply_to: 0,
            reply_to_usr: 0,
            in_thread: 0,
        };
        assert!(!placeholder.has_content());
    }

    #[test]
    fn test_upgraded_post_has_content() {
        let post = Post {
            id: 1,
            author: 2,
            rkey: "3abc".into(),
            cid: "bafy".into(),
            not_found: false,
            raw: Some(b"{}".to_vec()),
            created: Utc::now(),
            indexed: Utc::now(),
            reposting: 0,
            reply_to: 0,
            reply_to_usr: 0,
            in_thread: 0,
        };
        assert!(post.has_content());
    }
}
