//! The normalized commit event shared by both stream backends.

use serde::{Deserialize, Serialize};

/// Repository operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpAction {
    Create,
    Update,
    Delete,
}

impl OpAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One record operation inside a commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordOp {
    pub action: OpAction,
    pub collection: String,
    pub rkey: String,
    /// Record CID; absent for deletes.
    pub cid: Option<String>,
    /// Record content as normalized JSON; absent for deletes.
    pub record: Option<serde_json::Value>,
}

/// A commit event, normalized from either stream backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitEvent {
    /// DID of the authoring repository.
    pub did: String,
    /// Repository revision stamped on the commit. Empty for replayed
    /// records (rescans, missing-record fetches) that must not regress the
    /// revision guard.
    pub rev: String,
    /// Backend sequence number (firehose seq or jetstream time_us).
    pub seq: i64,
    pub ops: Vec<RecordOp>,
}

/// Split an op path of the form `collection/rkey`.
///
/// Returns `None` when either component is empty.
pub(crate) fn split_record_path(path: &str) -> Option<(&str, &str)> {
    let mut parts = path.splitn(2, '/');
    let collection = parts.next().filter(|s| !s.is_empty())?;
    let rkey = parts.next().filter(|s| !s.is_empty())?;
    Some((collection, rkey))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_action_parse() {
        assert_eq!(OpAction::parse("create"), Some(OpAction::Create));
        assert_eq!(OpAction::parse("update"), Some(OpAction::Update));
        assert_eq!(OpAction::parse("delete"), Some(OpAction::Delete));
        assert_eq!(OpAction::parse("truncate"), None);
    }

    #[test]
    fn test_split_record_path() {
        assert_eq!(
            split_record_path("app.bsky.feed.post/3abc"),
            Some(("app.bsky.feed.post", "3abc"))
        );
        assert_eq!(split_record_path("/3abc"), None);
        assert_eq!(split_record_path("app.bsky.feed.post/"), None);
        assert_eq!(split_record_path("no-slash"), None);
        assert_eq!(split_record_path(""), None);
    }

    #[test]
    fn test_split_record_path_keeps_extra_segments_in_rkey() {
        // rkeys never contain slashes in practice; splitn keeps the tail
        // intact rather than silently truncating.
        assert_eq!(split_record_path("col/a/b"), Some(("col", "a/b")));
    }
}
