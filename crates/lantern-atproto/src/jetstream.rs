//! Jetstream event decoding.
//!
//! Jetstream delivers the same commit stream as the firehose, but framed as
//! JSON text messages with records already deserialized. Cursors are
//! microsecond timestamps rather than relay sequence numbers.

use serde::Deserialize;
use tracing::trace;

use crate::{CommitEvent, OpAction, RecordOp};

/// A jetstream envelope.
#[derive(Debug, Deserialize)]
pub struct JetstreamEvent {
    pub did: String,
    pub time_us: i64,
    /// "commit", "identity" or "account".
    pub kind: String,
    pub commit: Option<JetstreamCommit>,
}

#[derive(Debug, Deserialize)]
pub struct JetstreamCommit {
    pub rev: String,
    /// "create", "update" or "delete".
    pub operation: String,
    pub collection: String,
    pub rkey: String,
    /// Absent for deletes.
    pub record: Option<serde_json::Value>,
    pub cid: Option<String>,
}

impl JetstreamEvent {
    /// Parse a jetstream text message.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Normalize into a [`CommitEvent`]. Returns `None` for non-commit
    /// events and unknown operations.
    pub fn into_commit_event(self) -> Option<CommitEvent> {
        if self.kind != "commit" {
            trace!(kind = %self.kind, did = %self.did, "ignoring non-commit jetstream event");
            return None;
        }
        let commit = self.commit?;
        let action = OpAction::parse(&commit.operation)?;

        Some(CommitEvent {
            did: self.did,
            rev: commit.rev,
            seq: self.time_us,
            ops: vec![RecordOp {
                action,
                collection: commit.collection,
                rkey: commit.rkey,
                cid: commit.cid,
                record: commit.record,
            }],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commit_event() {
        let json = r#"{
            "did": "did:plc:test123",
            "time_us": 1706000000000000,
            "kind": "commit",
            "commit": {
                "rev": "3abc123",
                "operation": "create",
                "collection": "app.bsky.feed.post",
                "rkey": "3xyz789",
                "record": {"text": "hello", "createdAt": "2024-01-23T00:00:00Z"},
                "cid": "bafytest"
            }
        }"#;

        let evt = JetstreamEvent::parse(json).unwrap().into_commit_event().unwrap();
        assert_eq!(evt.did, "did:plc:test123");
        assert_eq!(evt.rev, "3abc123");
        assert_eq!(evt.seq, 1706000000000000);
        assert_eq!(evt.ops.len(), 1);
        assert_eq!(evt.ops[0].action, OpAction::Create);
        assert_eq!(evt.ops[0].collection, "app.bsky.feed.post");
        assert_eq!(evt.ops[0].cid.as_deref(), Some("bafytest"));
        assert!(evt.ops[0].record.is_some());
    }

    #[test]
    fn test_parse_delete_event() {
        let json = r#"{
            "did": "did:plc:test123",
            "time_us": 1706000000000000,
            "kind": "commit",
            "commit": {
                "rev": "3abc123",
                "operation": "delete",
                "collection": "app.bsky.feed.like",
                "rkey": "3xyz789"
            }
        }"#;

        let evt = JetstreamEvent::parse(json).unwrap().into_commit_event().unwrap();
        assert_eq!(evt.ops[0].action, OpAction::Delete);
        assert!(evt.ops[0].record.is_none());
        assert!(evt.ops[0].cid.is_none());
    }

    #[test]
    fn test_identity_event_is_skipped() {
        let json = r#"{
            "did": "did:plc:test123",
            "time_us": 1706000000000000,
            "kind": "identity"
        }"#;

        assert!(JetstreamEvent::parse(json).unwrap().into_commit_event().is_none());
    }

    #[test]
    fn test_unknown_operation_is_skipped() {
        let json = r#"{
            "did": "did:plc:test123",
            "time_us": 1706000000000000,
            "kind": "commit",
            "commit": {
                "rev": "3abc123",
                "operation": "truncate",
                "collection": "app.bsky.feed.post",
                "rkey": "3xyz789"
            }
        }"#;

        assert!(JetstreamEvent::parse(json).unwrap().into_commit_event().is_none());
    }

    #[test]
    fn test_malformed_json_errors() {
        assert!(JetstreamEvent::parse("{not json").is_err());
    }
}
