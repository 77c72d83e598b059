//! Firehose frame decoding.
//!
//! The firehose (`com.atproto.sync.subscribeRepos`) frames every message as
//! two concatenated CBOR values: a header `{op, t}` and a typed payload.
//! Commit payloads carry a CAR block store with the record blocks touched by
//! the commit. This module turns raw frames into [`CommitEvent`]s; the
//! connection loop itself lives with the sync engine.

use std::io::Cursor;

use ipld_core::cid::Cid;
use ipld_core::ipld::Ipld;
use serde::Deserialize;
use tracing::{debug, trace, warn};

use crate::car::parse_block_map;
use crate::event::split_record_path;
use crate::ipld::ipld_to_json;
use crate::{AtprotoError, CommitEvent, OpAction, RecordOp};

/// A decoded firehose frame.
#[derive(Debug)]
pub enum FirehoseMessage {
    Commit(CommitEvent),
    /// `#info` frame, e.g. `OutdatedCursor`.
    Info {
        name: Option<String>,
        message: Option<String>,
    },
    /// Error frame (`op = -1`).
    Error {
        error: Option<String>,
        message: Option<String>,
    },
    /// Frame types we do not process (`#identity`, `#account`, ...).
    Ignored,
}

impl FirehoseMessage {
    /// Whether this is an error frame that invalidates our cursor and
    /// requires reconnecting without one.
    pub fn is_cursor_error(&self) -> bool {
        matches!(
            self,
            FirehoseMessage::Error { error: Some(e), .. }
                if e == "FutureCursor" || e == "ConsumerTooSlow"
        )
    }
}

/// Decode a single binary firehose frame.
pub async fn decode_frame(data: &[u8]) -> Result<FirehoseMessage, AtprotoError> {
    let (header, payload_offset) = decode_frame_header(data)?;
    let payload = &data[payload_offset..];

    if header.op != 1 {
        if header.op == -1 {
            let err: ErrorFrame = serde_ipld_dagcbor::from_slice(payload).unwrap_or(ErrorFrame {
                error: None,
                message: None,
            });
            return Ok(FirehoseMessage::Error {
                error: err.error,
                message: err.message,
            });
        }
        return Ok(FirehoseMessage::Ignored);
    }

    match header.t.as_deref() {
        Some("#commit") => {
            let commit: CommitFrame = serde_ipld_dagcbor::from_slice(payload).map_err(|e| {
                AtprotoError::CborDecode(format!("failed to decode commit frame: {e}"))
            })?;
            Ok(FirehoseMessage::Commit(commit_to_event(commit).await?))
        }
        Some("#info") => {
            let info: InfoFrame = serde_ipld_dagcbor::from_slice(payload).map_err(|e| {
                AtprotoError::CborDecode(format!("failed to decode info frame: {e}"))
            })?;
            debug!(name = ?info.name, message = ?info.message, "firehose info frame");
            Ok(FirehoseMessage::Info {
                name: info.name,
                message: info.message,
            })
        }
        Some(t) => {
            trace!(frame_type = %t, "ignoring firehose frame");
            Ok(FirehoseMessage::Ignored)
        }
        None => Ok(FirehoseMessage::Ignored),
    }
}

/// Convert a commit frame into the normalized event, resolving record blocks
/// from the frame's CAR store and normalizing DAG-CBOR to JSON.
async fn commit_to_event(commit: CommitFrame) -> Result<CommitEvent, AtprotoError> {
    let blocks = match commit.blocks {
        Some(ref data) if !data.is_empty() => parse_block_map(data).await?.1,
        _ => Default::default(),
    };

    let mut ops = Vec::with_capacity(commit.ops.len());

    for op in &commit.ops {
        let Some(action) = OpAction::parse(&op.action) else {
            trace!(action = %op.action, "unknown op action");
            continue;
        };

        let Some((collection, rkey)) = split_record_path(&op.path) else {
            warn!(path = %op.path, repo = %commit.repo, "malformed record path, skipping op");
            continue;
        };

        let (cid, record) = match action {
            OpAction::Delete => (None, None),
            OpAction::Create | OpAction::Update => {
                let Some(ref cid) = op.cid else {
                    trace!(path = %op.path, "create/update op without cid, skipping");
                    continue;
                };
                let cid_str = cid.to_string();
                let Some(block) = blocks.get(&cid_str) else {
                    warn!(path = %op.path, cid = %cid_str, "record block missing from commit, skipping op");
                    continue;
                };
                let ipld: Ipld = serde_ipld_dagcbor::from_slice(block).map_err(|e| {
                    AtprotoError::CborDecode(format!("failed to decode record block: {e}"))
                })?;
                (Some(cid_str), Some(ipld_to_json(ipld)))
            }
        };

        ops.push(RecordOp {
            action,
            collection: collection.to_string(),
            rkey: rkey.to_string(),
            cid,
            record,
        });
    }

    Ok(CommitEvent {
        did: commit.repo,
        rev: commit.rev,
        seq: commit.seq,
        ops,
    })
}

/// Decode the frame header and return it along with the payload offset.
fn decode_frame_header(data: &[u8]) -> Result<(FrameHeader, usize), AtprotoError> {
    // ciborium tracks how far it read, which tells us where the payload
    // starts in the concatenated frame.
    let mut cursor = Cursor::new(data);
    let header: FrameHeader = ciborium::from_reader(&mut cursor)
        .map_err(|e| AtprotoError::CborDecode(format!("failed to decode frame header: {e}")))?;
    let offset = cursor.position() as usize;
    Ok((header, offset))
}

#[derive(Debug, Deserialize)]
struct FrameHeader {
    /// 1 = message, -1 = error.
    op: i32,
    /// Frame type, e.g. "#commit".
    t: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommitFrame {
    seq: i64,
    repo: String,
    rev: String,
    #[serde(with = "serde_bytes", default)]
    blocks: Option<Vec<u8>>,
    ops: Vec<RepoOpFrame>,
    #[allow(dead_code)]
    #[serde(default)]
    time: Option<String>,
    #[allow(dead_code)]
    #[serde(rename = "tooBig", default)]
    too_big: bool,
    #[allow(dead_code)]
    #[serde(default)]
    since: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RepoOpFrame {
    action: String,
    path: String,
    cid: Option<Cid>,
}

#[derive(Debug, Deserialize)]
struct InfoFrame {
    name: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorFrame {
    error: Option<String>,
    message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    fn make_frame<T: Serialize>(op: i32, t: Option<&str>, payload: &T) -> Vec<u8> {
        #[derive(Serialize)]
        struct Header<'a> {
            op: i32,
            #[serde(skip_serializing_if = "Option::is_none")]
            t: Option<&'a str>,
        }

        let mut data = serde_ipld_dagcbor::to_vec(&Header { op, t }).unwrap();
        data.extend(serde_ipld_dagcbor::to_vec(payload).unwrap());
        data
    }

    #[test]
    fn test_decode_frame_header() {
        #[derive(Serialize)]
        struct Dummy {
            seq: i64,
        }

        let frame = make_frame(1, Some("#commit"), &Dummy { seq: 12345 });
        let (header, offset) = decode_frame_header(&frame).unwrap();
        assert_eq!(header.op, 1);
        assert_eq!(header.t.as_deref(), Some("#commit"));
        assert!(offset > 0 && offset < frame.len());
    }

    #[test]
    fn test_decode_frame_header_invalid() {
        assert!(decode_frame_header(&[0xFF, 0xFF, 0xFF]).is_err());
    }

    #[tokio::test]
    async fn test_decode_error_frame() {
        #[derive(Serialize)]
        struct ErrPayload {
            error: String,
            message: String,
        }

        let frame = make_frame(
            -1,
            None,
            &ErrPayload {
                error: "FutureCursor".into(),
                message: "cursor is in the future".into(),
            },
        );

        let msg = decode_frame(&frame).await.unwrap();
        assert!(msg.is_cursor_error());
    }

    #[tokio::test]
    async fn test_decode_error_frame_non_cursor() {
        #[derive(Serialize)]
        struct ErrPayload {
            error: String,
            message: String,
        }

        let frame = make_frame(
            -1,
            None,
            &ErrPayload {
                error: "Unknown".into(),
                message: "something else".into(),
            },
        );

        let msg = decode_frame(&frame).await.unwrap();
        assert!(matches!(msg, FirehoseMessage::Error { .. }));
        assert!(!msg.is_cursor_error());
    }

    #[tokio::test]
    async fn test_decode_info_frame() {
        #[derive(Serialize)]
        struct Info {
            name: String,
            message: String,
        }

        let frame = make_frame(
            1,
            Some("#info"),
            &Info {
                name: "OutdatedCursor".into(),
                message: "cursor too old".into(),
            },
        );

        let msg = decode_frame(&frame).await.unwrap();
        match msg {
            FirehoseMessage::Info { name, .. } => {
                assert_eq!(name.as_deref(), Some("OutdatedCursor"));
            }
            other => panic!("expected info frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_decode_identity_frame_ignored() {
        #[derive(Serialize)]
        struct Identity {
            did: String,
        }

        let frame = make_frame(
            1,
            Some("#identity"),
            &Identity {
                did: "did:plc:abc".into(),
            },
        );

        let msg = decode_frame(&frame).await.unwrap();
        assert!(matches!(msg, FirehoseMessage::Ignored));
    }

    #[tokio::test]
    async fn test_decode_commit_with_delete_op() {
        #[derive(Serialize)]
        struct Op {
            action: String,
            path: String,
            cid: Option<u8>, // serializes as null when None
        }

        #[derive(Serialize)]
        struct Commit {
            seq: i64,
            repo: String,
            rev: String,
            ops: Vec<Op>,
        }

        let frame = make_frame(
            1,
            Some("#commit"),
            &Commit {
                seq: 99,
                repo: "did:plc:test".into(),
                rev: "3abc".into(),
                ops: vec![Op {
                    action: "delete".into(),
                    path: "app.bsky.feed.post/3xyz".into(),
                    cid: None,
                }],
            },
        );

        let msg = decode_frame(&frame).await.unwrap();
        match msg {
            FirehoseMessage::Commit(evt) => {
                assert_eq!(evt.did, "did:plc:test");
                assert_eq!(evt.rev, "3abc");
                assert_eq!(evt.seq, 99);
                assert_eq!(evt.ops.len(), 1);
                assert_eq!(evt.ops[0].action, OpAction::Delete);
                assert_eq!(evt.ops[0].collection, "app.bsky.feed.post");
                assert_eq!(evt.ops[0].rkey, "3xyz");
                assert!(evt.ops[0].record.is_none());
            }
            other => panic!("expected commit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_decode_commit_skips_malformed_path() {
        #[derive(Serialize)]
        struct Op {
            action: String,
            path: String,
            cid: Option<u8>,
        }

        #[derive(Serialize)]
        struct Commit {
            seq: i64,
            repo: String,
            rev: String,
            ops: Vec<Op>,
        }

        let frame = make_frame(
            1,
            Some("#commit"),
            &Commit {
                seq: 1,
                repo: "did:plc:test".into(),
                rev: "3abc".into(),
                ops: vec![Op {
                    action: "delete".into(),
                    path: "no-slash".into(),
                    cid: None,
                }],
            },
        );

        let msg = decode_frame(&frame).await.unwrap();
        match msg {
            FirehoseMessage::Commit(evt) => assert!(evt.ops.is_empty()),
            other => panic!("expected commit, got {other:?}"),
        }
    }
}
