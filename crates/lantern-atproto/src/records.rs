//! Typed views over the record JSON we index.
//!
//! Records arrive either as jetstream JSON or as firehose DAG-CBOR that has
//! been normalized to JSON (see [`crate::ipld_to_json`]). Both forms carry
//! CID links as `{"$link": "..."}`, which is what [`CidLink`] expects.
//!
//! Fields we do not care about are ignored; fields that may be absent in the
//! wild default to `None` so a single odd record does not sink the whole
//! commit.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::AtprotoError;

pub const POST_COLLECTION: &str = "app.bsky.feed.post";
pub const LIKE_COLLECTION: &str = "app.bsky.feed.like";
pub const REPOST_COLLECTION: &str = "app.bsky.feed.repost";
pub const FOLLOW_COLLECTION: &str = "app.bsky.graph.follow";
pub const BLOCK_COLLECTION: &str = "app.bsky.graph.block";
pub const LIST_COLLECTION: &str = "app.bsky.graph.list";
pub const LISTITEM_COLLECTION: &str = "app.bsky.graph.listitem";
pub const LISTBLOCK_COLLECTION: &str = "app.bsky.graph.listblock";
pub const STARTERPACK_COLLECTION: &str = "app.bsky.graph.starterpack";
pub const PROFILE_COLLECTION: &str = "app.bsky.actor.profile";
pub const FEEDGEN_COLLECTION: &str = "app.bsky.feed.generator";
pub const THREADGATE_COLLECTION: &str = "app.bsky.feed.threadgate";
pub const POSTGATE_COLLECTION: &str = "app.bsky.feed.postgate";

/// The rkey used by singleton profile records.
pub const PROFILE_RKEY: &str = "self";

/// A CID reference in normalized record JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CidLink {
    #[serde(rename = "$link")]
    pub link: String,
}

/// A blob reference (image, video, external thumb).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobRef {
    #[serde(rename = "ref")]
    pub cid: CidLink,
    #[serde(rename = "mimeType", default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: Option<i64>,
}

/// A strong reference to another record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrongRef {
    pub uri: String,
    #[serde(default)]
    pub cid: Option<String>,
}

/// Reply references on a post.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyRef {
    pub parent: StrongRef,
    pub root: StrongRef,
}

/// A rich-text facet. Features are kept raw so unknown feature types pass
/// through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Facet {
    #[serde(default)]
    pub features: Vec<serde_json::Value>,
    #[serde(default)]
    pub index: Option<serde_json::Value>,
}

/// app.bsky.feed.post
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedPost {
    #[serde(default)]
    pub text: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(default)]
    pub reply: Option<ReplyRef>,
    /// Kept raw; use [`FeedPost::parsed_embed`] for typed access.
    #[serde(default)]
    pub embed: Option<serde_json::Value>,
    #[serde(default)]
    pub facets: Option<Vec<Facet>>,
    #[serde(default)]
    pub langs: Option<Vec<String>>,
}

impl FeedPost {
    /// Typed view of the embed, if it is a kind we understand.
    pub fn parsed_embed(&self) -> Option<Embed> {
        self.embed
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// The URI of a quoted post, if this post embeds one.
    pub fn quoted_post_uri(&self) -> Option<String> {
        let uri = match self.parsed_embed()? {
            Embed::Record(r) => r.record.uri,
            Embed::RecordWithMedia(r) => r.record.record.uri,
            _ => return None,
        };
        if uri.contains(POST_COLLECTION) {
            Some(uri)
        } else {
            None
        }
    }

    /// DIDs mentioned via rich-text mention facets.
    pub fn mention_dids(&self) -> Vec<String> {
        let Some(facets) = &self.facets else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for facet in facets {
            for feature in &facet.features {
                let is_mention = feature
                    .get("$type")
                    .and_then(|t| t.as_str())
                    .is_some_and(|t| t == "app.bsky.richtext.facet#mention");
                if !is_mention {
                    continue;
                }
                if let Some(did) = feature.get("did").and_then(|d| d.as_str()) {
                    out.push(did.to_string());
                }
            }
        }
        out
    }
}

/// Typed embed variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "$type")]
pub enum Embed {
    #[serde(rename = "app.bsky.embed.images")]
    Images(EmbedImages),
    #[serde(rename = "app.bsky.embed.external")]
    External(EmbedExternal),
    #[serde(rename = "app.bsky.embed.video")]
    Video(EmbedVideo),
    #[serde(rename = "app.bsky.embed.record")]
    Record(EmbedRecord),
    #[serde(rename = "app.bsky.embed.recordWithMedia")]
    RecordWithMedia(EmbedRecordWithMedia),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedImages {
    pub images: Vec<EmbedImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedImage {
    pub image: BlobRef,
    #[serde(default)]
    pub alt: String,
    #[serde(rename = "aspectRatio", default)]
    pub aspect_ratio: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedExternal {
    pub external: ExternalLink,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalLink {
    pub uri: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub thumb: Option<BlobRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedVideo {
    pub video: BlobRef,
    #[serde(default)]
    pub alt: Option<String>,
    #[serde(rename = "aspectRatio", default)]
    pub aspect_ratio: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedRecord {
    pub record: StrongRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedRecordWithMedia {
    pub record: EmbedRecord,
    #[serde(default)]
    pub media: Option<serde_json::Value>,
}

impl EmbedRecordWithMedia {
    /// Typed view of the media half, if it is a kind we understand.
    pub fn parsed_media(&self) -> Option<Embed> {
        self.media
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// app.bsky.feed.like
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedLike {
    pub subject: StrongRef,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

/// app.bsky.feed.repost
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedRepost {
    pub subject: StrongRef,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

/// app.bsky.graph.follow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphFollow {
    /// DID of the followed account.
    pub subject: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

/// app.bsky.graph.block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphBlock {
    /// DID of the blocked account.
    pub subject: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

/// app.bsky.graph.list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphList {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

/// app.bsky.graph.listitem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphListItem {
    /// DID of the listed account.
    pub subject: String,
    /// AT-URI of the list.
    pub list: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

/// app.bsky.graph.listblock
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphListBlock {
    /// AT-URI of the blocked list.
    pub subject: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

/// app.bsky.graph.starterpack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphStarterPack {
    #[serde(default)]
    pub name: Option<String>,
    /// AT-URI of the backing list.
    pub list: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

/// app.bsky.actor.profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorProfile {
    #[serde(rename = "displayName", default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub avatar: Option<BlobRef>,
    #[serde(default)]
    pub banner: Option<BlobRef>,
}

/// app.bsky.feed.generator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedGeneratorRecord {
    /// Service DID of the generator.
    pub did: String,
    #[serde(rename = "displayName", default)]
    pub display_name: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

/// app.bsky.feed.threadgate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedThreadGate {
    /// AT-URI of the gated post.
    pub post: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

/// app.bsky.feed.postgate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedPostGate {
    /// AT-URI of the gated post.
    pub post: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

/// Parse a record timestamp, tolerating the common malformed shapes seen in
/// the wild: RFC3339 with or without fractional seconds, and naive datetimes
/// assumed UTC.
pub fn parse_datetime_lenient(s: &str) -> Result<DateTime<Utc>, AtprotoError> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s.trim_end_matches('Z'), fmt) {
            return Ok(naive.and_utc());
        }
    }
    Err(AtprotoError::InvalidTimestamp(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_post_with_reply() {
        let v = json!({
            "$type": "app.bsky.feed.post",
            "text": "hello back",
            "createdAt": "2024-05-01T12:00:00Z",
            "reply": {
                "parent": {"uri": "at://did:plc:a/app.bsky.feed.post/p", "cid": "bafyp"},
                "root": {"uri": "at://did:plc:a/app.bsky.feed.post/r", "cid": "bafyr"}
            }
        });
        let post: FeedPost = serde_json::from_value(v).unwrap();
        let reply = post.reply.unwrap();
        assert_eq!(reply.parent.uri, "at://did:plc:a/app.bsky.feed.post/p");
        assert_eq!(reply.root.cid.as_deref(), Some("bafyr"));
    }

    #[test]
    fn test_quoted_post_uri_from_record_embed() {
        let v = json!({
            "text": "look at this",
            "createdAt": "2024-05-01T12:00:00Z",
            "embed": {
                "$type": "app.bsky.embed.record",
                "record": {"uri": "at://did:plc:b/app.bsky.feed.post/q", "cid": "bafyq"}
            }
        });
        let post: FeedPost = serde_json::from_value(v).unwrap();
        assert_eq!(
            post.quoted_post_uri().as_deref(),
            Some("at://did:plc:b/app.bsky.feed.post/q")
        );
    }

    #[test]
    fn test_quoted_post_uri_from_record_with_media() {
        let v = json!({
            "text": "quote with pic",
            "createdAt": "2024-05-01T12:00:00Z",
            "embed": {
                "$type": "app.bsky.embed.recordWithMedia",
                "record": {
                    "record": {"uri": "at://did:plc:b/app.bsky.feed.post/q2", "cid": "bafyq2"}
                },
                "media": {
                    "$type": "app.bsky.embed.images",
                    "images": [{"image": {"ref": {"$link": "bafyimg"}, "mimeType": "image/jpeg"}, "alt": ""}]
                }
            }
        });
        let post: FeedPost = serde_json::from_value(v).unwrap();
        assert_eq!(
            post.quoted_post_uri().as_deref(),
            Some("at://did:plc:b/app.bsky.feed.post/q2")
        );
    }

    #[test]
    fn test_quoted_post_uri_ignores_non_post_subjects() {
        let v = json!({
            "text": "sharing a feed",
            "createdAt": "2024-05-01T12:00:00Z",
            "embed": {
                "$type": "app.bsky.embed.record",
                "record": {"uri": "at://did:plc:b/app.bsky.feed.generator/cool", "cid": "bafyg"}
            }
        });
        let post: FeedPost = serde_json::from_value(v).unwrap();
        assert!(post.quoted_post_uri().is_none());
    }

    #[test]
    fn test_unknown_embed_type_does_not_fail_post_parse() {
        let v = json!({
            "text": "future embed",
            "createdAt": "2024-05-01T12:00:00Z",
            "embed": {"$type": "app.bsky.embed.somethingNew", "payload": 1}
        });
        let post: FeedPost = serde_json::from_value(v).unwrap();
        assert!(post.parsed_embed().is_none());
        assert!(post.quoted_post_uri().is_none());
    }

    #[test]
    fn test_mention_dids() {
        let v = json!({
            "text": "hey @alice and @bob",
            "createdAt": "2024-05-01T12:00:00Z",
            "facets": [
                {
                    "index": {"byteStart": 4, "byteEnd": 10},
                    "features": [{"$type": "app.bsky.richtext.facet#mention", "did": "did:plc:alice"}]
                },
                {
                    "index": {"byteStart": 15, "byteEnd": 19},
                    "features": [
                        {"$type": "app.bsky.richtext.facet#link", "uri": "https://example.com"},
                        {"$type": "app.bsky.richtext.facet#mention", "did": "did:plc:bob"}
                    ]
                }
            ]
        });
        let post: FeedPost = serde_json::from_value(v).unwrap();
        assert_eq!(post.mention_dids(), vec!["did:plc:alice", "did:plc:bob"]);
    }

    #[test]
    fn test_parse_like() {
        let v = json!({
            "subject": {"uri": "at://did:plc:a/app.bsky.feed.post/p", "cid": "bafyp"},
            "createdAt": "2024-05-01T12:00:00Z"
        });
        let like: FeedLike = serde_json::from_value(v).unwrap();
        assert_eq!(like.subject.uri, "at://did:plc:a/app.bsky.feed.post/p");
    }

    #[test]
    fn test_parse_profile_with_avatar() {
        let v = json!({
            "displayName": "Alice",
            "avatar": {
                "$type": "blob",
                "ref": {"$link": "bafyavatar"},
                "mimeType": "image/jpeg",
                "size": 12345
            }
        });
        let profile: ActorProfile = serde_json::from_value(v).unwrap();
        assert_eq!(profile.avatar.unwrap().cid.link, "bafyavatar");
    }

    #[test]
    fn test_parse_datetime_lenient_rfc3339() {
        let t = parse_datetime_lenient("2024-05-01T12:00:00Z").unwrap();
        assert_eq!(t.timestamp(), 1714564800);
    }

    #[test]
    fn test_parse_datetime_lenient_fractional() {
        assert!(parse_datetime_lenient("2024-05-01T12:00:00.123456Z").is_ok());
    }

    #[test]
    fn test_parse_datetime_lenient_offset() {
        assert!(parse_datetime_lenient("2024-05-01T14:00:00+02:00").is_ok());
    }

    #[test]
    fn test_parse_datetime_lenient_naive() {
        assert!(parse_datetime_lenient("2024-05-01T12:00:00").is_ok());
    }

    #[test]
    fn test_parse_datetime_lenient_garbage() {
        assert!(parse_datetime_lenient("not a date").is_err());
    }
}
