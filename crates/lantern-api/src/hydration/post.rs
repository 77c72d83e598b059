//! Post hydration: record, author, counts, viewer state and embeds.

use serde_json::{json, Value};
use tracing::{error, warn};

use lantern_atproto::records::{Embed, FeedPost, LIKE_COLLECTION, POST_COLLECTION};
use lantern_atproto::{record_uri, AtUri};
use lantern_index::models::Post;

use crate::views::{
    feed_fullsize_url, feed_thumbnail_url, profile_view_basic, video_playlist_url,
    video_thumbnail_url,
};
use crate::ApiError;

use super::Hydrator;

/// Substitute for rows indexed before CIDs were recorded. Hydration must not
/// fail on them, but the gap is loud in the logs.
pub const PLACEHOLDER_CID: &str = "bafyreiapw4hagb5ehqgoeho4v23vf7fhlqey4b7xvjpy76krgkqx7xlolu";

#[derive(Debug, Clone)]
pub struct HydratedPost {
    pub id: i64,
    pub uri: String,
    pub cid: String,
    /// The record as stored, for passthrough into views.
    pub record: Value,
    pub post: FeedPost,
    pub author_did: String,
    pub reply_to: i64,
    pub reply_to_usr: i64,
    pub in_thread: i64,
    pub like_count: i64,
    pub repost_count: i64,
    pub reply_count: i64,
    /// URI of the viewer's like, if any.
    pub viewer_like: Option<String>,
    /// Formatted embed view, one quote level deep.
    pub embed: Option<Value>,
}

impl Hydrator {
    /// Hydrate a post by URI. `auto_fetch` lets the read path pull a
    /// placeholder's record synchronously before giving up.
    pub async fn hydrate_post(
        &self,
        uri: &str,
        viewer: Option<&str>,
        auto_fetch: bool,
    ) -> Result<HydratedPost, ApiError> {
        let row = self.indexer().get_post_by_uri(uri).await?;
        self.hydrate_post_row(uri, row, viewer, auto_fetch).await
    }

    /// Hydrate a post whose row the caller already holds.
    pub async fn hydrate_post_row(
        &self,
        uri: &str,
        row: Post,
        viewer: Option<&str>,
        auto_fetch: bool,
    ) -> Result<HydratedPost, ApiError> {
        let mut row = row;

        if !row.has_content() {
            if auto_fetch {
                self.indexer().missing().track(uri, true).await?;
                row = self.indexer().get_post_by_uri(uri).await?;
            }
            if !row.has_content() {
                return Err(ApiError::NotFound(format!("post not found: {uri}")));
            }
        }

        let raw = row.raw.as_deref().unwrap_or_default();
        let record: Value = serde_json::from_slice(raw)
            .map_err(|e| ApiError::Internal(format!("stored post is undecodable: {e}")))?;
        let post: FeedPost = serde_json::from_value(record.clone())
            .map_err(|e| ApiError::Internal(format!("stored post has bad shape: {e}")))?;

        let author_did = AtUri::extract_authority(uri).to_string();
        if author_did.is_empty() {
            return Err(ApiError::InvalidRequest(format!("bad post uri: {uri}")));
        }

        let counts = self.post_counts(row.id);
        let like = self.viewer_like(row.id, viewer);
        let embed = self.format_embed(&post, &author_did, viewer);

        let (counts, viewer_like, embed) = tokio::join!(counts, like, embed);
        let (like_count, repost_count, reply_count) = counts?;

        let mut cid = row.cid.clone();
        if cid.is_empty() {
            error!(uri = %uri, "post row has no cid");
            cid = PLACEHOLDER_CID.to_string();
        }

        Ok(HydratedPost {
            id: row.id,
            uri: uri.to_string(),
            cid,
            record,
            post,
            author_did,
            reply_to: row.reply_to,
            reply_to_usr: row.reply_to_usr,
            in_thread: row.in_thread,
            like_count,
            repost_count,
            reply_count,
            viewer_like: viewer_like?,
            embed,
        })
    }

    /// Engagement counts, the three queries in parallel.
    pub(crate) async fn post_counts(&self, post_id: i64) -> Result<(i64, i64, i64), ApiError> {
        let db = self.indexer().db();

        let likes = async {
            sqlx::query_scalar::<_, i64>("SELECT count(*) FROM likes WHERE subject = $1")
                .bind(post_id)
                .fetch_one(&db.hot)
                .await
        };
        let reposts = async {
            sqlx::query_scalar::<_, i64>("SELECT count(*) FROM reposts WHERE subject = $1")
                .bind(post_id)
                .fetch_one(&db.hot)
                .await
        };
        let replies = async {
            sqlx::query_scalar::<_, i64>("SELECT count(*) FROM posts WHERE reply_to = $1")
                .bind(post_id)
                .fetch_one(&db.hot)
                .await
        };

        let (likes, reposts, replies) = tokio::join!(likes, reposts, replies);
        Ok((
            likes.map_err(lantern_index::IndexError::from)?,
            reposts.map_err(lantern_index::IndexError::from)?,
            replies.map_err(lantern_index::IndexError::from)?,
        ))
    }

    /// The viewer's like URI for a post, if any.
    async fn viewer_like(
        &self,
        post_id: i64,
        viewer: Option<&str>,
    ) -> Result<Option<String>, ApiError> {
        let Some(viewer) = viewer.filter(|v| !v.is_empty()) else {
            return Ok(None);
        };

        let rkey: Option<String> = sqlx::query_scalar(
            "SELECT l.rkey FROM likes l
             WHERE l.subject = $1
             AND l.author = (SELECT id FROM repos WHERE did = $2)",
        )
        .bind(post_id)
        .bind(viewer)
        .fetch_optional(&self.indexer().db().hot)
        .await
        .map_err(lantern_index::IndexError::from)?;

        Ok(rkey.map(|rkey| record_uri(viewer, LIKE_COLLECTION, &rkey)))
    }

    /// Format a post's embed into its view shape. Image, external and video
    /// blobs are rewritten to CDN URLs; record embeds get one level of quote
    /// hydration.
    async fn format_embed(
        &self,
        post: &FeedPost,
        author_did: &str,
        viewer: Option<&str>,
    ) -> Option<Value> {
        let embed = post.parsed_embed()?;
        match embed {
            Embed::Images(_) | Embed::External(_) | Embed::Video(_) => {
                media_view(&embed, author_did)
            }
            Embed::Record(record) => {
                let inner = self.hydrate_embedded_record(&record.record.uri, viewer).await;
                Some(json!({
                    "$type": "app.bsky.embed.record#view",
                    "record": inner,
                }))
            }
            Embed::RecordWithMedia(rwm) => {
                let inner = self
                    .hydrate_embedded_record(&rwm.record.record.uri, viewer)
                    .await;
                let media = rwm
                    .parsed_media()
                    .and_then(|media| media_view(&media, author_did));
                Some(json!({
                    "$type": "app.bsky.embed.recordWithMedia#view",
                    "record": {
                        "$type": "app.bsky.embed.record#view",
                        "record": inner,
                    },
                    "media": media,
                }))
            }
        }
    }

    /// Hydrate a quoted record one level deep: the quoted post's record and
    /// basic author view plus counts, with no further embed expansion.
    async fn hydrate_embedded_record(&self, uri: &str, _viewer: Option<&str>) -> Value {
        if !uri.contains(POST_COLLECTION) {
            // Feed generators, lists and other non-post embeds are not
            // expanded.
            return view_not_found(uri, false);
        }

        let row = match self.indexer().get_post_by_uri(uri).await {
            Ok(row) => row,
            Err(e) => {
                warn!(uri = %uri, error = %e, "failed to load quoted post");
                return view_not_found(uri, true);
            }
        };

        if !row.has_content() {
            return view_not_found(uri, true);
        }

        let raw = row.raw.as_deref().unwrap_or_default();
        let record: Value = match serde_json::from_slice(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(uri = %uri, error = %e, "quoted post is undecodable");
                return view_not_found(uri, true);
            }
        };

        let author_did = AtUri::extract_authority(uri).to_string();
        let author = match self.hydrate_actor(&author_did).await {
            Ok(info) => info,
            Err(e) => {
                warn!(did = %author_did, error = %e, "failed to hydrate quoted post author");
                return view_not_found(uri, true);
            }
        };

        let counts = match self.post_counts(row.id).await {
            Ok(counts) => counts,
            Err(e) => {
                warn!(uri = %uri, error = %e, "failed to count quoted post engagement");
                (0, 0, 0)
            }
        };
        let (like_count, repost_count, reply_count) = counts;

        let indexed_at = record
            .get("createdAt")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        let mut view = json!({
            "$type": "app.bsky.embed.record#viewRecord",
            "uri": uri,
            "cid": if row.cid.is_empty() { PLACEHOLDER_CID } else { row.cid.as_str() },
            "author": profile_view_basic(&author),
            "value": record,
            "indexedAt": indexed_at,
        });

        if like_count > 0 {
            view["likeCount"] = json!(like_count);
        }
        if repost_count > 0 {
            view["repostCount"] = json!(repost_count);
        }
        if reply_count > 0 {
            view["replyCount"] = json!(reply_count);
        }

        view
    }
}

fn view_not_found(uri: &str, not_found: bool) -> Value {
    let mut view = json!({
        "$type": "app.bsky.embed.record#viewNotFound",
        "uri": uri,
    });
    if not_found {
        view["notFound"] = json!(true);
    }
    view
}

/// Pure media-view construction for image/external/video embeds.
fn media_view(embed: &Embed, author_did: &str) -> Option<Value> {
    match embed {
        Embed::Images(images) => {
            let views: Vec<Value> = images
                .images
                .iter()
                .map(|img| {
                    json!({
                        "alt": img.alt,
                        "aspectRatio": img.aspect_ratio,
                        "fullsize": feed_fullsize_url(author_did, &img.image.cid.link),
                        "thumb": feed_thumbnail_url(author_did, &img.image.cid.link),
                    })
                })
                .collect();
            Some(json!({
                "$type": "app.bsky.embed.images#view",
                "images": views,
            }))
        }
        Embed::External(external) => {
            let thumb = external
                .external
                .thumb
                .as_ref()
                .map(|blob| feed_thumbnail_url(author_did, &blob.cid.link));
            Some(json!({
                "$type": "app.bsky.embed.external#view",
                "external": {
                    "uri": external.external.uri,
                    "title": external.external.title,
                    "description": external.external.description,
                    "thumb": thumb,
                },
            }))
        }
        Embed::Video(video) => {
            let cid = &video.video.cid.link;
            Some(json!({
                "$type": "app.bsky.embed.video#view",
                "cid": cid,
                "playlist": video_playlist_url(author_did, cid),
                "thumbnail": video_thumbnail_url(author_did, cid),
                "alt": video.alt,
                "aspectRatio": video.aspect_ratio,
            }))
        }
        Embed::Record(_) | Embed::RecordWithMedia(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_view_images() {
        let embed: Embed = serde_json::from_value(json!({
            "$type": "app.bsky.embed.images",
            "images": [
                {"image": {"ref": {"$link": "bafyimg"}, "mimeType": "image/jpeg"}, "alt": "a pic"}
            ]
        }))
        .unwrap();

        let view = media_view(&embed, "did:plc:a").unwrap();
        assert_eq!(view["$type"], "app.bsky.embed.images#view");
        assert_eq!(
            view["images"][0]["fullsize"],
            "https://cdn.bsky.app/img/feed_fullsize/plain/did:plc:a/bafyimg@jpeg"
        );
        assert_eq!(view["images"][0]["alt"], "a pic");
    }

    #[test]
    fn test_media_view_external_without_thumb() {
        let embed: Embed = serde_json::from_value(json!({
            "$type": "app.bsky.embed.external",
            "external": {"uri": "https://example.com", "title": "t", "description": "d"}
        }))
        .unwrap();

        let view = media_view(&embed, "did:plc:a").unwrap();
        assert_eq!(view["$type"], "app.bsky.embed.external#view");
        assert_eq!(view["external"]["thumb"], Value::Null);
    }

    #[test]
    fn test_media_view_video() {
        let embed: Embed = serde_json::from_value(json!({
            "$type": "app.bsky.embed.video",
            "video": {"ref": {"$link": "bafyvid"}, "mimeType": "video/mp4"}
        }))
        .unwrap();

        let view = media_view(&embed, "did:plc:a").unwrap();
        assert_eq!(
            view["playlist"],
            "https://video.bsky.app/watch/did%3Aplc%3Aa/bafyvid/playlist.m3u8"
        );
    }

    #[test]
    fn test_view_not_found_marker() {
        let v = view_not_found("at://x/app.bsky.feed.generator/y", false);
        assert_eq!(v["$type"], "app.bsky.embed.record#viewNotFound");
        assert!(v.get("notFound").is_none());

        let v = view_not_found("at://x/app.bsky.feed.post/y", true);
        assert_eq!(v["notFound"], json!(true));
    }
}
