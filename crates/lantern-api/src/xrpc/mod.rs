//! XRPC surface compatible with standard clients.
//!
//! Endpoints follow the `/xrpc/<nsid>` convention. Everything is served from
//! the local index through the shared hydrator; endpoints we do not index
//! enough data for answer a structured `NotImplemented` error.

mod actor;
mod feed;
mod graph;
mod notification;
mod repo;
mod unspecced;

use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};

use crate::hydration::actor::ActorInfo;
use crate::hydration::HydratedPost;
use crate::state::AppState;
use crate::views::profile_view_basic;
use crate::ApiError;

pub(crate) fn xrpc_router() -> Router<Arc<AppState>> {
    Router::new()
        // com.atproto.*
        .route("/xrpc/com.atproto.identity.resolveHandle", get(resolve_handle))
        .route("/xrpc/com.atproto.repo.getRecord", get(repo::get_record))
        // app.bsky.actor.*
        .route("/xrpc/app.bsky.actor.getProfile", get(actor::get_profile))
        .route("/xrpc/app.bsky.actor.getProfiles", get(actor::get_profiles))
        .route("/xrpc/app.bsky.actor.getPreferences", get(actor::get_preferences))
        .route("/xrpc/app.bsky.actor.putPreferences", post(actor::put_preferences))
        .route("/xrpc/app.bsky.actor.searchActors", get(not_implemented))
        .route("/xrpc/app.bsky.actor.searchActorsTypeahead", get(not_implemented))
        // app.bsky.feed.*
        .route("/xrpc/app.bsky.feed.getTimeline", get(feed::get_timeline))
        .route("/xrpc/app.bsky.feed.getAuthorFeed", get(feed::get_author_feed))
        .route("/xrpc/app.bsky.feed.getPostThread", get(feed::get_post_thread))
        .route("/xrpc/app.bsky.feed.getPosts", get(feed::get_posts))
        .route("/xrpc/app.bsky.feed.getLikes", get(feed::get_likes))
        .route("/xrpc/app.bsky.feed.getRepostedBy", get(feed::get_reposted_by))
        .route("/xrpc/app.bsky.feed.getActorLikes", get(feed::get_actor_likes))
        .route("/xrpc/app.bsky.feed.getFeed", get(not_implemented))
        .route("/xrpc/app.bsky.feed.getFeedGenerator", get(not_implemented))
        // app.bsky.graph.*
        .route("/xrpc/app.bsky.graph.getFollows", get(graph::get_follows))
        .route("/xrpc/app.bsky.graph.getFollowers", get(graph::get_followers))
        .route("/xrpc/app.bsky.graph.getBlocks", get(graph::get_blocks))
        .route("/xrpc/app.bsky.graph.getMutes", get(empty_mutes))
        .route("/xrpc/app.bsky.graph.getRelationships", get(not_implemented))
        .route("/xrpc/app.bsky.graph.getLists", get(not_implemented))
        .route("/xrpc/app.bsky.graph.getList", get(not_implemented))
        // app.bsky.notification.*
        .route(
            "/xrpc/app.bsky.notification.listNotifications",
            get(notification::list_notifications),
        )
        .route(
            "/xrpc/app.bsky.notification.getUnreadCount",
            get(notification::get_unread_count),
        )
        .route(
            "/xrpc/app.bsky.notification.updateSeen",
            post(notification::update_seen),
        )
        // app.bsky.labeler.*
        .route("/xrpc/app.bsky.labeler.getServices", get(empty_labeler_services))
        // app.bsky.unspecced.*
        .route("/xrpc/app.bsky.unspecced.getConfig", get(get_config))
        .route("/xrpc/app.bsky.unspecced.getTrendingTopics", get(empty_trending))
        .route(
            "/xrpc/app.bsky.unspecced.getPostThreadV2",
            get(unspecced::get_post_thread_v2),
        )
}

async fn not_implemented() -> ApiError {
    ApiError::NotImplemented
}

async fn empty_mutes() -> Json<Value> {
    Json(json!({ "mutes": [] }))
}

async fn empty_labeler_services() -> Json<Value> {
    Json(json!({ "views": [] }))
}

async fn empty_trending() -> Json<Value> {
    Json(json!({ "topics": [], "suggested": [] }))
}

async fn get_config() -> Json<Value> {
    Json(json!({}))
}

#[derive(Debug, serde::Deserialize)]
struct ResolveHandleQuery {
    handle: String,
}

async fn resolve_handle(
    State(state): State<Arc<AppState>>,
    axum::extract::Query(query): axum::extract::Query<ResolveHandleQuery>,
) -> Result<Json<Value>, ApiError> {
    let ident = state.dir.lookup_handle(&query.handle).await?;
    Ok(Json(json!({ "did": ident.did })))
}

// =============================================================================
// Shared helpers
// =============================================================================

/// Clamp a `limit` query parameter into `1..=max`, with a default.
pub(crate) fn clamp_limit(raw: Option<&String>, default: i64, max: i64) -> i64 {
    raw.and_then(|s| s.parse::<i64>().ok())
        .filter(|l| *l > 0 && *l <= max)
        .unwrap_or(default)
}

/// Parse repeated query parameters (`?uris=a&uris=b`) out of a raw query
/// string, percent-decoding values.
pub(crate) fn repeated_params(raw_query: &str, key: &str) -> Vec<String> {
    raw_query
        .split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            if k != key {
                return None;
            }
            Some(percent_decode(v))
        })
        .collect()
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = &value[i + 1..i + 3];
                match u8::from_str_radix(hex, 16) {
                    Ok(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Build an `app.bsky.feed.defs#postView`.
pub(crate) fn post_view(post: &HydratedPost, author: &ActorInfo) -> Value {
    let mut view = json!({
        "$type": "app.bsky.feed.defs#postView",
        "uri": post.uri,
        "cid": post.cid,
        "author": profile_view_basic(author),
        "record": post.record,
        "indexedAt": post.post.created_at,
    });

    if post.like_count > 0 {
        view["likeCount"] = json!(post.like_count);
    }
    if post.repost_count > 0 {
        view["repostCount"] = json!(post.repost_count);
    }
    if post.reply_count > 0 {
        view["replyCount"] = json!(post.reply_count);
    }
    if let Some(like) = &post.viewer_like {
        view["viewer"] = json!({ "like": like });
    }
    if let Some(embed) = &post.embed {
        view["embed"] = embed.clone();
    }

    view
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(None, 50, 100), 50);
        assert_eq!(clamp_limit(Some(&"25".to_string()), 50, 100), 25);
        assert_eq!(clamp_limit(Some(&"500".to_string()), 50, 100), 50);
        assert_eq!(clamp_limit(Some(&"0".to_string()), 50, 100), 50);
        assert_eq!(clamp_limit(Some(&"junk".to_string()), 50, 100), 50);
    }

    #[test]
    fn test_repeated_params() {
        let query = "uris=at%3A%2F%2Fdid%3Aplc%3Aa%2Fapp.bsky.feed.post%2F1&uris=at%3A%2F%2Fdid%3Aplc%3Ab%2Fapp.bsky.feed.post%2F2&limit=5";
        let uris = repeated_params(query, "uris");
        assert_eq!(
            uris,
            vec![
                "at://did:plc:a/app.bsky.feed.post/1",
                "at://did:plc:b/app.bsky.feed.post/2"
            ]
        );
        assert!(repeated_params(query, "absent").is_empty());
    }

    #[test]
    fn test_percent_decode_passthrough() {
        assert_eq!(percent_decode("plain-value"), "plain-value");
        assert_eq!(percent_decode("a+b"), "a b");
        assert_eq!(percent_decode("bad%zz"), "bad%zz");
    }
}
