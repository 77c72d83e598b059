//! app.bsky.feed.* endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, RawQuery, State};
use axum::http::HeaderMap;
use axum::response::Json;
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::future::join_all;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use lantern_atproto::record_uri;
use lantern_atproto::records::POST_COLLECTION;
use lantern_index::models::Post;

use crate::auth::{require_viewer, viewer_from_headers};
use crate::hydration::thread::ThreadTree;
use crate::state::AppState;
use crate::views::profile_view;
use crate::ApiError;

use super::{clamp_limit, post_view, repeated_params};

#[derive(Debug, Deserialize)]
pub(crate) struct FeedQuery {
    #[serde(default)]
    limit: Option<String>,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    actor: Option<String>,
    #[serde(default)]
    uri: Option<String>,
}

fn time_cursor(raw: Option<&String>) -> Result<DateTime<Utc>, ApiError> {
    match raw.filter(|c| !c.is_empty()) {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| ApiError::InvalidRequest("invalid cursor".into())),
        None => Ok(Utc::now()),
    }
}

const POST_COLUMNS: &str = "id, author, rkey, cid, not_found, raw, created, indexed, \
                            reposting, reply_to, reply_to_usr, in_thread";

/// Hydrate rows into `feedViewPost`s, skipping the ones that fail.
async fn feed_view_posts(
    state: &AppState,
    rows: Vec<Post>,
    viewer: Option<&str>,
) -> Vec<Value> {
    let futures = rows.into_iter().map(|row| async move {
        let repo = state.indexer.repos().get_by_id(row.author).await.ok()??;
        let uri = record_uri(&repo.did, POST_COLLECTION, &row.rkey);
        let hydrated = match state
            .hydrator
            .hydrate_post_row(&uri, row, viewer, false)
            .await
        {
            Ok(h) => h,
            Err(e) => {
                warn!(uri = %uri, error = %e, "failed to hydrate feed post");
                return None;
            }
        };
        let author = state.hydrator.hydrate_actor(&hydrated.author_did).await.ok()?;
        Some(json!({ "post": post_view(&hydrated, &author) }))
    });

    join_all(futures).await.into_iter().flatten().collect()
}

fn next_time_cursor(rows: &[Post]) -> Option<String> {
    rows.last()
        .map(|p| p.created.to_rfc3339_opts(SecondsFormat::Secs, true))
}

pub(crate) async fn get_timeline(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<FeedQuery>,
) -> Result<Json<Value>, ApiError> {
    let viewer = require_viewer(&headers)?;
    let limit = clamp_limit(query.limit.as_ref(), 50, 100);
    let before = time_cursor(query.cursor.as_ref())?;

    let viewer_id = state.indexer.repos().did_to_id(&viewer).await?;

    let rows: Vec<Post> = sqlx::query_as(&format!(
        "SELECT {POST_COLUMNS} FROM posts
         WHERE reply_to = 0
         AND author IN (SELECT subject FROM follows WHERE author = $1)
         AND created < $2
         AND not_found = false
         ORDER BY created DESC LIMIT $3"
    ))
    .bind(viewer_id)
    .bind(before)
    .bind(limit)
    .fetch_all(&state.indexer.db().crud)
    .await
    .map_err(lantern_index::IndexError::from)?;

    let cursor = next_time_cursor(&rows);
    let feed = feed_view_posts(&state, rows, Some(&viewer)).await;

    Ok(Json(json!({ "feed": feed, "cursor": cursor })))
}

pub(crate) async fn get_author_feed(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<FeedQuery>,
) -> Result<Json<Value>, ApiError> {
    let viewer = viewer_from_headers(&headers);
    let actor = query
        .actor
        .as_deref()
        .ok_or_else(|| ApiError::InvalidRequest("actor parameter is required".into()))?;
    let did = state.hydrator.resolve_did(actor).await?;
    let limit = clamp_limit(query.limit.as_ref(), 50, 100);
    let before = time_cursor(query.cursor.as_ref())?;

    let author_id = state.indexer.repos().did_to_id(&did).await?;

    let rows: Vec<Post> = sqlx::query_as(&format!(
        "SELECT {POST_COLUMNS} FROM posts
         WHERE author = $1 AND created < $2 AND not_found = false
         ORDER BY created DESC LIMIT $3"
    ))
    .bind(author_id)
    .bind(before)
    .bind(limit)
    .fetch_all(&state.indexer.db().crud)
    .await
    .map_err(lantern_index::IndexError::from)?;

    let cursor = next_time_cursor(&rows);
    let feed = feed_view_posts(&state, rows, viewer.as_deref()).await;

    Ok(Json(json!({ "feed": feed, "cursor": cursor })))
}

pub(crate) async fn get_post_thread(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<FeedQuery>,
) -> Result<Json<Value>, ApiError> {
    let viewer = viewer_from_headers(&headers);
    let uri = query
        .uri
        .as_deref()
        .ok_or_else(|| ApiError::InvalidRequest("uri parameter is required".into()))?;
    let uri = state.hydrator.normalize_uri(uri).await?;

    let anchor = state
        .hydrator
        .hydrate_post(&uri, viewer.as_deref(), false)
        .await
        .map_err(|_| ApiError::NotFound("post not found".into()))?;

    let root_id = if anchor.in_thread != 0 {
        anchor.in_thread
    } else {
        anchor.id
    };

    let rows: Vec<Post> = sqlx::query_as(&format!(
        "SELECT {POST_COLUMNS} FROM posts
         WHERE (id = $1 OR in_thread = $1) AND not_found = false
         ORDER BY created ASC"
    ))
    .bind(root_id)
    .fetch_all(&state.indexer.db().crud)
    .await
    .map_err(lantern_index::IndexError::from)?;

    let dids = author_dids(&state, &rows).await?;
    let tree = ThreadTree::build(rows, &dids);

    let Some(root_idx) = tree.index_of(root_id) else {
        return Err(ApiError::NotFound("thread root not found".into()));
    };

    let thread = build_thread_view(&state, &tree, root_idx, viewer.as_deref()).await;
    Ok(Json(json!({ "thread": thread })))
}

/// Map author ids to DIDs for a batch of posts.
pub(crate) async fn author_dids(
    state: &AppState,
    rows: &[Post],
) -> Result<HashMap<i64, String>, ApiError> {
    let mut dids = HashMap::new();
    for row in rows {
        if dids.contains_key(&row.author) {
            continue;
        }
        if let Some(repo) = state.indexer.repos().get_by_id(row.author).await? {
            dids.insert(row.author, repo.did);
        }
    }
    Ok(dids)
}

/// Recursive `threadViewPost` construction. Quote-level hydration inside
/// each post view stays one level deep; the thread nesting itself follows
/// the reply tree.
fn build_thread_view<'a>(
    state: &'a AppState,
    tree: &'a ThreadTree,
    node_idx: usize,
    viewer: Option<&'a str>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Value> + Send + 'a>> {
    Box::pin(async move {
        let node = tree.node(node_idx);

        let not_found = json!({
            "$type": "app.bsky.feed.defs#notFoundPost",
            "uri": node.uri,
        });

        if node.is_missing() {
            return not_found;
        }

        let hydrated = match state
            .hydrator
            .hydrate_post(&node.uri, viewer, false)
            .await
        {
            Ok(h) => h,
            Err(_) => return not_found,
        };
        let author = match state.hydrator.hydrate_actor(&hydrated.author_did).await {
            Ok(a) => a,
            Err(_) => return not_found,
        };

        let mut replies = Vec::with_capacity(node.children.len());
        for &child in &node.children {
            replies.push(build_thread_view(state, tree, child, viewer).await);
        }

        let mut view = json!({
            "$type": "app.bsky.feed.defs#threadViewPost",
            "post": post_view(&hydrated, &author),
        });
        if !replies.is_empty() {
            view["replies"] = json!(replies);
        }
        view
    })
}

pub(crate) async fn get_posts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    RawQuery(raw): RawQuery,
) -> Result<Json<Value>, ApiError> {
    let viewer = viewer_from_headers(&headers);
    let uris = repeated_params(raw.as_deref().unwrap_or_default(), "uris");
    if uris.is_empty() {
        return Err(ApiError::InvalidRequest("uris parameter is required".into()));
    }
    if uris.len() > 25 {
        return Err(ApiError::InvalidRequest("too many uris".into()));
    }

    let futures = uris.iter().map(|uri| {
        let state = &state;
        let viewer = viewer.as_deref();
        async move {
            let uri = state.hydrator.normalize_uri(uri).await.ok()?;
            let hydrated = state.hydrator.hydrate_post(&uri, viewer, false).await.ok()?;
            let author = state.hydrator.hydrate_actor(&hydrated.author_did).await.ok()?;
            Some(post_view(&hydrated, &author))
        }
    });

    let posts: Vec<Value> = join_all(futures).await.into_iter().flatten().collect();
    Ok(Json(json!({ "posts": posts })))
}

pub(crate) async fn get_likes(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FeedQuery>,
) -> Result<Json<Value>, ApiError> {
    let uri = query
        .uri
        .as_deref()
        .ok_or_else(|| ApiError::InvalidRequest("uri parameter is required".into()))?;
    let uri = state.hydrator.normalize_uri(uri).await?;
    let limit = clamp_limit(query.limit.as_ref(), 50, 100);

    let post = state.indexer.post_info_for_uri(&uri).await?;

    let rows: Vec<(i64, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
        "SELECT author, created, indexed FROM likes WHERE subject = $1
         ORDER BY created DESC LIMIT $2",
    )
    .bind(post.id)
    .bind(limit)
    .fetch_all(&state.indexer.db().crud)
    .await
    .map_err(lantern_index::IndexError::from)?;

    let mut likes = Vec::with_capacity(rows.len());
    for (author, created, indexed) in rows {
        let Ok(Some(repo)) = state.indexer.repos().get_by_id(author).await else {
            continue;
        };
        let Ok(actor) = state.hydrator.hydrate_actor(&repo.did).await else {
            continue;
        };
        likes.push(json!({
            "createdAt": created.to_rfc3339_opts(SecondsFormat::Secs, true),
            "indexedAt": indexed.to_rfc3339_opts(SecondsFormat::Secs, true),
            "actor": profile_view(&actor),
        }));
    }

    Ok(Json(json!({ "uri": uri, "likes": likes })))
}

pub(crate) async fn get_reposted_by(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FeedQuery>,
) -> Result<Json<Value>, ApiError> {
    let uri = query
        .uri
        .as_deref()
        .ok_or_else(|| ApiError::InvalidRequest("uri parameter is required".into()))?;
    let uri = state.hydrator.normalize_uri(uri).await?;
    let limit = clamp_limit(query.limit.as_ref(), 50, 100);

    let post = state.indexer.post_info_for_uri(&uri).await?;

    let authors: Vec<i64> = sqlx::query_scalar(
        "SELECT author FROM reposts WHERE subject = $1 ORDER BY created DESC LIMIT $2",
    )
    .bind(post.id)
    .bind(limit)
    .fetch_all(&state.indexer.db().crud)
    .await
    .map_err(lantern_index::IndexError::from)?;

    let mut reposted_by = Vec::with_capacity(authors.len());
    for author in authors {
        let Ok(Some(repo)) = state.indexer.repos().get_by_id(author).await else {
            continue;
        };
        let Ok(actor) = state.hydrator.hydrate_actor(&repo.did).await else {
            continue;
        };
        reposted_by.push(json!(profile_view(&actor)));
    }

    Ok(Json(json!({ "uri": uri, "repostedBy": reposted_by })))
}

pub(crate) async fn get_actor_likes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<FeedQuery>,
) -> Result<Json<Value>, ApiError> {
    let viewer = require_viewer(&headers)?;
    let actor = query.actor.as_deref().unwrap_or(&viewer);
    let did = state.hydrator.resolve_did(actor).await?;
    let limit = clamp_limit(query.limit.as_ref(), 50, 100);

    let author_id = state.indexer.repos().did_to_id(&did).await?;

    let rows: Vec<Post> = sqlx::query_as(
        "SELECT p.id, p.author, p.rkey, p.cid, p.not_found, p.raw, p.created, p.indexed,
                p.reposting, p.reply_to, p.reply_to_usr, p.in_thread
         FROM likes l JOIN posts p ON p.id = l.subject
         WHERE l.author = $1 AND p.not_found = false
         ORDER BY l.created DESC LIMIT $2",
    )
    .bind(author_id)
    .bind(limit)
    .fetch_all(&state.indexer.db().crud)
    .await
    .map_err(lantern_index::IndexError::from)?;

    let feed = feed_view_posts(&state, rows, Some(&viewer)).await;
    Ok(Json(json!({ "feed": feed })))
}
