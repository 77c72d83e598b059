//! The custom JSON API for the bundled frontend, plus router assembly.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::Method;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use lantern_atproto::record_uri;
use lantern_atproto::records::{LIKE_COLLECTION, POST_COLLECTION};
use lantern_index::models::{Post, Repo};

use crate::hydration::post::PLACEHOLDER_CID;
use crate::state::AppState;
use crate::{xrpc, ApiError};

/// Build the full router: custom API + XRPC surface behind shared CORS.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/debug", get(get_debug))
        .route("/api/me", get(get_me))
        .route("/api/notifications", get(get_notifications))
        .route("/api/profile/{account}", get(get_profile))
        .route("/api/profile/{account}/posts", get(get_profile_posts))
        .route("/api/profile/{account}/post/{rkey}", get(get_post))
        .route("/api/followingfeed", get(get_following_feed))
        .route("/api/thread/{postid}", get(get_thread))
        .route("/api/post/{postid}/likes", get(get_post_likes))
        .route("/api/post/{postid}/reposts", get(get_post_reposts))
        .route("/api/post/{postid}/replies", get(get_post_replies))
        .route("/api/createRecord", post(create_record))
        .route("/api/rescan/{account}", post(rescan_account))
        .merge(xrpc::xrpc_router())
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// View shapes
// =============================================================================

#[derive(Debug, Serialize)]
struct AuthorInfo {
    handle: String,
    did: String,
    profile: Option<Value>,
}

#[derive(Debug, Serialize)]
struct PostCounts {
    likes: i64,
    reposts: i64,
    replies: i64,
}

#[derive(Debug, Serialize)]
struct ViewerLike {
    uri: String,
    cid: String,
}

#[derive(Debug, Serialize)]
struct FeedPostView {
    #[serde(rename = "$type")]
    kind: &'static str,
    #[serde(rename = "createdAt")]
    created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    langs: Option<Value>,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    facets: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    embed: Option<Value>,
}

#[derive(Debug, Serialize)]
struct PostResponse {
    missing: bool,
    uri: String,
    cid: String,
    post: Option<FeedPostView>,
    author: Option<AuthorInfo>,
    counts: Option<PostCounts>,
    #[serde(rename = "viewerLike", skip_serializing_if = "Option::is_none")]
    viewer_like: Option<ViewerLike>,
    id: i64,
    #[serde(rename = "replyTo", skip_serializing_if = "is_zero")]
    reply_to: i64,
    #[serde(rename = "replyToUsr", skip_serializing_if = "is_zero")]
    reply_to_usr: i64,
    #[serde(rename = "inThread", skip_serializing_if = "is_zero")]
    in_thread: i64,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl PostResponse {
    fn missing(uri: String) -> Self {
        Self {
            missing: true,
            uri,
            cid: String::new(),
            post: None,
            author: None,
            counts: None,
            viewer_like: None,
            id: 0,
            reply_to: 0,
            reply_to_usr: 0,
            in_thread: 0,
        }
    }
}

// =============================================================================
// Shared helpers
// =============================================================================

fn cursor_time(cursor: Option<&String>) -> Result<DateTime<Utc>, ApiError> {
    match cursor {
        Some(raw) if !raw.is_empty() => DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| ApiError::InvalidRequest(format!("invalid cursor: {e}"))),
        _ => Ok(Utc::now()),
    }
}

fn next_time_cursor(rows: &[Post]) -> String {
    rows.last()
        .map(|p| p.created.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

async fn author_info(state: &AppState, repo: &Repo) -> Result<AuthorInfo, ApiError> {
    let ident = state.dir.lookup_did(&repo.did).await?;

    let raw: Option<Vec<u8>> =
        sqlx::query_scalar("SELECT raw FROM profiles WHERE repo = $1")
            .bind(repo.id)
            .fetch_optional(&state.indexer.db().hot)
            .await
            .map_err(lantern_index::IndexError::from)?
            .flatten();

    let profile = match raw {
        Some(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes).ok(),
        _ => {
            if let Err(e) = state.indexer.missing().track(&repo.did, false).await {
                warn!(did = %repo.did, error = %e, "failed to enqueue missing profile");
            }
            None
        }
    };

    Ok(AuthorInfo {
        handle: ident.handle,
        did: repo.did.clone(),
        profile,
    })
}

async fn viewer_like(state: &AppState, post_id: i64) -> Option<ViewerLike> {
    let principal = state.indexer.principal();
    let row: Option<(String, String)> =
        sqlx::query_as("SELECT rkey, cid FROM likes WHERE subject = $1 AND author = $2")
            .bind(post_id)
            .bind(principal.id)
            .fetch_optional(&state.indexer.db().hot)
            .await
            .ok()
            .flatten();

    row.map(|(rkey, cid)| ViewerLike {
        uri: record_uri(&principal.did, LIKE_COLLECTION, &rkey),
        cid,
    })
}

/// Build the post view shown by the custom API, hydrating a quoted post one
/// level deep and degrading to a bare `{uri, cid}` reference when the quote
/// is not indexed.
async fn build_post_view(state: &AppState, record: &Value) -> FeedPostView {
    let mut view = FeedPostView {
        kind: "app.bsky.feed.post",
        created_at: record["createdAt"].as_str().unwrap_or_default().to_string(),
        langs: record.get("langs").filter(|v| !v.is_null()).cloned(),
        text: record["text"].as_str().unwrap_or_default().to_string(),
        facets: record.get("facets").filter(|v| !v.is_null()).cloned(),
        embed: None,
    };

    let Some(embed) = record.get("embed").filter(|v| !v.is_null()) else {
        return view;
    };

    let embed_type = embed["$type"].as_str().unwrap_or_default();
    match embed_type {
        "app.bsky.embed.images" | "app.bsky.embed.external" | "app.bsky.embed.video" => {
            view.embed = Some(embed.clone());
        }
        "app.bsky.embed.record" => {
            let quoted_uri = embed["record"]["uri"].as_str().unwrap_or_default();
            let quoted_cid = embed["record"]["cid"].as_str().unwrap_or_default();
            view.embed = Some(hydrate_quote_embed(state, quoted_uri, quoted_cid).await);
        }
        _ => {
            view.embed = Some(embed.clone());
        }
    }

    view
}

async fn hydrate_quote_embed(state: &AppState, uri: &str, cid: &str) -> Value {
    let fallback = json!({
        "$type": "app.bsky.embed.record",
        "record": {"uri": uri, "cid": cid},
    });

    if uri.is_empty() || !uri.contains(POST_COLLECTION) {
        return fallback;
    }

    let Ok(quoted) = state.indexer.get_post_by_uri(uri).await else {
        return fallback;
    };
    if !quoted.has_content() {
        return fallback;
    }
    let Ok(value) = serde_json::from_slice::<Value>(quoted.raw.as_deref().unwrap_or_default())
    else {
        return fallback;
    };
    let Ok(Some(author_repo)) = state.indexer.repos().get_by_id(quoted.author).await else {
        return fallback;
    };
    let Ok(author) = author_info(state, &author_repo).await else {
        return fallback;
    };

    json!({
        "$type": "app.bsky.embed.record",
        "record": {
            "$type": "app.bsky.embed.record#viewRecord",
            "uri": uri,
            "cid": cid,
            "author": author,
            "value": value,
        },
    })
}

async fn post_response(state: &AppState, row: Post) -> PostResponse {
    let repo = match state.indexer.repos().get_by_id(row.author).await {
        Ok(Some(repo)) => repo,
        _ => return PostResponse::missing(String::new()),
    };

    let uri = record_uri(&repo.did, POST_COLLECTION, &row.rkey);

    if !row.has_content() {
        if let Err(e) = state.indexer.missing().track(&uri, false).await {
            warn!(uri = %uri, error = %e, "failed to enqueue missing post");
        }
        return PostResponse::missing(uri);
    }

    let record: Value = match serde_json::from_slice(row.raw.as_deref().unwrap_or_default()) {
        Ok(v) => v,
        Err(e) => {
            warn!(uri = %uri, error = %e, "failed to decode stored post");
            return PostResponse::missing(uri);
        }
    };

    let author = match author_info(state, &repo).await {
        Ok(a) => Some(a),
        Err(e) => {
            warn!(uri = %uri, error = %e, "failed to load author info for post");
            None
        }
    };

    let counts = match state.hydrator.post_counts(row.id).await {
        Ok((likes, reposts, replies)) => Some(PostCounts {
            likes,
            reposts,
            replies,
        }),
        Err(e) => {
            warn!(post = row.id, error = %e, "failed to get counts for post");
            None
        }
    };

    let post_view = build_post_view(state, &record).await;
    let liked = viewer_like(state, row.id).await;

    let cid = if row.cid.is_empty() {
        PLACEHOLDER_CID.to_string()
    } else {
        row.cid.clone()
    };

    PostResponse {
        missing: false,
        uri,
        cid,
        post: Some(post_view),
        author,
        counts,
        viewer_like: liked,
        id: row.id,
        reply_to: row.reply_to,
        reply_to_usr: row.reply_to_usr,
        in_thread: row.in_thread,
    }
}

async fn post_responses(state: &AppState, rows: Vec<Post>) -> Vec<PostResponse> {
    join_all(rows.into_iter().map(|row| post_response(state, row))).await
}

// =============================================================================
// Handlers
// =============================================================================

async fn get_debug(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "seq": state.ingest_seq.load(Ordering::Relaxed) }))
}

async fn get_me(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let principal = state.indexer.principal();
    let ident = state.dir.lookup_did(&principal.did).await?;
    Ok(Json(json!({
        "did": principal.did,
        "handle": ident.handle,
    })))
}

#[derive(Debug, Deserialize)]
struct CursorQuery {
    cursor: Option<String>,
}

async fn get_profile(
    State(state): State<Arc<AppState>>,
    Path(account): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let did = state.hydrator.resolve_did(&account).await?;
    let repo = state.indexer.repos().get_or_create(&did).await?;

    let raw: Option<Vec<u8>> = sqlx::query_scalar("SELECT raw FROM profiles WHERE repo = $1")
        .bind(repo.id)
        .fetch_optional(&state.indexer.db().crud)
        .await
        .map_err(lantern_index::IndexError::from)?
        .flatten();

    match raw {
        Some(bytes) if !bytes.is_empty() => {
            let profile: Value = serde_json::from_slice(&bytes)
                .map_err(|e| ApiError::Internal(format!("stored profile is undecodable: {e}")))?;
            Ok(Json(profile))
        }
        _ => {
            if let Err(e) = state.indexer.missing().track(&did, false).await {
                warn!(did = %did, error = %e, "failed to enqueue missing profile");
            }
            Err(ApiError::NotFound("missing profile info for user".into()))
        }
    }
}

async fn get_post(
    State(state): State<Arc<AppState>>,
    Path((account, rkey)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let did = state.hydrator.resolve_did(&account).await?;
    let uri = record_uri(&did, POST_COLLECTION, &rkey);

    let row = state.indexer.get_post_by_uri(&uri).await?;
    if !row.has_content() {
        return Err(ApiError::NotFound("missing post".into()));
    }

    let record: Value = serde_json::from_slice(row.raw.as_deref().unwrap_or_default())
        .map_err(|e| ApiError::Internal(format!("stored post is undecodable: {e}")))?;
    Ok(Json(record))
}

async fn get_profile_posts(
    State(state): State<Arc<AppState>>,
    Path(account): Path<String>,
    Query(query): Query<CursorQuery>,
) -> Result<Json<Value>, ApiError> {
    let did = state.hydrator.resolve_did(&account).await?;
    let repo = state.indexer.repos().get_or_create(&did).await?;
    let before = cursor_time(query.cursor.as_ref())?;

    let rows: Vec<Post> = sqlx::query_as(
        "SELECT id, author, rkey, cid, not_found, raw, created, indexed,
                reposting, reply_to, reply_to_usr, in_thread
         FROM posts WHERE author = $1 AND created < $2
         ORDER BY created DESC LIMIT 50",
    )
    .bind(repo.id)
    .bind(before)
    .fetch_all(&state.indexer.db().crud)
    .await
    .map_err(lantern_index::IndexError::from)?;

    let cursor = next_time_cursor(&rows);
    let posts = post_responses(&state, rows).await;

    Ok(Json(json!({ "posts": posts, "cursor": cursor })))
}

async fn get_following_feed(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CursorQuery>,
) -> Result<Json<Value>, ApiError> {
    let principal = state.indexer.principal();
    let before = cursor_time(query.cursor.as_ref())?;

    let rows: Vec<Post> = sqlx::query_as(
        "SELECT id, author, rkey, cid, not_found, raw, created, indexed,
                reposting, reply_to, reply_to_usr, in_thread
         FROM posts
         WHERE reply_to = 0
         AND author IN (SELECT subject FROM follows WHERE author = $1)
         AND created < $2
         ORDER BY created DESC LIMIT 20",
    )
    .bind(principal.id)
    .bind(before)
    .fetch_all(&state.indexer.db().crud)
    .await
    .map_err(lantern_index::IndexError::from)?;

    let cursor = next_time_cursor(&rows);
    let posts = post_responses(&state, rows).await;

    Ok(Json(json!({ "posts": posts, "cursor": cursor })))
}

async fn get_thread(
    State(state): State<Arc<AppState>>,
    Path(postid): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let requested = state
        .indexer
        .get_post_by_id(postid)
        .await?
        .ok_or_else(|| ApiError::NotFound("post not found".into()))?;

    let root_id = if requested.in_thread != 0 {
        requested.in_thread
    } else {
        requested.id
    };

    let rows: Vec<Post> = sqlx::query_as(
        "SELECT id, author, rkey, cid, not_found, raw, created, indexed,
                reposting, reply_to, reply_to_usr, in_thread
         FROM posts WHERE id = $1 OR in_thread = $1
         ORDER BY created ASC",
    )
    .bind(root_id)
    .fetch_all(&state.indexer.db().crud)
    .await
    .map_err(lantern_index::IndexError::from)?;

    let posts = post_responses(&state, rows).await;

    Ok(Json(json!({ "posts": posts, "rootPostId": root_id })))
}

#[derive(Debug, Serialize)]
struct EngagementUser {
    handle: String,
    did: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    profile: Option<Value>,
    time: String,
}

async fn engagement_users(
    state: &AppState,
    rows: Vec<(i64, DateTime<Utc>)>,
) -> Vec<EngagementUser> {
    let mut users = Vec::with_capacity(rows.len());
    for (author, created) in rows {
        let repo = match state.indexer.repos().get_by_id(author).await {
            Ok(Some(repo)) => repo,
            _ => continue,
        };
        let info = match author_info(state, &repo).await {
            Ok(info) => info,
            Err(e) => {
                warn!(did = %repo.did, error = %e, "failed to load engagement author");
                continue;
            }
        };
        users.push(EngagementUser {
            handle: info.handle,
            did: info.did,
            profile: info.profile,
            time: created.to_rfc3339_opts(SecondsFormat::Secs, true),
        });
    }
    users
}

async fn get_post_likes(
    State(state): State<Arc<AppState>>,
    Path(postid): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let rows: Vec<(i64, DateTime<Utc>)> =
        sqlx::query_as("SELECT author, created FROM likes WHERE subject = $1 ORDER BY created ASC")
            .bind(postid)
            .fetch_all(&state.indexer.db().crud)
            .await
            .map_err(lantern_index::IndexError::from)?;

    let users = engagement_users(&state, rows).await;
    Ok(Json(json!({ "count": users.len(), "users": users })))
}

async fn get_post_reposts(
    State(state): State<Arc<AppState>>,
    Path(postid): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let rows: Vec<(i64, DateTime<Utc>)> = sqlx::query_as(
        "SELECT author, created FROM reposts WHERE subject = $1 ORDER BY created ASC",
    )
    .bind(postid)
    .fetch_all(&state.indexer.db().crud)
    .await
    .map_err(lantern_index::IndexError::from)?;

    let users = engagement_users(&state, rows).await;
    Ok(Json(json!({ "count": users.len(), "users": users })))
}

async fn get_post_replies(
    State(state): State<Arc<AppState>>,
    Path(postid): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let rows: Vec<(i64, DateTime<Utc>)> = sqlx::query_as(
        "SELECT author, created FROM posts WHERE reply_to = $1 ORDER BY created ASC",
    )
    .bind(postid)
    .fetch_all(&state.indexer.db().crud)
    .await
    .map_err(lantern_index::IndexError::from)?;

    // One entry per distinct replier.
    let mut seen = std::collections::HashSet::new();
    let rows: Vec<(i64, DateTime<Utc>)> = rows
        .into_iter()
        .filter(|(author, _)| seen.insert(*author))
        .collect();

    let users = engagement_users(&state, rows).await;
    Ok(Json(json!({ "count": users.len(), "users": users })))
}

#[derive(Debug, Deserialize)]
struct CreateRecordRequest {
    collection: String,
    record: Value,
}

async fn create_record(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRecordRequest>,
) -> Result<Json<Value>, ApiError> {
    let resp = state
        .client
        .create_record(&req.collection, &req.record)
        .await
        .map_err(|e| ApiError::Upstream(e.to_string()))?;

    Ok(Json(json!({ "uri": resp.uri, "cid": resp.cid })))
}

/// Pull an account's full repo from its origin host and replay it through
/// the indexer. Heavyweight; runs in the background.
async fn rescan_account(
    State(state): State<Arc<AppState>>,
    Path(account): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let did = state.hydrator.resolve_did(&account).await?;

    let indexer = Arc::clone(&state.indexer);
    let dir = Arc::clone(&state.dir);
    let target = did.clone();
    tokio::spawn(async move {
        if let Err(e) = lantern_index::bootstrap::rescan_repo(&indexer, dir.as_ref(), &target).await
        {
            warn!(did = %target, error = %e, "rescan failed");
        }
    });

    Ok(Json(json!({ "did": did, "started": true })))
}

async fn get_notifications(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CursorQuery>,
) -> Result<Json<Value>, ApiError> {
    let principal = state.indexer.principal();

    let before_id = match query.cursor.as_deref().filter(|c| !c.is_empty()) {
        Some(raw) => Some(
            raw.parse::<i64>()
                .map_err(|_| ApiError::InvalidRequest("invalid cursor".into()))?,
        ),
        None => None,
    };

    let notifs = state
        .indexer
        .notifications()
        .list(principal.id, before_id, 50)
        .await?;

    let mut results = Vec::with_capacity(notifs.len());
    for notif in &notifs {
        let author_repo = match state.indexer.repos().get_by_id(notif.author).await {
            Ok(Some(repo)) => repo,
            _ => continue,
        };
        let author = match author_info(&state, &author_repo).await {
            Ok(a) => a,
            Err(e) => {
                warn!(id = notif.id, error = %e, "failed to load notification author");
                continue;
            }
        };

        let mut entry = json!({
            "id": notif.id,
            "kind": notif.kind,
            "author": author,
            "source": notif.source,
            "createdAt": notif.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        });

        // Replies and mentions get a short excerpt of the triggering post.
        if notif.kind == "reply" || notif.kind == "mention" {
            if let Ok(post) = state.indexer.get_post_by_uri(&notif.source).await {
                if post.has_content() {
                    if let Ok(value) = serde_json::from_slice::<Value>(
                        post.raw.as_deref().unwrap_or_default(),
                    ) {
                        let text = value["text"].as_str().unwrap_or_default();
                        let preview: String = if text.chars().count() > 100 {
                            let mut p: String = text.chars().take(100).collect();
                            p.push_str("...");
                            p
                        } else {
                            text.to_string()
                        };
                        entry["sourcePost"] = json!({
                            "text": preview,
                            "uri": notif.source,
                        });
                    }
                }
            }
        }

        results.push(entry);
    }

    let cursor = notifs
        .last()
        .map(|n| n.id.to_string())
        .unwrap_or_default();

    Ok(Json(json!({ "notifications": results, "cursor": cursor })))
}
