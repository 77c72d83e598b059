//! app.bsky.notification.* endpoints.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Json;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use lantern_index::models::Notification;

use crate::auth::require_viewer;
use crate::state::AppState;
use crate::views::profile_view;
use crate::ApiError;

use super::clamp_limit;

#[derive(Debug, Deserialize)]
pub(crate) struct ListQuery {
    #[serde(default)]
    limit: Option<String>,
    #[serde(default)]
    cursor: Option<String>,
}

pub(crate) async fn list_notifications(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let viewer = require_viewer(&headers)?;
    let limit = clamp_limit(query.limit.as_ref(), 50, 100);

    let before_id = match query.cursor.as_deref().filter(|c| !c.is_empty()) {
        Some(raw) => Some(
            raw.parse::<i64>()
                .map_err(|_| ApiError::InvalidRequest("invalid cursor".into()))?,
        ),
        None => None,
    };

    let repo_id = state.indexer.repos().did_to_id(&viewer).await?;
    let rows = state
        .indexer
        .notifications()
        .list(repo_id, before_id, limit)
        .await?;

    let seen_at = state.indexer.notifications().seen_at(repo_id).await?;

    let mut notifications = Vec::with_capacity(rows.len());
    for row in &rows {
        // Rows without a source CID predate CID tracking and cannot be
        // rendered by clients.
        if row.source_cid.is_empty() {
            continue;
        }

        let Ok(Some(author_repo)) = state.indexer.repos().get_by_id(row.author).await else {
            continue;
        };
        let author = match state.hydrator.hydrate_actor(&author_repo.did).await {
            Ok(a) => a,
            Err(e) => {
                warn!(id = row.id, error = %e, "failed to hydrate notification author");
                continue;
            }
        };

        let Some(record) = notification_record(&state, row).await else {
            continue;
        };

        notifications.push(json!({
            "uri": row.source,
            "cid": row.source_cid,
            "author": profile_view(&author),
            "reason": row.kind,
            "record": record,
            "isRead": seen_at.map(|s| row.created_at <= s).unwrap_or(false),
            "indexedAt": row.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }));
    }

    let cursor = rows.last().map(|n| n.id.to_string());
    let seen = seen_at.map(|s| s.to_rfc3339_opts(SecondsFormat::Secs, true));

    Ok(Json(json!({
        "notifications": notifications,
        "cursor": cursor,
        "seenAt": seen,
    })))
}

/// Resolve the triggering record for a notification. Replies and mentions
/// reference posts we store whole; likes and reposts are reconstructed from
/// their rows since only posts keep raw bytes.
async fn notification_record(state: &AppState, row: &Notification) -> Option<Value> {
    match row.kind.as_str() {
        "reply" | "mention" => {
            let post = state.indexer.get_post_by_uri(&row.source).await.ok()?;
            if !post.has_content() {
                return None;
            }
            serde_json::from_slice(post.raw.as_deref().unwrap_or_default()).ok()
        }
        "like" => {
            let created: DateTime<Utc> = sqlx::query_scalar(
                "SELECT l.created FROM likes l
                 JOIN repos r ON r.id = l.author
                 WHERE 'at://' || r.did || '/app.bsky.feed.like/' || l.rkey = $1",
            )
            .bind(&row.source)
            .fetch_optional(&state.indexer.db().crud)
            .await
            .ok()??;
            Some(json!({
                "$type": "app.bsky.feed.like",
                "createdAt": created.to_rfc3339_opts(SecondsFormat::Secs, true),
                "subject": {"uri": "", "cid": ""},
            }))
        }
        "repost" => {
            let created: DateTime<Utc> = sqlx::query_scalar(
                "SELECT rp.created FROM reposts rp
                 JOIN repos r ON r.id = rp.author
                 WHERE 'at://' || r.did || '/app.bsky.feed.repost/' || rp.rkey = $1",
            )
            .bind(&row.source)
            .fetch_optional(&state.indexer.db().crud)
            .await
            .ok()??;
            Some(json!({
                "$type": "app.bsky.feed.repost",
                "createdAt": created.to_rfc3339_opts(SecondsFormat::Secs, true),
                "subject": {"uri": "", "cid": ""},
            }))
        }
        other => {
            warn!(kind = %other, "unknown notification kind");
            None
        }
    }
}

pub(crate) async fn get_unread_count(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let viewer = require_viewer(&headers)?;
    let repo_id = state.indexer.repos().did_to_id(&viewer).await?;
    let count = state.indexer.notifications().unread_count(repo_id).await?;
    Ok(Json(json!({ "count": count })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct UpdateSeenInput {
    #[serde(rename = "seenAt")]
    seen_at: String,
}

pub(crate) async fn update_seen(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateSeenInput>,
) -> Result<Json<Value>, ApiError> {
    let viewer = require_viewer(&headers)?;

    let seen_at = DateTime::parse_from_rfc3339(&body.seen_at)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| ApiError::InvalidRequest("invalid seenAt timestamp".into()))?;

    let repo_id = state.indexer.repos().did_to_id(&viewer).await?;
    state
        .indexer
        .notifications()
        .update_seen(repo_id, seen_at)
        .await?;

    Ok(Json(json!({})))
}
