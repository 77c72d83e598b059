//! app.bsky.graph.* endpoints.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::require_viewer;
use crate::state::AppState;
use crate::views::{profile_view, profile_view_basic};
use crate::ApiError;

use super::clamp_limit;

#[derive(Debug, Deserialize)]
pub(crate) struct GraphQuery {
    #[serde(default)]
    actor: Option<String>,
    #[serde(default)]
    limit: Option<String>,
    #[serde(default)]
    cursor: Option<String>,
}

fn id_cursor(raw: Option<&String>) -> Result<Option<i64>, ApiError> {
    match raw.filter(|c| !c.is_empty()) {
        Some(raw) => raw
            .parse::<i64>()
            .map(Some)
            .map_err(|_| ApiError::InvalidRequest("invalid cursor".into())),
        None => Ok(None),
    }
}

async fn actor_views(state: &AppState, dids: Vec<String>) -> Vec<Value> {
    let mut out = Vec::with_capacity(dids.len());
    for did in dids {
        if let Ok(actor) = state.hydrator.hydrate_actor(&did).await {
            out.push(json!(profile_view(&actor)));
        }
    }
    out
}

pub(crate) async fn get_follows(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GraphQuery>,
) -> Result<Json<Value>, ApiError> {
    let actor = query
        .actor
        .as_deref()
        .ok_or_else(|| ApiError::InvalidRequest("actor parameter is required".into()))?;
    let did = state.hydrator.resolve_did(actor).await?;
    let limit = clamp_limit(query.limit.as_ref(), 50, 100);
    let before = id_cursor(query.cursor.as_ref())?;

    let author_id = state.indexer.repos().did_to_id(&did).await?;

    let rows: Vec<(i64, String)> = match before {
        Some(cursor) => sqlx::query_as(
            "SELECT f.id, r.did FROM follows f
             JOIN repos r ON r.id = f.subject
             WHERE f.author = $1 AND f.id < $2
             ORDER BY f.id DESC LIMIT $3",
        )
        .bind(author_id)
        .bind(cursor)
        .bind(limit)
        .fetch_all(&state.indexer.db().crud)
        .await
        .map_err(lantern_index::IndexError::from)?,
        None => sqlx::query_as(
            "SELECT f.id, r.did FROM follows f
             JOIN repos r ON r.id = f.subject
             WHERE f.author = $1
             ORDER BY f.id DESC LIMIT $2",
        )
        .bind(author_id)
        .bind(limit)
        .fetch_all(&state.indexer.db().crud)
        .await
        .map_err(lantern_index::IndexError::from)?,
    };

    let cursor = rows.last().map(|(id, _)| id.to_string());
    let subject = state.hydrator.hydrate_actor(&did).await?;
    let follows = actor_views(&state, rows.into_iter().map(|(_, did)| did).collect()).await;

    Ok(Json(json!({
        "subject": profile_view_basic(&subject),
        "follows": follows,
        "cursor": cursor,
    })))
}

pub(crate) async fn get_followers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GraphQuery>,
) -> Result<Json<Value>, ApiError> {
    let actor = query
        .actor
        .as_deref()
        .ok_or_else(|| ApiError::InvalidRequest("actor parameter is required".into()))?;
    let did = state.hydrator.resolve_did(actor).await?;
    let limit = clamp_limit(query.limit.as_ref(), 50, 100);
    let before = id_cursor(query.cursor.as_ref())?;

    let subject_id = state.indexer.repos().did_to_id(&did).await?;

    let rows: Vec<(i64, String)> = match before {
        Some(cursor) => sqlx::query_as(
            "SELECT f.id, r.did FROM follows f
             JOIN repos r ON r.id = f.author
             WHERE f.subject = $1 AND f.id < $2
             ORDER BY f.id DESC LIMIT $3",
        )
        .bind(subject_id)
        .bind(cursor)
        .bind(limit)
        .fetch_all(&state.indexer.db().crud)
        .await
        .map_err(lantern_index::IndexError::from)?,
        None => sqlx::query_as(
            "SELECT f.id, r.did FROM follows f
             JOIN repos r ON r.id = f.author
             WHERE f.subject = $1
             ORDER BY f.id DESC LIMIT $2",
        )
        .bind(subject_id)
        .bind(limit)
        .fetch_all(&state.indexer.db().crud)
        .await
        .map_err(lantern_index::IndexError::from)?,
    };

    let cursor = rows.last().map(|(id, _)| id.to_string());
    let subject = state.hydrator.hydrate_actor(&did).await?;
    let followers = actor_views(&state, rows.into_iter().map(|(_, did)| did).collect()).await;

    Ok(Json(json!({
        "subject": profile_view_basic(&subject),
        "followers": followers,
        "cursor": cursor,
    })))
}

pub(crate) async fn get_blocks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<GraphQuery>,
) -> Result<Json<Value>, ApiError> {
    let viewer = require_viewer(&headers)?;
    let limit = clamp_limit(query.limit.as_ref(), 50, 100);
    let before = id_cursor(query.cursor.as_ref())?;

    let viewer_id = state.indexer.repos().did_to_id(&viewer).await?;

    let rows: Vec<(i64, String)> = match before {
        Some(cursor) => sqlx::query_as(
            "SELECT b.id, r.did FROM blocks b
             JOIN repos r ON r.id = b.subject
             WHERE b.author = $1 AND b.id < $2
             ORDER BY b.id DESC LIMIT $3",
        )
        .bind(viewer_id)
        .bind(cursor)
        .bind(limit)
        .fetch_all(&state.indexer.db().crud)
        .await
        .map_err(lantern_index::IndexError::from)?,
        None => sqlx::query_as(
            "SELECT b.id, r.did FROM blocks b
             JOIN repos r ON r.id = b.subject
             WHERE b.author = $1
             ORDER BY b.id DESC LIMIT $2",
        )
        .bind(viewer_id)
        .bind(limit)
        .fetch_all(&state.indexer.db().crud)
        .await
        .map_err(lantern_index::IndexError::from)?,
    };

    let cursor = rows.last().map(|(id, _)| id.to_string());
    let blocks = actor_views(&state, rows.into_iter().map(|(_, did)| did).collect()).await;

    Ok(Json(json!({ "blocks": blocks, "cursor": cursor })))
}
