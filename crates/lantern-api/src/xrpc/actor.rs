//! app.bsky.actor.* endpoints.

use std::sync::Arc;

use axum::extract::{Query, RawQuery, State};
use axum::http::HeaderMap;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::auth::{require_viewer, viewer_from_headers};
use crate::state::AppState;
use crate::views::profile_view_detailed;
use crate::ApiError;

use super::repeated_params;

#[derive(Debug, Deserialize)]
pub(crate) struct ActorQuery {
    actor: String,
}

pub(crate) async fn get_profile(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ActorQuery>,
) -> Result<Json<Value>, ApiError> {
    let viewer = viewer_from_headers(&headers);
    let did = state.hydrator.resolve_did(&query.actor).await?;
    let detailed = state
        .hydrator
        .hydrate_actor_detailed(&did, viewer.as_deref())
        .await?;
    Ok(Json(json!(profile_view_detailed(&detailed))))
}

pub(crate) async fn get_profiles(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    RawQuery(raw): RawQuery,
) -> Result<Json<Value>, ApiError> {
    let viewer = viewer_from_headers(&headers);
    let actors = repeated_params(raw.as_deref().unwrap_or_default(), "actors");
    if actors.is_empty() {
        return Err(ApiError::InvalidRequest("actors parameter is required".into()));
    }
    if actors.len() > 25 {
        return Err(ApiError::InvalidRequest("too many actors".into()));
    }

    let mut profiles = Vec::with_capacity(actors.len());
    for actor in &actors {
        let did = match state.hydrator.resolve_did(actor).await {
            Ok(did) => did,
            Err(e) => {
                warn!(actor = %actor, error = %e, "failed to resolve actor");
                continue;
            }
        };
        match state
            .hydrator
            .hydrate_actor_detailed(&did, viewer.as_deref())
            .await
        {
            Ok(detailed) => profiles.push(json!(profile_view_detailed(&detailed))),
            Err(e) => {
                warn!(did = %did, error = %e, "failed to hydrate profile");
            }
        }
    }

    Ok(Json(json!({ "profiles": profiles })))
}

/// Preferences are not indexed; clients get an empty set and writes are
/// accepted and dropped.
pub(crate) async fn get_preferences(headers: HeaderMap) -> Result<Json<Value>, ApiError> {
    require_viewer(&headers)?;
    Ok(Json(json!({ "preferences": [] })))
}

pub(crate) async fn put_preferences(headers: HeaderMap) -> Result<Json<Value>, ApiError> {
    require_viewer(&headers)?;
    Ok(Json(json!({})))
}
