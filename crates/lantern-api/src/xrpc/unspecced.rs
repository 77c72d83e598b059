//! app.bsky.unspecced.* endpoints.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Json;
use futures_util::future::join_all;
use serde::Deserialize;
use serde_json::{json, Value};

use lantern_index::models::Post;

use crate::auth::viewer_from_headers;
use crate::hydration::thread::{ThreadSliceItem, ThreadTree};
use crate::state::AppState;
use crate::ApiError;

use super::feed::author_dids;
use super::post_view;

#[derive(Debug, Deserialize)]
pub(crate) struct ThreadV2Query {
    anchor: String,
    #[serde(default)]
    above: Option<String>,
    #[serde(default)]
    below: Option<String>,
    #[serde(rename = "branchingFactor", default)]
    branching_factor: Option<String>,
    #[serde(default)]
    sort: Option<String>,
}

pub(crate) async fn get_post_thread_v2(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ThreadV2Query>,
) -> Result<Json<Value>, ApiError> {
    let viewer = viewer_from_headers(&headers);

    let above = query.above.as_deref() != Some("false");
    let below = query
        .below
        .as_deref()
        .and_then(|b| b.parse::<i64>().ok())
        .filter(|b| (0..=20).contains(b))
        .unwrap_or(6);
    let branching_factor = query
        .branching_factor
        .as_deref()
        .and_then(|b| b.parse::<i64>().ok())
        .filter(|b| *b > 0)
        .unwrap_or(10);
    // Only newest-first ordering is supported.
    let _sort = query.sort.as_deref().unwrap_or("newest");

    let anchor_uri = state.hydrator.normalize_uri(&query.anchor).await?;

    // The anchor itself is fetched on demand if we only hold a placeholder.
    let anchor = state
        .hydrator
        .hydrate_post(&anchor_uri, viewer.as_deref(), true)
        .await
        .map_err(|_| ApiError::NotFound("anchor post not found".into()))?;

    let thread_id = if anchor.in_thread != 0 {
        anchor.in_thread
    } else {
        anchor.id
    };

    let rows: Vec<Post> = sqlx::query_as(
        "SELECT id, author, rkey, cid, not_found, raw, created, indexed,
                reposting, reply_to, reply_to_usr, in_thread
         FROM posts WHERE in_thread = $1 OR id = $2",
    )
    .bind(thread_id)
    .bind(anchor.id)
    .fetch_all(&state.indexer.db().crud)
    .await
    .map_err(lantern_index::IndexError::from)?;

    let dids = author_dids(&state, &rows).await?;
    let tree = ThreadTree::build(rows, &dids);

    let slice = tree
        .slice(anchor.id, above, below, branching_factor)
        .ok_or_else(|| ApiError::NotFound("anchor post not found in thread".into()))?;

    // Hydrate every selected item in parallel; the slice already bounded the
    // fan-out by depth and branching factor.
    let items = join_all(
        slice
            .items
            .iter()
            .map(|item| build_thread_item(&state, &tree, *item, viewer.as_deref())),
    )
    .await;

    Ok(Json(json!({
        "thread": items,
        "hasOtherReplies": slice.has_other_replies,
    })))
}

async fn build_thread_item(
    state: &AppState,
    tree: &ThreadTree,
    item: ThreadSliceItem,
    viewer: Option<&str>,
) -> Value {
    let node = tree.node(item.node);

    let not_found = json!({
        "depth": item.depth,
        "uri": node.uri,
        "value": {
            "$type": "app.bsky.unspecced.defs#threadItemNotFound",
        },
    });

    if node.is_missing() {
        return not_found;
    }

    let hydrated = match state.hydrator.hydrate_post(&node.uri, viewer, false).await {
        Ok(h) => h,
        Err(_) => return not_found,
    };
    let author = match state.hydrator.hydrate_actor(&hydrated.author_did).await {
        Ok(a) => a,
        Err(_) => return not_found,
    };

    json!({
        "depth": item.depth,
        "uri": node.uri,
        "value": {
            "$type": "app.bsky.unspecced.defs#threadItemPost",
            "post": post_view(&hydrated, &author),
            "moreReplies": node.children.len(),
            "moreParents": false,
            "hiddenByThreadgate": false,
            "mutedByViewer": false,
            "opThread": false,
        },
    })
}
