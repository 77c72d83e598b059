//! com.atproto.repo.* endpoints.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use lantern_atproto::record_uri;
use lantern_atproto::records::POST_COLLECTION;

use crate::hydration::post::PLACEHOLDER_CID;
use crate::state::AppState;
use crate::ApiError;

#[derive(Debug, Deserialize)]
pub(crate) struct GetRecordQuery {
    repo: String,
    collection: String,
    rkey: String,
}

/// Serve a record from the local index. Only posts keep their full record
/// bytes, so everything else is a miss.
pub(crate) async fn get_record(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GetRecordQuery>,
) -> Result<Json<Value>, ApiError> {
    if query.collection != POST_COLLECTION {
        return Err(ApiError::NotFound(format!(
            "records of {} are not served locally",
            query.collection
        )));
    }

    let did = state.hydrator.resolve_did(&query.repo).await?;
    let uri = record_uri(&did, &query.collection, &query.rkey);

    let post = state.indexer.get_post_by_uri(&uri).await?;
    if !post.has_content() {
        return Err(ApiError::NotFound(format!("record not found: {uri}")));
    }

    let value: Value = serde_json::from_slice(post.raw.as_deref().unwrap_or_default())
        .map_err(|e| ApiError::Internal(format!("stored record is undecodable: {e}")))?;

    let cid = if post.cid.is_empty() {
        PLACEHOLDER_CID.to_string()
    } else {
        post.cid
    };

    Ok(Json(json!({ "uri": uri, "cid": cid, "value": value })))
}
