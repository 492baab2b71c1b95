//! Tag endpoint handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use herakles_vmware_exporter::tags::TagLookup;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use crate::state::SharedState;

#[derive(Debug, Deserialize)]
pub struct TagsQuery {
    pub uuid: Option<String>,
}

fn tags_response(lookup: TagLookup) -> (StatusCode, Json<serde_json::Value>) {
    match lookup {
        Ok(Some(tags)) => (StatusCode::OK, Json(json!({ "tags": tags }))),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({ "tags": [] }))),
        Err(error) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": error })),
        ),
    }
}

/// Handler for the /tags/{type}/{id} endpoint.
#[instrument(skip(state))]
pub async fn entity_tags_handler(
    State(state): State<SharedState>,
    Path((kind, id)): Path<(String, String)>,
) -> impl IntoResponse {
    debug!("Processing /tags request for {}/{}", kind, id);
    state.health_stats.record_http_request();
    tags_response(state.cache.get_entity_tags(&kind, &id))
}

/// Handler for the /tags endpoint: one object by uuid, or the whole
/// generation without a uuid.
#[instrument(skip(state))]
pub async fn tags_handler(
    State(state): State<SharedState>,
    Query(query): Query<TagsQuery>,
) -> impl IntoResponse {
    debug!("Processing /tags request");
    state.health_stats.record_http_request();

    match query.uuid {
        Some(uuid) => tags_response(state.cache.get_tags_by_uuid(&uuid)),
        None => (StatusCode::OK, Json(json!(state.cache.tags_snapshot()))),
    }
}
