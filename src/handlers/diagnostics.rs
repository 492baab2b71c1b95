//! Cache diagnostics endpoint handlers.
//!
//! `/dump` lists every cached entity and counter, `/memory` reports arena
//! usage together with the last commit's required and free bytes.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::handlers::health::FOOTER_TEXT;
use crate::state::SharedState;

#[derive(Debug, Deserialize)]
pub struct MemoryQuery {
    pub format: Option<String>,
}

/// Handler for the /dump endpoint.
#[instrument(skip(state))]
pub async fn dump_handler(State(state): State<SharedState>) -> impl IntoResponse {
    debug!("Processing /dump request");
    state.health_stats.record_http_request();

    let dump = state.cache.dump();
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; charset=utf-8")],
        format!("{dump}\n{FOOTER_TEXT}"),
    )
}

/// Handler for the /memory endpoint.
#[instrument(skip(state))]
pub async fn memory_handler(
    State(state): State<SharedState>,
    Query(query): Query<MemoryQuery>,
) -> Response {
    debug!("Processing /memory request");
    state.health_stats.record_http_request();

    let report = state.cache.memory_report();
    if query.format.as_deref() == Some("json") {
        return (StatusCode::OK, Json(report)).into_response();
    }
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; charset=utf-8")],
        format!("{}\n{FOOTER_TEXT}", report.render()),
    )
        .into_response()
}
