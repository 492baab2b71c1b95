//! Health check endpoint handler.
//!
//! This module provides the `/health` endpoint handler that returns
//! collector statistics and cache memory figures.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use tracing::{debug, instrument};

use crate::state::SharedState;

/// Footer text for human-readable HTTP endpoints.
pub const FOOTER_TEXT: &str = "Project: https://github.com/herakles-io/herakles-vmware-exporter - More info: https://www.herakles.io - Support: proc-mem@herakles.io";

/// Handler for the /health endpoint.
#[instrument(skip(state))]
pub async fn health_handler(State(state): State<SharedState>) -> impl IntoResponse {
    debug!("Processing /health request");

    state.health_stats.record_http_request();

    let cycle = state.cycle.read().await;
    let ready = state.cache.is_ready();

    // Derive HTTP status from collector state
    let status = if ready && cycle.update_success && cycle.last_updated.is_some() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let message = if !ready {
        "Waiting for first commit".to_string()
    } else if cycle.is_updating {
        "OK - Cycle running".to_string()
    } else if cycle.update_success {
        "OK".to_string()
    } else {
        let error = cycle
            .last_report
            .as_ref()
            .and_then(|r| r.error.clone())
            .unwrap_or_else(|| "unknown error".to_string());
        format!("Last cycle failed: {}", error)
    };
    drop(cycle);

    let table = state.health_stats.render_table();
    let memory = state.cache.memory_report().render();

    debug!("Health check: {} - {}", status, message);
    (
        status,
        [("Content-Type", "text/plain; charset=utf-8")],
        format!("{message}\n\n{table}\n{memory}\n{FOOTER_TEXT}"),
    )
}
