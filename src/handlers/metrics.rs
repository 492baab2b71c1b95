//! Metrics endpoint handler for Prometheus scraping.
//!
//! This module provides the `/metrics` endpoint handler that formats and returns
//! cached counter values and cache telemetry in Prometheus text format.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use prometheus::{Encoder, TextEncoder};
use std::time::Instant;
use tracing::{debug, error, instrument};

use crate::state::SharedState;

/// Buffer capacity for metrics encoding.
const BUFFER_CAP: usize = 512 * 1024;

/// Error type for metrics endpoint failures.
#[derive(Debug)]
pub enum MetricsError {
    EncodingFailed,
}

impl IntoResponse for MetricsError {
    fn into_response(self) -> axum::response::Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response()
    }
}

/// Handler for the /metrics endpoint.
#[instrument(skip(state))]
pub async fn metrics_handler(State(state): State<SharedState>) -> Result<String, MetricsError> {
    let start = Instant::now();
    debug!("Processing /metrics request");

    state.health_stats.record_http_request();

    // Copy everything out of the cache before touching the gauges
    let samples = state.cache.samples();
    let entities = state.cache.entities();
    let report = state.cache.memory_report();
    let ready = state.cache.is_ready();

    // Reset metrics before populating with fresh data
    state.metrics.reset();
    for sample in &samples {
        state.metrics.set_sample(sample);
    }
    for entity in &entities {
        state
            .metrics
            .set_entity_error(&entity.kind, &entity.id, entity.error.is_some());
    }
    state.metrics.set_memory(&report, ready);

    let families = state.registry.gather();
    let mut buffer = Vec::with_capacity(BUFFER_CAP);
    let encoder = TextEncoder::new();

    if encoder.encode(&families, &mut buffer).is_err() {
        error!("Failed to encode Prometheus metrics");
        return Err(MetricsError::EncodingFailed);
    }

    state.scrape_duration.set(start.elapsed().as_secs_f64());
    debug!(
        "Metrics request completed: {} values of {} entities, {} bytes, {:.3}ms",
        samples.len(),
        entities.len(),
        buffer.len(),
        start.elapsed().as_secs_f64() * 1000.0
    );

    String::from_utf8(buffer).map_err(|_| MetricsError::EncodingFailed)
}
