//! Documentation endpoint handler.
//!
//! This module provides the `/doc` endpoint handler that displays
//! documentation for the exporter.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use tracing::{debug, instrument};

use crate::handlers::health::FOOTER_TEXT;
use crate::state::SharedState;

/// Handler for the /doc endpoint.
#[instrument(skip(state))]
pub async fn doc_handler(State(state): State<SharedState>) -> impl IntoResponse {
    debug!("Processing /doc request");

    state.health_stats.record_http_request();

    let version = env!("CARGO_PKG_VERSION");
    let cfg = &state.config;
    let doc = format!(
        r#"HERAKLES VMWARE EXPORTER - DOCUMENTATION
========================================

VERSION: {}
DESCRIPTION: Prometheus exporter for VMware performance counters and tags

HTTP ENDPOINTS
--------------
GET /metrics                           - Prometheus metrics endpoint
GET /health                            - Collector statistics and cache memory (plain text)
GET /entity/{{type}}/{{id}}                - One cached entity with its counters (JSON)
GET /counter?type=&id=&path=[&instance=][&coeff=]
                                       - One counter value, scaled (JSON)
GET /tags?uuid=                        - Tags of an object by uuid (JSON)
GET /tags/{{type}}/{{id}}                  - Tags of an object (JSON)
GET /inventory[?uuid=]                 - Inventory snapshot, or one object by uuid (JSON)
GET /inventory/{{type}}/{{id}}             - One inventory object (JSON)
GET /dump                              - Every cached entity and counter (plain text)
GET /memory                            - Cache memory report (plain text, ?format=json)
GET /doc                               - This documentation (plain text)

AVAILABLE METRICS
-----------------
herakles_vmware_counter_value           - Latest counter value per type/id/counter/instance
herakles_vmware_entity_error            - Whether the last query of an entity failed
herakles_vmware_cache_*                 - Cache memory and data set sizes
herakles_vmware_collector_*             - Collector cycles, skipped commits

COUNTER VALUES
--------------
Counters are addressed as group/key[rollup], e.g. cpu/usage[average].
Reading a counter the collector does not monitor yet requests it; its
value is reported after the next cycles. Unread requested counters are
dropped after unused_counter_ttl seconds.

EFFECTIVE SETTINGS
------------------
cache_size:            {}
refresh_interval:      {}s
tags_refresh_interval: {}s
max_query_metrics:     {}

{}
"#,
        version,
        cfg.cache_size.as_deref().unwrap_or("-"),
        cfg.refresh_interval.unwrap_or_default(),
        cfg.tags_refresh_interval.unwrap_or_default(),
        cfg.max_query_metrics.unwrap_or_default(),
        FOOTER_TEXT
    );

    (
        StatusCode::OK,
        [("Content-Type", "text/plain; charset=utf-8")],
        doc,
    )
}
