//! Entity and counter value endpoint handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use crate::state::SharedState;

/// Handler for the /entity/{type}/{id} endpoint.
#[instrument(skip(state))]
pub async fn entity_handler(
    State(state): State<SharedState>,
    Path((kind, id)): Path<(String, String)>,
) -> impl IntoResponse {
    debug!("Processing /entity request for {}/{}", kind, id);

    state.health_stats.record_http_request();

    match state.cache.get_entity(&kind, &id) {
        Some(entity) => (StatusCode::OK, Json(json!(entity))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Unknown entity {}/{}", kind, id) })),
        ),
    }
}

/// Query parameters of the /counter endpoint.
#[derive(Debug, Deserialize)]
pub struct CounterQuery {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub instance: String,
    #[serde(default)]
    pub coeff: u64,
}

/// Handler for the /counter endpoint.
///
/// Answers 200 with the value, 202 while the counter is requested or has no
/// data yet, 422 with the error string of the entity or counter.
#[instrument(skip(state))]
pub async fn counter_handler(
    State(state): State<SharedState>,
    Query(query): Query<CounterQuery>,
) -> impl IntoResponse {
    debug!(
        "Processing /counter request for {}/{} {} [{}]",
        query.kind, query.id, query.path, query.instance
    );

    state.health_stats.record_http_request();

    let now = chrono::Utc::now().timestamp();
    let cache = state.cache.clone();
    let result = tokio::task::spawn_blocking(move || {
        cache.get_counter_value(
            &query.kind,
            &query.id,
            &query.path,
            &query.instance,
            query.coeff,
            now,
        )
    })
    .await
    .unwrap_or_else(|e| Err(format!("counter lookup failed: {}", e)));

    match result {
        Ok(Some(value)) => (StatusCode::OK, Json(json!({ "value": value }))),
        Ok(None) => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "Counter requested, no data yet" })),
        ),
        Err(error) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": error })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_state;
    use herakles_vmware_exporter::source::MockSource;
    use herakles_vmware_exporter::{Collector, CollectorSettings, VmwareCache};
    use std::sync::Arc;

    fn collected_cache() -> Arc<VmwareCache> {
        let source = Arc::new(MockSource::new());
        source.add_counter_info(6, "cpu", "usage", "average", "percent");
        source.add_counter_info(2, "net", "received", "average", "kiloBytesPerSecond");
        source.add_object("HostSystem", "host-1", "uuid-host-1");
        source.set_value("HostSystem", "host-1", 6, "", 42);

        let cache = Arc::new(VmwareCache::new(256 * 1024));
        let mut collector = Collector::new(cache.clone(), source, CollectorSettings::default());
        collector.run_cycle(chrono::Utc::now().timestamp()).unwrap();
        cache
    }

    fn counter_query(path: &str) -> CounterQuery {
        CounterQuery {
            kind: "HostSystem".into(),
            id: "host-1".into(),
            path: path.into(),
            instance: String::new(),
            coeff: 0,
        }
    }

    #[tokio::test]
    async fn test_entity_lookup() {
        let state = test_state(collected_cache());

        let found = entity_handler(
            State(state.clone()),
            Path(("HostSystem".to_string(), "host-1".to_string())),
        )
        .await
        .into_response();
        assert_eq!(found.status(), StatusCode::OK);

        let missing = entity_handler(
            State(state.clone()),
            Path(("HostSystem".to_string(), "host-9".to_string())),
        )
        .await
        .into_response();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(state.health_stats.http_requests(), 2);
    }

    #[tokio::test]
    async fn test_counter_value_statuses() {
        let state = test_state(collected_cache());

        let value = counter_handler(State(state.clone()), Query(counter_query("cpu/usage[average]")))
            .await
            .into_response();
        assert_eq!(value.status(), StatusCode::OK);

        let unknown = counter_handler(State(state.clone()), Query(counter_query("cpu/bogus[average]")))
            .await
            .into_response();
        assert_eq!(unknown.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
