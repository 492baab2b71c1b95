//! Inventory snapshot endpoint handlers.

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

#[derive(Debug, Deserialize)]
pub struct InventoryQuery {
    pub uuid: Option<String>,
}

/// Handler for the /inventory/{type}/{id} endpoint.
#[instrument(skip(state))]
pub async fn object_handler(
    State(state): State<SharedState>,
    Path((kind, id)): Path<(String, String)>,
) -> impl IntoResponse {
    debug!("Processing /inventory request for {}/{}", kind, id);
    state.health_stats.record_http_request();

    match state.cache.get_object(&kind, &id) {
        Some(object) => (StatusCode::OK, Json(json!(object))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Unknown object {}/{}", kind, id) })),
        ),
    }
}

/// Handler for the /inventory endpoint: one object by uuid, or the whole
/// snapshot without a uuid.
#[instrument(skip(state))]
pub async fn inventory_handler(
    State(state): State<SharedState>,
    Query(query): Query<InventoryQuery>,
) -> impl IntoResponse {
    debug!("Processing /inventory request");
    state.health_stats.record_http_request();

    match query.uuid {
        Some(uuid) => match state.cache.get_object_by_uuid(&uuid) {
            Some(object) => (StatusCode::OK, Json(json!(object))),
            None => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("Unknown uuid {}", uuid) })),
            ),
        },
        None => (StatusCode::OK, Json(json!(state.cache.inventory_snapshot()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_state;
    use herakles_vmware_exporter::source::MockSource;
    use herakles_vmware_exporter::{Collector, CollectorSettings, VmwareCache};
    use std::sync::Arc;

    fn collected_state() -> crate::state::SharedState {
        let source = Arc::new(MockSource::new());
        source.add_counter_info(6, "cpu", "usage", "average", "percent");
        source.add_object("HostSystem", "host-1", "uuid-host-1");
        source.set_value("HostSystem", "host-1", 6, "", 42);

        let cache = Arc::new(VmwareCache::new(256 * 1024));
        let mut collector = Collector::new(cache.clone(), source, CollectorSettings::default());
        collector.run_cycle(chrono::Utc::now().timestamp()).unwrap();
        test_state(cache)
    }

    #[tokio::test]
    async fn test_object_lookup() {
        let state = collected_state();

        let found = object_handler(
            State(state.clone()),
            Path(("HostSystem".to_string(), "host-1".to_string())),
        )
        .await
        .into_response();
        assert_eq!(found.status(), StatusCode::OK);

        let missing = object_handler(
            State(state.clone()),
            Path(("HostSystem".to_string(), "host-9".to_string())),
        )
        .await
        .into_response();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_uuid_lookup_and_snapshot() {
        let state = collected_state();

        let found = inventory_handler(
            State(state.clone()),
            Query(InventoryQuery {
                uuid: Some("uuid-host-1".into()),
            }),
        )
        .await
        .into_response();
        assert_eq!(found.status(), StatusCode::OK);

        let missing = inventory_handler(
            State(state.clone()),
            Query(InventoryQuery {
                uuid: Some("uuid-host-9".into()),
            }),
        )
        .await
        .into_response();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let snapshot = inventory_handler(State(state.clone()), Query(InventoryQuery { uuid: None }))
            .await
            .into_response();
        assert_eq!(snapshot.status(), StatusCode::OK);
        assert_eq!(state.health_stats.http_requests(), 3);
    }
}
