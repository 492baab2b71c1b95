//! Application state management for the exporter.
//!
//! This module defines the shared application state that is passed
//! to HTTP handlers and used by the background collector task.

use std::sync::Arc;
use std::time::Instant;

use herakles_vmware_exporter::collector::{CycleReport, TagsReport};
use herakles_vmware_exporter::config::Config;
use herakles_vmware_exporter::health_stats::HealthStats;
use herakles_vmware_exporter::VmwareCache;
use prometheus::{Gauge, Registry};
use tokio::sync::RwLock;

use crate::metrics::CacheMetrics;

/// Type alias for shared application state.
pub type SharedState = Arc<AppState>;

/// Outcome of the latest collector runs.
#[derive(Debug, Clone, Default)]
pub struct CycleState {
    pub last_report: Option<CycleReport>,
    pub last_tags: Option<TagsReport>,
    pub last_updated: Option<Instant>,
    pub update_success: bool,
    pub is_updating: bool,
}

/// Global application state shared across requests and background tasks.
pub struct AppState {
    pub registry: Registry,
    pub metrics: CacheMetrics,
    pub scrape_duration: Gauge,
    pub cache: Arc<VmwareCache>,
    pub cycle: RwLock<CycleState>,
    pub config: Arc<Config>,
    pub health_stats: Arc<HealthStats>,
}

#[cfg(test)]
pub fn test_state(cache: Arc<VmwareCache>) -> SharedState {
    let registry = Registry::new();
    let metrics = CacheMetrics::new(&registry, true).unwrap();
    let scrape_duration = Gauge::new("test_scrape_duration_seconds", "test").unwrap();
    Arc::new(AppState {
        registry,
        metrics,
        scrape_duration,
        cache,
        cycle: RwLock::new(CycleState::default()),
        config: Arc::new(Config::default()),
        health_stats: Arc::new(HealthStats::new()),
    })
}
