//! Wiring of the cache and collector from the effective configuration.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use herakles_vmware_exporter::config::Config;
use herakles_vmware_exporter::source::mock::MockSource;
use herakles_vmware_exporter::source::testdata::load_test_data_from_file;
use herakles_vmware_exporter::{Collector, VmwareCache};
use tracing::info;

/// Creates the cache with the configured budget and a collector replaying
/// the configured test data file.
pub fn build_collector(cfg: &Config) -> anyhow::Result<Collector> {
    let capacity = cfg.cache_size_bytes().map_err(|e| anyhow!(e))?;
    let path = cfg
        .test_data_file
        .as_deref()
        .context("no data source configured: set test_data_file or --test-data-file")?;

    let data = load_test_data_from_file(path)
        .map_err(|e| anyhow!(e))
        .with_context(|| format!("cannot replay {}", path.display()))?;
    info!(
        "Replaying {} objects and {} counters from {}",
        data.objects.len(),
        data.counters.len(),
        path.display()
    );

    let cache = Arc::new(VmwareCache::new(capacity));
    let source = Arc::new(MockSource::from_test_data(&data));
    Ok(Collector::new(cache, source, cfg.collector_settings()))
}
