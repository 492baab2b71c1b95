//! Prometheus metrics definitions for herakles-vmware-exporter.
//!
//! This module defines the Prometheus metrics exported for cached counter
//! values and for the cache itself.

use herakles_vmware_exporter::cache::{CounterSample, MemoryReport};
use prometheus::{Gauge, GaugeVec, Opts, Registry};

/// Collection of Prometheus metrics for counter values and cache telemetry.
#[derive(Clone)]
pub struct CacheMetrics {
    pub counter_value: GaugeVec,
    pub entity_error: GaugeVec,

    // Arena and string pool
    pub capacity_bytes: Gauge,
    pub used_bytes: Gauge,
    pub free_bytes: Gauge,
    pub peak_used_bytes: Gauge,
    pub largest_free_chunk_bytes: Gauge,
    pub strings: Gauge,
    pub string_bytes: Gauge,

    // Data sets
    pub entities: Gauge,
    pub counters: Gauge,
    pub values: Gauge,
    pub tag_entries: Gauge,
    pub inventory_objects: Gauge,

    // Collector cycles
    pub cycles: Gauge,
    pub skipped_commits: Gauge,
    pub skipped_tag_updates: Gauge,
    pub skipped_inventory_updates: Gauge,
    pub last_required_bytes: Gauge,
    pub ready: Gauge,
}

fn gauge(registry: &Registry, telemetry: bool, name: &str, help: &str) -> Result<Gauge, Box<dyn std::error::Error>> {
    let gauge = Gauge::new(name, help)?;
    if telemetry {
        registry.register(Box::new(gauge.clone()))?;
    }
    Ok(gauge)
}

impl CacheMetrics {
    /// Creates all metrics; cache telemetry is registered only when
    /// `telemetry` is set.
    pub fn new(registry: &Registry, telemetry: bool) -> Result<Self, Box<dyn std::error::Error>> {
        let counter_value = GaugeVec::new(
            Opts::new(
                "herakles_vmware_counter_value",
                "Latest value of a VMware performance counter, scaled to bytes, Hz or ratio",
            ),
            &["type", "id", "counter", "instance"],
        )?;
        let entity_error = GaugeVec::new(
            Opts::new(
                "herakles_vmware_entity_error",
                "Whether the last performance query of an entity failed (1) or not (0)",
            ),
            &["type", "id"],
        )?;
        registry.register(Box::new(counter_value.clone()))?;
        registry.register(Box::new(entity_error.clone()))?;

        Ok(Self {
            counter_value,
            entity_error,
            capacity_bytes: gauge(
                registry,
                telemetry,
                "herakles_vmware_cache_capacity_bytes",
                "Configured cache memory budget in bytes",
            )?,
            used_bytes: gauge(
                registry,
                telemetry,
                "herakles_vmware_cache_used_bytes",
                "Cache memory in use in bytes",
            )?,
            free_bytes: gauge(
                registry,
                telemetry,
                "herakles_vmware_cache_free_bytes",
                "Cache memory free in bytes",
            )?,
            peak_used_bytes: gauge(
                registry,
                telemetry,
                "herakles_vmware_cache_peak_used_bytes",
                "Highest cache memory use since start in bytes",
            )?,
            largest_free_chunk_bytes: gauge(
                registry,
                telemetry,
                "herakles_vmware_cache_largest_free_chunk_bytes",
                "Largest contiguous free cache chunk in bytes",
            )?,
            strings: gauge(
                registry,
                telemetry,
                "herakles_vmware_cache_strings",
                "Distinct strings in the cache string pool",
            )?,
            string_bytes: gauge(
                registry,
                telemetry,
                "herakles_vmware_cache_string_bytes",
                "Cache memory held by the string pool in bytes",
            )?,
            entities: gauge(
                registry,
                telemetry,
                "herakles_vmware_cache_entities",
                "Performance entities in the cache",
            )?,
            counters: gauge(
                registry,
                telemetry,
                "herakles_vmware_cache_counters",
                "Performance counters monitored across all entities",
            )?,
            values: gauge(
                registry,
                telemetry,
                "herakles_vmware_cache_values",
                "Counter instance values committed by the last cycle",
            )?,
            tag_entries: gauge(
                registry,
                telemetry,
                "herakles_vmware_cache_tag_entries",
                "Objects with tags or a tag error in the cache",
            )?,
            inventory_objects: gauge(
                registry,
                telemetry,
                "herakles_vmware_cache_inventory_objects",
                "Inventory objects in the cached inventory snapshot",
            )?,
            cycles: gauge(
                registry,
                telemetry,
                "herakles_vmware_collector_cycles",
                "Performance cycles run since start",
            )?,
            skipped_commits: gauge(
                registry,
                telemetry,
                "herakles_vmware_collector_skipped_commits",
                "Performance cycles whose values did not fit into the cache",
            )?,
            skipped_tag_updates: gauge(
                registry,
                telemetry,
                "herakles_vmware_collector_skipped_tag_updates",
                "Tag cycles whose tags did not fit into the cache",
            )?,
            skipped_inventory_updates: gauge(
                registry,
                telemetry,
                "herakles_vmware_collector_skipped_inventory_updates",
                "Performance cycles whose inventory snapshot did not fit into the cache",
            )?,
            last_required_bytes: gauge(
                registry,
                telemetry,
                "herakles_vmware_collector_last_required_bytes",
                "Cache memory the last performance commit required in bytes",
            )?,
            ready: gauge(
                registry,
                telemetry,
                "herakles_vmware_cache_ready",
                "Whether performance values were committed at least once (1) or not (0)",
            )?,
        })
    }

    /// Resets the per-entity metrics before populating them with fresh data.
    pub fn reset(&self) {
        self.counter_value.reset();
        self.entity_error.reset();
    }

    pub fn set_sample(&self, sample: &CounterSample) {
        self.counter_value
            .with_label_values(&[
                sample.kind.as_str(),
                sample.id.as_str(),
                sample.path.as_str(),
                sample.instance.as_str(),
            ])
            .set(sample.value.as_f64());
    }

    pub fn set_entity_error(&self, kind: &str, id: &str, failed: bool) {
        self.entity_error
            .with_label_values(&[kind, id])
            .set(if failed { 1.0 } else { 0.0 });
    }

    pub fn set_memory(&self, report: &MemoryReport, ready: bool) {
        let arena = &report.memory.arena;
        self.capacity_bytes.set(arena.capacity as f64);
        self.used_bytes.set(arena.used as f64);
        self.free_bytes.set(arena.free as f64);
        self.peak_used_bytes.set(arena.peak_used as f64);
        self.largest_free_chunk_bytes
            .set(arena.largest_free_chunk as f64);
        self.strings.set(report.memory.strings as f64);
        self.string_bytes.set(report.memory.strpool_bytes as f64);

        self.entities.set(report.entities as f64);
        self.counters.set(report.counters as f64);
        self.values.set(report.values as f64);
        self.tag_entries.set(report.tag_entries as f64);
        self.inventory_objects.set(report.inventory_objects as f64);

        self.cycles.set(report.status.cycles as f64);
        self.skipped_commits
            .set(report.status.skipped_commits as f64);
        self.skipped_tag_updates
            .set(report.status.skipped_tag_updates as f64);
        self.skipped_inventory_updates
            .set(report.status.skipped_inventory_updates as f64);
        self.last_required_bytes
            .set(report.status.last_required as f64);
        self.ready.set(if ready { 1.0 } else { 0.0 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herakles_vmware_exporter::catalog::ScaledValue;
    use herakles_vmware_exporter::VmwareCache;
    use prometheus::{Encoder, TextEncoder};

    fn encode(registry: &Registry) -> String {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn test_sample_and_memory_metrics() {
        let registry = Registry::new();
        let metrics = CacheMetrics::new(&registry, true).unwrap();

        metrics.set_sample(&CounterSample {
            kind: "HostSystem".into(),
            id: "host-1".into(),
            path: "cpu/usage[average]".into(),
            instance: "".into(),
            value: ScaledValue::Float(42.5),
        });
        metrics.set_entity_error("HostSystem", "host-2", true);
        metrics.set_memory(&VmwareCache::new(64 * 1024).memory_report(), false);

        let text = encode(&registry);
        assert!(text.contains("herakles_vmware_counter_value"));
        assert!(text.contains("counter=\"cpu/usage[average]\""));
        assert!(text.contains("herakles_vmware_cache_capacity_bytes 65536"));
        assert!(text.contains("herakles_vmware_cache_ready 0"));
        assert!(text.contains("herakles_vmware_cache_inventory_objects 0"));

        metrics.reset();
        assert!(!encode(&registry).contains("host-1"));
    }

    #[test]
    fn test_telemetry_disabled() {
        let registry = Registry::new();
        let metrics = CacheMetrics::new(&registry, false).unwrap();
        metrics.set_memory(&VmwareCache::new(64 * 1024).memory_report(), true);
        assert!(!encode(&registry).contains("herakles_vmware_cache_capacity_bytes"));
    }
}
