//! Collector update pipeline.
//!
//! One performance cycle runs catalog bootstrap (first cycle only),
//! discovery and expiry, then `FETCH_REFRESH_RATES → CHECK_AVAILABILITY →
//! QUERY_VALUES → SIZE_AND_COMMIT`. Every remote call is made with the cache
//! unlocked; the lock is taken only to read what has to be requested and to
//! admit, swap or commit what was fetched. The tag cycle is independent and
//! follows the same build, size, swap discipline.

use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap as HashMap;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::cache::VmwareCache;
use crate::catalog::{catalog_entries, discovery_profile};
use crate::error::CollectorError;
use crate::perf::{
    CommitReport, DiscoveredEntity, DiscoveryReport, ExpireReport, QueryEntity, RefreshRate,
    Retention,
};
use crate::source::{InventoryObject, PerfData, PerfQuerySpec, PerfRequest, VsphereSource};
use crate::tags::{collect_entity_tags, tags_supported, TAGS_UNSUPPORTED};

/// Window of historical samples requested for entities without real-time
/// statistics.
pub const HISTORICAL_WINDOW_SECS: i64 = 3600;
/// Samples requested per counter.
pub const MAX_SAMPLE: u32 = 2;
/// Default counter limit of a historical request.
pub const DEFAULT_MAX_QUERY_METRICS: usize = 64;

/// Tunables of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorSettings {
    /// Counter limit of a real-time request, `None` for no limit.
    pub max_counters_per_request: Option<usize>,
    /// Counter limit of a historical request.
    pub max_query_metrics: usize,
    pub retention: Retention,
    /// Cycles the first commit may be starved before giving up.
    pub first_commit_retries: u32,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            max_counters_per_request: None,
            max_query_metrics: DEFAULT_MAX_QUERY_METRICS,
            retention: Retention::default(),
            first_commit_retries: 0,
        }
    }
}

/// What one performance cycle did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    pub catalog_registered: usize,
    pub discovery: Option<DiscoveryReport>,
    pub expired: ExpireReport,
    pub refresh_rates: usize,
    pub refresh_failures: usize,
    pub checked: usize,
    pub acceptable: usize,
    pub unsupported: usize,
    pub requests: usize,
    pub failed_requests: usize,
    pub dropped: usize,
    pub commit: Option<CommitReport>,
    pub skipped_commit: bool,
    pub inventory_objects: usize,
    pub skipped_inventory: bool,
    pub error: Option<String>,
    pub duration_seconds: f64,
}

/// What one tag cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagsReport {
    pub objects: usize,
    pub stored: usize,
    pub required: usize,
    pub skipped: bool,
    pub error: Option<String>,
}

/// One request and the positions (in the planned entity list) it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub request: PerfRequest,
    pub entities: Vec<usize>,
}

/// Splits planned entities into requests of at most `limit` counters. An
/// entity whose counters do not fit is continued in the next request.
pub fn batch_queries(entities: &[QueryEntity], limit: usize, now: i64) -> Vec<Batch> {
    let limit = limit.max(1);
    let mut batches = Vec::new();
    let mut current = Batch {
        request: PerfRequest::default(),
        entities: Vec::new(),
    };
    let mut used = 0;

    for (index, entity) in entities.iter().enumerate() {
        let mut start = 0;
        while start < entity.metrics.len() {
            if used == limit {
                batches.push(std::mem::replace(
                    &mut current,
                    Batch {
                        request: PerfRequest::default(),
                        entities: Vec::new(),
                    },
                ));
                used = 0;
            }

            let end = entity.metrics.len().min(start + limit - used);
            current.request.specs.push(query_spec(entity, start, end, now));
            if current.entities.last() != Some(&index) {
                current.entities.push(index);
            }
            used += end - start;
            start = end;
        }
    }

    if !current.request.specs.is_empty() {
        batches.push(current);
    }
    batches
}

fn query_spec(entity: &QueryEntity, start: usize, end: usize, now: i64) -> PerfQuerySpec {
    let (start_time, interval_id) = match entity.refresh {
        RefreshRate::Interval(secs) => (None, Some(secs)),
        _ => (Some(now - HISTORICAL_WINDOW_SECS), None),
    };
    PerfQuerySpec {
        kind: entity.entity.kind.clone(),
        id: entity.entity.id.clone(),
        metrics: entity.metrics[start..end].to_vec(),
        start_time,
        interval_id,
        max_sample: MAX_SAMPLE,
    }
}

/// Consecutive cycles in which the cache could not take its first data set.
#[derive(Debug, Default)]
struct Starvation {
    cycles: u32,
    retries: u32,
}

impl Starvation {
    /// Counts one starved cycle; fails once the retries are used up.
    fn starve(&mut self, required: usize, available: usize) -> Result<(), CollectorError> {
        self.cycles += 1;
        if self.cycles > self.retries {
            return Err(CollectorError::FirstCommitStarved {
                required,
                available,
            });
        }
        debug!("Starved cycle {} of {} allowed", self.cycles, self.retries + 1);
        Ok(())
    }

    fn reset(&mut self) {
        self.cycles = 0;
    }
}

/// Drives cycles of one monitored service against one cache.
pub struct Collector {
    cache: Arc<VmwareCache>,
    source: Arc<dyn VsphereSource>,
    settings: CollectorSettings,
    catalog_loaded: bool,
    last_discovery: i64,
    starvation: Starvation,
}

impl Collector {
    pub fn new(
        cache: Arc<VmwareCache>,
        source: Arc<dyn VsphereSource>,
        settings: CollectorSettings,
    ) -> Self {
        let starvation = Starvation {
            cycles: 0,
            retries: settings.first_commit_retries,
        };
        Self {
            cache,
            source,
            settings,
            catalog_loaded: false,
            last_discovery: 0,
            starvation,
        }
    }

    pub fn cache(&self) -> &Arc<VmwareCache> {
        &self.cache
    }

    /// Runs one performance cycle.
    ///
    /// Remote failures are recorded in the cache and the report; only
    /// budget starvation of the first commit and broken cache invariants are
    /// returned as errors, and a failed catalog fetch ends the cycle early.
    #[instrument(skip(self))]
    pub fn run_cycle(&mut self, now: i64) -> Result<CycleReport, CollectorError> {
        let start = Instant::now();
        let mut report = CycleReport::default();

        if !self.catalog_loaded {
            report.catalog_registered = self.load_catalog(now)?;
            if !self.catalog_loaded {
                report.skipped_commit = true;
                report.duration_seconds = start.elapsed().as_secs_f64();
                return Ok(report);
            }
        }

        let inventory = match self.source.fetch_inventory() {
            Ok(inventory) => inventory,
            Err(e) => {
                let error = e.to_string();
                warn!("Cannot update performance entities: {}", error);
                self.fail_cycle(&error, now);
                report.error = Some(error);
                report.duration_seconds = start.elapsed().as_secs_f64();
                return Ok(report);
            }
        };

        report.discovery = self.discover(&inventory.objects, now)?;
        if report.discovery.is_none() && !self.cache.is_ready() {
            report.skipped_commit = true;
            report.duration_seconds = start.elapsed().as_secs_f64();
            return Ok(report);
        }

        report.expired = self.expire(now);
        self.fetch_refresh_rates(&mut report);
        self.check_availability(&mut report);
        let collected = self.query_values(now, &mut report);
        self.size_and_commit(&collected, now, &mut report)?;
        self.store_inventory(&inventory.objects, &mut report)?;

        report.duration_seconds = start.elapsed().as_secs_f64();
        info!(
            "Cycle finished in {:.3}s: {} requests, {} values, {} errors, {} inventory objects{}{}",
            report.duration_seconds,
            report.requests,
            report.commit.map(|c| c.values).unwrap_or(0),
            report.commit.map(|c| c.errors).unwrap_or(0),
            report.inventory_objects,
            if report.skipped_commit { ", commit skipped" } else { "" },
            if report.skipped_inventory { ", inventory skipped" } else { "" }
        );
        Ok(report)
    }

    /// Registers the remote counter catalog. A catalog that does not fit
    /// counts as a starved cycle and leaves the catalog unloaded.
    fn load_catalog(&mut self, now: i64) -> Result<usize, CollectorError> {
        let remote = self.source.fetch_counter_catalog()?;
        let entries = catalog_entries(&remote);

        let mut guard = self.cache.lock();
        let core = &mut *guard;
        let registered = match core.catalog.register(&mut core.mem, &entries) {
            Ok(count) => count,
            Err(e) if e.is_shortfall() => {
                let required = core.catalog.required_size(&core.mem, &entries);
                let available = core.mem.free_size();
                core.status.record_starved(now, required, available);
                warn!(
                    "There is not enough cache memory. The counter catalog requires up to {} bytes \
                     of free cache memory. Available {} bytes ({}). Increase cache_size",
                    required, available, e
                );
                self.starvation.starve(required, available)?;
                return Ok(0);
            }
            Err(e) => return Err(CollectorError::Fatal(e)),
        };

        self.catalog_loaded = true;
        info!(
            "Registered {} performance counter paths from {} remote counters",
            registered,
            remote.len()
        );
        Ok(registered)
    }

    fn discover(
        &mut self,
        objects: &[InventoryObject],
        now: i64,
    ) -> Result<Option<DiscoveryReport>, CollectorError> {
        let resolved: HashMap<&'static str, u64> = {
            let core = self.cache.lock();
            ["HostSystem", "VirtualMachine", "Datastore"]
                .iter()
                .filter_map(|kind| discovery_profile(kind))
                .flat_map(|profile| profile.counters.iter())
                .filter_map(|path| {
                    core.catalog
                        .lookup(&core.mem, path)
                        .map(|(id, _)| (*path, id))
                })
                .collect()
        };

        let discovered: Vec<DiscoveredEntity> = objects
            .par_iter()
            .filter_map(|object| {
                let profile = discovery_profile(&object.kind)?;
                let mut counters: Vec<u64> = profile
                    .counters
                    .iter()
                    .filter_map(|path| {
                        let id = resolved.get(path).copied();
                        if id.is_none() {
                            debug!("cannot find performance counter {}", path);
                        }
                        id
                    })
                    .collect();
                counters.sort_unstable();
                counters.dedup();
                Some(DiscoveredEntity {
                    kind: object.kind.clone(),
                    id: object.id.clone(),
                    query_scope: profile.query_scope.to_string(),
                    counters,
                })
            })
            .collect();

        let mut guard = self.cache.lock();
        let core = &mut *guard;
        let footprint = core.perf.discovery_footprint(&core.mem, &discovered);
        if let Err(e) = core.mem.check_fit(&footprint) {
            let required = footprint.total();
            let available = core.mem.free_size();
            if !core.perf.is_ready() {
                core.status.record_starved(now, required, available);
                warn!(
                    "There is not enough cache memory. Performance entities require up to {} bytes \
                     of free cache memory. Available {} bytes ({}). Increase cache_size",
                    required, available, e
                );
                self.starvation.starve(required, available)?;
                return Ok(None);
            }
            warn!(
                "Postponed VMware performance entities require up to {} bytes of free cache memory. \
                 Available {} bytes ({}). Discovery skipped",
                required, available, e
            );
            return Ok(None);
        }

        let discovery = core
            .perf
            .apply_discovery(&mut core.mem, &discovered, now)
            .map_err(CollectorError::Fatal)?;
        self.last_discovery = now;
        debug!(
            "Discovery: {} entities created, {} refreshed",
            discovery.created, discovery.refreshed
        );
        Ok(Some(discovery))
    }

    fn expire(&mut self, now: i64) -> ExpireReport {
        let mut guard = self.cache.lock();
        let core = &mut *guard;
        let expired = core.perf.expire_pass(
            &mut core.mem,
            now,
            self.last_discovery,
            &self.settings.retention,
        );
        if expired.entities_removed > 0 || expired.counters_removed > 0 {
            debug!(
                "Expired {} entities and {} custom counters",
                expired.entities_removed, expired.counters_removed
            );
        }
        expired
    }

    fn fetch_refresh_rates(&mut self, report: &mut CycleReport) {
        let unknown = {
            let core = self.cache.lock();
            core.perf.unknown_refresh(&core.mem)
        };
        if unknown.is_empty() {
            return;
        }

        let mut rates = Vec::with_capacity(unknown.len());
        for entity in unknown {
            match self.source.fetch_refresh_rate(&entity.kind, &entity.id) {
                Ok(rate) => rates.push((entity, rate)),
                Err(e) => {
                    warn!("cannot get refresh rate for {}: {}", entity, e);
                    report.refresh_failures += 1;
                }
            }
        }

        let mut guard = self.cache.lock();
        let core = &mut *guard;
        for (entity, rate) in rates {
            if core.perf.set_refresh(&core.mem, &entity.kind, &entity.id, rate) {
                report.refresh_rates += 1;
            }
        }
    }

    fn check_availability(&mut self, report: &mut CycleReport) {
        let targets = {
            let core = self.cache.lock();
            core.perf.availability_targets(&core.mem)
        };

        let mut checked: HashMap<(String, String), Vec<u64>> = HashMap::new();
        for target in targets {
            let key = (target.entity.kind.clone(), target.entity.id.clone());
            if !checked.contains_key(&key) {
                match self.source.fetch_available_counters(
                    &target.entity.kind,
                    &target.entity.id,
                    target.refresh,
                ) {
                    Ok(mut available) => {
                        available.sort_unstable();
                        available.dedup();
                        checked.insert(key.clone(), available);
                    }
                    Err(e) => {
                        warn!("cache update error: {}", e);
                        return;
                    }
                }
            }

            let Some(available) = checked.get(&key) else {
                continue;
            };
            let mut guard = self.cache.lock();
            let core = &mut *guard;
            let (acceptable, unsupported) =
                core.perf
                    .apply_availability(&core.mem, &target.entity, available);
            report.checked += 1;
            report.acceptable += acceptable;
            report.unsupported += unsupported;
            debug!(
                "{}: {} counters acceptable, {} not supported",
                target.entity, acceptable, unsupported
            );
        }
    }

    fn query_values(&mut self, now: i64, report: &mut CycleReport) -> Vec<PerfData> {
        let plan = {
            let mut guard = self.cache.lock();
            let core = &mut *guard;
            core.perf.plan_queries(&core.mem)
        };
        if plan.skipped_unknown > 0 || plan.skipped_unsupported > 0 {
            debug!(
                "Skipping {} entities with unknown refresh rate and {} with unsupported counters",
                plan.skipped_unknown, plan.skipped_unsupported
            );
        }

        let mut collected = Vec::new();
        let realtime_limit = self.settings.max_counters_per_request.unwrap_or(usize::MAX);
        self.retrieve(&plan.realtime, realtime_limit, now, &mut collected, report);
        self.retrieve(
            &plan.historical,
            self.settings.max_query_metrics,
            now,
            &mut collected,
            report,
        );

        let before = collected.len();
        collected.retain(|data| {
            let usable = data.is_usable();
            if !usable {
                debug!(
                    "Dropping performance data of {} \"{}\" without valid values",
                    data.kind, data.id
                );
            }
            usable
        });
        report.dropped = before - collected.len();
        collected
    }

    fn retrieve(
        &self,
        entities: &[QueryEntity],
        limit: usize,
        now: i64,
        collected: &mut Vec<PerfData>,
        report: &mut CycleReport,
    ) {
        let batches = batch_queries(entities, limit, now);

        for (position, batch) in batches.iter().enumerate() {
            report.requests += 1;
            match self.source.query_perf(&batch.request) {
                Ok(data) => collected.extend(data),
                Err(e) => {
                    let error = e.to_string();
                    warn!(
                        "Performance request {} of {} failed: {}",
                        position + 1,
                        batches.len(),
                        error
                    );
                    report.failed_requests += 1;

                    let mut affected: Vec<usize> = batches[position..]
                        .iter()
                        .flat_map(|b| b.entities.iter().copied())
                        .collect();
                    affected.dedup();
                    for index in affected {
                        let entity = &entities[index].entity;
                        collected.push(PerfData::failed(&entity.kind, &entity.id, &error));
                    }
                    break;
                }
            }
        }
    }

    fn size_and_commit(
        &mut self,
        collected: &[PerfData],
        now: i64,
        report: &mut CycleReport,
    ) -> Result<(), CollectorError> {
        let mut guard = self.cache.lock();
        let core = &mut *guard;

        let plan = core.perf.plan_commit(&core.mem, collected);
        if plan.unmatched() > 0 {
            debug!("{} performance data entries name removed entities", plan.unmatched());
        }
        let required = plan.required();
        let available = core.mem.free_size();
        core.status.cycles += 1;
        core.status.last_cycle = now;
        core.status.last_required = required;
        core.status.last_free = available;
        core.status.last_error = None;

        let shortfall = match core.mem.check_fit(plan.footprint()) {
            Ok(()) => {
                let commit = core
                    .perf
                    .commit(&mut core.mem, plan)
                    .map_err(CollectorError::Fatal)?;
                self.starvation.reset();
                report.commit = Some(commit);
                return Ok(());
            }
            Err(e) => e,
        };

        report.skipped_commit = true;
        core.status.skipped_commits += 1;

        if !core.perf.is_ready() {
            warn!(
                "There is not enough cache memory. Performance counters require up to {} bytes \
                 of free cache memory. Available {} bytes ({}). Increase cache_size",
                required, available, shortfall
            );
            return self.starvation.starve(required, available);
        }

        warn!(
            "Postponed VMware performance counters require up to {} bytes of free cache memory. \
             Available {} bytes ({}). Reading performance counters skipped",
            required, available, shortfall
        );
        Ok(())
    }

    /// Swaps in the fetched inventory as the new snapshot. Runs after the
    /// values commit. An unchanged inventory keeps the current generation; a
    /// snapshot that does not fit is skipped and the previous one kept.
    fn store_inventory(
        &mut self,
        objects: &[InventoryObject],
        report: &mut CycleReport,
    ) -> Result<(), CollectorError> {
        let mut guard = self.cache.lock();
        let core = &mut *guard;
        if core.inventory.matches(&core.mem, objects) {
            report.inventory_objects = core.inventory.len();
            return Ok(());
        }

        let footprint = core.inventory.footprint(&core.mem, objects);
        core.status.inventory_required = footprint.total();

        if let Err(e) = core.mem.check_fit(&footprint) {
            warn!(
                "Postponed VMware inventory requires up to {} bytes of free cache memory. \
                 Available {} bytes ({}). Inventory update skipped",
                footprint.total(),
                core.mem.free_size(),
                e
            );
            report.skipped_inventory = true;
            core.status.skipped_inventory_updates += 1;
            return Ok(());
        }

        core.inventory
            .replace(&mut core.mem, objects)
            .map_err(CollectorError::Fatal)?;
        report.inventory_objects = core.inventory.len();
        Ok(())
    }

    /// Attaches a whole-cycle failure to every entity.
    fn fail_cycle(&mut self, error: &str, now: i64) {
        let mut guard = self.cache.lock();
        let core = &mut *guard;
        if let Err(e) = core.perf.set_error_all(&mut core.mem, error) {
            warn!("Cannot store cycle error: {}", e);
        }
        core.status.cycles += 1;
        core.status.last_cycle = now;
        core.status.last_error = Some(error.to_string());
    }

    /// Runs one tag cycle.
    #[instrument(skip(self))]
    pub fn run_tags_cycle(&mut self) -> Result<TagsReport, CollectorError> {
        let mut report = TagsReport::default();

        let objects = match self.tag_objects() {
            Ok(objects) => objects,
            Err(error) => {
                warn!("Cannot update tags: {}", error);
                self.set_tags_error(&error);
                report.error = Some(error);
                return Ok(report);
            }
        };
        report.objects = objects.len();

        let entries = collect_entity_tags(self.source.as_ref(), &objects);

        let mut guard = self.cache.lock();
        let core = &mut *guard;
        core.status.tag_cycles += 1;
        let footprint = core.tags.footprint(&core.mem, &entries);
        let required = footprint.total();
        let available = core.mem.free_size();
        report.required = required;
        core.status.tags_required = required;

        if let Err(e) = core.mem.check_fit(&footprint) {
            warn!(
                "Postponed VMware tags require up to {} bytes of free cache memory. \
                 Available {} bytes ({}). Tags update skipped",
                required, available, e
            );
            report.skipped = true;
            core.status.skipped_tag_updates += 1;
            return Ok(report);
        }

        core.tags
            .replace(&mut core.mem, &entries)
            .map_err(CollectorError::Fatal)?;
        report.stored = core.tags.len();
        debug!(
            "Stored tags of {} of {} objects",
            report.stored, report.objects
        );
        Ok(report)
    }

    fn tag_objects(&self) -> Result<Vec<InventoryObject>, String> {
        let version = self.source.fetch_version().map_err(|e| e.to_string())?;
        if !tags_supported(&version) {
            return Err(TAGS_UNSUPPORTED.to_string());
        }
        let inventory = self.source.fetch_inventory().map_err(|e| e.to_string())?;
        Ok(inventory.objects)
    }

    fn set_tags_error(&self, error: &str) {
        let mut guard = self.cache.lock();
        let core = &mut *guard;
        if let Err(e) = core.tags.set_error(&mut core.mem, error) {
            warn!("Cannot store tags error: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena;
    use crate::perf::{CounterState, EntityRef};
    use crate::source::mock::Operation;
    use crate::source::{MetricSpec, MockSource};
    use std::collections::BTreeMap;
    use std::thread;

    const NOW: i64 = 1_700_000_000;

    fn source_with_host() -> Arc<MockSource> {
        let source = Arc::new(MockSource::new());
        source.add_counter_info(6, "cpu", "usage", "average", "percent");
        source.add_counter_info(2, "net", "received", "average", "kiloBytesPerSecond");
        source.add_object("HostSystem", "host-1", "uuid-host-1");
        source
    }

    fn collector(source: &Arc<MockSource>, capacity: usize) -> Collector {
        Collector::new(
            Arc::new(VmwareCache::new(capacity)),
            Arc::clone(source) as Arc<dyn VsphereSource>,
            CollectorSettings::default(),
        )
    }

    fn query_entity(id: &str, refresh: RefreshRate, counters: u64) -> QueryEntity {
        QueryEntity {
            entity: EntityRef::new("VirtualMachine", id),
            refresh,
            metrics: (1..=counters)
                .map(|counter_id| MetricSpec {
                    counter_id,
                    instance: "*".into(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_batching_splits_entities_across_requests() {
        let entities = vec![
            query_entity("vm-1", RefreshRate::Historical, 3),
            query_entity("vm-2", RefreshRate::Historical, 4),
        ];
        let batches = batch_queries(&entities, 5, NOW);

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].request.metric_count(), 5);
        assert_eq!(batches[0].entities, vec![0, 1]);
        assert_eq!(batches[1].request.metric_count(), 2);
        assert_eq!(batches[1].entities, vec![1]);

        let spec = &batches[0].request.specs[0];
        assert_eq!(spec.start_time, Some(NOW - HISTORICAL_WINDOW_SECS));
        assert_eq!(spec.interval_id, None);
        assert_eq!(spec.max_sample, MAX_SAMPLE);
    }

    #[test]
    fn test_unlimited_batch_is_one_request() {
        let entities: Vec<QueryEntity> = (0..10)
            .map(|i| query_entity(&format!("vm-{}", i), RefreshRate::Interval(20), 30))
            .collect();
        let batches = batch_queries(&entities, usize::MAX, NOW);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].request.metric_count(), 300);
        assert_eq!(batches[0].request.specs[0].interval_id, Some(20));
        assert_eq!(batches[0].request.specs[0].start_time, None);
    }

    #[test]
    fn test_host_scenario_end_to_end() {
        let source = source_with_host();
        source.set_value("HostSystem", "host-1", 6, "", 42);
        let mut collector = collector(&source, 256 * 1024);

        let report = collector.run_cycle(NOW).unwrap();
        assert_eq!(report.catalog_registered, 2);
        assert_eq!(report.discovery.unwrap().created, 1);
        assert_eq!(report.refresh_rates, 1);
        assert!(report.commit.is_some());

        let cache = Arc::clone(collector.cache());
        let host = cache.get_entity("HostSystem", "host-1").unwrap();
        let counter = host.counter(6).unwrap();
        assert!(counter.state.contains(CounterState::READY));
        assert_eq!(counter.values.len(), 1);
        assert_eq!(counter.values[0].instance, "");
        assert_eq!(counter.values[0].value, 42);
        assert!(cache.is_ready());

        source.remove_object("HostSystem", "host-1");
        collector.run_cycle(NOW + 60).unwrap();
        assert!(cache.get_entity("HostSystem", "host-1").is_none());
    }

    #[test]
    fn test_inventory_snapshot_follows_cycles() {
        let source = source_with_host();
        source.add_object("Folder", "group-d1", "uuid-folder");
        source.set_value("HostSystem", "host-1", 6, "", 42);
        let mut collector = collector(&source, 256 * 1024);

        let report = collector.run_cycle(NOW).unwrap();
        assert_eq!(report.inventory_objects, 2);
        assert!(!report.skipped_inventory);

        let cache = Arc::clone(collector.cache());
        let host = cache.get_object("HostSystem", "host-1").unwrap();
        assert_eq!(host.uuid, "uuid-host-1");
        // Objects without a discovery profile are still part of the snapshot.
        assert_eq!(cache.get_object_by_uuid("uuid-folder").unwrap().id, "group-d1");
        assert!(cache.get_entity("Folder", "group-d1").is_none());

        source.remove_object("Folder", "group-d1");
        collector.run_cycle(NOW + 60).unwrap();
        assert!(cache.get_object_by_uuid("uuid-folder").is_none());
        assert_eq!(cache.inventory_snapshot().generation, 2);
    }

    #[test]
    fn test_inventory_update_skipped_on_shortfall() {
        let source = source_with_host();
        source.set_value("HostSystem", "host-1", 6, "", 42);
        let mut collector = collector(&source, 32 * 1024);
        collector.run_cycle(NOW).unwrap();
        let cache = Arc::clone(collector.cache());
        assert_eq!(cache.inventory_snapshot().generation, 1);

        source.add_object("Folder", &"f".repeat(40 * 1024), "uuid-folder");
        let report = collector.run_cycle(NOW + 60).unwrap();
        assert!(report.skipped_inventory);
        assert!(report.commit.is_some());
        assert_eq!(cache.status().skipped_inventory_updates, 1);
        assert!(cache.status().inventory_required > 40 * 1024);

        // The previous snapshot stays readable.
        assert_eq!(cache.inventory_snapshot().generation, 1);
        assert!(cache.get_object("HostSystem", "host-1").is_some());
        assert!(cache.get_object_by_uuid("uuid-folder").is_none());
    }

    #[test]
    fn test_custom_counter_availability_check() {
        let source = source_with_host();
        source.add_counter_info(98, "mem", "consumed", "average", "kiloBytes");
        source.add_counter_info(99, "mem", "bogus", "average", "kiloBytes");
        source.set_available("HostSystem", "host-1", &[2, 6, 98]);
        source.set_value("HostSystem", "host-1", 98, "", 1000);
        let mut collector = collector(&source, 256 * 1024);
        collector.run_cycle(NOW).unwrap();

        let cache = Arc::clone(collector.cache());
        assert_eq!(
            cache.get_counter_value("HostSystem", "host-1", "mem/consumed[average]", "", 0, NOW),
            Ok(None)
        );
        assert_eq!(
            cache.get_counter_value("HostSystem", "host-1", "mem/bogus[average]", "", 0, NOW),
            Ok(None)
        );

        let report = collector.run_cycle(NOW + 60).unwrap();
        assert_eq!(report.acceptable, 1);
        assert_eq!(report.unsupported, 1);
        assert_eq!(source.calls().fetch_available_counters, 1);

        assert_eq!(
            cache.get_counter_value("HostSystem", "host-1", "mem/consumed[average]", "", 0, NOW + 60),
            Ok(Some(crate::catalog::ScaledValue::Unsigned(1000 * 1024)))
        );
        assert_eq!(
            cache.get_counter_value("HostSystem", "host-1", "mem/bogus[average]", "", 0, NOW + 60),
            Err("Performance counter not supported or data not ready.".to_string())
        );
    }

    #[test]
    fn test_refresh_rate_failure_skips_entity() {
        let source = source_with_host();
        source.fail(Operation::RefreshRate, "timeout");
        let mut collector = collector(&source, 256 * 1024);

        let report = collector.run_cycle(NOW).unwrap();
        assert_eq!(report.refresh_failures, 1);
        assert_eq!(report.requests, 0);

        source.recover(Operation::RefreshRate);
        let report = collector.run_cycle(NOW + 60).unwrap();
        assert_eq!(report.refresh_rates, 1);
        assert_eq!(report.requests, 1);
    }

    #[test]
    fn test_failed_request_attaches_error() {
        let source = source_with_host();
        source.fail(Operation::Query, "session expired");
        let mut collector = collector(&source, 256 * 1024);

        let report = collector.run_cycle(NOW).unwrap();
        assert_eq!(report.failed_requests, 1);
        assert_eq!(report.commit.unwrap().errors, 1);

        let cache = Arc::clone(collector.cache());
        let host = cache.get_entity("HostSystem", "host-1").unwrap();
        assert_eq!(host.error.as_deref(), Some("remote request failed: session expired"));
        assert_eq!(
            cache.get_counter_value("HostSystem", "host-1", "cpu/usage[average]", "", 0, NOW),
            Err("remote request failed: session expired".to_string())
        );

        source.recover(Operation::Query);
        collector.run_cycle(NOW + 60).unwrap();
        assert!(cache.get_entity("HostSystem", "host-1").unwrap().error.is_none());
    }

    #[test]
    fn test_inventory_failure_marks_all_entities() {
        let source = source_with_host();
        let mut collector = collector(&source, 256 * 1024);
        collector.run_cycle(NOW).unwrap();

        source.fail(Operation::Inventory, "cannot login");
        let report = collector.run_cycle(NOW + 60).unwrap();
        assert!(report.error.is_some());

        let cache = Arc::clone(collector.cache());
        let host = cache.get_entity("HostSystem", "host-1").unwrap();
        assert!(host.error.unwrap().contains("cannot login"));
        assert!(cache.status().last_error.is_some());
    }

    #[test]
    fn test_first_commit_starved_is_fatal() {
        let source = source_with_host();
        let long_instance = "x".repeat(4096);
        source.set_value("HostSystem", "host-1", 6, &long_instance, 1);

        // room for catalog and discovery, not for the values
        let mut collector = collector(&source, 4096);
        let err = collector.run_cycle(NOW).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, CollectorError::FirstCommitStarved { .. }));
    }

    #[test]
    fn test_first_commit_retries() {
        let source = source_with_host();
        source.set_value("HostSystem", "host-1", 6, &"x".repeat(4096), 1);
        let mut collector = Collector::new(
            Arc::new(VmwareCache::new(4096)),
            Arc::clone(&source) as Arc<dyn VsphereSource>,
            CollectorSettings {
                first_commit_retries: 1,
                ..CollectorSettings::default()
            },
        );

        let report = collector.run_cycle(NOW).unwrap();
        assert!(report.skipped_commit);
        assert!(collector.run_cycle(NOW + 60).is_err());
    }

    #[test]
    fn test_shortfall_after_first_commit_keeps_previous_values() {
        let source = source_with_host();
        source.set_value("HostSystem", "host-1", 6, "", 42);
        let mut collector = collector(&source, 4096);
        collector.run_cycle(NOW).unwrap();

        source.set_value("HostSystem", "host-1", 6, "", 43);
        source.set_value("HostSystem", "host-1", 6, &"y".repeat(4096), 1);
        let report = collector.run_cycle(NOW + 60).unwrap();
        assert!(report.skipped_commit);

        let cache = Arc::clone(collector.cache());
        let host = cache.get_entity("HostSystem", "host-1").unwrap();
        assert_eq!(host.counter(6).unwrap().values[0].value, 42);
        assert_eq!(cache.status().skipped_commits, 1);
    }

    fn fragmenting_source() -> Arc<MockSource> {
        let source = Arc::new(MockSource::new());
        source.add_counter_info(6, "cpu", "usage", "average", "percent");
        for i in 0..64 {
            source.add_counter_info(100 + i, "pad", &format!("c{}", i), "average", "percent");
        }
        for host in 1..=4 {
            source.add_object(
                "HostSystem",
                &format!("host-{}", host),
                &format!("uuid-host-{}", host),
            );
        }
        // Instances are catalog paths, so they are pooled already.
        for i in 0..32 {
            source.set_value("HostSystem", "host-2", 6, &format!("pad/c{}[average]", i), i);
        }
        source.set_value("HostSystem", "host-3", 6, "", 33);
        source
    }

    #[test]
    fn test_fragmented_commit_is_skipped_and_keeps_values() {
        let used_after_first = {
            let source = fragmenting_source();
            let mut roomy = collector(&source, 1024 * 1024);
            roomy.run_cycle(NOW).unwrap();
            roomy.cache().memory_report().memory.arena.used
        };

        // Leave a tail, then punch a hole by dropping the values of host-2.
        let source = fragmenting_source();
        let mut collector = collector(&source, used_after_first + 512);
        collector.run_cycle(NOW).unwrap();
        source.clear_values("HostSystem", "host-2");
        let report = collector.run_cycle(NOW + 60).unwrap();
        assert!(report.commit.is_some());
        assert!(!report.skipped_inventory);

        // One value block just above the largest free run.
        let cache = Arc::clone(collector.cache());
        let before = cache.memory_report().memory.arena;
        let mut count = 1;
        while arena::required_size(count * 16) <= before.largest_free_chunk {
            count += 1;
        }
        let needed = arena::required_size(count * 16) + arena::required_size(16);
        assert!(count <= 64);
        assert!(needed <= before.free, "{} bytes needed, {} free", needed, before.free);
        for i in 0..count {
            source.set_value("HostSystem", "host-1", 6, &format!("pad/c{}[average]", i), i as u64);
        }

        let report = collector.run_cycle(NOW + 120).unwrap();
        assert!(report.skipped_commit);
        assert!(report.commit.is_none());

        let status = cache.status();
        assert_eq!(status.last_required, needed);
        assert!(status.last_required <= status.last_free);
        assert_eq!(status.skipped_commits, 1);
        assert_eq!(cache.memory_report().memory.arena.used, before.used);

        let host3 = cache.get_entity("HostSystem", "host-3").unwrap();
        assert_eq!(host3.counter(6).unwrap().values[0].value, 33);
        let host1 = cache.get_entity("HostSystem", "host-1").unwrap();
        assert!(host1.counter(6).unwrap().values.is_empty());
    }

    fn crowded_source(hosts: usize) -> Arc<MockSource> {
        let source = source_with_host();
        for host in 2..=hosts {
            source.add_object(
                "HostSystem",
                &format!("host-{}", host),
                &format!("uuid-host-{}", host),
            );
        }
        source
    }

    #[test]
    fn test_discovery_that_never_fits_starves_first_commit() {
        let source = crowded_source(200);
        let mut collector = Collector::new(
            Arc::new(VmwareCache::new(2048)),
            Arc::clone(&source) as Arc<dyn VsphereSource>,
            CollectorSettings {
                first_commit_retries: 2,
                ..CollectorSettings::default()
            },
        );
        let cache = Arc::clone(collector.cache());

        for cycle in 0..2 {
            let report = collector.run_cycle(NOW + cycle * 60).unwrap();
            assert!(report.discovery.is_none());
            assert!(report.skipped_commit);
            assert!(report.commit.is_none());
            assert!(!cache.is_ready());
        }

        let err = collector.run_cycle(NOW + 120).unwrap_err();
        assert!(matches!(err, CollectorError::FirstCommitStarved { .. }));
        assert!(cache.entities().is_empty());
        assert!(!cache.is_ready());
        assert_eq!(cache.status().skipped_commits, 3);
        assert_eq!(source.calls().query_perf, 0);
    }

    #[test]
    fn test_discovery_shortfall_with_default_retries_is_fatal() {
        let source = crowded_source(200);
        let mut collector = collector(&source, 2048);
        let err = collector.run_cycle(NOW).unwrap_err();
        assert!(err.is_fatal());
        assert!(!collector.cache().is_ready());
    }

    #[test]
    fn test_catalog_shortfall_uses_retries() {
        let source = source_with_host();
        for i in 0..200 {
            source.add_counter_info(100 + i, "pad", &format!("counter{}", i), "average", "percent");
        }
        let mut collector = Collector::new(
            Arc::new(VmwareCache::new(1024)),
            Arc::clone(&source) as Arc<dyn VsphereSource>,
            CollectorSettings {
                first_commit_retries: 1,
                ..CollectorSettings::default()
            },
        );

        let report = collector.run_cycle(NOW).unwrap();
        assert_eq!(report.catalog_registered, 0);
        assert!(report.skipped_commit);
        assert!(report.discovery.is_none());
        assert_eq!(collector.cache().memory_report().catalog_entries, 0);

        let err = collector.run_cycle(NOW + 60).unwrap_err();
        assert!(matches!(err, CollectorError::FirstCommitStarved { .. }));
        assert_eq!(source.calls().fetch_counter_catalog, 2);
    }

    /// Entities holding values, with their values, as one reader saw them.
    fn committed_values(cache: &VmwareCache) -> BTreeMap<String, Vec<u64>> {
        cache
            .entities()
            .into_iter()
            .filter_map(|entity| {
                let values: Vec<u64> = entity
                    .counters
                    .iter()
                    .flat_map(|c| c.values.iter().map(|v| v.value))
                    .collect();
                (!values.is_empty()).then_some((entity.id, values))
            })
            .collect()
    }

    fn generation_values(generation: u64) -> BTreeMap<String, Vec<u64>> {
        (1..=4)
            .map(|host| (format!("host-{}", host), vec![generation]))
            .collect()
    }

    #[test]
    fn test_readers_never_see_a_torn_value_generation() {
        let source = crowded_source(4);
        let mut collector = collector(&source, 256 * 1024);
        let cache = Arc::clone(collector.cache());
        let generations = 40;

        let writer = {
            let source = Arc::clone(&source);
            thread::spawn(move || {
                for generation in 1..=generations {
                    for host in 1..=4 {
                        source.set_value("HostSystem", &format!("host-{}", host), 6, "", generation);
                    }
                    // host-9 comes and goes without ever delivering values.
                    if generation % 2 == 1 {
                        source.add_object("HostSystem", "host-9", "uuid-host-9");
                    } else {
                        source.remove_object("HostSystem", "host-9");
                    }
                    let report = collector.run_cycle(NOW + generation as i64 * 60).unwrap();
                    assert!(report.commit.is_some());
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let seen = committed_values(&cache);
                        if seen.is_empty() {
                            continue;
                        }
                        let generation = seen["host-1"][0];
                        assert!((1..=generations).contains(&generation));
                        assert_eq!(seen, generation_values(generation));

                        if let Some(host) = cache.get_entity("HostSystem", "host-2") {
                            let values: Vec<u64> = host
                                .counters
                                .iter()
                                .flat_map(|c| c.values.iter().map(|v| v.value))
                                .collect();
                            assert!(values.iter().all(|v| (1..=generations).contains(v)));
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(committed_values(&cache), generation_values(generations));
    }

    #[test]
    fn test_tags_cycle() {
        let source = source_with_host();
        source.add_category("cat-1", "environment");
        source.add_tag("tag-1", "prod", "cat-1");
        source.link_tag("HostSystem", "host-1", "tag-1");
        let mut collector = collector(&source, 256 * 1024);

        let report = collector.run_tags_cycle().unwrap();
        assert_eq!(report.objects, 1);
        assert_eq!(report.stored, 1);

        let cache = Arc::clone(collector.cache());
        let tags = cache.get_tags_by_uuid("uuid-host-1").unwrap().unwrap();
        assert_eq!(tags[0].category, "environment");
    }

    #[test]
    fn test_tags_unsupported_version() {
        let source = source_with_host();
        source.set_version("6.0.0");
        let mut collector = collector(&source, 256 * 1024);

        let report = collector.run_tags_cycle().unwrap();
        assert_eq!(report.error.as_deref(), Some(TAGS_UNSUPPORTED));
        assert_eq!(
            collector.cache().get_entity_tags("HostSystem", "host-1"),
            Err(TAGS_UNSUPPORTED.to_string())
        );
    }

    #[test]
    fn test_tags_update_skipped_on_shortfall() {
        let source = source_with_host();
        source.add_category("cat-1", "environment");
        source.add_tag("tag-1", &"z".repeat(8192), "cat-1");
        source.link_tag("HostSystem", "host-1", "tag-1");
        let mut collector = collector(&source, 4096);

        let report = collector.run_tags_cycle().unwrap();
        assert!(report.skipped);
        assert_eq!(collector.cache().status().skipped_tag_updates, 1);
        assert_eq!(collector.cache().get_tags_by_uuid("uuid-host-1"), Ok(None));
    }
}
