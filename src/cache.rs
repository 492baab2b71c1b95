//! The cache context shared by the collector and all readers.
//!
//! `VmwareCache` owns one mutex around the arena, the string pool and every
//! data set living in it. Readers lock only to copy out owned views; the
//! collector locks only to admit, swap and commit what it built outside.

use std::fmt::Write as _;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tracing::debug;

use crate::catalog::{discovery_profile, CounterCatalog, CounterUnit, ScaledValue, QUERY_ALL_INSTANCES};
use crate::error::Result;
use crate::inventory::{InventoryCache, InventorySnapshot};
use crate::perf::{CounterRequest, EntityView, PerfStore};
use crate::source::InventoryObject;
use crate::strpool::{CacheMem, MemoryStats};
use crate::tags::{TagCache, TagLookup, TagsSnapshot};

const COUNTER_UNAVAILABLE: &str = "Performance counter is not available.";

/// Outcome of the latest collector cycles, kept for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleStatus {
    pub cycles: u64,
    pub last_cycle: i64,
    /// Bytes the latest values commit needed.
    pub last_required: usize,
    /// Free bytes when that commit was sized.
    pub last_free: usize,
    pub skipped_commits: u64,
    pub last_error: Option<String>,
    pub tag_cycles: u64,
    pub tags_required: usize,
    pub skipped_tag_updates: u64,
    pub inventory_required: usize,
    pub skipped_inventory_updates: u64,
}

impl CycleStatus {
    /// Records a cycle that stopped because its first data set did not fit.
    pub fn record_starved(&mut self, now: i64, required: usize, available: usize) {
        self.cycles += 1;
        self.last_cycle = now;
        self.last_required = required;
        self.last_free = available;
        self.skipped_commits += 1;
        self.last_error = None;
    }
}

/// Everything living in the arena, guarded by the cache mutex.
pub struct CacheCore {
    pub mem: CacheMem,
    pub catalog: CounterCatalog,
    pub perf: PerfStore,
    pub tags: TagCache,
    pub inventory: InventoryCache,
    pub status: CycleStatus,
}

impl CacheCore {
    fn new(capacity: usize) -> Self {
        Self {
            mem: CacheMem::new(capacity),
            catalog: CounterCatalog::new(),
            perf: PerfStore::new(),
            tags: TagCache::new(),
            inventory: InventoryCache::new(),
            status: CycleStatus::default(),
        }
    }
}

/// Memory figures plus the sizes of every data set.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryReport {
    #[serde(flatten)]
    pub memory: MemoryStats,
    pub catalog_entries: usize,
    pub entities: usize,
    pub counters: usize,
    pub values: usize,
    pub tag_entries: usize,
    pub inventory_objects: usize,
    pub status: CycleStatus,
}

impl MemoryReport {
    /// Plain-text rendering for the `/memory` endpoint and the `test` command.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let arena = &self.memory.arena;
        let row = |out: &mut String, name: &str, value: String| {
            writeln!(out, "{:<28} {:>16}", name, value).ok();
        };

        writeln!(out, "CACHE MEMORY").ok();
        writeln!(out, "============").ok();
        row(&mut out, "capacity", arena.capacity.to_string());
        row(&mut out, "used", arena.used.to_string());
        row(&mut out, "free", arena.free.to_string());
        row(&mut out, "peak used", arena.peak_used.to_string());
        row(&mut out, "allocations", arena.allocations.to_string());
        row(&mut out, "free chunks", arena.free_chunks.to_string());
        row(&mut out, "largest free chunk", arena.largest_free_chunk.to_string());
        row(&mut out, "strings", self.memory.strings.to_string());
        row(&mut out, "string bytes", self.memory.strpool_bytes.to_string());
        writeln!(out).ok();
        row(&mut out, "catalog entries", self.catalog_entries.to_string());
        row(&mut out, "entities", self.entities.to_string());
        row(&mut out, "counters", self.counters.to_string());
        row(&mut out, "values", self.values.to_string());
        row(&mut out, "tag entries", self.tag_entries.to_string());
        row(&mut out, "inventory objects", self.inventory_objects.to_string());
        writeln!(out).ok();
        row(&mut out, "cycles", self.status.cycles.to_string());
        row(&mut out, "last commit required", self.status.last_required.to_string());
        row(&mut out, "last commit free", self.status.last_free.to_string());
        row(&mut out, "skipped commits", self.status.skipped_commits.to_string());
        row(&mut out, "tag cycles", self.status.tag_cycles.to_string());
        row(&mut out, "last tags required", self.status.tags_required.to_string());
        row(&mut out, "skipped tag updates", self.status.skipped_tag_updates.to_string());
        row(&mut out, "last inventory required", self.status.inventory_required.to_string());
        row(
            &mut out,
            "skipped inventory updates",
            self.status.skipped_inventory_updates.to_string(),
        );
        if let Some(error) = &self.status.last_error {
            writeln!(out, "last error: {}", error).ok();
        }
        out
    }
}

/// One ready counter value, scaled, with the path readers know it by.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CounterSample {
    pub kind: String,
    pub id: String,
    pub path: String,
    pub instance: String,
    pub value: ScaledValue,
}

/// The cache context.
pub struct VmwareCache {
    core: Mutex<CacheCore>,
}

impl VmwareCache {
    pub fn new(capacity: usize) -> Self {
        debug!("Creating cache with {} bytes", capacity);
        Self {
            core: Mutex::new(CacheCore::new(capacity)),
        }
    }

    /// Locks the cache. A poisoned lock is taken over: every mutation either
    /// completes or leaves the previous state in place.
    pub fn lock(&self) -> MutexGuard<'_, CacheCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_entity(&self, kind: &str, id: &str) -> Option<EntityView> {
        let core = self.lock();
        core.perf.get_entity(&core.mem, kind, id)
    }

    pub fn entities(&self) -> Vec<EntityView> {
        let core = self.lock();
        core.perf.entities(&core.mem)
    }

    pub fn lookup_counter_id(&self, path: &str) -> Option<(u64, CounterUnit)> {
        let core = self.lock();
        core.catalog.lookup(&core.mem, path)
    }

    /// Requests monitoring of a counter for an entity.
    pub fn add_custom_counter(
        &self,
        kind: &str,
        id: &str,
        counter_id: u64,
        instance: &str,
    ) -> Result<CounterRequest> {
        let mut guard = self.lock();
        let core = &mut *guard;
        core.perf
            .add_custom_counter(&mut core.mem, kind, id, counter_id, instance)
    }

    /// Reads one counter value of one entity instance, scaled to the unit
    /// readers expect or multiplied by `coeff` when it is not zero.
    ///
    /// A counter the entity does not monitor yet is requested and reported
    /// as no data; the value follows once a cycle delivered it.
    pub fn get_counter_value(
        &self,
        kind: &str,
        id: &str,
        path: &str,
        instance: &str,
        coeff: u64,
        now: i64,
    ) -> std::result::Result<Option<ScaledValue>, String> {
        let mut guard = self.lock();
        let core = &mut *guard;

        let Some((counter_id, unit)) = core.catalog.lookup(&core.mem, path) else {
            return Err(COUNTER_UNAVAILABLE.to_string());
        };

        let scope = discovery_profile(kind)
            .map(|profile| profile.query_scope)
            .unwrap_or(QUERY_ALL_INSTANCES);
        match core
            .perf
            .add_custom_counter(&mut core.mem, kind, id, counter_id, scope)
        {
            Ok(CounterRequest::AlreadyMonitored) => {}
            Ok(_) => return Ok(None),
            Err(e) => return Err(e.to_string()),
        }

        let Some(raw) = core
            .perf
            .read_value(&core.mem, kind, id, counter_id, instance, now)?
        else {
            return Ok(None);
        };

        if coeff != 0 {
            return Ok(Some(ScaledValue::Unsigned(raw.saturating_mul(coeff))));
        }
        unit.scale(raw)
            .map_err(|e| format!("{} Counter id:{}", e, counter_id))
    }

    pub fn get_entity_tags(&self, kind: &str, id: &str) -> TagLookup {
        let core = self.lock();
        core.tags.get_entity_tags(&core.mem, kind, id)
    }

    pub fn get_tags_by_uuid(&self, uuid: &str) -> TagLookup {
        let core = self.lock();
        core.tags.get_tags_by_uuid(&core.mem, uuid)
    }

    pub fn tags_snapshot(&self) -> TagsSnapshot {
        let core = self.lock();
        core.tags.snapshot(&core.mem)
    }

    pub fn get_object(&self, kind: &str, id: &str) -> Option<InventoryObject> {
        let core = self.lock();
        core.inventory.get_object(&core.mem, kind, id)
    }

    pub fn get_object_by_uuid(&self, uuid: &str) -> Option<InventoryObject> {
        let core = self.lock();
        core.inventory.get_by_uuid(&core.mem, uuid)
    }

    pub fn inventory_snapshot(&self) -> InventorySnapshot {
        let core = self.lock();
        core.inventory.snapshot(&core.mem)
    }

    /// Every committed value of every entity without an error. Values not
    /// ready yet and counters of unknown unit are left out.
    pub fn samples(&self) -> Vec<CounterSample> {
        let core = self.lock();
        let mut samples = Vec::new();

        for entity in core.perf.entities(&core.mem) {
            if entity.error.is_some() {
                continue;
            }
            for counter in &entity.counters {
                let (Some(path), Some(unit)) = (
                    core.catalog.path_of(&core.mem, counter.counter_id),
                    core.catalog.unit_of(&core.mem, counter.counter_id),
                ) else {
                    continue;
                };
                for value in &counter.values {
                    if let Ok(Some(scaled)) = unit.scale(value.value) {
                        samples.push(CounterSample {
                            kind: entity.kind.clone(),
                            id: entity.id.clone(),
                            path: path.clone(),
                            instance: value.instance.clone(),
                            value: scaled,
                        });
                    }
                }
            }
        }
        samples
    }

    /// Whether values were committed at least once.
    pub fn is_ready(&self) -> bool {
        self.lock().perf.is_ready()
    }

    pub fn status(&self) -> CycleStatus {
        self.lock().status.clone()
    }

    /// Human-readable listing of every entity and counter.
    pub fn dump(&self) -> String {
        let core = self.lock();
        let mut out = core.perf.dump(&core.mem, &core.catalog);
        if let Some(error) = core.tags.error(&core.mem) {
            writeln!(out, "tags error: {}", error).ok();
        }
        out
    }

    pub fn memory_report(&self) -> MemoryReport {
        let core = self.lock();
        MemoryReport {
            memory: core.mem.stats(),
            catalog_entries: core.catalog.len(),
            entities: core.perf.len(),
            counters: core.perf.counter_count(),
            values: core.perf.value_count(),
            tag_entries: core.tags.len(),
            inventory_objects: core.inventory.len(),
            status: core.status.clone(),
        }
    }

    /// Returns every object to the arena, as when the monitored service is
    /// removed.
    pub fn clear(&self) {
        let mut guard = self.lock();
        let core = &mut *guard;
        core.tags.clear(&mut core.mem);
        core.inventory.clear(&mut core.mem);
        core.perf.clear(&mut core.mem);
        core.catalog.clear(&mut core.mem);
        core.status = CycleStatus::default();
    }
}
