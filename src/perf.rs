//! Performance entities, their counters and counter values.
//!
//! An entity is one monitored managed object keyed by (type, id). It owns a
//! list of counters kept sorted by counter id, and each counter owns the
//! values delivered by the last successful commit. Entity and counter records
//! reserve their footprint in the arena; counter values are stored in the
//! arena as `[instance string: u32][pad: u32][value: u64]` records.
//!
//! Existence (entities and counters) is changed by discovery, custom counter
//! requests and expiry. Values and errors are replaced in place, all at once,
//! by [`PerfStore::commit`].

use std::fmt::{self, Write as _};

use ahash::AHashMap as HashMap;
use bitflags::bitflags;
use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize, Serializer};
use tracing::debug;

use crate::arena::{Block, Footprint};
use crate::catalog::{CounterCatalog, QUERY_ALL_INSTANCES};
use crate::error::{CacheError, Result};
use crate::source::{MetricSpec, PerfData, PerfValue};
use crate::strpool::{try_or_release, CacheMem, Release, StrId, StrRef};

bitflags! {
    /// Lifecycle flags of a performance counter.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CounterState: u32 {
        const NEW = 0x00;
        /// Values were delivered at least once.
        const READY = 0x01;
        /// Requested in the running cycle.
        const UPDATING = 0x02;
        /// Requested by a reader rather than by discovery.
        const CUSTOM = 0x100;
        const ACCEPTABLE = 0x200;
        const NOT_SUPPORTED = 0x400;
    }
}

impl CounterState {
    /// Flags that survive a commit.
    pub const STATE_MASK: CounterState = CounterState::CUSTOM
        .union(CounterState::ACCEPTABLE)
        .union(CounterState::NOT_SUPPORTED);

    pub fn names(&self) -> Vec<&'static str> {
        if self.is_empty() {
            return vec!["NEW"];
        }
        self.iter_names().map(|(name, _)| name).collect()
    }

    /// Custom counter whose availability was never checked.
    pub fn needs_availability_check(&self) -> bool {
        self.contains(CounterState::CUSTOM)
            && !self.intersects(CounterState::ACCEPTABLE | CounterState::NOT_SUPPORTED)
    }

    /// Counters that may be sent in a query: discovery counters always,
    /// custom counters once they were found acceptable.
    pub fn is_queryable(&self) -> bool {
        !self.contains(CounterState::CUSTOM) || self.contains(CounterState::ACCEPTABLE)
    }
}

impl Serialize for CounterState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let names = self.names();
        let mut seq = serializer.serialize_seq(Some(names.len()))?;
        for name in names {
            seq.serialize_element(name)?;
        }
        seq.end()
    }
}

/// Real-time statistics refresh rate of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshRate {
    /// Not asked yet; the entity is not queried until it is known.
    Unknown,
    /// No real-time statistics, only historical aggregates.
    Historical,
    /// Real-time statistics every N seconds.
    Interval(u32),
}

impl fmt::Display for RefreshRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshRate::Unknown => f.write_str("unknown"),
            RefreshRate::Historical => f.write_str("historical"),
            RefreshRate::Interval(secs) => write!(f, "{}s", secs),
        }
    }
}

/// How long unused custom counters are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    /// Custom counters flagged `NOT_SUPPORTED`.
    pub not_supported_secs: i64,
    /// Any other custom counter.
    pub unused_secs: i64,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            not_supported_secs: 2 * 3600,
            unused_secs: 24 * 3600,
        }
    }
}

/// Result of a reader asking for a custom counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterRequest {
    /// The counter will be queried from the next cycle on.
    Added,
    AlreadyMonitored,
    /// Not enough cache memory right now; the reader should ask again later.
    Postponed,
}

/// Private copy of an entity identity, usable outside the cache lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: String,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: &str, id: &str) -> Self {
        Self {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} \"{}\"", self.kind, self.id)
    }
}

/// Entity found by discovery, built in private memory before admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredEntity {
    pub kind: String,
    pub id: String,
    pub query_scope: String,
    /// Sorted, without duplicates.
    pub counters: Vec<u64>,
}

/// Entity whose custom counters need an availability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityTarget {
    pub entity: EntityRef,
    pub refresh: RefreshRate,
    pub counters: Vec<u64>,
}

/// Entity to be queried in the running cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryEntity {
    pub entity: EntityRef,
    pub refresh: RefreshRate,
    pub metrics: Vec<MetricSpec>,
}

/// Entities to query, split by batching rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryPlan {
    /// Entities with a real-time refresh rate, batched without a counter limit.
    pub realtime: Vec<QueryEntity>,
    /// Historical-only entities, batched with the configured counter limit.
    pub historical: Vec<QueryEntity>,
    pub skipped_unknown: usize,
    pub skipped_unsupported: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub created: usize,
    pub refreshed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExpireReport {
    pub entities_removed: usize,
    pub counters_removed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    pub values: usize,
    pub errors: usize,
    pub required: usize,
}

/// Owned copy of one counter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CounterView {
    pub counter_id: u64,
    pub state: CounterState,
    pub last_used: i64,
    pub query_instance: Option<String>,
    pub values: Vec<InstanceValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceValue {
    pub instance: String,
    pub value: u64,
}

/// Owned copy of one entity, handed to readers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityView {
    pub kind: String,
    pub id: String,
    pub query_instance: String,
    pub refresh: RefreshRate,
    pub last_seen: i64,
    pub error: Option<String>,
    pub counters: Vec<CounterView>,
}

impl EntityView {
    pub fn counter(&self, counter_id: u64) -> Option<&CounterView> {
        self.counters.iter().find(|c| c.counter_id == counter_id)
    }
}

/// Entity identity inside the cache: the pooled type and id strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityKey {
    kind: StrId,
    id: StrId,
}

const ENTITY_RECORD_SIZE: usize = std::mem::size_of::<PerfEntity>();
const COUNTER_RECORD_SIZE: usize = std::mem::size_of::<PerfCounter>();
const VALUE_RECORD_SIZE: usize = 16;

const NO_DATA: &str = "Performance counter data was not found.";
const NOT_SUPPORTED: &str = "Performance counter not supported or data not ready.";
const NOT_AVAILABLE: &str = "Performance counter data is not available.";
const NO_INSTANCE: &str = "Performance counter instance was not found.";

struct PerfCounter {
    record: Block,
    counter_id: u64,
    state: CounterState,
    last_used: i64,
    query_instance: Option<StrRef>,
    values: Option<Block>,
}

impl PerfCounter {
    fn create(
        mem: &mut CacheMem,
        counter_id: u64,
        state: CounterState,
        query_instance: Option<&str>,
    ) -> Result<Self> {
        let record = mem.allocate(COUNTER_RECORD_SIZE)?;
        let query_instance = try_or_release!(mem.intern_opt(query_instance), mem, record);

        Ok(Self {
            record,
            counter_id,
            state,
            last_used: 0,
            query_instance,
            values: None,
        })
    }

    fn value_count(&self) -> usize {
        self.values
            .as_ref()
            .map(|block| block.len() / VALUE_RECORD_SIZE)
            .unwrap_or(0)
    }

    fn value_at(&self, mem: &CacheMem, index: usize) -> Option<(StrId, u64)> {
        let block = self.values.as_ref()?;
        let (slot, value) = read_value_record(mem, block, index);
        Some((StrId::from_raw(slot), value))
    }

    fn set_query_instance(&mut self, mem: &mut CacheMem, instance: &str) -> Result<()> {
        let fresh = mem.intern(instance)?;
        self.query_instance.replace(fresh).release(mem);
        Ok(())
    }

    fn clear_values(&mut self, mem: &mut CacheMem) {
        if let Some(block) = self.values.take() {
            release_value_block(mem, block);
        }
    }

    /// Unused custom counters are dropped after the retention period;
    /// counters no reader ever used are kept.
    fn is_expired(&self, now: i64, retention: &Retention) -> bool {
        if !self.state.contains(CounterState::CUSTOM) || self.last_used == 0 {
            return false;
        }
        let keep_for = if self.state.contains(CounterState::NOT_SUPPORTED) {
            retention.not_supported_secs
        } else {
            retention.unused_secs
        };
        now - keep_for >= self.last_used
    }

    fn view(&self, mem: &CacheMem) -> CounterView {
        let values = (0..self.value_count())
            .filter_map(|index| self.value_at(mem, index))
            .map(|(instance, value)| InstanceValue {
                instance: mem.resolve(instance).to_string(),
                value,
            })
            .collect();

        CounterView {
            counter_id: self.counter_id,
            state: self.state,
            last_used: self.last_used,
            query_instance: self.query_instance.as_ref().map(|s| mem.get_owned(s)),
            values,
        }
    }
}

impl Release for PerfCounter {
    fn release(mut self, mem: &mut CacheMem) {
        self.clear_values(mem);
        self.query_instance.release(mem);
        self.record.release(mem);
    }
}

fn write_value_record(mem: &mut CacheMem, block: &Block, index: usize, slot: u32, value: u64) {
    let start = index * VALUE_RECORD_SIZE;
    let bytes = &mut mem.bytes_mut(block)[start..start + VALUE_RECORD_SIZE];
    bytes[..4].copy_from_slice(&slot.to_le_bytes());
    bytes[4..8].fill(0);
    bytes[8..].copy_from_slice(&value.to_le_bytes());
}

fn read_value_record(mem: &CacheMem, block: &Block, index: usize) -> (u32, u64) {
    let start = index * VALUE_RECORD_SIZE;
    let bytes = &mem.bytes(block)[start..start + VALUE_RECORD_SIZE];
    let mut slot = [0u8; 4];
    slot.copy_from_slice(&bytes[..4]);
    let mut value = [0u8; 8];
    value.copy_from_slice(&bytes[8..]);
    (u32::from_le_bytes(slot), u64::from_le_bytes(value))
}

fn release_value_records(mem: &mut CacheMem, block: &Block, count: usize) {
    for index in 0..count {
        let (slot, _) = read_value_record(mem, block, index);
        StrRef::from_slot(slot).release(mem);
    }
}

fn release_value_block(mem: &mut CacheMem, block: Block) {
    release_value_records(mem, &block, block.len() / VALUE_RECORD_SIZE);
    block.release(mem);
}

/// Copies `values` into a fresh value block.
fn write_values(mem: &mut CacheMem, values: &[&PerfValue]) -> Result<Block> {
    let block = mem.allocate(values.len() * VALUE_RECORD_SIZE)?;
    for (index, value) in values.iter().enumerate() {
        let instance = match mem.intern(&value.instance) {
            Ok(instance) => instance,
            Err(e) => {
                release_value_records(mem, &block, index);
                block.release(mem);
                return Err(e);
            }
        };
        write_value_record(mem, &block, index, instance.into_slot(), value.value);
    }
    Ok(block)
}

struct PerfEntity {
    record: Block,
    kind: StrRef,
    id: StrRef,
    query_instance: StrRef,
    refresh: RefreshRate,
    last_seen: i64,
    error: Option<StrRef>,
    counters: Vec<PerfCounter>,
}

impl PerfEntity {
    fn create(mem: &mut CacheMem, kind: &str, id: &str, scope: &str, last_seen: i64) -> Result<Self> {
        let record = mem.allocate(ENTITY_RECORD_SIZE)?;
        let kind = try_or_release!(mem.intern(kind), mem, record);
        let id = try_or_release!(mem.intern(id), mem, record, kind);
        let query_instance = try_or_release!(mem.intern(scope), mem, record, kind, id);

        Ok(Self {
            record,
            kind,
            id,
            query_instance,
            refresh: RefreshRate::Unknown,
            last_seen,
            error: None,
            counters: Vec::new(),
        })
    }

    fn key(&self) -> EntityKey {
        EntityKey {
            kind: self.kind.id(),
            id: self.id.id(),
        }
    }

    fn entity_ref(&self, mem: &CacheMem) -> EntityRef {
        EntityRef {
            kind: mem.get_owned(&self.kind),
            id: mem.get_owned(&self.id),
        }
    }

    fn queries_all_instances(&self, mem: &CacheMem) -> bool {
        mem.get(&self.query_instance) == QUERY_ALL_INSTANCES
    }

    fn counter_index(&self, counter_id: u64) -> std::result::Result<usize, usize> {
        self.counters
            .binary_search_by_key(&counter_id, |counter| counter.counter_id)
    }

    /// Sorted insert; returns false when the counter is already present.
    fn add_counter(
        &mut self,
        mem: &mut CacheMem,
        counter_id: u64,
        state: CounterState,
        query_instance: Option<&str>,
    ) -> Result<bool> {
        match self.counter_index(counter_id) {
            Ok(_) => Ok(false),
            Err(pos) => {
                let counter = PerfCounter::create(mem, counter_id, state, query_instance)?;
                self.counters.insert(pos, counter);
                Ok(true)
            }
        }
    }

    fn set_error(&mut self, mem: &mut CacheMem, error: &str) -> Result<()> {
        let fresh = mem.intern(error)?;
        self.error.replace(fresh).release(mem);
        Ok(())
    }

    fn view(&self, mem: &CacheMem) -> EntityView {
        EntityView {
            kind: mem.get_owned(&self.kind),
            id: mem.get_owned(&self.id),
            query_instance: mem.get_owned(&self.query_instance),
            refresh: self.refresh,
            last_seen: self.last_seen,
            error: self.error.as_ref().map(|e| mem.get_owned(e)),
            counters: self.counters.iter().map(|c| c.view(mem)).collect(),
        }
    }
}

impl Release for PerfEntity {
    fn release(self, mem: &mut CacheMem) {
        self.counters.release(mem);
        self.error.release(mem);
        self.query_instance.release(mem);
        self.id.release(mem);
        self.kind.release(mem);
        self.record.release(mem);
    }
}

/// Values and errors of one cycle, resolved against the current entities.
///
/// A plan borrows the collected data and is only valid while the cache lock
/// it was built under is held.
pub struct CommitPlan<'d> {
    values: Vec<((EntityKey, u64), Vec<&'d PerfValue>)>,
    errors: Vec<(EntityKey, &'d str)>,
    footprint: Footprint,
    unmatched: usize,
}

impl CommitPlan<'_> {
    /// Exact arena bytes the commit will allocate.
    pub fn required(&self) -> usize {
        self.footprint.total()
    }

    /// Chunks the commit allocates, in allocation order.
    pub fn footprint(&self) -> &Footprint {
        &self.footprint
    }

    /// Data entries naming an entity the cache no longer holds.
    pub fn unmatched(&self) -> usize {
        self.unmatched
    }
}

/// All performance entities of one service.
#[derive(Default)]
pub struct PerfStore {
    entities: HashMap<EntityKey, PerfEntity>,
    committed: bool,
}

impl PerfStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn counter_count(&self) -> usize {
        self.entities.values().map(|e| e.counters.len()).sum()
    }

    pub fn value_count(&self) -> usize {
        self.entities
            .values()
            .flat_map(|e| e.counters.iter())
            .map(PerfCounter::value_count)
            .sum()
    }

    /// Whether values were committed at least once.
    pub fn is_ready(&self) -> bool {
        self.committed
    }

    fn lookup_key(mem: &CacheMem, kind: &str, id: &str) -> Option<EntityKey> {
        Some(EntityKey {
            kind: mem.find(kind)?,
            id: mem.find(id)?,
        })
    }

    fn entity(&self, mem: &CacheMem, kind: &str, id: &str) -> Option<&PerfEntity> {
        self.entities.get(&Self::lookup_key(mem, kind, id)?)
    }

    fn entity_mut(&mut self, mem: &CacheMem, kind: &str, id: &str) -> Option<&mut PerfEntity> {
        self.entities.get_mut(&Self::lookup_key(mem, kind, id)?)
    }

    pub fn contains(&self, mem: &CacheMem, kind: &str, id: &str) -> bool {
        self.entity(mem, kind, id).is_some()
    }

    /// Owned copy of an entity.
    pub fn get_entity(&self, mem: &CacheMem, kind: &str, id: &str) -> Option<EntityView> {
        self.entity(mem, kind, id).map(|e| e.view(mem))
    }

    /// Owned copies of all entities, sorted by type and id.
    pub fn entities(&self, mem: &CacheMem) -> Vec<EntityView> {
        let mut views: Vec<EntityView> = self.entities.values().map(|e| e.view(mem)).collect();
        views.sort_by(|a, b| (&a.kind, &a.id).cmp(&(&b.kind, &b.id)));
        views
    }

    /// Creates the entity on first sight, otherwise only refreshes `last_seen`.
    /// Returns whether the entity was created.
    pub fn upsert_entity(
        &mut self,
        mem: &mut CacheMem,
        kind: &str,
        id: &str,
        query_scope: &str,
        now: i64,
    ) -> Result<bool> {
        if let Some(entity) = self.entity_mut(mem, kind, id) {
            entity.last_seen = now;
            return Ok(false);
        }

        let entity = PerfEntity::create(mem, kind, id, query_scope, now)?;
        self.entities.insert(entity.key(), entity);
        Ok(true)
    }

    /// Adds a counter to an entity; returns false when it is already there.
    pub fn add_counter(
        &mut self,
        mem: &mut CacheMem,
        kind: &str,
        id: &str,
        counter_id: u64,
        state: CounterState,
    ) -> Result<bool> {
        let Some(entity) = self.entity_mut(mem, kind, id) else {
            return Err(CacheError::UnknownEntity {
                kind: kind.to_string(),
                id: id.to_string(),
            });
        };
        entity.add_counter(mem, counter_id, state, None)
    }

    /// Arena chunks admitting `discovered` would take.
    pub fn discovery_footprint(&self, mem: &CacheMem, discovered: &[DiscoveredEntity]) -> Footprint {
        let mut est = mem.estimate();

        for entity in discovered {
            if self.contains(mem, &entity.kind, &entity.id) {
                continue;
            }
            est.add_block(ENTITY_RECORD_SIZE)
                .add_str(&entity.kind)
                .add_str(&entity.id)
                .add_str(&entity.query_scope);
            for _ in &entity.counters {
                est.add_block(COUNTER_RECORD_SIZE);
            }
        }

        est.finish()
    }

    /// Upserts every discovered entity. New entities get their default
    /// counters in state `NEW`.
    pub fn apply_discovery(
        &mut self,
        mem: &mut CacheMem,
        discovered: &[DiscoveredEntity],
        now: i64,
    ) -> Result<DiscoveryReport> {
        let mut report = DiscoveryReport::default();

        for found in discovered {
            if let Some(entity) = self.entity_mut(mem, &found.kind, &found.id) {
                entity.last_seen = now;
                report.refreshed += 1;
                continue;
            }

            let mut entity = PerfEntity::create(mem, &found.kind, &found.id, &found.query_scope, now)?;
            for &counter_id in &found.counters {
                if let Err(e) = entity.add_counter(mem, counter_id, CounterState::NEW, None) {
                    entity.release(mem);
                    return Err(e);
                }
            }
            self.entities.insert(entity.key(), entity);
            report.created += 1;
        }

        Ok(report)
    }

    /// Removes entities the discovery pass at `discovered_at` did not see
    /// and custom counters nobody read within the retention period. Entities
    /// left without counters are removed too.
    pub fn expire_pass(
        &mut self,
        mem: &mut CacheMem,
        now: i64,
        discovered_at: i64,
        retention: &Retention,
    ) -> ExpireReport {
        let mut report = ExpireReport::default();
        let mut doomed = Vec::new();

        for (key, entity) in self.entities.iter_mut() {
            if entity.last_seen != 0 && entity.last_seen < discovered_at {
                doomed.push(*key);
                continue;
            }

            let mut index = entity.counters.len();
            while index > 0 {
                index -= 1;
                if entity.counters[index].is_expired(now, retention) {
                    entity.counters.remove(index).release(mem);
                    report.counters_removed += 1;
                }
            }

            if entity.counters.is_empty() {
                doomed.push(*key);
            }
        }

        for key in doomed {
            if let Some(entity) = self.entities.remove(&key) {
                debug!(
                    "Removing performance entity {} \"{}\"",
                    mem.get(&entity.kind),
                    mem.get(&entity.id)
                );
                entity.release(mem);
                report.entities_removed += 1;
            }
        }

        report
    }

    /// Entities whose refresh rate was never fetched.
    pub fn unknown_refresh(&self, mem: &CacheMem) -> Vec<EntityRef> {
        let mut found: Vec<EntityRef> = self
            .entities
            .values()
            .filter(|e| e.refresh == RefreshRate::Unknown)
            .map(|e| e.entity_ref(mem))
            .collect();
        found.sort();
        found
    }

    pub fn set_refresh(&mut self, mem: &CacheMem, kind: &str, id: &str, rate: RefreshRate) -> bool {
        match self.entity_mut(mem, kind, id) {
            Some(entity) => {
                entity.refresh = rate;
                true
            }
            None => false,
        }
    }

    /// Entities having custom counters whose availability is not known yet.
    pub fn availability_targets(&self, mem: &CacheMem) -> Vec<AvailabilityTarget> {
        let mut targets: Vec<AvailabilityTarget> = self
            .entities
            .values()
            .filter_map(|entity| {
                let counters: Vec<u64> = entity
                    .counters
                    .iter()
                    .filter(|c| c.state.needs_availability_check())
                    .map(|c| c.counter_id)
                    .collect();
                (!counters.is_empty()).then(|| AvailabilityTarget {
                    entity: entity.entity_ref(mem),
                    refresh: entity.refresh,
                    counters,
                })
            })
            .collect();
        targets.sort_by(|a, b| a.entity.cmp(&b.entity));
        targets
    }

    /// Flags unchecked custom counters as `ACCEPTABLE` when `available`
    /// (sorted) lists them and `NOT_SUPPORTED` otherwise.
    pub fn apply_availability(
        &mut self,
        mem: &CacheMem,
        entity: &EntityRef,
        available: &[u64],
    ) -> (usize, usize) {
        let Some(entity) = self.entity_mut(mem, &entity.kind, &entity.id) else {
            return (0, 0);
        };

        let (mut acceptable, mut unsupported) = (0, 0);
        for counter in entity.counters.iter_mut().filter(|c| c.state.needs_availability_check()) {
            if available.binary_search(&counter.counter_id).is_ok() {
                counter.state |= CounterState::ACCEPTABLE;
                acceptable += 1;
            } else {
                counter.state |= CounterState::NOT_SUPPORTED;
                unsupported += 1;
            }
        }
        (acceptable, unsupported)
    }

    /// Selects what the running cycle queries and marks the selected
    /// counters `UPDATING`.
    pub fn plan_queries(&mut self, mem: &CacheMem) -> QueryPlan {
        let mut plan = QueryPlan::default();

        for entity in self.entities.values_mut() {
            if entity.refresh == RefreshRate::Unknown {
                plan.skipped_unknown += 1;
                continue;
            }
            if !entity.counters.iter().any(|c| c.state.is_queryable()) {
                plan.skipped_unsupported += 1;
                continue;
            }

            let default_instance = mem.get(&entity.query_instance);
            let mut metrics = Vec::new();
            for counter in entity.counters.iter_mut().filter(|c| c.state.is_queryable()) {
                let instance = counter
                    .query_instance
                    .as_ref()
                    .map(|s| mem.get(s))
                    .unwrap_or(default_instance);
                metrics.push(MetricSpec {
                    counter_id: counter.counter_id,
                    instance: instance.to_string(),
                });
                counter.state |= CounterState::UPDATING;
            }

            let query = QueryEntity {
                entity: EntityRef {
                    kind: mem.get_owned(&entity.kind),
                    id: mem.get_owned(&entity.id),
                },
                refresh: entity.refresh,
                metrics,
            };
            match entity.refresh {
                RefreshRate::Historical => plan.historical.push(query),
                _ => plan.realtime.push(query),
            }
        }

        plan.realtime.sort_by(|a, b| a.entity.cmp(&b.entity));
        plan.historical.sort_by(|a, b| a.entity.cmp(&b.entity));
        plan
    }

    /// Resolves collected data against the current entities and sizes it.
    pub fn plan_commit<'d>(&self, mem: &CacheMem, data: &'d [PerfData]) -> CommitPlan<'d> {
        let mut grouped: HashMap<(EntityKey, u64), Vec<&'d PerfValue>> = HashMap::new();
        let mut order = Vec::new();
        let mut errors = Vec::new();
        let mut unmatched = 0;

        for item in data {
            let Some(key) = Self::lookup_key(mem, &item.kind, &item.id) else {
                unmatched += 1;
                continue;
            };
            let Some(entity) = self.entities.get(&key) else {
                unmatched += 1;
                continue;
            };

            if let Some(error) = &item.error {
                errors.push((key, error.as_str()));
                continue;
            }

            for value in &item.values {
                if entity.counter_index(value.counter_id).is_err() {
                    continue;
                }
                let slot = grouped.entry((key, value.counter_id)).or_insert_with(|| {
                    order.push((key, value.counter_id));
                    Vec::new()
                });
                slot.push(value);
            }
        }

        let values: Vec<_> = order
            .into_iter()
            .filter_map(|k| grouped.remove(&k).map(|v| (k, v)))
            .collect();

        let mut est = mem.estimate();
        for (_, counter_values) in &values {
            est.add_block(counter_values.len() * VALUE_RECORD_SIZE);
            for value in counter_values {
                est.add_str(&value.instance);
            }
        }
        for (_, error) in &errors {
            est.add_str(error);
        }
        let footprint = est.finish();

        CommitPlan {
            values,
            errors,
            footprint,
            unmatched,
        }
    }

    /// Drops all values and errors and turns `UPDATING` counters `READY`.
    pub fn clear_stats(&mut self, mem: &mut CacheMem) {
        for entity in self.entities.values_mut() {
            for counter in entity.counters.iter_mut() {
                counter.clear_values(mem);
                if counter.state.contains(CounterState::UPDATING) {
                    counter.state =
                        CounterState::READY | (counter.state & CounterState::STATE_MASK);
                }
            }
            entity.error.take().release(mem);
        }
    }

    /// Replaces all values and errors with the planned ones.
    ///
    /// The new values and errors are written next to the current ones and
    /// swapped in afterwards, so a failed commit leaves the previous values
    /// and errors untouched. Callers check `plan.footprint()` with
    /// [`CacheMem::check_fit`] first.
    pub fn commit(&mut self, mem: &mut CacheMem, plan: CommitPlan<'_>) -> Result<CommitReport> {
        let mut report = CommitReport {
            required: plan.required(),
            ..CommitReport::default()
        };

        let mut values = Vec::with_capacity(plan.values.len());
        let mut errors = Vec::with_capacity(plan.errors.len());
        if let Err(e) = self.stage_commit(mem, &plan, &mut values, &mut errors) {
            for (_, _, block) in values {
                release_value_block(mem, block);
            }
            for (_, error) in errors {
                error.release(mem);
            }
            return Err(e);
        }

        self.clear_stats(mem);

        for (key, index, block) in values {
            match self.entities.get_mut(&key) {
                Some(entity) => {
                    report.values += block.len() / VALUE_RECORD_SIZE;
                    entity.counters[index].values = Some(block);
                }
                None => release_value_block(mem, block),
            }
        }
        for (key, error) in errors {
            match self.entities.get_mut(&key) {
                Some(entity) => {
                    entity.error.replace(error).release(mem);
                    report.errors += 1;
                }
                None => error.release(mem),
            }
        }

        self.committed = true;
        Ok(report)
    }

    /// Writes the planned values and errors without touching the current
    /// ones. Whatever was written before a failure is left in the out lists.
    fn stage_commit(
        &self,
        mem: &mut CacheMem,
        plan: &CommitPlan<'_>,
        values: &mut Vec<(EntityKey, usize, Block)>,
        errors: &mut Vec<(EntityKey, StrRef)>,
    ) -> Result<()> {
        for ((key, counter_id), counter_values) in &plan.values {
            let Some(index) = self
                .entities
                .get(key)
                .and_then(|entity| entity.counter_index(*counter_id).ok())
            else {
                continue;
            };
            values.push((*key, index, write_values(mem, counter_values)?));
        }

        for (key, error) in &plan.errors {
            if self.entities.contains_key(key) {
                errors.push((*key, mem.intern(error)?));
            }
        }
        Ok(())
    }

    /// Attaches `error` to every entity, used when a whole cycle failed.
    pub fn set_error_all(&mut self, mem: &mut CacheMem, error: &str) -> Result<usize> {
        if self.entities.is_empty() {
            return Ok(0);
        }

        let mut est = mem.estimate();
        est.add_str(error);
        mem.check_fit(&est.finish())?;

        for entity in self.entities.values_mut() {
            entity.set_error(mem, error)?;
        }
        Ok(self.entities.len())
    }

    /// Requests monitoring of a counter a reader needs but discovery does
    /// not provide. Unknown entities are created with `last_seen` 0 so
    /// discovery never expires them.
    pub fn add_custom_counter(
        &mut self,
        mem: &mut CacheMem,
        kind: &str,
        id: &str,
        counter_id: u64,
        instance: &str,
    ) -> Result<CounterRequest> {
        let existing = self
            .entity(mem, kind, id)
            .map(|e| (e.counter_index(counter_id).is_ok(), e.queries_all_instances(mem)));

        let mut est = mem.estimate();
        match existing {
            None => {
                est.add_block(ENTITY_RECORD_SIZE)
                    .add_str(kind)
                    .add_str(id)
                    .add_str(instance)
                    .add_block(COUNTER_RECORD_SIZE);
            }
            Some((has_counter, all_instances)) => {
                if !has_counter {
                    est.add_block(COUNTER_RECORD_SIZE);
                }
                if !all_instances {
                    est.add_str(instance);
                }
            }
        }
        if mem.check_fit(&est.finish()).is_err() {
            debug!(
                "Adding of performance counter has been postponed. type:{} id:{} counterid:{} instance:{}",
                kind, id, counter_id, instance
            );
            return Ok(CounterRequest::Postponed);
        }

        if existing.is_none() {
            let mut entity = PerfEntity::create(mem, kind, id, instance, 0)?;
            entity.refresh = RefreshRate::Unknown;
            self.entities.insert(entity.key(), entity);
        }

        let Some(entity) = self.entity_mut(mem, kind, id) else {
            return Err(CacheError::UnknownEntity {
                kind: kind.to_string(),
                id: id.to_string(),
            });
        };
        let all_instances = entity.queries_all_instances(mem);

        let request = match entity.counter_index(counter_id) {
            Ok(index) => {
                if !all_instances {
                    entity.counters[index].set_query_instance(mem, instance)?;
                }
                CounterRequest::AlreadyMonitored
            }
            Err(_) => {
                let query_instance = (!all_instances).then_some(instance);
                entity.add_counter(
                    mem,
                    counter_id,
                    CounterState::NEW | CounterState::CUSTOM,
                    query_instance,
                )?;
                CounterRequest::Added
            }
        };

        Ok(request)
    }

    /// Refreshes `last_used` of a ready custom counter.
    pub fn touch_counter(&mut self, mem: &CacheMem, kind: &str, id: &str, counter_id: u64, now: i64) -> bool {
        let Some(entity) = self.entity_mut(mem, kind, id) else {
            return false;
        };
        let Ok(index) = entity.counter_index(counter_id) else {
            return false;
        };
        let counter = &mut entity.counters[index];
        if counter.state.contains(CounterState::CUSTOM | CounterState::READY) {
            counter.last_used = now;
            return true;
        }
        false
    }

    /// Reads one counter value for one instance.
    ///
    /// `Ok(None)` means there is nothing to report yet (entity not queried,
    /// counter not ready, or the endpoint marked the value not ready). Reading
    /// a ready custom counter refreshes its `last_used`.
    pub fn read_value(
        &mut self,
        mem: &CacheMem,
        kind: &str,
        id: &str,
        counter_id: u64,
        instance: &str,
        now: i64,
    ) -> std::result::Result<Option<u64>, String> {
        let Some(entity) = self.entity_mut(mem, kind, id) else {
            debug!("performance data is not yet ready, ignoring request");
            return Ok(None);
        };

        if let Some(error) = &entity.error {
            return Err(mem.get_owned(error));
        }

        let Ok(index) = entity.counter_index(counter_id) else {
            return Err(NO_DATA.to_string());
        };
        let counter = &mut entity.counters[index];

        if counter.state.contains(CounterState::NOT_SUPPORTED) {
            return Err(NOT_SUPPORTED.to_string());
        }
        if counter.state.contains(CounterState::CUSTOM | CounterState::READY) {
            counter.last_used = now;
        }
        if !counter.state.contains(CounterState::READY) {
            return Ok(None);
        }
        if counter.value_count() == 0 {
            return Err(NOT_AVAILABLE.to_string());
        }

        let found = (0..counter.value_count())
            .filter_map(|index| counter.value_at(mem, index))
            .find(|(name, _)| mem.resolve(*name) == instance);

        match found {
            Some((_, u64::MAX)) => Ok(None),
            Some((_, value)) => Ok(Some(value)),
            None => Err(NO_INSTANCE.to_string()),
        }
    }

    /// Human-readable listing of every entity and counter.
    pub fn dump(&self, mem: &CacheMem, catalog: &CounterCatalog) -> String {
        let mut out = String::new();

        for entity in self.entities(mem) {
            writeln!(
                out,
                "{} \"{}\" refresh={} last_seen={} scope=\"{}\"",
                entity.kind, entity.id, entity.refresh, entity.last_seen, entity.query_instance
            )
            .ok();
            if let Some(error) = &entity.error {
                writeln!(out, "  error: {}", error).ok();
            }
            for counter in &entity.counters {
                let path = catalog
                    .path_of(mem, counter.counter_id)
                    .unwrap_or_else(|| "?".to_string());
                writeln!(
                    out,
                    "  {:>6} {:<45} [{}]",
                    counter.counter_id,
                    path,
                    counter.state.names().join("|")
                )
                .ok();
                for value in &counter.values {
                    let shown = if value.value == u64::MAX {
                        "not ready".to_string()
                    } else {
                        value.value.to_string()
                    };
                    writeln!(out, "         {:<20} {}", format!("\"{}\"", value.instance), shown).ok();
                }
            }
        }

        out
    }

    /// Returns every entity to the arena.
    pub fn clear(&mut self, mem: &mut CacheMem) {
        let count = self.entities.len();
        for (_, entity) in self.entities.drain() {
            entity.release(mem);
        }
        debug!("Dropped {} performance entities", count);
        self.committed = false;
    }
}
