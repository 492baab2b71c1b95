//! Scripted in-memory source.
//!
//! `MockSource` answers every `VsphereSource` call from state set up by the
//! caller, counts calls, records performance requests and can be told to
//! fail any operation. It backs the unit tests and, loaded from a test data
//! file, the `test` subcommand and `--test-data` server mode.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use ahash::AHashMap as HashMap;

use crate::catalog::RemoteCounterInfo;
use crate::error::SourceError;
use crate::perf::RefreshRate;
use crate::source::testdata::TestData;
use crate::source::{
    Inventory, InventoryObject, PerfData, PerfRequest, PerfValue, RemoteTag, VsphereSource,
};

/// Error returned for objects the inventory does not know.
pub const OBJECT_GONE: &str = "The object has already been deleted or has not been completely created";

/// Operations that can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Version,
    Catalog,
    Inventory,
    RefreshRate,
    Availability,
    Query,
    TagLinks,
}

/// Number of calls per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub fetch_version: usize,
    pub fetch_counter_catalog: usize,
    pub fetch_inventory: usize,
    pub fetch_refresh_rate: usize,
    pub fetch_available_counters: usize,
    pub query_perf: usize,
    pub fetch_tag_links: usize,
    pub fetch_tag: usize,
    pub fetch_category: usize,
}

type ObjectKey = (String, String);

#[derive(Default)]
struct MockState {
    version: String,
    catalog: Vec<RemoteCounterInfo>,
    objects: Vec<InventoryObject>,
    refresh_rates: HashMap<ObjectKey, RefreshRate>,
    available: HashMap<ObjectKey, Vec<u64>>,
    values: HashMap<ObjectKey, BTreeMap<(u64, String), u64>>,
    entity_errors: HashMap<ObjectKey, String>,
    failures: HashMap<Operation, String>,
    tags: HashMap<String, RemoteTag>,
    categories: HashMap<String, String>,
    links: HashMap<ObjectKey, Vec<String>>,
    calls: CallCounts,
    requests: Vec<PerfRequest>,
}

/// Scripted `VsphereSource`.
#[derive(Default)]
pub struct MockSource {
    state: Mutex<MockState>,
}

fn key(kind: &str, id: &str) -> ObjectKey {
    (kind.to_string(), id.to_string())
}

impl MockSource {
    pub fn new() -> Self {
        let source = Self::default();
        source.lock().version = "7.0.3".to_string();
        source
    }

    /// Builds a source replaying a test data file.
    pub fn from_test_data(data: &TestData) -> Self {
        let source = Self::new();
        {
            let mut state = source.lock();
            state.version = data.vmware_version.clone();
            state.catalog = data.counters.clone();
            for category in &data.categories {
                state.categories.insert(category.id.clone(), category.name.clone());
            }
            for tag in &data.tags {
                state.tags.insert(tag.id.clone(), tag.clone());
            }
            for entry in &data.objects {
                let k = key(&entry.object.kind, &entry.object.id);
                state.objects.push(entry.object.clone());
                state.refresh_rates.insert(k.clone(), entry.refresh);
                let mut available: Vec<u64> = entry.values.iter().map(|v| v.counter_id).collect();
                available.sort_unstable();
                available.dedup();
                state.available.insert(k.clone(), available);
                let values = state.values.entry(k.clone()).or_default();
                for value in &entry.values {
                    values.insert((value.counter_id, value.instance.clone()), value.value);
                }
                if !entry.tags.is_empty() {
                    state.links.insert(k, entry.tags.clone());
                }
            }
        }
        source
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_version(&self, version: &str) {
        self.lock().version = version.to_string();
    }

    pub fn set_catalog(&self, catalog: Vec<RemoteCounterInfo>) {
        self.lock().catalog = catalog;
    }

    /// Adds one counter to the remote catalog.
    pub fn add_counter_info(&self, id: u64, group: &str, key: &str, rollup: &str, unit: &str) {
        self.lock().catalog.push(RemoteCounterInfo {
            group: group.to_string(),
            key: key.to_string(),
            rollup: rollup.to_string(),
            stats: None,
            id,
            unit: unit.to_string(),
        });
    }

    /// Adds an object with a 20 second real-time refresh rate.
    pub fn add_object(&self, kind: &str, id: &str, uuid: &str) {
        let mut state = self.lock();
        state.objects.push(InventoryObject {
            kind: kind.to_string(),
            id: id.to_string(),
            uuid: uuid.to_string(),
            name: id.to_string(),
            parent: None,
        });
        state.refresh_rates.insert(key(kind, id), RefreshRate::Interval(20));
    }

    pub fn remove_object(&self, kind: &str, id: &str) {
        self.lock().objects.retain(|o| !(o.kind == kind && o.id == id));
    }

    pub fn set_refresh_rate(&self, kind: &str, id: &str, rate: RefreshRate) {
        self.lock().refresh_rates.insert(key(kind, id), rate);
    }

    pub fn set_available(&self, kind: &str, id: &str, counters: &[u64]) {
        let mut sorted = counters.to_vec();
        sorted.sort_unstable();
        self.lock().available.insert(key(kind, id), sorted);
    }

    pub fn set_value(&self, kind: &str, id: &str, counter_id: u64, instance: &str, value: u64) {
        self.lock()
            .values
            .entry(key(kind, id))
            .or_default()
            .insert((counter_id, instance.to_string()), value);
    }

    pub fn clear_values(&self, kind: &str, id: &str) {
        self.lock().values.remove(&key(kind, id));
    }

    /// Makes queries report `error` for one entity.
    pub fn set_entity_error(&self, kind: &str, id: &str, error: &str) {
        self.lock().entity_errors.insert(key(kind, id), error.to_string());
    }

    /// Makes every call of `operation` fail until `recover` is called.
    pub fn fail(&self, operation: Operation, error: &str) {
        self.lock().failures.insert(operation, error.to_string());
    }

    pub fn recover(&self, operation: Operation) {
        self.lock().failures.remove(&operation);
    }

    pub fn add_category(&self, id: &str, name: &str) {
        self.lock().categories.insert(id.to_string(), name.to_string());
    }

    pub fn add_tag(&self, id: &str, name: &str, category_id: &str) {
        self.lock().tags.insert(
            id.to_string(),
            RemoteTag {
                id: id.to_string(),
                name: name.to_string(),
                description: format!("{} tag", name),
                category_id: category_id.to_string(),
            },
        );
    }

    pub fn link_tag(&self, kind: &str, id: &str, tag_id: &str) {
        self.lock()
            .links
            .entry(key(kind, id))
            .or_default()
            .push(tag_id.to_string());
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    /// Performance requests received so far.
    pub fn requests(&self) -> Vec<PerfRequest> {
        self.lock().requests.clone()
    }

    fn check(state: &MockState, operation: Operation) -> Result<(), SourceError> {
        match state.failures.get(&operation) {
            Some(error) => Err(SourceError::Remote(error.clone())),
            None => Ok(()),
        }
    }

    fn knows(state: &MockState, kind: &str, id: &str) -> bool {
        state.objects.iter().any(|o| o.kind == kind && o.id == id)
    }
}

impl VsphereSource for MockSource {
    fn fetch_version(&self) -> Result<String, SourceError> {
        let mut state = self.lock();
        state.calls.fetch_version += 1;
        Self::check(&state, Operation::Version)?;
        Ok(state.version.clone())
    }

    fn fetch_counter_catalog(&self) -> Result<Vec<RemoteCounterInfo>, SourceError> {
        let mut state = self.lock();
        state.calls.fetch_counter_catalog += 1;
        Self::check(&state, Operation::Catalog)?;
        Ok(state.catalog.clone())
    }

    fn fetch_inventory(&self) -> Result<Inventory, SourceError> {
        let mut state = self.lock();
        state.calls.fetch_inventory += 1;
        Self::check(&state, Operation::Inventory)?;
        Ok(Inventory {
            objects: state.objects.clone(),
        })
    }

    fn fetch_refresh_rate(&self, kind: &str, id: &str) -> Result<RefreshRate, SourceError> {
        let mut state = self.lock();
        state.calls.fetch_refresh_rate += 1;
        Self::check(&state, Operation::RefreshRate)?;
        state
            .refresh_rates
            .get(&key(kind, id))
            .copied()
            .ok_or_else(|| SourceError::Remote(OBJECT_GONE.to_string()))
    }

    fn fetch_available_counters(
        &self,
        kind: &str,
        id: &str,
        _refresh: RefreshRate,
    ) -> Result<Vec<u64>, SourceError> {
        let mut state = self.lock();
        state.calls.fetch_available_counters += 1;
        Self::check(&state, Operation::Availability)?;
        if !Self::knows(&state, kind, id) && !state.available.contains_key(&key(kind, id)) {
            return Err(SourceError::Remote(OBJECT_GONE.to_string()));
        }
        Ok(state.available.get(&key(kind, id)).cloned().unwrap_or_default())
    }

    fn query_perf(&self, request: &PerfRequest) -> Result<Vec<PerfData>, SourceError> {
        let mut state = self.lock();
        state.calls.query_perf += 1;
        state.requests.push(request.clone());
        Self::check(&state, Operation::Query)?;

        let mut answers = Vec::with_capacity(request.specs.len());
        for spec in &request.specs {
            let k = key(&spec.kind, &spec.id);
            if let Some(error) = state.entity_errors.get(&k) {
                answers.push(PerfData::failed(&spec.kind, &spec.id, error));
                continue;
            }
            if !Self::knows(&state, &spec.kind, &spec.id) && !state.values.contains_key(&k) {
                answers.push(PerfData::failed(&spec.kind, &spec.id, OBJECT_GONE));
                continue;
            }

            let mut values = Vec::new();
            if let Some(stored) = state.values.get(&k) {
                for metric in &spec.metrics {
                    for ((counter_id, instance), value) in
                        stored.range((metric.counter_id, String::new())..)
                    {
                        if *counter_id != metric.counter_id {
                            break;
                        }
                        if metric.instance == "*" || *instance == metric.instance {
                            values.push(PerfValue {
                                counter_id: *counter_id,
                                instance: instance.clone(),
                                value: *value,
                            });
                        }
                    }
                }
            }

            answers.push(PerfData {
                kind: spec.kind.clone(),
                id: spec.id.clone(),
                values,
                error: None,
            });
        }

        Ok(answers)
    }

    fn fetch_tag_links(&self, kind: &str, id: &str) -> Result<Vec<String>, SourceError> {
        let mut state = self.lock();
        state.calls.fetch_tag_links += 1;
        Self::check(&state, Operation::TagLinks)?;
        Ok(state.links.get(&key(kind, id)).cloned().unwrap_or_default())
    }

    fn fetch_tag(&self, tag_id: &str) -> Result<RemoteTag, SourceError> {
        let mut state = self.lock();
        state.calls.fetch_tag += 1;
        state
            .tags
            .get(tag_id)
            .cloned()
            .ok_or_else(|| SourceError::Remote(format!("tag {} not found", tag_id)))
    }

    fn fetch_category(&self, category_id: &str) -> Result<String, SourceError> {
        let mut state = self.lock();
        state.calls.fetch_category += 1;
        state
            .categories
            .get(category_id)
            .cloned()
            .ok_or_else(|| SourceError::Remote(format!("category {} not found", category_id)))
    }
}
