//! Performance counter catalog: counter path → (id, unit).
//!
//! The remote endpoint describes each counter as group, key, rollup type and
//! optional statistics type. Each one is registered under `group/key[rollup]`
//! and, when the statistics type is known, also under
//! `group/key[rollup,stats]`. Catalog records live in the arena and are never
//! modified once inserted.

use std::fmt;

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::arena::{Block, Footprint};
use crate::error::Result;
use crate::strpool::{CacheMem, Release, StrId, StrRef};

/// Query scope asking the remote endpoint for every instance of a counter.
pub const QUERY_ALL_INSTANCES: &str = "*";
/// Query scope asking only for the aggregated value.
pub const QUERY_TOTAL: &str = "";

const KIBIBYTE: u64 = 1024;
const MEBIBYTE: u64 = 1024 * KIBIBYTE;
const GIBIBYTE: u64 = 1024 * MEBIBYTE;
const TEBIBYTE: u64 = 1024 * GIBIBYTE;

/// Unit of a performance counter as reported by the remote `unitInfo` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CounterUnit {
    Joule,
    KiloBytes,
    MegaBytes,
    GigaBytes,
    TeraBytes,
    KiloBytesPerSecond,
    MegaBytesPerSecond,
    MegaHertz,
    Nanosecond,
    Microsecond,
    Millisecond,
    Second,
    Number,
    Percent,
    Watt,
    Celsius,
    Undefined,
}

const UNITS: [CounterUnit; 17] = [
    CounterUnit::Joule,
    CounterUnit::KiloBytes,
    CounterUnit::MegaBytes,
    CounterUnit::GigaBytes,
    CounterUnit::TeraBytes,
    CounterUnit::KiloBytesPerSecond,
    CounterUnit::MegaBytesPerSecond,
    CounterUnit::MegaHertz,
    CounterUnit::Nanosecond,
    CounterUnit::Microsecond,
    CounterUnit::Millisecond,
    CounterUnit::Second,
    CounterUnit::Number,
    CounterUnit::Percent,
    CounterUnit::Watt,
    CounterUnit::Celsius,
    CounterUnit::Undefined,
];

impl CounterUnit {
    /// Parses a remote `unitInfo` key; anything unrecognised is `Undefined`.
    pub fn from_key(key: &str) -> Self {
        UNITS
            .iter()
            .copied()
            .find(|unit| unit.as_key() == key)
            .unwrap_or(CounterUnit::Undefined)
    }

    pub fn as_key(&self) -> &'static str {
        match self {
            CounterUnit::Joule => "joule",
            CounterUnit::KiloBytes => "kiloBytes",
            CounterUnit::MegaBytes => "megaBytes",
            CounterUnit::GigaBytes => "gigaBytes",
            CounterUnit::TeraBytes => "teraBytes",
            CounterUnit::KiloBytesPerSecond => "kiloBytesPerSecond",
            CounterUnit::MegaBytesPerSecond => "megaBytesPerSecond",
            CounterUnit::MegaHertz => "megaHertz",
            CounterUnit::Nanosecond => "nanosecond",
            CounterUnit::Microsecond => "microsecond",
            CounterUnit::Millisecond => "millisecond",
            CounterUnit::Second => "second",
            CounterUnit::Number => "number",
            CounterUnit::Percent => "percent",
            CounterUnit::Watt => "watt",
            CounterUnit::Celsius => "celsius",
            CounterUnit::Undefined => "undefined",
        }
    }

    fn code(&self) -> u8 {
        UNITS.iter().position(|unit| unit == self).unwrap_or(UNITS.len() - 1) as u8
    }

    fn from_code(code: u8) -> Self {
        UNITS
            .get(code as usize)
            .copied()
            .unwrap_or(CounterUnit::Undefined)
    }

    /// Converts a raw remote value into the unit readers expect: bytes,
    /// bytes per second, Hz, or a fraction for percentages.
    ///
    /// Returns `Ok(None)` for `u64::MAX`, which marks data that is not ready
    /// yet, and an error for counters whose unit is unknown.
    pub fn scale(&self, value: u64) -> std::result::Result<Option<ScaledValue>, String> {
        if value == u64::MAX {
            return Ok(None);
        }

        let scaled = match self {
            CounterUnit::KiloBytes | CounterUnit::KiloBytesPerSecond => {
                ScaledValue::Unsigned(value.saturating_mul(KIBIBYTE))
            }
            CounterUnit::MegaBytes | CounterUnit::MegaBytesPerSecond => {
                ScaledValue::Unsigned(value.saturating_mul(MEBIBYTE))
            }
            CounterUnit::GigaBytes => ScaledValue::Unsigned(value.saturating_mul(GIBIBYTE)),
            CounterUnit::TeraBytes => ScaledValue::Unsigned(value.saturating_mul(TEBIBYTE)),
            CounterUnit::Percent => ScaledValue::Float(value as f64 / 100.0),
            CounterUnit::MegaHertz => ScaledValue::Unsigned(value.saturating_mul(1_000_000)),
            CounterUnit::Joule
            | CounterUnit::Nanosecond
            | CounterUnit::Microsecond
            | CounterUnit::Millisecond
            | CounterUnit::Number
            | CounterUnit::Second
            | CounterUnit::Watt
            | CounterUnit::Celsius => ScaledValue::Unsigned(value),
            CounterUnit::Undefined => {
                return Err("Performance counter type of unitInfo is unknown.".to_string())
            }
        };

        Ok(Some(scaled))
    }
}

impl fmt::Display for CounterUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_key())
    }
}

/// A counter value converted for readers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ScaledValue {
    Unsigned(u64),
    Float(f64),
}

impl ScaledValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            ScaledValue::Unsigned(v) => v as f64,
            ScaledValue::Float(v) => v,
        }
    }
}

impl fmt::Display for ScaledValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaledValue::Unsigned(v) => write!(f, "{}", v),
            ScaledValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// Counter description as delivered by the remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCounterInfo {
    pub group: String,
    pub key: String,
    pub rollup: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<String>,
    pub id: u64,
    pub unit: String,
}

/// One catalog entry in private (not yet registered) form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub path: String,
    pub id: u64,
    pub unit: CounterUnit,
}

/// Expands remote counter descriptions into catalog entries.
pub fn catalog_entries(counters: &[RemoteCounterInfo]) -> Vec<CatalogEntry> {
    let mut entries = Vec::with_capacity(counters.len() * 2);

    for counter in counters {
        let unit = CounterUnit::from_key(&counter.unit);
        if unit == CounterUnit::Undefined {
            warn!(
                "Unknown performance counter {} type of unitInfo:{}",
                counter.id, counter.unit
            );
        }

        entries.push(CatalogEntry {
            path: format!("{}/{}[{}]", counter.group, counter.key, counter.rollup),
            id: counter.id,
            unit,
        });

        if let Some(stats) = &counter.stats {
            entries.push(CatalogEntry {
                path: format!(
                    "{}/{}[{},{}]",
                    counter.group, counter.key, counter.rollup, stats
                ),
                id: counter.id,
                unit,
            });
        }
    }

    debug!(
        "Expanded {} remote counters into {} catalog paths",
        counters.len(),
        entries.len()
    );
    entries
}

/// Arena record layout: `[id: u64][unit: u8]`.
const RECORD_SIZE: usize = 9;

struct CatalogSlot {
    record: Block,
    path: StrRef,
}

impl Release for CatalogSlot {
    fn release(self, mem: &mut CacheMem) {
        self.path.release(mem);
        self.record.release(mem);
    }
}

/// Arena-resident counter catalog.
#[derive(Default)]
pub struct CounterCatalog {
    by_path: HashMap<StrId, CatalogSlot>,
    by_id: HashMap<u64, StrId>,
}

impl CounterCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    pub fn contains(&self, mem: &CacheMem, path: &str) -> bool {
        mem.find(path)
            .map(|id| self.by_path.contains_key(&id))
            .unwrap_or(false)
    }

    /// Arena bytes registering `entries` would take.
    pub fn required_size(&self, mem: &CacheMem, entries: &[CatalogEntry]) -> usize {
        self.footprint(mem, entries).total()
    }

    fn footprint(&self, mem: &CacheMem, entries: &[CatalogEntry]) -> Footprint {
        let mut est = mem.estimate();
        let mut seen = HashSet::new();

        for entry in entries {
            if self.contains(mem, &entry.path) || !seen.insert(entry.path.as_str()) {
                continue;
            }
            est.add_str(&entry.path).add_block(RECORD_SIZE);
        }

        est.finish()
    }

    /// Inserts every entry whose path is not registered yet and returns how
    /// many were added. Existing entries are never touched.
    ///
    /// Nothing is inserted when the arena cannot hold all missing entries.
    pub fn register(&mut self, mem: &mut CacheMem, entries: &[CatalogEntry]) -> Result<usize> {
        let footprint = self.footprint(mem, entries);
        mem.check_fit(&footprint)?;

        let mut inserted = 0;
        for entry in entries {
            if self.contains(mem, &entry.path) {
                continue;
            }
            self.insert(mem, entry)?;
            inserted += 1;
        }

        Ok(inserted)
    }

    fn insert(&mut self, mem: &mut CacheMem, entry: &CatalogEntry) -> Result<()> {
        let path = mem.intern(&entry.path)?;
        let record = match mem.allocate(RECORD_SIZE) {
            Ok(record) => record,
            Err(e) => {
                path.release(mem);
                return Err(e);
            }
        };

        let bytes = mem.bytes_mut(&record);
        bytes[..8].copy_from_slice(&entry.id.to_le_bytes());
        bytes[8] = entry.unit.code();

        let key = path.id();
        self.by_id.entry(entry.id).or_insert(key);
        self.by_path.insert(key, CatalogSlot { record, path });
        Ok(())
    }

    /// Counter id and unit registered for `path`.
    pub fn lookup(&self, mem: &CacheMem, path: &str) -> Option<(u64, CounterUnit)> {
        let slot = self.by_path.get(&mem.find(path)?)?;
        Some(read_record(mem, &slot.record))
    }

    /// Unit of a counter id.
    pub fn unit_of(&self, mem: &CacheMem, counter_id: u64) -> Option<CounterUnit> {
        let slot = self.by_path.get(self.by_id.get(&counter_id)?)?;
        Some(read_record(mem, &slot.record).1)
    }

    /// First registered path of a counter id, for diagnostics.
    pub fn path_of(&self, mem: &CacheMem, counter_id: u64) -> Option<String> {
        let slot = self.by_path.get(self.by_id.get(&counter_id)?)?;
        Some(mem.get_owned(&slot.path))
    }

    /// Returns every catalog record to the arena.
    pub fn clear(&mut self, mem: &mut CacheMem) {
        self.by_id.clear();
        for (_, slot) in self.by_path.drain() {
            slot.release(mem);
        }
    }
}

fn read_record(mem: &CacheMem, record: &Block) -> (u64, CounterUnit) {
    let bytes = mem.bytes(record);
    let mut id = [0u8; 8];
    id.copy_from_slice(&bytes[..8]);
    (u64::from_le_bytes(id), CounterUnit::from_code(bytes[8]))
}

/// Counters monitored by default for one entity type.
#[derive(Debug)]
pub struct DiscoveryProfile {
    pub query_scope: &'static str,
    pub counters: &'static [&'static str],
}

const HOST_COUNTERS: &[&str] = &[
    "net/packetsRx[summation]",
    "net/packetsTx[summation]",
    "net/received[average]",
    "net/transmitted[average]",
    "datastore/totalReadLatency[average]",
    "datastore/totalWriteLatency[average]",
    "datastore/numberReadAveraged[average]",
    "datastore/numberWriteAveraged[average]",
    "cpu/usage[average]",
    "cpu/utilization[average]",
    "power/power[average]",
    "power/powerCap[average]",
    "net/droppedRx[summation]",
    "net/droppedTx[summation]",
    "net/errorsRx[summation]",
    "net/errorsTx[summation]",
    "net/broadcastRx[summation]",
    "net/broadcastTx[summation]",
];

const VM_COUNTERS: &[&str] = &[
    "virtualDisk/read[average]",
    "virtualDisk/write[average]",
    "virtualDisk/numberReadAveraged[average]",
    "virtualDisk/numberWriteAveraged[average]",
    "net/packetsRx[summation]",
    "net/packetsTx[summation]",
    "net/received[average]",
    "net/transmitted[average]",
    "cpu/ready[summation]",
    "net/usage[average]",
    "cpu/usage[average]",
    "cpu/latency[average]",
    "cpu/readiness[average]",
    "cpu/swapwait[summation]",
    "sys/osUptime[latest]",
    "mem/consumed[average]",
    "mem/usage[average]",
    "mem/swapped[average]",
    "virtualDisk/readOIO[latest]",
    "virtualDisk/writeOIO[latest]",
    "virtualDisk/totalWriteLatency[average]",
    "virtualDisk/totalReadLatency[average]",
];

const DATASTORE_COUNTERS: &[&str] = &[
    "disk/used[latest]",
    "disk/provisioned[latest]",
    "disk/capacity[latest]",
];

static DISCOVERY_PROFILES: Lazy<HashMap<&'static str, DiscoveryProfile>> = Lazy::new(|| {
    let mut profiles = HashMap::new();
    profiles.insert(
        "HostSystem",
        DiscoveryProfile {
            query_scope: QUERY_ALL_INSTANCES,
            counters: HOST_COUNTERS,
        },
    );
    profiles.insert(
        "VirtualMachine",
        DiscoveryProfile {
            query_scope: QUERY_ALL_INSTANCES,
            counters: VM_COUNTERS,
        },
    );
    profiles.insert(
        "Datastore",
        DiscoveryProfile {
            query_scope: QUERY_TOTAL,
            counters: DATASTORE_COUNTERS,
        },
    );
    profiles
});

/// Default counters for an entity type, `None` for types without performance data.
pub fn discovery_profile(kind: &str) -> Option<&'static DiscoveryProfile> {
    DISCOVERY_PROFILES.get(kind)
}
