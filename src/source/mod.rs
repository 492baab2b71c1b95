//! Abstraction over the remote virtualization endpoint.
//!
//! The collector talks to vCenter only through the `VsphereSource` trait and
//! the parsed types in this module. The wire protocol (SOAP/REST and its
//! XML/JSON parsing) lives behind the trait; this crate ships a scripted
//! in-memory source for tests and a source replaying a JSON test data file.

pub mod mock;
pub mod testdata;

use serde::{Deserialize, Serialize};

use crate::catalog::RemoteCounterInfo;
use crate::error::SourceError;
use crate::perf::RefreshRate;

pub use mock::MockSource;

/// One managed object reported by the remote inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryObject {
    /// Managed object type, e.g. `HostSystem`, `VirtualMachine`, `Datastore`.
    pub kind: String,
    /// Managed object id, e.g. `host-12`.
    pub id: String,
    pub uuid: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// Remote inventory snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub objects: Vec<InventoryObject>,
}

/// One counter requested for an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSpec {
    pub counter_id: u64,
    /// Instance filter: `*` for all instances, empty for the aggregate.
    pub instance: String,
}

/// Counters requested for one entity within a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerfQuerySpec {
    pub kind: String,
    pub id: String,
    pub metrics: Vec<MetricSpec>,
    /// Start of the sampling window, set for historical-only entities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    /// Real-time sampling interval, unset for historical-only entities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_id: Option<u32>,
    pub max_sample: u32,
}

/// One batched performance query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerfRequest {
    pub specs: Vec<PerfQuerySpec>,
}

impl PerfRequest {
    pub fn metric_count(&self) -> usize {
        self.specs.iter().map(|spec| spec.metrics.len()).sum()
    }
}

/// One counter value for one instance. `u64::MAX` marks a value the
/// endpoint reported as not ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerfValue {
    pub counter_id: u64,
    pub instance: String,
    pub value: u64,
}

/// Performance data (or an error) returned for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerfData {
    pub kind: String,
    pub id: String,
    #[serde(default)]
    pub values: Vec<PerfValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PerfData {
    /// Error record for an entity whose data could not be retrieved.
    pub fn failed(kind: &str, id: &str, error: &str) -> Self {
        Self {
            kind: kind.to_string(),
            id: id.to_string(),
            values: Vec::new(),
            error: Some(error.to_string()),
        }
    }

    /// Data carrying neither an error nor a single ready value is useless to
    /// readers and gets dropped before commit.
    pub fn is_usable(&self) -> bool {
        if self.kind.is_empty() || self.id.is_empty() {
            return false;
        }
        self.error.is_some() || self.values.iter().any(|v| v.value != u64::MAX)
    }
}

/// Tag as described by the remote tagging service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTag {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category_id: String,
}

/// Parses a raw sample. Negative or unparsable samples become `u64::MAX`.
pub fn parse_counter_value(raw: &str) -> u64 {
    raw.trim().parse::<u64>().unwrap_or(u64::MAX)
}

/// Parses a `major.minor[.patch]` version string.
pub fn parse_version(version: &str) -> Option<(u32, u32, u32)> {
    let mut parts = version.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Some((major, minor, patch))
}

/// Access to the remote virtualization management endpoint.
///
/// Every call may block on the network; the collector never calls a source
/// while holding the cache lock.
pub trait VsphereSource: Send + Sync {
    /// Returns the endpoint version, e.g. `7.0.3`.
    fn fetch_version(&self) -> Result<String, SourceError>;

    /// Returns every performance counter the endpoint knows.
    fn fetch_counter_catalog(&self) -> Result<Vec<RemoteCounterInfo>, SourceError>;

    /// Returns the current inventory.
    fn fetch_inventory(&self) -> Result<Inventory, SourceError>;

    /// Returns the real-time refresh rate of an entity.
    ///
    /// # Returns
    /// `RefreshRate::Interval(secs)` when the entity supports real-time
    /// statistics, `RefreshRate::Historical` when it only has aggregates.
    fn fetch_refresh_rate(&self, kind: &str, id: &str) -> Result<RefreshRate, SourceError>;

    /// Returns the counter ids the endpoint can deliver for an entity.
    fn fetch_available_counters(
        &self,
        kind: &str,
        id: &str,
        refresh: RefreshRate,
    ) -> Result<Vec<u64>, SourceError>;

    /// Executes one batched performance query.
    ///
    /// # Returns
    /// One `PerfData` per entity the endpoint answered for. Per-entity
    /// failures are reported inside `PerfData::error`; an `Err` means the
    /// whole request failed.
    fn query_perf(&self, request: &PerfRequest) -> Result<Vec<PerfData>, SourceError>;

    /// Returns the tag ids attached to an object.
    fn fetch_tag_links(&self, kind: &str, id: &str) -> Result<Vec<String>, SourceError>;

    /// Resolves a tag id.
    fn fetch_tag(&self, tag_id: &str) -> Result<RemoteTag, SourceError>;

    /// Resolves a category id to its name.
    fn fetch_category(&self, category_id: &str) -> Result<String, SourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_counter_value() {
        assert_eq!(parse_counter_value("42"), 42);
        assert_eq!(parse_counter_value(" 7 "), 7);
        assert_eq!(parse_counter_value("-1"), u64::MAX);
        assert_eq!(parse_counter_value("n/a"), u64::MAX);
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("6.5"), Some((6, 5, 0)));
        assert_eq!(parse_version("7.0.3"), Some((7, 0, 3)));
        assert_eq!(parse_version("seven"), None);
    }

    #[test]
    fn test_perf_data_usability() {
        let mut data = PerfData {
            kind: "HostSystem".into(),
            id: "host-1".into(),
            values: vec![PerfValue {
                counter_id: 2,
                instance: String::new(),
                value: u64::MAX,
            }],
            error: None,
        };
        assert!(!data.is_usable());

        data.values.push(PerfValue {
            counter_id: 2,
            instance: "0".into(),
            value: 10,
        });
        assert!(data.is_usable());

        assert!(PerfData::failed("HostSystem", "host-1", "timeout").is_usable());
        assert!(!PerfData::failed("", "host-1", "timeout").is_usable());
    }

    #[test]
    fn test_request_metric_count() {
        let request = PerfRequest {
            specs: vec![PerfQuerySpec {
                kind: "HostSystem".into(),
                id: "host-1".into(),
                metrics: vec![
                    MetricSpec {
                        counter_id: 1,
                        instance: "*".into(),
                    },
                    MetricSpec {
                        counter_id: 2,
                        instance: "*".into(),
                    },
                ],
                start_time: None,
                interval_id: Some(20),
                max_sample: 2,
            }],
        };
        assert_eq!(request.metric_count(), 2);
    }
}
