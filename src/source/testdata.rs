//! Test data files: a recorded or synthetic vCenter replayed by `MockSource`.

use std::fs;
use std::path::Path;

use chrono::Utc;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::{discovery_profile, RemoteCounterInfo};
use crate::perf::RefreshRate;
use crate::source::{InventoryObject, PerfValue, RemoteTag};

pub const TEST_DATA_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCategory {
    pub id: String,
    pub name: String,
}

/// One object with everything the endpoint would report about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestObject {
    #[serde(flatten)]
    pub object: InventoryObject,
    pub refresh: RefreshRate,
    #[serde(default)]
    pub values: Vec<PerfValue>,
    /// Ids of the tags attached to the object.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Root structure of a test data JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestData {
    pub version: String,
    pub generated_at: String,
    pub vmware_version: String,
    pub counters: Vec<RemoteCounterInfo>,
    #[serde(default)]
    pub categories: Vec<TestCategory>,
    #[serde(default)]
    pub tags: Vec<RemoteTag>,
    pub objects: Vec<TestObject>,
}

/// Shape of a generated inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerateOptions {
    pub hosts: usize,
    pub vms_per_host: usize,
    pub datastores: usize,
}

/// Load test data from JSON file.
pub fn load_test_data_from_file(path: &Path) -> Result<TestData, String> {
    debug!("Loading test data from: {}", path.display());

    if !path.exists() {
        return Err(format!("Test data file not found: {}", path.display()));
    }

    let content =
        fs::read_to_string(path).map_err(|e| format!("Failed to read test data file: {}", e))?;
    let test_data: TestData = serde_json::from_str(&content)
        .map_err(|e| format!("Failed to parse test data JSON: {}", e))?;

    info!(
        "Loaded test data version {} from {}: {} objects, {} counters",
        test_data.version,
        test_data.generated_at,
        test_data.objects.len(),
        test_data.counters.len()
    );

    Ok(test_data)
}

pub fn save_test_data(path: &Path, data: &TestData) -> Result<(), Box<dyn std::error::Error>> {
    let json_content = serde_json::to_string_pretty(data)?;
    fs::write(path, json_content)?;
    Ok(())
}

fn unit_for(path: &str) -> &'static str {
    let key = path.split('[').next().unwrap_or(path);
    match key {
        "cpu/usage" | "cpu/utilization" | "mem/usage" | "cpu/readiness" => "percent",
        "mem/consumed" | "mem/swapped" | "disk/used" | "disk/provisioned" | "disk/capacity" => {
            "kiloBytes"
        }
        "net/received" | "net/transmitted" | "net/usage" | "virtualDisk/read"
        | "virtualDisk/write" => "kiloBytesPerSecond",
        "power/power" | "power/powerCap" => "watt",
        "sys/osUptime" => "second",
        k if k.ends_with("Latency") || k == "cpu/ready" || k == "cpu/latency" || k == "cpu/swapwait" => {
            "millisecond"
        }
        _ => "number",
    }
}

/// Remote catalog covering every default discovery counter, with ids
/// assigned in order of first appearance.
fn generate_catalog() -> Vec<RemoteCounterInfo> {
    let mut counters: Vec<RemoteCounterInfo> = Vec::new();

    for kind in ["HostSystem", "VirtualMachine", "Datastore"] {
        let Some(profile) = discovery_profile(kind) else {
            continue;
        };
        for path in profile.counters {
            let (group_key, rollup) = match path.split_once('[') {
                Some((gk, rest)) => (gk, rest.trim_end_matches(']')),
                None => continue,
            };
            let Some((group, key)) = group_key.split_once('/') else {
                continue;
            };
            if counters.iter().any(|c| c.group == group && c.key == key && c.rollup == rollup) {
                continue;
            }
            counters.push(RemoteCounterInfo {
                group: group.to_string(),
                key: key.to_string(),
                rollup: rollup.to_string(),
                stats: Some("rate".to_string()),
                id: counters.len() as u64 + 1,
                unit: unit_for(path).to_string(),
            });
        }
    }

    counters
}

fn instances_for(group: &str) -> &'static [&'static str] {
    match group {
        "cpu" => &["", "0", "1"],
        "net" => &["", "vmnic0"],
        "virtualDisk" => &["scsi0:0"],
        "datastore" => &["", "datastore-1"],
        _ => &[""],
    }
}

fn random_value(rng: &mut impl Rng, unit: &str) -> u64 {
    match unit {
        // hundredths of a percent
        "percent" => rng.gen_range(0..10_000),
        "kiloBytes" => rng.gen_range(1024..64 * 1024 * 1024),
        "kiloBytesPerSecond" => rng.gen_range(0..200_000),
        "watt" => rng.gen_range(80..600),
        "second" => rng.gen_range(60..10_000_000),
        "millisecond" => rng.gen_range(0..500),
        _ => rng.gen_range(0..100_000),
    }
}

fn generate_values(
    rng: &mut impl Rng,
    kind: &str,
    catalog: &[RemoteCounterInfo],
) -> Vec<PerfValue> {
    let Some(profile) = discovery_profile(kind) else {
        return Vec::new();
    };

    let mut values = Vec::new();
    for path in profile.counters {
        let Some(counter) = catalog
            .iter()
            .find(|c| *path == format!("{}/{}[{}]", c.group, c.key, c.rollup))
        else {
            continue;
        };
        let instances: &[&str] = if profile.query_scope.is_empty() {
            &[""]
        } else {
            instances_for(&counter.group)
        };
        for instance in instances {
            values.push(PerfValue {
                counter_id: counter.id,
                instance: instance.to_string(),
                value: random_value(rng, &counter.unit),
            });
        }
    }
    values
}

fn object(kind: &str, id: String, name: String, parent: Option<String>, rng: &mut impl Rng) -> InventoryObject {
    InventoryObject {
        kind: kind.to_string(),
        uuid: format!(
            "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            rng.gen::<u32>(),
            rng.gen::<u16>(),
            rng.gen::<u16>(),
            rng.gen::<u16>(),
            rng.gen::<u64>() & 0xffff_ffff_ffff
        ),
        id,
        name,
        parent,
    }
}

/// Builds a synthetic inventory: hosts with their VMs, datastores, a small
/// tag catalog and random values for every default counter.
pub fn generate_test_data(rng: &mut impl Rng, options: &GenerateOptions) -> TestData {
    let counters = generate_catalog();

    let categories = vec![
        TestCategory {
            id: "urn:vmomi:InventoryServiceCategory:env:GLOBAL".to_string(),
            name: "environment".to_string(),
        },
        TestCategory {
            id: "urn:vmomi:InventoryServiceCategory:loc:GLOBAL".to_string(),
            name: "location".to_string(),
        },
    ];
    let tag_names = [("prod", 0), ("test", 0), ("rack-a", 1), ("rack-b", 1)];
    let tags: Vec<RemoteTag> = tag_names
        .iter()
        .map(|(name, category)| RemoteTag {
            id: format!("urn:vmomi:InventoryServiceTag:{}:GLOBAL", name),
            name: name.to_string(),
            description: format!("{} systems", name),
            category_id: categories[*category].id.clone(),
        })
        .collect();
    let tag_ids: Vec<String> = tags.iter().map(|t| t.id.clone()).collect();

    let mut objects = Vec::new();
    let mut vm_number = 1;

    for h in 1..=options.hosts {
        let host_id = format!("host-{}", h);
        let host = object(
            "HostSystem",
            host_id.clone(),
            format!("esx{:02}.example.local", h),
            Some("domain-c1".to_string()),
            rng,
        );
        objects.push(TestObject {
            object: host,
            refresh: RefreshRate::Interval(20),
            values: generate_values(rng, "HostSystem", &counters),
            tags: tag_ids.choose_multiple(rng, 1).cloned().collect(),
        });

        for _ in 0..options.vms_per_host {
            let vm = object(
                "VirtualMachine",
                format!("vm-{}", vm_number),
                format!("vm{:03}", vm_number),
                Some(host_id.clone()),
                rng,
            );
            let tag_count = rng.gen_range(0..=2);
            objects.push(TestObject {
                object: vm,
                refresh: RefreshRate::Interval(20),
                values: generate_values(rng, "VirtualMachine", &counters),
                tags: tag_ids.choose_multiple(rng, tag_count).cloned().collect(),
            });
            vm_number += 1;
        }
    }

    for d in 1..=options.datastores {
        let ds = object(
            "Datastore",
            format!("datastore-{}", d),
            format!("ds{:02}", d),
            None,
            rng,
        );
        objects.push(TestObject {
            object: ds,
            refresh: RefreshRate::Historical,
            values: generate_values(rng, "Datastore", &counters),
            tags: Vec::new(),
        });
    }

    TestData {
        version: TEST_DATA_VERSION.to_string(),
        generated_at: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        vmware_version: "7.0.3".to_string(),
        counters,
        categories,
        tags,
        objects,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MockSource, VsphereSource};
    use tempfile::tempdir;

    fn options() -> GenerateOptions {
        GenerateOptions {
            hosts: 2,
            vms_per_host: 3,
            datastores: 1,
        }
    }

    #[test]
    fn test_generated_inventory_shape() {
        let data = generate_test_data(&mut rand::thread_rng(), &options());
        assert_eq!(data.objects.len(), 2 + 6 + 1);
        assert!(!data.counters.is_empty());

        let datastore = data.objects.iter().find(|o| o.object.kind == "Datastore").unwrap();
        assert_eq!(datastore.refresh, RefreshRate::Historical);
        assert!(datastore.values.iter().all(|v| v.instance.is_empty()));

        let ids: Vec<u64> = data.counters.iter().map(|c| c.id).collect();
        let mut unique = ids.clone();
        unique.dedup();
        assert_eq!(ids, unique);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("testdata.json");
        let data = generate_test_data(&mut rand::thread_rng(), &options());

        assert!(save_test_data(&path, &data).is_ok());
        let result = load_test_data_from_file(&path);
        assert!(result.is_ok());
        assert_eq!(result.unwrap(), data);
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_test_data_from_file(Path::new("/nonexistent/testdata.json"));
        assert!(result.unwrap_err().contains("not found"));
    }

    #[test]
    fn test_replay_source() {
        let data = generate_test_data(&mut rand::thread_rng(), &options());
        let source = MockSource::from_test_data(&data);

        assert_eq!(source.fetch_inventory().unwrap().objects.len(), data.objects.len());
        assert_eq!(source.fetch_counter_catalog().unwrap().len(), data.counters.len());
        assert_eq!(
            source.fetch_refresh_rate("Datastore", "datastore-1").unwrap(),
            RefreshRate::Historical
        );
    }
}
