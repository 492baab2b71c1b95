//! Check command implementation.
//!
//! Validates the effective configuration and the data source, optionally
//! running one collector cycle against it.

use chrono::Utc;
use herakles_vmware_exporter::config::{validate_effective_config, Config};
use herakles_vmware_exporter::source::parse_version;
use herakles_vmware_exporter::source::testdata::load_test_data_from_file;
use herakles_vmware_exporter::tags::tags_supported;

use crate::runtime::build_collector;

/// Runs the checks and exits with status 1 when one of them fails.
pub fn command_check(cycle: bool, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Herakles VMware Exporter - System Check");
    println!("==========================================");

    let mut all_ok = true;

    println!("\n⚙️  Checking configuration...");
    match validate_effective_config(config) {
        Ok(_) => println!("   ✅ Configuration is valid"),
        Err(e) => {
            println!("   ❌ Configuration invalid: {}", e);
            all_ok = false;
        }
    }
    match config.cache_size_bytes() {
        Ok(bytes) => println!("   ✅ Cache budget: {} bytes", bytes),
        Err(e) => {
            println!("   ❌ Cache budget invalid: {}", e);
            all_ok = false;
        }
    }

    println!("\n📁 Checking data source...");
    match config.test_data_file.as_deref() {
        None => {
            println!("   ❌ No test data file configured");
            all_ok = false;
        }
        Some(path) => match load_test_data_from_file(path) {
            Ok(data) => {
                println!("   ✅ Test data readable: {}", path.display());
                println!(
                    "   ✅ {} objects, {} counters, {} tags",
                    data.objects.len(),
                    data.counters.len(),
                    data.tags.len()
                );
                if parse_version(&data.vmware_version).is_none() {
                    println!("   ❌ Unparsable VMware version {:?}", data.vmware_version);
                    all_ok = false;
                } else if tags_supported(&data.vmware_version) {
                    println!("   ✅ VMware {} supports tags", data.vmware_version);
                } else {
                    println!(
                        "   ⚠️  VMware {} does not support tags",
                        data.vmware_version
                    );
                }
            }
            Err(e) => {
                println!("   ❌ {}", e);
                all_ok = false;
            }
        },
    }

    if cycle && all_ok {
        println!("\n🔄 Running one collector cycle...");
        let mut collector = build_collector(config)?;
        match collector.run_cycle(Utc::now().timestamp()) {
            Ok(report) if report.error.is_none() => {
                println!(
                    "   ✅ Cycle finished in {:.2}ms",
                    report.duration_seconds * 1000.0
                );
                let memory = collector.cache().memory_report();
                println!(
                    "   ✅ {} entities, {} counters, {} of {} bytes used",
                    memory.entities,
                    memory.counters,
                    memory.memory.arena.used,
                    memory.memory.arena.capacity
                );
                if report.skipped_commit {
                    println!("   ⚠️  Values did not fit into the cache");
                }
            }
            Ok(report) => {
                println!(
                    "   ❌ Cycle failed: {}",
                    report.error.unwrap_or_default()
                );
                all_ok = false;
            }
            Err(e) => {
                println!("   ❌ Cycle failed: {}", e);
                all_ok = false;
            }
        }
    }

    println!("\n📋 Summary:");
    if all_ok {
        println!("   ✅ All checks passed - exporter is ready");
        Ok(())
    } else {
        println!("   ❌ Some checks failed - please review warnings");
        std::process::exit(1);
    }
}
