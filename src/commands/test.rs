//! Test command implementation.
//!
//! Runs collector cycles against the configured test data file and prints
//! what every cycle did.

use chrono::Utc;
use herakles_vmware_exporter::config::Config;
use serde::Serialize;

use crate::cli::ConfigFormat;
use crate::runtime::build_collector;

fn render<T: Serialize>(value: &T, format: ConfigFormat) -> Result<String, Box<dyn std::error::Error>> {
    Ok(match format {
        ConfigFormat::Yaml => serde_yaml::to_string(value)?,
        ConfigFormat::Json => serde_json::to_string_pretty(value)?,
        // Through a Value so plain fields are emitted before nested tables
        ConfigFormat::Toml => toml::Value::try_from(value)?.to_string(),
    })
}

/// Runs `iterations` performance cycles, each followed by a tag cycle when
/// tags are enabled.
pub fn command_test(
    iterations: usize,
    verbose: bool,
    format: ConfigFormat,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("🧪 Herakles VMware Exporter - Test Mode");
    println!("=======================================");

    let mut collector = build_collector(config)?;
    let tags = config.enable_tags.unwrap_or(true);

    for iteration in 1..=iterations {
        println!("\n🔄 Iteration {}/{}:", iteration, iterations);

        let report = collector.run_cycle(Utc::now().timestamp())?;
        println!(
            "   ⏱️  Cycle duration: {:.2}ms",
            report.duration_seconds * 1000.0
        );
        for line in render(&report, format)?.lines() {
            println!("   {}", line);
        }

        if tags {
            let tags_report = collector.run_tags_cycle()?;
            println!(
                "   🏷️  Tags: {} objects, {} stored{}",
                tags_report.objects,
                tags_report.stored,
                if tags_report.skipped { ", skipped" } else { "" }
            );
            if let Some(error) = &tags_report.error {
                println!("   ❌ Tags error: {}", error);
            }
        }
    }

    let cache = collector.cache();
    println!("\n📊 {}", cache.memory_report().render());
    if verbose {
        println!("{}", cache.dump());
    }

    println!("\n✅ Test completed successfully");
    Ok(())
}
