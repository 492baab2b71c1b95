//! Generate testdata command implementation.
//!
//! Generates a synthetic vCenter inventory JSON file for the collector to
//! replay.

use herakles_vmware_exporter::source::testdata::{
    generate_test_data, save_test_data, GenerateOptions,
};
use std::path::PathBuf;
use tracing::debug;

/// Generates synthetic test data JSON file for testing purposes.
pub fn command_generate_testdata(
    output: PathBuf,
    hosts: usize,
    vms_per_host: usize,
    datastores: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    debug!(
        "Generating test data: hosts={}, vms_per_host={}, datastores={}, output={}",
        hosts,
        vms_per_host,
        datastores,
        output.display()
    );

    let options = GenerateOptions {
        hosts,
        vms_per_host,
        datastores,
    };
    let mut rng = rand::thread_rng();
    let test_data = generate_test_data(&mut rng, &options);

    save_test_data(&output, &test_data)?;

    println!(
        "✅ Generated test data: {} objects, {} counters, {} tags in {}",
        test_data.objects.len(),
        test_data.counters.len(),
        test_data.tags.len(),
        output.display()
    );

    Ok(())
}
