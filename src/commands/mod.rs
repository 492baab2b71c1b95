//! CLI command implementations for herakles-vmware-exporter.
//!
//! This module provides implementations for all CLI subcommands:
//! - `check`: Configuration and data source validation
//! - `config`: Configuration file generation
//! - `test`: Collector cycles against the test data file
//! - `generate`: Test data generation

pub mod check;
pub mod config;
pub mod generate;
pub mod test;

// Re-export command functions
pub use check::command_check;
pub use config::command_config;
pub use generate::command_generate_testdata;
pub use test::command_test;
