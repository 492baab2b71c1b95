//! CLI arguments and subcommands for herakles-vmware-exporter.
//!
//! This module defines the command-line interface structure using the clap library,
//! including all flags, options, and subcommands.

use clap::{Parser, Subcommand, ValueEnum};
use std::net::IpAddr;
use std::path::PathBuf;

/// Log level options for CLI parsing
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn from_config(level: &str) -> Option<Self> {
        <Self as ValueEnum>::from_str(level, true).ok()
    }
}

/// Configuration format options for output
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

/// Main CLI arguments structure
#[derive(Parser, Debug)]
#[command(
    name = "herakles-vmware-exporter",
    about = "Prometheus exporter for VMware performance counters and tags",
    long_about = "Prometheus exporter for VMware performance counters and tags.\n\n\
                  Polls a vCenter for inventory, performance counters and tags, keeps \
                  them in a fixed-budget in-process cache and serves them to Prometheus \
                  and to per-entity HTTP readers.",
    author = "Michael Moll <proc-mem@herakles.io> - Herakles IO",
    version = "0.1.0",
    propagate_version = true,
    after_help = "Project: https://github.com/herakles-io/herakles-vmware-exporter - More info: https://www.herakles.io"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// HTTP listen port
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Bind to specific interface/IP
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Log level (overrides log_level from the config file)
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Config file (YAML/JSON/TOML)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Disable all config file loading
    #[arg(long)]
    pub no_config: bool,

    /// Print effective merged config and exit
    #[arg(long)]
    pub show_config: bool,

    /// Output format for --show-config
    #[arg(long, value_enum, default_value = "yaml")]
    pub config_format: ConfigFormat,

    /// Validate config and exit (return code 1 on error)
    #[arg(long)]
    pub check_config: bool,

    /// Cache memory budget, bytes or with a K/M/G suffix (e.g. 64M)
    #[arg(long)]
    pub cache_size: Option<String>,

    /// Seconds between performance cycles
    #[arg(long)]
    pub refresh_interval: Option<u64>,

    /// Seconds between tag cycles
    #[arg(long)]
    pub tags_refresh_interval: Option<u64>,

    /// Counter limit of a real-time performance request
    #[arg(long)]
    pub max_counters_per_request: Option<usize>,

    /// Cycles the first commit may be starved before exiting
    #[arg(long)]
    pub first_commit_retries: Option<u32>,

    /// Disable /health endpoint
    #[arg(long)]
    pub disable_health: bool,

    /// Disable internal exporter_* metrics
    #[arg(long)]
    pub disable_telemetry: bool,

    /// Disable the tag cycle
    #[arg(long)]
    pub disable_tags: bool,

    /// Parallel processing threads (0 = auto)
    #[arg(long)]
    pub parallelism: Option<usize>,

    /// Path to JSON test data file replayed instead of a live vCenter
    #[arg(short = 't', long)]
    pub test_data_file: Option<PathBuf>,
}

/// Subcommands for additional functionality
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate configuration and the data source
    Check {
        /// Also run one collector cycle against the data source
        #[arg(long)]
        cycle: bool,
    },

    /// Generate configuration files
    Config {
        /// Output file path ("-" for stdout)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// Output format
        #[arg(long, value_enum, default_value = "yaml")]
        format: ConfigFormat,

        /// Include comments and examples
        #[arg(long)]
        commented: bool,
    },

    /// Run collector cycles against the test data file
    Test {
        /// Number of test iterations
        #[arg(short = 'n', long, default_value_t = 1)]
        iterations: usize,

        /// Print the full cache dump after the last cycle
        #[arg(long)]
        verbose: bool,

        /// Output format of the cycle reports
        #[arg(long, value_enum, default_value = "yaml")]
        format: ConfigFormat,
    },

    /// Generate synthetic test data JSON file
    GenerateTestdata {
        /// Output file path
        #[arg(short = 'o', long, default_value = "testdata.json")]
        output: PathBuf,

        /// Number of hosts
        #[arg(long, default_value_t = 4)]
        hosts: usize,

        /// Virtual machines per host
        #[arg(long, default_value_t = 8)]
        vms_per_host: usize,

        /// Number of datastores
        #[arg(long, default_value_t = 3)]
        datastores: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_server_flags() {
        let args = Args::parse_from([
            "herakles-vmware-exporter",
            "--cache-size",
            "64M",
            "--log-level",
            "debug",
            "-t",
            "testdata.json",
        ]);
        assert_eq!(args.cache_size.as_deref(), Some("64M"));
        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
        assert!(args.command.is_none());
    }

    #[test]
    fn test_parse_generate_subcommand() {
        let args = Args::parse_from([
            "herakles-vmware-exporter",
            "generate-testdata",
            "--hosts",
            "2",
        ]);
        match args.command {
            Some(Commands::GenerateTestdata { hosts, vms_per_host, .. }) => {
                assert_eq!(hosts, 2);
                assert_eq!(vms_per_host, 8);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_log_level_from_config() {
        assert!(matches!(LogLevel::from_config("warn"), Some(LogLevel::Warn)));
        assert!(LogLevel::from_config("loud").is_none());
    }
}
