//! Config command implementation.
//!
//! Writes the default configuration as YAML, JSON or TOML.

use herakles_vmware_exporter::config::Config;
use std::fs;
use std::path::PathBuf;

use crate::cli::ConfigFormat;

/// Generates configuration files
pub fn command_config(
    output: Option<PathBuf>,
    format: ConfigFormat,
    commented: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();
    let output = match output {
        Some(path) => path,
        None => PathBuf::from("herakles-vmware-exporter.yaml"),
    };

    let content = render_config(&config, format, commented)?;

    if output.to_string_lossy() == "-" {
        print!("{}", content);
    } else {
        fs::write(&output, content)?;
        println!("✅ Configuration written to: {}", output.display());
    }

    Ok(())
}

/// Serializes `config` in `format`; comments are added to YAML only.
pub fn render_config(
    config: &Config,
    format: ConfigFormat,
    commented: bool,
) -> Result<String, Box<dyn std::error::Error>> {
    Ok(match format {
        ConfigFormat::Json => serde_json::to_string_pretty(config)?,
        ConfigFormat::Toml => toml::to_string_pretty(config)?,
        ConfigFormat::Yaml => {
            let mut content = serde_yaml::to_string(config)?;
            if commented {
                content = add_config_comments(content);
            }
            content
        }
    })
}

/// Adds comments to YAML configuration
fn add_config_comments(yaml: String) -> String {
    let comments = r#"# Herakles VMware Exporter Configuration
# ======================================
#
# Server Configuration
# --------------------
# bind: "0.0.0.0"                 # Bind IP (0.0.0.0 = all interfaces)
# port: 9216                      # HTTP port
#
# Cache
# -----
# cache_size: "8M"                # Memory budget for every cached object (K/M/G suffix)
# refresh_interval: 60            # Seconds between performance cycles
# tags_refresh_interval: 300      # Seconds between tag cycles
# unused_counter_ttl: 86400       # Seconds an unread requested counter is kept
# not_supported_ttl: 7200         # Seconds an unread unsupported counter is kept
#
# Request Batching
# ----------------
# max_counters_per_request: null  # Counter limit of a real-time request (null = no limit)
# max_query_metrics: 64           # Counter limit of a historical request
# first_commit_retries: 0         # Starved first commits tolerated before exiting
#
# Data Source
# -----------
# test_data_file: null            # JSON inventory replayed by the collector
# parallelism: null               # Parallel threads (null = auto)
#
# Feature Flags
# -------------
# enable_health: true             # Enable /health endpoint
# enable_telemetry: true          # Export cache and collector metrics
# enable_tags: true               # Run the tag cycle
#
# Logging
# -------
# log_level: "info"               # off, error, warn, info, debug, trace
"#;

    format!("{comments}\n{yaml}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rendered_yaml_parses_back() {
        let config = Config::default();
        let yaml = render_config(&config, ConfigFormat::Yaml, true).unwrap();
        assert!(yaml.starts_with("# Herakles VMware Exporter Configuration"));
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_rendered_json_parses_back() {
        let config = Config::default();
        let json = render_config(&config, ConfigFormat::Json, true).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
