//! Configuration management for herakles-vmware-exporter.
//!
//! This module handles loading, validating, and managing configuration
//! from files (YAML, JSON, TOML). CLI overrides are applied by the binary.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::collector::{CollectorSettings, DEFAULT_MAX_QUERY_METRICS};
use crate::perf::Retention;

/// Default bind address for the HTTP server.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";

/// Default port for the HTTP server.
pub const DEFAULT_PORT: u16 = 9216;

/// Default cache budget.
pub const DEFAULT_CACHE_SIZE: &str = "8M";

/// Default seconds between performance cycles.
pub const DEFAULT_REFRESH_INTERVAL: u64 = 60;

/// Default seconds between tag cycles.
pub const DEFAULT_TAGS_REFRESH_INTERVAL: u64 = 300;

pub const MIN_CACHE_SIZE: usize = 256 * 1024;
pub const MAX_CACHE_SIZE: usize = 2 * 1024 * 1024 * 1024;

/// Locations searched when no config file is given.
const DEFAULT_CONFIG_PATHS: &[&str] = &[
    "/etc/herakles/vmware-exporter.yaml",
    "/etc/herakles/vmware-exporter.yml",
    "/etc/herakles/vmware-exporter.json",
    "./herakles-vmware-exporter.yaml",
    "./herakles-vmware-exporter.yml",
    "./herakles-vmware-exporter.json",
];

/// Main configuration structure for the exporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Server configuration
    pub port: Option<u16>,
    pub bind: Option<String>,

    // Cache
    /// Arena budget, bytes or with a K/M/G suffix.
    #[serde(alias = "cache-size")]
    pub cache_size: Option<String>,
    #[serde(alias = "refresh-interval")]
    pub refresh_interval: Option<u64>,
    #[serde(alias = "tags-refresh-interval")]
    pub tags_refresh_interval: Option<u64>,
    /// Seconds an unread custom counter is kept.
    #[serde(alias = "unused-counter-ttl")]
    pub unused_counter_ttl: Option<u64>,
    /// Seconds an unread, unsupported custom counter is kept.
    #[serde(alias = "not-supported-ttl")]
    pub not_supported_ttl: Option<u64>,

    // Request batching
    /// Counter limit of a real-time request, unset for no limit.
    #[serde(alias = "max-counters-per-request")]
    pub max_counters_per_request: Option<usize>,
    /// Counter limit of a historical request.
    #[serde(alias = "max-query-metrics")]
    pub max_query_metrics: Option<usize>,
    /// Cycles the first commit may be starved before the exporter exits.
    #[serde(alias = "first-commit-retries")]
    pub first_commit_retries: Option<u32>,

    // Data source
    /// JSON inventory replayed instead of a live endpoint.
    #[serde(alias = "test-data-file")]
    pub test_data_file: Option<PathBuf>,
    /// Parallel processing threads (unset or 0 = auto)
    pub parallelism: Option<usize>,

    // Feature flags
    pub enable_health: Option<bool>,
    pub enable_telemetry: Option<bool>,
    pub enable_tags: Option<bool>,

    // Logging
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: Some(DEFAULT_PORT),
            bind: Some(DEFAULT_BIND_ADDR.to_string()),
            cache_size: Some(DEFAULT_CACHE_SIZE.to_string()),
            refresh_interval: Some(DEFAULT_REFRESH_INTERVAL),
            tags_refresh_interval: Some(DEFAULT_TAGS_REFRESH_INTERVAL),
            unused_counter_ttl: Some(Retention::default().unused_secs as u64),
            not_supported_ttl: Some(Retention::default().not_supported_secs as u64),
            max_counters_per_request: None,
            max_query_metrics: Some(DEFAULT_MAX_QUERY_METRICS),
            first_commit_retries: Some(0),
            test_data_file: None,
            parallelism: None,
            enable_health: Some(true),
            enable_telemetry: Some(true),
            enable_tags: Some(true),
            log_level: Some("info".into()),
        }
    }
}

impl Config {
    /// Effective arena budget in bytes.
    pub fn cache_size_bytes(&self) -> Result<usize, String> {
        parse_size(self.cache_size.as_deref().unwrap_or(DEFAULT_CACHE_SIZE))
    }

    pub fn collector_settings(&self) -> CollectorSettings {
        let defaults = Retention::default();
        CollectorSettings {
            max_counters_per_request: self.max_counters_per_request,
            max_query_metrics: self
                .max_query_metrics
                .unwrap_or(DEFAULT_MAX_QUERY_METRICS),
            retention: Retention {
                not_supported_secs: self
                    .not_supported_ttl
                    .map(|secs| secs as i64)
                    .unwrap_or(defaults.not_supported_secs),
                unused_secs: self
                    .unused_counter_ttl
                    .map(|secs| secs as i64)
                    .unwrap_or(defaults.unused_secs),
            },
            first_commit_retries: self.first_commit_retries.unwrap_or(0),
        }
    }
}

/// Parses `"8M"`, `"512K"`, `"1G"` or a plain byte count.
pub fn parse_size(value: &str) -> Result<usize, String> {
    let value = value.trim();
    let (digits, multiplier) = match value.chars().last() {
        Some('K' | 'k') => (&value[..value.len() - 1], 1024),
        Some('M' | 'm') => (&value[..value.len() - 1], 1024 * 1024),
        Some('G' | 'g') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };

    let number: usize = digits
        .trim()
        .parse()
        .map_err(|_| format!("Invalid size '{}', expected bytes or a K/M/G suffix", value))?;
    number
        .checked_mul(multiplier)
        .ok_or_else(|| format!("Size '{}' is too large", value))
}

/// Validate effective config (used by --check-config and at startup)
pub fn validate_effective_config(cfg: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let size = cfg.cache_size_bytes()?;
    if !(MIN_CACHE_SIZE..=MAX_CACHE_SIZE).contains(&size) {
        return Err(format!(
            "cache_size {} bytes is out of range {}..={} bytes",
            size, MIN_CACHE_SIZE, MAX_CACHE_SIZE
        )
        .into());
    }

    if cfg.refresh_interval == Some(0) {
        return Err("refresh_interval must be at least 1 second".into());
    }
    if cfg.tags_refresh_interval == Some(0) {
        return Err("tags_refresh_interval must be at least 1 second".into());
    }
    if cfg.unused_counter_ttl == Some(0) || cfg.not_supported_ttl == Some(0) {
        return Err("unused_counter_ttl and not_supported_ttl must be positive".into());
    }
    if cfg.max_query_metrics == Some(0) {
        return Err("max_query_metrics must be at least 1".into());
    }
    if cfg.max_counters_per_request == Some(0) {
        return Err("max_counters_per_request must be at least 1 when set".into());
    }

    if let Some(bind) = cfg.bind.as_deref() {
        bind.parse::<std::net::IpAddr>()
            .map_err(|e| format!("Invalid bind address '{}': {}", bind, e))?;
    }

    if let Some(level) = cfg.log_level.as_deref() {
        match level {
            "off" | "error" | "warn" | "info" | "debug" | "trace" => {}
            other => {
                return Err(format!(
                    "Invalid log_level '{}', expected off, error, warn, info, debug or trace",
                    other
                )
                .into())
            }
        }
    }

    Ok(())
}

/// Loads configuration from `path`, or from the first existing default
/// location. Returns defaults when no file is found.
pub fn load_config(path: Option<&Path>) -> Result<Config, Box<dyn std::error::Error>> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match DEFAULT_CONFIG_PATHS.iter().find(|p| Path::new(p).exists()) {
            Some(p) => PathBuf::from(p),
            None => return Ok(Config::default()),
        },
    };

    if !path.exists() {
        return Err(format!("Config file not found: {}", path.display()).into());
    }

    let content = fs::read_to_string(&path)?;

    match path.extension().and_then(|s| s.to_str()) {
        Some("json") => {
            let config: Config = serde_json::from_str(&content)?;
            info!("Loaded JSON configuration from: {}", path.display());
            Ok(config)
        }
        Some("toml") => {
            let config: Config = toml::from_str(&content)?;
            info!("Loaded TOML configuration from: {}", path.display());
            Ok(config)
        }
        _ => {
            // Default to YAML
            let config: Config = serde_yaml::from_str(&content)?;
            info!("Loaded YAML configuration from: {}", path.display());
            Ok(config)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{Builder, NamedTempFile};

    fn temp_config(suffix: &str) -> NamedTempFile {
        Builder::new().suffix(suffix).tempfile().unwrap()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(validate_effective_config(&config).is_ok());
        assert_eq!(config.cache_size_bytes(), Ok(8 * 1024 * 1024));
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("8M"), Ok(8 * 1024 * 1024));
        assert_eq!(parse_size("256K"), Ok(256 * 1024));
        assert_eq!(parse_size("2g"), Ok(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("4096"), Ok(4096));
        assert!(parse_size("lots").is_err());
        assert!(parse_size("M").is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config {
            cache_size: Some("64K".into()),
            ..Config::default()
        };
        assert!(validate_effective_config(&config).is_err());

        config.cache_size = Some("64M".into());
        config.max_query_metrics = Some(0);
        assert!(validate_effective_config(&config).is_err());

        config.max_query_metrics = Some(64);
        config.log_level = Some("verbose".into());
        assert!(validate_effective_config(&config).is_err());

        config.log_level = Some("debug".into());
        config.bind = Some("not-an-ip".into());
        assert!(validate_effective_config(&config).is_err());
    }

    #[test]
    fn test_load_yaml_config() {
        let mut file = temp_config(".yaml");
        writeln!(
            file,
            "port: 9300\ncache-size: 16M\nmax_counters_per_request: 500\nfirst_commit_retries: 2"
        )
        .unwrap();

        let result = load_config(Some(file.path()));
        assert!(result.is_ok());
        let config = result.unwrap();
        assert_eq!(config.port, Some(9300));
        assert_eq!(config.cache_size_bytes(), Ok(16 * 1024 * 1024));
        // unset keys keep their defaults
        assert_eq!(config.refresh_interval, Some(DEFAULT_REFRESH_INTERVAL));

        let settings = config.collector_settings();
        assert_eq!(settings.max_counters_per_request, Some(500));
        assert_eq!(settings.first_commit_retries, 2);
        assert_eq!(settings.max_query_metrics, DEFAULT_MAX_QUERY_METRICS);
    }

    #[test]
    fn test_load_json_and_toml_config() {
        let mut json = temp_config(".json");
        write!(json, r#"{{"refresh_interval": 30, "enable_tags": false}}"#).unwrap();
        let config = load_config(Some(json.path())).unwrap();
        assert_eq!(config.refresh_interval, Some(30));
        assert_eq!(config.enable_tags, Some(false));

        let mut toml_file = temp_config(".toml");
        writeln!(toml_file, "unused_counter_ttl = 600\nnot_supported_ttl = 60").unwrap();
        let config = load_config(Some(toml_file.path())).unwrap();
        let retention = config.collector_settings().retention;
        assert_eq!(retention.unused_secs, 600);
        assert_eq!(retention.not_supported_secs, 60);
    }

    #[test]
    fn test_load_missing_config_file() {
        let result = load_config(Some(Path::new("/nonexistent/config.yaml")));
        assert!(result.is_err());
    }
}
