//! Configuration loading for the CDC pipeline.
//!
//! Configuration is read once at startup from a YAML file; the database
//! password is read exclusively from the `PG_PASSWORD` environment
//! variable and never from the file, matching the original Go service's
//! `internal/configs/config.go` convention.

use crate::errors::{CdcError, CdcResult};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,
    pub slot_name: String,
    pub publication_name: String,
    /// Populated from `PG_PASSWORD` after load, never from the file.
    #[serde(skip)]
    pub password: String,
}

fn default_port() -> u16 {
    5432
}

fn default_ssl_mode() -> String {
    "disable".to_string()
}

impl SourceConfig {
    /// Builds the libpq-style `key=value` connection string, as the
    /// teacher's `utils::PGConnection::connect` expects.
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={} replication=database",
            self.host, self.port, self.database, self.user, self.password, self.ssl_mode
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub enum PIIMaskAction {
    #[serde(rename = "redact")]
    Redact,
    #[serde(rename = "hash")]
    Hash,
    #[serde(rename = "mask_partial")]
    MaskPartial,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PIIMask {
    pub field: String,
    pub action: PIIMaskAction,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableOptions {
    #[serde(default)]
    pub allowed_operations: Vec<String>,
    #[serde(default)]
    pub pii_masks: Vec<PIIMask>,
    #[serde(default)]
    pub route_to: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub tables: HashMap<String, TableOptions>,
    #[serde(default)]
    pub default_route: String,
    #[serde(default)]
    pub excluded_tables: HashSet<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    pub brokers: Vec<String>,
    #[serde(default)]
    pub compression: String,
    #[serde(default = "default_batch_size_kib")]
    pub batch_size_kib: u32,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

fn default_batch_size_kib() -> u32 {
    64
}

fn default_flush_interval_ms() -> u64 {
    200
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    pub pipeline: PipelineConfig,
    pub sink: SinkConfig,
}

impl Config {
    /// Loads configuration from a YAML file at `path`, then overlays the
    /// database password from `PG_PASSWORD`. An empty or missing password
    /// is a fatal configuration error, matching `spec.md` §6.
    pub fn load(path: &Path) -> CdcResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CdcError::config(format!("failed to read config file {}: {}", path.display(), e))
        })?;

        let mut config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| CdcError::config(format!("failed to parse config YAML: {}", e)))?;

        let password = std::env::var("PG_PASSWORD").unwrap_or_default();
        if password.is_empty() {
            return Err(CdcError::config("PG_PASSWORD environment variable is empty or unset"));
        }
        config.source.password = password;

        info!(
            host = %config.source.host,
            database = %config.source.database,
            slot_name = %config.source.slot_name,
            "loaded configuration"
        );

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
source:
  host: localhost
  database: appdb
  user: replicator
  slot_name: sub
  publication_name: pub
pipeline:
  tables:
    users:
      allowed_operations: [INSERT, UPDATE]
      pii_masks:
        - field: email
          action: hash
      route_to: user_events
  default_route: default
  excluded_tables: [audit_log]
sink:
  brokers: ["localhost:9092"]
  compression: zstd
  batch_size_kib: 64
  flush_interval_ms: 200
"#;

    #[test]
    fn parses_sample_config() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.source.port, 5432);
        assert_eq!(config.source.ssl_mode, "disable");
        assert!(config.pipeline.excluded_tables.contains("audit_log"));
        assert_eq!(config.pipeline.tables["users"].route_to, "user_events");
        assert_eq!(config.sink.batch_size_kib, 64);
    }

    #[test]
    fn load_fails_without_password() {
        let dir = std::env::temp_dir().join(format!("cdc-pipe-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        // SAFETY: single-threaded test, no concurrent env access in this process.
        unsafe { std::env::remove_var("PG_PASSWORD") };
        let result = Config::load(&path);
        assert!(result.is_err());
    }
}
