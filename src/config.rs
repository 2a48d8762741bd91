// src/config.rs

//! Loads and validates the TOML configuration that drives the replication
//! engine: one source, N targets, and the sync strategy applied to each.

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::time::Duration;

/// A single Redis-compatible endpoint: the source, or one target.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    #[serde(default)]
    pub db: i64,
    #[serde(default)]
    pub tls: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    #[serde(flatten)]
    pub endpoint: EndpointConfig,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Full,
    Incremental,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    Fast,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncrementalMethod {
    Scan,
    Sync,
    Psync,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FullSyncConfig {
    #[serde(default = "default_pattern")]
    pub pattern: String,
    #[serde(default)]
    pub key_types: Option<Vec<String>>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_scan_count")]
    pub scan_count: usize,
    #[serde(default = "default_true")]
    pub preserve_ttl: bool,
    #[serde(default)]
    pub clear_target: bool,
    #[serde(default = "default_true")]
    pub verify_migration: bool,
    #[serde(default = "default_verify_mode")]
    pub verify_mode: VerifyMode,
    #[serde(default = "default_verify_sample_size")]
    pub verify_sample_size: usize,
}

impl Default for FullSyncConfig {
    fn default() -> Self {
        Self {
            pattern: default_pattern(),
            key_types: None,
            batch_size: default_batch_size(),
            scan_count: default_scan_count(),
            preserve_ttl: true,
            clear_target: false,
            verify_migration: true,
            verify_mode: default_verify_mode(),
            verify_sample_size: default_verify_sample_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncrementalSyncConfig {
    #[serde(default = "default_incremental_method")]
    pub method: IncrementalMethod,
    #[serde(with = "humantime_serde", default = "default_sync_interval")]
    pub interval: Duration,
    #[serde(default = "default_max_changes_per_sync")]
    pub max_changes_per_sync: usize,
    #[serde(default = "default_pattern")]
    pub key_pattern: String,
    #[serde(default)]
    pub key_types: Option<Vec<String>>,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for IncrementalSyncConfig {
    fn default() -> Self {
        Self {
            method: default_incremental_method(),
            interval: default_sync_interval(),
            max_changes_per_sync: default_max_changes_per_sync(),
            key_pattern: default_pattern(),
            key_types: None,
            buffer_size: default_buffer_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_mode")]
    pub mode: SyncMode,
    #[serde(default)]
    pub full_sync: FullSyncConfig,
    #[serde(default)]
    pub incremental_sync: IncrementalSyncConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: default_sync_mode(),
            full_sync: FullSyncConfig::default(),
            incremental_sync: IncrementalSyncConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PerformanceConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FailoverConfig {
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(with = "humantime_serde", default = "default_recovery_delay")]
    pub recovery_delay: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            recovery_delay: default_recovery_delay(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            performance: PerformanceConfig::default(),
            failover: FailoverConfig::default(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebUiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_web_ui_host")]
    pub host: String,
    #[serde(default = "default_web_ui_port")]
    pub port: u16,
}

impl Default for WebUiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_web_ui_host(),
            port: default_web_ui_port(),
        }
    }
}

/// The raw shape deserialized directly from TOML, before cross-field validation.
#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    source: EndpointConfig,
    targets: Vec<TargetConfig>,
    #[serde(default)]
    sync: SyncConfig,
    #[serde(default)]
    service: ServiceConfig,
    #[serde(default)]
    web_ui: WebUiConfig,
}

/// The validated configuration used by every component downstream.
#[derive(Debug, Clone)]
pub struct Config {
    pub source: EndpointConfig,
    pub targets: Vec<TargetConfig>,
    pub sync: SyncConfig,
    pub service: ServiceConfig,
    pub web_ui: WebUiConfig,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at '{path}'"))?;
        let raw: RawConfig =
            toml::from_str(&content).with_context(|| format!("failed to parse '{path}' as TOML"))?;
        let config = Config {
            source: raw.source,
            targets: raw.targets,
            sync: raw.sync,
            service: raw.service,
            web_ui: raw.web_ui,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(anyhow!("at least one target must be configured"));
        }
        if self.targets.iter().all(|t| !t.enabled) {
            return Err(anyhow!("at least one target must be enabled"));
        }
        let mut names = std::collections::HashSet::new();
        for target in &self.targets {
            if !names.insert(target.name.as_str()) {
                return Err(anyhow!("duplicate target name '{}'", target.name));
            }
        }
        if self.sync.full_sync.verify_sample_size == 0 {
            return Err(anyhow!("sync.full_sync.verify_sample_size must be > 0"));
        }
        if self.sync.full_sync.batch_size == 0 {
            return Err(anyhow!("sync.full_sync.batch_size must be > 0"));
        }
        if self.service.performance.max_workers == 0 {
            return Err(anyhow!("service.performance.max_workers must be > 0"));
        }
        if self.sync.incremental_sync.max_changes_per_sync == 0 {
            return Err(anyhow!(
                "sync.incremental_sync.max_changes_per_sync must be > 0"
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
fn default_pattern() -> String {
    "*".to_string()
}
fn default_batch_size() -> usize {
    100
}
fn default_scan_count() -> usize {
    1000
}
fn default_verify_mode() -> VerifyMode {
    VerifyMode::Fast
}
fn default_verify_sample_size() -> usize {
    100
}
fn default_incremental_method() -> IncrementalMethod {
    IncrementalMethod::Scan
}
fn default_sync_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_max_changes_per_sync() -> usize {
    10_000
}
fn default_buffer_size() -> usize {
    10_000
}
fn default_sync_mode() -> SyncMode {
    SyncMode::Hybrid
}
fn default_max_workers() -> usize {
    8
}
fn default_max_failures() -> u32 {
    3
}
fn default_recovery_delay() -> Duration {
    Duration::from_secs(30)
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_web_ui_host() -> String {
    "0.0.0.0".to_string()
}
fn default_web_ui_port() -> u16 {
    8088
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
        [source]
        host = "127.0.0.1"
        port = 6379

        [[targets]]
        name = "replica-a"
        host = "10.0.0.1"
        port = 6379
        "#
    }

    #[test]
    fn loads_defaults_for_a_minimal_config() {
        let raw: super::RawConfig = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(raw.targets.len(), 1);
        assert!(raw.targets[0].enabled);
        assert_eq!(raw.sync.mode, SyncMode::Hybrid);
        assert_eq!(raw.sync.full_sync.scan_count, 1000);
        assert_eq!(raw.sync.incremental_sync.method, IncrementalMethod::Scan);
        assert_eq!(raw.service.failover.max_failures, 3);
    }

    #[test]
    fn rejects_empty_target_list() {
        let content = r#"
        [source]
        host = "127.0.0.1"
        port = 6379
        targets = []
        "#;
        let raw: Result<super::RawConfig, _> = toml::from_str(content);
        // Missing `targets` entirely is a hard parse error; an explicit empty
        // list parses fine and is caught by `validate()` instead.
        assert!(raw.is_err() || raw.unwrap().targets.is_empty());
    }

    #[test]
    fn rejects_duplicate_target_names() {
        let content = r#"
        [source]
        host = "127.0.0.1"
        port = 6379

        [[targets]]
        name = "dup"
        host = "10.0.0.1"
        port = 6379

        [[targets]]
        name = "dup"
        host = "10.0.0.2"
        port = 6379
        "#;
        let raw: RawConfig = toml::from_str(content).unwrap();
        let config = Config {
            source: raw.source,
            targets: raw.targets,
            sync: raw.sync,
            service: raw.service,
            web_ui: raw.web_ui,
        };
        assert!(config.validate().is_err());
    }
}
