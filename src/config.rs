//! Application configuration
//!
//! Settings are read from an optional TOML file and then overridden by
//! `FIELD_AUDIT__SECTION__KEY` environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::audit::scope::ChainScope;
use crate::error::AuditResult;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub chain: ChainConfig,
    pub redaction: RedactionConfig,
    pub buffer: BufferConfig,
    pub query: QueryConfig,
    pub export: ExportConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://field_audit.db".to_string(),
            max_connections: 8,
            acquire_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// When false, entries are stored without `hash`/`prev_hash`.
    pub enabled: bool,
    pub scope: ChainScope,
    pub lock_timeout_ms: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scope: ChainScope::Entity,
            lock_timeout_ms: 5_000,
        }
    }
}

impl ChainConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    pub sensitive_fields: Vec<String>,
    pub sentinel: String,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            sensitive_fields: vec![
                "ssn".to_string(),
                "tax_id".to_string(),
                "account_number".to_string(),
                "routing_number".to_string(),
                "date_of_birth".to_string(),
            ],
            sentinel: crate::audit::redaction::DEFAULT_SENTINEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Hard bound; a full buffer makes the submitting caller flush.
    pub capacity: usize,
    /// Background flush is triggered once this many entries are pending.
    pub flush_threshold: usize,
    pub flush_interval_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            flush_threshold: 500,
            flush_interval_ms: 1_000,
        }
    }
}

impl BufferConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub max_page_size: i64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self { max_page_size: 1_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub page_size: i64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self { page_size: 500 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub retention_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_days: 7 * 365,
        }
    }
}

impl AppConfig {
    /// Load configuration from `path` (if it exists) and the environment.
    pub fn load(path: Option<&Path>) -> AuditResult<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("FIELD_AUDIT")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("redaction.sensitive_fields")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AuditResult<()> {
        use crate::error::AuditError;

        if self.buffer.capacity == 0 {
            return Err(AuditError::ConfigError(
                "buffer.capacity must be greater than zero".to_string(),
            ));
        }
        if self.buffer.flush_threshold == 0 || self.buffer.flush_threshold > self.buffer.capacity {
            return Err(AuditError::ConfigError(format!(
                "buffer.flush_threshold must be in 1..={}",
                self.buffer.capacity
            )));
        }
        if let ChainScope::Shard { shards } = self.chain.scope {
            if shards == 0 {
                return Err(AuditError::ConfigError(
                    "chain.scope shard count must be greater than zero".to_string(),
                ));
            }
        }
        if self.query.max_page_size <= 0 || self.export.page_size <= 0 {
            return Err(AuditError::ConfigError(
                "page sizes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
