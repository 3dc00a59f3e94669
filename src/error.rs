use thiserror::Error;

impl From<serde_json::Error> for AuditError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for AuditError {
    fn from(err: sqlx::Error) -> Self {
        Self::PersistenceError(format!("Database error: {}", err))
    }
}

impl From<std::io::Error> for AuditError {
    fn from(err: std::io::Error) -> Self {
        Self::ExportError(format!("I/O error: {}", err))
    }
}

impl From<config::ConfigError> for AuditError {
    fn from(err: config::ConfigError) -> Self {
        Self::ConfigError(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum AuditError {
    /// Malformed, missing or inconsistent input. Nothing was hashed or stored.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// The entry is not durably recorded; the caller must retry or spool.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// The chain scope could not be serialized in time.
    #[error("Contention on chain scope {scope}: lock not acquired within {waited_ms}ms")]
    ContentionError { scope: String, waited_ms: u64 },

    /// A verification finding. Reported, never auto-corrected.
    #[error("Integrity violation in scope {scope} at entry {log_id}: {reason}")]
    IntegrityViolation {
        scope: String,
        log_id: String,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Export error: {0}")]
    ExportError(String),
}

pub type AuditResult<T> = Result<T, AuditError>;

impl AuditError {
    pub fn validation(index: Option<usize>, entity_id: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        match index {
            Some(i) => Self::ValidationError(format!(
                "entry {} (entity '{}'): {}",
                i, entity_id, reason
            )),
            None => Self::ValidationError(format!("entity '{}': {}", entity_id, reason)),
        }
    }

    pub fn contention(scope: &str, waited_ms: u64) -> Self {
        Self::ContentionError {
            scope: scope.to_string(),
            waited_ms,
        }
    }

    /// Whether the caller should retry the write with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ContentionError { .. } | Self::PersistenceError(_)
        )
    }
}
