//! Audit Log Entry
//!
//! Defines the persisted field-change record, the caller-facing input type
//! and the validation applied before anything is redacted, hashed or stored.

use chrono::{DateTime, Datelike, SecondsFormat, SubsecRound, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::audit::hash_chain::ChainFields;
use crate::error::{AuditError, AuditResult};

pub const MAX_IDENTIFIER_LEN: usize = 255;

/// Kind of change recorded for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    /// First value captured for a field; there is no previous value.
    Recorded,
    Override,
    Revert,
    /// Field removed; there is no new value.
    Delete,
}

impl AuditAction {
    pub const ALL: [AuditAction; 4] = [
        AuditAction::Recorded,
        AuditAction::Override,
        AuditAction::Revert,
        AuditAction::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Recorded => "recorded",
            AuditAction::Override => "override",
            AuditAction::Revert => "revert",
            AuditAction::Delete => "delete",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recorded" => Ok(AuditAction::Recorded),
            "override" => Ok(AuditAction::Override),
            "revert" => Ok(AuditAction::Revert),
            "delete" => Ok(AuditAction::Delete),
            other => Err(AuditError::ValidationError(format!(
                "invalid action '{}': expected one of recorded, override, revert, delete",
                other
            ))),
        }
    }
}

/// Immutable, persisted audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub log_id: String,
    pub entity_id: String,
    pub entity_type: String,
    pub field_name: String,
    pub action: AuditAction,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub actor_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub metadata: BTreeMap<String, Value>,
    pub hash: Option<String>,
    pub prev_hash: Option<String>,
    pub pii_redacted: bool,
    pub chain_scope: String,
    pub chain_seq: i64,
}

impl AuditEntry {
    /// Fields covered by the digest, already in their redacted form.
    pub fn chain_fields(&self) -> ChainFields<'_> {
        ChainFields {
            entity_id: &self.entity_id,
            entity_type: &self.entity_type,
            field_name: &self.field_name,
            action: self.action,
            old_value: self.old_value.as_ref(),
            new_value: self.new_value.as_ref(),
            actor_id: self.actor_id.as_deref(),
            timestamp: &self.timestamp,
            metadata: &self.metadata,
        }
    }

    /// Get a human-readable summary without any field values.
    pub fn summary(&self) -> String {
        format!(
            "{} {}:{}.{} by {} at {} (seq {} in {})",
            self.action,
            self.entity_type,
            self.entity_id,
            self.field_name,
            self.actor_id.as_deref().unwrap_or("system"),
            format_timestamp(&self.timestamp),
            self.chain_seq,
            self.chain_scope
        )
    }
}

/// Unvalidated change event supplied by a caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewAuditEntry {
    pub entity_id: String,
    pub entity_type: String,
    pub field_name: String,
    pub action: String,
    #[serde(default)]
    pub old_value: Option<Value>,
    #[serde(default)]
    pub new_value: Option<Value>,
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl NewAuditEntry {
    pub fn new(
        entity_id: impl Into<String>,
        entity_type: impl Into<String>,
        field_name: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type: entity_type.into(),
            field_name: field_name.into(),
            action: action.into(),
            ..Default::default()
        }
    }

    pub fn old_value(mut self, value: impl Into<Value>) -> Self {
        self.old_value = Some(value.into());
        self
    }

    pub fn new_value(mut self, value: impl Into<Value>) -> Self {
        self.new_value = Some(value.into());
        self
    }

    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Check the entry and normalize it. `index` is the position inside a
    /// bulk request and only used for error context.
    pub fn validate(self, index: Option<usize>) -> AuditResult<ValidatedEntry> {
        let entity_id = self.entity_id.trim().to_string();
        let context = if entity_id.is_empty() {
            "<missing>".to_string()
        } else {
            entity_id.clone()
        };
        let fail = |reason: String| AuditError::validation(index, &context, reason);

        for (name, value) in [
            ("entity_id", &entity_id),
            ("entity_type", &self.entity_type),
            ("field_name", &self.field_name),
        ] {
            let value = value.trim();
            if value.is_empty() {
                return Err(fail(format!("missing required field '{}'", name)));
            }
            if value.len() > MAX_IDENTIFIER_LEN {
                return Err(fail(format!(
                    "'{}' exceeds {} characters",
                    name, MAX_IDENTIFIER_LEN
                )));
            }
        }

        if !field_name_pattern().is_match(self.field_name.trim()) {
            return Err(fail(format!(
                "field_name '{}' contains unsupported characters",
                self.field_name.trim()
            )));
        }

        let action = AuditAction::from_str(self.action.trim())
            .map_err(|_| fail(format!("invalid action '{}'", self.action.trim())))?;

        let old_value = self.old_value.filter(|v| !v.is_null());
        let new_value = self.new_value.filter(|v| !v.is_null());

        if action == AuditAction::Recorded && old_value.is_some() {
            return Err(fail("action 'recorded' must not carry an old_value".to_string()));
        }
        if action == AuditAction::Delete && new_value.is_some() {
            return Err(fail("action 'delete' must not carry a new_value".to_string()));
        }

        let actor_id = self
            .actor_id
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty());
        if let Some(actor) = &actor_id {
            if actor.len() > MAX_IDENTIFIER_LEN {
                return Err(fail(format!(
                    "'actor_id' exceeds {} characters",
                    MAX_IDENTIFIER_LEN
                )));
            }
        }

        if self.metadata.keys().any(|k| k.trim().is_empty()) {
            return Err(fail("metadata keys must not be empty".to_string()));
        }

        let timestamp = self.timestamp.unwrap_or_else(Utc::now).trunc_subsecs(6);
        // Canonical timestamps and monthly partition names need a 4-digit year.
        if !(0..=9999).contains(&timestamp.year()) {
            return Err(fail(format!(
                "timestamp year {} is outside 0000-9999",
                timestamp.year()
            )));
        }

        Ok(ValidatedEntry {
            entity_id,
            entity_type: self.entity_type.trim().to_string(),
            field_name: self.field_name.trim().to_string(),
            action,
            old_value,
            new_value,
            actor_id,
            timestamp,
            metadata: self.metadata,
        })
    }
}

/// Entry that passed validation but has not been redacted or chained yet.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedEntry {
    pub entity_id: String,
    pub entity_type: String,
    pub field_name: String,
    pub action: AuditAction,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub actor_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub metadata: BTreeMap<String, Value>,
}

/// Returned to callers once an entry is durably recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogReceipt {
    pub log_id: String,
    pub timestamp: DateTime<Utc>,
    pub hash: Option<String>,
}

impl From<&AuditEntry> for LogReceipt {
    fn from(entry: &AuditEntry) -> Self {
        Self {
            log_id: entry.log_id.clone(),
            timestamp: entry.timestamp,
            hash: entry.hash.clone(),
        }
    }
}

/// Canonical text form used for hashing, storage and range comparisons.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> AuditResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AuditError::SerializationError(format!("invalid timestamp '{}': {}", raw, e)))
}

fn field_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-\[\]]*$").expect("field name pattern is valid")
    })
}
