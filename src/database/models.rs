use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

use crate::audit::entry::{format_timestamp, parse_timestamp, AuditAction, AuditEntry};
use crate::error::{AuditError, AuditResult};

/// Raw row as stored in a partition table.
#[derive(Debug, Clone, FromRow)]
pub struct AuditRow {
    pub log_id: String,
    pub entity_id: String,
    pub entity_type: String,
    pub field_name: String,
    pub action: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub actor_id: Option<String>,
    pub timestamp: String,
    pub metadata: String,
    pub hash: Option<String>,
    pub prev_hash: Option<String>,
    pub pii_redacted: bool,
    pub chain_scope: String,
    pub chain_seq: i64,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = AuditError;

    fn try_from(row: AuditRow) -> AuditResult<Self> {
        let decode = |raw: Option<String>| -> AuditResult<Option<Value>> {
            raw.map(|text| serde_json::from_str(&text)).transpose().map_err(Into::into)
        };

        Ok(AuditEntry {
            action: row.action.parse::<AuditAction>().map_err(|_| {
                AuditError::SerializationError(format!(
                    "entry {} has unknown action '{}'",
                    row.log_id, row.action
                ))
            })?,
            old_value: decode(row.old_value)?,
            new_value: decode(row.new_value)?,
            timestamp: parse_timestamp(&row.timestamp)?,
            metadata: serde_json::from_str(&row.metadata)?,
            log_id: row.log_id,
            entity_id: row.entity_id,
            entity_type: row.entity_type,
            field_name: row.field_name,
            actor_id: row.actor_id,
            hash: row.hash,
            prev_hash: row.prev_hash,
            pii_redacted: row.pii_redacted,
            chain_scope: row.chain_scope,
            chain_seq: row.chain_seq,
        })
    }
}

/// Equality predicate on one metadata key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataPredicate {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

impl SortOrder {
    pub fn sql(&self) -> &'static str {
        match self {
            SortOrder::NewestFirst => "DESC",
            SortOrder::OldestFirst => "ASC",
        }
    }
}

/// Conjunction of optional filters over audit entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditFilter {
    pub actor_id: Option<String>,
    pub entity_type: Option<String>,
    pub entity_ids: Vec<String>,
    pub field_names: Vec<String>,
    pub actions: Vec<AuditAction>,
    /// Inclusive lower bound.
    pub start_time: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub end_time: Option<DateTime<Utc>>,
    pub metadata: Vec<MetadataPredicate>,
    pub chain_scope: Option<String>,
    pub order: SortOrder,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    pub fn entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_ids.push(entity_id.into());
        self
    }

    pub fn field(mut self, field_name: impl Into<String>) -> Self {
        self.field_names.push(field_name.into());
        self
    }

    pub fn action(mut self, action: AuditAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn between(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start_time = start;
        self.end_time = end;
        self
    }

    pub fn metadata_eq(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.push(MetadataPredicate {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn scope(mut self, chain_scope: impl Into<String>) -> Self {
        self.chain_scope = Some(chain_scope.into());
        self
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }
}

/// Position of the last row delivered by a keyset scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCursor {
    pub timestamp: String,
    pub chain_seq: i64,
    pub log_id: String,
}

impl From<&AuditEntry> for ScanCursor {
    fn from(entry: &AuditEntry) -> Self {
        Self {
            timestamp: format_timestamp(&entry.timestamp),
            chain_seq: entry.chain_seq,
            log_id: entry.log_id.clone(),
        }
    }
}

/// Tail pointer of one chain scope.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ChainHead {
    pub chain_scope: String,
    pub last_hash: Option<String>,
    pub last_log_id: String,
    pub last_seq: i64,
}

/// A registered monthly partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct PartitionInfo {
    pub name: String,
    pub range_start: String,
    pub range_end: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct GroupCount {
    #[sqlx(rename = "group_key")]
    pub key: String,
    #[sqlx(rename = "group_count")]
    pub count: i64,
}
