//! Read-side access to the audit log: history, filtered pages, timelines and
//! per-actor summaries.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::audit::entry::{AuditAction, AuditEntry};
use crate::config::AppConfig;
use crate::database::models::{AuditFilter, GroupCount, ScanCursor, SortOrder};
use crate::database::queries::GroupColumn;
use crate::database::Database;
use crate::error::AuditResult;

const TOP_FIELDS: i64 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct QueryPage {
    pub entries: Vec<AuditEntry>,
    pub total_count: i64,
    pub has_more: bool,
}

/// Every change of one field, oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct Timeline {
    pub entity_id: String,
    pub field_name: String,
    /// `new_value` of the latest change; absent after a delete.
    pub current_value: Option<Value>,
    pub changes: Vec<AuditEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActorActivity {
    pub actor_id: String,
    pub total: i64,
    pub by_action: BTreeMap<String, i64>,
    pub by_entity_type: BTreeMap<String, i64>,
    pub top_fields: Vec<GroupCount>,
}

#[derive(Clone)]
pub struct QueryEngine {
    db: Database,
    max_page_size: i64,
}

impl QueryEngine {
    pub fn new(db: Database, max_page_size: i64) -> Self {
        Self {
            db,
            max_page_size: max_page_size.max(1),
        }
    }

    pub fn from_config(db: Database, config: &AppConfig) -> Self {
        Self::new(db, config.query.max_page_size)
    }

    /// Changes to one entity (optionally one field), newest first.
    pub async fn get_history(
        &self,
        entity_id: &str,
        field_name: Option<&str>,
        actions: &[AuditAction],
        limit: i64,
    ) -> AuditResult<Vec<AuditEntry>> {
        let mut filter = AuditFilter::new();
        filter.actions = actions.to_vec();
        self.db
            .get_by_entity(entity_id, field_name, filter, self.clamp(limit))
            .await
    }

    pub async fn query(&self, filter: &AuditFilter, offset: i64, limit: i64) -> AuditResult<QueryPage> {
        let offset = offset.max(0);
        let (entries, total_count) = self.db.scan(filter, offset, self.clamp(limit)).await?;
        let has_more = offset + (entries.len() as i64) < total_count;
        Ok(QueryPage {
            entries,
            total_count,
            has_more,
        })
    }

    pub async fn count(&self, filter: &AuditFilter) -> AuditResult<i64> {
        self.db.count(filter).await
    }

    pub async fn get_timeline(&self, entity_id: &str, field_name: &str) -> AuditResult<Timeline> {
        let filter = AuditFilter::new()
            .entity(entity_id)
            .field(field_name)
            .order(SortOrder::OldestFirst);

        let mut changes = Vec::new();
        let mut cursor: Option<ScanCursor> = None;
        loop {
            let page = self
                .db
                .scan_after(&filter, cursor.as_ref(), self.max_page_size)
                .await?;
            let full = page.len() as i64 == self.max_page_size;
            cursor = page.last().map(ScanCursor::from);
            changes.extend(page);
            if !full {
                break;
            }
        }

        Ok(Timeline {
            entity_id: entity_id.to_string(),
            field_name: field_name.to_string(),
            current_value: changes.last().and_then(|e| e.new_value.clone()),
            changes,
        })
    }

    pub async fn get_actor_activity(
        &self,
        actor_id: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> AuditResult<ActorActivity> {
        let filter = AuditFilter::new().actor(actor_id).between(start, end);

        let by_action = self
            .db
            .group_counts(&filter, GroupColumn::Action, None)
            .await?;
        let by_entity_type = self
            .db
            .group_counts(&filter, GroupColumn::EntityType, None)
            .await?;
        let top_fields = self
            .db
            .group_counts(&filter, GroupColumn::FieldName, Some(TOP_FIELDS))
            .await?;

        Ok(ActorActivity {
            actor_id: actor_id.to_string(),
            total: by_action.iter().map(|g| g.count).sum(),
            by_action: by_action.into_iter().map(|g| (g.key, g.count)).collect(),
            by_entity_type: by_entity_type.into_iter().map(|g| (g.key, g.count)).collect(),
            top_fields,
        })
    }

    fn clamp(&self, limit: i64) -> i64 {
        limit.clamp(1, self.max_page_size)
    }
}
