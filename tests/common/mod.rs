#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use field_audit::audit::{AuditLogger, ChainScope, NewAuditEntry, RedactionPolicy, ScopeLocks};
use field_audit::database::Database;

/// Setup an in-memory SQLite database for testing
pub async fn setup_test_db() -> Database {
    Database::new_in_memory().await.expect("Failed to create test database")
}

/// Logger with per-entity chains and `ssn` as the only sensitive field
pub fn test_logger(db: &Database) -> AuditLogger {
    AuditLogger::new(
        db.clone(),
        RedactionPolicy::new(["ssn"]),
        ChainScope::Entity,
        ScopeLocks::new(std::time::Duration::from_secs(5)),
    )
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

/// Category override on `entity_id` at `base_time() + minutes`
pub fn category_change(entity_id: &str, actor: &str, minutes: i64) -> NewAuditEntry {
    NewAuditEntry::new(entity_id, "transaction", "category", "override")
        .old_value(format!("old-{}", minutes))
        .new_value(format!("new-{}", minutes))
        .actor(actor)
        .at(base_time() + Duration::minutes(minutes))
}
