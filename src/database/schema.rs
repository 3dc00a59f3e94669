// Database schema definitions for the audit log.
// Static tables live in migrations/; partition tables are created on demand.

use regex::Regex;
use std::sync::OnceLock;

pub const AUDIT_LOG_SCHEMA: &str = include_str!("../../migrations/001_audit_log.sql");

pub const PARTITION_PREFIX: &str = "audit_log_p";

/// Column list shared by every partition and every SELECT.
pub const ENTRY_COLUMNS: &str = "log_id, entity_id, entity_type, field_name, action, \
     old_value, new_value, actor_id, timestamp, metadata, hash, prev_hash, \
     pii_redacted, chain_scope, chain_seq";

/// DDL for one monthly partition. Update and delete are aborted by triggers;
/// CHECK constraints mirror the action/value rules enforced at ingestion.
pub fn partition_ddl(name: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {name} (
    log_id TEXT PRIMARY KEY NOT NULL,
    entity_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    field_name TEXT NOT NULL,
    action TEXT NOT NULL CHECK (action IN ('recorded', 'override', 'revert', 'delete')),
    old_value TEXT,
    new_value TEXT,
    actor_id TEXT,
    timestamp TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{{}}',
    hash TEXT,
    prev_hash TEXT,
    pii_redacted INTEGER NOT NULL DEFAULT 0,
    chain_scope TEXT NOT NULL,
    chain_seq INTEGER NOT NULL,
    CHECK (action <> 'recorded' OR old_value IS NULL),
    CHECK (action <> 'delete' OR new_value IS NULL),
    UNIQUE (chain_scope, chain_seq)
);
CREATE INDEX IF NOT EXISTS {name}_entity_idx ON {name} (entity_id, field_name, timestamp);
CREATE INDEX IF NOT EXISTS {name}_actor_idx ON {name} (actor_id, timestamp);
CREATE INDEX IF NOT EXISTS {name}_time_idx ON {name} (timestamp, chain_seq, log_id);
CREATE TRIGGER IF NOT EXISTS {name}_no_update
BEFORE UPDATE ON {name}
BEGIN
    SELECT RAISE(ABORT, 'audit log is append-only: update denied');
END;
CREATE TRIGGER IF NOT EXISTS {name}_no_delete
BEFORE DELETE ON {name}
BEGIN
    SELECT RAISE(ABORT, 'audit log is append-only: delete denied');
END;
"#,
        name = name
    )
}

/// Partition names are interpolated into SQL, so only accept the exact
/// generated shape.
pub fn is_partition_name(name: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^audit_log_p[0-9]{6}$").expect("partition pattern is valid"))
        .is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_name_validation() {
        assert!(is_partition_name("audit_log_p202610"));
        assert!(!is_partition_name("audit_log_p2026"));
        assert!(!is_partition_name("audit_log_p202610; DROP TABLE audit_partitions"));
        assert!(!is_partition_name("audit_chain_heads"));
    }

    #[test]
    fn test_partition_ddl_has_append_only_triggers() {
        let ddl = partition_ddl("audit_log_p202601");
        assert!(ddl.contains("audit_log_p202601_no_update"));
        assert!(ddl.contains("audit_log_p202601_no_delete"));
        assert!(ddl.contains("metadata TEXT NOT NULL DEFAULT '{}'"));
    }
}
