//! Append-only audit store over SQLite.
//!
//! The public surface has no update or delete operation, and every partition
//! table rejects UPDATE/DELETE with triggers. File databases additionally
//! serve reads through a read-only connection pool.

pub mod models;
pub mod partitions;
pub mod queries;
pub mod schema;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::audit::entry::{format_timestamp, AuditEntry};
use crate::config::DatabaseConfig;
use crate::error::{AuditError, AuditResult};
use models::{AuditFilter, ChainHead, GroupCount, PartitionInfo, ScanCursor, SortOrder};
use queries::{GroupColumn, Queries};

#[derive(Clone)]
pub struct Database {
    /// Single connection: every append goes through one writer.
    writer: SqlitePool,
    reader: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> AuditResult<Self> {
        Self::connect(&DatabaseConfig {
            url: database_url.to_string(),
            ..Default::default()
        })
        .await
    }

    pub async fn connect(config: &DatabaseConfig) -> AuditResult<Self> {
        if is_memory_url(&config.url) {
            return Self::new_in_memory().await;
        }

        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(config.acquire_timeout_secs));

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect_with(options.clone())
            .await?;

        let db = Database {
            reader: writer.clone(),
            writer,
        };
        db.run_migrations().await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect_with(options.read_only(true))
            .await?;

        info!("Connected to audit database {}", config.url);
        Ok(Database {
            writer: db.writer,
            reader,
        })
    }

    /// Private in-memory database, mainly for tests.
    pub async fn new_in_memory() -> AuditResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // One connection that never expires, otherwise the data goes with it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Database {
            writer: pool.clone(),
            reader: pool,
        };
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn run_migrations(&self) -> AuditResult<()> {
        sqlx::raw_sql(schema::AUDIT_LOG_SCHEMA)
            .execute(&self.writer)
            .await?;
        Ok(())
    }

    /// Persist a single entry.
    pub async fn insert(&self, entry: &AuditEntry) -> AuditResult<String> {
        let mut ids = self.insert_batch(std::slice::from_ref(entry)).await?;
        ids.pop()
            .ok_or_else(|| AuditError::PersistenceError("insert returned no id".to_string()))
    }

    /// Persist `entries` in one all-or-nothing transaction.
    ///
    /// Entries must arrive in chain order. For each scope the first entry has
    /// to continue the persisted tail (`chain_seq = last_seq + 1` and, when
    /// hashed, `prev_hash = last_hash`); otherwise another writer got there
    /// first and the whole batch is rolled back.
    pub async fn insert_batch(&self, entries: &[AuditEntry]) -> AuditResult<Vec<String>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.writer.begin().await?;
        let mut tails: HashMap<String, ChainHead> = HashMap::new();
        let mut ensured: HashSet<String> = HashSet::new();
        let mut ids = Vec::with_capacity(entries.len());
        let insert_columns = format!(
            "({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            schema::ENTRY_COLUMNS
        );

        for entry in entries {
            if !tails.contains_key(&entry.chain_scope) {
                let head = sqlx::query_as::<_, ChainHead>(
                    "SELECT chain_scope, last_hash, last_log_id, last_seq FROM audit_chain_heads WHERE chain_scope = ?",
                )
                .bind(&entry.chain_scope)
                .fetch_optional(&mut *tx)
                .await?;
                tails.insert(
                    entry.chain_scope.clone(),
                    head.unwrap_or_else(|| ChainHead {
                        chain_scope: entry.chain_scope.clone(),
                        last_hash: None,
                        last_log_id: String::new(),
                        last_seq: 0,
                    }),
                );
            }
            if let Some(tail) = tails.get(&entry.chain_scope) {
                check_continues(tail, entry)?;
            }

            let (partition, range_start, range_end) = partitions::partition_for(&entry.timestamp);
            if !schema::is_partition_name(&partition) {
                return Err(AuditError::ValidationError(format!(
                    "entry {} has a timestamp outside the supported range",
                    entry.log_id
                )));
            }
            if !ensured.contains(&partition) {
                let registered: Option<(String,)> =
                    sqlx::query_as("SELECT name FROM audit_partitions WHERE name = ?")
                        .bind(&partition)
                        .fetch_optional(&mut *tx)
                        .await?;
                if registered.is_none() {
                    let ddl = schema::partition_ddl(&partition);
                    sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(&ddl)).await?;
                    sqlx::query(
                        "INSERT INTO audit_partitions (name, range_start, range_end, created_at) VALUES (?, ?, ?, ?)",
                    )
                    .bind(&partition)
                    .bind(format_timestamp(&range_start))
                    .bind(format_timestamp(&range_end))
                    .bind(format_timestamp(&Utc::now()))
                    .execute(&mut *tx)
                    .await?;
                    debug!("Created audit partition {}", partition);
                }
                ensured.insert(partition.clone());
            }

            sqlx::query(&format!("INSERT INTO {} {}", partition, insert_columns))
                .bind(&entry.log_id)
                .bind(&entry.entity_id)
                .bind(&entry.entity_type)
                .bind(&entry.field_name)
                .bind(entry.action.as_str())
                .bind(entry.old_value.as_ref().map(|v| v.to_string()))
                .bind(entry.new_value.as_ref().map(|v| v.to_string()))
                .bind(&entry.actor_id)
                .bind(format_timestamp(&entry.timestamp))
                .bind(serde_json::to_string(&entry.metadata)?)
                .bind(&entry.hash)
                .bind(&entry.prev_hash)
                .bind(entry.pii_redacted)
                .bind(&entry.chain_scope)
                .bind(entry.chain_seq)
                .execute(&mut *tx)
                .await?;

            tails.insert(
                entry.chain_scope.clone(),
                ChainHead {
                    chain_scope: entry.chain_scope.clone(),
                    last_hash: entry.hash.clone(),
                    last_log_id: entry.log_id.clone(),
                    last_seq: entry.chain_seq,
                },
            );
            ids.push(entry.log_id.clone());
        }

        let now = format_timestamp(&Utc::now());
        for tail in tails.values() {
            sqlx::query(
                "INSERT INTO audit_chain_heads (chain_scope, last_hash, last_log_id, last_seq, updated_at) \
                 VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT(chain_scope) DO UPDATE SET \
                     last_hash = excluded.last_hash, \
                     last_log_id = excluded.last_log_id, \
                     last_seq = excluded.last_seq, \
                     updated_at = excluded.updated_at",
            )
            .bind(&tail.chain_scope)
            .bind(&tail.last_hash)
            .bind(&tail.last_log_id)
            .bind(tail.last_seq)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("Committed {} audit entries across {} scopes", ids.len(), tails.len());
        Ok(ids)
    }

    pub async fn chain_head(&self, chain_scope: &str) -> AuditResult<Option<ChainHead>> {
        Queries::chain_head(&self.reader, chain_scope).await
    }

    pub async fn list_chain_scopes(&self) -> AuditResult<Vec<ChainHead>> {
        Queries::chain_scopes(&self.reader).await
    }

    /// Entries matching `filter` plus the total match count.
    pub async fn scan(
        &self,
        filter: &AuditFilter,
        offset: i64,
        limit: i64,
    ) -> AuditResult<(Vec<AuditEntry>, i64)> {
        let entries = Queries::scan(&self.reader, filter, offset, limit).await?;
        let total = Queries::count(&self.reader, filter).await?;
        Ok((entries, total))
    }

    pub async fn scan_after(
        &self,
        filter: &AuditFilter,
        cursor: Option<&ScanCursor>,
        limit: i64,
    ) -> AuditResult<Vec<AuditEntry>> {
        Queries::scan_after(&self.reader, filter, cursor, limit).await
    }

    pub async fn count(&self, filter: &AuditFilter) -> AuditResult<i64> {
        Queries::count(&self.reader, filter).await
    }

    /// Entries of one entity, newest first.
    pub async fn get_by_entity(
        &self,
        entity_id: &str,
        field_name: Option<&str>,
        filter: AuditFilter,
        limit: i64,
    ) -> AuditResult<Vec<AuditEntry>> {
        let mut filter = filter.entity(entity_id).order(SortOrder::NewestFirst);
        if let Some(field_name) = field_name {
            filter = filter.field(field_name);
        }
        Queries::scan(&self.reader, &filter, 0, limit).await
    }

    pub async fn group_counts(
        &self,
        filter: &AuditFilter,
        column: GroupColumn,
        limit: Option<i64>,
    ) -> AuditResult<Vec<GroupCount>> {
        Queries::group_counts(&self.reader, filter, column, limit).await
    }

    pub async fn scope_entries(
        &self,
        chain_scope: &str,
        after_seq: i64,
        limit: i64,
    ) -> AuditResult<Vec<AuditEntry>> {
        Queries::scope_entries(&self.reader, chain_scope, after_seq, limit).await
    }

    pub async fn list_partitions(&self) -> AuditResult<Vec<PartitionInfo>> {
        partitions::list_partitions(&self.reader).await
    }

    pub async fn partitions_older_than(
        &self,
        cutoff: &DateTime<Utc>,
    ) -> AuditResult<Vec<PartitionInfo>> {
        partitions::partitions_older_than(&self.reader, cutoff).await
    }

    /// Archive hook for retention jobs: removes one whole month.
    pub async fn drop_partition(&self, name: &str) -> AuditResult<()> {
        partitions::drop_partition(&self.writer, name).await
    }

    /// Pool used for every read. Read-only for file databases; in-memory
    /// databases share their single connection with the writer.
    pub fn read_pool(&self) -> &SqlitePool {
        &self.reader
    }

    #[cfg(test)]
    pub(crate) fn raw_pool(&self) -> &SqlitePool {
        &self.writer
    }
}

fn is_memory_url(url: &str) -> bool {
    url == "sqlite::memory:" || url.contains(":memory:") || url.contains("mode=memory")
}

fn check_continues(tail: &ChainHead, entry: &AuditEntry) -> AuditResult<()> {
    if entry.chain_seq != tail.last_seq + 1 {
        return Err(AuditError::PersistenceError(format!(
            "stale chain tail for scope {}: entry {} has seq {}, tail is at {}",
            entry.chain_scope, entry.log_id, entry.chain_seq, tail.last_seq
        )));
    }
    if let (Some(prev), Some(last)) = (&entry.prev_hash, &tail.last_hash) {
        if prev != last {
            return Err(AuditError::PersistenceError(format!(
                "stale chain tail for scope {}: entry {} does not extend {}",
                entry.chain_scope, entry.log_id, tail.last_log_id
            )));
        }
    }
    Ok(())
}
