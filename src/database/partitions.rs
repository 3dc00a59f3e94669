//! Monthly time partitions.
//!
//! Every UTC calendar month gets its own table. Retention works by dropping a
//! whole partition; rows are never deleted individually.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use sqlx::SqlitePool;
use tracing::info;

use crate::audit::entry::format_timestamp;
use crate::database::models::PartitionInfo;
use crate::database::schema::{is_partition_name, PARTITION_PREFIX};
use crate::error::{AuditError, AuditResult};

/// Name and `[start, end)` range of the partition holding `ts`.
pub fn partition_for(ts: &DateTime<Utc>) -> (String, DateTime<Utc>, DateTime<Utc>) {
    let (year, month) = (ts.year(), ts.month());
    let start = Utc
        .with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(*ts);
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let end = Utc
        .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
        .single()
        .unwrap_or(*ts);
    (
        format!("{}{:04}{:02}", PARTITION_PREFIX, year, month),
        start,
        end,
    )
}

pub async fn list_partitions(pool: &SqlitePool) -> AuditResult<Vec<PartitionInfo>> {
    let partitions = sqlx::query_as::<_, PartitionInfo>(
        "SELECT name, range_start, range_end, created_at FROM audit_partitions ORDER BY range_start",
    )
    .fetch_all(pool)
    .await?;
    Ok(partitions)
}

/// Partitions overlapping `[start, end)`; open bounds match everything.
pub async fn partitions_in_range(
    pool: &SqlitePool,
    start: Option<&DateTime<Utc>>,
    end: Option<&DateTime<Utc>>,
) -> AuditResult<Vec<String>> {
    let start = start.map(format_timestamp);
    let end = end.map(format_timestamp);

    let names: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM audit_partitions \
         WHERE (? IS NULL OR range_end > ?) AND (? IS NULL OR range_start < ?) \
         ORDER BY range_start",
    )
    .bind(start.clone())
    .bind(start)
    .bind(end.clone())
    .bind(end)
    .fetch_all(pool)
    .await?;

    Ok(names.into_iter().map(|(name,)| name).collect())
}

/// Partitions whose whole range ends at or before `cutoff`.
pub async fn partitions_older_than(
    pool: &SqlitePool,
    cutoff: &DateTime<Utc>,
) -> AuditResult<Vec<PartitionInfo>> {
    let partitions = sqlx::query_as::<_, PartitionInfo>(
        "SELECT name, range_start, range_end, created_at FROM audit_partitions \
         WHERE range_end <= ? ORDER BY range_start",
    )
    .bind(format_timestamp(cutoff))
    .fetch_all(pool)
    .await?;
    Ok(partitions)
}

/// Drop a whole partition. Chain heads are left untouched so that later
/// entries keep chaining from the true tail.
pub async fn drop_partition(pool: &SqlitePool, name: &str) -> AuditResult<()> {
    if !is_partition_name(name) {
        return Err(AuditError::ValidationError(format!(
            "'{}' is not an audit partition name",
            name
        )));
    }

    let mut tx = pool.begin().await?;
    let deleted = sqlx::query("DELETE FROM audit_partitions WHERE name = ?")
        .bind(name)
        .execute(&mut *tx)
        .await?;
    if deleted.rows_affected() == 0 {
        return Err(AuditError::ValidationError(format!(
            "audit partition '{}' does not exist",
            name
        )));
    }
    sqlx::raw_sql(&format!("DROP TABLE IF EXISTS {}", name))
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    info!("Dropped audit partition {}", name);
    Ok(())
}
