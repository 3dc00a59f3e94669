use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::audit::entry::{format_timestamp, AuditEntry};
use crate::database::models::*;
use crate::database::partitions::partitions_in_range;
use crate::database::schema::{is_partition_name, ENTRY_COLUMNS};
use crate::error::{AuditError, AuditResult};

/// Column an aggregation groups by. Never interpolate caller input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupColumn {
    Action,
    EntityType,
    FieldName,
}

impl GroupColumn {
    fn sql(&self) -> &'static str {
        match self {
            GroupColumn::Action => "action",
            GroupColumn::EntityType => "entity_type",
            GroupColumn::FieldName => "field_name",
        }
    }
}

pub struct Queries;

impl Queries {
    /// One page of entries matching `filter`, in the filter's sort order.
    pub async fn scan(
        pool: &SqlitePool,
        filter: &AuditFilter,
        offset: i64,
        limit: i64,
    ) -> AuditResult<Vec<AuditEntry>> {
        let partitions = Self::partitions_for(pool, filter).await?;
        if partitions.is_empty() || limit <= 0 {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM ", ENTRY_COLUMNS));
        push_source(&mut qb, &partitions);
        push_filters(&mut qb, filter)?;
        push_order(&mut qb, filter.order);
        qb.push(" LIMIT ");
        qb.push_bind(limit);
        qb.push(" OFFSET ");
        qb.push_bind(offset.max(0));

        let rows = qb.build_query_as::<AuditRow>().fetch_all(pool).await?;
        rows.into_iter().map(AuditEntry::try_from).collect()
    }

    /// Keyset page strictly after `cursor` in the filter's sort order.
    pub async fn scan_after(
        pool: &SqlitePool,
        filter: &AuditFilter,
        cursor: Option<&ScanCursor>,
        limit: i64,
    ) -> AuditResult<Vec<AuditEntry>> {
        let partitions = Self::partitions_for(pool, filter).await?;
        if partitions.is_empty() || limit <= 0 {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM ", ENTRY_COLUMNS));
        push_source(&mut qb, &partitions);
        push_filters(&mut qb, filter)?;
        if let Some(cursor) = cursor {
            let op = match filter.order {
                SortOrder::NewestFirst => "<",
                SortOrder::OldestFirst => ">",
            };
            qb.push(format!(" AND (timestamp, chain_seq, log_id) {} (", op));
            qb.push_bind(cursor.timestamp.clone());
            qb.push(", ");
            qb.push_bind(cursor.chain_seq);
            qb.push(", ");
            qb.push_bind(cursor.log_id.clone());
            qb.push(")");
        }
        push_order(&mut qb, filter.order);
        qb.push(" LIMIT ");
        qb.push_bind(limit);

        let rows = qb.build_query_as::<AuditRow>().fetch_all(pool).await?;
        rows.into_iter().map(AuditEntry::try_from).collect()
    }

    pub async fn count(pool: &SqlitePool, filter: &AuditFilter) -> AuditResult<i64> {
        let partitions = Self::partitions_for(pool, filter).await?;
        if partitions.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM ");
        push_source(&mut qb, &partitions);
        push_filters(&mut qb, filter)?;

        let (count,): (i64,) = qb.build_query_as().fetch_one(pool).await?;
        Ok(count)
    }

    /// Counts grouped by `column`, largest first.
    pub async fn group_counts(
        pool: &SqlitePool,
        filter: &AuditFilter,
        column: GroupColumn,
        limit: Option<i64>,
    ) -> AuditResult<Vec<GroupCount>> {
        let partitions = Self::partitions_for(pool, filter).await?;
        if partitions.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {col} AS group_key, COUNT(*) AS group_count FROM ",
            col = column.sql()
        ));
        push_source(&mut qb, &partitions);
        push_filters(&mut qb, filter)?;
        qb.push(format!(
            " GROUP BY {col} ORDER BY group_count DESC, {col} ASC",
            col = column.sql()
        ));
        if let Some(limit) = limit {
            qb.push(" LIMIT ");
            qb.push_bind(limit);
        }

        let groups = qb.build_query_as::<GroupCount>().fetch_all(pool).await?;
        Ok(groups)
    }

    /// Entries of one chain scope with `chain_seq > after_seq`, ascending.
    pub async fn scope_entries(
        pool: &SqlitePool,
        chain_scope: &str,
        after_seq: i64,
        limit: i64,
    ) -> AuditResult<Vec<AuditEntry>> {
        let partitions = partitions_in_range(pool, None, None).await?;
        if partitions.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM ", ENTRY_COLUMNS));
        push_source(&mut qb, &partitions);
        qb.push(" AND chain_scope = ");
        qb.push_bind(chain_scope.to_string());
        qb.push(" AND chain_seq > ");
        qb.push_bind(after_seq);
        qb.push(" ORDER BY chain_seq ASC LIMIT ");
        qb.push_bind(limit);

        let rows = qb.build_query_as::<AuditRow>().fetch_all(pool).await?;
        rows.into_iter().map(AuditEntry::try_from).collect()
    }

    pub async fn chain_head(pool: &SqlitePool, chain_scope: &str) -> AuditResult<Option<ChainHead>> {
        let head = sqlx::query_as::<_, ChainHead>(
            "SELECT chain_scope, last_hash, last_log_id, last_seq FROM audit_chain_heads WHERE chain_scope = ?",
        )
        .bind(chain_scope)
        .fetch_optional(pool)
        .await?;
        Ok(head)
    }

    pub async fn chain_scopes(pool: &SqlitePool) -> AuditResult<Vec<ChainHead>> {
        let heads = sqlx::query_as::<_, ChainHead>(
            "SELECT chain_scope, last_hash, last_log_id, last_seq FROM audit_chain_heads ORDER BY chain_scope",
        )
        .fetch_all(pool)
        .await?;
        Ok(heads)
    }

    async fn partitions_for(pool: &SqlitePool, filter: &AuditFilter) -> AuditResult<Vec<String>> {
        partitions_in_range(pool, filter.start_time.as_ref(), filter.end_time.as_ref()).await
    }
}

/// `(SELECT .. FROM p1 UNION ALL SELECT .. FROM p2) AS audit_log WHERE 1 = 1`
fn push_source(qb: &mut QueryBuilder<'_, Sqlite>, partitions: &[String]) {
    qb.push("(");
    for (i, partition) in partitions.iter().filter(|p| is_partition_name(p)).enumerate() {
        if i > 0 {
            qb.push(" UNION ALL ");
        }
        qb.push(format!("SELECT {} FROM {}", ENTRY_COLUMNS, partition));
    }
    qb.push(") AS audit_log WHERE 1 = 1");
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filter: &AuditFilter) -> AuditResult<()> {
    if let Some(actor_id) = &filter.actor_id {
        qb.push(" AND actor_id = ");
        qb.push_bind(actor_id.clone());
    }
    if let Some(entity_type) = &filter.entity_type {
        qb.push(" AND entity_type = ");
        qb.push_bind(entity_type.clone());
    }
    if let Some(chain_scope) = &filter.chain_scope {
        qb.push(" AND chain_scope = ");
        qb.push_bind(chain_scope.clone());
    }
    push_in_list(qb, "entity_id", filter.entity_ids.iter().cloned());
    push_in_list(qb, "field_name", filter.field_names.iter().cloned());
    push_in_list(
        qb,
        "action",
        filter.actions.iter().map(|a| a.as_str().to_string()),
    );
    if let Some(start) = &filter.start_time {
        qb.push(" AND timestamp >= ");
        qb.push_bind(format_timestamp(start));
    }
    if let Some(end) = &filter.end_time {
        qb.push(" AND timestamp < ");
        qb.push_bind(format_timestamp(end));
    }
    for predicate in &filter.metadata {
        push_metadata_predicate(qb, predicate)?;
    }
    Ok(())
}

fn push_in_list<I>(qb: &mut QueryBuilder<'_, Sqlite>, column: &'static str, values: I)
where
    I: ExactSizeIterator<Item = String>,
{
    if values.len() == 0 {
        return;
    }
    qb.push(format!(" AND {} IN (", column));
    let mut separated = qb.separated(", ");
    for value in values {
        separated.push_bind(value);
    }
    separated.push_unseparated(")");
}

fn push_metadata_predicate(
    qb: &mut QueryBuilder<'_, Sqlite>,
    predicate: &MetadataPredicate,
) -> AuditResult<()> {
    let key = predicate.key.trim();
    if key.is_empty() || key.contains('"') {
        return Err(AuditError::ValidationError(format!(
            "invalid metadata key '{}'",
            predicate.key
        )));
    }

    qb.push(" AND json_extract(metadata, ");
    qb.push_bind(format!("$.\"{}\"", key));
    qb.push(") = ");
    match &predicate.value {
        serde_json::Value::String(s) => {
            qb.push_bind(s.clone());
        }
        serde_json::Value::Bool(b) => {
            qb.push_bind(i64::from(*b));
        }
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => {
                qb.push_bind(i);
            }
            None => {
                qb.push_bind(n.as_f64().unwrap_or(f64::NAN));
            }
        },
        other => {
            return Err(AuditError::ValidationError(format!(
                "metadata predicate on '{}' must compare a scalar, got {}",
                key,
                match other {
                    serde_json::Value::Null => "null",
                    serde_json::Value::Array(_) => "array",
                    _ => "object",
                }
            )));
        }
    }
    Ok(())
}

fn push_order(qb: &mut QueryBuilder<'_, Sqlite>, order: SortOrder) {
    let dir = order.sql();
    qb.push(format!(
        " ORDER BY timestamp {dir}, chain_seq {dir}, log_id {dir}",
        dir = dir
    ));
}
