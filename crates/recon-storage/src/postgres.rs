//! Postgres-backed stores. Rows travel as `jsonb` so the same code serves every entity table.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use recon_core::{
    field_map_from_json, field_map_to_json, AggregatedStatistic, DownstreamRow, FieldMap, Key,
    KeyRange, RelationTable, SourceTable, StatisticsTable, StoreError, TargetTable, UpstreamRecord,
    WindowStats,
};
use serde_json::json;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use tracing::debug;

use crate::{decode_record, decode_row, DownstreamStore, DownstreamTx, RecordPredicate, UpstreamReader};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

pub async fn connect_pool(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .map_err(db)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|err| StoreError::Backend(format!("migrations failed: {err}")))
}

/// Maps driver errors onto store errors; transient ones come back retryable.
pub fn classify_sqlx_error(err: &sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            let message = db_err.message().to_string();
            match code.as_str() {
                // serialization_failure, deadlock_detected, lock_not_available
                "40001" | "40P01" | "55P03" => StoreError::Conflict(message),
                "42P01" => StoreError::UnknownTable(message),
                "53300" => StoreError::Unavailable(message),
                c if c.starts_with("08") || c.starts_with("57P") => StoreError::Unavailable(message),
                _ => StoreError::Backend(message),
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. } => StoreError::Decode(err.to_string()),
        _ => StoreError::Backend(err.to_string()),
    }
}

fn db(err: sqlx::Error) -> StoreError {
    classify_sqlx_error(&err)
}

fn valid_ident_part(part: &str) -> bool {
    let mut chars = part.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    part.len() <= 63
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Quotes a table or column name, optionally schema-qualified.
pub fn quote_ident(name: &str) -> Result<String, StoreError> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 || !parts.iter().all(|p| valid_ident_part(p)) {
        return Err(StoreError::InvalidIdentifier(name.to_string()));
    }
    Ok(parts
        .iter()
        .map(|p| format!("\"{p}\""))
        .collect::<Vec<_>>()
        .join("."))
}

/// Delete-range and insert statements for a statistics table, plus the delete's binds.
fn statistics_sql(
    target: &StatisticsTable,
    range: KeyRange,
) -> Result<(String, String, Vec<i64>), StoreError> {
    let table = quote_ident(&target.table)?;
    let fact = quote_ident(&target.fact_field)?;
    let object = quote_ident(&target.object_field)?;
    let (clause, binds) = range_clause(&fact, range, 1);
    let delete = format!("DELETE FROM {table} {clause}");
    let columns = format!(
        "{fact}, characteristic, {object}, applicant_count, total_applicants, ratio, updated_at"
    );
    let insert = format!(
        "INSERT INTO {table} ({columns}) \
         SELECT {columns} FROM jsonb_populate_recordset(NULL::{table}, $1)"
    );
    Ok((delete, insert, binds))
}

fn statistics_payload(target: &StatisticsTable, stats: &[AggregatedStatistic]) -> Vec<serde_json::Value> {
    stats
        .iter()
        .map(|stat| {
            let mut row = json!({
                "characteristic": stat.characteristic,
                "applicant_count": stat.count,
                "total_applicants": stat.total,
                "ratio": stat.ratio.to_string(),
                "updated_at": stat.updated_at.map(|ts| ts.to_rfc3339()),
            });
            row[target.fact_field.as_str()] = json!(stat.fact_key);
            row[target.object_field.as_str()] = json!(stat.object_key);
            row
        })
        .collect()
}

/// `WHERE` clause over an inclusive range, with the bind values in placeholder order.
fn range_clause(column: &str, range: KeyRange, first_placeholder: usize) -> (String, Vec<i64>) {
    let mut conditions = Vec::new();
    let mut binds = Vec::new();
    if let Some(start) = range.start {
        binds.push(start);
        conditions.push(format!("{column} >= ${}", first_placeholder + binds.len() - 1));
    }
    if let Some(end) = range.end {
        binds.push(end);
        conditions.push(format!("{column} <= ${}", first_placeholder + binds.len() - 1));
    }
    if conditions.is_empty() {
        (String::new(), binds)
    } else {
        (format!("WHERE {}", conditions.join(" AND ")), binds)
    }
}

async fn select_json_rows(
    conn: &mut PgConnection,
    table: &str,
    filter_column: &str,
    order_by: &[&str],
    range: KeyRange,
    lock: bool,
) -> Result<Vec<FieldMap>, StoreError> {
    let table = quote_ident(table)?;
    let filter = format!("t.{}", quote_ident(filter_column)?);
    let order = order_by
        .iter()
        .map(|c| quote_ident(c).map(|q| format!("t.{q}")))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");
    let (clause, binds) = range_clause(&filter, range, 1);
    let sql = format!(
        "SELECT row_to_json(t)::jsonb AS row FROM {table} t {clause} ORDER BY {order}{}",
        if lock { " FOR UPDATE" } else { "" }
    );

    let mut query = sqlx::query(&sql);
    for bind in binds {
        query = query.bind(bind);
    }
    let rows = query.fetch_all(&mut *conn).await.map_err(db)?;

    rows.into_iter()
        .map(|row| {
            let json: serde_json::Value = row.try_get("row").map_err(db)?;
            field_map_from_json(&json)
                .ok_or_else(|| StoreError::Decode(format!("{table}: row is not an object")))
        })
        .collect()
}

async fn select_window_stats(
    conn: &mut PgConnection,
    table: &str,
    key_field: &str,
    bucket_size: i64,
) -> Result<Vec<WindowStats>, StoreError> {
    let table = quote_ident(table)?;
    let key = quote_ident(key_field)?;
    let sql = format!(
        "SELECT floor(t.{key}::numeric / $1)::bigint AS bucket_window, \
                min(t.{key})::bigint AS min_key, \
                max(t.{key})::bigint AS max_key, \
                count(*)::bigint AS row_count \
           FROM {table} t \
          GROUP BY 1 \
          ORDER BY 1"
    );
    let rows = sqlx::query(&sql)
        .bind(bucket_size)
        .fetch_all(&mut *conn)
        .await
        .map_err(db)?;

    rows.into_iter()
        .map(|row| {
            let row_count: i64 = row.try_get("row_count").map_err(db)?;
            Ok(WindowStats {
                window: row.try_get("bucket_window").map_err(db)?,
                min_key: row.try_get("min_key").map_err(db)?,
                max_key: row.try_get("max_key").map_err(db)?,
                rows: row_count.max(0) as u64,
            })
        })
        .collect()
}

fn key_payload(field: &str, keys: &[Key]) -> serde_json::Value {
    serde_json::Value::Array(
        keys.iter()
            .map(|key| json!({ field: key.to_value().to_json() }))
            .collect(),
    )
}

#[derive(Debug, Clone)]
pub struct PgUpstreamReader {
    pool: PgPool,
}

impl PgUpstreamReader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UpstreamReader for PgUpstreamReader {
    async fn read(
        &self,
        source: &SourceTable,
        range: KeyRange,
        predicate: RecordPredicate<'_>,
    ) -> Result<Vec<UpstreamRecord>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        let rows = select_json_rows(
            &mut conn,
            &source.table,
            &source.key_field,
            &[source.key_field.as_str()],
            range,
            false,
        )
        .await?;
        let fetched = rows.len();
        let records = rows
            .into_iter()
            .filter(|fields| predicate(fields))
            .map(|fields| decode_record(source, fields))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(table = %source.table, %range, fetched, kept = records.len(), "read upstream range");
        Ok(records)
    }

    async fn read_related(
        &self,
        source: &SourceTable,
        field: &str,
        range: KeyRange,
    ) -> Result<Vec<UpstreamRecord>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        select_json_rows(
            &mut conn,
            &source.table,
            field,
            &[field, source.key_field.as_str()],
            range,
            false,
        )
        .await?
        .into_iter()
        .map(|fields| decode_record(source, fields))
        .collect()
    }

    async fn window_stats(
        &self,
        source: &SourceTable,
        bucket_size: i64,
    ) -> Result<Vec<WindowStats>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        select_window_stats(&mut conn, &source.table, &source.key_field, bucket_size).await
    }
}

#[derive(Debug, Clone)]
pub struct PgDownstreamStore {
    pool: PgPool,
}

impl PgDownstreamStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DownstreamStore for PgDownstreamStore {
    async fn begin(&self) -> Result<Box<dyn DownstreamTx>, StoreError> {
        let tx = self.pool.begin().await.map_err(db)?;
        Ok(Box::new(PgDownstreamTx { tx }))
    }

    async fn read_range(
        &self,
        target: &TargetTable,
        range: KeyRange,
    ) -> Result<Vec<DownstreamRow>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        select_json_rows(
            &mut conn,
            &target.table,
            &target.key_field,
            &[target.key_field.as_str()],
            range,
            false,
        )
        .await?
        .into_iter()
        .map(|fields| decode_row(target, fields))
        .collect()
    }

    async fn window_stats(
        &self,
        target: &TargetTable,
        bucket_size: i64,
    ) -> Result<Vec<WindowStats>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        select_window_stats(&mut conn, &target.table, &target.key_field, bucket_size).await
    }
}

pub struct PgDownstreamTx {
    tx: sqlx::Transaction<'static, sqlx::Postgres>,
}

#[async_trait]
impl DownstreamTx for PgDownstreamTx {
    async fn read_range(
        &mut self,
        target: &TargetTable,
        range: KeyRange,
    ) -> Result<Vec<DownstreamRow>, StoreError> {
        select_json_rows(
            &mut self.tx,
            &target.table,
            &target.key_field,
            &[target.key_field.as_str()],
            range,
            true,
        )
        .await?
        .into_iter()
        .map(|fields| decode_row(target, fields))
        .collect()
    }

    async fn insert_rows(
        &mut self,
        target: &TargetTable,
        rows: &[FieldMap],
    ) -> Result<u64, StoreError> {
        let Some(first) = rows.first() else {
            return Ok(0);
        };
        let table = quote_ident(&target.table)?;
        let columns = first
            .keys()
            .map(|c| quote_ident(c))
            .collect::<Result<Vec<_>, _>>()?
            .join(", ");
        let payload: Vec<serde_json::Value> = rows.iter().map(field_map_to_json).collect();
        let sql = format!(
            "INSERT INTO {table} ({columns}) \
             SELECT {columns} FROM jsonb_populate_recordset(NULL::{table}, $1)"
        );
        let result = sqlx::query(&sql)
            .bind(Json(payload))
            .execute(&mut *self.tx)
            .await
            .map_err(db)?;
        debug!(table = %target.table, rows = result.rows_affected(), "inserted rows");
        Ok(result.rows_affected())
    }

    async fn update_fields(
        &mut self,
        target: &TargetTable,
        rows: &[FieldMap],
        fields: &[String],
    ) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let table = quote_ident(&target.table)?;
        let key = quote_ident(&target.key_field)?;
        let deleted = quote_ident(&target.deleted_field)?;
        let mut assignments = fields
            .iter()
            .map(|f| quote_ident(f).map(|q| format!("{q} = s.{q}")))
            .collect::<Result<Vec<_>, _>>()?;
        assignments.push(format!("{deleted} = false"));
        let payload: Vec<serde_json::Value> = rows.iter().map(field_map_to_json).collect();
        let sql = format!(
            "UPDATE {table} AS t SET {} \
               FROM jsonb_populate_recordset(NULL::{table}, $1) AS s \
              WHERE t.{key} = s.{key}",
            assignments.join(", ")
        );
        let result = sqlx::query(&sql)
            .bind(Json(payload))
            .execute(&mut *self.tx)
            .await
            .map_err(db)?;
        debug!(table = %target.table, rows = result.rows_affected(), "updated rows");
        Ok(result.rows_affected())
    }

    async fn set_soft_deleted(
        &mut self,
        target: &TargetTable,
        keys: &[Key],
        deleted: bool,
    ) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let table = quote_ident(&target.table)?;
        let key = quote_ident(&target.key_field)?;
        let flag = quote_ident(&target.deleted_field)?;
        let sql = format!(
            "UPDATE {table} AS t SET {flag} = $1 \
               FROM jsonb_populate_recordset(NULL::{table}, $2) AS s \
              WHERE t.{key} = s.{key}"
        );
        let result = sqlx::query(&sql)
            .bind(deleted)
            .bind(Json(key_payload(&target.key_field, keys)))
            .execute(&mut *self.tx)
            .await
            .map_err(db)?;
        Ok(result.rows_affected())
    }

    async fn read_memberships(
        &mut self,
        relation: &RelationTable,
        owners: &[Key],
    ) -> Result<BTreeMap<Key, BTreeSet<Key>>, StoreError> {
        let mut out: BTreeMap<Key, BTreeSet<Key>> = BTreeMap::new();
        if owners.is_empty() {
            return Ok(out);
        }
        let table = quote_ident(&relation.table)?;
        let owner = quote_ident(&relation.owner_field)?;
        let sql = format!(
            "SELECT row_to_json(r)::jsonb AS row FROM {table} r \
               JOIN jsonb_populate_recordset(NULL::{table}, $1) AS s ON r.{owner} = s.{owner}"
        );
        let rows = sqlx::query(&sql)
            .bind(Json(key_payload(&relation.owner_field, owners)))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(db)?;
        for row in rows {
            let json: serde_json::Value = row.try_get("row").map_err(db)?;
            let fields = field_map_from_json(&json)
                .ok_or_else(|| StoreError::Decode(format!("{table}: row is not an object")))?;
            let pair = (
                fields.get(&relation.owner_field).and_then(Key::from_value),
                fields.get(&relation.member_field).and_then(Key::from_value),
            );
            let (Some(owner_key), Some(member_key)) = pair else {
                return Err(StoreError::Decode(format!(
                    "{table}: link without owner or member"
                )));
            };
            out.entry(owner_key).or_default().insert(member_key);
        }
        Ok(out)
    }

    async fn replace_memberships(
        &mut self,
        relation: &RelationTable,
        memberships: &BTreeMap<Key, BTreeSet<Key>>,
    ) -> Result<(), StoreError> {
        if memberships.is_empty() {
            return Ok(());
        }
        let table = quote_ident(&relation.table)?;
        let owner = quote_ident(&relation.owner_field)?;
        let member = quote_ident(&relation.member_field)?;
        let owners: Vec<Key> = memberships.keys().cloned().collect();

        let delete = format!(
            "DELETE FROM {table} AS r \
              USING jsonb_populate_recordset(NULL::{table}, $1) AS s \
              WHERE r.{owner} = s.{owner}"
        );
        sqlx::query(&delete)
            .bind(Json(key_payload(&relation.owner_field, &owners)))
            .execute(&mut *self.tx)
            .await
            .map_err(db)?;

        let links: Vec<serde_json::Value> = memberships
            .iter()
            .flat_map(|(owner_key, members)| {
                members.iter().map(move |member_key| {
                    json!({
                        relation.owner_field.as_str(): owner_key.to_value().to_json(),
                        relation.member_field.as_str(): member_key.to_value().to_json(),
                    })
                })
            })
            .collect();
        if links.is_empty() {
            return Ok(());
        }
        let insert = format!(
            "INSERT INTO {table} ({owner}, {member}) \
             SELECT {owner}, {member} FROM jsonb_populate_recordset(NULL::{table}, $1)"
        );
        sqlx::query(&insert)
            .bind(Json(links))
            .execute(&mut *self.tx)
            .await
            .map_err(db)?;
        Ok(())
    }

    async fn replace_statistics(
        &mut self,
        target: &StatisticsTable,
        range: KeyRange,
        stats: &[AggregatedStatistic],
    ) -> Result<u64, StoreError> {
        let (delete, insert, binds) = statistics_sql(target, range)?;
        let mut query = sqlx::query(&delete);
        for bind in binds {
            query = query.bind(bind);
        }
        query.execute(&mut *self.tx).await.map_err(db)?;

        if stats.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(&insert)
            .bind(Json(statistics_payload(target, stats)))
            .execute(&mut *self.tx)
            .await
            .map_err(db)?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let PgDownstreamTx { tx } = *self;
        tx.commit().await.map_err(db)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let PgDownstreamTx { tx } = *self;
        tx.rollback().await.map_err(db)
    }
}
