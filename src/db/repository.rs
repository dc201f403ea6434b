//! Generic bulk operations over a table-name + row-converter pair.
//!
//! Repositories for concrete tables implement [`TableRecord`]; the
//! primitives here build chunked multi-VALUES statements with positional
//! binds. Table, column, and operator tokens are validated before they are
//! interpolated — only values travel as bind parameters.

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgArguments, PgPool, PgRow, Postgres};
use sqlx::query::Query;
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Postgres caps bind parameters per statement at u16::MAX; chunks shrink
/// to stay under it.
const PG_BIND_LIMIT: usize = 65_535;

/// A value bound into a statement.
#[derive(Debug, Clone)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
    Json(serde_json::Value),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}
impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}
impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}
impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}
impl From<Decimal> for SqlValue {
    fn from(v: Decimal) -> Self {
        SqlValue::Decimal(v)
    }
}
impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}
impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(v)
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q SqlValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        SqlValue::Null => query.bind(Option::<String>::None),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::Decimal(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.as_str()),
        SqlValue::Timestamp(v) => query.bind(*v),
        SqlValue::Uuid(v) => query.bind(*v),
        SqlValue::Json(v) => query.bind(v.clone()),
    }
}

/// A filter on one column: plain equality or an explicit operator.
#[derive(Debug, Clone)]
pub enum Condition {
    Eq(SqlValue),
    Op { op: String, value: SqlValue },
}

const ALLOWED_OPS: &[&str] = &["=", "!=", "<>", "<", ">", "<=", ">=", "LIKE", "ILIKE"];

fn ensure_ident(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .enumerate()
            .all(|(i, c)| c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit()));
    if ok {
        Ok(())
    } else {
        Err(CoreError::InvalidInput(format!(
            "unsafe SQL identifier '{name}'"
        )))
    }
}

fn ensure_op(op: &str) -> Result<()> {
    if ALLOWED_OPS.contains(&op) {
        Ok(())
    } else {
        Err(CoreError::InvalidInput(format!(
            "unsupported SQL operator '{op}'"
        )))
    }
}

/// Conversion between a model and its table row.
pub trait TableRecord: Sized + Send + Sync {
    const TABLE: &'static str;

    /// Insert column list, in the order [`TableRecord::values`] produces.
    fn columns() -> &'static [&'static str];

    fn values(&self) -> Vec<SqlValue>;

    fn from_row(row: &PgRow) -> sqlx::Result<Self>;
}

/// One entry of a bulk update: `SET set... WHERE filter...` (filters are
/// equality matches).
#[derive(Debug, Clone)]
pub struct BulkUpdate {
    pub filter: Vec<(String, SqlValue)>,
    pub set: Vec<(String, SqlValue)>,
}

pub struct Repository<T: TableRecord> {
    pool: PgPool,
    _marker: PhantomData<T>,
}

impl<T: TableRecord> Repository<T> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _marker: PhantomData,
        }
    }

    fn validated_columns() -> Result<&'static [&'static str]> {
        ensure_ident(T::TABLE)?;
        for column in T::columns() {
            ensure_ident(column)?;
        }
        Ok(T::columns())
    }

    /// Chunked multi-VALUES insert. `on_conflict` is appended verbatim
    /// (e.g. `ON CONFLICT (id) DO NOTHING`). Returns rows affected.
    pub async fn bulk_insert(
        &self,
        rows: &[T],
        on_conflict: Option<&str>,
        chunk_size: usize,
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let columns = Self::validated_columns()?;
        let chunk_size = effective_chunk_size(chunk_size, columns.len());

        let started = std::time::Instant::now();
        let mut affected = 0u64;
        for chunk in rows.chunks(chunk_size) {
            let sql = build_insert_sql(T::TABLE, columns, chunk.len(), on_conflict, None);
            let values: Vec<SqlValue> = chunk.iter().flat_map(|row| row.values()).collect();

            let mut query = sqlx::query(&sql);
            for value in &values {
                query = bind_value(query, value);
            }
            let result = query
                .execute(&self.pool)
                .await
                .map_err(CoreError::from_sqlx)?;
            affected += result.rows_affected();
        }

        info!(
            table = T::TABLE,
            rows = rows.len(),
            affected,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "bulk insert"
        );
        Ok(affected)
    }

    /// Like [`Repository::bulk_insert`] but collects `RETURNING {id_column}`
    /// values. With an `ON CONFLICT ... DO NOTHING` clause the skipped rows
    /// return no id, which is how callers detect conflicts.
    pub async fn bulk_insert_returning_ids(
        &self,
        rows: &[T],
        on_conflict: Option<&str>,
        chunk_size: usize,
        id_column: &str,
    ) -> Result<Vec<i64>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let columns = Self::validated_columns()?;
        ensure_ident(id_column)?;
        let chunk_size = effective_chunk_size(chunk_size, columns.len());

        let mut ids = Vec::with_capacity(rows.len());
        for chunk in rows.chunks(chunk_size) {
            let sql =
                build_insert_sql(T::TABLE, columns, chunk.len(), on_conflict, Some(id_column));
            let values: Vec<SqlValue> = chunk.iter().flat_map(|row| row.values()).collect();

            let mut query = sqlx::query(&sql);
            for value in &values {
                query = bind_value(query, value);
            }
            let returned = query
                .fetch_all(&self.pool)
                .await
                .map_err(CoreError::from_sqlx)?;
            for row in &returned {
                ids.push(row.try_get::<i64, _>(0).map_err(CoreError::from_sqlx)?);
            }
        }
        Ok(ids)
    }

    /// Per-row updates executed in chunks, each chunk inside its own
    /// transaction. Returns total rows affected.
    pub async fn bulk_update(&self, updates: &[BulkUpdate], chunk_size: usize) -> Result<u64> {
        if updates.is_empty() {
            return Ok(0);
        }
        ensure_ident(T::TABLE)?;
        for update in updates {
            for (column, _) in update.set.iter().chain(update.filter.iter()) {
                ensure_ident(column)?;
            }
            if update.set.is_empty() || update.filter.is_empty() {
                return Err(CoreError::InvalidInput(
                    "bulk update entries need both SET and WHERE columns".into(),
                ));
            }
        }

        let chunk_size = chunk_size.max(1);
        let mut affected = 0u64;

        for chunk in updates.chunks(chunk_size) {
            let mut conn = self.pool.acquire().await.map_err(CoreError::from_sqlx)?;
            sqlx::query("BEGIN")
                .execute(&mut *conn)
                .await
                .map_err(CoreError::from_sqlx)?;

            let chunk_result: Result<u64> = async {
                let mut chunk_affected = 0u64;
                for update in chunk {
                    let set_columns: Vec<&str> =
                        update.set.iter().map(|(c, _)| c.as_str()).collect();
                    let where_columns: Vec<&str> =
                        update.filter.iter().map(|(c, _)| c.as_str()).collect();
                    let sql = build_update_sql(T::TABLE, &set_columns, &where_columns);

                    let values: Vec<&SqlValue> = update
                        .set
                        .iter()
                        .map(|(_, v)| v)
                        .chain(update.filter.iter().map(|(_, v)| v))
                        .collect();
                    let mut query = sqlx::query(&sql);
                    for value in values {
                        query = bind_value(query, value);
                    }
                    let result = query
                        .execute(&mut *conn)
                        .await
                        .map_err(CoreError::from_sqlx)?;
                    chunk_affected += result.rows_affected();
                }
                Ok(chunk_affected)
            }
            .await;

            match chunk_result {
                Ok(chunk_affected) => {
                    sqlx::query("COMMIT")
                        .execute(&mut *conn)
                        .await
                        .map_err(CoreError::from_sqlx)?;
                    affected += chunk_affected;
                }
                Err(e) => {
                    let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                    return Err(e);
                }
            }
        }

        debug!(table = T::TABLE, affected, "bulk update");
        Ok(affected)
    }

    /// Delete rows matching any of the condition groups (groups are OR-ed,
    /// conditions within a group AND-ed). Returns rows deleted.
    pub async fn bulk_delete(&self, conditions: &[Vec<(String, Condition)>]) -> Result<u64> {
        let groups: Vec<&Vec<(String, Condition)>> =
            conditions.iter().filter(|g| !g.is_empty()).collect();
        if groups.is_empty() {
            return Ok(0);
        }
        ensure_ident(T::TABLE)?;

        let mut flat_values: Vec<&SqlValue> = Vec::new();
        let mut group_sql: Vec<String> = Vec::new();
        let mut param = 1usize;
        for group in &groups {
            let mut parts: Vec<String> = Vec::with_capacity(group.len());
            for (column, condition) in group.iter() {
                ensure_ident(column)?;
                let (op, value) = match condition {
                    Condition::Eq(value) => ("=", value),
                    Condition::Op { op, value } => {
                        ensure_op(op)?;
                        (op.as_str(), value)
                    }
                };
                parts.push(format!("{column} {op} ${param}"));
                flat_values.push(value);
                param += 1;
            }
            group_sql.push(format!("({})", parts.join(" AND ")));
        }

        let sql = format!(
            "DELETE FROM {} WHERE {}",
            T::TABLE,
            group_sql.join(" OR ")
        );
        let mut query = sqlx::query(&sql);
        for value in flat_values {
            query = bind_value(query, value);
        }
        let result = query
            .execute(&self.pool)
            .await
            .map_err(CoreError::from_sqlx)?;

        debug!(table = T::TABLE, deleted = result.rows_affected(), "bulk delete");
        Ok(result.rows_affected())
    }

    /// Insert-or-update on `conflict_columns`. `update_columns` defaults to
    /// every non-conflict column.
    pub async fn bulk_upsert(
        &self,
        rows: &[T],
        conflict_columns: &[&str],
        update_columns: Option<&[&str]>,
        chunk_size: usize,
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        if conflict_columns.is_empty() {
            return Err(CoreError::InvalidInput(
                "bulk upsert needs at least one conflict column".into(),
            ));
        }
        for column in conflict_columns.iter().chain(update_columns.unwrap_or(&[])) {
            ensure_ident(column)?;
        }

        let on_conflict =
            build_conflict_clause(T::columns(), conflict_columns, update_columns)?;
        self.bulk_insert(rows, Some(&on_conflict), chunk_size).await
    }

    pub async fn count(&self, conditions: &[(String, Condition)]) -> Result<i64> {
        ensure_ident(T::TABLE)?;
        let (clause, values) = build_condition_clause(conditions)?;
        let sql = match clause {
            Some(clause) => format!("SELECT COUNT(*) FROM {} WHERE {clause}", T::TABLE),
            None => format!("SELECT COUNT(*) FROM {}", T::TABLE),
        };

        let mut query = sqlx::query(&sql);
        for value in values {
            query = bind_value(query, value);
        }
        let row = query
            .fetch_one(&self.pool)
            .await
            .map_err(CoreError::from_sqlx)?;
        row.try_get::<i64, _>(0).map_err(CoreError::from_sqlx)
    }

    pub async fn exists(&self, conditions: &[(String, Condition)]) -> Result<bool> {
        ensure_ident(T::TABLE)?;
        let (clause, values) = build_condition_clause(conditions)?;
        let sql = match clause {
            Some(clause) => format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE {clause})",
                T::TABLE
            ),
            None => format!("SELECT EXISTS(SELECT 1 FROM {})", T::TABLE),
        };

        let mut query = sqlx::query(&sql);
        for value in values {
            query = bind_value(query, value);
        }
        let row = query
            .fetch_one(&self.pool)
            .await
            .map_err(CoreError::from_sqlx)?;
        row.try_get::<bool, _>(0).map_err(CoreError::from_sqlx)
    }

    pub async fn batch_by_int_ids(&self, ids: &[i64], id_column: &str) -> Result<Vec<T>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        ensure_ident(T::TABLE)?;
        ensure_ident(id_column)?;

        let sql = format!("SELECT * FROM {} WHERE {id_column} = ANY($1)", T::TABLE);
        let rows = sqlx::query(&sql)
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(CoreError::from_sqlx)?;
        rows.iter()
            .map(|row| T::from_row(row).map_err(CoreError::from_sqlx))
            .collect()
    }

    pub async fn batch_by_text_ids(&self, ids: &[String], id_column: &str) -> Result<Vec<T>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        ensure_ident(T::TABLE)?;
        ensure_ident(id_column)?;

        let sql = format!("SELECT * FROM {} WHERE {id_column} = ANY($1)", T::TABLE);
        let rows = sqlx::query(&sql)
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(CoreError::from_sqlx)?;
        rows.iter()
            .map(|row| T::from_row(row).map_err(CoreError::from_sqlx))
            .collect()
    }
}

fn effective_chunk_size(requested: usize, column_count: usize) -> usize {
    let cap = PG_BIND_LIMIT / column_count.max(1);
    requested.clamp(1, cap.max(1))
}

fn build_insert_sql(
    table: &str,
    columns: &[&str],
    row_count: usize,
    on_conflict: Option<&str>,
    returning: Option<&str>,
) -> String {
    let mut placeholders = Vec::with_capacity(row_count);
    let mut param = 1usize;
    for _ in 0..row_count {
        let row: Vec<String> = (0..columns.len())
            .map(|_| {
                let p = format!("${param}");
                param += 1;
                p
            })
            .collect();
        placeholders.push(format!("({})", row.join(",")));
    }

    let mut sql = format!(
        "INSERT INTO {table} ({}) VALUES {}",
        columns.join(","),
        placeholders.join(",")
    );
    if let Some(clause) = on_conflict {
        sql.push(' ');
        sql.push_str(clause);
    }
    if let Some(column) = returning {
        sql.push_str(&format!(" RETURNING {column}"));
    }
    sql
}

fn build_update_sql(table: &str, set_columns: &[&str], where_columns: &[&str]) -> String {
    let mut param = 1usize;
    let set: Vec<String> = set_columns
        .iter()
        .map(|c| {
            let part = format!("{c} = ${param}");
            param += 1;
            part
        })
        .collect();
    let filter: Vec<String> = where_columns
        .iter()
        .map(|c| {
            let part = format!("{c} = ${param}");
            param += 1;
            part
        })
        .collect();
    format!(
        "UPDATE {table} SET {} WHERE {}",
        set.join(", "),
        filter.join(" AND ")
    )
}

fn build_conflict_clause(
    all_columns: &[&str],
    conflict_columns: &[&str],
    update_columns: Option<&[&str]>,
) -> Result<String> {
    let updates: Vec<&str> = match update_columns {
        Some(columns) => columns.to_vec(),
        None => all_columns
            .iter()
            .filter(|c| !conflict_columns.contains(c))
            .copied()
            .collect(),
    };
    if updates.is_empty() {
        return Err(CoreError::InvalidInput(
            "upsert has no columns left to update".into(),
        ));
    }

    let assignments: Vec<String> = updates
        .iter()
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect();
    Ok(format!(
        "ON CONFLICT ({}) DO UPDATE SET {}",
        conflict_columns.join(","),
        assignments.join(", ")
    ))
}

type ConditionClause<'a> = (Option<String>, Vec<&'a SqlValue>);

fn build_condition_clause(conditions: &[(String, Condition)]) -> Result<ConditionClause<'_>> {
    if conditions.is_empty() {
        return Ok((None, Vec::new()));
    }

    let mut parts = Vec::with_capacity(conditions.len());
    let mut values = Vec::with_capacity(conditions.len());
    for (i, (column, condition)) in conditions.iter().enumerate() {
        ensure_ident(column)?;
        let (op, value) = match condition {
            Condition::Eq(value) => ("=", value),
            Condition::Op { op, value } => {
                ensure_op(op)?;
                (op.as_str(), value)
            }
        };
        parts.push(format!("{column} {op} ${}", i + 1));
        values.push(value);
    }
    Ok((Some(parts.join(" AND ")), values))
}
