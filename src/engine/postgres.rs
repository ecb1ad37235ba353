use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::TryStreamExt;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, Either, Executor, PgPool, Postgres, Row, Transaction, TypeInfo};
use uuid::Uuid;

use super::executor::{DataSourceExecutor, ExecError, OpenTransaction, QueryResult};
use crate::store::postgres::PgStore;

/// Executes against registered Postgres data sources, one lazily built pool each.
pub struct PgExecutor {
    catalog: PgStore,
    pools: DashMap<Uuid, PgPool>,
    acquire_timeout: Duration,
    /// Server-side backstop for previews the sweep somehow misses.
    idle_session_timeout: Duration,
}

impl PgExecutor {
    pub fn new(catalog: PgStore, acquire_timeout: Duration, preview_ceiling: Duration) -> Self {
        Self {
            catalog,
            pools: DashMap::new(),
            acquire_timeout,
            idle_session_timeout: preview_ceiling + Duration::from_secs(30),
        }
    }

    async fn pool(&self, data_source_id: Uuid) -> Result<PgPool, ExecError> {
        if let Some(pool) = self.pools.get(&data_source_id) {
            return Ok(pool.clone());
        }

        let ds = self
            .catalog
            .get_data_source(data_source_id)
            .await
            .map_err(|e| ExecError::Connection(e.to_string()))?
            .ok_or(ExecError::UnknownDataSource(data_source_id))?;

        let pool = PgPoolOptions::new()
            .max_connections(ds.max_connections.max(1) as u32)
            .acquire_timeout(self.acquire_timeout)
            .connect_lazy(&ds.dsn)?;

        tracing::info!(data_source = %ds.name, id = %ds.id, "created data source pool");
        Ok(self.pools.entry(data_source_id).or_insert(pool).clone())
    }
}

#[async_trait]
impl DataSourceExecutor for PgExecutor {
    async fn ensure_data_source(&self, data_source_id: Uuid) -> Result<(), ExecError> {
        self.pool(data_source_id).await.map(|_| ())
    }

    async fn query_read_only(
        &self,
        data_source_id: Uuid,
        sql: &str,
        max_rows: usize,
    ) -> Result<QueryResult, ExecError> {
        let pool = self.pool(data_source_id).await?;
        let mut tx = pool.begin().await?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await?;
        pin_literal_syntax(&mut tx).await?;
        let result = run(&mut tx, sql, max_rows).await;
        // Nothing to keep either way.
        if let Err(e) = tx.rollback().await {
            tracing::warn!(error = %e, "read-only rollback failed");
        }
        result
    }

    async fn begin(&self, data_source_id: Uuid) -> Result<Box<dyn OpenTransaction>, ExecError> {
        let pool = self.pool(data_source_id).await?;
        let mut tx = pool.begin().await?;
        let timeout_ms = self.idle_session_timeout.as_millis();
        sqlx::query(&format!(
            "SET LOCAL idle_in_transaction_session_timeout = {timeout_ms}"
        ))
        .execute(&mut *tx)
        .await?;
        pin_literal_syntax(&mut tx).await?;
        Ok(Box::new(PgPreviewTx { tx }))
    }
}

struct PgPreviewTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl OpenTransaction for PgPreviewTx {
    async fn execute(&mut self, sql: &str, max_rows: usize) -> Result<QueryResult, ExecError> {
        run(&mut self.tx, sql, max_rows).await
    }

    async fn commit(self: Box<Self>) -> Result<(), ExecError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), ExecError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// Statement checks assume backslashes are literal in ordinary strings.
async fn pin_literal_syntax(tx: &mut Transaction<'static, Postgres>) -> Result<(), ExecError> {
    sqlx::query("SET LOCAL standard_conforming_strings = on")
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Run one statement over the simple query protocol, keeping the first
/// `max_rows` rows and counting the rest.
async fn run(
    tx: &mut Transaction<'static, Postgres>,
    sql: &str,
    max_rows: usize,
) -> Result<QueryResult, ExecError> {
    let mut result = QueryResult::default();
    let mut stream = (&mut **tx).fetch_many(sql);

    while let Some(item) = stream.try_next().await? {
        match item {
            Either::Left(done) => result.rows_affected += done.rows_affected(),
            Either::Right(row) => {
                if result.columns.is_empty() {
                    result.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                }
                result.rows_returned += 1;
                if result.rows.len() < max_rows {
                    result.rows.push(row_to_json(&row));
                } else {
                    result.truncated = true;
                }
            }
        }
    }

    Ok(result)
}

fn row_to_json(row: &PgRow) -> Vec<serde_json::Value> {
    row.columns()
        .iter()
        .map(|col| cell_to_json(row, col.ordinal(), col.type_info().name()))
        .collect()
}

fn cell_to_json(row: &PgRow, idx: usize, type_name: &str) -> serde_json::Value {
    use serde_json::Value;

    fn get<'r, T>(row: &'r PgRow, idx: usize) -> Option<T>
    where
        T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
    {
        row.try_get::<Option<T>, _>(idx).ok().flatten()
    }

    let value = match type_name {
        "BOOL" => get::<bool>(row, idx).map(Value::Bool),
        "INT2" => get::<i16>(row, idx).map(|v| Value::from(i64::from(v))),
        "INT4" => get::<i32>(row, idx).map(|v| Value::from(i64::from(v))),
        "INT8" => get::<i64>(row, idx).map(Value::from),
        "FLOAT4" => get::<f32>(row, idx)
            .and_then(|v| serde_json::Number::from_f64(v as f64))
            .map(Value::Number),
        "FLOAT8" => get::<f64>(row, idx)
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        // Keep full precision; JSON numbers would round.
        "NUMERIC" => get::<rust_decimal::Decimal>(row, idx).map(|d| Value::String(d.to_string())),
        "UUID" => get::<Uuid>(row, idx).map(|u| Value::String(u.to_string())),
        "TIMESTAMPTZ" => get::<chrono::DateTime<chrono::Utc>>(row, idx)
            .map(|t| Value::String(t.to_rfc3339())),
        "TIMESTAMP" => get::<chrono::NaiveDateTime>(row, idx)
            .map(|t| Value::String(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        "DATE" => get::<chrono::NaiveDate>(row, idx).map(|d| Value::String(d.to_string())),
        "JSON" | "JSONB" => get::<serde_json::Value>(row, idx),
        _ => None,
    };

    match value {
        Some(v) => v,
        // Text format decodes to its display form for any type.
        None => row
            .try_get_unchecked::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}
