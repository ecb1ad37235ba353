//! Connection-pooled SQL execution against registered data sources.
//!
//! The preview manager only ever sees these traits. An [`OpenTransaction`]
//! pins one pooled connection until `commit` or `rollback` consumes it, so a
//! connection is released exactly once per transaction. Dropping the box
//! without resolving it rolls back.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    /// Rows the statement produced, including those past the sample limit.
    pub rows_returned: u64,
    pub rows_affected: u64,
    pub truncated: bool,
}

impl QueryResult {
    /// Row count that matters for a preview: affected rows for writes,
    /// returned rows for anything that only reads.
    pub fn row_count(&self) -> u64 {
        self.rows_affected.max(self.rows_returned)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("unknown data source {0}")]
    UnknownDataSource(Uuid),

    #[error("statement timed out")]
    Timeout,

    #[error("statement rejected by database: {message}")]
    Statement {
        code: Option<String>,
        message: String,
    },

    #[error("connection failed: {0}")]
    Connection(String),
}

impl ExecError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::PoolExhausted | Self::Timeout | Self::Connection(_))
    }
}

impl From<sqlx::Error> for ExecError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut => Self::PoolExhausted,
            sqlx::Error::Database(db) => {
                // 57014 query_canceled covers statement_timeout.
                if db.code().as_deref() == Some("57014") {
                    return Self::Timeout;
                }
                Self::Statement {
                    code: db.code().map(|c| c.into_owned()),
                    message: db.message().to_string(),
                }
            }
            other => Self::Connection(other.to_string()),
        }
    }
}

#[async_trait]
pub trait DataSourceExecutor: Send + Sync {
    /// Fail fast if the data source is not registered.
    async fn ensure_data_source(&self, data_source_id: Uuid) -> Result<(), ExecError>;

    /// Run a statement inside a read-only transaction that is always rolled
    /// back. At most `max_rows` rows are kept; all are counted.
    async fn query_read_only(
        &self,
        data_source_id: Uuid,
        sql: &str,
        max_rows: usize,
    ) -> Result<QueryResult, ExecError>;

    /// Check out a connection and begin a read-write transaction on it.
    async fn begin(&self, data_source_id: Uuid) -> Result<Box<dyn OpenTransaction>, ExecError>;
}

#[async_trait]
pub trait OpenTransaction: Send {
    async fn execute(&mut self, sql: &str, max_rows: usize) -> Result<QueryResult, ExecError>;

    async fn commit(self: Box<Self>) -> Result<(), ExecError>;

    async fn rollback(self: Box<Self>) -> Result<(), ExecError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_count_prefers_larger_count() {
        let read = QueryResult {
            rows_returned: 12,
            ..Default::default()
        };
        assert_eq!(read.row_count(), 12);
        let write = QueryResult {
            rows_affected: 3,
            ..Default::default()
        };
        assert_eq!(write.row_count(), 3);
    }

    #[test]
    fn test_pool_timeout_maps_to_exhausted() {
        let err: ExecError = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err, ExecError::PoolExhausted);
        assert!(err.is_transient());
        let err: ExecError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, ExecError::Connection(_)));
    }
}
