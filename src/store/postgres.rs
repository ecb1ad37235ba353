use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::{ApprovalStore, PreviewRecorder, ReviewOutcome, StoreError};
use crate::models::{
    ApprovalPolicy, ApprovalRequest, ApprovalReview, ApprovalStatus, DataSource, NewDataSource,
    PreviewSnapshot, PreviewStatus, PreviewTransaction, Statement,
};
use crate::sql::OperationKind;

const REQUEST_COLUMNS: &str = "id, statement, data_source_id, submitted_by, operation, status, \
     rejection_reason, decided_by, decided_at, created_at";

const PREVIEW_COLUMNS: &str = "id, approval_id, data_source_id, statement, operation, opened_by, \
     status, preview, error, opened_at, closed_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // -- Data Source Operations --

    pub async fn create_data_source(&self, ds: &NewDataSource) -> anyhow::Result<DataSource> {
        let row = sqlx::query_as::<_, DataSource>(
            r#"INSERT INTO data_sources (name, dsn, max_connections)
               VALUES ($1, $2, $3)
               RETURNING id, name, dsn, max_connections, created_at"#,
        )
        .bind(&ds.name)
        .bind(&ds.dsn)
        .bind(ds.max_connections)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_data_source(&self, id: Uuid) -> anyhow::Result<Option<DataSource>> {
        let row = sqlx::query_as::<_, DataSource>(
            "SELECT id, name, dsn, max_connections, created_at FROM data_sources WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_data_sources(&self) -> anyhow::Result<Vec<DataSource>> {
        let rows = sqlx::query_as::<_, DataSource>(
            "SELECT id, name, dsn, max_connections, created_at FROM data_sources ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

// -- Approval Operations --

#[async_trait]
impl ApprovalStore for PgStore {
    async fn create_request(&self, statement: Statement) -> Result<ApprovalRequest, StoreError> {
        let row = sqlx::query_as::<_, ApprovalRequest>(&format!(
            r#"INSERT INTO approval_requests (statement, data_source_id, submitted_by, operation)
               VALUES ($1, $2, $3, $4)
               RETURNING {REQUEST_COLUMNS}"#
        ))
        .bind(&statement.text)
        .bind(statement.data_source_id)
        .bind(&statement.submitted_by)
        .bind(statement.operation)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("create_request insert failed: {:?}", e);
            e
        })?;
        Ok(row)
    }

    async fn get_request(&self, id: Uuid) -> Result<Option<ApprovalRequest>, StoreError> {
        let row = sqlx::query_as::<_, ApprovalRequest>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM approval_requests WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_requests(
        &self,
        status: Option<ApprovalStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ApprovalRequest>, StoreError> {
        let rows = sqlx::query_as::<_, ApprovalRequest>(&format!(
            r#"SELECT {REQUEST_COLUMNS} FROM approval_requests
               WHERE ($1::varchar IS NULL OR status = $1)
               ORDER BY created_at DESC
               LIMIT $2 OFFSET $3"#
        ))
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_reviews(&self, request_id: Uuid) -> Result<Vec<ApprovalReview>, StoreError> {
        let rows = sqlx::query_as::<_, ApprovalReview>(
            r#"SELECT request_id, reviewer_id, decision, comment, created_at
               FROM approval_reviews WHERE request_id = $1 ORDER BY created_at ASC"#,
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn apply_review(
        &self,
        review: ApprovalReview,
        policy: &ApprovalPolicy,
    ) -> Result<ReviewOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes concurrent reviewers of the same request.
        let request = sqlx::query_as::<_, ApprovalRequest>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM approval_requests WHERE id = $1 FOR UPDATE"
        ))
        .bind(review.request_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound(review.request_id))?;

        if request.status.is_terminal() {
            return Err(StoreError::AlreadyDecided(request.status));
        }

        let inserted = sqlx::query(
            r#"INSERT INTO approval_reviews (request_id, reviewer_id, decision, comment, created_at)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (request_id, reviewer_id) DO NOTHING"#,
        )
        .bind(review.request_id)
        .bind(&review.reviewer_id)
        .bind(review.decision)
        .bind(&review.comment)
        .bind(review.created_at)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(StoreError::DuplicateReview);
        }

        let reviews = sqlx::query_as::<_, ApprovalReview>(
            r#"SELECT request_id, reviewer_id, decision, comment, created_at
               FROM approval_reviews WHERE request_id = $1"#,
        )
        .bind(review.request_id)
        .fetch_all(&mut *tx)
        .await?;

        let Some(status) = policy.evaluate(&reviews) else {
            tx.commit().await?;
            return Ok(ReviewOutcome {
                request,
                transitioned: false,
            });
        };

        let reason = match status {
            ApprovalStatus::Rejected => review.comment.clone(),
            _ => None,
        };
        let updated = sqlx::query_as::<_, ApprovalRequest>(&format!(
            r#"UPDATE approval_requests
               SET status = $1, decided_by = $2, decided_at = NOW(), rejection_reason = $3
               WHERE id = $4 AND status = 'pending'
               RETURNING {REQUEST_COLUMNS}"#
        ))
        .bind(status)
        .bind(&review.reviewer_id)
        .bind(reason)
        .bind(review.request_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ReviewOutcome {
            request: updated,
            transitioned: true,
        })
    }
}

// -- Preview Operations --

#[derive(sqlx::FromRow)]
struct PreviewRow {
    id: Uuid,
    approval_id: Uuid,
    data_source_id: Uuid,
    statement: String,
    operation: OperationKind,
    opened_by: String,
    status: PreviewStatus,
    preview: Option<Json<PreviewSnapshot>>,
    error: Option<String>,
    opened_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
}

impl From<PreviewRow> for PreviewTransaction {
    fn from(row: PreviewRow) -> Self {
        Self {
            id: row.id,
            approval_id: row.approval_id,
            data_source_id: row.data_source_id,
            statement: row.statement,
            operation: row.operation,
            opened_by: row.opened_by,
            status: row.status,
            preview: row.preview.map(|j| j.0),
            error: row.error,
            opened_at: row.opened_at,
            closed_at: row.closed_at,
        }
    }
}

#[async_trait]
impl PreviewRecorder for PgStore {
    async fn record(&self, p: &PreviewTransaction) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO preview_transactions
                 (id, approval_id, data_source_id, statement, operation, opened_by,
                  status, preview, error, opened_at, closed_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
               ON CONFLICT (id) DO UPDATE SET
                 status = EXCLUDED.status,
                 preview = EXCLUDED.preview,
                 error = EXCLUDED.error,
                 closed_at = EXCLUDED.closed_at"#,
        )
        .bind(p.id)
        .bind(p.approval_id)
        .bind(p.data_source_id)
        .bind(&p.statement)
        .bind(p.operation)
        .bind(&p.opened_by)
        .bind(p.status)
        .bind(p.preview.as_ref().map(Json))
        .bind(&p.error)
        .bind(p.opened_at)
        .bind(p.closed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest(&self, approval_id: Uuid) -> Result<Option<PreviewTransaction>, StoreError> {
        let row = sqlx::query_as::<_, PreviewRow>(&format!(
            r#"SELECT {PREVIEW_COLUMNS} FROM preview_transactions
               WHERE approval_id = $1 ORDER BY opened_at DESC LIMIT 1"#
        ))
        .bind(approval_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn mark_orphaned(&self, reason: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"UPDATE preview_transactions
               SET status = 'failed', error = $1, closed_at = NOW()
               WHERE status = 'active'"#,
        )
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
