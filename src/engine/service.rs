use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use super::approval::ApprovalService;
use super::executor::{DataSourceExecutor, QueryResult};
use super::preview::PreviewManager;
use crate::errors::AppError;
use crate::middleware::rbac::{Capability, Identity};
use crate::models::{
    ApprovalRequest, ApprovalReview, ApprovalStatus, PreviewTransaction, ReviewDecision, Statement,
};
use crate::notification::{ApprovalEvent, NotificationSink};
use crate::sql::{self, OperationKind};
use crate::store::ApprovalStore;

/// What happened to a submitted statement.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Submission {
    Executed { result: QueryResult },
    Pending { approval: ApprovalRequest },
}

#[derive(Debug, Serialize)]
pub struct DryRunReport {
    pub select_sql: String,
    pub row_count: u64,
    pub columns: Vec<String>,
    pub sample_rows: Vec<Vec<serde_json::Value>>,
    pub truncated: bool,
}

#[derive(Debug, Serialize)]
pub struct ApprovalDetail {
    #[serde(flatten)]
    pub request: ApprovalRequest,
    pub reviews: Vec<ApprovalReview>,
    pub preview: Option<PreviewTransaction>,
}

#[derive(Debug, Clone)]
pub struct ServiceLimits {
    pub query_max_rows: usize,
    pub request_timeout: Duration,
}

impl Default for ServiceLimits {
    fn default() -> Self {
        Self {
            query_max_rows: 1000,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Entry point for every externally visible operation. Checks capability,
/// classifies and validates, then hands off to the executor, the approval
/// state machine or the preview manager.
#[derive(Clone)]
pub struct QueryService {
    executor: Arc<dyn DataSourceExecutor>,
    store: Arc<dyn ApprovalStore>,
    approvals: ApprovalService,
    previews: PreviewManager,
    notifier: Arc<dyn NotificationSink>,
    limits: ServiceLimits,
}

impl QueryService {
    pub fn new(
        executor: Arc<dyn DataSourceExecutor>,
        store: Arc<dyn ApprovalStore>,
        approvals: ApprovalService,
        previews: PreviewManager,
        notifier: Arc<dyn NotificationSink>,
        limits: ServiceLimits,
    ) -> Self {
        Self {
            executor,
            store,
            approvals,
            previews,
            notifier,
            limits,
        }
    }

    pub fn previews(&self) -> &PreviewManager {
        &self.previews
    }

    pub fn approvals(&self) -> &ApprovalService {
        &self.approvals
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T, AppError>>) -> Result<T, AppError> {
        tokio::time::timeout(self.limits.request_timeout, fut)
            .await
            .map_err(|_| AppError::Timeout)?
    }

    /// Run a read immediately, or queue a mutation for review.
    pub async fn submit(
        &self,
        identity: &Identity,
        sql_text: &str,
        data_source_id: Uuid,
    ) -> Result<Submission, AppError> {
        let kind = sql::classify(sql_text);
        let capability = if kind.is_read_only() {
            Capability::Read
        } else {
            Capability::Write
        };
        identity
            .require(capability, data_source_id)
            .map_err(AppError::Forbidden)?;
        sql::validate(sql_text, kind)?;

        if kind.is_read_only() {
            let result = self
                .bounded(async {
                    self.executor
                        .query_read_only(data_source_id, sql_text, self.limits.query_max_rows)
                        .await
                        .map_err(AppError::from)
                })
                .await?;
            tracing::info!(
                user_id = %identity.user_id,
                %data_source_id,
                rows = result.rows_returned,
                "read executed"
            );
            return Ok(Submission::Executed { result });
        }

        self.executor.ensure_data_source(data_source_id).await?;
        let approval = self
            .store
            .create_request(Statement {
                text: sql_text.to_string(),
                data_source_id,
                submitted_by: identity.user_id.clone(),
                operation: kind,
            })
            .await?;

        tracing::info!(
            approval_id = %approval.id,
            user_id = %identity.user_id,
            operation = %kind,
            statement = %sql::summarize(sql_text, 120),
            "statement queued for approval"
        );
        self.notifier.notify(ApprovalEvent::requested(&approval));
        Ok(Submission::Pending { approval })
    }

    /// JSON plan for a statement. `analyze` executes it, so only reads may use it.
    pub async fn explain(
        &self,
        identity: &Identity,
        sql_text: &str,
        data_source_id: Uuid,
        analyze: bool,
    ) -> Result<serde_json::Value, AppError> {
        identity
            .require(Capability::Read, data_source_id)
            .map_err(AppError::Forbidden)?;
        let kind = sql::classify(sql_text);
        sql::validate(sql_text, kind)?;
        if analyze && !kind.is_read_only() {
            return Err(AppError::Validation(format!(
                "EXPLAIN ANALYZE executes the statement and is not allowed for {} statements",
                kind
            )));
        }
        if sql::scan::scan(sql_text)
            .tokens
            .first()
            .map_or(false, |t| t.is_keyword("EXPLAIN"))
        {
            return Err(AppError::Validation(
                "submit the statement itself, not an EXPLAIN".into(),
            ));
        }

        let body = sql_text.trim().trim_end_matches(';');
        let options = if analyze { "FORMAT JSON, ANALYZE" } else { "FORMAT JSON" };
        let explain = format!("EXPLAIN ({options}) {body}");
        let result = self
            .bounded(async {
                self.executor
                    .query_read_only(data_source_id, &explain, 1)
                    .await
                    .map_err(AppError::from)
            })
            .await?;

        Ok(result
            .rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .unwrap_or(serde_json::Value::Null))
    }

    /// Show what a DELETE would remove without opening a write transaction.
    pub async fn dry_run_delete(
        &self,
        identity: &Identity,
        sql_text: &str,
        data_source_id: Uuid,
    ) -> Result<DryRunReport, AppError> {
        identity
            .require(Capability::Write, data_source_id)
            .map_err(AppError::Forbidden)?;
        let kind = sql::classify(sql_text);
        if kind != OperationKind::Delete {
            return Err(AppError::Validation(format!(
                "dry run needs a delete statement, got {}",
                kind
            )));
        }
        sql::validate(sql_text, kind)?;
        let select_sql = sql::delete_to_select(sql_text)?;

        let result = self
            .bounded(async {
                self.executor
                    .query_read_only(
                        data_source_id,
                        &select_sql,
                        self.previews.settings().sample_rows,
                    )
                    .await
                    .map_err(AppError::from)
            })
            .await?;

        Ok(DryRunReport {
            select_sql,
            row_count: result.rows_returned,
            columns: result.columns,
            sample_rows: result.rows,
            truncated: result.truncated,
        })
    }

    pub async fn open_preview(
        &self,
        identity: &Identity,
        approval_id: Uuid,
    ) -> Result<PreviewTransaction, AppError> {
        let request = self.approvals.load(approval_id).await?;
        identity
            .require(Capability::Write, request.data_source_id())
            .map_err(AppError::Forbidden)?;
        if request.status == ApprovalStatus::Rejected {
            return Err(AppError::conflict(
                "rejected",
                "approval request was rejected",
            ));
        }
        if request.statement.operation.is_read_only() {
            return Err(AppError::conflict(
                "nothing_to_preview",
                "read-only statements are not previewed",
            ));
        }

        self.bounded(async {
            self.previews
                .open(&request, &identity.user_id)
                .await
                .map_err(AppError::from)
        })
        .await
    }

    pub async fn get_preview(
        &self,
        identity: &Identity,
        approval_id: Uuid,
    ) -> Result<Option<PreviewTransaction>, AppError> {
        let request = self.approvals.load(approval_id).await?;
        identity
            .require(Capability::Read, request.data_source_id())
            .map_err(AppError::Forbidden)?;
        Ok(self.previews.get(approval_id).await?)
    }

    pub async fn review(
        &self,
        identity: &Identity,
        approval_id: Uuid,
        decision: ReviewDecision,
        comment: Option<String>,
    ) -> Result<ApprovalRequest, AppError> {
        self.bounded(self.approvals.review(identity, approval_id, decision, comment))
            .await
    }

    /// Commit an approved request: the open preview if there is one,
    /// otherwise a one-shot execution when it was never previewed.
    pub async fn commit(
        &self,
        identity: &Identity,
        approval_id: Uuid,
    ) -> Result<PreviewTransaction, AppError> {
        let request = self.approvals.load(approval_id).await?;
        identity
            .require(Capability::Write, request.data_source_id())
            .map_err(AppError::Forbidden)?;
        if request.status != ApprovalStatus::Approved {
            return Err(AppError::conflict(
                "not_approved",
                format!("approval request is {}, not approved", request.status),
            ));
        }

        let previews = &self.previews;
        let user = identity.user_id.as_str();
        let commit = async {
            if previews.is_active(approval_id) {
                previews.commit(&request, user).await
            } else {
                previews.execute_direct(&request, user).await
            }
        };

        // The spawned commit keeps running past the deadline, so its outcome
        // is unknown to this caller.
        match tokio::time::timeout(self.limits.request_timeout, commit).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                tracing::error!(%approval_id, "commit exceeded request deadline");
                Err(AppError::CommitOutcomeUnknown(
                    "request deadline exceeded".into(),
                ))
            }
        }
    }

    pub async fn rollback(
        &self,
        identity: &Identity,
        approval_id: Uuid,
    ) -> Result<PreviewTransaction, AppError> {
        let request = self.approvals.load(approval_id).await?;
        identity
            .require(Capability::Write, request.data_source_id())
            .map_err(AppError::Forbidden)?;
        self.bounded(async {
            self.previews
                .rollback(approval_id, &identity.user_id)
                .await
                .map_err(AppError::from)
        })
        .await
    }

    pub async fn get_approval(
        &self,
        identity: &Identity,
        approval_id: Uuid,
    ) -> Result<ApprovalDetail, AppError> {
        let request = self.approvals.load(approval_id).await?;
        identity
            .require(Capability::Read, request.data_source_id())
            .map_err(AppError::Forbidden)?;
        let reviews = self.approvals.reviews(approval_id).await?;
        let preview = self.previews.get(approval_id).await?;
        Ok(ApprovalDetail {
            request,
            reviews,
            preview,
        })
    }

    /// Requests the caller can read, newest first.
    pub async fn list_approvals(
        &self,
        identity: &Identity,
        status: Option<ApprovalStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ApprovalRequest>, AppError> {
        let requests = self.approvals.list(status, limit, offset).await?;
        Ok(requests
            .into_iter()
            .filter(|r| identity.can(Capability::Read, r.data_source_id()))
            .collect())
    }

    pub fn active_previews(&self, identity: &Identity) -> Vec<PreviewTransaction> {
        self.previews
            .active()
            .into_iter()
            .filter(|p| identity.can(Capability::Read, p.data_source_id))
            .collect()
    }
}
