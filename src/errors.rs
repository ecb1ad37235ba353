use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::engine::executor::ExecError;
use crate::engine::preview::PreviewError;
use crate::sql::{DryRunError, ValidationError};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid statement: {0}")]
    Validation(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{message}")]
    Conflict { code: &'static str, message: String },

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("request timed out")]
    Timeout,

    #[error("commit outcome unknown: {0}")]
    CommitOutcomeUnknown(String),

    #[error("data source unavailable: {0}")]
    Upstream(String),

    #[error("statement rejected by database: {message}")]
    Statement {
        sqlstate: Option<String>,
        message: String,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        AppError::Conflict {
            code,
            message: message.into(),
        }
    }

    /// Attach the API operation that failed.
    pub fn during(self, operation: &'static str) -> ApiError {
        ApiError {
            operation,
            error: self,
        }
    }

    fn parts(&self) -> (StatusCode, &'static str, &'static str, String) {
        match self {
            AppError::Validation(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_request_error",
                "invalid_statement",
                msg.clone(),
            ),
            AppError::Forbidden(msg) => (
                StatusCode::FORBIDDEN,
                "permission_error",
                "forbidden",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                "invalid_request_error",
                "not_found",
                msg.clone(),
            ),
            AppError::Conflict { code, message } => {
                (StatusCode::CONFLICT, "conflict_error", code, message.clone())
            }
            AppError::PoolExhausted => (
                StatusCode::SERVICE_UNAVAILABLE,
                "unavailable_error",
                "pool_exhausted",
                "no database connection available, try again".to_string(),
            ),
            AppError::Timeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "timeout_error",
                "request_timeout",
                "request timed out".to_string(),
            ),
            AppError::CommitOutcomeUnknown(msg) => (
                StatusCode::GATEWAY_TIMEOUT,
                "timeout_error",
                "commit_outcome_unknown",
                format!("commit was interrupted and may or may not have applied: {}", msg),
            ),
            AppError::Upstream(msg) => (
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                "data_source_unavailable",
                msg.clone(),
            ),
            AppError::Statement { message, .. } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "statement_error",
                "statement_rejected",
                message.clone(),
            ),
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        }
    }

    pub fn status(&self) -> StatusCode {
        self.parts().0
    }
}

impl From<ValidationError> for AppError {
    fn from(e: ValidationError) -> Self {
        AppError::Validation(e.to_string())
    }
}

impl From<DryRunError> for AppError {
    fn from(e: DryRunError) -> Self {
        AppError::Validation(e.to_string())
    }
}

impl From<ExecError> for AppError {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::PoolExhausted => AppError::PoolExhausted,
            ExecError::Timeout => AppError::Timeout,
            ExecError::UnknownDataSource(id) => {
                AppError::NotFound(format!("data source {} is not registered", id))
            }
            ExecError::Statement { code, message } => AppError::Statement {
                sqlstate: code,
                message,
            },
            ExecError::Connection(msg) => {
                tracing::error!(error = %msg, "data source connection failed");
                AppError::Upstream(msg)
            }
        }
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => AppError::NotFound(format!("approval request {} not found", id)),
            StoreError::AlreadyDecided(status) => AppError::conflict(
                "already_decided",
                format!("approval request is already {}", status),
            ),
            StoreError::DuplicateReview => AppError::conflict(
                "duplicate_review",
                "reviewer has already reviewed this request",
            ),
            StoreError::Backend(e) => AppError::Internal(e),
        }
    }
}

impl From<PreviewError> for AppError {
    fn from(e: PreviewError) -> Self {
        let message = e.to_string();
        match e {
            PreviewError::AlreadyActive => AppError::conflict("preview_active", message),
            PreviewError::NotActive => AppError::conflict("preview_not_active", message),
            PreviewError::NotApproved(_) => AppError::conflict("not_approved", message),
            PreviewError::AlreadyCommitted => AppError::conflict("already_committed", message),
            PreviewError::PreviewExists(_) => AppError::conflict("preview_exists", message),
            PreviewError::Rejected => AppError::conflict("rejected", message),
            PreviewError::CommitFailed(inner) if inner.is_transient() => {
                AppError::CommitOutcomeUnknown(inner.to_string())
            }
            PreviewError::CommitFailed(inner) | PreviewError::Exec(inner) => inner.into(),
            PreviewError::Store(inner) => inner.into(),
            PreviewError::Interrupted => AppError::Internal(anyhow::anyhow!(message)),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.during("unknown").into_response()
    }
}

/// An [`AppError`] tagged with the API operation that produced it.
#[derive(Debug)]
pub struct ApiError {
    pub operation: &'static str,
    pub error: AppError,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, code, msg) = self.error.parts();

        let mut error = json!({
            "message": msg,
            "type": error_type,
            "code": code,
            "operation": self.operation,
        });
        if let AppError::Statement {
            sqlstate: Some(sqlstate),
            ..
        } = &self.error
        {
            error["sqlstate"] = json!(sqlstate);
        }

        let mut response = (status, Json(json!({ "error": error }))).into_response();

        if matches!(self.error, AppError::PoolExhausted) {
            response.headers_mut().insert(
                "retry-after",
                axum::http::HeaderValue::from_static("1"),
            );
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::from(ValidationError::Empty).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            AppError::from(PreviewError::AlreadyActive).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::from(ExecError::PoolExhausted).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::from(ExecError::Connection("reset".into())).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AppError::from(StoreError::DuplicateReview).status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_transient_commit_failure_is_outcome_unknown() {
        let err = AppError::from(PreviewError::CommitFailed(ExecError::Connection("eof".into())));
        assert!(matches!(err, AppError::CommitOutcomeUnknown(_)));

        let err = AppError::from(PreviewError::CommitFailed(ExecError::Statement {
            code: Some("23503".into()),
            message: "fk violation".into(),
        }));
        assert!(matches!(err, AppError::Statement { .. }));
    }

    #[tokio::test]
    async fn test_error_body_carries_operation_and_sqlstate() {
        let err = AppError::Statement {
            sqlstate: Some("42P01".into()),
            message: "relation \"nope\" does not exist".into(),
        };
        let response = err.during("submit_query").into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["operation"], "submit_query");
        assert_eq!(body["error"]["sqlstate"], "42P01");
        assert_eq!(body["error"]["code"], "statement_rejected");
    }
}
