use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::{ApprovalDetail, DryRunReport, Submission};
use crate::errors::ApiError;
use crate::middleware::rbac::Identity;
use crate::models::{ApprovalRequest, ApprovalStatus, PreviewStatus, PreviewTransaction, ReviewDecision};
use crate::AppState;

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Deserialize)]
pub struct SubmitRequest {
    pub sql: String,
    pub data_source_id: Uuid,
}

#[derive(Deserialize)]
pub struct ExplainRequest {
    pub sql: String,
    pub data_source_id: Uuid,
    #[serde(default)]
    pub analyze: bool,
}

#[derive(Serialize)]
pub struct ExplainResponse {
    pub plan: serde_json::Value,
}

#[derive(Deserialize)]
pub struct ReviewRequest {
    pub decision: ReviewDecision,
    pub comment: Option<String>,
}

#[derive(Serialize)]
pub struct ReviewResponse {
    pub id: Uuid,
    pub status: ApprovalStatus,
    pub rejection_reason: Option<String>,
}

#[derive(Serialize)]
pub struct ResolveResponse {
    pub approval_id: Uuid,
    pub status: PreviewStatus,
    pub row_count: Option<u64>,
    pub preview: PreviewTransaction,
}

impl From<PreviewTransaction> for ResolveResponse {
    fn from(preview: PreviewTransaction) -> Self {
        Self {
            approval_id: preview.approval_id,
            status: preview.status,
            row_count: preview.preview.as_ref().map(|p| p.row_count),
            preview,
        }
    }
}

#[derive(Deserialize)]
pub struct ListParams {
    pub status: Option<ApprovalStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

// ── Handlers ─────────────────────────────────────────────────

/// GET /healthz
pub async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /api/v1/queries: run a read now or queue a mutation for review
pub async fn submit_query(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(payload): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<Submission>), ApiError> {
    let submission = state
        .service
        .submit(&identity, &payload.sql, payload.data_source_id)
        .await
        .map_err(|e| e.during("submit_query"))?;

    let status = match submission {
        Submission::Executed { .. } => StatusCode::OK,
        Submission::Pending { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(submission)))
}

/// POST /api/v1/queries/explain
pub async fn explain_query(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(payload): Json<ExplainRequest>,
) -> Result<Json<ExplainResponse>, ApiError> {
    let plan = state
        .service
        .explain(&identity, &payload.sql, payload.data_source_id, payload.analyze)
        .await
        .map_err(|e| e.during("explain_query"))?;
    Ok(Json(ExplainResponse { plan }))
}

/// POST /api/v1/queries/dry-run: rows a DELETE would remove
pub async fn dry_run_delete(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(payload): Json<SubmitRequest>,
) -> Result<Json<DryRunReport>, ApiError> {
    let report = state
        .service
        .dry_run_delete(&identity, &payload.sql, payload.data_source_id)
        .await
        .map_err(|e| e.during("dry_run_delete"))?;
    Ok(Json(report))
}

/// GET /api/v1/approvals?status=pending
pub async fn list_approvals(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<ApprovalRequest>>, ApiError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 200);
    let offset = params.offset.unwrap_or(0).max(0);
    let requests = state
        .service
        .list_approvals(&identity, params.status, limit, offset)
        .await
        .map_err(|e| e.during("list_approvals"))?;
    Ok(Json(requests))
}

/// GET /api/v1/approvals/:id: request, reviews and latest preview
pub async fn get_approval(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApprovalDetail>, ApiError> {
    let detail = state
        .service
        .get_approval(&identity, id)
        .await
        .map_err(|e| e.during("get_approval"))?;
    Ok(Json(detail))
}

/// POST /api/v1/approvals/:id/preview
pub async fn open_preview(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<PreviewTransaction>), ApiError> {
    let preview = state
        .service
        .open_preview(&identity, id)
        .await
        .map_err(|e| e.during("open_preview"))?;
    Ok((StatusCode::CREATED, Json(preview)))
}

/// GET /api/v1/approvals/:id/preview
pub async fn get_preview(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> Result<Json<PreviewTransaction>, ApiError> {
    let preview = state
        .service
        .get_preview(&identity, id)
        .await
        .map_err(|e| e.during("get_preview"))?;
    preview.map(Json).ok_or_else(|| {
        crate::errors::AppError::NotFound(format!("no preview for approval {}", id))
            .during("get_preview")
    })
}

/// POST /api/v1/approvals/:id/review
pub async fn review_approval(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReviewRequest>,
) -> Result<Json<ReviewResponse>, ApiError> {
    let request = state
        .service
        .review(&identity, id, payload.decision, payload.comment)
        .await
        .map_err(|e| e.during("review_approval"))?;
    Ok(Json(ReviewResponse {
        id: request.id,
        status: request.status,
        rejection_reason: request.rejection_reason,
    }))
}

/// POST /api/v1/approvals/:id/commit
pub async fn commit_approval(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> Result<Json<ResolveResponse>, ApiError> {
    let preview = state
        .service
        .commit(&identity, id)
        .await
        .map_err(|e| e.during("commit_approval"))?;
    Ok(Json(preview.into()))
}

/// POST /api/v1/approvals/:id/rollback
pub async fn rollback_approval(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> Result<Json<ResolveResponse>, ApiError> {
    let preview = state
        .service
        .rollback(&identity, id)
        .await
        .map_err(|e| e.during("rollback_approval"))?;
    Ok(Json(preview.into()))
}

/// GET /api/v1/previews: active previews visible to the caller
pub async fn list_active_previews(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Json<Vec<PreviewTransaction>> {
    Json(state.service.active_previews(&identity))
}
