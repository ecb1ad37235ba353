//! Persistence seams for approvals and preview records.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    ApprovalPolicy, ApprovalRequest, ApprovalReview, ApprovalStatus, PreviewTransaction, Statement,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("approval request {0} not found")]
    NotFound(Uuid),

    #[error("approval request is already {0}")]
    AlreadyDecided(ApprovalStatus),

    #[error("reviewer has already reviewed this request")]
    DuplicateReview,

    #[error("store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Backend(e.into())
    }
}

/// Result of recording a review.
#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub request: ApprovalRequest,
    /// True when this review moved the request out of `pending`.
    pub transitioned: bool,
}

#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn create_request(&self, statement: Statement) -> Result<ApprovalRequest, StoreError>;

    async fn get_request(&self, id: Uuid) -> Result<Option<ApprovalRequest>, StoreError>;

    async fn list_requests(
        &self,
        status: Option<ApprovalStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ApprovalRequest>, StoreError>;

    async fn list_reviews(&self, request_id: Uuid) -> Result<Vec<ApprovalReview>, StoreError>;

    /// Record `review` and apply `policy` in one atomic step. Concurrent
    /// reviewers serialize here, so at most one of them transitions the request.
    async fn apply_review(
        &self,
        review: ApprovalReview,
        policy: &ApprovalPolicy,
    ) -> Result<ReviewOutcome, StoreError>;
}

/// Durable mirror of preview transaction state.
#[async_trait]
pub trait PreviewRecorder: Send + Sync {
    /// Insert or update a preview record by id.
    async fn record(&self, preview: &PreviewTransaction) -> Result<(), StoreError>;

    /// Most recently opened preview for an approval, in any status.
    async fn latest(&self, approval_id: Uuid) -> Result<Option<PreviewTransaction>, StoreError>;

    /// Mark every record still `active` as failed. Returns how many changed.
    async fn mark_orphaned(&self, reason: &str) -> Result<u64, StoreError>;
}
