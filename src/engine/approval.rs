use std::sync::Arc;

use uuid::Uuid;

use super::preview::PreviewManager;
use crate::errors::AppError;
use crate::middleware::rbac::{Capability, Identity};
use crate::models::{ApprovalPolicy, ApprovalRequest, ApprovalReview, ApprovalStatus, ReviewDecision};
use crate::notification::{ApprovalEvent, NotificationSink};
use crate::store::ApprovalStore;

/// Drives `pending → approved | rejected`. Owns request and review records;
/// live transactions stay with the [`PreviewManager`].
#[derive(Clone)]
pub struct ApprovalService {
    store: Arc<dyn ApprovalStore>,
    previews: PreviewManager,
    notifier: Arc<dyn NotificationSink>,
    policy: ApprovalPolicy,
}

impl ApprovalService {
    pub fn new(
        store: Arc<dyn ApprovalStore>,
        previews: PreviewManager,
        notifier: Arc<dyn NotificationSink>,
        policy: ApprovalPolicy,
    ) -> Self {
        Self {
            store,
            previews,
            notifier,
            policy,
        }
    }

    pub fn policy(&self) -> ApprovalPolicy {
        self.policy
    }

    pub async fn load(&self, id: Uuid) -> Result<ApprovalRequest, AppError> {
        self.store
            .get_request(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("approval request {} not found", id)))
    }

    /// Record one reviewer's decision and apply the policy.
    ///
    /// A rejection that ends the request rolls back any open preview
    /// before returning.
    pub async fn review(
        &self,
        reviewer: &Identity,
        id: Uuid,
        decision: ReviewDecision,
        comment: Option<String>,
    ) -> Result<ApprovalRequest, AppError> {
        let request = self.load(id).await?;

        reviewer
            .require(Capability::Approve, request.data_source_id())
            .map_err(AppError::Forbidden)?;

        if reviewer.user_id == request.requester() {
            return Err(AppError::conflict(
                "self_review",
                "requesters may not review their own statements",
            ));
        }
        if request.status.is_terminal() {
            return Err(AppError::conflict(
                "already_decided",
                format!("approval request is already {}", request.status),
            ));
        }

        let review = ApprovalReview {
            request_id: id,
            reviewer_id: reviewer.user_id.clone(),
            decision,
            comment,
            created_at: chrono::Utc::now(),
        };
        let outcome = self.store.apply_review(review, &self.policy).await?;
        let request = outcome.request;

        tracing::info!(
            approval_id = %id,
            reviewer = %reviewer.user_id,
            decision = ?decision,
            status = %request.status,
            transitioned = outcome.transitioned,
            "review recorded"
        );

        if outcome.transitioned {
            if request.status == ApprovalStatus::Rejected {
                match self.previews.discard_rejected(id, &reviewer.user_id).await {
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(approval_id = %id, error = %e, "rollback after rejection failed");
                    }
                }
            }
            self.notifier
                .notify(ApprovalEvent::decided(&request, &reviewer.user_id));
        }

        Ok(request)
    }

    pub async fn reviews(&self, id: Uuid) -> Result<Vec<ApprovalReview>, AppError> {
        Ok(self.store.list_reviews(id).await?)
    }

    pub async fn list(
        &self,
        status: Option<ApprovalStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ApprovalRequest>, AppError> {
        Ok(self
            .store
            .list_requests(status, limit.clamp(1, 500), offset.max(0))
            .await?)
    }
}
