//! In-process store used by tests and single-node demos. Same semantics
//! as the Postgres store; a single mutex stands in for row locking.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ApprovalStore, PreviewRecorder, ReviewOutcome, StoreError};
use crate::models::{
    ApprovalPolicy, ApprovalRequest, ApprovalReview, ApprovalStatus, PreviewStatus,
    PreviewTransaction, Statement,
};

#[derive(Default)]
struct Inner {
    requests: HashMap<Uuid, ApprovalRequest>,
    reviews: HashMap<Uuid, Vec<ApprovalReview>>,
    previews: HashMap<Uuid, PreviewTransaction>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded preview for an approval, oldest first.
    pub async fn previews_for(&self, approval_id: Uuid) -> Vec<PreviewTransaction> {
        let inner = self.inner.lock().await;
        let mut previews: Vec<_> = inner
            .previews
            .values()
            .filter(|p| p.approval_id == approval_id)
            .cloned()
            .collect();
        previews.sort_by_key(|p| p.opened_at);
        previews
    }
}

#[async_trait]
impl ApprovalStore for MemoryStore {
    async fn create_request(&self, statement: Statement) -> Result<ApprovalRequest, StoreError> {
        let request = ApprovalRequest {
            id: Uuid::new_v4(),
            statement,
            status: ApprovalStatus::Pending,
            rejection_reason: None,
            decided_by: None,
            decided_at: None,
            created_at: Utc::now(),
        };
        self.inner
            .lock()
            .await
            .requests
            .insert(request.id, request.clone());
        Ok(request)
    }

    async fn get_request(&self, id: Uuid) -> Result<Option<ApprovalRequest>, StoreError> {
        Ok(self.inner.lock().await.requests.get(&id).cloned())
    }

    async fn list_requests(
        &self,
        status: Option<ApprovalStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ApprovalRequest>, StoreError> {
        let inner = self.inner.lock().await;
        let mut requests: Vec<_> = inner
            .requests
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn list_reviews(&self, request_id: Uuid) -> Result<Vec<ApprovalReview>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .reviews
            .get(&request_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn apply_review(
        &self,
        review: ApprovalReview,
        policy: &ApprovalPolicy,
    ) -> Result<ReviewOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let Inner {
            requests, reviews, ..
        } = &mut *inner;

        let request = requests
            .get_mut(&review.request_id)
            .ok_or(StoreError::NotFound(review.request_id))?;
        if request.status.is_terminal() {
            return Err(StoreError::AlreadyDecided(request.status));
        }

        let existing = reviews.entry(review.request_id).or_default();
        if existing.iter().any(|r| r.reviewer_id == review.reviewer_id) {
            return Err(StoreError::DuplicateReview);
        }
        existing.push(review.clone());

        let Some(status) = policy.evaluate(existing) else {
            return Ok(ReviewOutcome {
                request: request.clone(),
                transitioned: false,
            });
        };

        request.status = status;
        request.decided_by = Some(review.reviewer_id.clone());
        request.decided_at = Some(Utc::now());
        if status == ApprovalStatus::Rejected {
            request.rejection_reason = review.comment.clone();
        }
        Ok(ReviewOutcome {
            request: request.clone(),
            transitioned: true,
        })
    }
}

#[async_trait]
impl PreviewRecorder for MemoryStore {
    async fn record(&self, preview: &PreviewTransaction) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .previews
            .insert(preview.id, preview.clone());
        Ok(())
    }

    async fn latest(&self, approval_id: Uuid) -> Result<Option<PreviewTransaction>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .previews
            .values()
            .filter(|p| p.approval_id == approval_id)
            .max_by_key(|p| p.opened_at)
            .cloned())
    }

    async fn mark_orphaned(&self, reason: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut count = 0;
        for p in inner.previews.values_mut() {
            if p.status == PreviewStatus::Active {
                p.status = PreviewStatus::Failed;
                p.error = Some(reason.to_string());
                p.closed_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }
}
