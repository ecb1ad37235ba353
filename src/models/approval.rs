use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sql::OperationKind;

/// A submitted statement. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Statement {
    #[sqlx(rename = "statement")]
    pub text: String,
    pub data_source_id: Uuid,
    pub submitted_by: String,
    pub operation: OperationKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ApprovalRequest {
    pub id: Uuid,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub statement: Statement,
    pub status: ApprovalStatus,
    pub rejection_reason: Option<String>,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApprovalRequest {
    pub fn requester(&self) -> &str {
        &self.statement.submitted_by
    }

    pub fn data_source_id(&self) -> Uuid {
        self.statement.data_source_id
    }
}

#[derive(Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown approval status '{}'", other)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum ReviewDecision {
    #[serde(alias = "approve")]
    Approved,
    #[serde(alias = "reject")]
    Rejected,
}

/// One reviewer's decision on a request.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ApprovalReview {
    pub request_id: Uuid,
    pub reviewer_id: String,
    pub decision: ReviewDecision,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// How many matching reviews move a request out of `pending`.
///
/// Rejections are counted first, so with the defaults a single reject is
/// terminal even if an approval arrives in the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalPolicy {
    pub approvals_required: u32,
    pub rejections_required: u32,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            approvals_required: 1,
            rejections_required: 1,
        }
    }
}

impl ApprovalPolicy {
    /// The status the request should move to given all reviews so far,
    /// or `None` while it stays pending.
    pub fn evaluate(&self, reviews: &[ApprovalReview]) -> Option<ApprovalStatus> {
        let count = |d: ReviewDecision| reviews.iter().filter(|r| r.decision == d).count() as u32;
        if count(ReviewDecision::Rejected) >= self.rejections_required.max(1) {
            return Some(ApprovalStatus::Rejected);
        }
        if count(ReviewDecision::Approved) >= self.approvals_required.max(1) {
            return Some(ApprovalStatus::Approved);
        }
        None
    }
}
