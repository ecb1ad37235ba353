use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sql::OperationKind;

/// Lifecycle of one preview transaction. Only `Active` holds a connection.
#[derive(Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum PreviewStatus {
    Active,
    Committed,
    RolledBack,
    Failed,
}

impl PreviewStatus {
    pub fn is_terminal(self) -> bool {
        self != Self::Active
    }
}

impl std::fmt::Display for PreviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        })
    }
}

/// What the statement did inside the open transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreviewSnapshot {
    /// Rows affected, or rows matched for a delete.
    pub row_count: u64,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewTransaction {
    pub id: Uuid,
    pub approval_id: Uuid,
    pub data_source_id: Uuid,
    pub statement: String,
    pub operation: OperationKind,
    pub opened_by: String,
    pub status: PreviewStatus,
    pub preview: Option<PreviewSnapshot>,
    pub error: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl PreviewTransaction {
    pub fn close(mut self, status: PreviewStatus, error: Option<String>, at: DateTime<Utc>) -> Self {
        self.status = status;
        self.error = error;
        self.closed_at = Some(at);
        self
    }
}
