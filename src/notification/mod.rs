pub mod webhook;

use serde::Serialize;
use std::sync::Mutex;

use crate::models::{ApprovalRequest, PreviewTransaction};

// ── Approval Event Types ─────────────────────────────────────

/// A structured event describing a change in the approval workflow.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalEvent {
    /// "approval_requested", "approval_decided" or "preview_resolved".
    pub event_type: String,
    /// ISO-8601 timestamp of when the event occurred.
    pub timestamp: String,
    pub approval_id: String,
    pub data_source_id: String,
    /// The user who caused the event.
    pub actor: String,
    pub details: serde_json::Value,
}

impl ApprovalEvent {
    pub fn requested(request: &ApprovalRequest) -> Self {
        Self {
            event_type: "approval_requested".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            approval_id: request.id.to_string(),
            data_source_id: request.data_source_id().to_string(),
            actor: request.requester().to_string(),
            details: serde_json::json!({
                "operation": request.statement.operation,
                "statement": crate::sql::summarize(&request.statement.text, 200),
            }),
        }
    }

    pub fn decided(request: &ApprovalRequest, reviewer: &str) -> Self {
        Self {
            event_type: "approval_decided".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            approval_id: request.id.to_string(),
            data_source_id: request.data_source_id().to_string(),
            actor: reviewer.to_string(),
            details: serde_json::json!({
                "status": request.status,
                "reason": request.rejection_reason,
            }),
        }
    }

    pub fn preview_resolved(preview: &PreviewTransaction, actor: &str) -> Self {
        Self {
            event_type: "preview_resolved".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            approval_id: preview.approval_id.to_string(),
            data_source_id: preview.data_source_id.to_string(),
            actor: actor.to_string(),
            details: serde_json::json!({
                "preview_id": preview.id,
                "status": preview.status,
                "row_count": preview.preview.as_ref().map(|p| p.row_count),
                "error": preview.error,
            }),
        }
    }
}

/// Best-effort delivery. Implementations must not block the caller and must
/// swallow their own failures.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: ApprovalEvent);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl NotificationSink for NoopSink {
    fn notify(&self, _event: ApprovalEvent) {}
}

/// Keeps events in memory, for tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ApprovalEvent>>,
}

impl RecordingSink {
    pub fn event_types(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|e| e.event_type.clone())
            .collect()
    }

    pub fn events(&self) -> Vec<ApprovalEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, event: ApprovalEvent) {
        tracing::debug!(event_type = %event.event_type, approval_id = %event.approval_id, "recorded event");
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
