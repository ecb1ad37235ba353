//! sqlgate: approval-gated SQL execution.
//!
//! Reads run immediately. Writes and DDL wait for a reviewer, who can open a
//! real transaction to preview the effect before it is committed or rolled back.

use std::sync::Arc;

pub mod api;
pub mod config;
pub mod engine;
pub mod errors;
pub mod jobs;
pub mod middleware;
pub mod models;
pub mod notification;
pub mod sql;
pub mod store;

use engine::{ApprovalService, Clock, DataSourceExecutor, PreviewManager, QueryService, ServiceLimits};
use notification::NotificationSink;
use store::{ApprovalStore, PreviewRecorder};

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub service: QueryService,
    pub config: config::Config,
}

/// Wire the engine together from its collaborators.
pub fn build_service(
    cfg: &config::Config,
    executor: Arc<dyn DataSourceExecutor>,
    store: Arc<dyn ApprovalStore>,
    recorder: Arc<dyn PreviewRecorder>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
) -> QueryService {
    let previews = PreviewManager::new(
        executor.clone(),
        recorder,
        notifier.clone(),
        clock,
        cfg.preview_settings(),
    );
    let approvals = ApprovalService::new(
        store.clone(),
        previews.clone(),
        notifier.clone(),
        cfg.approval_policy(),
    );
    QueryService::new(
        executor,
        store,
        approvals,
        previews,
        notifier,
        ServiceLimits {
            query_max_rows: cfg.query_max_rows,
            request_timeout: cfg.request_timeout,
        },
    )
}
