//! Approval state machine end to end over the in-memory store.

mod common;

use common::{editor, reviewer, viewer, Harness, JWT_SECRET};
use sqlgate::config::Config;
use sqlgate::engine::Submission;
use sqlgate::errors::AppError;
use sqlgate::middleware::rbac::{Identity, Role};
use sqlgate::models::{ApprovalStatus, PreviewStatus, ReviewDecision};
use sqlgate::sql::OperationKind;
use uuid::Uuid;

fn conflict_code(err: &AppError) -> Option<&'static str> {
    match err {
        AppError::Conflict { code, .. } => Some(code),
        _ => None,
    }
}

#[tokio::test]
async fn test_select_runs_immediately() {
    let h = Harness::new();
    let submission = h
        .service
        .submit(&viewer("vera"), "SELECT id, name FROM customers", h.data_source_id)
        .await
        .unwrap();

    match submission {
        Submission::Executed { result } => {
            assert_eq!(result.columns, vec!["id".to_string(), "name".to_string()]);
            assert_eq!(result.rows_returned, common::SCRIPTED_ROWS);
        }
        other => panic!("expected executed, got {:?}", other),
    }
    assert!(h.notifier.event_types().is_empty());
}

#[tokio::test]
async fn test_mutation_is_queued_with_operation_kind() {
    let h = Harness::new();
    let submission = h
        .service
        .submit(
            &editor("ed"),
            "CREATE TABLE audit_log (id bigint primary key)",
            h.data_source_id,
        )
        .await
        .unwrap();

    let Submission::Pending { approval } = submission else {
        panic!("expected pending submission");
    };
    assert_eq!(approval.status, ApprovalStatus::Pending);
    assert_eq!(approval.statement.operation, OperationKind::CreateTable);
    assert_eq!(approval.requester(), "ed");
    assert_eq!(h.notifier.event_types(), vec!["approval_requested"]);
    // Nothing touched the data source.
    assert_eq!(h.executor.checked_out(), 0);
    assert!(h.executor.committed().is_empty());
}

#[tokio::test]
async fn test_invalid_statement_is_refused_before_queueing() {
    let h = Harness::new();
    let err = h
        .service
        .submit(&editor("ed"), "UPDATE orders state = 'x'", h.data_source_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let err = h
        .service
        .submit(&editor("ed"), "DELETE FROM t; DROP TABLE t", h.data_source_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    assert!(h
        .service
        .list_approvals(&editor("ed"), None, 50, 0)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_unknown_data_source_is_not_found() {
    let h = Harness::new();
    let err = h
        .service
        .submit(&editor("ed"), "DELETE FROM t WHERE id = 1", Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_viewer_cannot_submit_mutations() {
    let h = Harness::new();
    let err = h
        .service
        .submit(&viewer("vera"), "DELETE FROM t WHERE id = 1", h.data_source_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));
}

#[tokio::test]
async fn test_scope_limits_data_sources() {
    let h = Harness::new();
    let other = Uuid::new_v4();
    let scoped = Identity::new("sam", Role::Editor, vec![format!("{}:*", other)]);

    let err = h
        .service
        .submit(&scoped, "SELECT 1", h.data_source_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));
}

#[tokio::test]
async fn test_single_approval_approves() {
    let h = Harness::new();
    let id = h.submit_pending("DELETE FROM t WHERE id = 1").await;

    let request = h
        .service
        .review(&reviewer("rita"), id, ReviewDecision::Approved, Some("ok".into()))
        .await
        .unwrap();
    assert_eq!(request.status, ApprovalStatus::Approved);
    assert_eq!(request.decided_by.as_deref(), Some("rita"));
    assert!(request.decided_at.is_some());
    assert_eq!(
        h.notifier.event_types(),
        vec!["approval_requested", "approval_decided"]
    );

    let detail = h.service.get_approval(&viewer("vera"), id).await.unwrap();
    assert_eq!(detail.reviews.len(), 1);
    assert_eq!(detail.reviews[0].comment.as_deref(), Some("ok"));
    assert!(detail.preview.is_none());
}

#[tokio::test]
async fn test_rejection_records_reason() {
    let h = Harness::new();
    let id = h.submit_pending("DROP TABLE customers").await;

    let request = h
        .service
        .review(
            &reviewer("rita"),
            id,
            ReviewDecision::Rejected,
            Some("not during business hours".into()),
        )
        .await
        .unwrap();
    assert_eq!(request.status, ApprovalStatus::Rejected);
    assert_eq!(
        request.rejection_reason.as_deref(),
        Some("not during business hours")
    );

    let err = h
        .service
        .open_preview(&editor("ed"), id)
        .await
        .unwrap_err();
    assert_eq!(conflict_code(&err), Some("rejected"));
    let err = h.service.commit(&editor("ed"), id).await.unwrap_err();
    assert_eq!(conflict_code(&err), Some("not_approved"));
}

#[tokio::test]
async fn test_requester_cannot_review_own_statement() {
    let h = Harness::new();
    let id = h.submit_pending("DELETE FROM t WHERE id = 1").await;
    // Same user id as the submitter, with reviewer rights.
    let err = h
        .service
        .review(&reviewer("editor"), id, ReviewDecision::Approved, None)
        .await
        .unwrap_err();
    assert_eq!(conflict_code(&err), Some("self_review"));
}

#[tokio::test]
async fn test_editor_cannot_review() {
    let h = Harness::new();
    let id = h.submit_pending("DELETE FROM t WHERE id = 1").await;
    let err = h
        .service
        .review(&editor("ed2"), id, ReviewDecision::Approved, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));
}

#[tokio::test]
async fn test_decided_request_is_final() {
    let h = Harness::new();
    let id = h.submit_pending("DELETE FROM t WHERE id = 1").await;
    h.service
        .review(&reviewer("rita"), id, ReviewDecision::Approved, None)
        .await
        .unwrap();

    let err = h
        .service
        .review(&reviewer("rob"), id, ReviewDecision::Rejected, None)
        .await
        .unwrap_err();
    assert_eq!(conflict_code(&err), Some("already_decided"));

    let detail = h.service.get_approval(&viewer("vera"), id).await.unwrap();
    assert_eq!(detail.request.status, ApprovalStatus::Approved);
}

#[tokio::test]
async fn test_quorum_needs_distinct_reviewers() {
    let h = Harness::with_config(Config {
        jwt_secret: JWT_SECRET.into(),
        approvals_required: 2,
        ..Config::default()
    });
    let id = h.submit_pending("DELETE FROM t WHERE id = 1").await;

    let first = h
        .service
        .review(&reviewer("rita"), id, ReviewDecision::Approved, None)
        .await
        .unwrap();
    assert_eq!(first.status, ApprovalStatus::Pending);

    let err = h
        .service
        .review(&reviewer("rita"), id, ReviewDecision::Approved, None)
        .await
        .unwrap_err();
    assert_eq!(conflict_code(&err), Some("duplicate_review"));

    let second = h
        .service
        .review(&reviewer("rob"), id, ReviewDecision::Approved, None)
        .await
        .unwrap();
    assert_eq!(second.status, ApprovalStatus::Approved);
    assert_eq!(second.decided_by.as_deref(), Some("rob"));
}

#[tokio::test]
async fn test_concurrent_reviews_transition_once() {
    let h = Harness::with_config(Config {
        jwt_secret: JWT_SECRET.into(),
        approvals_required: 1,
        rejections_required: 1,
        ..Config::default()
    });
    let id = h.submit_pending("DELETE FROM t WHERE id = 1").await;
    let rita = reviewer("rita");
    let rob = reviewer("rob");

    let (a, b) = tokio::join!(
        h.service.review(&rita, id, ReviewDecision::Approved, None),
        h.service.review(&rob, id, ReviewDecision::Rejected, None)
    );
    assert!(a.is_ok() ^ b.is_ok());

    let decided = h
        .notifier
        .event_types()
        .into_iter()
        .filter(|t| t == "approval_decided")
        .count();
    assert_eq!(decided, 1);
}

#[tokio::test]
async fn test_rejection_rolls_back_open_preview() {
    let h = Harness::new();
    let id = h.submit_pending("UPDATE orders SET state = 'void'").await;
    h.service.open_preview(&editor("ed"), id).await.unwrap();
    assert_eq!(h.executor.checked_out(), 1);

    h.service
        .review(&reviewer("rita"), id, ReviewDecision::Rejected, Some("wrong table".into()))
        .await
        .unwrap();

    assert!(!h.service.previews().is_active(id));
    assert_eq!(h.executor.checked_out(), 0);
    let preview = h
        .service
        .get_preview(&viewer("vera"), id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(preview.status, PreviewStatus::RolledBack);
    assert!(h.executor.committed().is_empty());
}

#[tokio::test]
async fn test_full_preview_then_commit_scenario() {
    let h = Harness::new();
    let sql = "DELETE FROM sessions WHERE expires_at < now()";
    let id = h.submit_pending(sql).await;

    let dry = h
        .service
        .dry_run_delete(&editor("ed"), sql, h.data_source_id)
        .await
        .unwrap();
    assert_eq!(dry.select_sql, "SELECT * FROM sessions WHERE expires_at < now()");
    assert_eq!(dry.row_count, common::SCRIPTED_ROWS);

    let preview = h.service.open_preview(&editor("ed"), id).await.unwrap();
    assert_eq!(preview.status, PreviewStatus::Active);

    h.service
        .review(&reviewer("rita"), id, ReviewDecision::Approved, None)
        .await
        .unwrap();
    let committed = h.service.commit(&editor("ed"), id).await.unwrap();
    assert_eq!(committed.status, PreviewStatus::Committed);
    assert_eq!(committed.id, preview.id);
    assert!(h.executor.committed().contains(&sql.to_string()));

    let types = h.notifier.event_types();
    assert_eq!(
        types,
        vec!["approval_requested", "approval_decided", "preview_resolved"]
    );

    let listed = h
        .service
        .list_approvals(&viewer("vera"), Some(ApprovalStatus::Approved), 10, 0)
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
}

#[tokio::test]
async fn test_explain_refuses_analyze_on_mutation() {
    let h = Harness::new();
    let err = h
        .service
        .explain(&viewer("vera"), "DELETE FROM t WHERE id = 1", h.data_source_id, true)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let plan = h
        .service
        .explain(&viewer("vera"), "SELECT * FROM t", h.data_source_id, false)
        .await
        .unwrap();
    assert_eq!(plan, serde_json::json!(1));
    let reads = h.executor.reads.lock().unwrap().clone();
    assert_eq!(reads, vec!["EXPLAIN (FORMAT JSON) SELECT * FROM t".to_string()]);
}

#[tokio::test]
async fn test_dry_run_requires_delete() {
    let h = Harness::new();
    let err = h
        .service
        .dry_run_delete(&editor("ed"), "UPDATE t SET a = 1", h.data_source_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn test_cte_delete_dry_run_and_preview_sample() {
    let h = Harness::new();
    let sql = "WITH x AS (SELECT id FROM banned) DELETE FROM users WHERE id IN (SELECT id FROM x)";

    let dry = h
        .service
        .dry_run_delete(&editor("ed"), sql, h.data_source_id)
        .await
        .unwrap();
    assert_eq!(
        dry.select_sql,
        "WITH x AS (SELECT id FROM banned) SELECT * FROM users WHERE id IN (SELECT id FROM x)"
    );
    assert_eq!(dry.row_count, common::SCRIPTED_ROWS);

    let id = h.submit_pending(sql).await;
    let preview = h.service.open_preview(&editor("ed"), id).await.unwrap();
    let snap = preview.preview.unwrap();
    assert_eq!(snap.columns, vec!["id".to_string(), "name".to_string()]);
    assert_eq!(snap.rows.len() as u64, common::SCRIPTED_ROWS);
}

#[tokio::test]
async fn test_statement_hidden_after_carriage_return_never_runs() {
    let h = Harness::new();
    for sql in [
        "SELECT 1 --x\r; COMMIT; DROP TABLE users",
        "UPDATE t SET a = 1 --x\r; COMMIT",
        "COMMIT",
    ] {
        let err = h
            .service
            .submit(&editor("ed"), sql, h.data_source_id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)), "{sql:?}");
    }
    assert!(h.executor.reads.lock().unwrap().is_empty());
    assert!(h
        .service
        .list_approvals(&editor("ed"), None, 50, 0)
        .await
        .unwrap()
        .is_empty());
}
