//! Preview transactions against a scripted executor: exclusivity, racing
//! resolutions, expiry and connection release.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{editor, reviewer, Harness, SCRIPTED_ROWS};
use sqlgate::config::Config;
use sqlgate::engine::preview::EXPIRED_MESSAGE;
use sqlgate::engine::{ExecError, PreviewError};
use sqlgate::errors::AppError;
use sqlgate::jobs::preview_sweep::{self, ORPHANED_MESSAGE};
use sqlgate::models::{
    ApprovalStatus, PreviewStatus, PreviewTransaction, ReviewDecision, Statement,
};
use sqlgate::sql::OperationKind;
use sqlgate::store::{ApprovalStore, PreviewRecorder};

fn conflict_code(err: &AppError) -> Option<&'static str> {
    match err {
        AppError::Conflict { code, .. } => Some(code),
        _ => None,
    }
}

#[tokio::test]
async fn test_concurrent_opens_yield_one_preview() {
    let h = Harness::new();
    let id = h.submit_pending("UPDATE orders SET state = 'x' WHERE id = 1").await;
    let alice = editor("alice");
    let bob = editor("bob");

    let (a, b) = tokio::join!(
        h.service.open_preview(&alice, id),
        h.service.open_preview(&bob, id)
    );

    let (ok, err): (Vec<_>, Vec<_>) = [a, b].into_iter().partition(|r| r.is_ok());
    assert_eq!(ok.len(), 1);
    let err = err.into_iter().next().unwrap().unwrap_err();
    assert_eq!(conflict_code(&err), Some("preview_active"));
    assert_eq!(h.executor.checked_out(), 1);
    assert_eq!(h.executor.began.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_update_preview_reports_affected_rows() {
    let h = Harness::new();
    let id = h.submit_pending("UPDATE orders SET state = 'x'").await;

    let preview = h.service.open_preview(&editor("alice"), id).await.unwrap();
    assert_eq!(preview.status, PreviewStatus::Active);
    assert_eq!(preview.opened_by, "alice");
    assert_eq!(preview.operation, OperationKind::Update);
    let snap = preview.preview.unwrap();
    assert_eq!(snap.row_count, SCRIPTED_ROWS);
    assert!(snap.rows.is_empty());

    assert!(h.service.previews().is_active(id));
    assert_eq!(h.service.active_previews(&editor("carol")).len(), 1);
}

#[tokio::test]
async fn test_delete_preview_samples_rows_to_be_removed() {
    let h = Harness::new();
    let id = h.submit_pending("DELETE FROM orders WHERE created_at < now()").await;

    let preview = h.service.open_preview(&editor("alice"), id).await.unwrap();
    let snap = preview.preview.unwrap();
    assert_eq!(snap.columns, vec!["id".to_string(), "name".to_string()]);
    assert_eq!(snap.rows.len(), SCRIPTED_ROWS as usize);
    assert_eq!(snap.row_count, SCRIPTED_ROWS);
}

#[tokio::test]
async fn test_commit_and_rollback_race_resolves_once() {
    let h = Harness::new();
    let id = h.submit_pending("UPDATE orders SET state = 'x' WHERE id = 1").await;
    h.service.open_preview(&editor("alice"), id).await.unwrap();
    h.service
        .review(&reviewer("rita"), id, sqlgate::models::ReviewDecision::Approved, None)
        .await
        .unwrap();

    let alice = editor("alice");
    let (commit, rollback) = tokio::join!(
        h.service.commit(&alice, id),
        h.service.rollback(&alice, id)
    );

    assert!(
        commit.is_ok() ^ rollback.is_ok(),
        "exactly one resolution must win: commit={:?} rollback={:?}",
        commit.as_ref().map(|p| p.status),
        rollback.as_ref().map(|p| p.status)
    );
    let loser = commit.as_ref().err().or(rollback.as_ref().err()).unwrap();
    assert!(conflict_code(loser).is_some(), "loser got {:?}", loser);

    assert_eq!(h.executor.checked_out(), 0);
    assert!(!h.service.previews().is_active(id));

    let final_state = h.service.get_preview(&alice, id).await.unwrap().unwrap();
    if commit.is_ok() {
        assert_eq!(final_state.status, PreviewStatus::Committed);
        assert_eq!(h.executor.committed().len(), 1);
    } else {
        assert_eq!(final_state.status, PreviewStatus::RolledBack);
        assert!(h.executor.committed().is_empty());
    }
}

#[tokio::test]
async fn test_commit_requires_approval() {
    let h = Harness::new();
    let id = h.submit_pending("UPDATE orders SET state = 'x'").await;
    h.service.open_preview(&editor("alice"), id).await.unwrap();

    let err = h.service.commit(&editor("alice"), id).await.unwrap_err();
    assert_eq!(conflict_code(&err), Some("not_approved"));
    // The preview is untouched.
    assert!(h.service.previews().is_active(id));
    assert_eq!(h.executor.checked_out(), 1);
}

#[tokio::test]
async fn test_sweep_expires_only_past_ceiling() {
    let h = Harness::new();
    let id = h.submit_pending("UPDATE orders SET state = 'x'").await;
    h.service.open_preview(&editor("alice"), id).await.unwrap();

    h.clock.advance(chrono::Duration::seconds(299));
    assert_eq!(preview_sweep::run_once(h.service.previews()).await, 0);
    assert!(h.service.previews().is_active(id));

    h.clock.advance(chrono::Duration::seconds(2));
    assert_eq!(preview_sweep::run_once(h.service.previews()).await, 1);
    assert!(!h.service.previews().is_active(id));
    assert_eq!(h.executor.checked_out(), 0);

    let preview = h
        .service
        .get_preview(&editor("alice"), id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(preview.status, PreviewStatus::Failed);
    assert_eq!(preview.error.as_deref(), Some(EXPIRED_MESSAGE));
    assert!(h.notifier.event_types().contains(&"preview_resolved".to_string()));

    // Resolving after expiry finds nothing to resolve.
    let err = h.service.rollback(&editor("alice"), id).await.unwrap_err();
    assert_eq!(conflict_code(&err), Some("preview_not_active"));
}

#[tokio::test]
async fn test_reopen_after_expiry_is_allowed() {
    let h = Harness::new();
    let id = h.submit_pending("UPDATE orders SET state = 'x'").await;
    h.service.open_preview(&editor("alice"), id).await.unwrap();
    h.clock.advance(chrono::Duration::seconds(600));
    preview_sweep::run_once(h.service.previews()).await;

    let again = h.service.open_preview(&editor("alice"), id).await.unwrap();
    assert_eq!(again.status, PreviewStatus::Active);
}

#[tokio::test]
async fn test_failed_preview_releases_connection() {
    let h = Harness::new();
    h.executor.fail_on(
        "ledger",
        ExecError::Statement {
            code: Some("23503".into()),
            message: "violates foreign key constraint".into(),
        },
    );
    let id = h.submit_pending("DELETE FROM ledger WHERE id = 7").await;

    let err = h.service.open_preview(&editor("alice"), id).await.unwrap_err();
    match err {
        AppError::Statement { sqlstate, .. } => assert_eq!(sqlstate.as_deref(), Some("23503")),
        other => panic!("expected statement error, got {:?}", other),
    }
    assert_eq!(h.executor.checked_out(), 0);
    assert!(!h.service.previews().is_active(id));

    let preview = h
        .service
        .get_preview(&editor("alice"), id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(preview.status, PreviewStatus::Failed);
}

#[tokio::test]
async fn test_pool_exhaustion_is_reported_and_recovers() {
    let h = Harness::new();
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(
            h.submit_pending(&format!("UPDATE orders SET state = 'x' WHERE id = {i}"))
                .await,
        );
    }
    for id in &ids[..4] {
        h.service.open_preview(&editor("alice"), *id).await.unwrap();
    }

    let err = h
        .service
        .open_preview(&editor("alice"), ids[4])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PoolExhausted));

    h.service.rollback(&editor("alice"), ids[0]).await.unwrap();
    h.service.open_preview(&editor("alice"), ids[4]).await.unwrap();
    assert_eq!(h.executor.checked_out(), 4);
}

#[tokio::test]
async fn test_direct_execution_without_preview() {
    let h = Harness::new();
    let sql = "INSERT INTO audit (note) VALUES ('hello')";
    let id = h.approved(sql).await;

    let committed = h.service.commit(&editor("alice"), id).await.unwrap();
    assert_eq!(committed.status, PreviewStatus::Committed);
    assert_eq!(committed.preview.unwrap().row_count, SCRIPTED_ROWS);
    assert_eq!(h.executor.committed(), vec![sql.to_string()]);
    assert_eq!(h.executor.checked_out(), 0);

    let err = h.service.commit(&editor("alice"), id).await.unwrap_err();
    assert_eq!(conflict_code(&err), Some("already_committed"));
    let err = h.service.open_preview(&editor("alice"), id).await.unwrap_err();
    assert_eq!(conflict_code(&err), Some("already_committed"));
}

#[tokio::test]
async fn test_commit_after_rolled_back_preview_is_refused() {
    let h = Harness::new();
    let id = h.approved("UPDATE orders SET state = 'x'").await;
    h.service.open_preview(&editor("alice"), id).await.unwrap();
    h.service.rollback(&editor("alice"), id).await.unwrap();

    let err = h.service.commit(&editor("alice"), id).await.unwrap_err();
    assert_eq!(conflict_code(&err), Some("preview_exists"));
    assert!(h.executor.committed().is_empty());
}

#[tokio::test]
async fn test_commit_rejected_by_database_marks_failed() {
    let h = Harness::new();
    let id = h.approved("UPDATE orders SET state = 'x'").await;
    h.service.open_preview(&editor("alice"), id).await.unwrap();
    h.executor.fail_commit(ExecError::Statement {
        code: Some("40001".into()),
        message: "could not serialize access".into(),
    });

    let err = h.service.commit(&editor("alice"), id).await.unwrap_err();
    assert!(matches!(err, AppError::Statement { .. }));

    let preview = h
        .service
        .get_preview(&editor("alice"), id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(preview.status, PreviewStatus::Failed);
    assert!(preview.error.unwrap().contains("commit failed"));
    assert_eq!(h.executor.checked_out(), 0);
}

#[tokio::test]
async fn test_lost_connection_on_commit_is_outcome_unknown() {
    let h = Harness::new();
    let id = h.approved("UPDATE orders SET state = 'x'").await;
    h.service.open_preview(&editor("alice"), id).await.unwrap();
    h.executor
        .fail_commit(ExecError::Connection("connection reset by peer".into()));

    let err = h.service.commit(&editor("alice"), id).await.unwrap_err();
    assert!(matches!(err, AppError::CommitOutcomeUnknown(_)));
}

#[tokio::test]
async fn test_commit_past_deadline_still_completes() {
    let h = Harness::with_config(Config {
        jwt_secret: common::JWT_SECRET.into(),
        request_timeout: Duration::from_millis(50),
        ..Config::default()
    });
    let id = h.approved("UPDATE orders SET state = 'x'").await;
    h.service.open_preview(&editor("alice"), id).await.unwrap();
    h.executor.delay_commit(Duration::from_millis(200));

    let err = h.service.commit(&editor("alice"), id).await.unwrap_err();
    assert!(matches!(err, AppError::CommitOutcomeUnknown(_)));

    tokio::time::sleep(Duration::from_millis(400)).await;
    let preview = h
        .service
        .get_preview(&editor("alice"), id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(preview.status, PreviewStatus::Committed);
    assert_eq!(h.executor.checked_out(), 0);
}

#[tokio::test]
async fn test_abandoned_commit_request_does_not_strand_preview() {
    let h = Arc::new(Harness::new());
    let id = h.approved("UPDATE orders SET state = 'x'").await;
    h.service.open_preview(&editor("alice"), id).await.unwrap();
    h.executor.delay_commit(Duration::from_millis(100));

    let caller = {
        let h = h.clone();
        tokio::spawn(async move { h.service.commit(&editor("alice"), id).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    caller.abort();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!h.service.previews().is_active(id));
    assert_eq!(h.executor.checked_out(), 0);
    let preview = h
        .service
        .get_preview(&editor("alice"), id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(preview.status, PreviewStatus::Committed);
}

#[tokio::test]
async fn test_rejection_while_opening_rolls_back_preview() {
    let h = Harness::new();
    let id = h.submit_pending("UPDATE orders SET state = 'void'").await;
    h.executor.delay_begin(Duration::from_millis(200));
    let alice = editor("alice");
    let rita = reviewer("rita");

    let (opened, decided) = tokio::join!(h.service.open_preview(&alice, id), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.service
            .review(&rita, id, ReviewDecision::Rejected, Some("no".into()))
            .await
    });

    assert_eq!(decided.unwrap().status, ApprovalStatus::Rejected);
    assert_eq!(conflict_code(&opened.unwrap_err()), Some("rejected"));
    assert!(!h.service.previews().is_active(id));
    assert_eq!(h.executor.checked_out(), 0);
    assert_eq!(h.executor.rolled_back.load(Ordering::SeqCst), 1);
    assert!(h.executor.committed().is_empty());

    let preview = h
        .service
        .get_preview(&alice, id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(preview.status, PreviewStatus::RolledBack);
    assert_eq!(
        h.store.latest(id).await.unwrap().unwrap().status,
        PreviewStatus::RolledBack
    );
}

#[tokio::test]
async fn test_open_with_stale_request_after_rejection_is_refused() {
    let h = Harness::new();
    let id = h.submit_pending("DELETE FROM t WHERE id = 1").await;
    let stale = h.store.get_request(id).await.unwrap().unwrap();
    h.service
        .review(&reviewer("rita"), id, ReviewDecision::Rejected, None)
        .await
        .unwrap();

    let err = h.service.previews().open(&stale, "alice").await.unwrap_err();
    assert!(matches!(err, PreviewError::Rejected));
    assert_eq!(h.executor.began.load(Ordering::SeqCst), 0);
    assert_eq!(h.executor.checked_out(), 0);
}

#[tokio::test]
async fn test_commit_while_preview_is_opening_is_not_active() {
    let h = Harness::new();
    let id = h.approved("UPDATE orders SET state = 'x'").await;
    h.executor.delay_begin(Duration::from_millis(200));
    let alice = editor("alice");

    let (opened, committed) = tokio::join!(h.service.open_preview(&alice, id), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.service.commit(&alice, id).await
    });

    assert_eq!(
        conflict_code(&committed.unwrap_err()),
        Some("preview_not_active")
    );
    assert_eq!(opened.unwrap().status, PreviewStatus::Active);
    assert!(h.executor.committed().is_empty());
    assert_eq!(h.executor.checked_out(), 1);
}

#[tokio::test]
async fn test_read_only_statements_are_not_previewed() {
    let h = Harness::new();
    // Selects never reach the queue through submit; seed one directly.
    let stored = h
        .store
        .create_request(Statement {
            text: "SELECT 1".into(),
            data_source_id: h.data_source_id,
            submitted_by: "alice".into(),
            operation: OperationKind::Select,
        })
        .await
        .unwrap();

    let err = h
        .service
        .open_preview(&editor("alice"), stored.id)
        .await
        .unwrap_err();
    assert_eq!(conflict_code(&err), Some("nothing_to_preview"));
}

#[tokio::test]
async fn test_recover_orphans_marks_active_records_failed() {
    let h = Harness::new();
    let id = h.submit_pending("UPDATE orders SET state = 'x'").await;
    let record = h.service.open_preview(&editor("alice"), id).await.unwrap();

    // A fresh process sees only the recorded mirror.
    let orphaned = preview_sweep::recover_orphans(h.store.as_ref()).await.unwrap();
    assert_eq!(orphaned, 1);

    let recorded: Vec<PreviewTransaction> = h.store.previews_for(id).await;
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].id, record.id);
    assert_eq!(recorded[0].status, PreviewStatus::Failed);
    assert_eq!(recorded[0].error.as_deref(), Some(ORPHANED_MESSAGE));
    assert_eq!(
        h.store.latest(id).await.unwrap().unwrap().status,
        PreviewStatus::Failed
    );
}
