//! Transaction previews: a real transaction is opened for an approval request,
//! the statement runs inside it, and the transaction is held open until it is
//! committed, rolled back, or expired by the sweep.
//!
//! Each approval id moves through `Opening → Active → Closing → removed` in
//! the slot table. Transitions are single-key atomic swaps, so exactly one of
//! commit, rollback and expire can take an active preview; the others see
//! [`PreviewError::NotActive`]. The long-running work happens on spawned tasks,
//! so a caller that goes away mid-request never leaves a half-open slot behind.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

use super::clock::Clock;
use super::executor::{DataSourceExecutor, ExecError, OpenTransaction, QueryResult};
use crate::models::{
    ApprovalRequest, ApprovalStatus, PreviewSnapshot, PreviewStatus, PreviewTransaction,
};
use crate::notification::{ApprovalEvent, NotificationSink};
use crate::sql::{delete_to_select, OperationKind};
use crate::store::{PreviewRecorder, StoreError};

pub const EXPIRED_MESSAGE: &str = "preview expired after idle timeout";

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("a preview is already open for this approval")]
    AlreadyActive,

    #[error("no active preview for this approval")]
    NotActive,

    #[error("approval request is {0}, not approved")]
    NotApproved(ApprovalStatus),

    #[error("statement has already been committed")]
    AlreadyCommitted,

    #[error("a previous preview ended as {0}; direct execution is not allowed")]
    PreviewExists(PreviewStatus),

    #[error("commit failed: {0}")]
    CommitFailed(ExecError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("approval request was rejected")]
    Rejected,

    #[error("preview task was interrupted")]
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct PreviewSettings {
    /// Rows kept in a preview sample.
    pub sample_rows: usize,
    /// Previews open longer than this are expired by the sweep.
    pub ceiling: Duration,
    /// How long closed previews stay in memory.
    pub retention: Duration,
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            sample_rows: 20,
            ceiling: Duration::seconds(300),
            retention: Duration::hours(24),
        }
    }
}

enum Slot {
    Opening,
    Active(Box<ActivePreview>),
    Closing(PreviewTransaction),
}

struct ActivePreview {
    record: PreviewTransaction,
    // Mutex only to make the slot table Sync; never contended.
    tx: Mutex<Box<dyn OpenTransaction>>,
}

#[derive(Debug, Clone, Copy)]
enum Resolution {
    Commit,
    Rollback,
    Expire,
}

/// Removes an `Opening` slot unless disarmed. Dropping it on any early
/// return or task abort frees the approval for another open.
struct Reservation {
    slots: Arc<DashMap<Uuid, Slot>>,
    approval_id: Uuid,
    armed: bool,
}

impl Reservation {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            self.slots
                .remove_if(&self.approval_id, |_, slot| matches!(slot, Slot::Opening));
        }
    }
}

#[derive(Clone)]
pub struct PreviewManager {
    executor: Arc<dyn DataSourceExecutor>,
    recorder: Arc<dyn PreviewRecorder>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    settings: PreviewSettings,
    slots: Arc<DashMap<Uuid, Slot>>,
    finished: Arc<DashMap<Uuid, PreviewTransaction>>,
    /// Rejected approvals, so an open racing the rejection never activates.
    rejected: Arc<DashMap<Uuid, DateTime<Utc>>>,
}

impl PreviewManager {
    pub fn new(
        executor: Arc<dyn DataSourceExecutor>,
        recorder: Arc<dyn PreviewRecorder>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        settings: PreviewSettings,
    ) -> Self {
        Self {
            executor,
            recorder,
            notifier,
            clock,
            settings,
            slots: Arc::new(DashMap::new()),
            finished: Arc::new(DashMap::new()),
            rejected: Arc::new(DashMap::new()),
        }
    }

    pub fn settings(&self) -> &PreviewSettings {
        &self.settings
    }

    /// Open a preview: begin, run the statement, capture a bounded sample,
    /// and hold the transaction open.
    pub async fn open(
        &self,
        request: &ApprovalRequest,
        opened_by: &str,
    ) -> Result<PreviewTransaction, PreviewError> {
        let reservation = self.reserve(request.id)?;
        let this = self.clone();
        let request = request.clone();
        let opened_by = opened_by.to_string();
        tokio::spawn(async move { this.open_reserved(reservation, request, opened_by).await })
            .await
            .map_err(|_| PreviewError::Interrupted)?
    }

    async fn open_reserved(
        &self,
        reservation: Reservation,
        request: ApprovalRequest,
        opened_by: String,
    ) -> Result<PreviewTransaction, PreviewError> {
        if self.rejected.contains_key(&request.id) {
            return Err(PreviewError::Rejected);
        }
        if let Some(prev) = self.latest(request.id).await? {
            if prev.status == PreviewStatus::Committed {
                return Err(PreviewError::AlreadyCommitted);
            }
        }

        let mut tx = self.executor.begin(request.data_source_id()).await?;
        let record = PreviewTransaction {
            id: Uuid::new_v4(),
            approval_id: request.id,
            data_source_id: request.data_source_id(),
            statement: request.statement.text.clone(),
            operation: request.statement.operation,
            opened_by: opened_by.clone(),
            status: PreviewStatus::Active,
            preview: None,
            error: None,
            opened_at: self.clock.now(),
            closed_at: None,
        };

        match self.capture(tx.as_mut(), &request).await {
            Ok(snapshot) => {
                let record = PreviewTransaction {
                    preview: Some(snapshot),
                    ..record
                };
                if let Err(tx) = self.activate(&record, tx) {
                    return self.abandon_rejected(reservation, record, tx, &opened_by).await;
                }
                reservation.disarm();
                tracing::info!(
                    approval_id = %request.id,
                    preview_id = %record.id,
                    opened_by = %opened_by,
                    row_count = record.preview.as_ref().map(|p| p.row_count),
                    "preview opened"
                );
                self.persist(&record).await;
                Ok(record)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    tracing::warn!(approval_id = %request.id, error = %rb, "rollback after failed preview");
                }
                let failed = record.close(PreviewStatus::Failed, Some(e.to_string()), self.clock.now());
                self.finished.insert(request.id, failed.clone());
                drop(reservation);
                tracing::warn!(approval_id = %request.id, error = %e, "preview execution failed");
                self.persist(&failed).await;
                Err(PreviewError::Exec(e))
            }
        }
    }

    /// Swap the reserved `Opening` slot for `Active` under the slot lock.
    /// Refused, handing the transaction back, when the approval was rejected
    /// while the statement ran.
    fn activate(
        &self,
        record: &PreviewTransaction,
        tx: Box<dyn OpenTransaction>,
    ) -> Result<(), Box<dyn OpenTransaction>> {
        let Some(mut slot) = self.slots.get_mut(&record.approval_id) else {
            return Err(tx);
        };
        let rejected = self.rejected.contains_key(&record.approval_id);
        if rejected || !matches!(slot.value(), Slot::Opening) {
            return Err(tx);
        }
        *slot.value_mut() = Slot::Active(Box::new(ActivePreview {
            record: record.clone(),
            tx: Mutex::new(tx),
        }));
        Ok(())
    }

    async fn abandon_rejected(
        &self,
        reservation: Reservation,
        record: PreviewTransaction,
        tx: Box<dyn OpenTransaction>,
        actor: &str,
    ) -> Result<PreviewTransaction, PreviewError> {
        let approval_id = record.approval_id;
        let error = match tx.rollback().await {
            Ok(()) => PreviewError::Rejected.to_string(),
            Err(e) => format!("{}; rollback reported: {e}", PreviewError::Rejected),
        };
        let closed = record.close(PreviewStatus::RolledBack, Some(error), self.clock.now());
        self.finished.insert(approval_id, closed.clone());
        drop(reservation);
        tracing::warn!(%approval_id, preview_id = %closed.id, "approval rejected while preview was opening");
        self.persist(&closed).await;
        self.notifier
            .notify(ApprovalEvent::preview_resolved(&closed, actor));
        Err(PreviewError::Rejected)
    }

    /// Run the statement, and for deletes the matching SELECT first so the
    /// sample shows the rows about to disappear.
    async fn capture(
        &self,
        tx: &mut dyn OpenTransaction,
        request: &ApprovalRequest,
    ) -> Result<PreviewSnapshot, ExecError> {
        let sql = &request.statement.text;
        let limit = self.settings.sample_rows;

        let sample = if request.statement.operation == OperationKind::Delete {
            match delete_to_select(sql) {
                Ok(select) => Some(tx.execute(&select, limit).await?),
                Err(e) => {
                    tracing::debug!(approval_id = %request.id, error = %e, "no dry-run sample for delete");
                    None
                }
            }
        } else {
            None
        };

        let result = tx.execute(sql, limit).await?;
        Ok(snapshot(sample, result))
    }

    /// Commit the active preview. The request must be approved; otherwise
    /// the preview is left untouched.
    pub async fn commit(
        &self,
        request: &ApprovalRequest,
        actor: &str,
    ) -> Result<PreviewTransaction, PreviewError> {
        if request.status != ApprovalStatus::Approved {
            return Err(PreviewError::NotApproved(request.status));
        }
        let active = self.take_active(request.id, |_| true)?;
        self.finish(active, Resolution::Commit, actor.to_string()).await
    }

    pub async fn rollback(&self, approval_id: Uuid, actor: &str) -> Result<PreviewTransaction, PreviewError> {
        let active = self.take_active(approval_id, |_| true)?;
        self.finish(active, Resolution::Rollback, actor.to_string()).await
    }

    /// Roll back the preview of a rejected approval, including one that is
    /// still opening, and refuse any later open.
    pub async fn discard_rejected(
        &self,
        approval_id: Uuid,
        actor: &str,
    ) -> Result<Option<PreviewTransaction>, PreviewError> {
        // Marked before the slot is inspected; `activate` checks the mark
        // under the slot lock.
        self.rejected.insert(approval_id, self.clock.now());
        let Ok(active) = self.take_active(approval_id, |_| true) else {
            return Ok(None);
        };
        self.finish(active, Resolution::Rollback, actor.to_string())
            .await
            .map(Some)
    }

    /// Expire every preview open longer than the ceiling and prune old
    /// finished records. Returns how many previews were expired.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let ceiling = self.settings.ceiling;
        let stale = |record: &PreviewTransaction| now - record.opened_at >= ceiling;

        let candidates: Vec<Uuid> = self
            .slots
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Active(active) if stale(&active.record) => Some(*entry.key()),
                _ => None,
            })
            .collect();

        let mut expired = 0;
        for approval_id in candidates {
            // Someone else may have resolved it since the scan.
            let Ok(active) = self.take_active(approval_id, stale) else {
                continue;
            };
            if self
                .finish(active, Resolution::Expire, "system".to_string())
                .await
                .is_ok()
            {
                expired += 1;
            }
        }

        let retention = self.settings.retention;
        self.finished
            .retain(|_, p| p.closed_at.map_or(true, |closed| now - closed < retention));
        self.rejected.retain(|_, at| now - *at < retention);

        expired
    }

    /// Begin, execute and commit in one step for an approved request that
    /// was never previewed.
    pub async fn execute_direct(
        &self,
        request: &ApprovalRequest,
        actor: &str,
    ) -> Result<PreviewTransaction, PreviewError> {
        if request.status != ApprovalStatus::Approved {
            return Err(PreviewError::NotApproved(request.status));
        }
        // An occupied slot here is a preview still opening or closing.
        let reservation = self
            .reserve(request.id)
            .map_err(|_| PreviewError::NotActive)?;
        let this = self.clone();
        let request = request.clone();
        let actor = actor.to_string();
        tokio::spawn(async move { this.execute_reserved(reservation, request, actor).await })
            .await
            .map_err(|_| PreviewError::Interrupted)?
    }

    async fn execute_reserved(
        &self,
        reservation: Reservation,
        request: ApprovalRequest,
        actor: String,
    ) -> Result<PreviewTransaction, PreviewError> {
        if let Some(prev) = self.latest(request.id).await? {
            return Err(match prev.status {
                PreviewStatus::Committed => PreviewError::AlreadyCommitted,
                status => PreviewError::PreviewExists(status),
            });
        }

        let mut tx = self.executor.begin(request.data_source_id()).await?;
        let record = PreviewTransaction {
            id: Uuid::new_v4(),
            approval_id: request.id,
            data_source_id: request.data_source_id(),
            statement: request.statement.text.clone(),
            operation: request.statement.operation,
            opened_by: actor.clone(),
            status: PreviewStatus::Active,
            preview: None,
            error: None,
            opened_at: self.clock.now(),
            closed_at: None,
        };

        let outcome = match tx.execute(&request.statement.text, self.settings.sample_rows).await {
            Ok(result) => match tx.commit().await {
                Ok(()) => Ok(snapshot(None, result)),
                Err(e) => Err(PreviewError::CommitFailed(e)),
            },
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    tracing::warn!(approval_id = %request.id, error = %rb, "rollback after failed execution");
                }
                Err(PreviewError::Exec(e))
            }
        };

        let now = self.clock.now();
        let (closed, result) = match outcome {
            Ok(snap) => {
                let closed = PreviewTransaction {
                    preview: Some(snap),
                    ..record
                }
                .close(PreviewStatus::Committed, None, now);
                (closed.clone(), Ok(closed))
            }
            Err(e) => (
                record.close(PreviewStatus::Failed, Some(e.to_string()), now),
                Err(e),
            ),
        };

        self.finished.insert(request.id, closed.clone());
        drop(reservation);
        tracing::info!(
            approval_id = %request.id,
            status = %closed.status,
            actor = %actor,
            "direct execution finished"
        );
        self.persist(&closed).await;
        self.notifier
            .notify(ApprovalEvent::preview_resolved(&closed, &actor));
        result
    }

    /// Current preview for an approval: active or closing first, then the
    /// most recent finished one.
    pub async fn get(&self, approval_id: Uuid) -> Result<Option<PreviewTransaction>, PreviewError> {
        if let Some(slot) = self.slots.get(&approval_id) {
            match slot.value() {
                Slot::Active(active) => return Ok(Some(active.record.clone())),
                Slot::Closing(record) => return Ok(Some(record.clone())),
                Slot::Opening => {}
            }
        }
        self.latest(approval_id).await
    }

    /// Snapshot of every active preview.
    pub fn active(&self) -> Vec<PreviewTransaction> {
        let mut previews: Vec<PreviewTransaction> = self
            .slots
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Active(active) => Some(active.record.clone()),
                _ => None,
            })
            .collect();
        previews.sort_by_key(|p| p.opened_at);
        previews
    }

    pub fn is_active(&self, approval_id: Uuid) -> bool {
        self.slots
            .get(&approval_id)
            .map_or(false, |slot| matches!(slot.value(), Slot::Active(_)))
    }

    fn reserve(&self, approval_id: Uuid) -> Result<Reservation, PreviewError> {
        match self.slots.entry(approval_id) {
            Entry::Occupied(_) => Err(PreviewError::AlreadyActive),
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Opening);
                Ok(Reservation {
                    slots: Arc::clone(&self.slots),
                    approval_id,
                    armed: true,
                })
            }
        }
    }

    /// Atomically move an active slot to closing and hand back its transaction.
    fn take_active(
        &self,
        approval_id: Uuid,
        eligible: impl Fn(&PreviewTransaction) -> bool,
    ) -> Result<ActivePreview, PreviewError> {
        let mut slot = self
            .slots
            .get_mut(&approval_id)
            .ok_or(PreviewError::NotActive)?;
        let record = match slot.value() {
            Slot::Active(active) if eligible(&active.record) => active.record.clone(),
            _ => return Err(PreviewError::NotActive),
        };
        match std::mem::replace(slot.value_mut(), Slot::Closing(record)) {
            Slot::Active(active) => Ok(*active),
            other => {
                *slot.value_mut() = other;
                Err(PreviewError::NotActive)
            }
        }
    }

    async fn finish(
        &self,
        active: ActivePreview,
        resolution: Resolution,
        actor: String,
    ) -> Result<PreviewTransaction, PreviewError> {
        let this = self.clone();
        tokio::spawn(async move { this.resolve(active, resolution, actor).await })
            .await
            .map_err(|_| PreviewError::Interrupted)?
    }

    async fn resolve(
        &self,
        active: ActivePreview,
        resolution: Resolution,
        actor: String,
    ) -> Result<PreviewTransaction, PreviewError> {
        let ActivePreview { record, tx } = active;
        let tx = tx.into_inner().unwrap_or_else(|e| e.into_inner());
        let approval_id = record.approval_id;

        let (status, error, failure) = match resolution {
            Resolution::Commit => match tx.commit().await {
                Ok(()) => (PreviewStatus::Committed, None, None),
                Err(e) => (
                    PreviewStatus::Failed,
                    Some(format!("commit failed: {e}")),
                    Some(PreviewError::CommitFailed(e)),
                ),
            },
            Resolution::Rollback => match tx.rollback().await {
                Ok(()) => (PreviewStatus::RolledBack, None, None),
                // The connection is discarded, which rolls back server side.
                Err(e) => (
                    PreviewStatus::RolledBack,
                    Some(format!("rollback reported: {e}")),
                    None,
                ),
            },
            Resolution::Expire => {
                if let Err(e) = tx.rollback().await {
                    tracing::warn!(%approval_id, error = %e, "rollback of expired preview failed");
                }
                (PreviewStatus::Failed, Some(EXPIRED_MESSAGE.to_string()), None)
            }
        };

        let closed = record.close(status, error, self.clock.now());
        self.finished.insert(approval_id, closed.clone());
        self.slots
            .remove_if(&approval_id, |_, slot| matches!(slot, Slot::Closing(_)));

        tracing::info!(
            %approval_id,
            preview_id = %closed.id,
            status = %closed.status,
            actor = %actor,
            "preview resolved"
        );
        self.persist(&closed).await;
        self.notifier
            .notify(ApprovalEvent::preview_resolved(&closed, &actor));

        match failure {
            Some(e) => Err(e),
            None => Ok(closed),
        }
    }

    async fn latest(&self, approval_id: Uuid) -> Result<Option<PreviewTransaction>, PreviewError> {
        if let Some(p) = self.finished.get(&approval_id) {
            return Ok(Some(p.clone()));
        }
        Ok(self.recorder.latest(approval_id).await?)
    }

    /// The in-memory table is authoritative; a failed write only loses the mirror.
    async fn persist(&self, preview: &PreviewTransaction) {
        if let Err(e) = self.recorder.record(preview).await {
            tracing::error!(
                approval_id = %preview.approval_id,
                preview_id = %preview.id,
                error = %e,
                "failed to record preview state"
            );
        }
    }
}

fn snapshot(sample: Option<QueryResult>, result: QueryResult) -> PreviewSnapshot {
    match sample {
        Some(sample) => PreviewSnapshot {
            row_count: result.rows_affected.max(sample.rows_returned),
            columns: sample.columns,
            rows: sample.rows,
            truncated: sample.truncated,
        },
        None => PreviewSnapshot {
            row_count: result.row_count(),
            columns: result.columns,
            rows: result.rows,
            truncated: result.truncated,
        },
    }
}
