//! Background job: expire preview transactions held open past the ceiling.
//!
//! Every expiry rolls back and releases the connection, and the preview is
//! recorded as failed. This is the only corrective action taken without a
//! human asking for it.

use std::time::Duration;

use tokio::time;

use crate::engine::PreviewManager;
use crate::store::{PreviewRecorder, StoreError};

pub const ORPHANED_MESSAGE: &str = "orphaned by restart";

/// Spawn the sweep task. Call this once at startup.
pub fn spawn(manager: PreviewManager, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            run_once(&manager).await;
        }
    })
}

pub async fn run_once(manager: &PreviewManager) -> usize {
    let expired = manager.sweep_expired().await;
    if expired > 0 {
        tracing::info!(expired, "expired idle preview transactions");
    }
    expired
}

/// Previews recorded as active by a previous process have lost their
/// connection, and with it their transaction. Mark them failed.
pub async fn recover_orphans(recorder: &dyn PreviewRecorder) -> Result<u64, StoreError> {
    let orphaned = recorder.mark_orphaned(ORPHANED_MESSAGE).await?;
    if orphaned > 0 {
        tracing::warn!(orphaned, "marked orphaned previews as failed");
    }
    Ok(orphaned)
}
