//! Retention service for time-based data purge.
//!
//! Runs as a background task that drops checkpoint history and traces
//! older than `retention_days`. The latest checkpoint of every thread is
//! always kept; trace children go before their parent.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::checkpoint_repo::CheckpointRepo;
use super::db::Database;
use super::trace_repo::TraceRepo;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Row counts removed by one purge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Expired superseded checkpoint versions deleted.
    pub checkpoints: u64,
    /// Expired traces deleted (their children go with them).
    pub traces: u64,
}

/// Spawn the retention purge background task.
///
/// The task runs hourly, starting immediately, until `cancel` fires.
#[must_use]
pub fn spawn_retention_task(
    db: Arc<Database>,
    retention_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = purge(&db, retention_days).await {
                        error!(?err, "retention purge failed");
                    }
                }
            }
        }
    })
}

/// Run one purge pass.
///
/// # Errors
///
/// Returns `AppError::Db` if any delete fails.
pub async fn purge(db: &Arc<Database>, retention_days: u32) -> Result<PurgeReport> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));

    let checkpoints = CheckpointRepo::new(Arc::clone(db)).purge_superseded(cutoff).await?;
    let traces = TraceRepo::new(Arc::clone(db)).purge_older_than(cutoff).await?;

    info!(retention_days, checkpoints, traces, "retention purge completed");
    Ok(PurgeReport {
        checkpoints,
        traces,
    })
}
