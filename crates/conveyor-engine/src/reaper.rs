use crate::config::EngineConfig;
use chrono::{Duration, Utc};
use conveyor_core::{codes, ConveyorError, ConveyorResult, TaskPatch, TaskRecord, TaskStatus};
use conveyor_staging::StagingClient;
use conveyor_store::TaskStore;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stale `CREATED`/`STAGING` tasks expired and purged.
    pub expired: usize,
    /// `ACTIVE` tasks whose executor went silent, failed with a timeout.
    pub timed_out: usize,
}

/// Background janitor reclaiming abandoned tasks.
///
/// Every transition it makes is a conditional write pinned to the status
/// and `updated_at` it observed, so a task that moved on between the
/// listing and the write is simply skipped until the next sweep.
pub struct Reaper {
    store: Arc<dyn TaskStore>,
    staging: Arc<dyn StagingClient>,
    staging_timeout: Duration,
    execution_timeout: Duration,
    interval: std::time::Duration,
}

impl Reaper {
    /// Build a reaper from the engine configuration.
    pub fn new(
        store: Arc<dyn TaskStore>,
        staging: Arc<dyn StagingClient>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            staging,
            staging_timeout: Duration::seconds(config.staging_timeout_secs as i64),
            execution_timeout: Duration::seconds(config.execution_timeout_secs as i64),
            interval: std::time::Duration::from_secs(config.reaper_interval_secs),
        }
    }

    /// Scan every task once and reclaim the stale ones.
    pub async fn sweep_once(&self) -> ConveyorResult<SweepReport> {
        let now = Utc::now();
        let mut report = SweepReport::default();
        for task in self.store.list().await? {
            let stale_staging =
                task.status.is_expirable() && now - task.created_at > self.staging_timeout;
            let silent_active =
                task.status == TaskStatus::Active && now - task.updated_at > self.execution_timeout;
            if stale_staging && self.expire(&task).await? {
                report.expired += 1;
            } else if silent_active && self.time_out(&task).await? {
                report.timed_out += 1;
            }
        }
        if report != SweepReport::default() {
            info!(
                expired = report.expired,
                timed_out = report.timed_out,
                "sweep reclaimed tasks"
            );
        }
        Ok(report)
    }

    /// Expire one stale task and purge its staged artifacts.
    async fn expire(&self, task: &TaskRecord) -> ConveyorResult<bool> {
        match self
            .store
            .transition(
                task.task_id,
                task.status,
                Some(task.updated_at),
                TaskPatch::to_status(TaskStatus::Expired),
            )
            .await
        {
            Ok(_) => {}
            Err(ConveyorError::Conflict(_)) => {
                debug!(task = %task.task_id, "task moved on, skipping expiry");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        let removed = self.staging.delete_by_prefix(&task.storage_prefix()).await?;
        info!(task = %task.task_id, removed, "expired stale task and purged staging");

        // Status-preserving marker; losing it only means the purge gets
        // logged without the flag.
        match self
            .store
            .transition(
                task.task_id,
                TaskStatus::Expired,
                None,
                TaskPatch::default().with_cleanup_done(),
            )
            .await
        {
            Ok(_) => {}
            Err(e) => warn!(task = %task.task_id, error = %e, "cleanup marker not written"),
        }
        Ok(true)
    }

    /// Fail one abandoned active task.
    async fn time_out(&self, task: &TaskRecord) -> ConveyorResult<bool> {
        match self
            .store
            .transition(
                task.task_id,
                TaskStatus::Active,
                Some(task.updated_at),
                TaskPatch::to_status(TaskStatus::Failed).with_error(
                    codes::TIMEOUT,
                    "no progress within the execution timeout",
                ),
            )
            .await
        {
            Ok(_) => {
                info!(task = %task.task_id, "timed out silent active task");
                Ok(true)
            }
            Err(ConveyorError::Conflict(_)) => {
                debug!(task = %task.task_id, "task progressed, skipping timeout");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Run periodic sweeps until the handle is aborted.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_once().await {
                    warn!(error = %e, "sweep failed");
                }
            }
        })
    }
}
