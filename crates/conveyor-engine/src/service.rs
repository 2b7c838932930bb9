use crate::dispatch::Dispatcher;
use chrono::Duration;
use conveyor_core::{
    codes, ConveyorError, ConveyorResult, TaskPatch, TaskRecord, TaskStatus, ToolCatalog,
};
use conveyor_staging::{StagingClient, StagingHandle};
use conveyor_store::TaskStore;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Client-facing snapshot of a task's progress.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusView {
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// 0–100.
    pub progress: u8,
    /// Agent currently executing, if any.
    pub current_step: Option<String>,
    /// Failure code, on failure paths.
    pub error_code: Option<String>,
    /// Failure description, on failure paths.
    pub error_message: Option<String>,
}

/// One retrievable output artifact of a completed task.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OutputEntry {
    /// Artifact identifier relative to the task's output prefix.
    pub identifier: String,
    /// Pre-authorized download handle.
    pub handle: StagingHandle,
    /// Size in bytes.
    pub size: u64,
}

/// Upload handles returned by the staging step.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StagingTicket {
    /// One handle per requested file, in request order.
    pub uploads: Vec<StagingHandle>,
}

/// The lifecycle operations clients drive a task through.
///
/// Owns validation and the `CREATED→STAGING→READY` half of the state
/// graph; everything from the `READY→ACTIVE` claim onward belongs to the
/// dispatcher and coordinator.
pub struct TaskService {
    store: Arc<dyn TaskStore>,
    staging: Arc<dyn StagingClient>,
    catalog: Arc<ToolCatalog>,
    dispatcher: Arc<Dispatcher>,
    handle_ttl: Duration,
}

impl TaskService {
    /// Wire the service over its collaborators.
    pub fn new(
        store: Arc<dyn TaskStore>,
        staging: Arc<dyn StagingClient>,
        catalog: Arc<ToolCatalog>,
        dispatcher: Arc<Dispatcher>,
        handle_ttl: Duration,
    ) -> Self {
        Self {
            store,
            staging,
            catalog,
            dispatcher,
            handle_ttl,
        }
    }

    /// Submit a new task for `tool_id`, optionally narrowing the agent
    /// pipeline.
    pub async fn create(
        &self,
        owner_id: &str,
        tool_id: &str,
        agents: Option<Vec<String>>,
    ) -> ConveyorResult<TaskRecord> {
        let pipeline = self.catalog.validate_selection(tool_id, agents.as_deref())?;
        let task = TaskRecord::new(owner_id, tool_id, pipeline);
        self.store.insert(&task).await?;
        info!(task = %task.task_id, tool = tool_id, owner = owner_id, "task created");
        Ok(task)
    }

    /// Issue upload handles for the named input files and capture the
    /// per-agent parameters.
    ///
    /// Legal from `CREATED`, `STAGING` (re-issuing handles) and
    /// `STAGING_FAILED` (retry after a failed trigger).
    pub async fn stage(
        &self,
        task_id: Uuid,
        file_names: &[String],
        params: serde_json::Value,
    ) -> ConveyorResult<StagingTicket> {
        if file_names.is_empty() {
            return Err(ConveyorError::Validation(
                "at least one input file is required".into(),
            ));
        }
        let task = self.load(task_id).await?;
        match task.status {
            TaskStatus::Created | TaskStatus::Staging | TaskStatus::StagingFailed => {}
            other => {
                return Err(ConveyorError::Conflict(format!(
                    "task {task_id} is {other}, staging is closed"
                )))
            }
        }

        let input_keys: Vec<String> = file_names
            .iter()
            .map(|name| format!("{}{}", task.input_prefix(), name))
            .collect();
        let mut uploads = Vec::with_capacity(input_keys.len());
        for key in &input_keys {
            uploads.push(self.staging.issue_upload_handle(key, self.handle_ttl).await?);
        }

        // A re-stage after STAGING_FAILED must not keep the old failure.
        let mut patch = TaskPatch::to_status(TaskStatus::Staging)
            .with_progress(10, None)
            .with_error_cleared();
        patch.input_keys = Some(input_keys);
        patch.params = Some(params);
        self.store
            .transition(task_id, task.status, None, patch)
            .await?;
        info!(task = %task_id, files = uploads.len(), "staging handles issued");
        Ok(StagingTicket { uploads })
    }

    /// Verify the staged inputs, hand the task to the dispatcher, and
    /// return the refreshed status.
    pub async fn trigger(&self, task_id: Uuid) -> ConveyorResult<StatusView> {
        let task = self.load(task_id).await?;
        match task.status {
            TaskStatus::Staging => {
                self.verify_inputs(&task).await?;
                match self
                    .store
                    .transition(
                        task_id,
                        TaskStatus::Staging,
                        None,
                        TaskPatch::to_status(TaskStatus::Ready)
                            .with_progress(15, None)
                            .with_error_cleared(),
                    )
                    .await
                {
                    Ok(_) => {}
                    // Someone else triggered concurrently; fall through to
                    // the dispatcher, whose guards settle the race.
                    Err(ConveyorError::Conflict(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            TaskStatus::Ready => {}
            TaskStatus::Active => return Err(ConveyorError::AlreadyProcessing(task_id)),
            other => {
                return Err(ConveyorError::Conflict(format!(
                    "task {task_id} is {other}, not triggerable"
                )))
            }
        }
        let token = self.dispatcher.submit(task_id).await?;
        debug!(
            task = %task_id,
            strategy = %token.strategy,
            correlation = %token.correlation_id,
            "trigger dispatched"
        );
        self.status(task_id).await
    }

    /// Current status, progress and error details.
    pub async fn status(&self, task_id: Uuid) -> ConveyorResult<StatusView> {
        let task = self.load(task_id).await?;
        Ok(StatusView {
            status: task.status,
            progress: task.progress,
            current_step: task.current_step,
            error_code: task.error_code,
            error_message: task.error_message,
        })
    }

    /// Download handles for the outputs of a completed task.
    pub async fn outputs(&self, task_id: Uuid) -> ConveyorResult<Vec<OutputEntry>> {
        let task = self.load(task_id).await?;
        if task.status != TaskStatus::Completed {
            return Err(ConveyorError::Conflict(format!(
                "task {task_id} is {}, outputs are available once completed",
                task.status
            )));
        }
        let prefix = task.output_prefix();
        let mut entries = Vec::with_capacity(task.output_keys.len());
        for key in &task.output_keys {
            let identifier = key.strip_prefix(&prefix).unwrap_or(key).to_string();
            let handle = self
                .staging
                .issue_download_handle(key, self.handle_ttl)
                .await?;
            let size = self.staging.size(key).await?;
            entries.push(OutputEntry {
                identifier,
                handle,
                size,
            });
        }
        Ok(entries)
    }

    /// Cancel an active task.
    ///
    /// The terminal transition happens here; the flag additionally stops
    /// an in-flight pipeline at its next agent boundary. Agents that
    /// already ran are not undone and reserved credits are not restored.
    pub async fn cancel(&self, task_id: Uuid) -> ConveyorResult<TaskRecord> {
        let mut patch = TaskPatch::to_status(TaskStatus::Cancelled);
        patch.cancel_requested = Some(true);
        match self
            .store
            .transition(task_id, TaskStatus::Active, None, patch)
            .await
        {
            Ok(task) => {
                info!(task = %task_id, "task cancelled");
                Ok(task)
            }
            Err(ConveyorError::Conflict(_)) => {
                let task = self.load(task_id).await?;
                Err(ConveyorError::Conflict(format!(
                    "task {task_id} is {}, only active tasks can be cancelled",
                    task.status
                )))
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a task and purge everything under its storage prefix.
    ///
    /// Refused while the task is active; cancel first. Returns the number
    /// of artifacts removed.
    pub async fn delete(&self, task_id: Uuid) -> ConveyorResult<u64> {
        let task = self.load(task_id).await?;
        if task.status == TaskStatus::Active {
            return Err(ConveyorError::Conflict(format!(
                "task {task_id} is active, cancel it before deleting"
            )));
        }
        let removed = self.staging.delete_by_prefix(&task.storage_prefix()).await?;
        self.store.delete(task_id).await?;
        info!(task = %task_id, removed, "task deleted");
        Ok(removed)
    }

    async fn load(&self, task_id: Uuid) -> ConveyorResult<TaskRecord> {
        self.store
            .get(task_id)
            .await?
            .ok_or_else(|| ConveyorError::NotFound(format!("task {task_id}")))
    }

    /// Every declared input must exist in staging before dispatch.
    async fn verify_inputs(&self, task: &TaskRecord) -> ConveyorResult<()> {
        let mut missing = Vec::new();
        for key in &task.input_keys {
            if !self.staging.exists(key).await? {
                missing.push(key.clone());
            }
        }
        if missing.is_empty() {
            return Ok(());
        }
        let message = format!("missing staged inputs: {}", missing.join(", "));
        warn!(task = %task.task_id, %message, "trigger verification failed");
        match self
            .store
            .transition(
                task.task_id,
                TaskStatus::Staging,
                None,
                TaskPatch::to_status(TaskStatus::StagingFailed)
                    .with_error(codes::FILES_NOT_FOUND, &message),
            )
            .await
        {
            Ok(_) | Err(ConveyorError::Conflict(_)) => {}
            Err(e) => return Err(e),
        }
        Err(ConveyorError::Staging(message))
    }
}
