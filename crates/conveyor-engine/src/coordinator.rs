use crate::agent::{AgentOutcome, AgentRunner, WorkItem};
use chrono::{Duration, Utc};
use conveyor_billing::{BillingGate, ReserveOutcome};
use conveyor_core::{
    codes, progress_for, ConveyorError, ConveyorResult, TaskPatch, TaskRecord, TaskStatus,
    ToolCatalog, ToolSpec,
};
use conveyor_staging::StagingClient;
use conveyor_store::TaskStore;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Runs exactly one task's pipeline to a terminal outcome.
///
/// The coordinator claims the task with a conditional `READY→ACTIVE`
/// write (the single-flight guarantee), gates billing for the full agent
/// set, then iterates agents strictly in order, checking the cancellation
/// flag and the soft deadline at every agent boundary. All of its status
/// writes are conditional on `ACTIVE`, so a concurrent cancellation or a
/// reaper sweep simply makes the next write lose and the pipeline stop.
pub struct Coordinator {
    store: Arc<dyn TaskStore>,
    staging: Arc<dyn StagingClient>,
    billing: Arc<dyn BillingGate>,
    runner: Arc<dyn AgentRunner>,
    catalog: Arc<ToolCatalog>,
    soft_timeout: Duration,
}

impl Coordinator {
    /// Wire a coordinator over its collaborators.
    pub fn new(
        store: Arc<dyn TaskStore>,
        staging: Arc<dyn StagingClient>,
        billing: Arc<dyn BillingGate>,
        runner: Arc<dyn AgentRunner>,
        catalog: Arc<ToolCatalog>,
        soft_timeout: Duration,
    ) -> Self {
        Self {
            store,
            staging,
            billing,
            runner,
            catalog,
            soft_timeout,
        }
    }

    /// The idempotency key protecting this task's billing reservation.
    pub fn billing_key(task_id: Uuid) -> String {
        format!("billing:{task_id}")
    }

    /// Atomically claim the task (`READY→ACTIVE`).
    ///
    /// A [`ConveyorError::Conflict`] means another coordinator holds the
    /// claim; the caller must abort with no side effects.
    pub async fn claim(&self, task_id: Uuid) -> ConveyorResult<TaskRecord> {
        let claimed = self
            .store
            .transition(
                task_id,
                TaskStatus::Ready,
                None,
                TaskPatch::to_status(TaskStatus::Active).with_progress(15, None),
            )
            .await?;
        info!(task = %task_id, "claimed for execution");
        Ok(claimed)
    }

    /// Run the pipeline of an already-claimed task.
    ///
    /// Permanent failures (billing, agent logic, soft timeout) are
    /// resolved internally with a terminal `FAILED` transition and return
    /// `Ok`. Only infrastructure errors escape, for the dispatcher's
    /// retry policy to handle; retrying re-enters here and the billing
    /// replay makes that safe.
    pub async fn run_claimed(&self, task_id: Uuid) -> ConveyorResult<()> {
        let task = self
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| ConveyorError::NotFound(format!("task {task_id}")))?;
        if task.status != TaskStatus::Active {
            info!(task = %task_id, status = %task.status, "not active, nothing to run");
            return Ok(());
        }

        let Some(tool) = self.catalog.get(&task.tool_id).cloned() else {
            self.fail(
                task_id,
                codes::VALIDATION_ERROR,
                format!("tool '{}' vanished from the catalog", task.tool_id),
            )
            .await?;
            return Ok(());
        };

        if !self.gate_billing(&task).await? {
            return Ok(());
        }

        self.run_pipeline(&task, &tool).await
    }

    /// Terminal `ACTIVE→FAILED` transition with error fields.
    ///
    /// Losing the conditional write means someone else already drove the
    /// task terminal (cancel, reaper); that is not an error here.
    pub async fn fail(
        &self,
        task_id: Uuid,
        code: &str,
        message: impl Into<String>,
    ) -> ConveyorResult<()> {
        let message = message.into();
        match self
            .store
            .transition(
                task_id,
                TaskStatus::Active,
                None,
                TaskPatch::to_status(TaskStatus::Failed).with_error(code, &message),
            )
            .await
        {
            Ok(_) => {
                error!(task = %task_id, code, message, "task failed");
                Ok(())
            }
            Err(ConveyorError::Conflict(_)) => {
                warn!(task = %task_id, code, "failure write lost, task already terminal");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Reserve credits for the full agent set. Returns whether to proceed.
    async fn gate_billing(&self, task: &TaskRecord) -> ConveyorResult<bool> {
        let key = Self::billing_key(task.task_id);
        match self
            .billing
            .reserve(&task.owner_id, &task.agents, &key)
            .await?
        {
            ReserveOutcome::Reserved { total_cost } => {
                info!(task = %task.task_id, total_cost, "billing reserved");
                Ok(true)
            }
            ReserveOutcome::InsufficientCredits {
                required,
                balance,
                shortfall,
                ..
            } => {
                self.fail(
                    task.task_id,
                    codes::BILLING_INSUFFICIENT_CREDITS,
                    format!(
                        "required {required} credits, balance {balance}, short by {shortfall}"
                    ),
                )
                .await?;
                Ok(false)
            }
            ReserveOutcome::WalletMissing => {
                self.fail(
                    task.task_id,
                    codes::BILLING_WALLET_MISSING,
                    format!("owner '{}' has no wallet", task.owner_id),
                )
                .await?;
                Ok(false)
            }
        }
    }

    async fn run_pipeline(&self, task: &TaskRecord, tool: &ToolSpec) -> ConveyorResult<()> {
        let task_id = task.task_id;
        let total = task.agents.len();
        let started = task.processing_started_at.unwrap_or(task.created_at);
        let soft_deadline = started + self.soft_timeout;

        let mut working = self.load_inputs(task).await?;
        let mut buffered: Vec<(String, WorkItem)> = Vec::new();
        let mut output_keys: Vec<String> = Vec::new();

        for (idx, agent_id) in task.agents.iter().enumerate() {
            // Agent boundary: cancellation, staleness, soft deadline.
            let Some(current) = self.store.get(task_id).await? else {
                warn!(task = %task_id, "task deleted mid-pipeline");
                return Ok(());
            };
            if current.status != TaskStatus::Active {
                info!(task = %task_id, status = %current.status, "pipeline stopped externally");
                return Ok(());
            }
            if current.cancel_requested {
                self.finish_cancelled(task_id).await;
                return Ok(());
            }
            if Utc::now() > soft_deadline {
                self.fail(
                    task_id,
                    codes::TIMEOUT,
                    format!("soft execution deadline exceeded before agent '{agent_id}'"),
                )
                .await?;
                return Ok(());
            }

            let progress = progress_for(TaskStatus::Active, idx, total, current.progress);
            if !self
                .write_progress(task_id, progress, Some(agent_id.clone()), None)
                .await?
            {
                return Ok(());
            }

            info!(task = %task_id, agent = %agent_id, step = idx + 1, total, "running agent");
            match self.runner.run(agent_id, &working, &task.params).await? {
                AgentOutcome::Failure {
                    error_code,
                    error_message,
                } => {
                    error!(
                        task = %task_id,
                        agent = %agent_id,
                        code = %error_code,
                        "agent reported failure"
                    );
                    self.fail(
                        task_id,
                        codes::AGENT_ERROR,
                        format!("agent '{agent_id}' failed [{error_code}]: {error_message}"),
                    )
                    .await?;
                    return Ok(());
                }
                AgentOutcome::Success { outputs } => {
                    if tool.checkpoint_partial {
                        for item in &outputs {
                            let key = self.persist_output(task, agent_id, item).await?;
                            output_keys.push(key);
                        }
                        if !self
                            .write_progress(task_id, progress, None, Some(output_keys.clone()))
                            .await?
                        {
                            return Ok(());
                        }
                    } else {
                        buffered.extend(
                            outputs
                                .iter()
                                .map(|item| (agent_id.clone(), item.clone())),
                        );
                    }
                    if tool.chain_outputs && !outputs.is_empty() {
                        working = outputs;
                    }
                }
            }
        }

        for (agent_id, item) in &buffered {
            let key = self.persist_output(task, agent_id, item).await?;
            output_keys.push(key);
        }

        let mut patch = TaskPatch::to_status(TaskStatus::Completed).with_progress(100, None);
        patch.current_step = Some(None);
        patch.output_keys = Some(output_keys);
        match self
            .store
            .transition(task_id, TaskStatus::Active, None, patch)
            .await
        {
            Ok(_) => info!(task = %task_id, "pipeline completed"),
            Err(ConveyorError::Conflict(_)) => {
                info!(task = %task_id, "completion write lost, task driven terminal elsewhere");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn load_inputs(&self, task: &TaskRecord) -> ConveyorResult<Vec<WorkItem>> {
        let mut items = Vec::with_capacity(task.input_keys.len());
        for key in &task.input_keys {
            let bytes = self.staging.read(key).await?;
            let name = key.rsplit('/').next().unwrap_or(key).to_string();
            items.push(WorkItem { name, bytes });
        }
        Ok(items)
    }

    async fn persist_output(
        &self,
        task: &TaskRecord,
        agent_id: &str,
        item: &WorkItem,
    ) -> ConveyorResult<String> {
        let key = format!("{}{}/{}", task.output_prefix(), agent_id, item.name);
        self.staging.write(&key, &item.bytes).await?;
        Ok(key)
    }

    /// Status-preserving progress write; `false` means the task left
    /// `ACTIVE` and the pipeline must stop.
    async fn write_progress(
        &self,
        task_id: Uuid,
        progress: u8,
        step: Option<String>,
        output_keys: Option<Vec<String>>,
    ) -> ConveyorResult<bool> {
        let mut patch = TaskPatch::default().with_progress(progress, step.clone());
        if step.is_none() {
            // Leave the current step label untouched.
            patch.current_step = None;
        }
        patch.output_keys = output_keys;
        match self
            .store
            .transition(task_id, TaskStatus::Active, None, patch)
            .await
        {
            Ok(_) => Ok(true),
            Err(ConveyorError::Conflict(_)) => {
                info!(task = %task_id, "progress write lost, stopping pipeline");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn finish_cancelled(&self, task_id: Uuid) {
        match self
            .store
            .transition(
                task_id,
                TaskStatus::Active,
                None,
                TaskPatch::to_status(TaskStatus::Cancelled),
            )
            .await
        {
            Ok(_) => info!(task = %task_id, "cancelled at agent boundary"),
            Err(_) => info!(task = %task_id, "cancellation already finalized"),
        }
    }
}
