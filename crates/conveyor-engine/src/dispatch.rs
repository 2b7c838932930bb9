use crate::coordinator::Coordinator;
use crate::retry::RetryPolicy;
use chrono::Utc;
use conveyor_core::{
    codes, ConveyorError, ConveyorResult, DispatchRecord, StrategyKind, TaskPatch, TaskStatus,
};
use conveyor_store::TaskStore;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Process-local set of task ids currently being executed.
///
/// A fast-path duplicate filter only; the conditional `READY→ACTIVE`
/// store write remains the authoritative single-flight guard.
#[derive(Clone, Default)]
pub struct InFlight(Arc<Mutex<HashSet<Uuid>>>);

impl InFlight {
    /// Try to register a task; `false` means it is already in flight.
    pub fn try_insert(&self, task_id: Uuid) -> bool {
        self.0.lock().insert(task_id)
    }

    /// Release a task.
    pub fn remove(&self, task_id: Uuid) {
        self.0.lock().remove(&task_id);
    }

    /// Number of tasks currently registered.
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Whether no tasks are registered.
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

/// Receipt returned by a successful dispatch.
#[derive(Debug, Clone)]
pub struct DispatchToken {
    /// Task that was handed off.
    pub task_id: Uuid,
    /// Which execution path took it.
    pub strategy: StrategyKind,
    /// Correlation id of the execution attempt.
    pub correlation_id: Uuid,
}

/// An execution path a ready task can be handed to.
#[async_trait::async_trait]
pub trait ExecutionStrategy: Send + Sync {
    /// Which kind of path this is, recorded on the task.
    fn kind(&self) -> StrategyKind;

    /// Hand the task off for execution under the given correlation id.
    ///
    /// The hand-off must not block on the pipeline itself.
    async fn execute(&self, task_id: Uuid, owner_id: &str, correlation_id: Uuid)
        -> ConveyorResult<()>;
}

/// Claim a task and drive it to a terminal state, retrying transient
/// infrastructure errors per the policy.
///
/// Shared by the local strategy's spawned executions and the queue
/// workers. Releases the in-flight registration once the execution it
/// won has settled; a lost claim leaves the entry alone, since it
/// belongs to whichever executor holds the task (a redelivered queue
/// message must not strip a live worker's registration).
pub(crate) async fn run_to_terminal(
    coordinator: Arc<Coordinator>,
    retry: RetryPolicy,
    task_id: Uuid,
    in_flight: InFlight,
) {
    match coordinator.claim(task_id).await {
        Ok(_) => {}
        Err(ConveyorError::Conflict(_)) => {
            info!(task = %task_id, "claim lost, another executor holds the task");
            return;
        }
        Err(e) => {
            warn!(task = %task_id, error = %e, "claim failed");
            in_flight.remove(task_id);
            return;
        }
    }

    let mut attempt = 0u32;
    loop {
        match coordinator.run_claimed(task_id).await {
            Ok(()) => break,
            Err(e) if e.is_transient() && attempt < retry.max_retries => {
                attempt += 1;
                let delay = retry.delay_ms(attempt);
                warn!(
                    task = %task_id,
                    attempt,
                    delay_ms = delay,
                    error = %e,
                    "transient execution error, retrying"
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Err(e) => {
                warn!(task = %task_id, error = %e, "execution error exhausted retries");
                if let Err(fail_err) = coordinator
                    .fail(task_id, codes::INTERNAL_ERROR, e.to_string())
                    .await
                {
                    warn!(task = %task_id, error = %fail_err, "failure write did not land");
                }
                break;
            }
        }
    }
    in_flight.remove(task_id);
}

/// Runs the pipeline on the local runtime as a background execution.
pub struct LocalStrategy {
    coordinator: Arc<Coordinator>,
    retry: RetryPolicy,
    in_flight: InFlight,
}

impl LocalStrategy {
    /// Build a local strategy sharing the dispatcher's in-flight set.
    pub fn new(coordinator: Arc<Coordinator>, retry: RetryPolicy, in_flight: InFlight) -> Self {
        Self {
            coordinator,
            retry,
            in_flight,
        }
    }
}

#[async_trait::async_trait]
impl ExecutionStrategy for LocalStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Local
    }

    async fn execute(
        &self,
        task_id: Uuid,
        _owner_id: &str,
        _correlation_id: Uuid,
    ) -> ConveyorResult<()> {
        let coordinator = Arc::clone(&self.coordinator);
        let retry = self.retry.clone();
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            run_to_terminal(coordinator, retry, task_id, in_flight).await;
        });
        Ok(())
    }
}

/// Front door for execution hand-off.
///
/// Validates the task's state, records the dispatch on the task, and
/// delegates to the configured strategy. Duplicate submissions are
/// rejected with [`ConveyorError::AlreadyProcessing`] whichever guard
/// catches them first.
pub struct Dispatcher {
    strategy: Arc<dyn ExecutionStrategy>,
    store: Arc<dyn TaskStore>,
    in_flight: InFlight,
}

impl Dispatcher {
    /// Build a dispatcher over a strategy and the shared in-flight set.
    pub fn new(
        strategy: Arc<dyn ExecutionStrategy>,
        store: Arc<dyn TaskStore>,
        in_flight: InFlight,
    ) -> Self {
        Self {
            strategy,
            store,
            in_flight,
        }
    }

    /// Hand a `READY` task to the execution strategy.
    pub async fn submit(&self, task_id: Uuid) -> ConveyorResult<DispatchToken> {
        let task = self
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| ConveyorError::NotFound(format!("task {task_id}")))?;
        match task.status {
            TaskStatus::Ready => {}
            TaskStatus::Active => return Err(ConveyorError::AlreadyProcessing(task_id)),
            other => {
                return Err(ConveyorError::Conflict(format!(
                    "task {task_id} is {other}, not ready for dispatch"
                )))
            }
        }

        if !self.in_flight.try_insert(task_id) {
            return Err(ConveyorError::AlreadyProcessing(task_id));
        }

        // Record the hand-off while the task is still READY; losing this
        // write means another dispatcher got there first.
        let correlation_id = Uuid::new_v4();
        let record = DispatchRecord {
            strategy: self.strategy.kind(),
            correlation_id,
            dispatched_at: Utc::now(),
        };
        match self
            .store
            .transition(
                task_id,
                TaskStatus::Ready,
                None,
                TaskPatch::default().with_dispatch(record),
            )
            .await
        {
            Ok(_) => {}
            Err(ConveyorError::Conflict(_)) => {
                self.in_flight.remove(task_id);
                return Err(ConveyorError::AlreadyProcessing(task_id));
            }
            Err(e) => {
                self.in_flight.remove(task_id);
                return Err(e);
            }
        }

        if let Err(e) = self
            .strategy
            .execute(task_id, &task.owner_id, correlation_id)
            .await
        {
            self.in_flight.remove(task_id);
            warn!(task = %task_id, error = %e, "execution hand-off failed");
            return Err(e);
        }

        info!(
            task = %task_id,
            strategy = %self.strategy.kind(),
            correlation = %correlation_id,
            "task dispatched"
        );
        Ok(DispatchToken {
            task_id,
            strategy: self.strategy.kind(),
            correlation_id,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::agent::{AgentOutcome, AgentRunner, WorkItem};
    use conveyor_billing::LedgerBilling;
    use conveyor_core::{TaskRecord, ToolCatalog, ToolSpec};
    use conveyor_staging::MemoryStagingClient;
    use conveyor_store::MemoryTaskStore;
    use std::collections::HashMap;

    struct NoopRunner;

    #[async_trait::async_trait]
    impl AgentRunner for NoopRunner {
        async fn run(
            &self,
            _agent_id: &str,
            _inputs: &[WorkItem],
            _parameters: &serde_json::Value,
        ) -> ConveyorResult<AgentOutcome> {
            Ok(AgentOutcome::Success {
                outputs: Vec::new(),
            })
        }
    }

    fn coordinator(store: Arc<MemoryTaskStore>) -> Arc<Coordinator> {
        let mut catalog = ToolCatalog::new();
        catalog.register(ToolSpec {
            tool_id: "dedup".into(),
            agents: vec!["profile".into()],
            chain_outputs: false,
            checkpoint_partial: false,
        });
        Arc::new(Coordinator::new(
            store,
            Arc::new(MemoryStagingClient::new()),
            Arc::new(LedgerBilling::new(HashMap::from([(
                "profile".to_string(),
                10,
            )]))),
            Arc::new(NoopRunner),
            Arc::new(catalog),
            chrono::Duration::seconds(60),
        ))
    }

    #[tokio::test]
    async fn lost_claim_leaves_the_winners_registration_alone() {
        let store = Arc::new(MemoryTaskStore::new());
        let mut task = TaskRecord::new("owner-1", "dedup", vec!["profile".into()]);
        // Already claimed by another executor.
        task.status = TaskStatus::Active;
        store.insert(&task).await.unwrap();

        let in_flight = InFlight::default();
        assert!(in_flight.try_insert(task.task_id));
        run_to_terminal(
            coordinator(store),
            RetryPolicy::none(),
            task.task_id,
            in_flight.clone(),
        )
        .await;
        assert_eq!(in_flight.len(), 1);
    }

    #[tokio::test]
    async fn settled_execution_releases_its_registration() {
        let store = Arc::new(MemoryTaskStore::new());
        let mut task = TaskRecord::new("owner-1", "dedup", vec!["profile".into()]);
        task.status = TaskStatus::Ready;
        store.insert(&task).await.unwrap();

        let in_flight = InFlight::default();
        assert!(in_flight.try_insert(task.task_id));
        run_to_terminal(
            coordinator(Arc::clone(&store)),
            RetryPolicy::none(),
            task.task_id,
            in_flight.clone(),
        )
        .await;

        // No wallet was funded, so the task settles as failed; either
        // way the registration must be gone.
        let settled = store.get(task.task_id).await.unwrap().unwrap();
        assert!(settled.status.is_terminal());
        assert!(in_flight.is_empty());
    }
}
