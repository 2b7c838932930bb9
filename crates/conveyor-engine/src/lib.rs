//! Task lifecycle and execution dispatch engine.
//!
//! Clients drive tasks through [`TaskService`]: create, stage inputs,
//! trigger, poll status, fetch outputs, cancel, delete. Triggering hands
//! the task to the [`Dispatcher`], which routes it through the configured
//! [`ExecutionStrategy`] (in-process background execution or a queue with
//! a [`WorkerPool`]). The [`Coordinator`] claims the task with a
//! conditional store write, reserves billing upfront for the whole agent
//! pipeline, then runs the agents in order, checkpointing progress and
//! honouring cancellation at every agent boundary. A background
//! [`Reaper`] reclaims tasks abandoned in staging or execution.

/// Agent runner seam and work items.
pub mod agent;
/// Engine configuration, TOML-loadable.
pub mod config;
/// Pipeline execution for one claimed task.
pub mod coordinator;
/// Single-flight hand-off and execution strategies.
pub mod dispatch;
/// Queue-backed execution: broker, strategy, worker pool.
pub mod queue;
/// Background reclamation of stale and orphaned tasks.
pub mod reaper;
/// Backoff policy for transient infrastructure errors.
pub mod retry;
/// Client-facing lifecycle operations.
pub mod service;

pub use agent::{AgentOutcome, AgentRunner, WorkItem};
pub use config::EngineConfig;
pub use coordinator::Coordinator;
pub use dispatch::{DispatchToken, Dispatcher, ExecutionStrategy, InFlight, LocalStrategy};
pub use queue::{Delivery, DispatchMessage, MemoryBroker, QueueBroker, QueueStrategy, WorkerPool};
pub use reaper::{Reaper, SweepReport};
pub use retry::RetryPolicy;
pub use service::{OutputEntry, StagingTicket, StatusView, TaskService};

use chrono::Duration;
use conveyor_billing::BillingGate;
use conveyor_core::{StrategyKind, ToolCatalog};
use conveyor_staging::StagingClient;
use conveyor_store::TaskStore;
use std::sync::Arc;

/// A fully wired engine: the client-facing service plus the background
/// machinery behind it.
pub struct Engine {
    /// Client-facing lifecycle operations.
    pub service: Arc<TaskService>,
    /// Background janitor; call [`Reaper::start`] to run periodic sweeps.
    pub reaper: Arc<Reaper>,
    /// Worker pool, present only under the queue strategy. Workers stop
    /// when this is dropped.
    pub workers: Option<WorkerPool>,
}

impl Engine {
    /// Assemble an engine from its collaborators and configuration.
    pub fn build(
        config: EngineConfig,
        store: Arc<dyn TaskStore>,
        staging: Arc<dyn StagingClient>,
        billing: Arc<dyn BillingGate>,
        runner: Arc<dyn AgentRunner>,
        catalog: ToolCatalog,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&store),
            Arc::clone(&staging),
            billing,
            runner,
            Arc::clone(&catalog),
            Duration::seconds(config.soft_timeout_secs as i64),
        ));
        let in_flight = InFlight::default();

        let (strategy, workers): (Arc<dyn ExecutionStrategy>, Option<WorkerPool>) =
            match config.strategy {
                StrategyKind::Local => (
                    Arc::new(LocalStrategy::new(
                        Arc::clone(&coordinator),
                        config.retry.clone(),
                        in_flight.clone(),
                    )),
                    None,
                ),
                StrategyKind::Queue => {
                    let broker: Arc<dyn QueueBroker> = Arc::new(MemoryBroker::default());
                    let workers = WorkerPool::start(
                        Arc::clone(&broker),
                        Arc::clone(&coordinator),
                        config.retry.clone(),
                        config.worker_count,
                        in_flight.clone(),
                    );
                    (Arc::new(QueueStrategy::new(broker)), Some(workers))
                }
            };

        let dispatcher = Arc::new(Dispatcher::new(strategy, Arc::clone(&store), in_flight));
        let service = Arc::new(TaskService::new(
            Arc::clone(&store),
            Arc::clone(&staging),
            catalog,
            dispatcher,
            Duration::seconds(config.handle_ttl_secs as i64),
        ));
        let reaper = Arc::new(Reaper::new(store, staging, &config));
        Self {
            service,
            reaper,
            workers,
        }
    }
}
