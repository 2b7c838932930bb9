use crate::coordinator::Coordinator;
use crate::dispatch::{run_to_terminal, ExecutionStrategy, InFlight};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Duration, Utc};
use conveyor_core::{ConveyorResult, StrategyKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Payload carried through the broker for one dispatched task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchMessage {
    /// Task to execute.
    pub task_id: Uuid,
    /// Owning principal, carried for logging.
    pub owner_id: String,
    /// Correlation id assigned at dispatch.
    pub correlation_id: Uuid,
}

/// One pulled message plus the tag needed to acknowledge it.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The dispatched payload.
    pub message: DispatchMessage,
    /// Acknowledgement tag, unique per delivery.
    pub tag: u64,
}

/// Message broker carrying dispatch messages to the worker pool.
///
/// Workers acknowledge only after the task reached a terminal state;
/// a delivery whose visibility window lapses without an ack is handed
/// out again.
#[async_trait::async_trait]
pub trait QueueBroker: Send + Sync {
    /// Append a message to the queue.
    async fn enqueue(&self, message: DispatchMessage) -> ConveyorResult<()>;

    /// Pull the next visible message, if any.
    async fn pull(&self) -> ConveyorResult<Option<Delivery>>;

    /// Acknowledge a delivery, removing it for good.
    async fn ack(&self, tag: u64) -> ConveyorResult<()>;

    /// Messages waiting to be pulled.
    async fn pending(&self) -> usize;

    /// Deliveries pulled but not yet acknowledged.
    async fn unacked(&self) -> usize;
}

struct BrokerState {
    queue: VecDeque<DispatchMessage>,
    unacked: HashMap<u64, (DispatchMessage, DateTime<Utc>)>,
    next_tag: u64,
}

/// In-process FIFO broker with at-least-once redelivery.
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    visibility: Duration,
}

impl MemoryBroker {
    /// Broker whose deliveries become visible again after `visibility`
    /// without an ack.
    pub fn new(visibility: Duration) -> Self {
        Self {
            state: Mutex::new(BrokerState {
                queue: VecDeque::new(),
                unacked: HashMap::new(),
                next_tag: 0,
            }),
            visibility,
        }
    }

    fn requeue_expired(state: &mut BrokerState, now: DateTime<Utc>) {
        let expired: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in expired {
            if let Some((message, _)) = state.unacked.remove(&tag) {
                warn!(task = %message.task_id, tag, "delivery lapsed, requeueing");
                state.queue.push_front(message);
            }
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(Duration::seconds(30))
    }
}

#[async_trait::async_trait]
impl QueueBroker for MemoryBroker {
    async fn enqueue(&self, message: DispatchMessage) -> ConveyorResult<()> {
        self.state.lock().queue.push_back(message);
        Ok(())
    }

    async fn pull(&self) -> ConveyorResult<Option<Delivery>> {
        let mut state = self.state.lock();
        let now = Utc::now();
        Self::requeue_expired(&mut state, now);
        let Some(message) = state.queue.pop_front() else {
            return Ok(None);
        };
        let tag = state.next_tag;
        state.next_tag += 1;
        state
            .unacked
            .insert(tag, (message.clone(), now + self.visibility));
        Ok(Some(Delivery { message, tag }))
    }

    async fn ack(&self, tag: u64) -> ConveyorResult<()> {
        self.state.lock().unacked.remove(&tag);
        Ok(())
    }

    async fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    async fn unacked(&self) -> usize {
        self.state.lock().unacked.len()
    }
}

/// Dispatch path that enqueues and returns immediately; the worker pool
/// does the actual execution.
pub struct QueueStrategy {
    broker: Arc<dyn QueueBroker>,
}

impl QueueStrategy {
    /// Strategy publishing to `broker`.
    pub fn new(broker: Arc<dyn QueueBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait::async_trait]
impl ExecutionStrategy for QueueStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Queue
    }

    async fn execute(
        &self,
        task_id: Uuid,
        owner_id: &str,
        correlation_id: Uuid,
    ) -> ConveyorResult<()> {
        self.broker
            .enqueue(DispatchMessage {
                task_id,
                owner_id: owner_id.to_string(),
                correlation_id,
            })
            .await?;
        info!(task = %task_id, correlation = %correlation_id, "task enqueued");
        Ok(())
    }
}

/// Pool of workers pulling dispatch messages and running pipelines.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `worker_count` pull loops.
    pub fn start(
        broker: Arc<dyn QueueBroker>,
        coordinator: Arc<Coordinator>,
        retry: RetryPolicy,
        worker_count: usize,
        in_flight: InFlight,
    ) -> Self {
        let handles = (0..worker_count)
            .map(|worker| {
                let broker = Arc::clone(&broker);
                let coordinator = Arc::clone(&coordinator);
                let retry = retry.clone();
                let in_flight = in_flight.clone();
                tokio::spawn(async move {
                    info!(worker, "queue worker started");
                    loop {
                        match broker.pull().await {
                            Ok(Some(delivery)) => {
                                let task_id = delivery.message.task_id;
                                info!(
                                    worker,
                                    task = %task_id,
                                    correlation = %delivery.message.correlation_id,
                                    "worker picked up task"
                                );
                                run_to_terminal(
                                    Arc::clone(&coordinator),
                                    retry.clone(),
                                    task_id,
                                    in_flight.clone(),
                                )
                                .await;
                                // Ack only after the task settled, so a
                                // crash before this point gets redelivered.
                                if let Err(e) = broker.ack(delivery.tag).await {
                                    warn!(worker, task = %task_id, error = %e, "ack failed");
                                }
                            }
                            Ok(None) => {
                                tokio::time::sleep(std::time::Duration::from_millis(25)).await;
                            }
                            Err(e) => {
                                warn!(worker, error = %e, "broker pull failed");
                                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                            }
                        }
                    }
                })
            })
            .collect();
        Self { handles }
    }

    /// Stop all workers immediately.
    pub fn shutdown(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
