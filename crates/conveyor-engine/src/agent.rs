use async_trait::async_trait;
use conveyor_core::ConveyorResult;

/// One named artifact flowing through a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Artifact name, unique within one agent's inputs or outputs.
    pub name: String,
    /// Raw artifact content.
    pub bytes: Vec<u8>,
}

impl WorkItem {
    /// Create a work item.
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

/// Structured result of one agent invocation.
///
/// A [`AgentOutcome::Failure`] is the agent reporting its own, permanent
/// failure — a data problem, never retried. Infrastructure trouble is
/// signalled through the `Err` channel of [`AgentRunner::run`] instead.
#[derive(Debug, Clone)]
pub enum AgentOutcome {
    /// The agent ran and produced zero or more named outputs.
    Success {
        /// Outputs, possibly chained into the next agent's inputs.
        outputs: Vec<WorkItem>,
    },
    /// The agent rejected its input.
    Failure {
        /// Machine-readable code supplied by the agent.
        error_code: String,
        /// Human-readable description supplied by the agent.
        error_message: String,
    },
}

/// External collaborator executing one processing step.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run `agent_id` over `inputs` with the task's parameter object.
    async fn run(
        &self,
        agent_id: &str,
        inputs: &[WorkItem],
        parameters: &serde_json::Value,
    ) -> ConveyorResult<AgentOutcome>;
}
