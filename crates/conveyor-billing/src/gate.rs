use async_trait::async_trait;
use conveyor_core::ConveyorResult;
use serde::{Deserialize, Serialize};

/// One line of a reservation's per-agent cost breakdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCost {
    /// Agent identifier.
    pub agent_id: String,
    /// Credits this agent costs.
    pub cost: u64,
}

/// Outcome of a reservation attempt.
///
/// Only [`ReserveOutcome::Reserved`] consumes anything; the other two
/// outcomes leave the wallet untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ReserveOutcome {
    /// The full amount was deducted in a single operation.
    Reserved {
        /// Total credits consumed for the whole agent set.
        total_cost: u64,
    },
    /// The balance does not cover the full agent set; nothing consumed.
    InsufficientCredits {
        /// Credits required for the whole agent set.
        required: u64,
        /// Credits available at reservation time.
        balance: u64,
        /// `required - balance`.
        shortfall: u64,
        /// Per-agent cost breakdown.
        breakdown: Vec<AgentCost>,
    },
    /// The owner has no wallet at all; nothing consumed.
    WalletMissing,
}

/// External billing collaborator.
///
/// `reserve` computes the total cost of the full agent set upfront and
/// deducts it atomically, keyed by `idempotency_key`: a repeated call with
/// the same key returns the originally recorded outcome without touching
/// the wallet again.
#[async_trait]
pub trait BillingGate: Send + Sync {
    /// Reserve credits for the whole agent set, exactly once per key.
    async fn reserve(
        &self,
        owner_id: &str,
        agent_ids: &[String],
        idempotency_key: &str,
    ) -> ConveyorResult<ReserveOutcome>;
}
