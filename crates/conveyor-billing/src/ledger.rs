use crate::gate::{AgentCost, BillingGate, ReserveOutcome};
use async_trait::async_trait;
use conveyor_core::{ConveyorError, ConveyorResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{info, warn};

struct LedgerState {
    wallets: HashMap<String, u64>,
    /// idempotency key -> recorded outcome; at most one entry per key.
    ledger: HashMap<String, ReserveOutcome>,
}

/// In-process billing gate: wallets plus an idempotency-keyed ledger.
///
/// The whole check-and-reserve runs under one lock with no awaits inside,
/// so duplicate triggers racing on the same key can never double-charge.
pub struct LedgerBilling {
    prices: HashMap<String, u64>,
    state: Mutex<LedgerState>,
}

impl LedgerBilling {
    /// Create a gate with the given per-agent price table.
    pub fn new(prices: HashMap<String, u64>) -> Self {
        Self {
            prices,
            state: Mutex::new(LedgerState {
                wallets: HashMap::new(),
                ledger: HashMap::new(),
            }),
        }
    }

    /// Create or top up a wallet.
    pub fn credit(&self, owner_id: &str, amount: u64) {
        let mut state = self.state.lock();
        *state.wallets.entry(owner_id.to_string()).or_insert(0) += amount;
    }

    /// Current balance, if the owner has a wallet.
    pub fn balance(&self, owner_id: &str) -> Option<u64> {
        self.state.lock().wallets.get(owner_id).copied()
    }

    /// Recorded outcome for an idempotency key, if any.
    pub fn ledger_entry(&self, idempotency_key: &str) -> Option<ReserveOutcome> {
        self.state.lock().ledger.get(idempotency_key).cloned()
    }

    /// Number of ledger entries (test/inspection hook).
    pub fn ledger_len(&self) -> usize {
        self.state.lock().ledger.len()
    }

    fn breakdown(&self, agent_ids: &[String]) -> ConveyorResult<Vec<AgentCost>> {
        agent_ids
            .iter()
            .map(|id| {
                self.prices
                    .get(id)
                    .map(|&cost| AgentCost {
                        agent_id: id.clone(),
                        cost,
                    })
                    .ok_or_else(|| {
                        ConveyorError::Validation(format!("no price for agent '{id}'"))
                    })
            })
            .collect()
    }
}

#[async_trait]
impl BillingGate for LedgerBilling {
    async fn reserve(
        &self,
        owner_id: &str,
        agent_ids: &[String],
        idempotency_key: &str,
    ) -> ConveyorResult<ReserveOutcome> {
        let breakdown = self.breakdown(agent_ids)?;
        let required: u64 = breakdown.iter().map(|c| c.cost).sum();

        let mut state = self.state.lock();

        // Replay: same key returns the original outcome, consumes nothing.
        if let Some(outcome) = state.ledger.get(idempotency_key) {
            return Ok(outcome.clone());
        }

        let outcome = match state.wallets.get_mut(owner_id) {
            None => {
                warn!(owner = owner_id, key = idempotency_key, "wallet missing");
                ReserveOutcome::WalletMissing
            }
            Some(balance) if *balance < required => {
                warn!(
                    owner = owner_id,
                    key = idempotency_key,
                    required,
                    balance = *balance,
                    "insufficient credits"
                );
                ReserveOutcome::InsufficientCredits {
                    required,
                    balance: *balance,
                    shortfall: required - *balance,
                    breakdown,
                }
            }
            Some(balance) => {
                *balance -= required;
                info!(
                    owner = owner_id,
                    key = idempotency_key,
                    total_cost = required,
                    "credits reserved"
                );
                ReserveOutcome::Reserved {
                    total_cost: required,
                }
            }
        };

        state
            .ledger
            .insert(idempotency_key.to_string(), outcome.clone());
        Ok(outcome)
    }
}
