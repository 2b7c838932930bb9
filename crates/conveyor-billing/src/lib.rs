//! Billing gate: upfront, idempotent, all-or-nothing credit reservation.
//!
//! Before any agent runs, the coordinator reserves the total cost of the
//! whole agent set in one atomic operation keyed by an idempotency key
//! derived from the task id. A repeated reservation with the same key is
//! a no-op returning the original outcome, which is what makes retried
//! triggers safe. There is no partial consumption and no refund path.

/// Gate trait and reservation outcomes.
pub mod gate;
/// In-process wallet + ledger implementation.
pub mod ledger;

pub use gate::{AgentCost, BillingGate, ReserveOutcome};
pub use ledger::LedgerBilling;
