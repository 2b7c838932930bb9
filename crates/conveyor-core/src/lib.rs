//! Core types and error definitions for the Conveyor task engine.
//!
//! This crate provides the foundational types shared across all Conveyor
//! crates: the unified error enum, the task record and its status state
//! machine, the tool catalog, and the pure progress tracker.
//!
//! # Main types
//!
//! - [`ConveyorError`] — Unified error enum for all Conveyor subsystems.
//! - [`ConveyorResult`] — Convenience alias for `Result<T, ConveyorError>`.
//! - [`TaskRecord`] — The central task entity with lifecycle timestamps.
//! - [`TaskStatus`] — The task state machine (edge checks included).
//! - [`ToolCatalog`] — Named tool configurations selecting eligible agents.

/// Progress mapping from task status and pipeline position.
pub mod progress;
/// Task record, status state machine, and conditional-update patches.
pub mod task;
/// Tool catalog: named agent pipelines with chaining and checkpoint policy.
pub mod tool;

pub use progress::progress_for;
pub use task::{DispatchRecord, StrategyKind, TaskPatch, TaskRecord, TaskStatus};
pub use tool::{ToolCatalog, ToolSpec};

/// Top-level error type for the Conveyor engine.
///
/// Each variant corresponds to a failure class in the error taxonomy; the
/// dispatcher's retry policy consults [`ConveyorError::is_transient`] to
/// decide whether an attempt is worth repeating.
#[derive(Debug, thiserror::Error)]
pub enum ConveyorError {
    /// An unknown tool/agent or malformed request, rejected synchronously.
    #[error("validation error: {0}")]
    Validation(String),

    /// Required artifacts were absent or staging bookkeeping failed.
    #[error("staging error: {0}")]
    Staging(String),

    /// A billing failure (insufficient credits, missing wallet).
    #[error("billing error: {0}")]
    Billing(String),

    /// An agent reported its own failure (a data problem, never retried).
    #[error("agent error [{code}]: {message}")]
    AgentLogic {
        /// Machine-readable code supplied by the agent.
        code: String,
        /// Human-readable description supplied by the agent.
        message: String,
    },

    /// A transient infrastructure hiccup (network, storage, broker).
    #[error("transient infrastructure error: {0}")]
    Transient(String),

    /// A soft or hard execution deadline was exceeded.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The task store rejected or failed an operation.
    #[error("store error: {0}")]
    Store(String),

    /// A conditional write lost the race (expected state did not match).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The task already has an outstanding dispatch token.
    #[error("task {0} is already processing")]
    AlreadyProcessing(uuid::Uuid),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConveyorError {
    /// Whether this error is worth retrying with backoff.
    ///
    /// Only infrastructure hiccups qualify; validation, billing, and
    /// agent-reported failures are permanent by definition.
    pub fn is_transient(&self) -> bool {
        matches!(self, ConveyorError::Transient(_) | ConveyorError::Io(_))
    }
}

/// A convenience `Result` alias using [`ConveyorError`].
pub type ConveyorResult<T> = Result<T, ConveyorError>;

/// Machine-readable error codes written to a task's `error_code` field.
pub mod codes {
    /// Unknown tool/agent or malformed request.
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    /// Staging verification failed at trigger time.
    pub const FILES_NOT_FOUND: &str = "FILES_NOT_FOUND";
    /// The owner's balance does not cover the full agent set.
    pub const BILLING_INSUFFICIENT_CREDITS: &str = "BILLING_INSUFFICIENT_CREDITS";
    /// The owner has no wallet at all.
    pub const BILLING_WALLET_MISSING: &str = "BILLING_WALLET_MISSING";
    /// An agent reported its own failure.
    pub const AGENT_ERROR: &str = "AGENT_ERROR";
    /// Infrastructure retries were exhausted or an unexpected error escaped.
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    /// A soft or hard execution deadline was exceeded.
    pub const TIMEOUT: &str = "TIMEOUT";
    /// A second trigger arrived while a dispatch token was outstanding.
    pub const ALREADY_PROCESSING: &str = "ALREADY_PROCESSING";
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ConveyorError::Transient("broker unreachable".into()).is_transient());
        assert!(ConveyorError::Io(std::io::Error::other("disk")).is_transient());

        assert!(!ConveyorError::Validation("bad tool".into()).is_transient());
        assert!(!ConveyorError::Billing("no credits".into()).is_transient());
        assert!(!ConveyorError::AgentLogic {
            code: "BAD_FORMAT".into(),
            message: "not csv".into()
        }
        .is_transient());
        assert!(!ConveyorError::Timeout("soft deadline".into()).is_transient());
    }

    #[test]
    fn agent_logic_display_includes_code() {
        let err = ConveyorError::AgentLogic {
            code: "BAD_FORMAT".into(),
            message: "row 3 is not valid".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("BAD_FORMAT"));
        assert!(msg.contains("row 3"));
    }
}
