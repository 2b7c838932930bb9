//! Durable task records with conditional (compare-and-swap) transitions.
//!
//! The task store is the single source of truth for a task's lifecycle:
//! every status change goes through one conditional write that names the
//! expected current status (and optionally the expected `updated_at`
//! marker), so concurrent writers — a dispatcher claim, a cancellation
//! request, a reaper sweep — can never both succeed on the same
//! transition.
//!
//! Two implementations ship: [`MemoryTaskStore`] for tests and
//! single-process deployments, and [`FileTaskStore`] persisting one JSON
//! file per task.

/// Store trait and backends.
pub mod store;

pub use store::{FileTaskStore, MemoryTaskStore, TaskStore};
