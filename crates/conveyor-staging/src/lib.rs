//! Staging area client: artifact storage behind time-limited handles.
//!
//! Inputs are uploaded and outputs downloaded out-of-band through signed,
//! expiring handles; the engine itself only verifies existence, reads and
//! writes bytes, and purges whole task prefixes. Two backends ship:
//! [`MemoryStagingClient`] for tests and [`LocalStagingClient`] rooted at
//! a local directory.

/// Client trait and backends.
pub mod client;
/// HMAC-signed, expiring handle tokens.
pub mod handle;

pub use client::{LocalStagingClient, MemoryStagingClient, StagingClient, StagingHandle};
pub use handle::HandleSigner;
