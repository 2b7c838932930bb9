use crate::retry::RetryPolicy;
use conveyor_core::{ConveyorError, ConveyorResult, StrategyKind};
use serde::{Deserialize, Serialize};

/// Engine configuration: execution strategy, pool sizing, timeouts, and
/// the retry policy. Deserializable from TOML; every field has a default
/// so a partial file works.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Which execution path the dispatcher uses; a deployment choice, not
    /// a per-task one.
    #[serde(default = "default_strategy")]
    pub strategy: StrategyKind,
    /// Worker pool size under the queue strategy.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Lifetime of upload/download handles, seconds.
    #[serde(default = "default_handle_ttl_secs")]
    pub handle_ttl_secs: u64,
    /// Tasks stuck before `READY` longer than this are expired, seconds.
    #[serde(default = "default_staging_timeout_secs")]
    pub staging_timeout_secs: u64,
    /// Soft per-task execution deadline checked at agent boundaries, seconds.
    #[serde(default = "default_soft_timeout_secs")]
    pub soft_timeout_secs: u64,
    /// Hard deadline after which the reaper fails a silent `ACTIVE` task,
    /// measured from its last update, seconds.
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,
    /// Reaper sweep interval, seconds.
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    /// Backoff for transient infrastructure errors.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_strategy() -> StrategyKind {
    StrategyKind::Local
}
fn default_worker_count() -> usize {
    4
}
fn default_handle_ttl_secs() -> u64 {
    900
}
fn default_staging_timeout_secs() -> u64 {
    3_600
}
fn default_soft_timeout_secs() -> u64 {
    1_800
}
fn default_execution_timeout_secs() -> u64 {
    3_600
}
fn default_reaper_interval_secs() -> u64 {
    60
}

impl Default for EngineConfig {
    fn default() -> Self {
        #[allow(clippy::expect_used)]
        toml::from_str("").expect("defaults always deserialize")
    }
}

impl EngineConfig {
    /// Parse a config from TOML text.
    pub fn from_toml(text: &str) -> ConveyorResult<Self> {
        toml::from_str(text)
            .map_err(|e| ConveyorError::Validation(format!("invalid engine config: {e}")))
    }

    /// Load a config from a TOML file.
    pub async fn load(path: &std::path::Path) -> ConveyorResult<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::from_toml(&text)
    }
}
