use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a task.
///
/// The only legal transitions are the edges encoded in
/// [`TaskStatus::can_transition_to`]; terminal states have no outgoing
/// edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Submitted, no staging handles issued yet.
    Created,
    /// Upload handles issued, waiting for artifacts.
    Staging,
    /// Staging verification failed; the client may re-stage.
    StagingFailed,
    /// Artifacts verified present; eligible for dispatch.
    Ready,
    /// Claimed by a coordinator; the pipeline is running.
    Active,
    /// All agents ran and outputs were persisted.
    Completed,
    /// The pipeline ended with an error.
    Failed,
    /// Cancelled while active; already-run agents are not undone.
    Cancelled,
    /// Reclaimed by the reaper before any pipeline ran.
    Expired,
}

impl TaskStatus {
    /// Whether this status has no outgoing edges.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Expired
        )
    }

    /// Whether the reaper may expire a task in this status for staleness.
    pub fn is_expirable(self) -> bool {
        matches!(self, TaskStatus::Created | TaskStatus::Staging)
    }

    /// Whether `next` is reachable from `self` in a single transition.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Created, Staging)
                | (Created, Expired)
                | (Staging, Ready)
                | (Staging, StagingFailed)
                | (Staging, Expired)
                | (StagingFailed, Staging)
                | (Ready, Active)
                | (Active, Completed)
                | (Active, Failed)
                | (Active, Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Created => "created",
            TaskStatus::Staging => "staging",
            TaskStatus::StagingFailed => "staging_failed",
            TaskStatus::Ready => "ready",
            TaskStatus::Active => "active",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

/// Which execution path the dispatcher handed a task to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Background execution on the local runtime.
    Local,
    /// Queue-backed worker pool behind a broker.
    Queue,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::Local => write!(f, "local"),
            StrategyKind::Queue => write!(f, "queue"),
        }
    }
}

/// Dispatch bookkeeping written by the dispatcher, read by the coordinator
/// and the reaper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    /// The execution path that handled (or is handling) this task.
    pub strategy: StrategyKind,
    /// Correlation id for cancellation/inspection of the external side.
    pub correlation_id: Uuid,
    /// When the hand-off happened.
    pub dispatched_at: DateTime<Utc>,
}

/// The central task entity; the single source of truth for a task's
/// lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Opaque unique identifier, assigned at creation.
    pub task_id: Uuid,
    /// The requesting principal.
    pub owner_id: String,
    /// Selects which ordered set of agents is eligible.
    pub tool_id: String,
    /// Ordered agent pipeline, fixed at creation.
    pub agents: Vec<String>,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// 0–100, monotonically non-decreasing while non-terminal.
    pub progress: u8,
    /// Label of the agent currently executing.
    #[serde(default)]
    pub current_step: Option<String>,
    /// Machine-readable failure code, set only on failure paths.
    #[serde(default)]
    pub error_code: Option<String>,
    /// Human-readable failure description.
    #[serde(default)]
    pub error_message: Option<String>,
    /// Set by the dispatcher on hand-off.
    #[serde(default)]
    pub dispatch_record: Option<DispatchRecord>,
    /// Staged input keys the trigger step verifies, fixed at staging.
    #[serde(default)]
    pub input_keys: Vec<String>,
    /// Output keys written by the coordinator; backs the `outputs` op.
    #[serde(default)]
    pub output_keys: Vec<String>,
    /// Per-agent parameter object captured at staging.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Cooperative cancellation flag, checked at agent boundaries.
    #[serde(default)]
    pub cancel_requested: bool,
    /// Set once staged artifacts under the task prefix were purged.
    #[serde(default)]
    pub cleanup_done: bool,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// When staging handles were first issued.
    #[serde(default)]
    pub staging_started_at: Option<DateTime<Utc>>,
    /// When a coordinator claimed the task.
    #[serde(default)]
    pub processing_started_at: Option<DateTime<Utc>>,
    /// Terminal-transition timestamps, at most one of them set.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// See `completed_at`.
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
    /// See `completed_at`.
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
    /// See `completed_at`.
    #[serde(default)]
    pub expired_at: Option<DateTime<Utc>>,
    /// Staleness marker used by the reaper; bumped on every write.
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Create a freshly submitted task with the given agent pipeline.
    pub fn new(owner_id: impl Into<String>, tool_id: impl Into<String>, agents: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            tool_id: tool_id.into(),
            agents,
            status: TaskStatus::Created,
            progress: 0,
            current_step: None,
            error_code: None,
            error_message: None,
            dispatch_record: None,
            input_keys: Vec::new(),
            output_keys: Vec::new(),
            params: serde_json::Value::Null,
            cancel_requested: false,
            cleanup_done: false,
            created_at: now,
            staging_started_at: None,
            processing_started_at: None,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
            expired_at: None,
            updated_at: now,
        }
    }

    /// Storage prefix holding all of this task's artifacts.
    pub fn storage_prefix(&self) -> String {
        format!("tasks/{}/", self.task_id)
    }

    /// Storage prefix for staged inputs.
    pub fn input_prefix(&self) -> String {
        format!("tasks/{}/input/", self.task_id)
    }

    /// Storage prefix for persisted outputs.
    pub fn output_prefix(&self) -> String {
        format!("tasks/{}/output/", self.task_id)
    }
}

/// A set of field edits applied atomically together with a status
/// transition by the task store's conditional write.
///
/// Progress is clamped to be monotonically non-decreasing; per-transition
/// timestamps and `updated_at` are stamped inside [`TaskPatch::apply`] so
/// every write path gets them for free.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    /// New status; must be reachable from the expected status.
    pub status: Option<TaskStatus>,
    /// New progress value (ignored if lower than the current one).
    pub progress: Option<u8>,
    /// New current-step label (`Some(None)` clears it).
    pub current_step: Option<Option<String>>,
    /// Failure code and message, set together; `Some(None)` clears both.
    pub error: Option<Option<(String, String)>>,
    /// Dispatch bookkeeping.
    pub dispatch_record: Option<DispatchRecord>,
    /// Expected staged input keys.
    pub input_keys: Option<Vec<String>>,
    /// Persisted output keys.
    pub output_keys: Option<Vec<String>>,
    /// Per-agent parameters.
    pub params: Option<serde_json::Value>,
    /// Cooperative cancellation flag.
    pub cancel_requested: Option<bool>,
    /// Artifact purge marker.
    pub cleanup_done: Option<bool>,
}

impl TaskPatch {
    /// A patch that only changes the status.
    pub fn to_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Attach progress and a current-step label.
    pub fn with_progress(mut self, progress: u8, step: Option<String>) -> Self {
        self.progress = Some(progress);
        self.current_step = Some(step);
        self
    }

    /// Attach a failure code and message.
    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some(Some((code.into(), message.into())));
        self
    }

    /// Clear any failure code and message left by an earlier attempt.
    pub fn with_error_cleared(mut self) -> Self {
        self.error = Some(None);
        self
    }

    /// Attach dispatch bookkeeping.
    pub fn with_dispatch(mut self, record: DispatchRecord) -> Self {
        self.dispatch_record = Some(record);
        self
    }

    /// Mark staged artifacts as purged.
    pub fn with_cleanup_done(mut self) -> Self {
        self.cleanup_done = Some(true);
        self
    }

    /// Apply the patch to a record, stamping transition timestamps.
    pub fn apply(self, task: &mut TaskRecord) {
        let now = Utc::now();
        if let Some(status) = self.status {
            task.status = status;
            match status {
                TaskStatus::Staging => {
                    // A re-stage after STAGING_FAILED keeps the first stamp.
                    task.staging_started_at.get_or_insert(now);
                }
                TaskStatus::Active => task.processing_started_at = Some(now),
                TaskStatus::Completed => task.completed_at = Some(now),
                TaskStatus::Failed => task.failed_at = Some(now),
                TaskStatus::Cancelled => task.cancelled_at = Some(now),
                TaskStatus::Expired => task.expired_at = Some(now),
                TaskStatus::Created | TaskStatus::StagingFailed | TaskStatus::Ready => {}
            }
        }
        if let Some(progress) = self.progress {
            task.progress = task.progress.max(progress);
        }
        if let Some(step) = self.current_step {
            task.current_step = step;
        }
        match self.error {
            Some(Some((code, message))) => {
                task.error_code = Some(code);
                task.error_message = Some(message);
            }
            Some(None) => {
                task.error_code = None;
                task.error_message = None;
            }
            None => {}
        }
        if let Some(record) = self.dispatch_record {
            task.dispatch_record = Some(record);
        }
        if let Some(keys) = self.input_keys {
            task.input_keys = keys;
        }
        if let Some(keys) = self.output_keys {
            task.output_keys = keys;
        }
        if let Some(params) = self.params {
            task.params = params;
        }
        if let Some(flag) = self.cancel_requested {
            task.cancel_requested = flag;
        }
        if let Some(flag) = self.cleanup_done {
            task.cleanup_done = flag;
        }
        task.updated_at = now;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn new_task_starts_created() {
        let task = TaskRecord::new("owner-1", "dedup", vec!["profile".into(), "cleanse".into()]);
        assert_eq!(task.status, TaskStatus::Created);
        assert_eq!(task.progress, 0);
        assert!(task.error_code.is_none());
        assert!(!task.cleanup_done);
    }

    #[test]
    fn state_graph_edges() {
        use TaskStatus::*;
        assert!(Created.can_transition_to(Staging));
        assert!(Created.can_transition_to(Expired));
        assert!(Staging.can_transition_to(Ready));
        assert!(Staging.can_transition_to(StagingFailed));
        assert!(Staging.can_transition_to(Expired));
        assert!(StagingFailed.can_transition_to(Staging));
        assert!(Ready.can_transition_to(Active));
        assert!(Active.can_transition_to(Completed));
        assert!(Active.can_transition_to(Failed));
        assert!(Active.can_transition_to(Cancelled));

        // No edge out of a terminal state.
        for terminal in [Completed, Failed, Cancelled, Expired] {
            for next in [
                Created, Staging, StagingFailed, Ready, Active, Completed, Failed, Cancelled,
                Expired,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }

        // A few forbidden shortcuts.
        assert!(!Created.can_transition_to(Ready));
        assert!(!Created.can_transition_to(Active));
        assert!(!Ready.can_transition_to(Completed));
        assert!(!Staging.can_transition_to(Active));
    }

    #[test]
    fn terminal_and_expirable_classification() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Expired.is_terminal());
        assert!(!TaskStatus::Active.is_terminal());

        assert!(TaskStatus::Created.is_expirable());
        assert!(TaskStatus::Staging.is_expirable());
        assert!(!TaskStatus::Ready.is_expirable());
        assert!(!TaskStatus::Active.is_expirable());
    }

    #[test]
    fn patch_stamps_transition_timestamps() {
        let mut task = TaskRecord::new("o", "t", vec!["a".into()]);
        TaskPatch::to_status(TaskStatus::Staging).apply(&mut task);
        assert!(task.staging_started_at.is_some());
        assert_eq!(task.status, TaskStatus::Staging);

        TaskPatch::to_status(TaskStatus::Ready).apply(&mut task);
        TaskPatch::to_status(TaskStatus::Active).apply(&mut task);
        assert!(task.processing_started_at.is_some());

        TaskPatch::to_status(TaskStatus::Completed).apply(&mut task);
        assert!(task.completed_at.is_some());
        assert!(task.failed_at.is_none());
    }

    #[test]
    fn patch_progress_is_monotonic() {
        let mut task = TaskRecord::new("o", "t", vec!["a".into()]);
        TaskPatch::default()
            .with_progress(42, Some("cleanse".into()))
            .apply(&mut task);
        assert_eq!(task.progress, 42);
        assert_eq!(task.current_step.as_deref(), Some("cleanse"));

        // Lower value is ignored, label still updates.
        TaskPatch::default()
            .with_progress(10, None)
            .apply(&mut task);
        assert_eq!(task.progress, 42);
        assert!(task.current_step.is_none());
    }

    #[test]
    fn patch_sets_error_fields_together() {
        let mut task = TaskRecord::new("o", "t", vec!["a".into()]);
        TaskPatch::to_status(TaskStatus::Failed)
            .with_error("AGENT_ERROR", "bad data format")
            .apply(&mut task);
        assert_eq!(task.error_code.as_deref(), Some("AGENT_ERROR"));
        assert_eq!(task.error_message.as_deref(), Some("bad data format"));
    }

    #[test]
    fn patch_clears_error_fields_on_request() {
        let mut task = TaskRecord::new("o", "t", vec!["a".into()]);
        TaskPatch::to_status(TaskStatus::StagingFailed)
            .with_error("FILES_NOT_FOUND", "missing staged inputs")
            .apply(&mut task);
        assert!(task.error_code.is_some());

        TaskPatch::to_status(TaskStatus::Staging)
            .with_error_cleared()
            .apply(&mut task);
        assert!(task.error_code.is_none());
        assert!(task.error_message.is_none());
    }

    #[test]
    fn restaging_keeps_the_first_staging_stamp() {
        let mut task = TaskRecord::new("o", "t", vec!["a".into()]);
        TaskPatch::to_status(TaskStatus::Staging).apply(&mut task);
        let first = task.staging_started_at;
        assert!(first.is_some());

        TaskPatch::to_status(TaskStatus::StagingFailed)
            .with_error("FILES_NOT_FOUND", "missing staged inputs")
            .apply(&mut task);
        TaskPatch::to_status(TaskStatus::Staging).apply(&mut task);
        assert_eq!(task.staging_started_at, first);
    }

    #[test]
    fn storage_prefixes_are_task_scoped() {
        let task = TaskRecord::new("o", "t", vec!["a".into()]);
        let id = task.task_id;
        assert_eq!(task.storage_prefix(), format!("tasks/{id}/"));
        assert!(task.input_prefix().starts_with(&task.storage_prefix()));
        assert!(task.output_prefix().starts_with(&task.storage_prefix()));
    }

    #[test]
    fn record_roundtrips_through_json() {
        let mut task = TaskRecord::new("owner-9", "match", vec!["resolve".into()]);
        task.dispatch_record = Some(DispatchRecord {
            strategy: StrategyKind::Queue,
            correlation_id: Uuid::new_v4(),
            dispatched_at: Utc::now(),
        });
        let json = serde_json::to_string(&task).unwrap();
        let parsed: TaskRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.task_id, task.task_id);
        assert_eq!(parsed.dispatch_record, task.dispatch_record);
        assert_eq!(parsed.status, TaskStatus::Created);
    }
}
