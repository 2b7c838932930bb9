use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::{ConveyorError, ConveyorResult, TaskPatch, TaskRecord, TaskStatus};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Durable record of each task; the single arbiter of lifecycle claims.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task. Fails if the id already exists.
    async fn insert(&self, task: &TaskRecord) -> ConveyorResult<()>;

    /// Fetch a task by id.
    async fn get(&self, id: Uuid) -> ConveyorResult<Option<TaskRecord>>;

    /// Conditionally apply a patch.
    ///
    /// The write succeeds only when the stored status equals `expected`
    /// (and, when given, the stored `updated_at` equals
    /// `expected_updated_at`). A status change in the patch must be a
    /// legal edge of the state graph. Returns the updated record, or
    /// [`ConveyorError::Conflict`] when the condition fails.
    async fn transition(
        &self,
        id: Uuid,
        expected: TaskStatus,
        expected_updated_at: Option<DateTime<Utc>>,
        patch: TaskPatch,
    ) -> ConveyorResult<TaskRecord>;

    /// All tasks, for reaper scans.
    async fn list(&self) -> ConveyorResult<Vec<TaskRecord>>;

    /// Hard-delete a task. Returns whether a record existed.
    async fn delete(&self, id: Uuid) -> ConveyorResult<bool>;
}

fn check_and_apply(
    task: &mut TaskRecord,
    expected: TaskStatus,
    expected_updated_at: Option<DateTime<Utc>>,
    patch: TaskPatch,
) -> ConveyorResult<()> {
    if task.status != expected {
        return Err(ConveyorError::Conflict(format!(
            "task {} is {}, expected {}",
            task.task_id, task.status, expected
        )));
    }
    if let Some(stamp) = expected_updated_at {
        if task.updated_at != stamp {
            return Err(ConveyorError::Conflict(format!(
                "task {} was updated concurrently",
                task.task_id
            )));
        }
    }
    if let Some(next) = patch.status {
        if next != expected && !expected.can_transition_to(next) {
            return Err(ConveyorError::Store(format!(
                "illegal transition {expected} -> {next} for task {}",
                task.task_id
            )));
        }
    }
    patch.apply(task);
    Ok(())
}

/// In-memory task store backed by a `tokio` read-write lock.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<Uuid, TaskRecord>>,
}

impl MemoryTaskStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, task: &TaskRecord) -> ConveyorResult<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.task_id) {
            return Err(ConveyorError::Conflict(format!(
                "task {} already exists",
                task.task_id
            )));
        }
        tasks.insert(task.task_id, task.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> ConveyorResult<Option<TaskRecord>> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: TaskStatus,
        expected_updated_at: Option<DateTime<Utc>>,
        patch: TaskPatch,
    ) -> ConveyorResult<TaskRecord> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| ConveyorError::NotFound(format!("task {id}")))?;
        check_and_apply(task, expected, expected_updated_at, patch)?;
        Ok(task.clone())
    }

    async fn list(&self) -> ConveyorResult<Vec<TaskRecord>> {
        let tasks = self.tasks.read().await;
        let mut all: Vec<TaskRecord> = tasks.values().cloned().collect();
        all.sort_by_key(|t| t.created_at);
        Ok(all)
    }

    async fn delete(&self, id: Uuid) -> ConveyorResult<bool> {
        Ok(self.tasks.write().await.remove(&id).is_some())
    }
}

/// File-based task store: one JSON document per task.
///
/// A single mutex serializes every file access in this process: the
/// conditional check and the rewrite stay atomic with respect to other
/// writers, and readers never observe a half-written document.
pub struct FileTaskStore {
    dir: PathBuf,
    io_lock: Mutex<()>,
}

impl FileTaskStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub async fn new(dir: PathBuf) -> ConveyorResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            io_lock: Mutex::new(()),
        })
    }

    fn task_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn read_task(&self, id: Uuid) -> ConveyorResult<Option<TaskRecord>> {
        let path = self.task_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let task: TaskRecord = serde_json::from_str(&data)
            .map_err(|e| ConveyorError::Store(format!("failed to parse task {id}: {e}")))?;
        Ok(Some(task))
    }

    async fn write_task(&self, task: &TaskRecord) -> ConveyorResult<()> {
        let json = serde_json::to_string_pretty(task)?;
        tokio::fs::write(self.task_path(task.task_id), json).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn insert(&self, task: &TaskRecord) -> ConveyorResult<()> {
        let _guard = self.io_lock.lock().await;
        if self.task_path(task.task_id).exists() {
            return Err(ConveyorError::Conflict(format!(
                "task {} already exists",
                task.task_id
            )));
        }
        self.write_task(task).await
    }

    async fn get(&self, id: Uuid) -> ConveyorResult<Option<TaskRecord>> {
        let _guard = self.io_lock.lock().await;
        self.read_task(id).await
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: TaskStatus,
        expected_updated_at: Option<DateTime<Utc>>,
        patch: TaskPatch,
    ) -> ConveyorResult<TaskRecord> {
        let _guard = self.io_lock.lock().await;
        let mut task = self
            .read_task(id)
            .await?
            .ok_or_else(|| ConveyorError::NotFound(format!("task {id}")))?;
        check_and_apply(&mut task, expected, expected_updated_at, patch)?;
        self.write_task(&task).await?;
        Ok(task)
    }

    async fn list(&self) -> ConveyorResult<Vec<TaskRecord>> {
        let _guard = self.io_lock.lock().await;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut all = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stem) = name.strip_suffix(".json") {
                    if let Ok(id) = Uuid::parse_str(stem) {
                        if let Some(task) = self.read_task(id).await? {
                            all.push(task);
                        }
                    }
                }
            }
        }
        all.sort_by_key(|t| t.created_at);
        Ok(all)
    }

    async fn delete(&self, id: Uuid) -> ConveyorResult<bool> {
        let _guard = self.io_lock.lock().await;
        let path = self.task_path(id);
        if path.exists() {
            tokio::fs::remove_file(path).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conveyor_core::TaskPatch;

    fn sample_task() -> TaskRecord {
        TaskRecord::new("owner-1", "dedup", vec!["profile".into(), "cleanse".into()])
    }

    #[tokio::test]
    async fn insert_and_get() {
        let store = MemoryTaskStore::new();
        let task = sample_task();
        store.insert(&task).await.unwrap();
        let fetched = store.get(task.task_id).await.unwrap().unwrap();
        assert_eq!(fetched.owner_id, "owner-1");
        assert_eq!(fetched.status, TaskStatus::Created);
    }

    #[tokio::test]
    async fn duplicate_insert_conflicts() {
        let store = MemoryTaskStore::new();
        let task = sample_task();
        store.insert(&task).await.unwrap();
        let err = store.insert(&task).await.unwrap_err();
        assert!(matches!(err, ConveyorError::Conflict(_)));
    }

    #[tokio::test]
    async fn transition_requires_expected_status() {
        let store = MemoryTaskStore::new();
        let task = sample_task();
        store.insert(&task).await.unwrap();

        // Wrong expectation loses.
        let err = store
            .transition(
                task.task_id,
                TaskStatus::Ready,
                None,
                TaskPatch::to_status(TaskStatus::Active),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::Conflict(_)));

        // Correct expectation wins.
        let updated = store
            .transition(
                task.task_id,
                TaskStatus::Created,
                None,
                TaskPatch::to_status(TaskStatus::Staging),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Staging);
    }

    #[tokio::test]
    async fn illegal_edge_rejected() {
        let store = MemoryTaskStore::new();
        let task = sample_task();
        store.insert(&task).await.unwrap();
        let err = store
            .transition(
                task.task_id,
                TaskStatus::Created,
                None,
                TaskPatch::to_status(TaskStatus::Active),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::Store(_)));
    }

    #[tokio::test]
    async fn status_preserving_write_allowed() {
        let store = MemoryTaskStore::new();
        let mut task = sample_task();
        task.status = TaskStatus::Active;
        store.insert(&task).await.unwrap();

        let updated = store
            .transition(
                task.task_id,
                TaskStatus::Active,
                None,
                TaskPatch::to_status(TaskStatus::Active).with_progress(55, Some("cleanse".into())),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Active);
        assert_eq!(updated.progress, 55);
    }

    #[tokio::test]
    async fn updated_at_guard_detects_races() {
        let store = MemoryTaskStore::new();
        let task = sample_task();
        store.insert(&task).await.unwrap();
        let stale_stamp = task.updated_at;

        // First writer succeeds and bumps updated_at.
        store
            .transition(
                task.task_id,
                TaskStatus::Created,
                Some(stale_stamp),
                TaskPatch::to_status(TaskStatus::Expired),
            )
            .await
            .unwrap();

        // Second writer still expects the old stamp (and old status).
        let err = store
            .transition(
                task.task_id,
                TaskStatus::Created,
                Some(stale_stamp),
                TaskPatch::to_status(TaskStatus::Expired),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::Conflict(_)));
    }

    #[tokio::test]
    async fn only_one_concurrent_claim_wins() {
        use std::sync::Arc;

        let store = Arc::new(MemoryTaskStore::new());
        let mut task = sample_task();
        task.status = TaskStatus::Ready;
        store.insert(&task).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let id = task.task_id;
            handles.push(tokio::spawn(async move {
                store
                    .transition(id, TaskStatus::Ready, None, TaskPatch::to_status(TaskStatus::Active))
                    .await
                    .is_ok()
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn list_is_creation_ordered() {
        let store = MemoryTaskStore::new();
        for _ in 0..3 {
            store.insert(&sample_task()).await.unwrap();
        }
        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryTaskStore::new();
        let task = sample_task();
        store.insert(&task).await.unwrap();
        assert!(store.delete(task.task_id).await.unwrap());
        assert!(!store.delete(task.task_id).await.unwrap());
        assert!(store.get(task.task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileTaskStore::new(tmp.path().join("tasks")).await.unwrap();

        let task = sample_task();
        store.insert(&task).await.unwrap();

        let updated = store
            .transition(
                task.task_id,
                TaskStatus::Created,
                None,
                TaskPatch::to_status(TaskStatus::Staging),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Staging);
        assert!(updated.staging_started_at.is_some());

        let fetched = store.get(task.task_id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Staging);

        assert_eq!(store.list().await.unwrap().len(), 1);
        assert!(store.delete(task.task_id).await.unwrap());
        assert!(store.get(task.task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_conflict_on_stale_expectation() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileTaskStore::new(tmp.path().join("tasks")).await.unwrap();
        let task = sample_task();
        store.insert(&task).await.unwrap();

        store
            .transition(
                task.task_id,
                TaskStatus::Created,
                None,
                TaskPatch::to_status(TaskStatus::Staging),
            )
            .await
            .unwrap();

        let err = store
            .transition(
                task.task_id,
                TaskStatus::Created,
                None,
                TaskPatch::to_status(TaskStatus::Staging),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::Conflict(_)));
    }

    #[tokio::test]
    async fn file_store_reads_never_observe_torn_writes() {
        use std::sync::Arc;

        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(FileTaskStore::new(tmp.path().join("tasks")).await.unwrap());
        let mut task = sample_task();
        task.status = TaskStatus::Active;
        store.insert(&task).await.unwrap();
        let id = task.task_id;

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let writer = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                writer
                    .transition(
                        id,
                        TaskStatus::Active,
                        None,
                        TaskPatch::default().with_progress(20 + i, None),
                    )
                    .await
                    .map(|_| ())
            }));
            let reader = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                reader.get(id).await.map(|t| {
                    assert!(t.is_some());
                })
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
