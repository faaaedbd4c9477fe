//! In-process task store with an optional JSON snapshot on disk.
//!
//! Every mutation happens under one write lock, which makes `begin_step` a
//! real compare-and-swap. When a snapshot path is configured a mutation is
//! applied to a copy, the copy is written atomically (temp file + rename),
//! and only then replaces the live state. A failed write changes nothing.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::invariants::validate_invariants;
use crate::core::transitions;
use crate::error::StoreError;
use crate::io::store::{ConversationMessage, FileRecord, TaskPatch, TaskStore};
use crate::task::{Task, TaskStatus};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MemoryState {
    #[serde(default)]
    tasks: BTreeMap<String, Task>,
    #[serde(default)]
    messages: BTreeMap<String, Vec<ConversationMessage>>,
    #[serde(default)]
    files: BTreeMap<String, Vec<FileRecord>>,
}

pub struct MemoryStore {
    state: RwLock<MemoryState>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            snapshot_path: None,
        }
    }

    /// Open a store backed by `path`, loading it if it exists.
    pub fn with_snapshot(path: &Path) -> Result<Self, StoreError> {
        let state = if path.exists() {
            load_snapshot(path)?
        } else {
            MemoryState::default()
        };
        debug!(path = %path.display(), tasks = state.tasks.len(), "memory store opened");
        Ok(Self {
            state: RwLock::new(state),
            snapshot_path: Some(path.to_path_buf()),
        })
    }

    fn persist(&self, state: &MemoryState) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let mut buf = serde_json::to_string_pretty(state)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        buf.push('\n');
        write_atomic(path, &buf)
    }

    /// Apply `change` and persist it as one unit.
    fn commit<T>(
        &self,
        change: impl FnOnce(&mut MemoryState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.write_state()?;
        if self.snapshot_path.is_none() {
            return change(&mut state);
        }
        let mut next = state.clone();
        let out = change(&mut next)?;
        self.persist(&next)?;
        *state = next;
        Ok(out)
    }

    fn read_state(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryState>, StoreError> {
        self.state
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))
    }

    fn write_state(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryState>, StoreError> {
        self.state
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn save_task(&self, task: &Task) -> Result<(), StoreError> {
        self.commit(|state| {
            state.tasks.insert(task.task_id.clone(), task.clone());
            Ok(())
        })
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        let state = self.read_state()?;
        Ok(state.tasks.get(task_id).cloned())
    }

    async fn update_task(&self, task_id: &str, patch: &TaskPatch) -> Result<Task, StoreError> {
        self.commit(|state| {
            let task = state
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
            patch.apply(task);
            Ok(task.clone())
        })
    }

    async fn begin_step(
        &self,
        task_id: &str,
        step_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        // A lost swap skips the snapshot rewrite.
        let runnable = self.read_state()?.tasks.get(task_id).is_some_and(|task| {
            task.step(step_id).is_some_and(|step| step.status.is_runnable())
        });
        if !runnable {
            return Ok(None);
        }
        self.commit(|state| {
            let Some(task) = state.tasks.get_mut(task_id) else {
                return Ok(None);
            };
            if !transitions::begin_step(task, step_id, now) {
                return Ok(None);
            }
            Ok(Some(task.clone()))
        })
    }

    async fn delete_task(&self, task_id: &str) -> Result<bool, StoreError> {
        self.commit(|state| {
            let removed = state.tasks.remove(task_id).is_some();
            state.messages.remove(task_id);
            state.files.remove(task_id);
            Ok(removed)
        })
    }

    async fn list_tasks(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>, StoreError> {
        let state = self.read_state()?;
        let mut tasks = state
            .tasks
            .values()
            .filter(|task| statuses.contains(&task.status))
            .cloned()
            .collect::<Vec<_>>();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn append_message(&self, message: &ConversationMessage) -> Result<(), StoreError> {
        self.commit(|state| {
            state
                .messages
                .entry(message.task_id.clone())
                .or_default()
                .push(message.clone());
            Ok(())
        })
    }

    async fn list_messages(&self, task_id: &str) -> Result<Vec<ConversationMessage>, StoreError> {
        let state = self.read_state()?;
        Ok(state.messages.get(task_id).cloned().unwrap_or_default())
    }

    async fn record_file(&self, file: &FileRecord) -> Result<(), StoreError> {
        self.commit(|state| {
            state
                .files
                .entry(file.task_id.clone())
                .or_default()
                .push(file.clone());
            Ok(())
        })
    }

    async fn list_files(&self, task_id: &str) -> Result<Vec<FileRecord>, StoreError> {
        let state = self.read_state()?;
        Ok(state.files.get(task_id).cloned().unwrap_or_default())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.read_state().map(|_| ())
    }
}

fn load_snapshot(path: &Path) -> Result<MemoryState, StoreError> {
    let contents = fs::read_to_string(path)
        .map_err(|e| StoreError::Io(format!("read snapshot {}: {e}", path.display())))?;
    let state: MemoryState = serde_json::from_str(&contents).map_err(|e| {
        StoreError::Serialization(format!("parse snapshot {}: {e}", path.display()))
    })?;
    let errors = state
        .tasks
        .values()
        .flat_map(validate_invariants)
        .collect::<Vec<_>>();
    if !errors.is_empty() {
        return Err(StoreError::Serialization(format!(
            "snapshot invariants failed: {}",
            errors.join("; ")
        )));
    }
    Ok(state)
}

fn write_atomic(path: &Path, contents: &str) -> Result<(), StoreError> {
    let io_err = |what: &str, p: &Path, e: std::io::Error| {
        StoreError::Io(format!("{what} {}: {e}", p.display()))
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| io_err("create directory", parent, e))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents).map_err(|e| io_err("write temp snapshot", &tmp_path, e))?;
    fs::rename(&tmp_path, path).map_err(|e| io_err("replace snapshot", path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::StepStatus;
    use crate::test_support::{step_with_status, task_with_steps};

    fn sample(task_id: &str) -> Task {
        let mut task = task_with_steps(vec![step_with_status("a", StepStatus::Pending)]);
        task.task_id = task_id.to_string();
        task
    }

    #[tokio::test]
    async fn save_is_an_upsert() {
        let store = MemoryStore::new();
        let mut task = sample("t1");
        store.save_task(&task).await.expect("save");
        task.title = "renamed".to_string();
        store.save_task(&task).await.expect("save again");

        let all = store
            .list_tasks(&[TaskStatus::Created])
            .await
            .expect("list");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].title, "renamed");
    }

    #[tokio::test]
    async fn begin_step_swaps_once() {
        let store = MemoryStore::new();
        store.save_task(&sample("t1")).await.expect("save");

        let first = store.begin_step("t1", "a", Utc::now()).await.expect("begin");
        let second = store.begin_step("t1", "a", Utc::now()).await.expect("begin");

        assert_eq!(
            first.map(|t| t.plan[0].status),
            Some(StepStatus::Executing)
        );
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn update_missing_task_is_not_found() {
        let store = MemoryStore::new();
        let patch = TaskPatch::from_task(&sample("t1"), None);
        let err = store.update_task("t1", &patch).await.expect_err("missing");
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_cascades_to_messages_and_files() {
        let store = MemoryStore::new();
        store.save_task(&sample("t1")).await.expect("save");
        store
            .append_message(&ConversationMessage {
                task_id: "t1".to_string(),
                role: "user".to_string(),
                content: "hi".to_string(),
                timestamp: Utc::now(),
            })
            .await
            .expect("message");
        store
            .record_file(&FileRecord {
                task_id: "t1".to_string(),
                name: "report.md".to_string(),
                path: "/tmp/report.md".to_string(),
                size: 10,
                created_at: Utc::now(),
            })
            .await
            .expect("file");

        assert!(store.delete_task("t1").await.expect("delete"));
        assert!(store.get_task("t1").await.expect("get").is_none());
        assert!(store.list_messages("t1").await.expect("messages").is_empty());
        assert!(store.list_files("t1").await.expect("files").is_empty());
        assert!(!store.delete_task("t1").await.expect("delete again"));
    }

    /// Verifies a snapshot written by one store is loaded by the next.
    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state").join("mitosis.json");

        let store = MemoryStore::with_snapshot(&path).expect("open");
        store.save_task(&sample("t1")).await.expect("save");
        drop(store);

        let reopened = MemoryStore::with_snapshot(&path).expect("reopen");
        let task = reopened.get_task("t1").await.expect("get");
        assert_eq!(task.map(|t| t.task_id), Some("t1".to_string()));
    }

    #[tokio::test]
    async fn failed_snapshot_write_leaves_state_unchanged() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("mitosis.json");
        let store = MemoryStore::with_snapshot(&path).expect("open");
        store.save_task(&sample("t1")).await.expect("save");

        // A directory where the temp file goes makes every write fail.
        let blocker = path.with_extension("json.tmp");
        fs::create_dir(&blocker).expect("block temp file");

        let err = store
            .begin_step("t1", "a", Utc::now())
            .await
            .expect_err("snapshot write fails");
        assert!(matches!(err, StoreError::Io(_)));

        let task = store.get_task("t1").await.expect("get").expect("task");
        assert_eq!(task.plan[0].status, StepStatus::Pending);
        assert_eq!(task.status, TaskStatus::Created);

        let mut patch = TaskPatch::from_task(&task, None);
        patch.final_result = Some("done".to_string());
        assert!(store.update_task("t1", &patch).await.is_err());
        assert!(store.delete_task("t1").await.is_err());
        let task = store.get_task("t1").await.expect("get").expect("still there");
        assert!(task.final_result.is_none());

        fs::remove_dir(&blocker).expect("unblock");
        let started = store.begin_step("t1", "a", Utc::now()).await.expect("begin");
        assert_eq!(started.map(|t| t.plan[0].status), Some(StepStatus::Executing));
    }

    #[test]
    fn snapshot_with_broken_invariants_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("mitosis.json");
        let mut task = sample("t1");
        task.status = TaskStatus::Completed;
        let mut state = MemoryState::default();
        state.tasks.insert("t1".to_string(), task);
        fs::write(&path, serde_json::to_string(&state).expect("json")).expect("write");

        let err = MemoryStore::with_snapshot(&path).err().expect("rejected");
        assert!(err.to_string().contains("invariants failed"));
    }
}
