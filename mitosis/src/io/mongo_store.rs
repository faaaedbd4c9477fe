//! MongoDB task store.
//!
//! Tasks live in one collection with the plan embedded as an array. Updates
//! are field-level `$set`s; the step swap uses `$elemMatch` plus the
//! positional operator so the check and the write are one server-side
//! operation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{self, Bson, Document, doc};
use mongodb::options::{IndexOptions, ReturnDocument};
use mongodb::{Client, Collection, Database, IndexModel};
use serde::Serialize;
use tracing::debug;

use crate::error::StoreError;
use crate::io::store::{ConversationMessage, FileRecord, TaskPatch, TaskStore};
use crate::task::{StepStatus, Task, TaskStatus};

const TASKS: &str = "tasks";
const CONVERSATIONS: &str = "conversations";
const FILES: &str = "files";

pub struct MongoStore {
    db: Database,
}

impl MongoStore {
    pub async fn connect(url: &str, database: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let store = Self {
            db: client.database(database),
        };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        let unique = IndexModel::builder()
            .keys(doc! { "task_id": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.tasks().create_index(unique).await.map_err(connection)?;
        for name in [CONVERSATIONS, FILES] {
            let by_task = IndexModel::builder().keys(doc! { "task_id": 1 }).build();
            self.db
                .collection::<Document>(name)
                .create_index(by_task)
                .await
                .map_err(connection)?;
        }
        Ok(())
    }

    fn tasks(&self) -> Collection<Task> {
        self.db.collection(TASKS)
    }

    fn conversations(&self) -> Collection<ConversationMessage> {
        self.db.collection(CONVERSATIONS)
    }

    fn files(&self) -> Collection<FileRecord> {
        self.db.collection(FILES)
    }
}

#[async_trait]
impl TaskStore for MongoStore {
    fn backend(&self) -> &'static str {
        "mongodb"
    }

    async fn save_task(&self, task: &Task) -> Result<(), StoreError> {
        self.tasks()
            .replace_one(doc! { "task_id": &task.task_id }, task)
            .upsert(true)
            .await
            .map_err(connection)?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        self.tasks()
            .find_one(doc! { "task_id": task_id })
            .await
            .map_err(connection)
    }

    async fn update_task(&self, task_id: &str, patch: &TaskPatch) -> Result<Task, StoreError> {
        let mut filter = doc! {
            "task_id": task_id,
            "status": { "$ne": TaskStatus::Cancelled.as_str() },
        };
        let mut set = doc! {
            "status": patch.status.as_str(),
            "current_step_index": to_bson(&patch.current_step_index)?,
            "updated_at": to_bson(&patch.updated_at)?,
            "completed_at": to_bson(&patch.completed_at)?,
            "final_result": to_bson(&patch.final_result)?,
            "error": to_bson(&patch.error)?,
        };
        let mut step_only = doc! { "updated_at": to_bson(&patch.updated_at)? };
        if let Some(step) = &patch.step {
            filter.insert("plan.id", &step.id);
            let step_bson = to_bson(step)?;
            set.insert("plan.$", step_bson.clone());
            step_only.insert("plan.$", step_bson);
        }

        let result = self
            .tasks()
            .update_one(filter, doc! { "$set": set })
            .await
            .map_err(connection)?;

        if result.matched_count == 0 {
            // Either missing or cancelled: a cancelled task still records the
            // step outcome but keeps its terminal fields.
            let mut fallback = doc! { "task_id": task_id };
            if let Some(step) = &patch.step {
                fallback.insert("plan.id", &step.id);
            }
            let result = self
                .tasks()
                .update_one(fallback, doc! { "$set": step_only })
                .await
                .map_err(connection)?;
            if result.matched_count == 0 {
                return Err(StoreError::NotFound(task_id.to_string()));
            }
            debug!(task_id, "update applied to cancelled task without status change");
        }

        self.get_task(task_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))
    }

    async fn begin_step(
        &self,
        task_id: &str,
        step_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let runnable = [StepStatus::Pending.as_str(), StepStatus::Failed.as_str()];
        let filter = doc! {
            "task_id": task_id,
            "status": { "$ne": TaskStatus::Cancelled.as_str() },
            "plan": { "$elemMatch": { "id": step_id, "status": { "$in": runnable.to_vec() } } },
        };
        let now = to_bson(&now)?;
        let update = doc! {
            "$set": {
                "plan.$.status": StepStatus::Executing.as_str(),
                "plan.$.started_at": now.clone(),
                "status": TaskStatus::Executing.as_str(),
                "updated_at": now,
            }
        };
        self.tasks()
            .find_one_and_update(filter, update)
            .return_document(ReturnDocument::After)
            .await
            .map_err(connection)
    }

    async fn delete_task(&self, task_id: &str) -> Result<bool, StoreError> {
        let filter = doc! { "task_id": task_id };
        let deleted = self
            .tasks()
            .delete_one(filter.clone())
            .await
            .map_err(connection)?;
        self.conversations()
            .delete_many(filter.clone())
            .await
            .map_err(connection)?;
        self.files().delete_many(filter).await.map_err(connection)?;
        Ok(deleted.deleted_count > 0)
    }

    async fn list_tasks(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>, StoreError> {
        let names = statuses.iter().map(|s| s.as_str()).collect::<Vec<_>>();
        let cursor = self
            .tasks()
            .find(doc! { "status": { "$in": names } })
            .sort(doc! { "created_at": 1 })
            .await
            .map_err(connection)?;
        cursor.try_collect().await.map_err(connection)
    }

    async fn append_message(&self, message: &ConversationMessage) -> Result<(), StoreError> {
        self.conversations()
            .insert_one(message)
            .await
            .map_err(connection)?;
        Ok(())
    }

    async fn list_messages(&self, task_id: &str) -> Result<Vec<ConversationMessage>, StoreError> {
        let cursor = self
            .conversations()
            .find(doc! { "task_id": task_id })
            .sort(doc! { "timestamp": 1 })
            .await
            .map_err(connection)?;
        cursor.try_collect().await.map_err(connection)
    }

    async fn record_file(&self, file: &FileRecord) -> Result<(), StoreError> {
        self.files().insert_one(file).await.map_err(connection)?;
        Ok(())
    }

    async fn list_files(&self, task_id: &str) -> Result<Vec<FileRecord>, StoreError> {
        let cursor = self
            .files()
            .find(doc! { "task_id": task_id })
            .await
            .map_err(connection)?;
        cursor.try_collect().await.map_err(connection)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.db
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(connection)?;
        Ok(())
    }
}

fn connection(err: mongodb::error::Error) -> StoreError {
    StoreError::Connection(err.to_string())
}

fn to_bson<T: Serialize + ?Sized>(value: &T) -> Result<Bson, StoreError> {
    bson::to_bson(value).map_err(|e| StoreError::Serialization(e.to_string()))
}
