use crate::types::{Task, TaskPatch, TaskStatus};
use chrono::Utc;
use std::sync::Arc;
use switchboard_core::{SwitchboardError, SwitchboardResult};
use switchboard_store::{cas_json, get_json, scan_json, Journal, StateStore, Versioned};
use tracing::{debug, warn};
use uuid::Uuid;

const TASK_PREFIX: &str = "task:";

pub(crate) fn task_key(id: Uuid) -> String {
    format!("{TASK_PREFIX}{id}")
}

/// Where a newly created task ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// Written to the state store.
    Stored,
    /// The store was unreachable; the record waits in the journal.
    Journaled,
}

/// Durable task records with compare-and-swap transitions.
///
/// Every write checks the status the caller expects, so two orchestrator
/// instances racing on the same task cannot both win.
pub struct TaskStore {
    store: Arc<dyn StateStore>,
    journal: Option<Arc<Journal>>,
}

impl TaskStore {
    /// Create a task store over `store`, without journal fallback.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            journal: None,
        }
    }

    /// Journal new tasks to `journal` while the store is unavailable.
    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Persist a new task. Fails with `Conflict` if the id already exists.
    pub async fn create(&self, task: &Task) -> SwitchboardResult<Uuid> {
        self.create_with_outcome(task).await.map(|_| task.id)
    }

    /// Persist a new task, journaling it if the store is down and a journal
    /// is configured.
    pub async fn create_with_outcome(&self, task: &Task) -> SwitchboardResult<CreateOutcome> {
        let key = task_key(task.id);
        match cas_json(self.store.as_ref(), &key, None, task).await {
            Ok(_) => {
                debug!(task_id = %task.id, status = %task.status, "Task created");
                Ok(CreateOutcome::Stored)
            }
            Err(SwitchboardError::StoreUnavailable(reason)) => match &self.journal {
                Some(journal) => {
                    journal.append(&key, &serde_json::to_string(task)?).await?;
                    warn!(task_id = %task.id, reason = %reason, "Task journaled while store is down");
                    Ok(CreateOutcome::Journaled)
                }
                None => Err(SwitchboardError::StoreUnavailable(reason)),
            },
            Err(e) => Err(e),
        }
    }

    /// Load a task. Fails with `NotFound` if it was never stored.
    pub async fn get(&self, id: Uuid) -> SwitchboardResult<Task> {
        Ok(self.get_versioned(id).await?.value)
    }

    /// Load a task with the version it was read at.
    pub async fn get_versioned(&self, id: Uuid) -> SwitchboardResult<Versioned<Task>> {
        get_json(self.store.as_ref(), &task_key(id))
            .await?
            .ok_or_else(|| SwitchboardError::NotFound(format!("task {id}")))
    }

    /// Move `id` from `expected` to `next`, applying `patch` in the same write.
    pub async fn transition(
        &self,
        id: Uuid,
        expected: TaskStatus,
        next: TaskStatus,
        patch: TaskPatch,
    ) -> SwitchboardResult<Task> {
        if !expected.can_transition_to(next) {
            return Err(SwitchboardError::InvalidTransition {
                from: expected.to_string(),
                to: next.to_string(),
            });
        }
        let current = self.get_versioned(id).await?;
        if current.value.status != expected {
            return Err(SwitchboardError::Conflict(format!(
                "task {id} is {}, expected {expected}",
                current.value.status
            )));
        }

        let mut task = current.value;
        patch.apply(&mut task);
        task.status = next;
        task.updated_at = Utc::now();
        if next == TaskStatus::Queued {
            task.queued_at = Some(task.updated_at);
            task.stall_reported = false;
            task.progress = None;
            task.progress_note = None;
        }
        if next != TaskStatus::Failed {
            task.retry_pending = false;
        }

        cas_json(self.store.as_ref(), &task_key(id), Some(current.version), &task).await?;
        debug!(task_id = %id, from = %expected, to = %next, "Task transitioned");
        Ok(task)
    }

    /// Update fields of `id` without changing its status.
    pub async fn touch(
        &self,
        id: Uuid,
        expected: TaskStatus,
        patch: TaskPatch,
    ) -> SwitchboardResult<Task> {
        let current = self.get_versioned(id).await?;
        if current.value.status != expected {
            return Err(SwitchboardError::Conflict(format!(
                "task {id} is {}, expected {expected}",
                current.value.status
            )));
        }
        let mut task = current.value;
        patch.apply(&mut task);
        task.updated_at = Utc::now();
        cas_json(self.store.as_ref(), &task_key(id), Some(current.version), &task).await?;
        Ok(task)
    }

    /// Every task in `status`, oldest first.
    pub async fn list_by_status(&self, status: TaskStatus) -> SwitchboardResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .list_all()
            .await?
            .into_iter()
            .filter(|t| t.status == status)
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        Ok(tasks)
    }

    /// Every task, oldest first.
    pub async fn list_all(&self) -> SwitchboardResult<Vec<Task>> {
        let mut tasks: Vec<Task> = scan_json::<Task>(self.store.as_ref(), TASK_PREFIX)
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        Ok(tasks)
    }

    /// Subtasks of `parent_id` in child order.
    pub async fn children_of(&self, parent_id: Uuid) -> SwitchboardResult<Vec<Task>> {
        let mut children: Vec<Task> = self
            .list_all()
            .await?
            .into_iter()
            .filter(|t| t.parent_id == Some(parent_id))
            .collect();
        children.sort_by_key(|t| (t.child_index.unwrap_or(u32::MAX), t.created_at));
        Ok(children)
    }
}
