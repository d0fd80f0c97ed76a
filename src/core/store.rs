//! Task store contract.
//!
//! The store that owns task records is external to this core; the
//! [`TaskStore`] trait is the minimal read-then-conditional-write surface the
//! dispatcher and recovery service require. `update` must be safe for
//! concurrent invocation across distinct task ids, and `claim` must be an
//! atomic conditional transition per record (optimistic concurrency is
//! sufficient; a lost claim is reported, not an error).
//!
//! [`MemoryTaskStore`] implements the contract for embedding and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::agent::AgentId;
use crate::core::task::{clamp_rank, Task, TaskId, TaskStatus, TaskUpdate};
use crate::{Error, Result};

pub trait TaskStore: Send + Sync {
    /// Fetch one task record.
    fn get(&self, project_id: &str, task_id: &TaskId) -> Result<Task>;

    /// All task records for a project.
    fn list(&self, project_id: &str) -> Result<Vec<Task>>;

    /// Tasks in a claimable status whose dependencies are all done.
    fn list_ready(&self, project_id: &str) -> Result<Vec<Task>>;

    /// Apply a partial update. Status changes are validated against the
    /// transition table; urgency rank is clamped. Returns the updated record.
    fn update(&self, project_id: &str, task_id: &TaskId, update: TaskUpdate) -> Result<Task>;

    /// Atomic conditional claim: `open`/`ready` to `in_progress` with the
    /// assignee set, only if the task is still claimable at update time.
    /// `Ok(false)` means another cycle won the race.
    fn claim(&self, project_id: &str, task_id: &TaskId, assignee: AgentId) -> Result<bool>;
}

/// In-memory task store keyed by project id.
#[derive(Default)]
pub struct MemoryTaskStore {
    projects: Mutex<HashMap<String, HashMap<TaskId, Task>>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a task record.
    pub fn insert(&self, project_id: &str, task: Task) {
        let mut projects = self.projects.lock().expect("store lock");
        projects
            .entry(project_id.to_string())
            .or_default()
            .insert(task.id.clone(), task);
    }

    fn deps_done(tasks: &HashMap<TaskId, Task>, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| {
            tasks
                .get(dep)
                .map(|t| t.status == TaskStatus::Done)
                .unwrap_or(false)
        })
    }
}

impl TaskStore for MemoryTaskStore {
    fn get(&self, project_id: &str, task_id: &TaskId) -> Result<Task> {
        let projects = self.projects.lock().expect("store lock");
        projects
            .get(project_id)
            .and_then(|tasks| tasks.get(task_id))
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))
    }

    fn list(&self, project_id: &str) -> Result<Vec<Task>> {
        let projects = self.projects.lock().expect("store lock");
        Ok(projects
            .get(project_id)
            .map(|tasks| tasks.values().cloned().collect())
            .unwrap_or_default())
    }

    fn list_ready(&self, project_id: &str) -> Result<Vec<Task>> {
        let projects = self.projects.lock().expect("store lock");
        let Some(tasks) = projects.get(project_id) else {
            return Ok(Vec::new());
        };
        Ok(tasks
            .values()
            .filter(|t| t.status.is_claimable() && Self::deps_done(tasks, t))
            .cloned()
            .collect())
    }

    fn update(&self, project_id: &str, task_id: &TaskId, update: TaskUpdate) -> Result<Task> {
        let mut projects = self.projects.lock().expect("store lock");
        let task = projects
            .get_mut(project_id)
            .and_then(|tasks| tasks.get_mut(task_id))
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;

        if let Some(status) = update.status {
            if !task.status.can_transition_to(&status) {
                return Err(Error::InvalidStateTransition {
                    from: task.status.name().to_string(),
                    to: status.name().to_string(),
                });
            }
            task.status = status;
        }
        if let Some(assignee) = update.assignee {
            task.assignee = assignee;
        }
        if let Some(rank) = update.urgency_rank {
            task.urgency_rank = clamp_rank(rank);
        }
        if let Some(count) = update.consecutive_failures {
            task.consecutive_failures = count;
        }
        if let Some(summary) = update.last_execution_summary {
            task.last_execution_summary = Some(summary);
        }
        Ok(task.clone())
    }

    fn claim(&self, project_id: &str, task_id: &TaskId, assignee: AgentId) -> Result<bool> {
        let mut projects = self.projects.lock().expect("store lock");
        let task = projects
            .get_mut(project_id)
            .and_then(|tasks| tasks.get_mut(task_id))
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;

        if !task.status.is_claimable() {
            return Ok(false);
        }
        task.status = TaskStatus::InProgress;
        task.assignee = Some(assignee);
        Ok(true)
    }
}
