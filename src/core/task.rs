//! Task data model for the dispatch state machine.
//!
//! Tasks are owned by the external task store; this core reads them and
//! applies conditional updates. Each task tracks its status, urgency rank,
//! assignee, dependencies, and failure bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::agent::AgentId;
use crate::core::summary::ExecutionSummary;

/// Highest (least urgent) rank a task can hold before further failures
/// block it instead of demoting it.
pub const MAX_URGENCY_RANK: u8 = 4;

/// Clamp an urgency rank into the valid `[0, MAX_URGENCY_RANK]` range.
pub fn clamp_rank(rank: u8) -> u8 {
    rank.min(MAX_URGENCY_RANK)
}

/// Identifier of a task, unique within a project. Owned by the task store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Task status in its lifecycle.
///
/// A closed state-variant type; legal edges are encoded in
/// [`TaskStatus::can_transition_to`] so invalid states (such as a blocked
/// task being re-claimed) are rejected at the store boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Task exists and may be claimed once its dependencies are done.
    Open,
    /// Store-side hint that dependencies are satisfied; still claimable.
    Ready,
    /// Task is currently assigned to a live agent.
    InProgress,
    /// Task finished executing and awaits review.
    InReview,
    /// Task exhausted its automatic retries; needs external action.
    Blocked {
        /// Reason why the task is blocked.
        reason: String,
    },
    /// Task completed.
    Done,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Open
    }
}

impl TaskStatus {
    /// Whether the dispatcher may claim a task in this status.
    pub fn is_claimable(&self) -> bool {
        matches!(self, TaskStatus::Open | TaskStatus::Ready)
    }

    /// Short status tag without variant payload.
    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::InReview => "in_review",
            TaskStatus::Blocked { .. } => "blocked",
            TaskStatus::Done => "done",
        }
    }

    /// Exhaustive transition table. Transitions within the same variant
    /// (e.g. refreshing a block reason) are always allowed.
    pub fn can_transition_to(&self, next: &TaskStatus) -> bool {
        use TaskStatus::*;
        if std::mem::discriminant(self) == std::mem::discriminant(next) {
            return true;
        }
        match (self, next) {
            (Open, Ready) | (Open, InProgress) => true,
            (Ready, Open) | (Ready, InProgress) => true,
            (InProgress, Open) | (InProgress, InReview) => true,
            (InProgress, Blocked { .. }) | (InProgress, Done) => true,
            (InReview, Open) | (InReview, Done) => true,
            (Blocked { .. }, Open) | (Blocked { .. }, Ready) => true,
            (Done, _) => false,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Open => write!(f, "open"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::InReview => write!(f, "in_review"),
            TaskStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
            TaskStatus::Done => write!(f, "done"),
        }
    }
}

/// A single task in the project's dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier within the project.
    pub id: TaskId,
    /// Human-readable name for the task.
    pub title: String,
    /// Detailed description of what the task should accomplish; used as the
    /// agent prompt.
    pub description: String,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Urgency rank: 0 is most urgent; repeated failures increase the value
    /// (demotion). Always within `[0, MAX_URGENCY_RANK]`.
    pub urgency_rank: u8,
    /// Identity of the agent currently assigned, if any.
    pub assignee: Option<AgentId>,
    /// Tasks that must be `Done` before this one may be dispatched.
    pub dependencies: HashSet<TaskId>,
    /// Count of consecutive failing attempts.
    pub consecutive_failures: u32,
    /// When the task was created; FIFO tie-breaker for dispatch ordering.
    pub created_at: DateTime<Utc>,
    /// Record of the most recent execution attempt.
    pub last_execution_summary: Option<ExecutionSummary>,
}

impl Task {
    /// Create a new open task with the given id, title, and description.
    pub fn new(id: impl Into<TaskId>, title: &str, description: &str) -> Self {
        Self {
            id: id.into(),
            title: title.to_string(),
            description: description.to_string(),
            status: TaskStatus::Open,
            urgency_rank: 0,
            assignee: None,
            dependencies: HashSet::new(),
            consecutive_failures: 0,
            created_at: Utc::now(),
            last_execution_summary: None,
        }
    }

    /// Set the urgency rank (clamped).
    pub fn with_rank(mut self, rank: u8) -> Self {
        self.urgency_rank = clamp_rank(rank);
        self
    }

    /// Add a dependency on another task.
    pub fn with_dependency(mut self, dep: impl Into<TaskId>) -> Self {
        self.dependencies.insert(dep.into());
        self
    }

    /// Check if the task is in a terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(self.status, TaskStatus::Done)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A partial update applied to a task record by the store.
///
/// Unset fields are left untouched; `assignee` distinguishes "leave as is"
/// (`None`) from "clear" (`Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub assignee: Option<Option<AgentId>>,
    pub urgency_rank: Option<u8>,
    pub consecutive_failures: Option<u32>,
    pub last_execution_summary: Option<ExecutionSummary>,
}

impl TaskUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn assignee(mut self, assignee: AgentId) -> Self {
        self.assignee = Some(Some(assignee));
        self
    }

    pub fn clear_assignee(mut self) -> Self {
        self.assignee = Some(None);
        self
    }

    pub fn urgency_rank(mut self, rank: u8) -> Self {
        self.urgency_rank = Some(rank);
        self
    }

    pub fn consecutive_failures(mut self, count: u32) -> Self {
        self.consecutive_failures = Some(count);
        self
    }

    pub fn summary(mut self, summary: ExecutionSummary) -> Self {
        self.last_execution_summary = Some(summary);
        self
    }
}
