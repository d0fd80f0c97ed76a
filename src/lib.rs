//! OpenSprint core: autonomous dispatch of coding-agent processes over a
//! project's task graph, with git-branch isolation per task and crash
//! recovery that never loses in-progress work.
//!
//! The [`orchestration::Dispatcher`] claims ready tasks from a
//! [`core::store::TaskStore`], runs one agent CLI process per task on a
//! dedicated `opensprint/<task-id>` branch, and feeds failures through a
//! demotion backoff policy. The [`orchestration::OrphanRecovery`] sweep
//! preserves the working tree of crashed agents as WIP commits and reopens
//! their tasks.

pub mod agent;
pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod log;
pub mod orchestration;
pub mod util;

pub use crate::agent::{Agent, AgentId};
pub use crate::config::Config;
pub use crate::core::store::{MemoryTaskStore, TaskStore};
pub use crate::core::summary::{AttemptOutcome, BackoffDecision, ExecutionSummary, Phase};
pub use crate::core::task::{Task, TaskId, TaskStatus, TaskUpdate};
pub use crate::error::{Error, Result};
pub use crate::git::{task_branch, BranchManager};
pub use crate::orchestration::{
    DispatchEvent, DispatchStatus, Dispatcher, DispatcherConfig, KillOutcome, OrphanRecovery,
    ProcessRegistry,
};
