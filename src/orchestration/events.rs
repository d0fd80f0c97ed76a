//! Dispatch event publication.
//!
//! The dispatcher reports what happened through an [`EventSink`] so UI and
//! notification layers can observe progress without polling the store.
//! Publication is fire-and-forget: a sink with no listener never blocks or
//! fails dispatch.

use std::time::Duration;

use crate::agent::AgentId;
use crate::core::task::{TaskId, TaskStatus};

/// Something the dispatcher observed or caused.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    /// A task's status changed in the store.
    TaskStatusChanged {
        project_id: String,
        task_id: TaskId,
        status: TaskStatus,
    },
    /// A chunk of agent stdout/stderr.
    AgentOutput {
        project_id: String,
        task_id: TaskId,
        agent_id: AgentId,
        chunk: String,
    },
    /// An agent produced no output for longer than the inactivity timeout
    /// and is being terminated.
    AgentStalled {
        project_id: String,
        task_id: TaskId,
        agent_id: AgentId,
        idle: Duration,
    },
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: DispatchEvent);
}

/// Sink that forwards events over an unbounded channel. Dropping the
/// receiver silently discards further events.
pub struct ChannelSink {
    tx: tokio::sync::mpsc::UnboundedSender<DispatchEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<DispatchEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, event: DispatchEvent) {
        let _ = self.tx.send(event);
    }
}

/// Sink that drops everything. Default for embedders that do not observe.
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: DispatchEvent) {}
}
