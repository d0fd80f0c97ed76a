//! Dispatching, supervision, and recovery of agent processes.

mod dispatcher;
mod events;
mod recovery;
mod registry;

pub use dispatcher::{
    ActiveAgent, DispatchStatus, Dispatcher, DispatcherConfig, KillOutcome,
};
pub use events::{ChannelSink, DispatchEvent, EventSink, NullSink};
pub use recovery::{OrphanRecovery, RecoveryReport, RECOVERY_INTERVAL};
pub use registry::{send_sigterm, ProcessHandle, ProcessRegistry};
