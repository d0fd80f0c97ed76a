//! Registry of live agent processes.
//!
//! The registry is the single source of truth for "is this agent alive":
//! orphan recovery treats any in-progress assignee without an entry here as
//! dead. Entries are registered before an agent's supervision starts and
//! unregistered as the very first step after its process exits, so a
//! registered entry always refers to a process we spawned.

use std::collections::HashMap;
use std::sync::Mutex;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::agent::AgentId;
use crate::{osplog, osplog_debug, osplog_warn, Error, Result};

/// A spawned agent process. `is_group` records whether the process was
/// started as its own process group leader, in which case termination
/// signals go to the whole group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: i32,
    pub is_group: bool,
}

impl ProcessHandle {
    pub fn new(pid: i32) -> Self {
        Self {
            pid,
            is_group: false,
        }
    }

    pub fn group(pid: i32) -> Self {
        Self {
            pid,
            is_group: true,
        }
    }
}

/// Send SIGTERM to a process or its whole group. A target that has already
/// exited maps to [`Error::ProcessNotFound`].
pub fn send_sigterm(handle: &ProcessHandle) -> Result<()> {
    let pid = Pid::from_raw(handle.pid);
    let result = if handle.is_group {
        signal::killpg(pid, Signal::SIGTERM)
    } else {
        signal::kill(pid, Signal::SIGTERM)
    };
    match result {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Err(Error::ProcessNotFound(handle.pid)),
        Err(e) => Err(Error::Io(std::io::Error::from_raw_os_error(e as i32))),
    }
}

#[derive(Default)]
pub struct ProcessRegistry {
    entries: Mutex<HashMap<AgentId, ProcessHandle>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, agent_id: AgentId, handle: ProcessHandle) {
        osplog_debug!(
            "Registering agent {} pid={} group={}",
            agent_id.short(),
            handle.pid,
            handle.is_group
        );
        let mut entries = self.entries.lock().expect("registry lock");
        entries.insert(agent_id, handle);
    }

    /// Remove and return an entry. Idempotent: a second call returns `None`.
    pub fn unregister(&self, agent_id: &AgentId) -> Option<ProcessHandle> {
        let mut entries = self.entries.lock().expect("registry lock");
        entries.remove(agent_id)
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<ProcessHandle> {
        let entries = self.entries.lock().expect("registry lock");
        entries.get(agent_id).copied()
    }

    pub fn contains(&self, agent_id: &AgentId) -> bool {
        let entries = self.entries.lock().expect("registry lock");
        entries.contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().expect("registry lock");
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Terminate every registered process. The registry is always empty
    /// afterwards; failed signals (including already-dead targets) are
    /// logged and never abort the sweep. Returns how many processes were
    /// actually signalled.
    pub fn kill_all(&self) -> usize {
        let drained: Vec<(AgentId, ProcessHandle)> = {
            let mut entries = self.entries.lock().expect("registry lock");
            entries.drain().collect()
        };
        if drained.is_empty() {
            return 0;
        }
        osplog!("Terminating {} agent process(es)", drained.len());

        let mut signalled = 0;
        for (agent_id, handle) in drained {
            match send_sigterm(&handle) {
                Ok(()) => signalled += 1,
                Err(Error::ProcessNotFound(pid)) => {
                    osplog_debug!("Agent {} pid={} already gone", agent_id.short(), pid);
                }
                Err(e) => {
                    osplog_warn!(
                        "Failed to signal agent {} pid={}: {}",
                        agent_id.short(),
                        handle.pid,
                        e
                    );
                }
            }
        }
        signalled
    }
}
