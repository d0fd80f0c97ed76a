//! Execution attempt summaries and the failure backoff policy.
//!
//! Every attempt ends with a bounded [`ExecutionSummary`] appended to the
//! task record, and failing attempts are fed through [`next_backoff`] to
//! decide between retry, demotion, and blocking.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::core::task::MAX_URGENCY_RANK;

/// Consecutive failures that trigger demotion (or blocking at max rank).
pub const BACKOFF_FAILURE_THRESHOLD: u32 = 3;

/// Character budget for stored summary text.
pub const SUMMARY_CHAR_BUDGET: usize = 500;

/// Pipeline phase an attempt ran in. This core dispatches `Execute` agents;
/// the other phases appear in summaries recorded by outer layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Plan,
    Execute,
    Review,
}

/// Outcome of a single execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// Immutable record of one execution attempt. Appended to task history and
/// never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub timestamp: DateTime<Utc>,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
    /// Whitespace-collapsed, budget-truncated human-readable text.
    pub text: String,
}

impl ExecutionSummary {
    /// Build a summary, condensing `text` to the storage budget.
    pub fn new(attempt: u32, outcome: AttemptOutcome, phase: Phase, text: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            attempt,
            outcome,
            phase,
            failure_type: None,
            block_reason: None,
            text: condense(text, SUMMARY_CHAR_BUDGET),
        }
    }

    pub fn with_failure_type(mut self, failure_type: &str) -> Self {
        self.failure_type = Some(failure_type.to_string());
        self
    }

    pub fn with_block_reason(mut self, reason: &str) -> Self {
        self.block_reason = Some(reason.to_string());
        self
    }
}

/// Collapse all whitespace runs to single spaces and truncate to `budget`
/// characters, appending `...` when truncation happened.
pub fn condense(text: &str, budget: usize) -> String {
    static WHITESPACE: OnceLock<Regex> = OnceLock::new();
    let re = WHITESPACE.get_or_init(|| Regex::new(r"\s+").expect("valid regex"));
    let collapsed = re.replace_all(text.trim(), " ").to_string();
    if collapsed.chars().count() <= budget {
        return collapsed;
    }
    let mut truncated: String = collapsed.chars().take(budget).collect();
    truncated.push_str("...");
    truncated
}

/// Decision produced by the backoff policy for a failing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDecision {
    /// Below the threshold: task reopens, counter keeps accumulating.
    Retry { failures: u32 },
    /// Threshold reached below max rank: demote one step, counter resets.
    Demote { new_rank: u8 },
    /// Threshold reached at max rank: block until external action.
    Block,
}

/// Evaluate the backoff policy for a failure, given the failure count
/// *before* this attempt and the task's current urgency rank.
pub fn next_backoff(failures_before: u32, rank: u8) -> BackoffDecision {
    let failures = failures_before + 1;
    if failures < BACKOFF_FAILURE_THRESHOLD {
        BackoffDecision::Retry { failures }
    } else if rank < MAX_URGENCY_RANK {
        BackoffDecision::Demote { new_rank: rank + 1 }
    } else {
        BackoffDecision::Block
    }
}
