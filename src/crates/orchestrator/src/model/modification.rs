//! Audit trail of recovery decisions applied to a live plan

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Raw failure signal after classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Rate limits, 5xx, dropped connections
    Transient,
    /// Executor exceeded its time budget
    Timeout,
    /// Executor or downstream service cannot serve the step at all
    Unavailable,
    /// Executor rejected the work itself
    Permanent,
    /// A human rejected the step at a checkpoint
    Rejected,
    /// The step is blocked behind a failed dependency
    UpstreamFailed,
}

impl FailureClass {
    /// Whether repeating the same call may succeed
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureClass::Transient | FailureClass::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::Timeout => "timeout",
            FailureClass::Unavailable => "unavailable",
            FailureClass::Permanent => "permanent",
            FailureClass::Rejected => "rejected",
            FailureClass::UpstreamFailed => "upstream_failed",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observer's reading of a failure once step metadata is taken into account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Transient,
    HardUnavailable,
    NonCriticalOmission,
    CriticalNoFallback,
}

/// Recovery decision for a failed or blocked step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryAction {
    Retry,
    Fallback,
    Skip,
    Abort,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::Retry => "retry",
            RecoveryAction::Fallback => "fallback",
            RecoveryAction::Skip => "skip",
            RecoveryAction::Abort => "abort",
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded plan rewrite
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanModification {
    pub id: String,
    pub step_id: String,
    pub action: RecoveryAction,
    pub class: FailureClass,
    pub category: FailureCategory,
    pub reason: String,
    pub error: Option<String>,
    /// Step activated in place of the failed one
    #[serde(default)]
    pub fallback_step_id: Option<String>,
    /// The fallback's own dependencies before it took over
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub fallback_dependencies: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}
