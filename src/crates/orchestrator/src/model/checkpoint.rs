//! Human decision gates bound to a (task, step) pair

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// What kind of human interaction the checkpoint asks for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointType {
    /// Plain approve / reject
    #[default]
    Approval,
    /// Human supplies missing input
    Input,
    /// Human edits the proposed inputs
    Modify,
    /// Human picks one of several options
    Select,
    /// Human answers a question
    Qa,
}

impl CheckpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointType::Approval => "approval",
            CheckpointType::Input => "input",
            CheckpointType::Modify => "modify",
            CheckpointType::Select => "select",
            CheckpointType::Qa => "qa",
        }
    }
}

impl FromStr for CheckpointType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approval" => Ok(CheckpointType::Approval),
            "input" => Ok(CheckpointType::Input),
            "modify" => Ok(CheckpointType::Modify),
            "select" => Ok(CheckpointType::Select),
            "qa" => Ok(CheckpointType::Qa),
            other => Err(format!("unknown checkpoint type '{}'", other)),
        }
    }
}

/// Whether the gate sits before dispatch or after completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointPlacement {
    #[default]
    Before,
    After,
}

impl CheckpointPlacement {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointPlacement::Before => "before",
            CheckpointPlacement::After => "after",
        }
    }
}

impl FromStr for CheckpointPlacement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "before" => Ok(CheckpointPlacement::Before),
            "after" => Ok(CheckpointPlacement::After),
            other => Err(format!("unknown checkpoint placement '{}'", other)),
        }
    }
}

/// Human decision on a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointDecision {
    Pending,
    Approved,
    Rejected,
}

impl CheckpointDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointDecision::Pending => "pending",
            CheckpointDecision::Approved => "approved",
            CheckpointDecision::Rejected => "rejected",
        }
    }
}

impl fmt::Display for CheckpointDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(CheckpointDecision::Pending),
            "approved" | "approve" => Ok(CheckpointDecision::Approved),
            "rejected" | "reject" => Ok(CheckpointDecision::Rejected),
            other => Err(format!("unknown checkpoint decision '{}'", other)),
        }
    }
}

/// A pending or resolved checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub id: String,
    pub task_id: String,
    pub step_id: String,
    pub checkpoint_type: CheckpointType,
    pub placement: CheckpointPlacement,
    pub description: String,
    pub preview_data: Option<Value>,
    pub decision: CheckpointDecision,
    pub feedback: Option<String>,
    /// Structured answer for input / modify / select / qa checkpoints
    pub response: Option<Value>,
    pub resolved_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CheckpointState {
    pub fn is_resolved(&self) -> bool {
        self.decision != CheckpointDecision::Pending
    }

    pub fn is_approved(&self) -> bool {
        self.decision == CheckpointDecision::Approved
    }

    /// A pending checkpoint past its deadline
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.is_resolved() && self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}
