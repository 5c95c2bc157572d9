//! Task model: one governed execution of a decomposed goal

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::modification::PlanModification;
use super::step::{StepStatus, TaskStep};

/// Lifecycle status of a task; changed only through the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Planning,
    Ready,
    Executing,
    Checkpoint,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 9] = [
        TaskStatus::Pending,
        TaskStatus::Planning,
        TaskStatus::Ready,
        TaskStatus::Executing,
        TaskStatus::Checkpoint,
        TaskStatus::Paused,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Planning => "planning",
            TaskStatus::Ready => "ready",
            TaskStatus::Executing => "executing",
            TaskStatus::Checkpoint => "checkpoint",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// No transition leaves a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown task status '{}'", s))
    }
}

/// A unit of autonomous execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub organization_id: String,
    pub user_id: String,
    pub parent_task_id: Option<String>,
    /// Automation that materialized this task, if any
    pub automation_id: Option<String>,
    pub goal: String,
    pub constraints: Map<String, Value>,
    pub steps: Vec<TaskStep>,
    pub current_step_index: usize,
    pub status: TaskStatus,
    /// Bumped on every durable write
    pub version: i64,
    pub error: Option<String>,
    pub failed_step_id: Option<String>,
    pub modifications: Vec<PlanModification>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// New pending task with a generated id and no steps
    pub fn new(
        organization_id: impl Into<String>,
        user_id: impl Into<String>,
        goal: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            organization_id: organization_id.into(),
            user_id: user_id.into(),
            parent_task_id: None,
            automation_id: None,
            goal: goal.into(),
            constraints: Map::new(),
            steps: Vec::new(),
            current_step_index: 0,
            status: TaskStatus::Pending,
            version: 1,
            error: None,
            failed_step_id: None,
            modifications: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn with_steps(mut self, steps: Vec<TaskStep>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_constraint(mut self, key: impl Into<String>, value: Value) -> Self {
        self.constraints.insert(key.into(), value);
        self
    }

    pub fn with_parent(mut self, parent_task_id: impl Into<String>) -> Self {
        self.parent_task_id = Some(parent_task_id.into());
        self
    }

    pub fn step(&self, step_id: &str) -> Option<&TaskStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut TaskStep> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    /// Whether every non-standby step is terminal
    pub fn all_steps_settled(&self) -> bool {
        self.steps
            .iter()
            .filter(|s| !s.standby)
            .all(|s| s.status.is_terminal())
    }

    /// Whether any step is currently with an executor
    pub fn has_running_steps(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Running)
    }

    /// Move the progress cursor to the first unsettled step in plan order
    pub fn refresh_progress(&mut self) {
        self.current_step_index = self
            .steps
            .iter()
            .position(|s| !s.standby && !s.status.is_terminal())
            .unwrap_or(self.steps.len());
    }
}
