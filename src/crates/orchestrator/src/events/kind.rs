//! Lifecycle event definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{
    CheckpointDecision, CheckpointPlacement, CheckpointType, FailureClass, PlanModification,
    TaskStatus,
};

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventKind {
    TaskCreated {
        goal: String,
    },
    PlanningStarted,
    PlanningCompleted {
        step_count: usize,
    },
    PlanningFailed {
        error: String,
    },
    TaskStarted {
        step_count: usize,
    },
    StatusChanged {
        from: TaskStatus,
        to: TaskStatus,
    },
    StepDispatched {
        step_id: String,
        agent_type: String,
        parallel_group: Option<String>,
        attempt: u32,
    },
    StepCompleted {
        step_id: String,
        output: Value,
    },
    StepFailed {
        step_id: String,
        error: String,
        class: FailureClass,
    },
    CheckpointCreated {
        step_id: String,
        checkpoint_id: String,
        checkpoint_type: CheckpointType,
        placement: CheckpointPlacement,
        description: String,
    },
    CheckpointAutoApproved {
        step_id: String,
        pattern: String,
    },
    CheckpointResolved {
        step_id: String,
        checkpoint_id: String,
        decision: CheckpointDecision,
        resolved_by: String,
    },
    PlanModified {
        modification: PlanModification,
    },
    /// A published decision that lost its race and was never applied
    PlanModificationDropped {
        modification_id: String,
        step_id: String,
        reason: String,
    },
    TaskPaused,
    TaskResumed,
    TaskCompleted,
    TaskFailed {
        error: String,
        failed_step_id: Option<String>,
    },
    TaskCancelled,
    AutomationTriggered {
        automation_id: String,
        template_task_id: String,
    },
    AutomationSkipped {
        automation_id: String,
        running_task_id: String,
    },
}

impl EventKind {
    /// Wire name, identical to the serialized `type` tag
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::TaskCreated { .. } => "task_created",
            EventKind::PlanningStarted => "planning_started",
            EventKind::PlanningCompleted { .. } => "planning_completed",
            EventKind::PlanningFailed { .. } => "planning_failed",
            EventKind::TaskStarted { .. } => "task_started",
            EventKind::StatusChanged { .. } => "status_changed",
            EventKind::StepDispatched { .. } => "step_dispatched",
            EventKind::StepCompleted { .. } => "step_completed",
            EventKind::StepFailed { .. } => "step_failed",
            EventKind::CheckpointCreated { .. } => "checkpoint_created",
            EventKind::CheckpointAutoApproved { .. } => "checkpoint_auto_approved",
            EventKind::CheckpointResolved { .. } => "checkpoint_resolved",
            EventKind::PlanModified { .. } => "plan_modified",
            EventKind::PlanModificationDropped { .. } => "plan_modification_dropped",
            EventKind::TaskPaused => "task_paused",
            EventKind::TaskResumed => "task_resumed",
            EventKind::TaskCompleted => "task_completed",
            EventKind::TaskFailed { .. } => "task_failed",
            EventKind::TaskCancelled => "task_cancelled",
            EventKind::AutomationTriggered { .. } => "automation_triggered",
            EventKind::AutomationSkipped { .. } => "automation_skipped",
        }
    }
}

/// An event as published on a task's channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Per-task, starts at 1
    pub sequence: u64,
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub event: EventKind,
}
