//! Autonomous task orchestration core
//!
//! Turns a declarative plan (a goal decomposed into steps) into a supervised,
//! resumable execution: dependency-driven dispatch, human checkpoints,
//! failure recovery without re-planning, and recurring automations.
//!
//! The [`Orchestrator`] facade wires the components together:
//!
//! - [`store::TaskStore`]: durable SQLite store with a write-through cache
//! - [`state_machine::StateMachine`]: the only writer of `Task.status`
//! - [`scheduler::StepScheduler`]: ready-step computation and dispatch
//! - [`checkpoint::CheckpointManager`]: human approval gates
//! - [`observer::Observer`]: retry / fallback / skip / abort decisions
//! - [`automation::AutomationScheduler`]: cron and one-shot re-execution
//! - [`events::EventPublisher`]: per-task event channel with replay

pub mod automation;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod db;
pub mod engine;
pub mod events;
pub mod executor;
pub mod model;
pub mod observer;
pub mod scheduler;
pub mod shutdown;
pub mod state_machine;
pub mod store;

pub use config::OrchestratorConfig;
pub use engine::{NewTask, Orchestrator};
pub use model::{
    AgentType, Automation, CheckpointConfig, CheckpointDecision, CheckpointState, NewAutomation,
    PlanModification, RecoveryAction, StepStatus, Task, TaskStatus, TaskStep,
};

use thiserror::Error;

/// Errors surfaced by orchestration operations
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Step {step_id} not found in task {task_id}")]
    StepNotFound { task_id: String, step_id: String },

    /// Illegal state-machine edge; never retried
    #[error("Invalid transition for task {task_id}: {current} -> {target}")]
    InvalidTransition {
        task_id: String,
        current: model::TaskStatus,
        target: model::TaskStatus,
    },

    #[error("No checkpoint for step {step_id} of task {task_id}")]
    CheckpointNotFound { task_id: String, step_id: String },

    #[error("Checkpoint validation failed: {0}")]
    CheckpointValidation(String),

    /// Executor could not accept the step
    #[error("Dispatch of step {step_id} failed: {reason}")]
    StepDispatch { step_id: String, reason: String },

    /// Malformed cron expression, timezone or template reference
    #[error("Invalid automation schedule: {0}")]
    AutomationSchedule(String),

    #[error("Automation not found: {0}")]
    AutomationNotFound(String),

    #[error("Plan validation failed: {0}")]
    PlanValidation(String),

    #[error("Planning failed: {0}")]
    Planning(String),

    /// Another writer kept winning the compare-and-set race
    #[error("Version conflict on task {task_id} after {attempts} attempts")]
    VersionConflict { task_id: String, attempts: u32 },

    #[error(transparent)]
    Database(#[from] db::DatabaseError),

    #[error(transparent)]
    Cache(#[from] cache::CacheError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// Errors caused by caller input rather than by the system
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            OrchestratorError::TaskNotFound(_)
                | OrchestratorError::StepNotFound { .. }
                | OrchestratorError::InvalidTransition { .. }
                | OrchestratorError::CheckpointNotFound { .. }
                | OrchestratorError::CheckpointValidation(_)
                | OrchestratorError::AutomationSchedule(_)
                | OrchestratorError::AutomationNotFound(_)
                | OrchestratorError::PlanValidation(_)
        )
    }
}

impl From<sqlx::Error> for OrchestratorError {
    fn from(err: sqlx::Error) -> Self {
        OrchestratorError::Database(err.into())
    }
}

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Get version information
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
