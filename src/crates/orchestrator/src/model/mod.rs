//! Domain model
//!
//! Tasks, steps, checkpoints, automations and the recovery audit trail.
//! These are the canonical in-memory shapes; `db::models` holds the row
//! representations they are persisted as.

pub mod automation;
pub mod checkpoint;
pub mod modification;
pub mod step;
pub mod task;

pub use automation::{Automation, NewAutomation};
pub use checkpoint::{CheckpointDecision, CheckpointPlacement, CheckpointState, CheckpointType};
pub use modification::{FailureCategory, FailureClass, PlanModification, RecoveryAction};
pub use step::{AgentType, CheckpointConfig, StepStatus, TaskStep};
pub use task::{Task, TaskStatus};
