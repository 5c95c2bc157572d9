//! Task status transitions
//!
//! The only writer of `Task.status`. An edge is validated against the
//! durable copy inside the compare-and-set closure, so an illegal edge never
//! writes anything and a concurrent writer forces re-validation.

use std::sync::Arc;
use tracing::info;

use crate::db::models::now;
use crate::events::{EventKind, EventPublisher};
use crate::model::{Task, TaskStatus};
use crate::store::TaskStore;
use crate::{OrchestratorError, Result};

/// Statuses reachable from `from` in one step
pub fn allowed_targets(from: TaskStatus) -> &'static [TaskStatus] {
    use TaskStatus::*;
    match from {
        Pending => &[Planning, Ready, Failed, Cancelled],
        Planning => &[Ready, Failed, Cancelled],
        Ready => &[Executing, Failed, Cancelled],
        Executing => &[Checkpoint, Paused, Completed, Failed, Cancelled],
        Checkpoint => &[Executing, Paused, Failed, Cancelled],
        Paused => &[Executing, Checkpoint, Failed, Cancelled],
        Completed | Failed | Cancelled => &[],
    }
}

pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    allowed_targets(from).contains(&to)
}

/// Fields written together with a status change
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdates {
    pub error: Option<String>,
    pub failed_step_id: Option<String>,
}

impl TransitionUpdates {
    pub fn failure(error: impl Into<String>, failed_step_id: Option<String>) -> Self {
        Self {
            error: Some(error.into()),
            failed_step_id,
        }
    }
}

pub struct StateMachine {
    store: Arc<TaskStore>,
    events: Arc<EventPublisher>,
}

impl StateMachine {
    pub fn new(store: Arc<TaskStore>, events: Arc<EventPublisher>) -> Self {
        Self { store, events }
    }

    pub async fn transition(
        &self,
        task_id: &str,
        target: TaskStatus,
        updates: TransitionUpdates,
    ) -> Result<Task> {
        self.transition_with(task_id, target, updates, |_| Ok(())).await
    }

    /// Transition plus additional task mutations in the same write
    pub async fn transition_with<F>(
        &self,
        task_id: &str,
        target: TaskStatus,
        updates: TransitionUpdates,
        mut extra: F,
    ) -> Result<Task>
    where
        F: FnMut(&mut Task) -> Result<()>,
    {
        match self
            .transition_if(task_id, target, updates, |task| extra(task).map(|_| true))
            .await?
        {
            Some(task) => Ok(task),
            None => self.store.load_authoritative(task_id).await,
        }
    }

    /// Guarded transition
    ///
    /// `guard` runs first against the fresh durable copy and may mutate it;
    /// returning `false` abandons the transition without writing, and the
    /// result is `None`.
    pub async fn transition_if<F>(
        &self,
        task_id: &str,
        target: TaskStatus,
        updates: TransitionUpdates,
        mut guard: F,
    ) -> Result<Option<Task>>
    where
        F: FnMut(&mut Task) -> Result<bool>,
    {
        let (task, from) = self
            .store
            .try_update(task_id, |task| {
                let current = task.status;
                if !guard(task)? {
                    return Ok(None);
                }
                if !can_transition(current, target) {
                    return Err(OrchestratorError::InvalidTransition {
                        task_id: task.id.clone(),
                        current,
                        target,
                    });
                }

                task.status = target;
                if let Some(ref error) = updates.error {
                    task.error = Some(error.clone());
                }
                if let Some(ref step_id) = updates.failed_step_id {
                    task.failed_step_id = Some(step_id.clone());
                }
                if target.is_terminal() {
                    task.completed_at = Some(now());
                }
                Ok(Some(current))
            })
            .await?;

        let Some(from) = from else {
            return Ok(None);
        };

        info!(task_id = %task_id, from = %from, to = %target, "Task status changed");
        self.emit(&task, from, target).await;
        Ok(Some(task))
    }

    async fn emit(&self, task: &Task, from: TaskStatus, to: TaskStatus) {
        self.events
            .publish(&task.id, EventKind::StatusChanged { from, to })
            .await;

        let specific = match (from, to) {
            (_, TaskStatus::Paused) => Some(EventKind::TaskPaused),
            (TaskStatus::Paused, TaskStatus::Executing) => Some(EventKind::TaskResumed),
            (_, TaskStatus::Completed) => Some(EventKind::TaskCompleted),
            (_, TaskStatus::Failed) => Some(EventKind::TaskFailed {
                error: task
                    .error
                    .clone()
                    .unwrap_or_else(|| "task failed".to_string()),
                failed_step_id: task.failed_step_id.clone(),
            }),
            (_, TaskStatus::Cancelled) => Some(EventKind::TaskCancelled),
            _ => None,
        };

        if let Some(kind) = specific {
            self.events.publish(&task.id, kind).await;
        }
        if to.is_terminal() {
            self.events.retire(&task.id);
        }
    }
}
