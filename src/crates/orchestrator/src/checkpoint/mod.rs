//! Human approval gates
//!
//! A step with a `checkpoint_config` is gated either before dispatch or
//! after completion. Creating a checkpoint suspends the task in
//! `checkpoint` status; resolving the last pending one returns it to
//! `executing`. At most one pending checkpoint exists per (task, step),
//! enforced by a partial unique index.
//!
//! Decisions can be remembered per user and step pattern: an approved
//! preference auto-approves later checkpoints for similar steps.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::models::{format_ts, now, CheckpointRow};
use crate::db::repositories::{CheckpointRepository, PreferenceRepository};
use crate::db::{DatabaseError, DatabasePool};
use crate::events::{EventKind, EventPublisher};
use crate::model::{
    CheckpointConfig, CheckpointDecision, CheckpointPlacement, CheckpointState, FailureClass,
    StepStatus, TaskStatus, TaskStep,
};
use crate::observer::Observer;
use crate::state_machine::{StateMachine, TransitionUpdates};
use crate::store::TaskStore;
use crate::{OrchestratorError, Result};

/// Actor recorded on checkpoints the system resolves itself
pub const SYSTEM_ACTOR: &str = "system";

/// State of a step's checkpoint gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    /// No checkpoint yet
    Missing,
    /// Awaiting a decision
    Waiting,
    Open,
    Rejected,
}

/// Result of [`CheckpointManager::create_checkpoint`]
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointOutcome {
    /// New pending checkpoint; the task is suspended
    Created(CheckpointState),
    /// A pending checkpoint already existed
    Existing(CheckpointState),
    /// Approved on the spot by a learned preference
    AutoApproved(CheckpointState),
    /// The step was approved before, e.g. prior to a crash
    AlreadyApproved(CheckpointState),
}

impl CheckpointOutcome {
    pub fn state(&self) -> &CheckpointState {
        match self {
            CheckpointOutcome::Created(s)
            | CheckpointOutcome::Existing(s)
            | CheckpointOutcome::AutoApproved(s)
            | CheckpointOutcome::AlreadyApproved(s) => s,
        }
    }

    /// Whether execution may proceed without waiting
    pub fn is_approved(&self) -> bool {
        matches!(
            self,
            CheckpointOutcome::AutoApproved(_) | CheckpointOutcome::AlreadyApproved(_)
        )
    }
}

pub struct CheckpointManager {
    store: Arc<TaskStore>,
    state: Arc<StateMachine>,
    observer: Arc<Observer>,
    events: Arc<EventPublisher>,
    /// 0 disables expiry
    default_timeout_secs: u64,
}

impl CheckpointManager {
    pub fn new(
        store: Arc<TaskStore>,
        state: Arc<StateMachine>,
        observer: Arc<Observer>,
        events: Arc<EventPublisher>,
        default_timeout_secs: u64,
    ) -> Self {
        Self {
            store,
            state,
            observer,
            events,
            default_timeout_secs,
        }
    }

    fn pool(&self) -> &DatabasePool {
        self.store.pool()
    }

    fn expiry(&self, config: &CheckpointConfig, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let secs = config.timeout_secs.unwrap_or(self.default_timeout_secs);
        if secs == 0 {
            return None;
        }
        i64::try_from(secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|ttl| from.checked_add_signed(ttl))
    }

    /// Latest before-dispatch checkpoint state for a step
    pub async fn gate_status(&self, task_id: &str, step_id: &str) -> Result<GateStatus> {
        self.gate_status_at(task_id, step_id, CheckpointPlacement::Before)
            .await
    }

    /// Latest checkpoint state for a step at one placement
    pub async fn gate_status_at(
        &self,
        task_id: &str,
        step_id: &str,
        placement: CheckpointPlacement,
    ) -> Result<GateStatus> {
        let latest =
            CheckpointRepository::find_latest(self.pool(), task_id, step_id, placement.as_str())
                .await?;

        Ok(match latest {
            None => GateStatus::Missing,
            Some(row) => match row.into_state()?.decision {
                CheckpointDecision::Pending => GateStatus::Waiting,
                CheckpointDecision::Approved => GateStatus::Open,
                CheckpointDecision::Rejected => GateStatus::Rejected,
            },
        })
    }

    /// Gate a step behind a human decision
    ///
    /// Idempotent per (task, step): an existing pending checkpoint is
    /// returned as is, and a step approved earlier is not asked again.
    pub async fn create_checkpoint(
        &self,
        task_id: &str,
        step: &TaskStep,
        user_id: &str,
    ) -> Result<CheckpointOutcome> {
        if let Some(row) = CheckpointRepository::find_pending(self.pool(), task_id, &step.id).await? {
            debug!(task_id = %task_id, step_id = %step.id, "Checkpoint already pending");
            return Ok(CheckpointOutcome::Existing(row.into_state()?));
        }

        let config = step
            .checkpoint_config
            .clone()
            .unwrap_or_else(|| CheckpointConfig::before(step.name.clone()));

        if let Some(row) =
            CheckpointRepository::find_latest(self.pool(), task_id, &step.id, config.when.as_str())
                .await?
        {
            let previous = row.into_state()?;
            if previous.is_approved() {
                debug!(task_id = %task_id, step_id = %step.id, "Step already approved, not asking again");
                return Ok(CheckpointOutcome::AlreadyApproved(previous));
            }
        }

        let created_at = now();
        let description = if config.description.is_empty() {
            step.name.clone()
        } else {
            config.description.clone()
        };
        let mut checkpoint = CheckpointState {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            step_id: step.id.clone(),
            checkpoint_type: config.checkpoint_type,
            placement: config.when,
            description,
            preview_data: config.preview_data.clone(),
            decision: CheckpointDecision::Pending,
            feedback: None,
            response: None,
            resolved_by: None,
            created_at,
            resolved_at: None,
            expires_at: self.expiry(&config, created_at),
        };

        let pattern = step.semantic_pattern();
        let preference = PreferenceRepository::find(self.pool(), user_id, &pattern).await?;
        if preference.map(|p| p.is_approval()).unwrap_or(false) {
            checkpoint.decision = CheckpointDecision::Approved;
            checkpoint.feedback = Some("auto-approved by learned preference".to_string());
            checkpoint.resolved_by = Some(user_id.to_string());
            checkpoint.resolved_at = Some(created_at);
            checkpoint.expires_at = None;
            CheckpointRepository::insert(self.pool(), &CheckpointRow::from_state(&checkpoint)?)
                .await?;

            info!(task_id = %task_id, step_id = %step.id, pattern = %pattern, "Checkpoint auto-approved");
            self.events
                .publish(
                    task_id,
                    EventKind::CheckpointAutoApproved {
                        step_id: step.id.clone(),
                        pattern,
                    },
                )
                .await;
            return Ok(CheckpointOutcome::AutoApproved(checkpoint));
        }

        if let Err(e) =
            CheckpointRepository::insert(self.pool(), &CheckpointRow::from_state(&checkpoint)?).await
        {
            let err = DatabaseError::from(e);
            if err.is_constraint_violation() {
                // lost a race with a concurrent creator
                if let Some(row) =
                    CheckpointRepository::find_pending(self.pool(), task_id, &step.id).await?
                {
                    return Ok(CheckpointOutcome::Existing(row.into_state()?));
                }
            }
            return Err(err.into());
        }

        let task = self.store.load_authoritative(task_id).await?;
        if task.status == TaskStatus::Executing {
            self.state
                .transition(task_id, TaskStatus::Checkpoint, TransitionUpdates::default())
                .await?;
        }

        info!(
            task_id = %task_id,
            step_id = %step.id,
            checkpoint_id = %checkpoint.id,
            placement = %checkpoint.placement.as_str(),
            "Checkpoint created"
        );
        self.events
            .publish(
                task_id,
                EventKind::CheckpointCreated {
                    step_id: step.id.clone(),
                    checkpoint_id: checkpoint.id.clone(),
                    checkpoint_type: checkpoint.checkpoint_type,
                    placement: checkpoint.placement,
                    description: checkpoint.description.clone(),
                },
            )
            .await;

        Ok(CheckpointOutcome::Created(checkpoint))
    }

    /// Record a human decision on a step's pending checkpoint
    ///
    /// A rejection fails the gated step and routes it through the Observer.
    /// An approved before-dispatch checkpoint with an object `response`
    /// merges that object into the step's inputs. The caller reschedules.
    #[allow(clippy::too_many_arguments)]
    pub async fn resolve_checkpoint(
        &self,
        task_id: &str,
        step_id: &str,
        user_id: &str,
        decision: &str,
        feedback: Option<String>,
        response: Option<Value>,
        learn_preference: bool,
    ) -> Result<CheckpointState> {
        let decision: CheckpointDecision = decision
            .parse()
            .map_err(OrchestratorError::CheckpointValidation)?;
        if decision == CheckpointDecision::Pending {
            return Err(OrchestratorError::CheckpointValidation(
                "decision must be approved or rejected".to_string(),
            ));
        }

        let pending = match CheckpointRepository::find_pending(self.pool(), task_id, step_id).await? {
            Some(row) => row.into_state()?,
            None => {
                let any = CheckpointRepository::find_latest_any(self.pool(), task_id, step_id).await?;
                return Err(match any {
                    Some(_) => OrchestratorError::CheckpointValidation(format!(
                        "checkpoint for step {} of task {} is already resolved",
                        step_id, task_id
                    )),
                    None => OrchestratorError::CheckpointNotFound {
                        task_id: task_id.to_string(),
                        step_id: step_id.to_string(),
                    },
                });
            }
        };

        let task = self.store.load_authoritative(task_id).await?;
        let step = task
            .step(step_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::StepNotFound {
                task_id: task_id.to_string(),
                step_id: step_id.to_string(),
            })?;

        let resolved_at = now();
        let response_json = response.as_ref().map(serde_json::to_string).transpose()?;
        let recorded = CheckpointRepository::resolve(
            self.pool(),
            &pending.id,
            decision.as_str(),
            feedback.as_deref(),
            response_json.as_deref(),
            user_id,
            &format_ts(&resolved_at),
        )
        .await?;
        if !recorded {
            return Err(OrchestratorError::CheckpointValidation(format!(
                "checkpoint for step {} of task {} is already resolved",
                step_id, task_id
            )));
        }

        let resolved = CheckpointState {
            decision,
            feedback,
            response,
            resolved_by: Some(user_id.to_string()),
            resolved_at: Some(resolved_at),
            ..pending
        };

        if learn_preference {
            PreferenceRepository::upsert(
                self.pool(),
                user_id,
                &task.organization_id,
                &step.semantic_pattern(),
                decision.as_str(),
                &format_ts(&resolved_at),
            )
            .await?;
            debug!(user_id = %user_id, pattern = %step.semantic_pattern(), "Checkpoint preference learned");
        }

        info!(
            task_id = %task_id,
            step_id = %step_id,
            decision = %decision,
            resolved_by = %user_id,
            "Checkpoint resolved"
        );
        self.events
            .publish(
                task_id,
                EventKind::CheckpointResolved {
                    step_id: step_id.to_string(),
                    checkpoint_id: resolved.id.clone(),
                    decision,
                    resolved_by: user_id.to_string(),
                },
            )
            .await;

        if decision == CheckpointDecision::Approved
            && resolved.placement == CheckpointPlacement::Before
        {
            if let Some(Value::Object(ref fields)) = resolved.response {
                self.store
                    .update(task_id, |task| {
                        if let Some(step) = task.step_mut(step_id) {
                            match step.inputs {
                                Value::Object(ref mut inputs) => inputs.extend(fields.clone()),
                                ref mut other => *other = Value::Object(fields.clone()),
                            }
                        }
                        Ok(())
                    })
                    .await?;
            }
        }

        // the step is failed before the task can resume, so no scheduling
        // pass dispatches past a rejected gate
        if decision == CheckpointDecision::Rejected {
            let message = format!(
                "checkpoint rejected: {}",
                resolved.feedback.as_deref().unwrap_or("no reason given")
            );
            self.fail_rejected_step(task_id, step_id, &message).await?;
        }

        self.resume_if_clear(task_id).await?;

        Ok(resolved)
    }

    /// Route a rejected step through the Observer
    pub async fn fail_rejected_step(&self, task_id: &str, step_id: &str, message: &str) -> Result<()> {
        let task = self.store.load_authoritative(task_id).await?;
        let gated = task
            .step(step_id)
            .map(|s| matches!(s.status, StepStatus::Pending | StepStatus::Completed))
            .unwrap_or(false);
        if task.status.is_terminal() || !gated {
            return Ok(());
        }

        self.events
            .publish(
                task_id,
                EventKind::StepFailed {
                    step_id: step_id.to_string(),
                    error: message.to_string(),
                    class: FailureClass::Rejected,
                },
            )
            .await;
        self.observer
            .handle_failure(task_id, step_id, FailureClass::Rejected, message)
            .await?;
        Ok(())
    }

    /// Back to executing once no checkpoint of the task is pending
    async fn resume_if_clear(&self, task_id: &str) -> Result<()> {
        // an explicitly paused task waits for resume_task
        let task = self.store.load_authoritative(task_id).await?;
        if task.status != TaskStatus::Checkpoint {
            return Ok(());
        }

        let remaining = CheckpointRepository::list_pending_by_task(self.pool(), task_id).await?;
        if !remaining.is_empty() {
            debug!(task_id = %task_id, pending = remaining.len(), "Task still awaiting checkpoints");
            return Ok(());
        }

        self.state
            .transition(task_id, TaskStatus::Executing, TransitionUpdates::default())
            .await?;
        Ok(())
    }

    /// Reject every pending checkpoint past its deadline
    ///
    /// Returns the ids of the affected tasks.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let rows = CheckpointRepository::list_expired(self.pool(), &format_ts(&now)).await?;
        let mut affected = Vec::new();

        for row in rows {
            match self
                .resolve_checkpoint(
                    &row.task_id,
                    &row.step_id,
                    SYSTEM_ACTOR,
                    CheckpointDecision::Rejected.as_str(),
                    Some("expired".to_string()),
                    None,
                    false,
                )
                .await
            {
                Ok(_) => {
                    info!(task_id = %row.task_id, step_id = %row.step_id, "Checkpoint expired");
                    affected.push(row.task_id);
                }
                Err(OrchestratorError::CheckpointValidation(_)) => {
                    debug!(task_id = %row.task_id, step_id = %row.step_id, "Checkpoint resolved concurrently");
                }
                Err(e) => {
                    warn!(task_id = %row.task_id, step_id = %row.step_id, error = %e, "Failed to expire checkpoint");
                }
            }
        }

        affected.sort();
        affected.dedup();
        Ok(affected)
    }

    pub async fn pending_checkpoints(&self, task_id: &str) -> Result<Vec<CheckpointState>> {
        CheckpointRepository::list_pending_by_task(self.pool(), task_id)
            .await?
            .into_iter()
            .map(|row| row.into_state().map_err(OrchestratorError::from))
            .collect()
    }

    /// Every checkpoint of a task, oldest first
    pub async fn list_checkpoints(&self, task_id: &str) -> Result<Vec<CheckpointState>> {
        CheckpointRepository::list_by_task(self.pool(), task_id)
            .await?
            .into_iter()
            .map(|row| row.into_state().map_err(OrchestratorError::from))
            .collect()
    }

    /// Most recent checkpoint of a step
    pub async fn get_checkpoint(&self, task_id: &str, step_id: &str) -> Result<Option<CheckpointState>> {
        CheckpointRepository::find_latest_any(self.pool(), task_id, step_id)
            .await?
            .map(|row| row.into_state().map_err(OrchestratorError::from))
            .transpose()
    }
}
