//! Step scheduling and result application
//!
//! `schedule_ready_nodes` turns the current step graph into dispatches: it
//! recovers blocked steps, finalizes settled tasks, evaluates checkpoints
//! and claims each ready step with a compare-and-set on its status before
//! pushing it onto the dispatch queue. A step waits on its own before-gate
//! and on the after-gates of its completed dependencies. Claiming twice is a
//! no-op, so concurrent scheduling passes for one task are safe.
//!
//! `handle_step_result` is the single completion handler and the one place
//! the cancellation marker is polled before results are applied.

pub mod graph;
pub mod template;

pub use graph::{
    blocked_steps, compute_ready_steps, group_ready, validate_plan, DispatchGroup,
};

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointManager, GateStatus};
use crate::events::{EventKind, EventPublisher};
use crate::executor::{ExecutionContext, ResolvedStep, StepFailure, StepOutcome};
use crate::model::{CheckpointPlacement, FailureClass, StepStatus, Task, TaskStatus, TaskStep};
use crate::observer::Observer;
use crate::state_machine::{StateMachine, TransitionUpdates};
use crate::store::TaskStore;
use crate::{OrchestratorError, Result};

/// A claimed step on its way to an executor
#[derive(Debug, Clone, PartialEq)]
pub struct StepDispatch {
    pub context: ExecutionContext,
    pub step: ResolvedStep,
}

pub struct StepScheduler {
    store: Arc<TaskStore>,
    state: Arc<StateMachine>,
    checkpoints: Arc<CheckpointManager>,
    observer: Arc<Observer>,
    events: Arc<EventPublisher>,
    queue: mpsc::UnboundedSender<StepDispatch>,
}

impl StepScheduler {
    pub fn new(
        store: Arc<TaskStore>,
        state: Arc<StateMachine>,
        checkpoints: Arc<CheckpointManager>,
        observer: Arc<Observer>,
        events: Arc<EventPublisher>,
        queue: mpsc::UnboundedSender<StepDispatch>,
    ) -> Self {
        Self {
            store,
            state,
            checkpoints,
            observer,
            events,
            queue,
        }
    }

    /// Dispatch every step that can run now; returns how many were dispatched
    pub async fn schedule_ready_nodes(&self, task_id: &str) -> Result<usize> {
        if self.cancel_if_requested(task_id).await? {
            return Ok(0);
        }

        let mut dispatched = 0;
        let mut passes = 0;
        loop {
            let task = self.store.load_authoritative(task_id).await?;
            if task.status != TaskStatus::Executing {
                debug!(task_id = %task_id, status = %task.status, "Task not executing, nothing to schedule");
                return Ok(dispatched);
            }

            // recovery of a blocked step changes the graph, so re-read after it
            let blocked: Vec<(String, String)> = blocked_steps(&task)
                .into_iter()
                .map(|(step, dep)| (step.id.clone(), dep.to_string()))
                .collect();
            if !blocked.is_empty() && passes <= task.steps.len() {
                passes += 1;
                for (step_id, dep) in blocked {
                    warn!(task_id = %task_id, step_id = %step_id, dependency = %dep, "Step blocked by failed dependency");
                    self.observer
                        .handle_failure(
                            task_id,
                            &step_id,
                            FailureClass::UpstreamFailed,
                            &format!("dependency '{}' failed", dep),
                        )
                        .await?;
                }
                continue;
            }

            if task.all_steps_settled() {
                self.finalize(task_id).await?;
                return Ok(dispatched);
            }

            let (count, reopened) = self.dispatch_ready(&task).await?;
            dispatched += count;
            if reopened && passes <= task.steps.len() {
                passes += 1;
                continue;
            }
            return Ok(dispatched);
        }
    }

    /// Returns the dispatch count and whether a gate was settled on the
    /// spot, which calls for another pass
    async fn dispatch_ready(&self, task: &Task) -> Result<(usize, bool)> {
        let ready = compute_ready_steps(task);
        let groups = group_ready(&ready);
        let mut dispatched = 0;
        let mut reopened = false;
        let mut needs_checkpoint = Vec::new();
        let mut after_gates: HashMap<String, GateStatus> = HashMap::new();

        for group in &groups {
            for step_id in &group.step_ids {
                let Some(step) = task.step(step_id) else {
                    continue;
                };

                if self.held_by_after_gate(task, step, &mut after_gates).await? {
                    continue;
                }

                if step.gated_before() {
                    match self.checkpoints.gate_status(&task.id, step_id).await? {
                        GateStatus::Open => {}
                        GateStatus::Waiting => continue,
                        GateStatus::Missing => {
                            needs_checkpoint.push((step.clone(), group.name.clone()));
                            continue;
                        }
                        GateStatus::Rejected => {
                            // decision recorded but the step was never failed
                            self.checkpoints
                                .fail_rejected_step(&task.id, step_id, "checkpoint rejected")
                                .await?;
                            reopened = true;
                            continue;
                        }
                    }
                }

                if self.claim_and_dispatch(&task.id, step_id, group.name.clone()).await? {
                    dispatched += 1;
                }
            }
        }

        reopened |= after_gates.values().any(|s| *s == GateStatus::Rejected);

        // gates go last so independent ready steps are claimed before the task suspends
        for (dep_id, _) in after_gates.iter().filter(|(_, s)| **s == GateStatus::Missing) {
            if let Some(dep) = task.step(dep_id) {
                let outcome = self
                    .checkpoints
                    .create_checkpoint(&task.id, dep, &task.user_id)
                    .await?;
                reopened |= outcome.is_approved();
            }
        }
        for (step, group) in needs_checkpoint {
            let outcome = self
                .checkpoints
                .create_checkpoint(&task.id, &step, &task.user_id)
                .await?;
            if outcome.is_approved() && self.claim_and_dispatch(&task.id, &step.id, group).await? {
                dispatched += 1;
            }
        }

        if dispatched > 0 {
            debug!(task_id = %task.id, dispatched = dispatched, "Dispatched ready steps");
        }
        Ok((dispatched, reopened))
    }

    /// Whether a completed dependency's after-checkpoint still holds `step`
    ///
    /// Gate states are memoized per pass in `gates`. A rejected gate fails
    /// its step; a missing one is created by the caller.
    async fn held_by_after_gate(
        &self,
        task: &Task,
        step: &TaskStep,
        gates: &mut HashMap<String, GateStatus>,
    ) -> Result<bool> {
        let mut held = false;
        for dep in step
            .dependencies
            .iter()
            .filter_map(|id| task.step(id))
            .filter(|d| d.status == StepStatus::Completed && d.gated_after())
        {
            let status = match gates.get(&dep.id) {
                Some(status) => *status,
                None => {
                    let status = self
                        .checkpoints
                        .gate_status_at(&task.id, &dep.id, CheckpointPlacement::After)
                        .await?;
                    if status == GateStatus::Rejected {
                        self.checkpoints
                            .fail_rejected_step(&task.id, &dep.id, "checkpoint rejected")
                            .await?;
                    }
                    gates.insert(dep.id.clone(), status);
                    status
                }
            };
            held |= status != GateStatus::Open;
        }
        if held {
            debug!(task_id = %task.id, step_id = %step.id, "Step held by an unresolved after-checkpoint");
        }
        Ok(held)
    }

    /// Compare-and-set PENDING -> RUNNING, then enqueue
    ///
    /// Returns `false` when another pass claimed the step first or the task
    /// is no longer executing.
    pub async fn claim_and_dispatch(
        &self,
        task_id: &str,
        step_id: &str,
        group: Option<String>,
    ) -> Result<bool> {
        let (task, claimed) = self
            .store
            .try_update(task_id, |task| {
                if task.status != TaskStatus::Executing {
                    return Ok(None);
                }
                let Some(step) = task.step_mut(step_id) else {
                    return Ok(None);
                };
                if step.status != StepStatus::Pending || step.standby {
                    return Ok(None);
                }
                step.status = StepStatus::Running;
                step.started_at = Some(Utc::now());
                step.completed_at = None;
                let attempt = step.retry_count;
                task.refresh_progress();
                Ok(Some(attempt))
            })
            .await?;

        let Some(attempt) = claimed else {
            debug!(task_id = %task_id, step_id = %step_id, "Step already claimed or task suspended");
            return Ok(false);
        };
        let Some(step) = task.step(step_id) else {
            return Ok(false);
        };

        let dispatch = build_dispatch(&task, step, group);
        self.events
            .publish(
                task_id,
                EventKind::StepDispatched {
                    step_id: step.id.clone(),
                    agent_type: step.agent_type.to_string(),
                    parallel_group: dispatch.step.parallel_group.clone(),
                    attempt,
                },
            )
            .await;

        if self.queue.send(dispatch).is_err() {
            error!(task_id = %task_id, step_id = %step_id, "Dispatch queue closed");
            self.apply_step_result(
                task_id,
                step_id,
                Err(StepFailure::unavailable("dispatch queue closed")),
            )
            .await?;
            return Ok(false);
        }

        info!(
            task_id = %task_id,
            step_id = %step_id,
            agent_type = %step.agent_type,
            attempt = attempt,
            "Step dispatched"
        );
        Ok(true)
    }

    /// Re-enqueue steps left RUNNING by a process that stopped before
    /// reporting their results
    pub async fn requeue_running(&self, task_id: &str) -> Result<usize> {
        let task = self.store.load_authoritative(task_id).await?;
        if task.status.is_terminal() {
            return Ok(0);
        }

        let mut requeued = 0;
        for step in task.steps.iter().filter(|s| s.status == StepStatus::Running) {
            if self.queue.send(build_dispatch(&task, step, None)).is_err() {
                warn!(task_id = %task_id, step_id = %step.id, "Dispatch queue closed, cannot requeue");
                break;
            }
            info!(task_id = %task_id, step_id = %step.id, "Requeued orphaned step");
            requeued += 1;
        }
        Ok(requeued)
    }

    /// Apply an executor outcome and schedule whatever it unblocked
    pub async fn handle_step_result(
        &self,
        task_id: &str,
        step_id: &str,
        outcome: StepOutcome,
    ) -> Result<usize> {
        if self.cancel_if_requested(task_id).await? {
            info!(task_id = %task_id, step_id = %step_id, "Task cancelled, discarding step result");
            return Ok(0);
        }

        self.apply_step_result(task_id, step_id, outcome).await?;
        self.schedule_ready_nodes(task_id).await
    }

    async fn apply_step_result(&self, task_id: &str, step_id: &str, outcome: StepOutcome) -> Result<()> {
        match outcome {
            Ok(output) => {
                let (task, applied) = self
                    .store
                    .try_update(task_id, |task| {
                        let Some(step) = task.step_mut(step_id) else {
                            return Ok(None);
                        };
                        if step.status != StepStatus::Running {
                            return Ok(None);
                        }
                        step.status = StepStatus::Completed;
                        step.output = Some(output.clone());
                        step.error = None;
                        step.completed_at = Some(Utc::now());
                        task.refresh_progress();
                        Ok(Some(()))
                    })
                    .await?;

                if applied.is_none() {
                    debug!(task_id = %task_id, step_id = %step_id, "Ignoring result for a step that is not running");
                    return Ok(());
                }

                info!(task_id = %task_id, step_id = %step_id, "Step completed");
                self.events
                    .publish(
                        task_id,
                        EventKind::StepCompleted {
                            step_id: step_id.to_string(),
                            output,
                        },
                    )
                    .await;

                if let Some(step) = task.step(step_id).filter(|s| s.gated_after()) {
                    self.checkpoints
                        .create_checkpoint(task_id, step, &task.user_id)
                        .await?;
                }
            }
            Err(failure) => {
                let task = self.store.load_authoritative(task_id).await?;
                let running = task
                    .step(step_id)
                    .map(|s| s.status == StepStatus::Running)
                    .unwrap_or(false);
                if !running {
                    debug!(task_id = %task_id, step_id = %step_id, "Ignoring failure for a step that is not running");
                    return Ok(());
                }

                let class = failure.classify();
                warn!(
                    task_id = %task_id,
                    step_id = %step_id,
                    class = %class,
                    error = %failure.message,
                    "Step failed"
                );
                self.events
                    .publish(
                        task_id,
                        EventKind::StepFailed {
                            step_id: step_id.to_string(),
                            error: failure.message.clone(),
                            class,
                        },
                    )
                    .await;

                self.observer
                    .handle_failure(task_id, step_id, class, &failure.message)
                    .await?;
            }
        }
        Ok(())
    }

    /// Complete a task whose steps are all settled; unused fallbacks become SKIPPED
    async fn finalize(&self, task_id: &str) -> Result<()> {
        let completed = self
            .state
            .transition_if(
                task_id,
                TaskStatus::Completed,
                TransitionUpdates::default(),
                |task| {
                    if task.status != TaskStatus::Executing || !task.all_steps_settled() {
                        return Ok(false);
                    }
                    let now = Utc::now();
                    for step in task
                        .steps
                        .iter_mut()
                        .filter(|s| s.standby && s.status == StepStatus::Pending)
                    {
                        step.status = StepStatus::Skipped;
                        step.completed_at = Some(now);
                    }
                    task.refresh_progress();
                    Ok(true)
                },
            )
            .await?;

        if completed.is_some() {
            info!(task_id = %task_id, "Task completed");
        }
        Ok(())
    }

    /// Cancel the task if its marker is set; returns whether it was set
    pub async fn cancel_if_requested(&self, task_id: &str) -> Result<bool> {
        if !self.store.is_cancel_requested(task_id).await {
            return Ok(false);
        }

        let task = self.store.load_authoritative(task_id).await?;
        if task.status.is_terminal() {
            return Ok(true);
        }

        match self
            .state
            .transition(task_id, TaskStatus::Cancelled, TransitionUpdates::default())
            .await
        {
            Ok(_) => info!(task_id = %task_id, "Task cancelled"),
            // another handler finished the task first
            Err(OrchestratorError::InvalidTransition { current, .. }) => {
                debug!(task_id = %task_id, status = %current, "Task already terminal when cancelling")
            }
            Err(e) => return Err(e),
        }
        Ok(true)
    }
}

/// Build a dispatch from the persisted task record
///
/// The execution context comes from the task itself, never from step inputs.
fn build_dispatch(task: &Task, step: &TaskStep, group: Option<String>) -> StepDispatch {
    StepDispatch {
        context: ExecutionContext {
            organization_id: task.organization_id.clone(),
            user_id: task.user_id.clone(),
            task_id: task.id.clone(),
            step_id: step.id.clone(),
            attempt: step.retry_count,
        },
        step: ResolvedStep {
            id: step.id.clone(),
            name: step.name.clone(),
            agent_type: step.agent_type.clone(),
            inputs: template::resolve(&step.inputs, task),
            parallel_group: group.or_else(|| step.parallel_group.clone()),
        },
    }
}
