//! Failure recovery
//!
//! The Observer runs whenever a step fails, is rejected at a checkpoint, or
//! is blocked by a failed dependency. It diagnoses the failure and picks
//! exactly one action, in priority order:
//!
//! 1. **retry** when the failure is transient and retry budget remains
//! 2. **fallback** when an unused fallback step exists
//! 3. **skip** when the step is not critical
//! 4. **abort** otherwise, failing the whole task
//!
//! Each decision is appended to `Task.modifications` and published as
//! `plan_modified` before it is applied. Marking the step failed and
//! applying the decision happen in one versioned write, so no concurrent
//! scheduling pass ever sees a failed step whose recovery is still pending.
//! When the step changed before that write, the decision is discarded and
//! `plan_modification_dropped` follows.

use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::{EventKind, EventPublisher};
use crate::model::{
    FailureCategory, FailureClass, PlanModification, RecoveryAction, StepStatus, Task, TaskStatus,
    TaskStep,
};
use crate::scheduler::template;
use crate::state_machine::{StateMachine, TransitionUpdates};
use crate::store::TaskStore;
use crate::{OrchestratorError, Result};

/// Outcome of diagnosing one failed step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub action: RecoveryAction,
    pub category: FailureCategory,
    pub reason: String,
    pub fallback_step_id: Option<String>,
}

/// The fallback a step may still switch to
fn usable_fallback<'a>(task: &'a Task, step: &TaskStep, class: FailureClass) -> Option<&'a TaskStep> {
    if class == FailureClass::UpstreamFailed {
        // an activated fallback would inherit the same failed dependency
        return None;
    }
    let fallback = task.step(step.fallback_step_id.as_deref()?)?;
    (fallback.id != step.id && fallback.standby && fallback.status == StepStatus::Pending)
        .then_some(fallback)
}

fn diagnose(step: &TaskStep, class: FailureClass, has_fallback: bool) -> FailureCategory {
    if class.is_retryable() {
        FailureCategory::Transient
    } else if class == FailureClass::Unavailable || (step.is_critical && has_fallback) {
        FailureCategory::HardUnavailable
    } else if !step.is_critical {
        FailureCategory::NonCriticalOmission
    } else {
        FailureCategory::CriticalNoFallback
    }
}

/// Deterministic recovery policy
pub fn decide(task: &Task, step: &TaskStep, class: FailureClass) -> Decision {
    let fallback = usable_fallback(task, step, class);
    let category = diagnose(step, class, fallback.is_some());

    if class.is_retryable() && step.retry_count < step.max_retries {
        return Decision {
            action: RecoveryAction::Retry,
            category,
            reason: format!(
                "{} failure, retry {} of {}",
                class,
                step.retry_count + 1,
                step.max_retries
            ),
            fallback_step_id: None,
        };
    }

    if let Some(fallback) = fallback {
        return Decision {
            action: RecoveryAction::Fallback,
            category,
            reason: format!("{} failure, switching to fallback '{}'", class, fallback.id),
            fallback_step_id: Some(fallback.id.clone()),
        };
    }

    if !step.is_critical {
        return Decision {
            action: RecoveryAction::Skip,
            category,
            reason: format!("{} failure on non-critical step, skipping", class),
            fallback_step_id: None,
        };
    }

    Decision {
        action: RecoveryAction::Abort,
        category,
        reason: format!("{} failure on critical step with no recovery left", class),
        fallback_step_id: None,
    }
}

fn mark_failed(task: &mut Task, step_id: &str, error: &str) {
    if let Some(step) = task.step_mut(step_id) {
        step.status = StepStatus::Failed;
        step.error = Some(error.to_string());
        step.completed_at = Some(Utc::now());
    }
}

/// Substitute `fallback_id` for `original_id` in the live plan
///
/// The fallback inherits the original's dependencies; every dependent of the
/// original, and every template reference to it, is rewritten to the
/// fallback. The original stays FAILED for audit.
pub fn apply_fallback(task: &mut Task, original_id: &str, fallback_id: &str) -> Result<()> {
    let task_id = task.id.clone();
    let missing = |step_id: &str| OrchestratorError::StepNotFound {
        task_id: task_id.clone(),
        step_id: step_id.to_string(),
    };

    let inherited = task
        .step(original_id)
        .ok_or_else(|| missing(original_id))?
        .dependencies
        .clone();

    let fallback = task
        .step_mut(fallback_id)
        .ok_or_else(|| missing(fallback_id))?;
    fallback.standby = false;
    fallback.dependencies.extend(inherited);
    fallback.dependencies.remove(fallback_id);

    let mapping = HashMap::from([(original_id.to_string(), fallback_id.to_string())]);
    for step in task
        .steps
        .iter_mut()
        .filter(|s| s.id != original_id && s.id != fallback_id)
    {
        if step.dependencies.remove(original_id) {
            step.dependencies.insert(fallback_id.to_string());
        }
        if !step.status.is_terminal() {
            step.inputs = template::rewrite_step_ids(&step.inputs, &mapping);
        }
    }

    Ok(())
}

/// The step graph as planned, with every fallback activation undone
///
/// Activations are reverted newest first. Step runtime state is copied as
/// is; callers that re-run the plan reset it.
pub fn planned_steps(task: &Task) -> Vec<TaskStep> {
    let mut steps = task.steps.clone();
    for modification in task
        .modifications
        .iter()
        .rev()
        .filter(|m| m.action == RecoveryAction::Fallback)
    {
        if let Some(ref fallback_id) = modification.fallback_step_id {
            revert_fallback(
                &mut steps,
                &modification.step_id,
                fallback_id,
                &modification.fallback_dependencies,
            );
        }
    }
    steps
}

fn revert_fallback(
    steps: &mut [TaskStep],
    original_id: &str,
    fallback_id: &str,
    fallback_dependencies: &BTreeSet<String>,
) {
    let mapping = HashMap::from([(fallback_id.to_string(), original_id.to_string())]);
    for step in steps.iter_mut() {
        if step.id == fallback_id {
            step.dependencies = fallback_dependencies.clone();
        } else if step.id != original_id {
            if step.dependencies.remove(fallback_id) {
                step.dependencies.insert(original_id.to_string());
            }
            step.inputs = template::rewrite_step_ids(&step.inputs, &mapping);
        }
    }
}

fn apply_decision(task: &mut Task, step_id: &str, decision: &Decision, error: &str) -> Result<()> {
    mark_failed(task, step_id, error);

    match decision.action {
        RecoveryAction::Retry => {
            if let Some(step) = task.step_mut(step_id) {
                step.retry_count += 1;
                step.status = StepStatus::Pending;
                step.output = None;
                step.started_at = None;
                step.completed_at = None;
            }
        }
        RecoveryAction::Fallback => {
            if let Some(ref fallback_id) = decision.fallback_step_id {
                apply_fallback(task, step_id, fallback_id)?;
            }
        }
        RecoveryAction::Skip => {
            if let Some(step) = task.step_mut(step_id) {
                step.status = StepStatus::Skipped;
                step.output = None;
            }
        }
        // the state machine fails the task in the same write
        RecoveryAction::Abort => {}
    }

    Ok(())
}

fn still_observed(task: &Task, step_id: &str, observed: (StepStatus, u32)) -> bool {
    task.step(step_id)
        .map(|s| (s.status, s.retry_count) == observed)
        .unwrap_or(false)
}

pub struct Observer {
    store: Arc<TaskStore>,
    state: Arc<StateMachine>,
    events: Arc<EventPublisher>,
}

impl Observer {
    pub fn new(store: Arc<TaskStore>, state: Arc<StateMachine>, events: Arc<EventPublisher>) -> Self {
        Self {
            store,
            state,
            events,
        }
    }

    /// Diagnose and recover a failed, rejected or blocked step
    ///
    /// Returns the applied modification, or `None` when the task is already
    /// terminal or the step changed underneath the decision.
    pub async fn handle_failure(
        &self,
        task_id: &str,
        step_id: &str,
        class: FailureClass,
        error: &str,
    ) -> Result<Option<PlanModification>> {
        let task = self.store.load_authoritative(task_id).await?;
        self.recover(&task, step_id, class, error).await
    }

    /// Decide against `snapshot` and apply only if the step is unchanged
    async fn recover(
        &self,
        snapshot: &Task,
        step_id: &str,
        class: FailureClass,
        error: &str,
    ) -> Result<Option<PlanModification>> {
        let task_id = snapshot.id.as_str();
        if snapshot.status.is_terminal() {
            debug!(task_id = %task_id, step_id = %step_id, "Task already terminal, no recovery needed");
            return Ok(None);
        }

        let step = snapshot
            .step(step_id)
            .ok_or_else(|| OrchestratorError::StepNotFound {
                task_id: task_id.to_string(),
                step_id: step_id.to_string(),
            })?;
        let observed = (step.status, step.retry_count);
        let decision = decide(snapshot, step, class);
        let step_name = step.name.clone();
        let fallback_dependencies = decision
            .fallback_step_id
            .as_deref()
            .and_then(|fallback_id| snapshot.step(fallback_id))
            .map(|fallback| fallback.dependencies.clone())
            .unwrap_or_default();

        let modification = PlanModification {
            id: Uuid::new_v4().to_string(),
            step_id: step_id.to_string(),
            action: decision.action,
            class,
            category: decision.category,
            reason: decision.reason.clone(),
            error: Some(error.to_string()),
            fallback_step_id: decision.fallback_step_id.clone(),
            fallback_dependencies,
            created_at: Utc::now(),
        };

        self.events
            .publish(
                task_id,
                EventKind::PlanModified {
                    modification: modification.clone(),
                },
            )
            .await;

        let applied = match decision.action {
            RecoveryAction::Abort => {
                error!(
                    task_id = %task_id,
                    step_id = %step_id,
                    class = %class,
                    error = %error,
                    "Aborting task"
                );
                self.state
                    .transition_if(
                        task_id,
                        TaskStatus::Failed,
                        TransitionUpdates::failure(
                            format!("Step '{}' failed: {}", step_name, error),
                            Some(step_id.to_string()),
                        ),
                        |task| {
                            if !still_observed(task, step_id, observed) {
                                return Ok(false);
                            }
                            apply_decision(task, step_id, &decision, error)?;
                            task.modifications.push(modification.clone());
                            task.refresh_progress();
                            Ok(true)
                        },
                    )
                    .await?
                    .is_some()
            }
            action => {
                info!(
                    task_id = %task_id,
                    step_id = %step_id,
                    action = %action,
                    class = %class,
                    reason = %decision.reason,
                    "Applying recovery decision"
                );
                self.store
                    .try_update(task_id, |task| {
                        if task.status.is_terminal() || !still_observed(task, step_id, observed) {
                            return Ok(None);
                        }
                        apply_decision(task, step_id, &decision, error)?;
                        task.modifications.push(modification.clone());
                        task.refresh_progress();
                        Ok(Some(()))
                    })
                    .await?
                    .1
                    .is_some()
            }
        };

        if !applied {
            warn!(
                task_id = %task_id,
                step_id = %step_id,
                action = %decision.action,
                "Step changed before the recovery decision was applied, dropping it"
            );
            self.events
                .publish(
                    task_id,
                    EventKind::PlanModificationDropped {
                        modification_id: modification.id.clone(),
                        step_id: step_id.to_string(),
                        reason: "step changed before the decision was applied".to_string(),
                    },
                )
                .await;
            return Ok(None);
        }

        Ok(Some(modification))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::config::OrchestratorConfig;
    use crate::db::DatabaseConnection;
    use crate::model::AgentType;
    use serde_json::json;

    async fn observer() -> (Arc<TaskStore>, Arc<EventPublisher>, Observer) {
        let config = OrchestratorConfig::for_tests();
        let db = DatabaseConnection::in_memory().await.unwrap();
        let cache = Arc::new(InMemoryCache::new());
        let store = Arc::new(TaskStore::new(db, cache.clone(), config.cache, 4));
        let events = Arc::new(EventPublisher::new(cache, 50));
        let state = Arc::new(StateMachine::new(store.clone(), events.clone()));
        let observer = Observer::new(store.clone(), state, events.clone());
        (store, events, observer)
    }

    fn running(step: TaskStep) -> TaskStep {
        TaskStep {
            status: StepStatus::Running,
            ..step
        }
    }

    fn standby(step: TaskStep) -> TaskStep {
        TaskStep {
            standby: true,
            ..step
        }
    }

    #[test]
    fn test_decision_table() {
        let optional = running(TaskStep::new("a", "A", AgentType::Browser).critical(false));
        let task = Task::new("o", "u", "g").with_steps(vec![optional.clone()]);
        assert_eq!(
            decide(&task, &optional, FailureClass::Permanent).action,
            RecoveryAction::Skip
        );

        let with_fallback = running(TaskStep::new("b", "B", AgentType::Integration).with_fallback("b2"));
        let spare = standby(TaskStep::new("b2", "B2", AgentType::Writer));
        let task = Task::new("o", "u", "g").with_steps(vec![with_fallback.clone(), spare]);
        let decision = decide(&task, &with_fallback, FailureClass::Unavailable);
        assert_eq!(decision.action, RecoveryAction::Fallback);
        assert_eq!(decision.category, FailureCategory::HardUnavailable);
        assert_eq!(decision.fallback_step_id.as_deref(), Some("b2"));

        let retryable = running(TaskStep::new("c", "C", AgentType::Research).with_max_retries(2));
        let task = Task::new("o", "u", "g").with_steps(vec![retryable.clone()]);
        assert_eq!(
            decide(&task, &retryable, FailureClass::Timeout).action,
            RecoveryAction::Retry
        );

        let exhausted = TaskStep {
            retry_count: 2,
            ..retryable
        };
        let task = Task::new("o", "u", "g").with_steps(vec![exhausted.clone()]);
        let decision = decide(&task, &exhausted, FailureClass::Timeout);
        assert_eq!(decision.action, RecoveryAction::Abort);
        assert_eq!(decision.category, FailureCategory::Transient);
    }

    #[test]
    fn test_permanent_failures_are_not_retried() {
        let step = running(TaskStep::new("a", "A", AgentType::Research).with_max_retries(5));
        let task = Task::new("o", "u", "g").with_steps(vec![step.clone()]);
        let decision = decide(&task, &step, FailureClass::Permanent);
        assert_eq!(decision.action, RecoveryAction::Abort);
        assert_eq!(decision.category, FailureCategory::CriticalNoFallback);
    }

    #[test]
    fn test_used_fallback_is_not_reused() {
        let step = running(TaskStep::new("a", "A", AgentType::Research).with_fallback("alt"));
        let used = TaskStep::new("alt", "Alt", AgentType::Research);
        let task = Task::new("o", "u", "g").with_steps(vec![step.clone(), used]);
        assert_eq!(
            decide(&task, &step, FailureClass::Permanent).action,
            RecoveryAction::Abort
        );
    }

    #[test]
    fn test_blocked_step_never_takes_fallback() {
        let step = TaskStep::new("a", "A", AgentType::Research).with_fallback("alt");
        let spare = standby(TaskStep::new("alt", "Alt", AgentType::Research));
        let task = Task::new("o", "u", "g").with_steps(vec![step.clone(), spare]);
        assert_eq!(
            decide(&task, &step, FailureClass::UpstreamFailed).action,
            RecoveryAction::Abort
        );
    }

    #[test]
    fn test_fallback_rewires_dependents() {
        let root = TaskStep::new("root", "Root", AgentType::Research);
        let original = TaskStep::new("crm", "CRM", AgentType::Integration)
            .depends_on(["root"])
            .with_fallback("csv");
        let spare = standby(TaskStep::new("csv", "CSV", AgentType::Coder));
        let dependent = TaskStep::new("report", "Report", AgentType::Writer)
            .depends_on(["crm"])
            .with_inputs(json!({"rows": "{{crm.output}}"}));

        let mut task = Task::new("o", "u", "g").with_steps(vec![root, original, spare, dependent]);
        apply_fallback(&mut task, "crm", "csv").unwrap();

        let csv = task.step("csv").unwrap();
        assert!(!csv.standby);
        assert!(csv.dependencies.contains("root"));

        let report = task.step("report").unwrap();
        assert!(report.dependencies.contains("csv"));
        assert!(!report.dependencies.contains("crm"));
        assert_eq!(report.inputs, json!({"rows": "{{csv.output}}"}));
    }

    #[test]
    fn test_retry_resets_step() {
        let step = running(TaskStep::new("a", "A", AgentType::Research).with_max_retries(1));
        let mut task = Task::new("o", "u", "g").with_steps(vec![step.clone()]);
        let decision = decide(&task, &step, FailureClass::Transient);
        apply_decision(&mut task, "a", &decision, "503").unwrap();

        let step = task.step("a").unwrap();
        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(step.retry_count, 1);
        assert_eq!(step.error.as_deref(), Some("503"));
    }

    #[test]
    fn test_planned_steps_undo_fallback() {
        let root = TaskStep::new("root", "Root", AgentType::Research);
        let original = TaskStep::new("crm", "CRM", AgentType::Integration)
            .depends_on(["root"])
            .with_fallback("csv");
        let spare = standby(TaskStep::new("csv", "CSV", AgentType::Coder));
        let dependent = TaskStep::new("report", "Report", AgentType::Writer)
            .depends_on(["crm"])
            .with_inputs(json!({"rows": "{{crm.output}}"}));
        let mut task = Task::new("o", "u", "g").with_steps(vec![root, original, spare, dependent]);
        let planned = task.steps.clone();

        let decision = decide(&task, task.step("crm").unwrap(), FailureClass::Unavailable);
        apply_decision(&mut task, "crm", &decision, "crm offline").unwrap();
        task.modifications.push(PlanModification {
            id: "m1".into(),
            step_id: "crm".into(),
            action: decision.action,
            class: FailureClass::Unavailable,
            category: decision.category,
            reason: decision.reason.clone(),
            error: None,
            fallback_step_id: decision.fallback_step_id.clone(),
            fallback_dependencies: BTreeSet::new(),
            created_at: Utc::now(),
        });
        assert!(task.step("report").unwrap().dependencies.contains("csv"));

        let restored = planned_steps(&task);
        for (before, after) in planned.iter().zip(&restored) {
            assert_eq!(before.id, after.id);
            assert_eq!(before.dependencies, after.dependencies, "step {}", before.id);
            assert_eq!(before.inputs, after.inputs, "step {}", before.id);
        }
    }

    #[tokio::test]
    async fn test_stale_decision_is_dropped_and_announced() {
        let (store, events, observer) = observer().await;
        let step = running(TaskStep::new("a", "A", AgentType::Research).with_max_retries(2));
        let task = store
            .create(Task::new("o", "u", "g").with_steps(vec![step]))
            .await
            .unwrap();
        let snapshot = task.clone();

        // the step completes before the failure is processed
        store
            .update(&task.id, |t| {
                if let Some(step) = t.step_mut("a") {
                    step.status = StepStatus::Completed;
                }
                Ok(())
            })
            .await
            .unwrap();

        let applied = observer
            .recover(&snapshot, "a", FailureClass::Transient, "503")
            .await
            .unwrap();
        assert!(applied.is_none());

        let names: Vec<&str> = events
            .replay(&task.id, None)
            .iter()
            .map(|e| e.event.name())
            .collect();
        assert_eq!(names, vec!["plan_modified", "plan_modification_dropped"]);

        let stored = store.load_authoritative(&task.id).await.unwrap();
        assert!(stored.modifications.is_empty());
        assert_eq!(stored.step("a").unwrap().status, StepStatus::Completed);
        assert_eq!(stored.step("a").unwrap().retry_count, 0);
    }
}
