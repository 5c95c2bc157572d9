//! Automation scheduler
//!
//! An automation re-runs a previously validated plan on a cron schedule or
//! once at a fixed instant. Every fire clones the template task's steps under
//! fresh ids into a brand-new task in `ready`; no planner is involved.
//!
//! `tick` is safe to call from several pollers at once: each automation is
//! fired under a short-lived cache lock, and an automation whose previous run
//! has not finished is skipped rather than dispatched twice.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::keys;
use crate::db::models::{format_ts, now, AutomationRow};
use crate::db::repositories::{AutomationRepository, TaskRepository};
use crate::events::{EventKind, EventPublisher};
use crate::executor::ExecutorRegistry;
use crate::model::{Automation, NewAutomation, StepStatus, Task, TaskStatus, TaskStep};
use crate::observer::planned_steps;
use crate::scheduler::{template, validate_plan};
use crate::state_machine::{StateMachine, TransitionUpdates};
use crate::store::TaskStore;
use crate::{OrchestratorError, Result};

/// Parse a cron expression; five-field input gets a leading seconds field
pub fn parse_cron(expr: &str) -> Result<Schedule> {
    let trimmed = expr.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };

    Schedule::from_str(&normalized).map_err(|e| {
        OrchestratorError::AutomationSchedule(format!("invalid cron expression '{}': {}", expr, e))
    })
}

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| OrchestratorError::AutomationSchedule(format!("unknown timezone '{}'", name)))
}

/// First fire strictly after `after`, evaluated in `tz`
pub fn next_fire_time(schedule: &Schedule, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|at| at.with_timezone(&Utc))
}

/// What one tick did for one automation
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// A new task was materialized and must be started
    Fired { automation_id: String, task_id: String },
    /// The previous run is still going
    Skipped {
        automation_id: String,
        running_task_id: String,
    },
    /// Another poller holds the lock, or the automation stopped being due
    NotFired { automation_id: String },
}

pub struct AutomationScheduler {
    store: Arc<TaskStore>,
    state: Arc<StateMachine>,
    registry: Arc<ExecutorRegistry>,
    events: Arc<EventPublisher>,
    lock_ttl: Duration,
}

impl AutomationScheduler {
    pub fn new(
        store: Arc<TaskStore>,
        state: Arc<StateMachine>,
        registry: Arc<ExecutorRegistry>,
        events: Arc<EventPublisher>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            store,
            state,
            registry,
            events,
            lock_ttl,
        }
    }

    /// Validate and persist a new automation
    ///
    /// When both `cron` and `execute_at` are given, `execute_at` is the first
    /// fire and the cron expression drives the rest.
    pub async fn create(&self, new: NewAutomation, now_at: DateTime<Utc>) -> Result<Automation> {
        if new.cron.is_none() && new.execute_at.is_none() {
            return Err(OrchestratorError::AutomationSchedule(
                "either cron or execute_at is required".to_string(),
            ));
        }
        let tz = parse_timezone(&new.timezone)?;
        let cron = match new.cron {
            Some(ref expr) => {
                let schedule = parse_cron(expr)?;
                Some((expr.trim().to_string(), schedule))
            }
            None => None,
        };

        if TaskRepository::get_by_id(self.store.pool(), &new.task_id)
            .await?
            .is_none()
        {
            return Err(OrchestratorError::AutomationSchedule(format!(
                "template task '{}' does not exist",
                new.task_id
            )));
        }

        let next_run_at = match (new.execute_at, &cron) {
            (Some(at), _) => Some(at),
            (None, Some((expr, schedule))) => Some(next_fire_time(schedule, tz, now_at).ok_or_else(
                || {
                    OrchestratorError::AutomationSchedule(format!(
                        "cron expression '{}' has no upcoming fire times",
                        expr
                    ))
                },
            )?),
            (None, None) => None,
        };

        let ts = now();
        let automation = Automation {
            id: Uuid::new_v4().to_string(),
            name: new.name,
            task_id: new.task_id,
            owner_id: new.owner_id,
            organization_id: new.organization_id,
            cron: cron.map(|(expr, _)| expr),
            execute_at: new.execute_at,
            timezone: new.timezone,
            enabled: true,
            next_run_at,
            last_run_at: None,
            last_task_id: None,
            created_at: ts,
            updated_at: ts,
        };

        AutomationRepository::insert(self.store.pool(), &AutomationRow::from_automation(&automation))
            .await?;
        info!(
            automation_id = %automation.id,
            template_task_id = %automation.task_id,
            next_run_at = ?automation.next_run_at,
            "Automation created"
        );

        // round-trip so timestamps carry stored precision
        self.get(&automation.id).await
    }

    pub async fn get(&self, automation_id: &str) -> Result<Automation> {
        let row = AutomationRepository::get_by_id(self.store.pool(), automation_id)
            .await?
            .ok_or_else(|| OrchestratorError::AutomationNotFound(automation_id.to_string()))?;
        Ok(row.into_automation()?)
    }

    pub async fn list(&self, organization_id: &str) -> Result<Vec<Automation>> {
        AutomationRepository::list_by_organization(self.store.pool(), organization_id)
            .await?
            .into_iter()
            .map(|row| row.into_automation().map_err(OrchestratorError::from))
            .collect()
    }

    /// Enable or disable; enabling a recurring automation recomputes its next run
    pub async fn set_enabled(
        &self,
        automation_id: &str,
        enabled: bool,
        now_at: DateTime<Utc>,
    ) -> Result<Automation> {
        let mut automation = self.get(automation_id).await?;
        automation.enabled = enabled;
        if enabled {
            if let Some(ref expr) = automation.cron {
                let schedule = parse_cron(expr)?;
                let tz = parse_timezone(&automation.timezone)?;
                automation.next_run_at = next_fire_time(&schedule, tz, now_at);
            }
        }
        automation.updated_at = now();
        self.save_schedule(&automation).await?;
        info!(automation_id = %automation_id, enabled = enabled, "Automation toggled");
        Ok(automation)
    }

    pub async fn due_automations(&self, now_at: DateTime<Utc>) -> Result<Vec<Automation>> {
        AutomationRepository::list_due(self.store.pool(), &format_ts(&now_at))
            .await?
            .into_iter()
            .map(|row| row.into_automation().map_err(OrchestratorError::from))
            .collect()
    }

    /// Fire every due automation once
    pub async fn tick(&self, now_at: DateTime<Utc>) -> Result<Vec<TickOutcome>> {
        let due = self.due_automations(now_at).await?;
        let mut outcomes = Vec::with_capacity(due.len());

        for automation in due {
            let id = automation.id.clone();
            match self.fire_locked(&id, now_at).await {
                Ok(outcome) => outcomes.push(outcome),
                // one broken automation must not starve the rest
                Err(e) => {
                    warn!(automation_id = %id, error = %e, "Automation tick failed");
                    outcomes.push(TickOutcome::NotFired { automation_id: id });
                }
            }
        }
        Ok(outcomes)
    }

    async fn fire_locked(&self, automation_id: &str, now_at: DateTime<Utc>) -> Result<TickOutcome> {
        let lock_key = keys::automation_lock(automation_id);
        let acquired = match self
            .store
            .cache()
            .set_nx(&lock_key, format_ts(&now_at), self.lock_ttl)
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(automation_id = %automation_id, error = %e, "Automation lock unavailable, skipping tick");
                false
            }
        };
        if !acquired {
            debug!(automation_id = %automation_id, "Automation lock held elsewhere");
            return Ok(TickOutcome::NotFired {
                automation_id: automation_id.to_string(),
            });
        }

        let result = self.fire(automation_id, now_at).await;

        if let Err(e) = self.store.cache().delete(&lock_key).await {
            // the TTL releases it eventually
            debug!(automation_id = %automation_id, error = %e, "Failed to release automation lock");
        }
        result
    }

    async fn fire(&self, automation_id: &str, now_at: DateTime<Utc>) -> Result<TickOutcome> {
        // re-read under the lock: another poller may have just advanced it
        let mut automation = self.get(automation_id).await?;
        if !automation.is_due(now_at) {
            return Ok(TickOutcome::NotFired {
                automation_id: automation_id.to_string(),
            });
        }

        if let Some(running) = self.running_previous(&automation).await? {
            warn!(
                automation_id = %automation_id,
                running_task_id = %running,
                "Previous run still in progress, skipping"
            );
            self.events
                .publish(
                    &running,
                    EventKind::AutomationSkipped {
                        automation_id: automation_id.to_string(),
                        running_task_id: running.clone(),
                    },
                )
                .await;

            // a one-shot stays due until its run can actually start
            if !automation.is_one_shot() {
                automation.next_run_at = self.next_after(&automation, now_at)?;
                automation.updated_at = now();
                self.save_schedule(&automation).await?;
            }
            return Ok(TickOutcome::Skipped {
                automation_id: automation_id.to_string(),
                running_task_id: running,
            });
        }

        let task = self.materialize(&automation).await?;
        self.events
            .publish(
                &task.id,
                EventKind::AutomationTriggered {
                    automation_id: automation_id.to_string(),
                    template_task_id: automation.task_id.clone(),
                },
            )
            .await;

        automation.last_run_at = Some(now_at);
        automation.last_task_id = Some(task.id.clone());
        if automation.is_one_shot() {
            automation.enabled = false;
            automation.next_run_at = None;
        } else {
            automation.next_run_at = self.next_after(&automation, now_at)?;
        }
        automation.updated_at = now();
        self.save_schedule(&automation).await?;

        info!(
            automation_id = %automation_id,
            task_id = %task.id,
            next_run_at = ?automation.next_run_at,
            "Automation fired"
        );
        Ok(TickOutcome::Fired {
            automation_id: automation_id.to_string(),
            task_id: task.id,
        })
    }

    /// Clone the template's steps into a new `ready` task
    ///
    /// Runs start from the plan as written, so fallbacks the template
    /// activated go back on standby.
    pub async fn materialize(&self, automation: &Automation) -> Result<Task> {
        let template_task = self.store.load_authoritative(&automation.task_id).await?;
        let mut steps = clone_steps(&planned_steps(&template_task));
        validate_plan(&mut steps, &self.registry)?;

        let mut task = Task::new(
            automation.organization_id.clone(),
            automation.owner_id.clone(),
            template_task.goal.clone(),
        )
        .with_steps(steps);
        task.constraints = template_task.constraints.clone();
        task.parent_task_id = Some(template_task.id.clone());
        task.automation_id = Some(automation.id.clone());
        task.status = TaskStatus::Ready;

        let task = self.store.create(task).await?;
        debug!(
            automation_id = %automation.id,
            task_id = %task.id,
            step_count = task.steps.len(),
            "Template materialized"
        );
        Ok(task)
    }

    async fn running_previous(&self, automation: &Automation) -> Result<Option<String>> {
        let Some(ref last) = automation.last_task_id else {
            return Ok(None);
        };
        match self.store.load_authoritative(last).await {
            Ok(task) if task.status == TaskStatus::Ready => {
                // materialized but never started
                self.abandon_run(&task.id, "superseded by a later tick").await?;
                Ok(None)
            }
            Ok(task) if !task.status.is_terminal() => Ok(Some(task.id)),
            Ok(_) => Ok(None),
            Err(OrchestratorError::TaskNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fail a materialized run that never started
    ///
    /// Returns `false` when the run already left `ready`.
    pub async fn abandon_run(&self, task_id: &str, reason: &str) -> Result<bool> {
        let abandoned = self
            .state
            .transition_if(
                task_id,
                TaskStatus::Failed,
                TransitionUpdates::failure(format!("Automation run never started: {}", reason), None),
                |task| Ok(task.status == TaskStatus::Ready),
            )
            .await?
            .is_some();
        if abandoned {
            warn!(task_id = %task_id, reason = %reason, "Abandoned automation run");
        }
        Ok(abandoned)
    }

    fn next_after(&self, automation: &Automation, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let Some(ref expr) = automation.cron else {
            return Ok(None);
        };
        let schedule = parse_cron(expr)?;
        let tz = parse_timezone(&automation.timezone)?;
        Ok(next_fire_time(&schedule, tz, after))
    }

    async fn save_schedule(&self, automation: &Automation) -> Result<()> {
        let updated = AutomationRepository::update_schedule(
            self.store.pool(),
            &AutomationRow::from_automation(automation),
        )
        .await?;
        if !updated {
            return Err(OrchestratorError::AutomationNotFound(automation.id.clone()));
        }
        Ok(())
    }
}

/// Deep-clone steps under fresh ids with execution state reset
///
/// Dependencies, fallback links and `{{step.field}}` references are
/// rewritten to the new ids.
pub fn clone_steps(steps: &[TaskStep]) -> Vec<TaskStep> {
    let mapping: HashMap<String, String> = steps
        .iter()
        .map(|s| (s.id.clone(), Uuid::new_v4().to_string()))
        .collect();
    let remap = |id: &String| mapping.get(id).cloned().unwrap_or_else(|| id.clone());

    steps
        .iter()
        .map(|step| {
            let mut cloned = step.clone();
            cloned.id = remap(&step.id);
            cloned.dependencies = step.dependencies.iter().map(remap).collect();
            cloned.fallback_step_id = step.fallback_step_id.as_ref().map(remap);
            cloned.inputs = template::rewrite_step_ids(&step.inputs, &mapping);
            cloned.status = StepStatus::Pending;
            cloned.output = None;
            cloned.error = None;
            cloned.retry_count = 0;
            cloned.standby = false;
            cloned.started_at = None;
            cloned.completed_at = None;
            cloned
        })
        .collect()
}
