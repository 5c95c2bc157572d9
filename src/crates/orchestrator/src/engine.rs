//! Orchestrator facade
//!
//! Wires the store, state machine, scheduler, checkpoint manager, observer,
//! automation scheduler and event publisher together, and owns the
//! in-process dispatch queue. Every public lifecycle operation lives here.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::automation::{AutomationScheduler, TickOutcome};
use crate::cache::{CacheStore, InMemoryCache};
use crate::checkpoint::CheckpointManager;
use crate::config::OrchestratorConfig;
use crate::db::DatabaseConnection;
use crate::events::{EventKind, EventPublisher, TaskEvent};
use crate::executor::{ExecutorRegistry, PlanGenerator, StepFailure, StepOutcome};
use crate::model::{
    Automation, CheckpointDecision, CheckpointState, NewAutomation, Task, TaskStatus, TaskStep,
};
use crate::observer::Observer;
use crate::scheduler::{validate_plan, StepDispatch, StepScheduler};
use crate::shutdown::ShutdownCoordinator;
use crate::state_machine::{StateMachine, TransitionUpdates};
use crate::store::TaskStore;
use crate::{OrchestratorError, Result};

/// Input for creating a task
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub organization_id: String,
    pub user_id: String,
    pub goal: String,
    pub constraints: Map<String, Value>,
    pub parent_task_id: Option<String>,
    /// Explicit plan; validated on creation
    pub steps: Vec<TaskStep>,
}

impl NewTask {
    pub fn new(
        organization_id: impl Into<String>,
        user_id: impl Into<String>,
        goal: impl Into<String>,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            user_id: user_id.into(),
            goal: goal.into(),
            ..Default::default()
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
}

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Tasks that had a checkpoint expire
    pub expired: Vec<String>,
    pub tasks_scheduled: usize,
    pub dispatched: usize,
    /// Finished tasks whose events were dropped
    pub events_pruned: usize,
    /// Expired cache entries evicted
    pub cache_purged: usize,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    db: DatabaseConnection,
    store: Arc<TaskStore>,
    events: Arc<EventPublisher>,
    state: Arc<StateMachine>,
    observer: Arc<Observer>,
    checkpoints: Arc<CheckpointManager>,
    scheduler: Arc<StepScheduler>,
    automations: AutomationScheduler,
    registry: Arc<ExecutorRegistry>,
    planner: Option<Arc<dyn PlanGenerator>>,
    queue: Mutex<mpsc::UnboundedReceiver<StepDispatch>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        db: DatabaseConnection,
        cache: Arc<dyn CacheStore>,
        registry: ExecutorRegistry,
    ) -> Self {
        let registry = Arc::new(registry);
        let store = Arc::new(TaskStore::new(
            db.clone(),
            cache.clone(),
            config.cache.clone(),
            config.scheduler.max_version_retries,
        ));
        let events = Arc::new(
            EventPublisher::new(cache, config.events.history_size)
                .with_retention(config.events.retention()),
        );
        let state = Arc::new(StateMachine::new(store.clone(), events.clone()));
        let observer = Arc::new(Observer::new(store.clone(), state.clone(), events.clone()));
        let checkpoints = Arc::new(CheckpointManager::new(
            store.clone(),
            state.clone(),
            observer.clone(),
            events.clone(),
            config.checkpoints.default_timeout_secs,
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(StepScheduler::new(
            store.clone(),
            state.clone(),
            checkpoints.clone(),
            observer.clone(),
            events.clone(),
            tx,
        ));
        let automations = AutomationScheduler::new(
            store.clone(),
            state.clone(),
            registry.clone(),
            events.clone(),
            config.cache.lock_ttl(),
        );

        Self {
            config,
            db,
            store,
            events,
            state,
            observer,
            checkpoints,
            scheduler,
            automations,
            registry,
            planner: None,
            queue: Mutex::new(rx),
        }
    }

    /// Connect the durable store from configuration, run migrations, and use
    /// the in-process cache
    pub async fn connect(config: OrchestratorConfig, registry: ExecutorRegistry) -> Result<Self> {
        config.validate()?;
        let db = DatabaseConnection::from_config(&config.database).await?;
        db.run_migrations()
            .await
            .map_err(|e| OrchestratorError::Database(e.into()))?;
        db.health_check().await?;
        info!(url = %config.database.url, "Durable store ready");

        let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCache::new());
        Ok(Self::new(config, db, cache, registry))
    }

    /// Private in-memory database and cache
    pub async fn in_memory(config: OrchestratorConfig, registry: ExecutorRegistry) -> Result<Self> {
        let db = DatabaseConnection::in_memory().await?;
        Ok(Self::new(config, db, Arc::new(InMemoryCache::new()), registry))
    }

    pub fn with_planner(mut self, planner: Arc<dyn PlanGenerator>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn database(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventPublisher> {
        &self.events
    }

    pub fn state_machine(&self) -> &Arc<StateMachine> {
        &self.state
    }

    pub fn observer(&self) -> &Arc<Observer> {
        &self.observer
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    pub fn scheduler(&self) -> &Arc<StepScheduler> {
        &self.scheduler
    }

    pub fn automations(&self) -> &AutomationScheduler {
        &self.automations
    }

    // Task lifecycle

    /// Persist a new `pending` task; explicit steps are validated first
    pub async fn create_task(&self, new: NewTask) -> Result<Task> {
        let mut steps = new.steps;
        if !steps.is_empty() {
            validate_plan(&mut steps, &self.registry)?;
        }

        let mut task = Task::new(new.organization_id, new.user_id, new.goal).with_steps(steps);
        task.constraints = new.constraints;
        task.parent_task_id = new.parent_task_id;

        let task = self.store.create(task).await?;
        self.events
            .publish(
                &task.id,
                EventKind::TaskCreated {
                    goal: task.goal.clone(),
                },
            )
            .await;
        info!(task_id = %task.id, step_count = task.steps.len(), "Task created");
        Ok(task)
    }

    /// Generate a plan with the configured planner; `pending -> planning -> ready`
    ///
    /// Any planner or validation failure fails the task.
    pub async fn plan_task(&self, task_id: &str) -> Result<Task> {
        let planner = self
            .planner
            .clone()
            .ok_or_else(|| OrchestratorError::Planning("no plan generator configured".to_string()))?;

        let task = self
            .state
            .transition(task_id, TaskStatus::Planning, TransitionUpdates::default())
            .await?;
        self.events.publish(task_id, EventKind::PlanningStarted).await;

        let planned = match planner.generate(&task.goal, &task.constraints).await {
            Ok(mut steps) => validate_plan(&mut steps, &self.registry).map(|_| steps),
            Err(e) => Err(e),
        };

        match planned {
            Ok(steps) => {
                let step_count = steps.len();
                let task = self
                    .state
                    .transition_with(task_id, TaskStatus::Ready, TransitionUpdates::default(), |task| {
                        task.steps = steps.clone();
                        task.current_step_index = 0;
                        Ok(())
                    })
                    .await?;
                self.events
                    .publish(task_id, EventKind::PlanningCompleted { step_count })
                    .await;
                info!(task_id = %task_id, step_count = step_count, "Plan generated");
                Ok(task)
            }
            Err(e) => {
                let message = e.to_string();
                warn!(task_id = %task_id, error = %message, "Planning failed");
                self.events
                    .publish(task_id, EventKind::PlanningFailed { error: message.clone() })
                    .await;
                self.state
                    .transition(
                        task_id,
                        TaskStatus::Failed,
                        TransitionUpdates::failure(message.clone(), None),
                    )
                    .await?;
                Err(match e {
                    OrchestratorError::PlanValidation(_) => e,
                    _ => OrchestratorError::Planning(message),
                })
            }
        }
    }

    /// Attach a caller-provided plan; `pending -> ready`
    ///
    /// An empty `steps` keeps the plan given at creation.
    pub async fn submit_plan(&self, task_id: &str, steps: Vec<TaskStep>) -> Result<Task> {
        let mut steps = steps;
        if steps.is_empty() {
            steps = self.store.load_authoritative(task_id).await?.steps;
        }
        validate_plan(&mut steps, &self.registry)?;

        let step_count = steps.len();
        let task = self
            .state
            .transition_with(task_id, TaskStatus::Ready, TransitionUpdates::default(), |task| {
                task.steps = steps.clone();
                task.current_step_index = 0;
                Ok(())
            })
            .await?;
        info!(task_id = %task_id, step_count = step_count, "Plan submitted");
        Ok(task)
    }

    /// `ready -> executing`, then dispatch the first ready steps
    pub async fn start_task(&self, task_id: &str) -> Result<Task> {
        let task = self
            .state
            .transition(task_id, TaskStatus::Executing, TransitionUpdates::default())
            .await?;
        self.events
            .publish(
                task_id,
                EventKind::TaskStarted {
                    step_count: task.steps.len(),
                },
            )
            .await;

        self.scheduler.schedule_ready_nodes(task_id).await?;
        self.store.load_authoritative(task_id).await
    }

    /// Stop dispatching; running steps finish and their results are kept
    pub async fn pause_task(&self, task_id: &str) -> Result<Task> {
        self.state
            .transition(task_id, TaskStatus::Paused, TransitionUpdates::default())
            .await
    }

    /// Leave `paused`; back to `checkpoint` while a checkpoint is still pending
    pub async fn resume_task(&self, task_id: &str) -> Result<Task> {
        let target = if self.checkpoints.pending_checkpoints(task_id).await?.is_empty() {
            TaskStatus::Executing
        } else {
            TaskStatus::Checkpoint
        };

        self.state
            .transition_if(task_id, target, TransitionUpdates::default(), |task| {
                if task.status != TaskStatus::Paused {
                    return Err(OrchestratorError::InvalidTransition {
                        task_id: task.id.clone(),
                        current: task.status,
                        target,
                    });
                }
                Ok(true)
            })
            .await?;

        if target == TaskStatus::Executing {
            self.scheduler.schedule_ready_nodes(task_id).await?;
        }
        self.store.load_authoritative(task_id).await
    }

    /// Request cooperative cancellation
    ///
    /// The marker is honoured at the next scheduling or completion point; a
    /// task with nothing running is cancelled right away.
    pub async fn request_cancel(&self, task_id: &str) -> Result<Task> {
        let task = self.store.load_authoritative(task_id).await?;
        if task.status.is_terminal() {
            return Err(OrchestratorError::InvalidTransition {
                task_id: task.id,
                current: task.status,
                target: TaskStatus::Cancelled,
            });
        }

        self.store.set_cancel_marker(task_id).await?;
        info!(task_id = %task_id, "Cancellation requested");

        if !task.has_running_steps() {
            self.scheduler.cancel_if_requested(task_id).await?;
        }
        self.store.load_authoritative(task_id).await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.store.load_hot(task_id).await
    }

    pub async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.store.list_by_status(status).await
    }

    // Checkpoints

    /// Record a decision, then continue scheduling
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
        let state = self
            .checkpoints
            .resolve_checkpoint(
                task_id,
                step_id,
                user_id,
                decision,
                feedback,
                response,
                learn_preference,
            )
            .await?;
        self.scheduler.schedule_ready_nodes(task_id).await?;
        Ok(state)
    }

    pub async fn approve_checkpoint(
        &self,
        task_id: &str,
        step_id: &str,
        user_id: &str,
        feedback: Option<String>,
    ) -> Result<CheckpointState> {
        self.resolve_checkpoint(
            task_id,
            step_id,
            user_id,
            CheckpointDecision::Approved.as_str(),
            feedback,
            None,
            false,
        )
        .await
    }

    pub async fn reject_checkpoint(
        &self,
        task_id: &str,
        step_id: &str,
        user_id: &str,
        feedback: Option<String>,
    ) -> Result<CheckpointState> {
        self.resolve_checkpoint(
            task_id,
            step_id,
            user_id,
            CheckpointDecision::Rejected.as_str(),
            feedback,
            None,
            false,
        )
        .await
    }

    pub async fn pending_checkpoints(&self, task_id: &str) -> Result<Vec<CheckpointState>> {
        self.checkpoints.pending_checkpoints(task_id).await
    }

    pub async fn get_checkpoint(&self, task_id: &str, step_id: &str) -> Result<Option<CheckpointState>> {
        self.checkpoints.get_checkpoint(task_id, step_id).await
    }

    // Events

    pub fn subscribe(&self, task_id: &str) -> Result<(Vec<TaskEvent>, broadcast::Receiver<String>)> {
        self.events.subscribe(task_id)
    }

    pub fn replay_events(&self, task_id: &str, since: Option<u64>) -> Vec<TaskEvent> {
        self.events.replay(task_id, since)
    }

    // Execution

    /// Apply an executor outcome and schedule what it unblocked
    pub async fn handle_step_result(
        &self,
        task_id: &str,
        step_id: &str,
        outcome: StepOutcome,
    ) -> Result<usize> {
        self.scheduler.handle_step_result(task_id, step_id, outcome).await
    }

    /// Run one dispatch against its executor
    ///
    /// A retried attempt waits out the step backoff first. A missing executor
    /// is an `unavailable` failure and an overrun is a `timeout` failure.
    pub async fn run_dispatch(&self, dispatch: &StepDispatch) -> StepOutcome {
        let executor = self
            .registry
            .resolve(&dispatch.step.id, &dispatch.step.agent_type)
            .map_err(StepFailure::from)?;

        let attempt = dispatch.context.attempt;
        if attempt > 0 {
            let delay = self.config.scheduler.step_retry.backoff_delay(attempt - 1);
            debug!(
                task_id = %dispatch.context.task_id,
                step_id = %dispatch.step.id,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                "Backing off before retry"
            );
            tokio::time::sleep(delay).await;
        }

        let timeout = self.config.scheduler.step_timeout();
        match tokio::time::timeout(timeout, executor.execute(&dispatch.step, &dispatch.context)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(StepFailure::timeout(format!(
                "step timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }

    /// Execute a dispatch and feed its outcome back
    pub async fn execute_dispatch(&self, dispatch: StepDispatch) -> Result<usize> {
        let outcome = self.run_dispatch(&dispatch).await;
        self.handle_step_result(&dispatch.context.task_id, &dispatch.step.id, outcome)
            .await
    }

    /// Execute queued dispatches on the current task until the queue is empty
    ///
    /// Dispatches produced while draining are executed too. Returns how many
    /// ran.
    pub async fn drain_queue(&self) -> Result<usize> {
        let mut executed = 0;
        loop {
            let next = self.queue.lock().await.try_recv().ok();
            let Some(dispatch) = next else {
                return Ok(executed);
            };
            self.execute_dispatch(dispatch).await?;
            executed += 1;
        }
    }

    /// Expire overdue checkpoints, reschedule every active task, and drop
    /// state that finished tasks and expired cache entries left behind
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport {
            expired: self.checkpoints.expire_stale(now).await?,
            ..Default::default()
        };

        for status in [TaskStatus::Executing, TaskStatus::Checkpoint, TaskStatus::Paused] {
            for task in self.store.list_by_status(status).await? {
                match self.scheduler.schedule_ready_nodes(&task.id).await {
                    Ok(dispatched) => {
                        report.tasks_scheduled += 1;
                        report.dispatched += dispatched;
                    }
                    Err(e) => warn!(task_id = %task.id, error = %e, "Sweep failed to schedule task"),
                }
            }
        }

        report.events_pruned = self.events.prune().await;
        match self.store.cache().purge_expired().await {
            Ok(purged) => report.cache_purged = purged,
            Err(e) => warn!(error = %e, "Sweep failed to purge expired cache entries"),
        }

        debug!(
            expired = report.expired.len(),
            tasks = report.tasks_scheduled,
            dispatched = report.dispatched,
            events_pruned = report.events_pruned,
            cache_purged = report.cache_purged,
            "Sweep finished"
        );
        Ok(report)
    }

    /// Re-enqueue steps that were RUNNING when the previous process stopped
    pub async fn recover_running(&self) -> Result<usize> {
        let mut requeued = 0;
        for status in [TaskStatus::Executing, TaskStatus::Checkpoint, TaskStatus::Paused] {
            for task in self.store.list_by_status(status).await? {
                requeued += self.scheduler.requeue_running(&task.id).await?;
            }
        }
        if requeued > 0 {
            info!(requeued = requeued, "Recovered in-flight steps");
        }
        Ok(requeued)
    }

    // Automations

    pub async fn create_automation(&self, new: NewAutomation) -> Result<Automation> {
        self.automations.create(new, Utc::now()).await
    }

    pub async fn get_automation(&self, automation_id: &str) -> Result<Automation> {
        self.automations.get(automation_id).await
    }

    pub async fn list_automations(&self, organization_id: &str) -> Result<Vec<Automation>> {
        self.automations.list(organization_id).await
    }

    pub async fn set_automation_enabled(&self, automation_id: &str, enabled: bool) -> Result<Automation> {
        self.automations
            .set_enabled(automation_id, enabled, Utc::now())
            .await
    }

    /// Fire due automations and start the tasks they materialize
    pub async fn poll_automations(&self, now: DateTime<Utc>) -> Result<Vec<TickOutcome>> {
        let outcomes = self.automations.tick(now).await?;
        for outcome in &outcomes {
            if let TickOutcome::Fired { automation_id, task_id } = outcome {
                if let Err(e) = self.start_task(task_id).await {
                    error!(
                        automation_id = %automation_id,
                        task_id = %task_id,
                        error = %e,
                        "Failed to start automation task"
                    );
                    // a run left in `ready` would hold off every later tick
                    if let Err(e) = self.automations.abandon_run(task_id, &e.to_string()).await {
                        warn!(task_id = %task_id, error = %e, "Failed to abandon automation run");
                    }
                }
            }
        }
        Ok(outcomes)
    }

    // Background loops

    /// Consume the dispatch queue with at most `max_concurrent_steps` steps
    /// in flight; on shutdown, waits for running steps to report
    pub fn spawn_workers(self: &Arc<Self>, shutdown: ShutdownCoordinator) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let limit = this.config.scheduler.max_concurrent_steps.max(1);
            let permits = Arc::new(Semaphore::new(limit));
            let mut queue = this.queue.lock().await;
            info!(max_concurrent_steps = limit, "Step workers started");

            loop {
                let dispatch = tokio::select! {
                    _ = shutdown.wait_for_shutdown() => break,
                    next = queue.recv() => match next {
                        Some(dispatch) => dispatch,
                        None => break,
                    },
                };

                let permit = match permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let worker = Arc::clone(&this);
                tokio::spawn(async move {
                    let _permit = permit;
                    let task_id = dispatch.context.task_id.clone();
                    let step_id = dispatch.step.id.clone();
                    if let Err(e) = worker.execute_dispatch(dispatch).await {
                        error!(task_id = %task_id, step_id = %step_id, error = %e, "Failed to apply step result");
                    }
                });
            }

            // all permits back means every running step has reported
            let _ = permits.acquire_many(limit as u32).await;
            info!("Step workers stopped");
        })
    }

    /// Run `sweep` every `sweep_interval_secs`
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: ShutdownCoordinator) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let period = this.config.scheduler.sweep_interval();
        tokio::spawn(async move {
            let this = &this;
            run_periodic(period, shutdown, move || async move {
                if let Err(e) = this.sweep(Utc::now()).await {
                    error!(error = %e, "Sweep failed");
                }
            })
            .await;
        })
    }

    /// Run `poll_automations` every `poll_interval_secs`
    pub fn spawn_automation_poller(self: &Arc<Self>, shutdown: ShutdownCoordinator) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let period = Duration::from_secs(this.config.automation.poll_interval_secs.max(1));
        tokio::spawn(async move {
            let this = &this;
            run_periodic(period, shutdown, move || async move {
                if let Err(e) = this.poll_automations(Utc::now()).await {
                    error!(error = %e, "Automation poll failed");
                }
            })
            .await;
        })
    }
}

async fn run_periodic<F, Fut>(period: Duration, shutdown: ShutdownCoordinator, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(10)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            _ = interval.tick() => tick().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::EchoExecutor;
    use crate::model::{AgentType, StepStatus};
    use serde_json::json;

    async fn orchestrator() -> Orchestrator {
        let registry = ExecutorRegistry::new()
            .with(AgentType::Research, Arc::new(EchoExecutor))
            .with(AgentType::Writer, Arc::new(EchoExecutor));
        Orchestrator::in_memory(OrchestratorConfig::for_tests(), registry)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit_start_and_drain() {
        let orch = orchestrator().await;
        let task = orch
            .create_task(NewTask::new("org", "user", "summarize the news"))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);

        let steps = vec![
            TaskStep::new("fetch", "Fetch", AgentType::Research).with_inputs(json!({"q": "news"})),
            TaskStep::new("write", "Write", AgentType::Writer)
                .depends_on(["fetch"])
                .with_inputs(json!({"source": "{{fetch.q}}"})),
        ];
        orch.submit_plan(&task.id, steps).await.unwrap();
        orch.start_task(&task.id).await.unwrap();
        assert_eq!(orch.drain_queue().await.unwrap(), 2);

        let done = orch.get_task(&task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.step("write").unwrap().output, Some(json!({"source": "news"})));
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_invalid_plan_rejected_on_submit() {
        let orch = orchestrator().await;
        let task = orch
            .create_task(NewTask::new("org", "user", "goal"))
            .await
            .unwrap();

        let steps = vec![TaskStep::new("a", "A", AgentType::Coder)];
        let err = orch.submit_plan(&task.id, steps).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::PlanValidation(_)));
        assert_eq!(
            orch.get_task(&task.id).await.unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_plan_without_planner_fails_cleanly() {
        let orch = orchestrator().await;
        let task = orch
            .create_task(NewTask::new("org", "user", "goal"))
            .await
            .unwrap();
        let err = orch.plan_task(&task.id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Planning(_)));
        assert_eq!(
            orch.get_task(&task.id).await.unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_cancel_idle_task_is_immediate() {
        let orch = orchestrator().await;
        let task = orch
            .create_task(NewTask::new("org", "user", "goal"))
            .await
            .unwrap();
        let cancelled = orch.request_cancel(&task.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        let err = orch.request_cancel(&task.id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_missing_executor_is_unavailable() {
        let orch = orchestrator().await;
        let dispatch = StepDispatch {
            context: crate::executor::ExecutionContext {
                organization_id: "org".into(),
                user_id: "user".into(),
                task_id: "t".into(),
                step_id: "s".into(),
                attempt: 0,
            },
            step: crate::executor::ResolvedStep {
                id: "s".into(),
                name: "S".into(),
                agent_type: AgentType::Browser,
                inputs: json!({}),
                parallel_group: None,
            },
        };
        let failure = orch.run_dispatch(&dispatch).await.unwrap_err();
        assert_eq!(failure.classify(), crate::model::FailureClass::Unavailable);
    }

    #[tokio::test]
    async fn test_recover_running_requeues_orphans() {
        let orch = orchestrator().await;
        let task = orch
            .create_task(NewTask::new("org", "user", "goal").with_steps(vec![TaskStep::new(
                "only",
                "Only",
                AgentType::Research,
            )]))
            .await
            .unwrap();
        orch.submit_plan(&task.id, Vec::new()).await.unwrap();
        orch.start_task(&task.id).await.unwrap();

        // simulate a restart that lost the in-process queue
        let _lost = orch.queue.lock().await.try_recv().unwrap();
        let stuck = orch.get_task(&task.id).await.unwrap();
        assert_eq!(stuck.step("only").unwrap().status, StepStatus::Running);

        assert_eq!(orch.recover_running().await.unwrap(), 1);
        orch.drain_queue().await.unwrap();
        assert_eq!(
            orch.get_task(&task.id).await.unwrap().status,
            TaskStatus::Completed
        );
    }
}
