//! Shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use task_orchestrator::executor::{
    ExecutionContext, ExecutorRegistry, PlanGenerator, ResolvedStep, StepExecutor, StepFailure,
    StepOutcome,
};
use task_orchestrator::model::{AgentType, TaskStep};
use task_orchestrator::{NewTask, Orchestrator, OrchestratorConfig, Task};

/// Echoes inputs unless a failure is scripted for the step
///
/// Records every call as `(step_id, attempt)` and the highest number of
/// executions seen in flight at once.
#[derive(Default)]
pub struct ScriptedExecutor {
    failures: Mutex<HashMap<String, VecDeque<StepFailure>>>,
    outputs: Mutex<HashMap<String, Value>>,
    calls: Mutex<Vec<(String, u32)>>,
    delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next runs of `step_id` with these failures, in order
    pub fn fail(&self, step_id: &str, failures: Vec<StepFailure>) {
        self.failures
            .lock()
            .entry(step_id.to_string())
            .or_default()
            .extend(failures);
    }

    /// Return `output` instead of echoing the inputs
    pub fn respond(&self, step_id: &str, output: Value) {
        self.outputs.lock().insert(step_id.to_string(), output);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> Vec<(String, u32)> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, step_id: &str) -> Vec<u32> {
        self.calls
            .lock()
            .iter()
            .filter(|(id, _)| id == step_id)
            .map(|(_, attempt)| *attempt)
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(&self, step: &ResolvedStep, ctx: &ExecutionContext) -> StepOutcome {
        self.calls.lock().push((step.id.clone(), ctx.attempt));

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self
            .failures
            .lock()
            .get_mut(&step.id)
            .and_then(|queue| queue.pop_front());
        if let Some(failure) = scripted {
            return Err(failure);
        }

        let output = self.outputs.lock().get(&step.id).cloned();
        Ok(output.unwrap_or_else(|| step.inputs.clone()))
    }
}

/// Planner returning a fixed plan, or a fixed error
pub struct FixedPlanner {
    pub steps: Vec<TaskStep>,
}

#[async_trait]
impl PlanGenerator for FixedPlanner {
    async fn generate(
        &self,
        _goal: &str,
        _constraints: &Map<String, Value>,
    ) -> task_orchestrator::Result<Vec<TaskStep>> {
        Ok(self.steps.clone())
    }
}

pub const AGENTS: [AgentType; 4] = [
    AgentType::Research,
    AgentType::Writer,
    AgentType::Analyst,
    AgentType::Integration,
];

pub fn registry(executor: Arc<ScriptedExecutor>) -> ExecutorRegistry {
    AGENTS.into_iter().fold(ExecutorRegistry::new(), |registry, agent| {
        registry.with(agent, executor.clone())
    })
}

pub async fn orchestrator_with_config(
    config: OrchestratorConfig,
) -> (Orchestrator, Arc<ScriptedExecutor>) {
    let executor = ScriptedExecutor::new();
    let orchestrator = Orchestrator::in_memory(config, registry(executor.clone()))
        .await
        .expect("in-memory orchestrator");
    (orchestrator, executor)
}

pub async fn orchestrator() -> (Orchestrator, Arc<ScriptedExecutor>) {
    orchestrator_with_config(OrchestratorConfig::for_tests()).await
}

/// Create, plan and start a task with an explicit plan
pub async fn start(orchestrator: &Orchestrator, steps: Vec<TaskStep>) -> Task {
    let task = orchestrator
        .create_task(NewTask::new("org-1", "user-1", "test goal"))
        .await
        .expect("create task");
    orchestrator
        .submit_plan(&task.id, steps)
        .await
        .expect("submit plan");
    orchestrator.start_task(&task.id).await.expect("start task")
}

/// Names of every event published for a task, oldest first
pub fn event_names(orchestrator: &Orchestrator, task_id: &str) -> Vec<&'static str> {
    orchestrator
        .replay_events(task_id, None)
        .iter()
        .map(|event| event.event.name())
        .collect()
}

pub fn count_events(orchestrator: &Orchestrator, task_id: &str, name: &str) -> usize {
    event_names(orchestrator, task_id)
        .into_iter()
        .filter(|n| *n == name)
        .count()
}
