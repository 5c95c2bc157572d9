//! Executor boundary
//!
//! Steps are run by external executors keyed by [`AgentType`]. The core only
//! sees the [`StepExecutor`] trait: it hands over a step with resolved inputs
//! plus an [`ExecutionContext`] built from the persisted task record (never
//! from step inputs), and gets back an output value or a [`StepFailure`].
//!
//! The [`ExecutorRegistry`] is built once at start-up and passed into the
//! orchestrator; there is no global registry.

pub mod retry;

pub use retry::{classify_failure, retry_with_backoff, RetryConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::model::{AgentType, FailureClass, TaskStep};
use crate::{OrchestratorError, Result};

/// Identity under which a step runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub organization_id: String,
    pub user_id: String,
    pub task_id: String,
    pub step_id: String,
    /// 0 for the first run, incremented by every Observer retry
    pub attempt: u32,
}

/// A step ready for an executor: templates already substituted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedStep {
    pub id: String,
    pub name: String,
    pub agent_type: AgentType,
    pub inputs: Value,
    pub parallel_group: Option<String>,
}

/// Raw failure reported by an executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub message: String,
    /// Executor's own classification; inferred from the message when absent
    pub class: Option<FailureClass>,
}

impl StepFailure {
    /// Unclassified failure
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            class: None,
        }
    }

    pub fn with_class(message: impl Into<String>, class: FailureClass) -> Self {
        Self {
            message: message.into(),
            class: Some(class),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::with_class(message, FailureClass::Transient)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::with_class(message, FailureClass::Timeout)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::with_class(message, FailureClass::Unavailable)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::with_class(message, FailureClass::Permanent)
    }

    /// Effective failure class
    pub fn classify(&self) -> FailureClass {
        self.class
            .unwrap_or_else(|| classify_failure(&self.message))
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<OrchestratorError> for StepFailure {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::StepDispatch { .. } => StepFailure::unavailable(err.to_string()),
            other => StepFailure::new(other.to_string()),
        }
    }
}

/// Outcome of one step execution
pub type StepOutcome = std::result::Result<Value, StepFailure>;

/// Runs steps of one or more agent types
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, step: &ResolvedStep, ctx: &ExecutionContext) -> StepOutcome;
}

/// Produces a step graph for a goal; its output is untrusted and validated
#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn generate(&self, goal: &str, constraints: &Map<String, Value>)
        -> Result<Vec<TaskStep>>;
}

/// Returns the resolved inputs unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoExecutor;

#[async_trait]
impl StepExecutor for EchoExecutor {
    async fn execute(&self, step: &ResolvedStep, _ctx: &ExecutionContext) -> StepOutcome {
        Ok(step.inputs.clone())
    }
}

/// Agent type to executor mapping
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<AgentType, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the executor for an agent type
    pub fn register(&mut self, agent_type: AgentType, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(agent_type, executor);
    }

    pub fn with(mut self, agent_type: AgentType, executor: Arc<dyn StepExecutor>) -> Self {
        self.register(agent_type, executor);
        self
    }

    pub fn contains(&self, agent_type: &AgentType) -> bool {
        self.executors.contains_key(agent_type)
    }

    pub fn get(&self, agent_type: &AgentType) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(agent_type).cloned()
    }

    /// Executor for a step, or a dispatch error naming the step
    pub fn resolve(&self, step_id: &str, agent_type: &AgentType) -> Result<Arc<dyn StepExecutor>> {
        self.get(agent_type)
            .ok_or_else(|| OrchestratorError::StepDispatch {
                step_id: step_id.to_string(),
                reason: format!("no executor registered for agent type '{}'", agent_type),
            })
    }

    pub fn agent_types(&self) -> impl Iterator<Item = &AgentType> {
        self.executors.keys()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.executors.keys().map(AgentType::as_str).collect();
        types.sort_unstable();
        f.debug_struct("ExecutorRegistry")
            .field("agent_types", &types)
            .finish()
    }
}
