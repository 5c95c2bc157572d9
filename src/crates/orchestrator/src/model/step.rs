//! Step model: one node of a task's execution graph

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use super::checkpoint::{CheckpointPlacement, CheckpointType};

/// Executor family a step is bound to.
///
/// The well-known families are closed variants; anything else is carried as
/// [`AgentType::Custom`] and must still be registered before a plan using it
/// passes validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AgentType {
    /// Information gathering
    Research,
    /// Prose generation
    Writer,
    /// Data analysis
    Analyst,
    /// Web browsing / scraping
    Browser,
    /// Code generation and execution
    Coder,
    /// Third-party integration (email, chat, CRM, ...)
    Integration,
    /// Any other registered executor
    Custom(String),
}

impl AgentType {
    /// Wire name of the agent type
    pub fn as_str(&self) -> &str {
        match self {
            AgentType::Research => "research",
            AgentType::Writer => "writer",
            AgentType::Analyst => "analyst",
            AgentType::Browser => "browser",
            AgentType::Coder => "coder",
            AgentType::Integration => "integration",
            AgentType::Custom(name) => name,
        }
    }

    /// Shorthand for a custom agent type
    pub fn custom(name: impl Into<String>) -> Self {
        AgentType::Custom(name.into())
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "research" => AgentType::Research,
            "writer" => AgentType::Writer,
            "analyst" => AgentType::Analyst,
            "browser" => AgentType::Browser,
            "coder" => AgentType::Coder,
            "integration" => AgentType::Integration,
            other => AgentType::Custom(other.to_string()),
        })
    }
}

impl Serialize for AgentType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AgentType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.parse::<AgentType>() {
            Ok(agent_type) => Ok(agent_type),
            Err(never) => match never {},
        }
    }
}

/// Execution status of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Waiting for dependencies or dispatch
    Pending,
    /// Handed to an executor
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Bypassed; satisfies dependents
    Skipped,
}

impl StepStatus {
    /// Whether the step has reached a final state
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    /// Whether a dependent may treat this step as done
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Running => "RUNNING",
            StepStatus::Completed => "COMPLETED",
            StepStatus::Failed => "FAILED",
            StepStatus::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

/// Marks a step as requiring a human decision before or after it runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub when: CheckpointPlacement,
    #[serde(default)]
    pub checkpoint_type: CheckpointType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub preview_data: Option<Value>,
    /// Overrides the configured default checkpoint lifetime
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl CheckpointConfig {
    /// Approval gate evaluated before the step is dispatched
    pub fn before(description: impl Into<String>) -> Self {
        Self {
            when: CheckpointPlacement::Before,
            checkpoint_type: CheckpointType::Approval,
            description: description.into(),
            preview_data: None,
            timeout_secs: None,
        }
    }

    /// Approval gate evaluated after the step produced its output
    pub fn after(description: impl Into<String>) -> Self {
        Self {
            when: CheckpointPlacement::After,
            ..Self::before(description)
        }
    }

    pub fn with_type(mut self, checkpoint_type: CheckpointType) -> Self {
        self.checkpoint_type = checkpoint_type;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// One node in a task's dependency graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    pub id: String,
    pub name: String,
    pub agent_type: AgentType,
    /// Executor inputs; strings may contain `{{step_id.field}}` references
    #[serde(default)]
    pub inputs: Value,
    /// Ids of steps that must be completed or skipped first
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub parallel_group: Option<String>,
    pub status: StepStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_critical")]
    pub is_critical: bool,
    #[serde(default)]
    pub fallback_step_id: Option<String>,
    #[serde(default)]
    pub checkpoint_config: Option<CheckpointConfig>,
    /// Reserved as another step's fallback; never dispatched until activated
    #[serde(default)]
    pub standby: bool,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_critical() -> bool {
    true
}

impl TaskStep {
    /// Create a pending, critical step with no inputs or dependencies
    pub fn new(id: impl Into<String>, name: impl Into<String>, agent_type: AgentType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            agent_type,
            inputs: Value::Object(Default::default()),
            dependencies: BTreeSet::new(),
            parallel_group: None,
            status: StepStatus::Pending,
            output: None,
            error: None,
            retry_count: 0,
            max_retries: 0,
            is_critical: true,
            fallback_step_id: None,
            checkpoint_config: None,
            standby: false,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn critical(mut self, is_critical: bool) -> Self {
        self.is_critical = is_critical;
        self
    }

    pub fn with_fallback(mut self, step_id: impl Into<String>) -> Self {
        self.fallback_step_id = Some(step_id.into());
        self
    }

    pub fn with_checkpoint(mut self, config: CheckpointConfig) -> Self {
        self.checkpoint_config = Some(config);
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.parallel_group = Some(group.into());
        self
    }

    /// Whether a checkpoint must be resolved before dispatch
    pub fn gated_before(&self) -> bool {
        self.checkpoint_config
            .as_ref()
            .map(|c| c.when == CheckpointPlacement::Before)
            .unwrap_or(false)
    }

    /// Whether a checkpoint must be resolved after completion
    pub fn gated_after(&self) -> bool {
        self.checkpoint_config
            .as_ref()
            .map(|c| c.when == CheckpointPlacement::After)
            .unwrap_or(false)
    }

    /// Retry budget left
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Pattern used to learn checkpoint preferences across similar steps
    ///
    /// Digits and punctuation are dropped so "Send report 3" and
    /// "send-report" share a pattern.
    pub fn semantic_pattern(&self) -> String {
        let normalized: Vec<String> = self
            .name
            .split(|c: char| !c.is_alphabetic())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();
        format!("{}:{}", self.agent_type, normalized.join("_"))
    }
}
