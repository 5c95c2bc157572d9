//! Recurring or one-shot triggers that clone a template task

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A scheduled, no-replanning re-execution of a template task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Automation {
    pub id: String,
    pub name: String,
    /// Template task whose steps are cloned on every run
    pub task_id: String,
    pub owner_id: String,
    pub organization_id: String,
    pub cron: Option<String>,
    pub execute_at: Option<DateTime<Utc>>,
    /// IANA zone the cron expression is evaluated in
    pub timezone: String,
    pub enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Task created by the most recent run
    pub last_task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Automation {
    /// Fires once and disables itself afterwards
    pub fn is_one_shot(&self) -> bool {
        self.cron.is_none()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Input for creating an automation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAutomation {
    pub name: String,
    pub task_id: String,
    pub owner_id: String,
    pub organization_id: String,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub execute_at: Option<DateTime<Utc>>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl NewAutomation {
    /// Recurring automation evaluated in UTC
    pub fn recurring(
        name: impl Into<String>,
        task_id: impl Into<String>,
        owner_id: impl Into<String>,
        organization_id: impl Into<String>,
        cron: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            task_id: task_id.into(),
            owner_id: owner_id.into(),
            organization_id: organization_id.into(),
            cron: Some(cron.into()),
            execute_at: None,
            timezone: default_timezone(),
        }
    }

    /// One-shot automation
    pub fn once(
        name: impl Into<String>,
        task_id: impl Into<String>,
        owner_id: impl Into<String>,
        organization_id: impl Into<String>,
        execute_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            task_id: task_id.into(),
            owner_id: owner_id.into(),
            organization_id: organization_id.into(),
            cron: None,
            execute_at: Some(execute_at),
            timezone: default_timezone(),
        }
    }

    pub fn in_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }
}
