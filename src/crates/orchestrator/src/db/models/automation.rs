//! Automation row

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{format_opt_ts, format_ts, parse_opt_ts, parse_ts};
use crate::db::error::DbResult;
use crate::model::Automation;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AutomationRow {
    pub id: String,
    pub name: String,
    pub task_id: String,
    pub owner_id: String,
    pub organization_id: String,
    pub cron: Option<String>,
    pub execute_at: Option<String>,
    pub timezone: String,
    pub enabled: bool,
    pub next_run_at: Option<String>,
    pub last_run_at: Option<String>,
    pub last_task_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl AutomationRow {
    pub fn from_automation(automation: &Automation) -> Self {
        Self {
            id: automation.id.clone(),
            name: automation.name.clone(),
            task_id: automation.task_id.clone(),
            owner_id: automation.owner_id.clone(),
            organization_id: automation.organization_id.clone(),
            cron: automation.cron.clone(),
            execute_at: format_opt_ts(&automation.execute_at),
            timezone: automation.timezone.clone(),
            enabled: automation.enabled,
            next_run_at: format_opt_ts(&automation.next_run_at),
            last_run_at: format_opt_ts(&automation.last_run_at),
            last_task_id: automation.last_task_id.clone(),
            created_at: format_ts(&automation.created_at),
            updated_at: format_ts(&automation.updated_at),
        }
    }

    pub fn into_automation(self) -> DbResult<Automation> {
        Ok(Automation {
            execute_at: parse_opt_ts(&self.execute_at)?,
            next_run_at: parse_opt_ts(&self.next_run_at)?,
            last_run_at: parse_opt_ts(&self.last_run_at)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            id: self.id,
            name: self.name,
            task_id: self.task_id,
            owner_id: self.owner_id,
            organization_id: self.organization_id,
            cron: self.cron,
            timezone: self.timezone,
            enabled: self.enabled,
            last_task_id: self.last_task_id,
        })
    }
}
