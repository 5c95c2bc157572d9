//! Task row

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{format_opt_ts, format_ts, parse_opt_ts, parse_ts};
use crate::db::error::{DatabaseError, DbResult};
use crate::model::{Task, TaskStatus};

/// Persisted task; steps, constraints and modifications are JSON text
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskRow {
    pub id: String,
    pub organization_id: String,
    pub user_id: String,
    pub parent_task_id: Option<String>,
    pub automation_id: Option<String>,
    pub goal: String,
    pub constraints: String,
    pub steps: String,
    pub current_step_index: i64,
    pub status: String,
    pub version: i64,
    pub error: Option<String>,
    pub failed_step_id: Option<String>,
    pub modifications: String,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl TaskRow {
    pub fn from_task(task: &Task) -> DbResult<Self> {
        Ok(Self {
            id: task.id.clone(),
            organization_id: task.organization_id.clone(),
            user_id: task.user_id.clone(),
            parent_task_id: task.parent_task_id.clone(),
            automation_id: task.automation_id.clone(),
            goal: task.goal.clone(),
            constraints: serde_json::to_string(&task.constraints)?,
            steps: serde_json::to_string(&task.steps)?,
            current_step_index: task.current_step_index as i64,
            status: task.status.as_str().to_string(),
            version: task.version,
            error: task.error.clone(),
            failed_step_id: task.failed_step_id.clone(),
            modifications: serde_json::to_string(&task.modifications)?,
            created_at: format_ts(&task.created_at),
            updated_at: format_ts(&task.updated_at),
            completed_at: format_opt_ts(&task.completed_at),
        })
    }

    pub fn into_task(self) -> DbResult<Task> {
        let status: TaskStatus = self.status.parse().map_err(DatabaseError::TypeError)?;

        Ok(Task {
            constraints: serde_json::from_str(&self.constraints)?,
            steps: serde_json::from_str(&self.steps)?,
            modifications: serde_json::from_str(&self.modifications)?,
            current_step_index: usize::try_from(self.current_step_index).map_err(|_| {
                DatabaseError::type_error(format!(
                    "negative step index {} on task {}",
                    self.current_step_index, self.id
                ))
            })?,
            status,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            completed_at: parse_opt_ts(&self.completed_at)?,
            id: self.id,
            organization_id: self.organization_id,
            user_id: self.user_id,
            parent_task_id: self.parent_task_id,
            automation_id: self.automation_id,
            goal: self.goal,
            version: self.version,
            error: self.error,
            failed_step_id: self.failed_step_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::now;
    use crate::model::{AgentType, TaskStep};
    use serde_json::json;

    #[test]
    fn test_row_conversion_preserves_task() {
        let mut task = Task::new("org-1", "user-1", "write a report")
            .with_constraint("budget", json!(5))
            .with_steps(vec![
                TaskStep::new("a", "Research", AgentType::Research),
                TaskStep::new("b", "Write", AgentType::Writer).depends_on(["a"]),
            ]);
        let ts = now();
        task.created_at = ts;
        task.updated_at = ts;

        let row = TaskRow::from_task(&task).unwrap();
        assert_eq!(row.status, "pending");
        assert!(row.steps.contains("\"PENDING\""));

        let back = row.into_task().unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_unknown_status_is_type_error() {
        let task = Task::new("org", "user", "goal");
        let mut row = TaskRow::from_task(&task).unwrap();
        row.status = "running".to_string();
        assert!(matches!(row.into_task(), Err(DatabaseError::TypeError(_))));
    }
}
