//! Task repository for database operations

use crate::db::connection::DatabasePool;
use crate::db::models::TaskRow;

/// Task repository for managing task database operations
pub struct TaskRepository;

impl TaskRepository {
    /// Insert a new task row
    pub async fn insert(pool: &DatabasePool, row: &TaskRow) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO tasks (id, organization_id, user_id, parent_task_id, automation_id, goal,
                                constraints, steps, current_step_index, status, version, error,
                                failed_step_id, modifications, created_at, updated_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.organization_id)
        .bind(&row.user_id)
        .bind(&row.parent_task_id)
        .bind(&row.automation_id)
        .bind(&row.goal)
        .bind(&row.constraints)
        .bind(&row.steps)
        .bind(row.current_step_index)
        .bind(&row.status)
        .bind(row.version)
        .bind(&row.error)
        .bind(&row.failed_step_id)
        .bind(&row.modifications)
        .bind(&row.created_at)
        .bind(&row.updated_at)
        .bind(&row.completed_at)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Get a task by ID
    pub async fn get_by_id(pool: &DatabasePool, id: &str) -> Result<Option<TaskRow>, sqlx::Error> {
        sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// List tasks by status, oldest first
    pub async fn list_by_status(
        pool: &DatabasePool,
        status: &str,
    ) -> Result<Vec<TaskRow>, sqlx::Error> {
        sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE status = ? ORDER BY created_at ASC",
        )
        .bind(status)
        .fetch_all(pool)
        .await
    }

    /// List tasks materialized from an automation, newest first
    pub async fn list_by_automation(
        pool: &DatabasePool,
        automation_id: &str,
    ) -> Result<Vec<TaskRow>, sqlx::Error> {
        sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE automation_id = ? ORDER BY created_at DESC",
        )
        .bind(automation_id)
        .fetch_all(pool)
        .await
    }

    /// Compare-and-set write of every mutable column
    ///
    /// Succeeds only when the stored version still equals `expected_version`;
    /// the row's own `version` becomes the new stored version. Returns
    /// `false` when another writer got there first.
    pub async fn update_versioned(
        pool: &DatabasePool,
        row: &TaskRow,
        expected_version: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE tasks
             SET goal = ?, constraints = ?, steps = ?, current_step_index = ?, status = ?,
                 version = ?, error = ?, failed_step_id = ?, modifications = ?,
                 updated_at = ?, completed_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(&row.goal)
        .bind(&row.constraints)
        .bind(&row.steps)
        .bind(row.current_step_index)
        .bind(&row.status)
        .bind(row.version)
        .bind(&row.error)
        .bind(&row.failed_step_id)
        .bind(&row.modifications)
        .bind(&row.updated_at)
        .bind(&row.completed_at)
        .bind(&row.id)
        .bind(expected_version)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Count tasks by status
    pub async fn count_by_status(pool: &DatabasePool, status: &str) -> Result<i64, sqlx::Error> {
        let result: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status = ?")
            .bind(status)
            .fetch_one(pool)
            .await?;
        Ok(result.0)
    }
}
