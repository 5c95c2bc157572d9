//! Checkpoint repository for database operations

use crate::db::connection::DatabasePool;
use crate::db::models::CheckpointRow;

/// Checkpoint repository for managing checkpoint database operations
pub struct CheckpointRepository;

impl CheckpointRepository {
    /// Insert a checkpoint
    ///
    /// A second pending checkpoint for the same (task, step) violates the
    /// partial unique index and fails.
    pub async fn insert(pool: &DatabasePool, row: &CheckpointRow) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO checkpoints (id, task_id, step_id, checkpoint_type, placement, description,
                                      preview_data, decision, feedback, response, resolved_by,
                                      created_at, resolved_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.task_id)
        .bind(&row.step_id)
        .bind(&row.checkpoint_type)
        .bind(&row.placement)
        .bind(&row.description)
        .bind(&row.preview_data)
        .bind(&row.decision)
        .bind(&row.feedback)
        .bind(&row.response)
        .bind(&row.resolved_by)
        .bind(&row.created_at)
        .bind(&row.resolved_at)
        .bind(&row.expires_at)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// The unresolved checkpoint for a step, if any
    pub async fn find_pending(
        pool: &DatabasePool,
        task_id: &str,
        step_id: &str,
    ) -> Result<Option<CheckpointRow>, sqlx::Error> {
        sqlx::query_as::<_, CheckpointRow>(
            "SELECT * FROM checkpoints WHERE task_id = ? AND step_id = ? AND decision = 'pending'",
        )
        .bind(task_id)
        .bind(step_id)
        .fetch_optional(pool)
        .await
    }

    /// Most recent checkpoint for a step, at the given placement
    pub async fn find_latest(
        pool: &DatabasePool,
        task_id: &str,
        step_id: &str,
        placement: &str,
    ) -> Result<Option<CheckpointRow>, sqlx::Error> {
        sqlx::query_as::<_, CheckpointRow>(
            "SELECT * FROM checkpoints WHERE task_id = ? AND step_id = ? AND placement = ?
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(task_id)
        .bind(step_id)
        .bind(placement)
        .fetch_optional(pool)
        .await
    }

    /// Most recent checkpoint for a step regardless of placement
    pub async fn find_latest_any(
        pool: &DatabasePool,
        task_id: &str,
        step_id: &str,
    ) -> Result<Option<CheckpointRow>, sqlx::Error> {
        sqlx::query_as::<_, CheckpointRow>(
            "SELECT * FROM checkpoints WHERE task_id = ? AND step_id = ?
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(task_id)
        .bind(step_id)
        .fetch_optional(pool)
        .await
    }

    /// Pending checkpoints of a task, oldest first
    pub async fn list_pending_by_task(
        pool: &DatabasePool,
        task_id: &str,
    ) -> Result<Vec<CheckpointRow>, sqlx::Error> {
        sqlx::query_as::<_, CheckpointRow>(
            "SELECT * FROM checkpoints WHERE task_id = ? AND decision = 'pending'
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(task_id)
        .fetch_all(pool)
        .await
    }

    /// Every checkpoint of a task, oldest first
    pub async fn list_by_task(
        pool: &DatabasePool,
        task_id: &str,
    ) -> Result<Vec<CheckpointRow>, sqlx::Error> {
        sqlx::query_as::<_, CheckpointRow>(
            "SELECT * FROM checkpoints WHERE task_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(task_id)
        .fetch_all(pool)
        .await
    }

    /// Pending checkpoints whose deadline is at or before `now`
    pub async fn list_expired(
        pool: &DatabasePool,
        now: &str,
    ) -> Result<Vec<CheckpointRow>, sqlx::Error> {
        sqlx::query_as::<_, CheckpointRow>(
            "SELECT * FROM checkpoints
             WHERE decision = 'pending' AND expires_at IS NOT NULL AND expires_at <= ?
             ORDER BY expires_at ASC",
        )
        .bind(now)
        .fetch_all(pool)
        .await
    }

    /// Record a decision on a pending checkpoint
    ///
    /// Returns `false` if the checkpoint was already resolved.
    pub async fn resolve(
        pool: &DatabasePool,
        id: &str,
        decision: &str,
        feedback: Option<&str>,
        response: Option<&str>,
        resolved_by: &str,
        resolved_at: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE checkpoints
             SET decision = ?, feedback = ?, response = ?, resolved_by = ?, resolved_at = ?
             WHERE id = ? AND decision = 'pending'",
        )
        .bind(decision)
        .bind(feedback)
        .bind(response)
        .bind(resolved_by)
        .bind(resolved_at)
        .bind(id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
