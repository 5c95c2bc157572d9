//! Automation repository for database operations

use crate::db::connection::DatabasePool;
use crate::db::models::AutomationRow;

/// Automation repository
pub struct AutomationRepository;

impl AutomationRepository {
    /// Insert an automation
    pub async fn insert(pool: &DatabasePool, row: &AutomationRow) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO automations (id, name, task_id, owner_id, organization_id, cron, execute_at,
                                      timezone, enabled, next_run_at, last_run_at, last_task_id,
                                      created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.name)
        .bind(&row.task_id)
        .bind(&row.owner_id)
        .bind(&row.organization_id)
        .bind(&row.cron)
        .bind(&row.execute_at)
        .bind(&row.timezone)
        .bind(row.enabled)
        .bind(&row.next_run_at)
        .bind(&row.last_run_at)
        .bind(&row.last_task_id)
        .bind(&row.created_at)
        .bind(&row.updated_at)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Get an automation by ID
    pub async fn get_by_id(
        pool: &DatabasePool,
        id: &str,
    ) -> Result<Option<AutomationRow>, sqlx::Error> {
        sqlx::query_as::<_, AutomationRow>("SELECT * FROM automations WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// List automations of an organization
    pub async fn list_by_organization(
        pool: &DatabasePool,
        organization_id: &str,
    ) -> Result<Vec<AutomationRow>, sqlx::Error> {
        sqlx::query_as::<_, AutomationRow>(
            "SELECT * FROM automations WHERE organization_id = ? ORDER BY created_at ASC",
        )
        .bind(organization_id)
        .fetch_all(pool)
        .await
    }

    /// Enabled automations whose next run is at or before `now`
    pub async fn list_due(
        pool: &DatabasePool,
        now: &str,
    ) -> Result<Vec<AutomationRow>, sqlx::Error> {
        sqlx::query_as::<_, AutomationRow>(
            "SELECT * FROM automations
             WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?
             ORDER BY next_run_at ASC",
        )
        .bind(now)
        .fetch_all(pool)
        .await
    }

    /// Persist scheduling state after a tick or an enable toggle
    pub async fn update_schedule(
        pool: &DatabasePool,
        row: &AutomationRow,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE automations
             SET enabled = ?, next_run_at = ?, last_run_at = ?, last_task_id = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(row.enabled)
        .bind(&row.next_run_at)
        .bind(&row.last_run_at)
        .bind(&row.last_task_id)
        .bind(&row.updated_at)
        .bind(&row.id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
