//! Learned checkpoint preference repository

use uuid::Uuid;

use crate::db::connection::DatabasePool;
use crate::db::models::PreferenceRow;

pub struct PreferenceRepository;

impl PreferenceRepository {
    /// Insert or overwrite the decision a user made for a pattern
    pub async fn upsert(
        pool: &DatabasePool,
        user_id: &str,
        organization_id: &str,
        pattern: &str,
        decision: &str,
        now: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO checkpoint_preferences (id, user_id, organization_id, pattern, decision,
                                                 created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (user_id, pattern)
             DO UPDATE SET decision = excluded.decision, updated_at = excluded.updated_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(organization_id)
        .bind(pattern)
        .bind(decision)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn find(
        pool: &DatabasePool,
        user_id: &str,
        pattern: &str,
    ) -> Result<Option<PreferenceRow>, sqlx::Error> {
        sqlx::query_as::<_, PreferenceRow>(
            "SELECT * FROM checkpoint_preferences WHERE user_id = ? AND pattern = ?",
        )
        .bind(user_id)
        .bind(pattern)
        .fetch_optional(pool)
        .await
    }
}
