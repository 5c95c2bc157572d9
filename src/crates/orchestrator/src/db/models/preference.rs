//! Learned checkpoint preference row

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A user's remembered decision for steps sharing a semantic pattern
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PreferenceRow {
    pub id: String,
    pub user_id: String,
    pub organization_id: String,
    /// `agent_type:normalised_step_name`
    pub pattern: String,
    /// `approved` or `rejected`
    pub decision: String,
    pub created_at: String,
    pub updated_at: String,
}

impl PreferenceRow {
    pub fn is_approval(&self) -> bool {
        self.decision == "approved"
    }
}
