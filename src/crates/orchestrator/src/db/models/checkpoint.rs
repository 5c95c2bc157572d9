//! Checkpoint row

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{format_opt_ts, format_ts, parse_opt_ts, parse_ts};
use crate::db::error::{DatabaseError, DbResult};
use crate::model::CheckpointState;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CheckpointRow {
    pub id: String,
    pub task_id: String,
    pub step_id: String,
    pub checkpoint_type: String,
    pub placement: String,
    pub description: String,
    /// JSON text
    pub preview_data: Option<String>,
    pub decision: String,
    pub feedback: Option<String>,
    /// JSON text
    pub response: Option<String>,
    pub resolved_by: Option<String>,
    pub created_at: String,
    pub resolved_at: Option<String>,
    pub expires_at: Option<String>,
}

impl CheckpointRow {
    pub fn from_state(state: &CheckpointState) -> DbResult<Self> {
        Ok(Self {
            id: state.id.clone(),
            task_id: state.task_id.clone(),
            step_id: state.step_id.clone(),
            checkpoint_type: state.checkpoint_type.as_str().to_string(),
            placement: state.placement.as_str().to_string(),
            description: state.description.clone(),
            preview_data: state
                .preview_data
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            decision: state.decision.as_str().to_string(),
            feedback: state.feedback.clone(),
            response: state.response.as_ref().map(serde_json::to_string).transpose()?,
            resolved_by: state.resolved_by.clone(),
            created_at: format_ts(&state.created_at),
            resolved_at: format_opt_ts(&state.resolved_at),
            expires_at: format_opt_ts(&state.expires_at),
        })
    }

    pub fn into_state(self) -> DbResult<CheckpointState> {
        Ok(CheckpointState {
            checkpoint_type: self
                .checkpoint_type
                .parse()
                .map_err(DatabaseError::TypeError)?,
            placement: self.placement.parse().map_err(DatabaseError::TypeError)?,
            decision: self.decision.parse().map_err(DatabaseError::TypeError)?,
            preview_data: self
                .preview_data
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            response: self.response.as_deref().map(serde_json::from_str).transpose()?,
            created_at: parse_ts(&self.created_at)?,
            resolved_at: parse_opt_ts(&self.resolved_at)?,
            expires_at: parse_opt_ts(&self.expires_at)?,
            id: self.id,
            task_id: self.task_id,
            step_id: self.step_id,
            description: self.description,
            feedback: self.feedback,
            resolved_by: self.resolved_by,
        })
    }
}
