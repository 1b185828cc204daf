use std::collections::BTreeSet;

use ulid::Ulid;

use crate::model::ConflictTag;

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// Malformed or incomplete request. Nothing is persisted.
    #[error("{0}")]
    Validation(String),

    /// Hard scheduling collision with an existing entry.
    #[error("{message}")]
    Conflict {
        message: String,
        tags: BTreeSet<ConflictTag>,
        conflicting_entry_id: Ulid,
    },

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Ulid },

    #[error("storage error: {0}")]
    Storage(String),
}

impl ScheduleError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ScheduleError::Validation(msg.into())
    }

    pub fn limit(msg: impl Into<String>) -> Self {
        ScheduleError::LimitExceeded(msg.into())
    }

    pub fn not_found(kind: &'static str, id: Ulid) -> Self {
        ScheduleError::NotFound { kind, id }
    }

    /// Short label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            ScheduleError::Validation(_) => "validation",
            ScheduleError::Conflict { .. } => "conflict",
            ScheduleError::LimitExceeded(_) => "limit_exceeded",
            ScheduleError::NotFound { .. } => "not_found",
            ScheduleError::Storage(_) => "storage",
        }
    }
}
