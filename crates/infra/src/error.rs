//! Errors surfaced by the pipeline's boundary operations.

use narrate_core::{DomainError, UploadSessionId};

use crate::store::StoreError;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Caller-facing error taxonomy.
///
/// Degraded dispatch is not in here: a job recorded but not yet queued is a
/// success, reported through `DispatchOutcome::degraded`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("upload session not found: {0}")]
    SessionNotFound(UploadSessionId),

    #[error("upload session already completed: {0}")]
    SessionAlreadyCompleted(UploadSessionId),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("retries exhausted ({attempts}/{max})")]
    RetryExhausted { attempts: u32, max: u32 },

    /// A conditional write lost to a concurrent writer; re-read and retry.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Transient store failures persisted past the call-site retry budget.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl PipelineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid_transition(
        entity: &'static str,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl From<DomainError> for PipelineError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) => Self::Validation(msg),
            DomainError::InvalidTransition { entity, from, to } => {
                Self::InvalidTransition { entity, from, to }
            }
            DomainError::RetryExhausted { attempts, max } => Self::RetryExhausted { attempts, max },
            DomainError::NotFound => Self::NotFound {
                entity: "record",
                id: String::new(),
            },
            DomainError::Conflict(msg) => Self::Conflict(msg),
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            StoreError::Duplicate(msg) => Self::Conflict(msg),
            StoreError::Unavailable(msg) => Self::StorageUnavailable(msg),
            StoreError::Storage(msg) => Self::Storage(msg),
        }
    }
}
