use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsistencyError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {kind} {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("No propagation log exists for gap {gap_id}")]
    RollbackUnavailable { gap_id: uuid::Uuid },

    #[error("Propagation interrupted after {updated} of {attempted} occurrences: {reason}")]
    PropagationInterrupted {
        updated: u32,
        attempted: u32,
        reason: String,
    },

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl ConsistencyError {
    pub fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        ConsistencyError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConsistencyError>;
