use thiserror::Error;

use crate::types::ActionIntent;

/// Failures a single step can end with.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("element not found: {query}")]
    ElementNotFound { query: String },

    #[error("intent mismatch: no candidate supports '{intent}' (offered: {offered})")]
    IntentMismatch { intent: ActionIntent, offered: String },

    #[error("precondition verification failed: expected location starting with '{expected}', got '{actual}'")]
    PreconditionVerificationFailed { expected: String, actual: String },

    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("no data extracted for table verification")]
    NoDataExtracted,

    #[error("collaborator failure: {0}")]
    Collaborator(String),

    #[error("self-healing exhausted after {attempts} attempts for step '{instruction}': {last}")]
    HealingExhausted {
        attempts: usize,
        instruction: String,
        last: String,
    },

    #[error("malformed table row {row}: needs two populated columns")]
    MalformedTableRow { row: usize },
}

impl StepError {
    /// Wrap a page or LLM error, keeping its context chain.
    pub fn collaborator(err: anyhow::Error) -> Self {
        StepError::Collaborator(format!("{err:#}"))
    }

    /// Setup and assertion failures are final; everything else may heal.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            StepError::PreconditionVerificationFailed { .. } | StepError::VerificationFailed(_)
        )
    }
}

pub type StepOutcome<T> = std::result::Result<T, StepError>;
