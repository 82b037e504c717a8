use thiserror::Error;

/// Failure of a single external call.
///
/// Only the kind matters to the retry logic; store-level failures (checkpoint
/// or artifact I/O) are plain `anyhow` errors and stop the run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("transient network error: {0}")]
    Transient(String),

    #[error("rate limited by source: {0}")]
    RateLimited(String),

    /// The source says the requested identity does not exist (or never will).
    #[error("source rejected request permanently: {0}")]
    NotFound(String),

    #[error("unexpected response shape: {0}")]
    Schema(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_) | FetchError::RateLimited(_))
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        FetchError::Schema(msg.into())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("stage '{stage}' names unknown implementation '{implementation}'")]
    UnknownStage { stage: String, implementation: String },

    #[error("stage name '{0}' is declared more than once")]
    DuplicateStage(String),

    #[error("stage '{stage}' has invalid params: {reason}")]
    InvalidParams { stage: String, reason: String },
}
