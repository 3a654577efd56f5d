use thiserror::Error;

pub const GENERIC_SUBMIT_ERROR: &str = "Failed to start generation";
pub const GENERIC_JOB_ERROR: &str = "Generation failed";
pub const TIMEOUT_MESSAGE: &str = "Processing timeout";

/// Error taxonomy for the job lifecycle. Every variant leaves the session in
/// a retriable state; none is fatal to the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Detected before any network call; the request was never issued.
    #[error("{0}")]
    Validation(String),

    /// Non-2xx on job creation. Carries the server-provided message when one
    /// exists. No job was created.
    #[error("{0}")]
    Submission(String),

    /// Network or decode failure on a status/artifact request. Retryable
    /// inside the poll attempt budget.
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend reported terminal FAILED for the job.
    #[error("{0}")]
    JobFailed(String),

    /// Attempt ceiling exhausted without reaching a terminal status. Distinct
    /// from `JobFailed`: the backend job may still be running.
    #[error("Processing timeout")]
    ProcessingTimeout,
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn submission(message: Option<String>) -> Self {
        let message = message
            .map(|message| message.trim().to_string())
            .filter(|message| !message.is_empty())
            .unwrap_or_else(|| GENERIC_SUBMIT_ERROR.to_string());
        Self::Submission(message)
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
