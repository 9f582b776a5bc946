use thiserror::Error;

/// Error type for retry sessions
#[derive(Debug, Error)]
pub enum RetryError {
    /// The operation reported a non-retryable failure.
    #[error("Operation failed and can not be retried: {0}")]
    Failed(String),

    /// The configured maximum number of attempts was reached.
    #[error("Maximum number of attempts reached ({0})")]
    MaxAttempts(u32),

    /// The retrier was stopped while the session was waiting or before it
    /// started.
    #[error("Retries stopped")]
    Stopped,
}
