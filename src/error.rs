//! Error types for the relay

use thiserror::Error;

use crate::retry::RetryError;

/// Main error type for relay operations
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Payload decode failed: {0}")]
    Decode(String),

    #[error("Retries stopped")]
    Stopped,

    #[error("Maximum number of attempts reached after {0} attempts")]
    MaxAttempts(u32),

    #[error("Shutdown requested")]
    Shutdown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<RetryError> for RelayError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::Stopped => RelayError::Stopped,
            RetryError::MaxAttempts(n) => RelayError::MaxAttempts(n),
            RetryError::Failed(msg) => RelayError::Other(anyhow::anyhow!(msg)),
        }
    }
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Transport-level broker errors
///
/// These are always retriable from the consumer/producer point of view;
/// the owning component decides the retry policy.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Queue declare failed for {queue}: {reason}")]
    DeclareFailed { queue: String, reason: String },

    #[error("Consume failed for {queue}: {reason}")]
    ConsumeFailed { queue: String, reason: String },

    #[error("Publish failed for {routing_key}: {reason}")]
    PublishFailed { routing_key: String, reason: String },

    #[error("Message unroutable: no queue bound for {0}")]
    Unroutable(String),

    #[error("Acknowledgment failed for delivery {delivery_tag}: {reason}")]
    AckFailed { delivery_tag: u64, reason: String },

    #[error("Consumer cancel failed for {0}")]
    CancelFailed(String),
}

/// Store-side errors, one variant per transactional-exec operation
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Ping failed: {0}")]
    Ping(String),

    #[error("Begin transaction failed: {0}")]
    Begin(String),

    #[error("Prepare failed for query {query:?}: {reason}")]
    Prepare { query: String, reason: String },

    #[error("Execute failed: {0}")]
    Exec(String),

    #[error("Commit failed: {0}")]
    Commit(String),

    #[error("Rollback failed: {0}")]
    Rollback(String),
}
