use std::time::Duration;

use thiserror::Error;

/// Failures talking to the message broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Broker unreachable or the handshake failed.
    #[error("Broker connection failed: {0}")]
    Connect(String),

    /// Channel creation, queue declaration or a channel-level operation failed.
    #[error("Broker channel error: {0}")]
    Channel(String),

    /// The broker refused or never confirmed a publish.
    #[error("Publish failed: {0}")]
    Publish(String),

    /// The connection behind this handle is gone.
    #[error("Broker connection is closed")]
    Closed,

    #[error("Broker unavailable after {attempts} connection attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Broker operation timed out after {0:?}")]
    Timeout(Duration),
}

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        BrokerError::Channel(err.to_string())
    }
}

/// Failures turning a delivered message into a notification.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The payload is not a task-created event.
    #[error("Malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Unexpected event type: {0}")]
    UnexpectedEvent(String),

    #[error("Processing failed: {0}")]
    Failed(String),

    #[error("Processing timed out after {0:?}")]
    TimedOut(Duration),
}

impl ProcessError {
    /// Transient failures are worth another delivery, the rest would only loop.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProcessError::TimedOut(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}
