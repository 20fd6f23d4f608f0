use thiserror::Error;

use crate::source::State;

/// Error type broker bindings hand back to the adapter.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{field} is required")]
    MissingField { field: &'static str },

    #[error("invalid broker URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unknown or unsupported subscription type {value}")]
    UnsupportedSubscriptionType { value: String },

    #[error("invalid duration for {field}: {value:?}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("failed to load parameters from {origin}: {reason}")]
    LoadFailed { origin: String, reason: String },
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("parse config: {0}")]
    Config(#[from] ConfigError),

    #[error("{operation} is not allowed while the source is {state}")]
    InvalidState {
        operation: &'static str,
        state: State,
    },

    #[error("could not initialize connection to broker")]
    Connection {
        #[source]
        source: BoxError,
    },

    #[error("failed to subscribe to topic {topic}")]
    Subscription {
        topic: String,
        #[source]
        source: BoxError,
    },

    #[error("read cancelled")]
    Cancelled,

    #[error("message stream of the subscription has ended")]
    StreamClosed,

    #[error("failed to receive message")]
    Receive {
        #[source]
        source: BoxError,
    },

    #[error("invalid position")]
    InvalidPosition {
        #[source]
        source: BoxError,
    },

    #[error("failed to acknowledge message")]
    Ack {
        #[source]
        source: BoxError,
    },

    #[error("teardown did not complete cleanly")]
    Teardown {
        #[source]
        source: BoxError,
    },
}

pub type Result<T> = std::result::Result<T, SourceError>;

impl SourceError {
    /// Whether the host may retry the failed operation as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Connection { .. } => true,
            SourceError::Subscription { .. } => true,
            SourceError::Receive { .. } => true,
            SourceError::Ack { .. } => true,
            SourceError::Config(_) => false,
            SourceError::InvalidState { .. } => false,
            SourceError::InvalidPosition { .. } => false,
            SourceError::Cancelled => false,
            SourceError::StreamClosed => false,
            SourceError::Teardown { .. } => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SourceError::Cancelled)
    }
}
