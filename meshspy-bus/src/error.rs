//! Error types for the bus client.

use thiserror::Error;

/// Result type alias using [`BusError`].
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur while talking to the bus.
#[derive(Error, Debug)]
pub enum BusError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The broker could not be reached or refused the session.
    #[error("Failed to connect to {broker}: {message}")]
    Connect { broker: String, message: String },

    /// The transport rejected a publish.
    #[error("Failed to publish to {topic}: {message}")]
    Publish { topic: String, message: String },

    /// No acknowledgment within the publish timeout.
    #[error("Publish to {topic} timed out after {timeout_ms}ms")]
    PublishTimeout { topic: String, timeout_ms: u64 },

    /// Subscription could not be registered.
    #[error("Failed to subscribe to {topic}: {message}")]
    Subscribe { topic: String, message: String },

    /// Error while closing the session.
    #[error("Disconnect error: {0}")]
    Disconnect(String),

    /// The client has already been disconnected.
    #[error("Bus connection is closed")]
    Closed,
}

impl BusError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connection error.
    pub fn connect(broker: impl Into<String>, msg: impl std::fmt::Display) -> Self {
        Self::Connect {
            broker: broker.into(),
            message: msg.to_string(),
        }
    }

    /// Create a publish error.
    pub fn publish(topic: impl Into<String>, msg: impl std::fmt::Display) -> Self {
        Self::Publish {
            topic: topic.into(),
            message: msg.to_string(),
        }
    }

    /// Create a subscribe error.
    pub fn subscribe(topic: impl Into<String>, msg: impl std::fmt::Display) -> Self {
        Self::Subscribe {
            topic: topic.into(),
            message: msg.to_string(),
        }
    }
}

impl From<url::ParseError> for BusError {
    fn from(err: url::ParseError) -> Self {
        Self::Config(format!("invalid broker address: {}", err))
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}
