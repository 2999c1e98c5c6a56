//! Broker error types.

use thiserror::Error;

/// Errors raised by the broker client and its transports.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker channel error: {0}")]
    Channel(String),

    #[error("topology mismatch for {name}: {message}")]
    TopologyMismatch { name: String, message: String },

    #[error("publish to {queue} failed: {message}")]
    Publish { queue: String, message: String },

    #[error("acknowledgement failed: {0}")]
    Acknowledge(String),

    #[error("broker service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl BrokerError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn channel(message: impl Into<String>) -> Self {
        Self::Channel(message.into())
    }

    pub fn topology_mismatch(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TopologyMismatch {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn publish(queue: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            queue: queue.into(),
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable(message.into())
    }

    /// Whether the error means the link itself is gone and a reconnect is
    /// the only remedy.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Channel(_) | Self::TopologyMismatch { .. }
        )
    }
}
