// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use std::time::Duration;
use thiserror::Error;

/// Broad category of an RPC failure.
///
/// Callers match on this instead of on individual variants when all they need
/// is "broker problem", "untrustworthy reply" or "callee said no".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection, channel, publish or timeout failure.
    Transport,
    /// The reply could not be trusted structurally.
    Validation,
    /// The callee answered with a non-success status code.
    Remote,
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("RabbitMQ connection error: {0}")]
    Connection(String),

    #[error("RabbitMQ channel error: {0}")]
    Channel(String),

    #[error("RabbitMQ publish error on exchange '{exchange}': {reason}")]
    Publish { exchange: String, reason: String },

    #[error("no response from {service} within {timeout:?}")]
    Timeout { service: String, timeout: Duration },

    #[error("reply consumer closed while waiting for {service}")]
    ConsumerClosed { service: String },

    #[error("Message serialization error: {0}")]
    Encode(#[source] SerdeError),

    #[error("Failed to decode response: {0}")]
    Decode(#[source] SerdeError),

    #[error("{service} rejected the message")]
    DeadLettered { service: String },

    #[error("malformed response from {service}")]
    Malformed { service: String },

    #[error("{service} returned error code: {code}")]
    Remote { service: String, code: String },
}

// Custom Result type for RPC operations
pub type Result<T> = std::result::Result<T, RpcError>;

impl RpcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::Connection(_)
            | RpcError::Channel(_)
            | RpcError::Publish { .. }
            | RpcError::Timeout { .. }
            | RpcError::ConsumerClosed { .. } => ErrorKind::Transport,
            RpcError::Encode(_)
            | RpcError::Decode(_)
            | RpcError::DeadLettered { .. }
            | RpcError::Malformed { .. } => ErrorKind::Validation,
            RpcError::Remote { .. } => ErrorKind::Remote,
        }
    }

    /// Numeric status used by the `"<code>--<message>"` convention.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::Transport => 503,
            ErrorKind::Validation => 502,
            ErrorKind::Remote => 500,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }
}

// Converting from lapin errors
impl From<LapinError> for RpcError {
    fn from(error: LapinError) -> Self {
        // lapin only distinguishes these through its messages
        let error_text = error.to_string();

        if error_text.to_lowercase().contains("channel") {
            RpcError::Channel(error_text)
        } else {
            RpcError::Connection(error_text)
        }
    }
}
