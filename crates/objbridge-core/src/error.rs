//! Error types for the object bridge

use crate::value::{ErrorEnvelope, ObjectId};
use thiserror::Error;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Bridge error types
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Malformed frame or unknown tag; fatal to the connection
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Id is not (or no longer) registered
    #[error("Unknown reference: {0}")]
    UnknownReference(ObjectId),

    /// Target has no method, field or constructor matching the request
    #[error("No such member: {0}")]
    NoSuchMember(String),

    /// A local call failed
    #[error("Invocation error: {0}")]
    Invocation(ErrorEnvelope),

    /// The peer reported a failure
    #[error("Remote error: {0}")]
    Remote(ErrorEnvelope),

    /// Socket closed or reset while a call was pending
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// A value could not be represented on the other side
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Handshake token was rejected
    #[error("Authentication failed")]
    AuthFailed,

    /// Gateway is shutting down or already stopped
    #[error("Gateway is shut down")]
    Shutdown,

    /// Read deadline elapsed
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Shorthand for a failed call with a custom error class
    pub fn invocation(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        BridgeError::Invocation(ErrorEnvelope::new(class_name, message))
    }

    /// Class name reported in an `ErrorEnvelope`
    pub fn class_name(&self) -> &str {
        match self {
            BridgeError::ProtocolError(_) => "ProtocolError",
            BridgeError::UnknownReference(_) => "UnknownReferenceError",
            BridgeError::NoSuchMember(_) => "NoSuchMemberError",
            BridgeError::Invocation(envelope) | BridgeError::Remote(envelope) => {
                &envelope.error_class_name
            }
            BridgeError::ConnectionLost(_) => "ConnectionLostError",
            BridgeError::SerializationError(_) => "SerializationError",
            BridgeError::AuthFailed => "AuthenticationError",
            BridgeError::Shutdown => "ShutdownError",
            BridgeError::Timeout(_) => "TimeoutError",
            BridgeError::Config(_) => "ConfigError",
        }
    }

    /// Convert into the envelope carried by an `e` frame
    pub fn to_envelope(&self) -> ErrorEnvelope {
        match self {
            BridgeError::Invocation(envelope) | BridgeError::Remote(envelope) => envelope.clone(),
            other => ErrorEnvelope::new(other.class_name(), other.to_string()),
        }
    }

    /// Whether this error ends the connection it happened on
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::ProtocolError(_)
                | BridgeError::ConnectionLost(_)
                | BridgeError::AuthFailed
                | BridgeError::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Config(err.to_string())
    }
}
