//! Error types for bus bridge operations

use pinlink_core::LinkError;
use thiserror::Error;

/// Main error type for bus bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    // ===== Device Errors =====
    /// A link command failed
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    // ===== Configuration Errors =====
    /// A topic pattern does not compile or lacks its pin capture group
    #[error("Invalid topic pattern {pattern:?}: {reason}")]
    InvalidPattern {
        /// The offending pattern
        pattern: String,
        /// Why it was rejected
        reason: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== Bus Errors =====
    /// The bus refused a publication
    #[error("Publish to {topic} failed: {reason}")]
    PublishFailed {
        /// Target topic
        topic: String,
        /// Failure reason from the bus
        reason: String,
    },

    /// MQTT client error
    #[error("MQTT error: {0}")]
    Mqtt(String),

    // ===== Service Errors =====
    /// Bridge not running
    #[error("Bridge is not running")]
    NotRunning,

    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,
}

impl BridgeError {
    /// Check if this error is recoverable/retriable
    pub fn is_retriable(&self) -> bool {
        match self {
            BridgeError::Link(e) => e.is_retriable(),
            BridgeError::PublishFailed { .. } | BridgeError::Mqtt(_) => true,
            _ => false,
        }
    }

    /// Get an error code for logging/metrics
    pub fn error_code(&self) -> &'static str {
        match self {
            BridgeError::Link(e) => e.error_code(),
            BridgeError::InvalidPattern { .. } => "INVALID_PATTERN",
            BridgeError::InvalidConfig(_) => "INVALID_CONFIG",
            BridgeError::PublishFailed { .. } => "PUBLISH_FAILED",
            BridgeError::Mqtt(_) => "MQTT_ERROR",
            BridgeError::NotRunning => "BRIDGE_NOT_RUNNING",
            BridgeError::ChannelClosed => "CHANNEL_CLOSED",
        }
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(feature = "mqtt")]
impl From<rumqttc::ClientError> for BridgeError {
    fn from(err: rumqttc::ClientError) -> Self {
        BridgeError::Mqtt(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = BridgeError::InvalidPattern {
            pattern: "((".to_string(),
            reason: "unclosed group".to_string(),
        };
        assert_eq!(err.error_code(), "INVALID_PATTERN");
        assert_eq!(BridgeError::from(LinkError::Closed).error_code(), "LINK_CLOSED");
    }

    #[test]
    fn test_is_retriable() {
        assert!(BridgeError::Link(LinkError::Disconnected).is_retriable());
        assert!(!BridgeError::Link(LinkError::Closed).is_retriable());
        assert!(!BridgeError::InvalidConfig("x".to_string()).is_retriable());
    }
}
