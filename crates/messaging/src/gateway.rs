use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use microlearn_core::PhoneNumber;

use crate::outbound::OutboundMessage;

/// Result of a successful send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Provider-assigned message id (`wamid...`).
    pub provider_message_id: String,
    /// Recipient id as reported by the provider.
    pub recipient_id: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("provider request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected provider response: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Whether retrying the same request can never succeed.
    ///
    /// Client errors are permanent except request-timeout (408) and
    /// too-many-requests (429).
    pub fn is_permanent(&self) -> bool {
        match self {
            GatewayError::InvalidMessage(_) => true,
            GatewayError::Rejected { status, .. } => {
                (400..500).contains(status) && *status != 408 && *status != 429
            }
            GatewayError::Timeout | GatewayError::Transport(_) | GatewayError::Decode(_) => false,
        }
    }
}

/// Sends messages through the messaging provider.
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    async fn send(
        &self,
        to: &PhoneNumber,
        message: &OutboundMessage,
    ) -> Result<SendReceipt, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(status: u16) -> GatewayError {
        GatewayError::Rejected {
            status,
            message: "x".to_string(),
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        assert!(rejected(400).is_permanent());
        assert!(rejected(404).is_permanent());
        assert!(GatewayError::InvalidMessage("bad".into()).is_permanent());
    }

    #[test]
    fn throttling_and_server_errors_are_transient() {
        assert!(!rejected(408).is_permanent());
        assert!(!rejected(429).is_permanent());
        assert!(!rejected(500).is_permanent());
        assert!(!rejected(503).is_permanent());
        assert!(!GatewayError::Timeout.is_permanent());
        assert!(!GatewayError::Transport("reset".into()).is_permanent());
    }
}
