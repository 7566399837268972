use async_trait::async_trait;
use uuid::Uuid;

use microlearn_core::{PhoneNumber, ProviderLimits};

use crate::gateway::{GatewayError, MessagingGateway, SendReceipt};
use crate::outbound::OutboundMessage;

/// Development gateway: logs each message and pretends it was sent.
///
/// Used when no provider credentials are configured.
#[derive(Debug, Clone, Default)]
pub struct LoggingGateway {
    limits: ProviderLimits,
}

impl LoggingGateway {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessagingGateway for LoggingGateway {
    async fn send(
        &self,
        to: &PhoneNumber,
        message: &OutboundMessage,
    ) -> Result<SendReceipt, GatewayError> {
        message.validate(&self.limits)?;

        let provider_message_id = format!("wamid.dev.{}", Uuid::now_v7().simple());
        tracing::info!(
            to = %to,
            kind = message.kind(),
            provider_message_id = %provider_message_id,
            message = ?message,
            "sending WhatsApp message (logging gateway)"
        );

        Ok(SendReceipt {
            provider_message_id,
            recipient_id: to.digits().to_string(),
        })
    }
}
