//! In-memory gateway for tests.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use microlearn_core::{PhoneNumber, ProviderLimits};

use crate::gateway::{GatewayError, MessagingGateway, SendReceipt};
use crate::outbound::OutboundMessage;

/// A message captured by [`RecordingGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub to: PhoneNumber,
    pub message: OutboundMessage,
    pub provider_message_id: String,
}

/// Records every send and returns synthetic `wamid.*` ids.
///
/// Failures can be scripted with [`RecordingGateway::fail_next`]; each scripted
/// error is returned once, in order, before sends start succeeding again.
#[derive(Debug, Clone, Default)]
pub struct RecordingGateway {
    sent: Arc<Mutex<Vec<SentMessage>>>,
    failures: Arc<Mutex<VecDeque<GatewayError>>>,
    limits: ProviderLimits,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_next(&self, error: GatewayError) {
        self.failures.lock().await.push_back(error);
    }

    pub async fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_to(&self, to: &PhoneNumber) -> Vec<SentMessage> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|m| &m.to == to)
            .cloned()
            .collect()
    }

    pub async fn clear(&self) {
        self.sent.lock().await.clear();
    }
}

#[async_trait]
impl MessagingGateway for RecordingGateway {
    async fn send(
        &self,
        to: &PhoneNumber,
        message: &OutboundMessage,
    ) -> Result<SendReceipt, GatewayError> {
        if let Some(error) = self.failures.lock().await.pop_front() {
            return Err(error);
        }
        message.validate(&self.limits)?;

        let provider_message_id = format!("wamid.{}", Uuid::now_v7().simple());
        self.sent.lock().await.push(SentMessage {
            to: to.clone(),
            message: message.clone(),
            provider_message_id: provider_message_id.clone(),
        });

        Ok(SendReceipt {
            provider_message_id,
            recipient_id: to.digits().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_sends_and_replays_scripted_failures() {
        let gateway = RecordingGateway::new();
        let to = PhoneNumber::parse("+15550001111").unwrap();

        gateway.fail_next(GatewayError::Timeout).await;
        let first = gateway.send(&to, &OutboundMessage::text("hi")).await;
        assert_eq!(first, Err(GatewayError::Timeout));

        let receipt = gateway
            .send(&to, &OutboundMessage::text("hi"))
            .await
            .unwrap();
        assert!(receipt.provider_message_id.starts_with("wamid."));
        assert_eq!(receipt.recipient_id, "15550001111");

        let sent = gateway.sent_to(&to).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].provider_message_id, receipt.provider_message_id);
    }
}
