use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use microlearn_core::{CourseId, LessonId, PhoneNumber, ProviderLimits, QuizId};
use microlearn_messaging::{GatewayError, MessagingGateway, OutboundMessage, SendReceipt};

use crate::jobs::JobError;
use crate::message_log::{MessageLog, MessageLogEntry};
use crate::reply_context::ReplyContextService;

/// What an outbound message is about, for the audit trail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Origin {
    pub course_id: Option<CourseId>,
    pub lesson_id: Option<LessonId>,
}

impl Origin {
    pub fn course(course_id: CourseId) -> Self {
        Self {
            course_id: Some(course_id),
            lesson_id: None,
        }
    }

    pub fn lesson(course_id: CourseId, lesson_id: LessonId) -> Self {
        Self {
            course_id: Some(course_id),
            lesson_id: Some(lesson_id),
        }
    }
}

/// Sends through the gateway and records what was sent.
///
/// Gateway failures become [`JobError`]s: permanent provider rejections
/// dead-letter the job, everything else is retried.
pub struct Outbox {
    gateway: Arc<dyn MessagingGateway>,
    log: Arc<dyn MessageLog>,
    contexts: ReplyContextService,
    limits: ProviderLimits,
    send_timeout: Duration,
    message_delay: Duration,
}

impl Outbox {
    pub fn new(
        gateway: Arc<dyn MessagingGateway>,
        log: Arc<dyn MessageLog>,
        contexts: ReplyContextService,
        send_timeout: Duration,
        message_delay: Duration,
    ) -> Self {
        Self {
            gateway,
            log,
            contexts,
            limits: ProviderLimits::default(),
            send_timeout,
            message_delay,
        }
    }

    pub fn limits(&self) -> &ProviderLimits {
        &self.limits
    }

    pub async fn send(
        &self,
        to: &PhoneNumber,
        message: &OutboundMessage,
        origin: Origin,
    ) -> Result<SendReceipt, JobError> {
        let receipt = match tokio::time::timeout(self.send_timeout, self.gateway.send(to, message)).await {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(e)) => return Err(classify(e)),
            Err(_) => return Err(classify(GatewayError::Timeout)),
        };

        debug!(
            to = %to,
            kind = message.kind(),
            provider_message_id = %receipt.provider_message_id,
            "message sent"
        );

        let entry = MessageLogEntry::outbound(
            receipt.provider_message_id.clone(),
            to.clone(),
            message.kind(),
            origin.course_id,
            origin.lesson_id,
            Utc::now(),
        );
        // The message is out; a lost audit row must not trigger a resend.
        if let Err(e) = self.log.record_outbound(&entry).await {
            warn!(provider_message_id = %receipt.provider_message_id, error = %e, "failed to log outbound message");
        }

        Ok(receipt)
    }

    /// Write the reply context for a sent message.
    pub async fn remember(
        &self,
        to: &PhoneNumber,
        receipt: &SendReceipt,
        course_id: CourseId,
        lesson_id: Option<LessonId>,
        quiz_id: Option<QuizId>,
    ) -> Result<(), JobError> {
        self.contexts
            .record(to, &receipt.provider_message_id, course_id, lesson_id, quiz_id, Utc::now())
            .await
            .map(|_| ())
            .map_err(|e| JobError::transient(format!("failed to store reply context: {e}")))
    }

    /// Pause between the messages of one sequence so they arrive in order.
    pub async fn pace(&self) {
        if !self.message_delay.is_zero() {
            tokio::time::sleep(self.message_delay).await;
        }
    }
}

fn classify(error: GatewayError) -> JobError {
    if error.is_permanent() {
        JobError::permanent(error.to_string())
    } else {
        JobError::transient(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_log::InMemoryMessageLog;
    use crate::reply_context::{DEFAULT_CONTEXT_TTL, InMemoryReplyContextStore};
    use microlearn_messaging::RecordingGateway;

    fn outbox(gateway: Arc<RecordingGateway>, log: Arc<InMemoryMessageLog>) -> Outbox {
        let contexts = ReplyContextService::new(
            Arc::new(InMemoryReplyContextStore::new()),
            DEFAULT_CONTEXT_TTL,
        );
        Outbox::new(gateway, log, contexts, Duration::from_secs(5), Duration::ZERO)
    }

    #[tokio::test]
    async fn successful_send_is_logged() {
        let gateway = Arc::new(RecordingGateway::new());
        let log = Arc::new(InMemoryMessageLog::new());
        let outbox = outbox(gateway.clone(), log.clone());
        let to = PhoneNumber::parse("+15550001").unwrap();

        let receipt = outbox
            .send(&to, &OutboundMessage::text("hello"), Origin::default())
            .await
            .unwrap();

        let entry = log.get(&receipt.provider_message_id).await.unwrap().unwrap();
        assert_eq!(entry.kind, "text");
        assert_eq!(entry.phone, to);
        assert_eq!(gateway.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn provider_errors_are_classified() {
        let gateway = Arc::new(RecordingGateway::new());
        let log = Arc::new(InMemoryMessageLog::new());
        let outbox = outbox(gateway.clone(), log.clone());
        let to = PhoneNumber::parse("+15550001").unwrap();

        gateway
            .fail_next(GatewayError::Rejected {
                status: 400,
                message: "invalid recipient".to_string(),
            })
            .await;
        gateway
            .fail_next(GatewayError::Rejected {
                status: 429,
                message: "slow down".to_string(),
            })
            .await;

        let first = outbox
            .send(&to, &OutboundMessage::text("hi"), Origin::default())
            .await
            .unwrap_err();
        let second = outbox
            .send(&to, &OutboundMessage::text("hi"), Origin::default())
            .await
            .unwrap_err();

        assert!(first.is_permanent());
        assert!(!second.is_permanent());
        assert_eq!(log.len().await, 0);
    }

    #[tokio::test]
    async fn empty_text_is_a_permanent_failure() {
        let gateway = Arc::new(RecordingGateway::new());
        let outbox = outbox(gateway.clone(), Arc::new(InMemoryMessageLog::new()));
        let to = PhoneNumber::parse("+15550001").unwrap();

        let err = outbox
            .send(&to, &OutboundMessage::text("  "), Origin::default())
            .await
            .unwrap_err();
        assert!(err.is_permanent());
        assert!(gateway.sent().await.is_empty());
    }
}
