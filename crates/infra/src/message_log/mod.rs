//! Message audit trail.
//!
//! Every outbound send and every inbound learner message is recorded under its
//! provider message id. Delivery-status webhooks move outbound entries forward
//! (sent, delivered, read or failed) and never backward.

pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use microlearn_core::{CourseId, LessonId, PhoneNumber};
use microlearn_messaging::{DeliveryStatus, StatusUpdate};

use crate::error::StoreError;

pub use postgres::PostgresMessageLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Outbound => "outbound",
            Direction::Inbound => "inbound",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "outbound" => Some(Direction::Outbound),
            "inbound" => Some(Direction::Inbound),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageLogEntry {
    pub provider_message_id: String,
    pub direction: Direction,
    pub phone: PhoneNumber,
    /// Outbound message kind or inbound classification.
    pub kind: String,
    pub body: Option<String>,
    pub course_id: Option<CourseId>,
    pub lesson_id: Option<LessonId>,
    /// Delivery status, outbound only.
    pub status: Option<DeliveryStatus>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageLogEntry {
    pub fn outbound(
        provider_message_id: impl Into<String>,
        phone: PhoneNumber,
        kind: impl Into<String>,
        course_id: Option<CourseId>,
        lesson_id: Option<LessonId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            provider_message_id: provider_message_id.into(),
            direction: Direction::Outbound,
            phone,
            kind: kind.into(),
            body: None,
            course_id,
            lesson_id,
            status: Some(DeliveryStatus::Accepted),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn inbound(
        provider_message_id: impl Into<String>,
        phone: PhoneNumber,
        kind: impl Into<String>,
        body: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            provider_message_id: provider_message_id.into(),
            direction: Direction::Inbound,
            phone,
            kind: kind.into(),
            body: Some(body.into()),
            course_id: None,
            lesson_id: None,
            status: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result of applying a delivery-status webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusOutcome {
    Updated,
    /// Stale or repeated status; the stored one was kept.
    Ignored,
    /// No outbound message with that id.
    Unknown,
}

#[async_trait]
pub trait MessageLog: Send + Sync {
    async fn record_outbound(&self, entry: &MessageLogEntry) -> Result<(), StoreError>;

    /// Returns `false` when a message with the same provider id was already
    /// recorded (a webhook redelivery).
    async fn record_inbound(&self, entry: &MessageLogEntry) -> Result<bool, StoreError>;

    async fn apply_status(
        &self,
        update: &StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<StatusOutcome, StoreError>;

    async fn get(&self, provider_message_id: &str) -> Result<Option<MessageLogEntry>, StoreError>;
}

/// Decide whether `next` replaces `current`.
pub(crate) fn advance(current: Option<DeliveryStatus>, next: DeliveryStatus) -> bool {
    match current {
        Some(current) => current.can_advance_to(next),
        None => true,
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMessageLog {
    entries: RwLock<HashMap<String, MessageLogEntry>>,
}

impl InMemoryMessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl MessageLog for InMemoryMessageLog {
    async fn record_outbound(&self, entry: &MessageLogEntry) -> Result<(), StoreError> {
        self.entries
            .write()
            .await
            .insert(entry.provider_message_id.clone(), entry.clone());
        Ok(())
    }

    async fn record_inbound(&self, entry: &MessageLogEntry) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&entry.provider_message_id) {
            return Ok(false);
        }
        entries.insert(entry.provider_message_id.clone(), entry.clone());
        Ok(true)
    }

    async fn apply_status(
        &self,
        update: &StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<StatusOutcome, StoreError> {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries
            .get_mut(&update.provider_message_id)
            .filter(|e| e.direction == Direction::Outbound)
        else {
            return Ok(StatusOutcome::Unknown);
        };

        if !advance(entry.status, update.status) {
            return Ok(StatusOutcome::Ignored);
        }
        entry.status = Some(update.status);
        if update.error.is_some() {
            entry.error = update.error.clone();
        }
        entry.updated_at = now;
        Ok(StatusOutcome::Updated)
    }

    async fn get(&self, provider_message_id: &str) -> Result<Option<MessageLogEntry>, StoreError> {
        Ok(self.entries.read().await.get(provider_message_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phone() -> PhoneNumber {
        PhoneNumber::parse("+900000000").unwrap()
    }

    fn status(id: &str, status: DeliveryStatus) -> StatusUpdate {
        StatusUpdate {
            provider_message_id: id.to_string(),
            status,
            recipient_id: None,
            at: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn status_only_moves_forward() {
        let log = InMemoryMessageLog::new();
        let now = Utc::now();
        log.record_outbound(&MessageLogEntry::outbound("wamid.1", phone(), "text", None, None, now))
            .await
            .unwrap();

        let read = log.apply_status(&status("wamid.1", DeliveryStatus::Read), now).await;
        let late_delivered = log
            .apply_status(&status("wamid.1", DeliveryStatus::Delivered), now)
            .await;

        assert_eq!(read.unwrap(), StatusOutcome::Updated);
        assert_eq!(late_delivered.unwrap(), StatusOutcome::Ignored);
        let entry = log.get("wamid.1").await.unwrap().unwrap();
        assert_eq!(entry.status, Some(DeliveryStatus::Read));
    }

    #[tokio::test]
    async fn failure_keeps_provider_error() {
        let log = InMemoryMessageLog::new();
        let now = Utc::now();
        log.record_outbound(&MessageLogEntry::outbound("wamid.2", phone(), "image", None, None, now))
            .await
            .unwrap();

        let mut failed = status("wamid.2", DeliveryStatus::Failed);
        failed.error = Some("Re-engagement message".to_string());
        assert_eq!(log.apply_status(&failed, now).await.unwrap(), StatusOutcome::Updated);

        let entry = log.get("wamid.2").await.unwrap().unwrap();
        assert_eq!(entry.status, Some(DeliveryStatus::Failed));
        assert_eq!(entry.error.as_deref(), Some("Re-engagement message"));
    }

    #[tokio::test]
    async fn unknown_ids_create_nothing() {
        let log = InMemoryMessageLog::new();
        let outcome = log
            .apply_status(&status("wamid.missing", DeliveryStatus::Delivered), Utc::now())
            .await
            .unwrap();

        assert_eq!(outcome, StatusOutcome::Unknown);
        assert_eq!(log.len().await, 0);
    }

    #[tokio::test]
    async fn inbound_redelivery_is_detected() {
        let log = InMemoryMessageLog::new();
        let entry = MessageLogEntry::inbound("wamid.in", phone(), "text", "done", Utc::now());

        assert!(log.record_inbound(&entry).await.unwrap());
        assert!(!log.record_inbound(&entry).await.unwrap());
        assert_eq!(
            log.apply_status(&status("wamid.in", DeliveryStatus::Read), Utc::now())
                .await
                .unwrap(),
            StatusOutcome::Unknown
        );
    }
}
