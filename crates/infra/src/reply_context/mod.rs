//! Reply contexts: which course, lesson and quiz an outbound message was about.
//!
//! A context is written right after a lesson, quiz or course notification is
//! sent. When the learner answers, the inbound reply is matched to a context
//! so the progress tracker knows what is being answered.

pub mod postgres;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use microlearn_core::{CourseId, LessonId, PhoneNumber, QuizId};

use crate::error::StoreError;

pub use postgres::PostgresReplyContextStore;

/// 7.7 days.
pub const DEFAULT_CONTEXT_TTL: Duration = Duration::from_secs(665_280);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyContext {
    pub provider_message_id: String,
    pub phone: PhoneNumber,
    pub course_id: CourseId,
    pub lesson_id: Option<LessonId>,
    pub quiz_id: Option<QuizId>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ReplyContext {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// How an inbound reply was matched to its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Correlation {
    /// The reply quoted the outbound message id.
    ByMessageId,
    /// Newest live context for the sender. Can pick the wrong question when
    /// two are outstanding.
    MostRecent,
}

#[async_trait]
pub trait ReplyContextStore: Send + Sync {
    /// Store a context. Re-recording the same provider id replaces it.
    async fn record(&self, context: &ReplyContext) -> Result<(), StoreError>;

    async fn find_by_message_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<ReplyContext>, StoreError>;

    /// Newest context for `phone` that has not expired at `now`.
    async fn latest_for_phone(
        &self,
        phone: &PhoneNumber,
        now: DateTime<Utc>,
    ) -> Result<Option<ReplyContext>, StoreError>;

    /// Delete contexts expired at `now` or created before `created_before`.
    async fn sweep(
        &self,
        now: DateTime<Utc>,
        created_before: DateTime<Utc>,
    ) -> Result<usize, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryReplyContextStore {
    contexts: RwLock<HashMap<String, ReplyContext>>,
}

impl InMemoryReplyContextStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReplyContextStore for InMemoryReplyContextStore {
    async fn record(&self, context: &ReplyContext) -> Result<(), StoreError> {
        self.contexts
            .write()
            .await
            .insert(context.provider_message_id.clone(), context.clone());
        Ok(())
    }

    async fn find_by_message_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<ReplyContext>, StoreError> {
        Ok(self.contexts.read().await.get(provider_message_id).cloned())
    }

    async fn latest_for_phone(
        &self,
        phone: &PhoneNumber,
        now: DateTime<Utc>,
    ) -> Result<Option<ReplyContext>, StoreError> {
        let contexts = self.contexts.read().await;
        // Provider ids break ties between contexts written in the same instant.
        Ok(contexts
            .values()
            .filter(|c| &c.phone == phone && c.is_live_at(now))
            .max_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.provider_message_id.cmp(&b.provider_message_id))
            })
            .cloned())
    }

    async fn sweep(
        &self,
        now: DateTime<Utc>,
        created_before: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut contexts = self.contexts.write().await;
        let before = contexts.len();
        contexts.retain(|_, c| c.is_live_at(now) && c.created_at >= created_before);
        Ok(before - contexts.len())
    }
}

/// Writes contexts with the configured lifetime and resolves inbound replies.
#[derive(Clone)]
pub struct ReplyContextService {
    store: Arc<dyn ReplyContextStore>,
    ttl: Duration,
}

impl ReplyContextService {
    pub fn new(store: Arc<dyn ReplyContextStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn store(&self) -> &Arc<dyn ReplyContextStore> {
        &self.store
    }

    #[instrument(skip(self, now), fields(phone = %phone), err)]
    pub async fn record(
        &self,
        phone: &PhoneNumber,
        provider_message_id: &str,
        course_id: CourseId,
        lesson_id: Option<LessonId>,
        quiz_id: Option<QuizId>,
        now: DateTime<Utc>,
    ) -> Result<ReplyContext, StoreError> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::days(7));
        let context = ReplyContext {
            provider_message_id: provider_message_id.to_string(),
            phone: phone.clone(),
            course_id,
            lesson_id,
            quiz_id,
            created_at: now,
            expires_at: now + ttl,
        };
        self.store.record(&context).await?;
        Ok(context)
    }

    /// Resolve the context an inbound message answers.
    ///
    /// A quoted message id wins when it names a live context sent to the same
    /// phone; otherwise the sender's newest live context is used.
    pub async fn lookup(
        &self,
        phone: &PhoneNumber,
        reply_to: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<(ReplyContext, Correlation)>, StoreError> {
        if let Some(reply_to) = reply_to {
            if let Some(context) = self.store.find_by_message_id(reply_to).await? {
                if &context.phone == phone && context.is_live_at(now) {
                    return Ok(Some((context, Correlation::ByMessageId)));
                }
            }
        }

        let latest = self.store.latest_for_phone(phone, now).await?;
        if let Some(context) = &latest {
            debug!(
                phone = %phone,
                provider_message_id = %context.provider_message_id,
                "reply correlated by most recent context"
            );
        }
        Ok(latest.map(|c| (c, Correlation::MostRecent)))
    }

    /// Delete expired contexts and anything created before `now - fallback_age`.
    pub async fn sweep(&self, now: DateTime<Utc>, fallback_age: Duration) -> Result<usize, StoreError> {
        let fallback = chrono::Duration::from_std(fallback_age).unwrap_or(chrono::Duration::days(8));
        self.store.sweep(now, now - fallback).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ReplyContextService {
        ReplyContextService::new(Arc::new(InMemoryReplyContextStore::new()), DEFAULT_CONTEXT_TTL)
    }

    fn phone(raw: &str) -> PhoneNumber {
        PhoneNumber::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn quoted_message_id_wins_over_most_recent() {
        let svc = service();
        let learner = phone("+900000000");
        let course = CourseId::new();
        let now = Utc::now();
        let (first_lesson, second_lesson) = (LessonId::new(), LessonId::new());

        svc.record(&learner, "wamid.1", course, Some(first_lesson), None, now)
            .await
            .unwrap();
        svc.record(
            &learner,
            "wamid.2",
            course,
            Some(second_lesson),
            None,
            now + chrono::Duration::seconds(5),
        )
        .await
        .unwrap();

        let later = now + chrono::Duration::minutes(1);
        let (ctx, how) = svc.lookup(&learner, Some("wamid.1"), later).await.unwrap().unwrap();
        assert_eq!(how, Correlation::ByMessageId);
        assert_eq!(ctx.lesson_id, Some(first_lesson));

        let (ctx, how) = svc.lookup(&learner, None, later).await.unwrap().unwrap();
        assert_eq!(how, Correlation::MostRecent);
        assert_eq!(ctx.lesson_id, Some(second_lesson));
    }

    #[tokio::test]
    async fn quoted_id_for_another_phone_falls_back() {
        let svc = service();
        let now = Utc::now();
        let (alice, bob) = (phone("+900000001"), phone("+900000002"));

        svc.record(&alice, "wamid.a", CourseId::new(), None, None, now)
            .await
            .unwrap();
        svc.record(&bob, "wamid.b", CourseId::new(), None, None, now)
            .await
            .unwrap();

        let (ctx, how) = svc.lookup(&bob, Some("wamid.a"), now).await.unwrap().unwrap();
        assert_eq!(how, Correlation::MostRecent);
        assert_eq!(ctx.provider_message_id, "wamid.b");
    }

    #[tokio::test]
    async fn expired_contexts_do_not_match_and_are_swept() {
        let svc = service();
        let learner = phone("+900000000");
        let now = Utc::now();
        svc.record(&learner, "wamid.old", CourseId::new(), None, None, now)
            .await
            .unwrap();

        let after_expiry = now + chrono::Duration::days(8);
        assert!(svc.lookup(&learner, Some("wamid.old"), after_expiry).await.unwrap().is_none());
        assert!(svc.lookup(&learner, None, after_expiry).await.unwrap().is_none());

        let removed = svc
            .sweep(after_expiry, Duration::from_secs(691_200))
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn sweep_uses_fallback_age_for_long_lived_contexts() {
        let store = Arc::new(InMemoryReplyContextStore::new());
        let svc = ReplyContextService::new(store.clone(), Duration::from_secs(30 * 24 * 3600));
        let learner = phone("+900000000");
        let now = Utc::now();
        svc.record(&learner, "wamid.x", CourseId::new(), None, None, now)
            .await
            .unwrap();

        let nine_days = now + chrono::Duration::days(9);
        assert_eq!(svc.sweep(nine_days, Duration::from_secs(691_200)).await.unwrap(), 1);
        assert!(store.find_by_message_id("wamid.x").await.unwrap().is_none());
    }
}
