//! Webhook ingestion: turns provider envelopes into delivery-status updates,
//! progress records, and feedback messages.
//!
//! Processing is idempotent per inbound provider message id. A redelivered
//! webhook is acknowledged without touching progress again, and feedback jobs
//! are keyed on the inbound id so a retried batch never double-sends.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use microlearn_core::{CourseId, LessonId};
use microlearn_messaging::{
    DeliveryStatus, EnvelopeError, InboundMessage, StatusUpdate, WebhookEnvelope,
};
use microlearn_progress::QuizReply;

use crate::delivery::TextJob;
use crate::error::StoreError;
use crate::jobs::{JobKind, JobQueue, JobStoreError, QueueName};
use crate::message_log::{MessageLog, MessageLogEntry, StatusOutcome};
use crate::progress::{ProgressOutcome, ProgressTracker, ProgressUpdate};
use crate::reply_context::{Correlation, ReplyContext, ReplyContextService};

/// Reply for messages that cannot be tied to a lesson or quiz.
pub const FALLBACK_REPLY: &str =
    "Thanks for your message! To record progress, reply to a lesson or tap a quiz option.";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid webhook payload: {0}")]
    InvalidEnvelope(#[from] EnvelopeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to enqueue reply: {0}")]
    Queue(#[from] JobStoreError),
}

impl IngestError {
    /// The payload itself was malformed; retrying it cannot help.
    pub fn is_client_error(&self) -> bool {
        matches!(self, IngestError::InvalidEnvelope(_))
    }
}

/// Counters for one processed envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub messages: usize,
    /// Already processed (webhook redelivery).
    pub duplicates: usize,
    /// Unsupported message types.
    pub skipped: usize,
    pub progress_recorded: usize,
    /// Context pointed at a learner, course or lesson that no longer exists.
    pub unresolved: usize,
    pub fallbacks: usize,
    pub statuses_applied: usize,
    pub statuses_ignored: usize,
}

pub struct WebhookIngestion {
    log: Arc<dyn MessageLog>,
    contexts: ReplyContextService,
    tracker: Arc<ProgressTracker>,
    queue: JobQueue,
}

impl WebhookIngestion {
    pub fn new(
        log: Arc<dyn MessageLog>,
        contexts: ReplyContextService,
        tracker: Arc<ProgressTracker>,
        queue: JobQueue,
    ) -> Self {
        Self {
            log,
            contexts,
            tracker,
            queue,
        }
    }

    #[instrument(skip_all, err)]
    pub async fn ingest(
        &self,
        envelope: &WebhookEnvelope,
        now: DateTime<Utc>,
    ) -> Result<IngestReport, IngestError> {
        let changes = envelope.changes()?;
        let mut report = IngestReport::default();

        for change in changes {
            for status in &change.statuses {
                match status.to_update() {
                    Some(update) => self.apply_status(&update, now, &mut report).await?,
                    None => report.statuses_ignored += 1,
                }
            }

            for payload in &change.messages {
                match payload.classify() {
                    Some(message) => self.process_message(&message, now, &mut report).await?,
                    None => {
                        debug!(kind = %payload.kind, "unsupported inbound message skipped");
                        report.skipped += 1;
                    }
                }
            }
        }

        info!(
            messages = report.messages,
            duplicates = report.duplicates,
            skipped = report.skipped,
            progress_recorded = report.progress_recorded,
            fallbacks = report.fallbacks,
            statuses_applied = report.statuses_applied,
            "webhook processed"
        );
        Ok(report)
    }

    async fn apply_status(
        &self,
        update: &StatusUpdate,
        now: DateTime<Utc>,
        report: &mut IngestReport,
    ) -> Result<(), IngestError> {
        if update.status == DeliveryStatus::Failed {
            warn!(
                provider_message_id = %update.provider_message_id,
                error = update.error.as_deref().unwrap_or("unknown"),
                "provider reported delivery failure"
            );
        }
        match self.log.apply_status(update, now).await? {
            StatusOutcome::Updated => report.statuses_applied += 1,
            StatusOutcome::Ignored | StatusOutcome::Unknown => report.statuses_ignored += 1,
        }
        Ok(())
    }

    async fn process_message(
        &self,
        message: &InboundMessage,
        now: DateTime<Utc>,
        report: &mut IngestReport,
    ) -> Result<(), IngestError> {
        let id = &message.provider_message_id;
        if self.log.get(id).await?.is_some() {
            debug!(provider_message_id = %id, "inbound message already processed");
            report.duplicates += 1;
            return Ok(());
        }
        report.messages += 1;

        let context = self
            .contexts
            .lookup(&message.from, message.reply_to.as_deref(), now)
            .await?;

        let mut entry = MessageLogEntry::inbound(
            id.clone(),
            message.from.clone(),
            message.kind.as_str(),
            message.body.clone(),
            now,
        );

        match context {
            Some((context, correlation)) => {
                entry.course_id = Some(context.course_id);
                entry.lesson_id = context.lesson_id;
                match context.lesson_id {
                    Some(lesson_id) => {
                        self.record_reply(message, &context, lesson_id, correlation, now, report)
                            .await?;
                    }
                    // A reply to a course announcement carries nothing to record.
                    None => self.send_fallback(message, Some(context.course_id), report).await?,
                }
            }
            None => self.send_fallback(message, None, report).await?,
        }

        self.log.record_inbound(&entry).await?;
        Ok(())
    }

    async fn record_reply(
        &self,
        message: &InboundMessage,
        context: &ReplyContext,
        lesson_id: LessonId,
        correlation: Correlation,
        now: DateTime<Utc>,
        report: &mut IngestReport,
    ) -> Result<(), IngestError> {
        let course_id = context.course_id;
        // Anything sent against a quiz is an answer; otherwise it acknowledges the lesson.
        let quiz_reply = context
            .quiz_id
            .map(|_| QuizReply {
                text: message.body.as_str(),
                option_id: message.selected_id.as_deref(),
            })
            .filter(|reply| !reply.text.is_empty() || reply.option_id.is_some());

        let outcome = self
            .tracker
            .record_progress(&message.from, course_id, lesson_id, quiz_reply, now)
            .await?;

        let update = match outcome {
            ProgressOutcome::Recorded(update) => update,
            other => {
                warn!(
                    provider_message_id = %message.provider_message_id,
                    course_id = %course_id,
                    lesson_id = %lesson_id,
                    outcome = ?other,
                    "reply context could not be resolved"
                );
                report.unresolved += 1;
                return Ok(());
            }
        };
        report.progress_recorded += 1;

        debug!(
            provider_message_id = %message.provider_message_id,
            correlation = ?correlation,
            counted = update.counted,
            "reply applied to progress"
        );

        let job = TextJob {
            phone: message.from.clone(),
            body: feedback(&update),
            course_id: Some(course_id),
        };
        self.queue
            .enqueue(
                QueueName::Text,
                JobKind::FreeText,
                &job,
                format!("feedback:{}", message.provider_message_id),
            )
            .await?;
        Ok(())
    }

    async fn send_fallback(
        &self,
        message: &InboundMessage,
        course_id: Option<CourseId>,
        report: &mut IngestReport,
    ) -> Result<(), IngestError> {
        let job = TextJob {
            phone: message.from.clone(),
            body: FALLBACK_REPLY.to_string(),
            course_id,
        };
        self.queue
            .enqueue(
                QueueName::Text,
                JobKind::FreeText,
                &job,
                format!("fallback:{}", message.provider_message_id),
            )
            .await?;
        report.fallbacks += 1;
        Ok(())
    }
}

/// Learner-facing feedback for an applied reply.
pub fn feedback(update: &ProgressUpdate) -> String {
    let progress = &update.course_progress;
    let mut body = match (&update.verdict, update.counted) {
        (Some(_), false) => "You have already answered this quiz.".to_string(),
        (Some(verdict), true) if verdict.correct => "Correct! Well done.".to_string(),
        (Some(verdict), true) => format!(
            "Not quite. The correct answer is: {}",
            verdict.correct_answer
        ),
        (None, false) => "You have already completed this lesson.".to_string(),
        (None, true) => format!("Lesson {} completed.", update.lesson.day),
    };
    body.push_str(&format!("\n\nCourse progress: {}%", progress.progress_percent));

    if update.course_completed {
        body.push_str(&format!(
            "\n\nCongratulations, you have completed *{}*! Quiz score: {}%",
            update.course.name, progress.quiz_score
        ));
    }
    body
}
