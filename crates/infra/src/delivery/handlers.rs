//! Job handlers, one per job kind.
//!
//! A handler either finishes its sends or returns an error; it never swallows
//! a failure, so the executor's retry policy always applies.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::info;

use microlearn_core::{CourseId, LessonId};
use microlearn_courses::{Course, Lesson, MediaKind};
use microlearn_messaging::{OutboundMessage, TemplateMessage};

use crate::catalog::CatalogStore;
use crate::error::StoreError;
use crate::jobs::{Job, JobError, JobExecutor, JobHandler, JobKind};

use super::outbox::{Origin, Outbox};
use super::payloads::{LessonJob, NotificationJob, ReminderJob, TextJob, WelcomeJob};

/// Body of the one-button prompt sent after a lesson without a quiz.
pub const DONE_PROMPT: &str = "Reply *Done* when you have finished this lesson.";
pub const DONE_LABEL: &str = "Done";

/// Provider template used for welcome messages instead of plain text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WelcomeTemplate {
    pub name: String,
    pub language: String,
}

/// Register a handler for every [`JobKind`].
pub fn register_delivery_handlers(
    executor: &mut JobExecutor,
    catalog: Arc<dyn CatalogStore>,
    outbox: Arc<Outbox>,
    welcome_template: Option<WelcomeTemplate>,
) {
    executor.register_handler(
        JobKind::SendLesson,
        Arc::new(LessonHandler::new(catalog.clone(), outbox.clone())),
    );
    executor.register_handler(
        JobKind::SendReminder,
        Arc::new(ReminderHandler::new(catalog.clone(), outbox.clone())),
    );
    executor.register_handler(
        JobKind::CourseNotification,
        Arc::new(NotificationHandler::new(catalog, outbox.clone())),
    );
    executor.register_handler(
        JobKind::Welcome,
        Arc::new(WelcomeHandler::new(outbox.clone(), welcome_template)),
    );
    executor.register_handler(JobKind::FreeText, Arc::new(TextHandler::new(outbox)));
}

fn decode<P: DeserializeOwned>(job: &Job) -> Result<P, JobError> {
    serde_json::from_value(job.payload.clone())
        .map_err(|e| JobError::permanent(format!("malformed {} payload: {e}", job.kind.type_name())))
}

fn lookup_failed(e: StoreError) -> JobError {
    JobError::transient(format!("catalog lookup failed: {e}"))
}

async fn load_course(
    catalog: &dyn CatalogStore,
    job: &Job,
    course_id: CourseId,
) -> Result<Course, JobError> {
    catalog
        .get_course(course_id)
        .await
        .map_err(lookup_failed)?
        .ok_or_else(|| JobError::permanent(format!("job {}: course {course_id} not found", job.id)))
}

async fn load_lesson(
    catalog: &dyn CatalogStore,
    job: &Job,
    course_id: CourseId,
    lesson_id: LessonId,
) -> Result<Lesson, JobError> {
    match catalog.get_lesson(lesson_id).await.map_err(lookup_failed)? {
        Some(lesson) if lesson.course_id == course_id => Ok(lesson),
        _ => Err(JobError::permanent(format!(
            "job {}: lesson {lesson_id} not found in course {course_id}",
            job.id
        ))),
    }
}

fn file_name(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && name.contains('.'))
        .map(str::to_string)
}

/// Sends the full lesson sequence: text, document, media, link, then the
/// quiz or a completion prompt.
pub struct LessonHandler {
    catalog: Arc<dyn CatalogStore>,
    outbox: Arc<Outbox>,
}

impl LessonHandler {
    pub fn new(catalog: Arc<dyn CatalogStore>, outbox: Arc<Outbox>) -> Self {
        Self { catalog, outbox }
    }
}

#[async_trait]
impl JobHandler for LessonHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let payload: LessonJob = decode(job)?;
        let lesson = load_lesson(&*self.catalog, job, payload.course_id, payload.lesson_id).await?;
        let quiz = self
            .catalog
            .quiz_for_lesson(lesson.id)
            .await
            .map_err(lookup_failed)?;

        let to = &payload.phone;
        let origin = Origin::lesson(payload.course_id, lesson.id);
        let limits = self.outbox.limits();

        let intro = OutboundMessage::text(format!(
            "*Day {}: {}*\n\n{}",
            lesson.day, lesson.title, lesson.content
        ));
        let receipt = self.outbox.send(to, &intro, origin).await?;
        self.outbox
            .remember(to, &receipt, payload.course_id, Some(lesson.id), None)
            .await?;

        if let Some(url) = &lesson.document {
            self.outbox.pace().await;
            let document = OutboundMessage::Document {
                url: url.clone(),
                filename: file_name(url),
                caption: None,
            };
            self.outbox.send(to, &document, origin).await?;
        }

        if let (Some(url), Some(kind)) = (&lesson.media, lesson.media_kind()) {
            self.outbox.pace().await;
            let media = match kind {
                MediaKind::Image => OutboundMessage::Image {
                    url: url.clone(),
                    caption: None,
                },
                MediaKind::Video => OutboundMessage::Video {
                    url: url.clone(),
                    caption: None,
                },
            };
            self.outbox.send(to, &media, origin).await?;
        }

        if let Some(link) = &lesson.external_link {
            self.outbox.pace().await;
            let link = OutboundMessage::text(format!("Learn more: {link}"));
            self.outbox.send(to, &link, origin).await?;
        }

        self.outbox.pace().await;
        let (prompt, quiz_id) = match &quiz {
            Some(quiz) => (
                OutboundMessage::choice(quiz.question.as_str(), &quiz.options, limits),
                Some(quiz.id),
            ),
            None => (
                OutboundMessage::buttons(DONE_PROMPT, &[DONE_LABEL.to_string()], limits),
                None,
            ),
        };
        let receipt = self.outbox.send(to, &prompt, origin).await?;
        self.outbox
            .remember(to, &receipt, payload.course_id, Some(lesson.id), quiz_id)
            .await?;

        info!(
            job_id = %job.id,
            course_id = %payload.course_id,
            lesson_id = %lesson.id,
            day = lesson.day,
            has_quiz = quiz.is_some(),
            "lesson delivered"
        );
        Ok(())
    }
}

pub struct ReminderHandler {
    catalog: Arc<dyn CatalogStore>,
    outbox: Arc<Outbox>,
}

impl ReminderHandler {
    pub fn new(catalog: Arc<dyn CatalogStore>, outbox: Arc<Outbox>) -> Self {
        Self { catalog, outbox }
    }
}

#[async_trait]
impl JobHandler for ReminderHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let payload: ReminderJob = decode(job)?;
        let course = load_course(&*self.catalog, job, payload.course_id).await?;
        let lesson = load_lesson(&*self.catalog, job, payload.course_id, payload.lesson_id).await?;

        let body = format!(
            "Reminder: Day {} of *{}* (\"{}\") arrives in about two hours.",
            lesson.day, course.name, lesson.title
        );
        self.outbox
            .send(
                &payload.phone,
                &OutboundMessage::text(body),
                Origin::lesson(course.id, lesson.id),
            )
            .await?;
        Ok(())
    }
}

/// Enrollment announcement. Leaves a course-level reply context behind.
pub struct NotificationHandler {
    catalog: Arc<dyn CatalogStore>,
    outbox: Arc<Outbox>,
}

impl NotificationHandler {
    pub fn new(catalog: Arc<dyn CatalogStore>, outbox: Arc<Outbox>) -> Self {
        Self { catalog, outbox }
    }
}

#[async_trait]
impl JobHandler for NotificationHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let payload: NotificationJob = decode(job)?;
        let course = load_course(&*self.catalog, job, payload.course_id).await?;

        let mut body = format!(
            "Hi {}, you have been enrolled in *{}*.",
            payload.learner_name, course.name
        );
        if !course.description.trim().is_empty() {
            body.push_str("\n\n");
            body.push_str(course.description.trim());
        }
        body.push_str("\n\nLessons will arrive here on schedule.");

        let receipt = self
            .outbox
            .send(&payload.phone, &OutboundMessage::text(body), Origin::course(course.id))
            .await?;
        self.outbox
            .remember(&payload.phone, &receipt, course.id, None, None)
            .await
    }
}

pub struct WelcomeHandler {
    outbox: Arc<Outbox>,
    template: Option<WelcomeTemplate>,
}

impl WelcomeHandler {
    pub fn new(outbox: Arc<Outbox>, template: Option<WelcomeTemplate>) -> Self {
        Self { outbox, template }
    }
}

#[async_trait]
impl JobHandler for WelcomeHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let payload: WelcomeJob = decode(job)?;
        let message = match &self.template {
            Some(template) => OutboundMessage::Template(TemplateMessage {
                name: template.name.clone(),
                language: template.language.clone(),
                header_params: Vec::new(),
                body_params: vec![payload.name.clone()],
                quick_reply: None,
            }),
            None => OutboundMessage::text(format!(
                "Welcome, {}! Your lessons will be delivered here. Answer quizzes by tapping an option.",
                payload.name
            )),
        };
        self.outbox
            .send(&payload.phone, &message, Origin::default())
            .await?;
        Ok(())
    }
}

pub struct TextHandler {
    outbox: Arc<Outbox>,
}

impl TextHandler {
    pub fn new(outbox: Arc<Outbox>) -> Self {
        Self { outbox }
    }
}

#[async_trait]
impl JobHandler for TextHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let payload: TextJob = decode(job)?;
        let origin = Origin {
            course_id: payload.course_id,
            lesson_id: None,
        };
        self.outbox
            .send(&payload.phone, &OutboundMessage::text(payload.body), origin)
            .await?;
        Ok(())
    }
}
