//! Course authoring boundary: create a course, enroll its learners, announce
//! it, publish it and schedule delivery.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument};

use microlearn_core::{CourseId, DomainError, PhoneNumber};
use microlearn_courses::{AuthoringError, Course, CourseDraft, Enrollment, Lesson, Quiz};

use crate::catalog::CatalogStore;
use crate::delivery::{NotificationJob, WelcomeJob};
use crate::error::StoreError;
use crate::jobs::{JobKind, JobQueue, JobStoreError, QueueName};
use crate::scheduler::{CourseSchedule, LessonScheduler, ScheduleParams, ScheduleResult, SchedulerError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnerInput {
    pub name: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateCourseRequest {
    pub draft: CourseDraft,
    #[serde(default)]
    pub learners: Vec<LearnerInput>,
    pub schedule: ScheduleParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedCourse {
    pub course: Course,
    pub lessons: Vec<Lesson>,
    pub quizzes: Vec<Quiz>,
    pub enrollments: Vec<Enrollment>,
    pub scheduling: ScheduleResult,
}

#[derive(Debug, Error)]
pub enum CourseServiceError {
    #[error(transparent)]
    Authoring(#[from] AuthoringError),

    #[error("invalid learner {phone:?}: {reason}")]
    InvalidLearner { phone: String, reason: String },

    #[error(transparent)]
    Schedule(#[from] SchedulerError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("course not found: {0}")]
    CourseNotFound(CourseId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to enqueue job: {0}")]
    Queue(#[from] JobStoreError),
}

impl CourseServiceError {
    /// Caller-supplied input was rejected before anything was written.
    pub fn is_validation(&self) -> bool {
        match self {
            CourseServiceError::Authoring(_) | CourseServiceError::InvalidLearner { .. } => true,
            CourseServiceError::Schedule(e) => e.is_validation(),
            CourseServiceError::Domain(DomainError::Validation(_)) => true,
            _ => false,
        }
    }
}

struct ValidLearner {
    name: String,
    phone: PhoneNumber,
}

fn validate_learners(inputs: &[LearnerInput]) -> Result<Vec<ValidLearner>, CourseServiceError> {
    let mut seen = HashSet::with_capacity(inputs.len());
    let mut learners = Vec::with_capacity(inputs.len());
    for input in inputs {
        let phone = PhoneNumber::parse(&input.phone).map_err(|e| CourseServiceError::InvalidLearner {
            phone: input.phone.clone(),
            reason: e.to_string(),
        })?;
        let name = input.name.trim();
        if name.is_empty() {
            return Err(CourseServiceError::InvalidLearner {
                phone: input.phone.clone(),
                reason: "name must not be empty".to_string(),
            });
        }
        if seen.insert(phone.clone()) {
            learners.push(ValidLearner {
                name: name.to_string(),
                phone,
            });
        }
    }
    Ok(learners)
}

pub struct CourseService {
    catalog: Arc<dyn CatalogStore>,
    queue: JobQueue,
    scheduler: Arc<LessonScheduler>,
}

impl CourseService {
    pub fn new(catalog: Arc<dyn CatalogStore>, queue: JobQueue, scheduler: Arc<LessonScheduler>) -> Self {
        Self {
            catalog,
            queue,
            scheduler,
        }
    }

    /// Validates everything up front, then persists the course, enrolls and
    /// greets learners, publishes, and schedules delivery.
    #[instrument(skip_all, fields(course = %request.draft.name, learners = request.learners.len()), err)]
    pub async fn create_course(
        &self,
        request: CreateCourseRequest,
        now: DateTime<Utc>,
    ) -> Result<CreatedCourse, CourseServiceError> {
        let CreateCourseRequest {
            draft,
            learners,
            schedule,
        } = request;

        draft.validate()?;
        let learners = validate_learners(&learners)?;
        let rule = self.scheduler.parse_rule(&schedule)?;
        if rule.next_after(now).is_none() {
            return Err(SchedulerError::NoUpcomingOccurrence.into());
        }

        let bundle = draft.build(now)?;
        self.catalog.insert_course_bundle(&bundle).await?;
        let mut course = bundle.course;

        let mut enrollments = Vec::with_capacity(learners.len());
        let mut recipients = Vec::with_capacity(learners.len());
        for ValidLearner { name, phone } in learners {
            let learner = self.catalog.upsert_learner(&name, &phone).await?;
            let outcome = self.catalog.enroll(learner.id, course.id, now).await?;

            if outcome.first_enrollment {
                let welcome = WelcomeJob {
                    learner_id: learner.id,
                    phone: learner.phone.clone(),
                    name: learner.name.clone(),
                };
                self.queue
                    .enqueue(QueueName::Welcome, JobKind::Welcome, &welcome, welcome.idempotency_key())
                    .await?;
            }
            if outcome.created {
                let notification = NotificationJob {
                    course_id: course.id,
                    learner_id: learner.id,
                    phone: learner.phone.clone(),
                    learner_name: learner.name.clone(),
                };
                self.queue
                    .enqueue(
                        QueueName::Notification,
                        JobKind::CourseNotification,
                        &notification,
                        notification.idempotency_key(),
                    )
                    .await?;
            }

            enrollments.push(outcome.enrollment);
            recipients.push(learner.phone);
        }

        course.publish(now)?;
        self.catalog.update_course(&course).await?;

        let scheduling = self
            .scheduler
            .schedule_delivery(course.id, recipients, &schedule, now)
            .await?;

        info!(
            course_id = %course.id,
            total_lessons = course.total_lessons,
            total_quizzes = course.total_quizzes,
            enrollments = enrollments.len(),
            next_execution = ?scheduling.next_execution,
            "course created"
        );

        Ok(CreatedCourse {
            course,
            lessons: bundle.lessons,
            quizzes: bundle.quizzes,
            enrollments,
            scheduling,
        })
    }

    /// Re-schedule delivery of an existing course to its enrolled learners.
    #[instrument(skip(self, params, now), fields(course_id = %course_id), err)]
    pub async fn reschedule(
        &self,
        course_id: CourseId,
        params: &ScheduleParams,
        now: DateTime<Utc>,
    ) -> Result<ScheduleResult, CourseServiceError> {
        if self.catalog.get_course(course_id).await?.is_none() {
            return Err(CourseServiceError::CourseNotFound(course_id));
        }

        let mut recipients = Vec::new();
        for enrollment in self.catalog.enrollments_for_course(course_id).await? {
            if let Some(learner) = self.catalog.get_learner(enrollment.learner_id).await? {
                recipients.push(learner.phone);
            }
        }

        Ok(self
            .scheduler
            .schedule_delivery(course_id, recipients, params, now)
            .await?)
    }

    pub async fn schedule(&self, course_id: CourseId) -> Result<Option<CourseSchedule>, StoreError> {
        self.scheduler.schedule(course_id).await
    }
}
