//! Job payloads, one per lane.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use microlearn_core::{CourseId, LearnerId, LessonId, PhoneNumber};

/// Full lesson sequence for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonJob {
    pub course_id: CourseId,
    pub lesson_id: LessonId,
    pub phone: PhoneNumber,
}

impl LessonJob {
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", self.course_id, self.lesson_id, self.phone)
    }
}

/// Heads-up for the next lesson.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderJob {
    pub course_id: CourseId,
    pub lesson_id: LessonId,
    pub phone: PhoneNumber,
    /// When the announced lesson is due.
    #[serde(default)]
    pub lesson_at: Option<DateTime<Utc>>,
}

impl ReminderJob {
    pub fn idempotency_key(&self) -> String {
        format!("reminder:{}:{}:{}", self.course_id, self.lesson_id, self.phone)
    }
}

/// "You have been enrolled in ..." announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationJob {
    pub course_id: CourseId,
    pub learner_id: LearnerId,
    pub phone: PhoneNumber,
    pub learner_name: String,
}

impl NotificationJob {
    pub fn idempotency_key(&self) -> String {
        format!("notification:{}:{}", self.course_id, self.learner_id)
    }
}

/// Greeting for a learner's first enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WelcomeJob {
    pub learner_id: LearnerId,
    pub phone: PhoneNumber,
    pub name: String,
}

impl WelcomeJob {
    pub fn idempotency_key(&self) -> String {
        format!("welcome:{}", self.learner_id)
    }
}

/// Plain text: quiz feedback, progress updates, fallback replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextJob {
    pub phone: PhoneNumber,
    pub body: String,
    #[serde(default)]
    pub course_id: Option<CourseId>,
}
