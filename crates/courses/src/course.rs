use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use microlearn_core::{AdminId, CourseId, DomainError, DomainResult, Entity};

/// Publication status of a course.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CourseStatus {
    Draft,
    Published,
    Archived,
}

impl CourseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CourseStatus::Draft => "DRAFT",
            CourseStatus::Published => "PUBLISHED",
            CourseStatus::Archived => "ARCHIVED",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "DRAFT" => Ok(CourseStatus::Draft),
            "PUBLISHED" => Ok(CourseStatus::Published),
            "ARCHIVED" => Ok(CourseStatus::Archived),
            other => Err(DomainError::validation(format!(
                "unknown course status: {other}"
            ))),
        }
    }

    /// Allowed transitions: DRAFT→PUBLISHED, DRAFT→ARCHIVED, PUBLISHED→ARCHIVED.
    pub fn can_transition_to(self, next: CourseStatus) -> bool {
        matches!(
            (self, next),
            (CourseStatus::Draft, CourseStatus::Published)
                | (CourseStatus::Draft, CourseStatus::Archived)
                | (CourseStatus::Published, CourseStatus::Archived)
        )
    }
}

/// A course: an ordered set of lessons delivered to enrolled learners.
///
/// `total_lessons` / `total_quizzes` are denormalized counts fixed at
/// creation time from the authoring bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub id: CourseId,
    pub name: String,
    pub description: String,
    pub status: CourseStatus,
    pub published_at: Option<DateTime<Utc>>,
    pub total_lessons: u32,
    pub total_quizzes: u32,
    pub admin_id: AdminId,
    pub created_at: DateTime<Utc>,
}

impl Course {
    pub fn transition(&mut self, next: CourseStatus, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::conflict(format!(
                "course {} cannot move from {} to {}",
                self.id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        if next == CourseStatus::Published {
            self.published_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    pub fn publish(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(CourseStatus::Published, now)
    }

    pub fn archive(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(CourseStatus::Archived, now)
    }
}

impl Entity for Course {
    type Id = CourseId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
