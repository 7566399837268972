//! Lesson scheduler: turns a course's delivery rule into timed lesson and
//! reminder jobs.

pub mod postgres;
pub mod rule;
pub mod service;
pub mod store;

use thiserror::Error;

use microlearn_core::CourseId;

use crate::error::StoreError;
use crate::jobs::JobStoreError;

pub use postgres::PostgresScheduleStore;
pub use rule::{DeliveryFrequency, REMINDER_LEAD, ScheduleParams, ScheduleRule, TimeOfDay, Timezone};
pub use service::{FireOutcome, LessonScheduler, ScheduleResult};
pub use store::{CourseSchedule, InMemoryScheduleStore, ScheduleStatus, ScheduleStore};

#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    #[error("invalid time of day (expected HH:MM): {0}")]
    InvalidTimeOfDay(String),

    #[error("invalid frequency (expected daily, weekly or monthly): {0}")]
    InvalidFrequency(String),

    #[error("invalid start date: {0}")]
    InvalidStartDate(String),

    #[error("invalid timezone (expected UTC or +HH:MM): {0}")]
    InvalidTimezone(String),

    #[error("schedule has no upcoming occurrence")]
    NoUpcomingOccurrence,

    #[error("course not found: {0}")]
    CourseNotFound(CourseId),

    #[error("no schedule for course: {0}")]
    ScheduleNotFound(CourseId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to enqueue job: {0}")]
    Queue(#[from] JobStoreError),
}

impl SchedulerError {
    /// Whether the caller supplied bad scheduling parameters.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SchedulerError::InvalidTimeOfDay(_)
                | SchedulerError::InvalidFrequency(_)
                | SchedulerError::InvalidStartDate(_)
                | SchedulerError::InvalidTimezone(_)
                | SchedulerError::NoUpcomingOccurrence
        )
    }
}
