//! Durable per-course schedule state.
//!
//! The running timer is only a cache of this record: every firing reads the
//! stored schedule, acts, and writes it back, so a restarted process resumes
//! from the persisted cursor.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use microlearn_core::{CourseId, PhoneNumber};

use crate::error::StoreError;

use super::rule::ScheduleRule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    /// Every lesson was handed to the queue. Terminal.
    Completed,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Active => "active",
            ScheduleStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(ScheduleStatus::Active),
            "completed" => Some(ScheduleStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseSchedule {
    pub course_id: CourseId,
    pub recipients: Vec<PhoneNumber>,
    pub rule: ScheduleRule,
    /// Index of the next lesson to deliver, in `day` order.
    pub cursor: u32,
    pub total_lessons: u32,
    /// Cursor value the last reminder was sent for.
    pub last_reminder_index: Option<u32>,
    pub status: ScheduleStatus,
    pub next_lesson_at: Option<DateTime<Utc>>,
    pub next_reminder_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CourseSchedule {
    pub fn is_finished(&self) -> bool {
        self.status == ScheduleStatus::Completed || self.cursor >= self.total_lessons
    }

    /// Earliest pending firing, lesson or reminder.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        match (self.next_lesson_at, self.next_reminder_at) {
            (Some(lesson), Some(reminder)) => Some(lesson.min(reminder)),
            (lesson, reminder) => lesson.or(reminder),
        }
    }

    pub(crate) fn complete(&mut self, now: DateTime<Utc>) {
        self.status = ScheduleStatus::Completed;
        self.next_lesson_at = None;
        self.next_reminder_at = None;
        self.updated_at = now;
    }
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Insert or replace the schedule for its course.
    async fn upsert(&self, schedule: &CourseSchedule) -> Result<(), StoreError>;

    async fn get(&self, course_id: CourseId) -> Result<Option<CourseSchedule>, StoreError>;

    async fn list_active(&self) -> Result<Vec<CourseSchedule>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryScheduleStore {
    schedules: RwLock<HashMap<CourseId, CourseSchedule>>,
}

impl InMemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn upsert(&self, schedule: &CourseSchedule) -> Result<(), StoreError> {
        self.schedules
            .write()
            .await
            .insert(schedule.course_id, schedule.clone());
        Ok(())
    }

    async fn get(&self, course_id: CourseId) -> Result<Option<CourseSchedule>, StoreError> {
        Ok(self.schedules.read().await.get(&course_id).cloned())
    }

    async fn list_active(&self) -> Result<Vec<CourseSchedule>, StoreError> {
        let mut active: Vec<CourseSchedule> = self
            .schedules
            .read()
            .await
            .values()
            .filter(|s| s.status == ScheduleStatus::Active)
            .cloned()
            .collect();
        active.sort_by_key(|s| s.created_at);
        Ok(active)
    }
}
