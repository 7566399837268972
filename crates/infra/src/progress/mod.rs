//! Learner progress persistence and the progress tracker.
//!
//! Store operations are atomic per call: counters are incremented in place
//! (never read-modify-written by callers) and clamped to the course totals,
//! so duplicate or concurrent replies from one learner cannot overshoot.

pub mod postgres;
pub mod tracker;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use microlearn_core::{CourseId, LearnerId, LessonId};
use microlearn_progress::{CourseProgress, LessonProgress};

use crate::error::StoreError;

pub use postgres::PostgresProgressStore;
pub use tracker::{ProgressOutcome, ProgressTracker, ProgressUpdate};

/// Identifies the (learner, course, lesson) a progress event applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressKey {
    pub learner_id: LearnerId,
    pub course_id: CourseId,
    pub lesson_id: LessonId,
}

/// Both progress rows after an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub course: CourseProgress,
    pub lesson: LessonProgress,
    /// The lesson went from incomplete to complete in this call.
    pub lesson_newly_completed: bool,
    /// The course went from incomplete to complete in this call.
    pub course_newly_completed: bool,
    /// This call stored the lesson's quiz answer (false for repeats).
    pub answer_recorded: bool,
}

/// A quiz answer to record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuizAnswer<'a> {
    pub reply: &'a str,
    pub correct: bool,
    pub total_quizzes: u32,
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Mark a lesson complete, creating both rows on first touch. The course
    /// counter moves only when the lesson was not complete before.
    async fn complete_lesson(
        &self,
        key: ProgressKey,
        total_lessons: u32,
        now: DateTime<Utc>,
    ) -> Result<ProgressSnapshot, StoreError>;

    /// Record a lesson's quiz answer (first answer wins) and complete the lesson.
    async fn record_quiz_answer(
        &self,
        key: ProgressKey,
        answer: QuizAnswer<'_>,
        total_lessons: u32,
        now: DateTime<Utc>,
    ) -> Result<ProgressSnapshot, StoreError>;

    async fn course_progress(
        &self,
        learner_id: LearnerId,
        course_id: CourseId,
    ) -> Result<Option<CourseProgress>, StoreError>;

    async fn lesson_progress(
        &self,
        learner_id: LearnerId,
        lesson_id: LessonId,
    ) -> Result<Option<LessonProgress>, StoreError>;
}

#[derive(Debug, Default)]
struct ProgressState {
    courses: HashMap<(LearnerId, CourseId), CourseProgress>,
    lessons: HashMap<(LearnerId, LessonId), LessonProgress>,
}

impl ProgressState {
    fn rows(&mut self, key: ProgressKey) -> (&mut CourseProgress, &mut LessonProgress) {
        let course = self
            .courses
            .entry((key.learner_id, key.course_id))
            .or_insert_with(|| CourseProgress::new(key.learner_id, key.course_id));
        let lesson = self
            .lessons
            .entry((key.learner_id, key.lesson_id))
            .or_insert_with(|| LessonProgress::new(key.learner_id, key.lesson_id, key.course_id));
        (course, lesson)
    }
}

/// In-memory progress store. One lock covers both tables so each call is atomic.
#[derive(Debug, Default)]
pub struct InMemoryProgressStore {
    state: Mutex<ProgressState>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn complete(
    course: &mut CourseProgress,
    lesson: &mut LessonProgress,
    total_lessons: u32,
    now: DateTime<Utc>,
) -> (bool, bool) {
    if !lesson.complete(now) {
        return (false, false);
    }
    let course_done = course.record_lesson_completed(total_lessons, now);
    (true, course_done)
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn complete_lesson(
        &self,
        key: ProgressKey,
        total_lessons: u32,
        now: DateTime<Utc>,
    ) -> Result<ProgressSnapshot, StoreError> {
        let mut state = self.state.lock().await;
        let (course, lesson) = state.rows(key);
        let (lesson_newly_completed, course_newly_completed) =
            complete(course, lesson, total_lessons, now);

        Ok(ProgressSnapshot {
            course: course.clone(),
            lesson: lesson.clone(),
            lesson_newly_completed,
            course_newly_completed,
            answer_recorded: false,
        })
    }

    async fn record_quiz_answer(
        &self,
        key: ProgressKey,
        answer: QuizAnswer<'_>,
        total_lessons: u32,
        now: DateTime<Utc>,
    ) -> Result<ProgressSnapshot, StoreError> {
        let mut state = self.state.lock().await;
        let (course, lesson) = state.rows(key);

        let answer_recorded = lesson.record_answer(answer.reply, answer.correct);
        if answer_recorded && answer.correct {
            course.record_correct_answer(answer.total_quizzes);
        }
        let (lesson_newly_completed, course_newly_completed) =
            complete(course, lesson, total_lessons, now);

        Ok(ProgressSnapshot {
            course: course.clone(),
            lesson: lesson.clone(),
            lesson_newly_completed,
            course_newly_completed,
            answer_recorded,
        })
    }

    async fn course_progress(
        &self,
        learner_id: LearnerId,
        course_id: CourseId,
    ) -> Result<Option<CourseProgress>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .courses
            .get(&(learner_id, course_id))
            .cloned())
    }

    async fn lesson_progress(
        &self,
        learner_id: LearnerId,
        lesson_id: LessonId,
    ) -> Result<Option<LessonProgress>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .lessons
            .get(&(learner_id, lesson_id))
            .cloned())
    }
}
