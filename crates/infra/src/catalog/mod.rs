//! Course catalog persistence: courses, lessons, quizzes, learners and
//! enrollments.

pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use microlearn_core::{CourseId, LearnerId, LessonId, PhoneNumber};
use microlearn_courses::{Course, CourseBundle, Enrollment, Learner, Lesson, Quiz};

use crate::error::StoreError;

pub use postgres::PostgresCatalogStore;

/// Result of [`CatalogStore::enroll`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrollOutcome {
    pub enrollment: Enrollment,
    /// `false` when the learner was already enrolled in the course.
    pub created: bool,
    /// `true` when this is the learner's first enrollment in any course.
    pub first_enrollment: bool,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Persist a course with all of its lessons and quizzes atomically.
    async fn insert_course_bundle(&self, bundle: &CourseBundle) -> Result<(), StoreError>;

    async fn get_course(&self, course_id: CourseId) -> Result<Option<Course>, StoreError>;

    /// Persist a status change (publish/archive).
    async fn update_course(&self, course: &Course) -> Result<(), StoreError>;

    /// Lessons of a course in ascending `day` order.
    async fn lessons_for_course(&self, course_id: CourseId) -> Result<Vec<Lesson>, StoreError>;

    async fn get_lesson(&self, lesson_id: LessonId) -> Result<Option<Lesson>, StoreError>;

    async fn quiz_for_lesson(&self, lesson_id: LessonId) -> Result<Option<Quiz>, StoreError>;

    /// Find the learner with this phone number, creating one when absent.
    /// An existing learner keeps their stored name.
    async fn upsert_learner(&self, name: &str, phone: &PhoneNumber) -> Result<Learner, StoreError>;

    async fn get_learner(&self, learner_id: LearnerId) -> Result<Option<Learner>, StoreError>;

    async fn find_learner_by_phone(
        &self,
        phone: &PhoneNumber,
    ) -> Result<Option<Learner>, StoreError>;

    /// Enroll a learner. Enrolling twice is a no-op that returns the
    /// existing enrollment.
    async fn enroll(
        &self,
        learner_id: LearnerId,
        course_id: CourseId,
        now: DateTime<Utc>,
    ) -> Result<EnrollOutcome, StoreError>;

    async fn enrollments_for_course(
        &self,
        course_id: CourseId,
    ) -> Result<Vec<Enrollment>, StoreError>;
}

#[derive(Debug, Default)]
struct CatalogState {
    courses: HashMap<CourseId, Course>,
    lessons: HashMap<LessonId, Lesson>,
    quizzes: HashMap<LessonId, Quiz>,
    learners: HashMap<LearnerId, Learner>,
    enrollments: HashMap<(LearnerId, CourseId), Enrollment>,
}

/// In-memory catalog for tests and development.
#[derive(Debug, Default)]
pub struct InMemoryCatalogStore {
    state: RwLock<CatalogState>,
}

impl InMemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CatalogStore for InMemoryCatalogStore {
    async fn insert_course_bundle(&self, bundle: &CourseBundle) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.courses.contains_key(&bundle.course.id) {
            return Err(StoreError::Conflict(format!(
                "course {} already exists",
                bundle.course.id
            )));
        }

        state.courses.insert(bundle.course.id, bundle.course.clone());
        for lesson in &bundle.lessons {
            state.lessons.insert(lesson.id, lesson.clone());
        }
        for quiz in &bundle.quizzes {
            state.quizzes.insert(quiz.lesson_id, quiz.clone());
        }
        Ok(())
    }

    async fn get_course(&self, course_id: CourseId) -> Result<Option<Course>, StoreError> {
        Ok(self.state.read().await.courses.get(&course_id).cloned())
    }

    async fn update_course(&self, course: &Course) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        match state.courses.get_mut(&course.id) {
            Some(stored) => {
                *stored = course.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("course", course.id)),
        }
    }

    async fn lessons_for_course(&self, course_id: CourseId) -> Result<Vec<Lesson>, StoreError> {
        let state = self.state.read().await;
        let mut lessons: Vec<Lesson> = state
            .lessons
            .values()
            .filter(|l| l.course_id == course_id)
            .cloned()
            .collect();
        lessons.sort_by_key(|l| l.day);
        Ok(lessons)
    }

    async fn get_lesson(&self, lesson_id: LessonId) -> Result<Option<Lesson>, StoreError> {
        Ok(self.state.read().await.lessons.get(&lesson_id).cloned())
    }

    async fn quiz_for_lesson(&self, lesson_id: LessonId) -> Result<Option<Quiz>, StoreError> {
        Ok(self.state.read().await.quizzes.get(&lesson_id).cloned())
    }

    async fn upsert_learner(&self, name: &str, phone: &PhoneNumber) -> Result<Learner, StoreError> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.learners.values().find(|l| &l.phone == phone) {
            return Ok(existing.clone());
        }

        let learner = Learner {
            id: LearnerId::new(),
            name: name.trim().to_string(),
            phone: phone.clone(),
        };
        state.learners.insert(learner.id, learner.clone());
        Ok(learner)
    }

    async fn get_learner(&self, learner_id: LearnerId) -> Result<Option<Learner>, StoreError> {
        Ok(self.state.read().await.learners.get(&learner_id).cloned())
    }

    async fn find_learner_by_phone(
        &self,
        phone: &PhoneNumber,
    ) -> Result<Option<Learner>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .learners
            .values()
            .find(|l| &l.phone == phone)
            .cloned())
    }

    async fn enroll(
        &self,
        learner_id: LearnerId,
        course_id: CourseId,
        now: DateTime<Utc>,
    ) -> Result<EnrollOutcome, StoreError> {
        let mut state = self.state.write().await;
        if !state.learners.contains_key(&learner_id) {
            return Err(StoreError::not_found("learner", learner_id));
        }
        if !state.courses.contains_key(&course_id) {
            return Err(StoreError::not_found("course", course_id));
        }

        if let Some(existing) = state.enrollments.get(&(learner_id, course_id)) {
            return Ok(EnrollOutcome {
                enrollment: existing.clone(),
                created: false,
                first_enrollment: false,
            });
        }

        let first_enrollment = !state.enrollments.keys().any(|(l, _)| *l == learner_id);
        let enrollment = Enrollment {
            learner_id,
            course_id,
            enrolled_at: now,
        };
        state
            .enrollments
            .insert((learner_id, course_id), enrollment.clone());

        Ok(EnrollOutcome {
            enrollment,
            created: true,
            first_enrollment,
        })
    }

    async fn enrollments_for_course(
        &self,
        course_id: CourseId,
    ) -> Result<Vec<Enrollment>, StoreError> {
        let state = self.state.read().await;
        let mut enrollments: Vec<Enrollment> = state
            .enrollments
            .values()
            .filter(|e| e.course_id == course_id)
            .cloned()
            .collect();
        enrollments.sort_by_key(|e| e.enrolled_at);
        Ok(enrollments)
    }
}
