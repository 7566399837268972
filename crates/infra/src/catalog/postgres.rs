//! Postgres-backed catalog store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use microlearn_core::{AdminId, CourseId, LearnerId, LessonId, PhoneNumber, QuizId};
use microlearn_courses::{Course, CourseBundle, CourseStatus, Enrollment, Learner, Lesson, Quiz};

use crate::db::{to_i32, to_u32};
use crate::error::StoreError;

use super::{CatalogStore, EnrollOutcome};

#[derive(Debug, Clone)]
pub struct PostgresCatalogStore {
    pool: Arc<PgPool>,
}

impl PostgresCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

// SQLx row types

#[derive(Debug)]
struct CourseRow {
    id: Uuid,
    name: String,
    description: String,
    status: String,
    published_at: Option<DateTime<Utc>>,
    total_lessons: i32,
    total_quizzes: i32,
    admin_id: Uuid,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for CourseRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(CourseRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            status: row.try_get("status")?,
            published_at: row.try_get("published_at")?,
            total_lessons: row.try_get("total_lessons")?,
            total_quizzes: row.try_get("total_quizzes")?,
            admin_id: row.try_get("admin_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<CourseRow> for Course {
    type Error = StoreError;

    fn try_from(row: CourseRow) -> Result<Self, Self::Error> {
        Ok(Course {
            id: CourseId::from_uuid(row.id),
            name: row.name,
            description: row.description,
            status: CourseStatus::parse(&row.status)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            published_at: row.published_at,
            total_lessons: to_u32(row.total_lessons),
            total_quizzes: to_u32(row.total_quizzes),
            admin_id: AdminId::from_uuid(row.admin_id),
            created_at: row.created_at,
        })
    }
}

#[derive(Debug)]
struct LessonRow {
    id: Uuid,
    course_id: Uuid,
    title: String,
    content: String,
    day: i32,
    document: Option<String>,
    media: Option<String>,
    external_link: Option<String>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for LessonRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(LessonRow {
            id: row.try_get("id")?,
            course_id: row.try_get("course_id")?,
            title: row.try_get("title")?,
            content: row.try_get("content")?,
            day: row.try_get("day")?,
            document: row.try_get("document")?,
            media: row.try_get("media")?,
            external_link: row.try_get("external_link")?,
        })
    }
}

impl From<LessonRow> for Lesson {
    fn from(row: LessonRow) -> Self {
        Lesson {
            id: LessonId::from_uuid(row.id),
            course_id: CourseId::from_uuid(row.course_id),
            title: row.title,
            content: row.content,
            day: to_u32(row.day),
            document: row.document,
            media: row.media,
            external_link: row.external_link,
        }
    }
}

#[derive(Debug)]
struct QuizRow {
    id: Uuid,
    lesson_id: Uuid,
    question: String,
    options: serde_json::Value,
    correct_option: String,
}

impl<'r> sqlx::FromRow<'r, PgRow> for QuizRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(QuizRow {
            id: row.try_get("id")?,
            lesson_id: row.try_get("lesson_id")?,
            question: row.try_get("question")?,
            options: row.try_get("options")?,
            correct_option: row.try_get("correct_option")?,
        })
    }
}

impl TryFrom<QuizRow> for Quiz {
    type Error = StoreError;

    fn try_from(row: QuizRow) -> Result<Self, Self::Error> {
        Ok(Quiz {
            id: QuizId::from_uuid(row.id),
            lesson_id: LessonId::from_uuid(row.lesson_id),
            question: row.question,
            options: serde_json::from_value(row.options)?,
            correct_option: row.correct_option,
        })
    }
}

fn learner_from_row(row: &PgRow) -> Result<Learner, StoreError> {
    let decode = |e: sqlx::Error| StoreError::from_sqlx("decode_learner", e);
    let phone: String = row.try_get("phone").map_err(decode)?;
    Ok(Learner {
        id: LearnerId::from_uuid(row.try_get("id").map_err(decode)?),
        name: row.try_get("name").map_err(decode)?,
        phone: PhoneNumber::parse(&phone).map_err(|e| StoreError::Serialization(e.to_string()))?,
    })
}

fn enrollment_from_row(row: &PgRow) -> Result<Enrollment, StoreError> {
    let decode = |e: sqlx::Error| StoreError::from_sqlx("decode_enrollment", e);
    Ok(Enrollment {
        learner_id: LearnerId::from_uuid(row.try_get("learner_id").map_err(decode)?),
        course_id: CourseId::from_uuid(row.try_get("course_id").map_err(decode)?),
        enrolled_at: row.try_get("enrolled_at").map_err(decode)?,
    })
}

const LESSON_COLUMNS: &str =
    "id, course_id, title, content, day, document, media, external_link";

#[async_trait]
impl CatalogStore for PostgresCatalogStore {
    #[instrument(skip(self, bundle), fields(course_id = %bundle.course.id, lessons = bundle.lessons.len()), err)]
    async fn insert_course_bundle(&self, bundle: &CourseBundle) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::from_sqlx("insert_course_bundle_begin", e))?;

        let course = &bundle.course;
        sqlx::query(
            r#"
            INSERT INTO courses (
                id, name, description, status, published_at,
                total_lessons, total_quizzes, admin_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(course.id.as_uuid())
        .bind(&course.name)
        .bind(&course.description)
        .bind(course.status.as_str())
        .bind(course.published_at)
        .bind(to_i32(course.total_lessons))
        .bind(to_i32(course.total_quizzes))
        .bind(course.admin_id.as_uuid())
        .bind(course.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::from_sqlx("insert_course", e))?;

        for lesson in &bundle.lessons {
            sqlx::query(
                r#"
                INSERT INTO lessons (id, course_id, title, content, day, document, media, external_link)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(lesson.id.as_uuid())
            .bind(lesson.course_id.as_uuid())
            .bind(&lesson.title)
            .bind(&lesson.content)
            .bind(to_i32(lesson.day))
            .bind(&lesson.document)
            .bind(&lesson.media)
            .bind(&lesson.external_link)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::from_sqlx("insert_lesson", e))?;
        }

        for quiz in &bundle.quizzes {
            sqlx::query(
                r#"
                INSERT INTO quizzes (id, lesson_id, question, options, correct_option)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(quiz.id.as_uuid())
            .bind(quiz.lesson_id.as_uuid())
            .bind(&quiz.question)
            .bind(serde_json::to_value(&quiz.options)?)
            .bind(&quiz.correct_option)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::from_sqlx("insert_quiz", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::from_sqlx("insert_course_bundle_commit", e))
    }

    async fn get_course(&self, course_id: CourseId) -> Result<Option<Course>, StoreError> {
        let row = sqlx::query_as::<_, CourseRow>(
            r#"
            SELECT id, name, description, status, published_at,
                   total_lessons, total_quizzes, admin_id, created_at
            FROM courses WHERE id = $1
            "#,
        )
        .bind(course_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("get_course", e))?;

        row.map(Course::try_from).transpose()
    }

    async fn update_course(&self, course: &Course) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE courses SET status = $2, published_at = $3 WHERE id = $1")
            .bind(course.id.as_uuid())
            .bind(course.status.as_str())
            .bind(course.published_at)
            .execute(&*self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx("update_course", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("course", course.id));
        }
        Ok(())
    }

    async fn lessons_for_course(&self, course_id: CourseId) -> Result<Vec<Lesson>, StoreError> {
        let rows = sqlx::query_as::<_, LessonRow>(&format!(
            "SELECT {LESSON_COLUMNS} FROM lessons WHERE course_id = $1 ORDER BY day ASC"
        ))
        .bind(course_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("lessons_for_course", e))?;

        Ok(rows.into_iter().map(Lesson::from).collect())
    }

    async fn get_lesson(&self, lesson_id: LessonId) -> Result<Option<Lesson>, StoreError> {
        let row = sqlx::query_as::<_, LessonRow>(&format!(
            "SELECT {LESSON_COLUMNS} FROM lessons WHERE id = $1"
        ))
        .bind(lesson_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("get_lesson", e))?;

        Ok(row.map(Lesson::from))
    }

    async fn quiz_for_lesson(&self, lesson_id: LessonId) -> Result<Option<Quiz>, StoreError> {
        let row = sqlx::query_as::<_, QuizRow>(
            "SELECT id, lesson_id, question, options, correct_option FROM quizzes WHERE lesson_id = $1",
        )
        .bind(lesson_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("quiz_for_lesson", e))?;

        row.map(Quiz::try_from).transpose()
    }

    async fn upsert_learner(&self, name: &str, phone: &PhoneNumber) -> Result<Learner, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO learners (id, name, phone)
            VALUES ($1, $2, $3)
            ON CONFLICT (phone) DO UPDATE SET name = learners.name
            RETURNING id, name, phone
            "#,
        )
        .bind(LearnerId::new().as_uuid())
        .bind(name.trim())
        .bind(phone.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("upsert_learner", e))?;

        learner_from_row(&row)
    }

    async fn get_learner(&self, learner_id: LearnerId) -> Result<Option<Learner>, StoreError> {
        let row = sqlx::query("SELECT id, name, phone FROM learners WHERE id = $1")
            .bind(learner_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx("get_learner", e))?;

        row.as_ref().map(learner_from_row).transpose()
    }

    async fn find_learner_by_phone(
        &self,
        phone: &PhoneNumber,
    ) -> Result<Option<Learner>, StoreError> {
        let row = sqlx::query("SELECT id, name, phone FROM learners WHERE phone = $1")
            .bind(phone.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx("find_learner_by_phone", e))?;

        row.as_ref().map(learner_from_row).transpose()
    }

    #[instrument(skip(self, now), err)]
    async fn enroll(
        &self,
        learner_id: LearnerId,
        course_id: CourseId,
        now: DateTime<Utc>,
    ) -> Result<EnrollOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::from_sqlx("enroll_begin", e))?;

        // Serialise concurrent enrollments of the same learner so the
        // first-enrollment check stays accurate.
        sqlx::query("SELECT id FROM learners WHERE id = $1 FOR UPDATE")
            .bind(learner_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::from_sqlx("enroll_lock_learner", e))?
            .ok_or_else(|| StoreError::not_found("learner", learner_id))?;

        let prior: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM enrollments WHERE learner_id = $1")
            .bind(learner_id.as_uuid())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| StoreError::from_sqlx("enroll_count", e))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO enrollments (learner_id, course_id, enrolled_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (learner_id, course_id) DO NOTHING
            RETURNING learner_id, course_id, enrolled_at
            "#,
        )
        .bind(learner_id.as_uuid())
        .bind(course_id.as_uuid())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::from_sqlx("enroll_insert", e))?;

        let outcome = match inserted {
            Some(row) => EnrollOutcome {
                enrollment: enrollment_from_row(&row)?,
                created: true,
                first_enrollment: prior == 0,
            },
            None => {
                let row = sqlx::query(
                    "SELECT learner_id, course_id, enrolled_at FROM enrollments WHERE learner_id = $1 AND course_id = $2",
                )
                .bind(learner_id.as_uuid())
                .bind(course_id.as_uuid())
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| StoreError::from_sqlx("enroll_existing", e))?;
                EnrollOutcome {
                    enrollment: enrollment_from_row(&row)?,
                    created: false,
                    first_enrollment: false,
                }
            }
        };

        tx.commit()
            .await
            .map_err(|e| StoreError::from_sqlx("enroll_commit", e))?;
        Ok(outcome)
    }

    async fn enrollments_for_course(
        &self,
        course_id: CourseId,
    ) -> Result<Vec<Enrollment>, StoreError> {
        let rows = sqlx::query(
            "SELECT learner_id, course_id, enrolled_at FROM enrollments WHERE course_id = $1 ORDER BY enrolled_at",
        )
        .bind(course_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("enrollments_for_course", e))?;

        rows.iter().map(enrollment_from_row).collect()
    }
}
