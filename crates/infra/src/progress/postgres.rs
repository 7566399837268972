//! Postgres-backed progress store.
//!
//! Every operation runs in one transaction. Counters are updated in place
//! with `LEAST(counter + 1, total)`; the course row is locked with
//! `FOR UPDATE` first so "did this call complete the course" is exact.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use microlearn_core::{CourseId, LearnerId, LessonId};
use microlearn_progress::{CourseProgress, LessonProgress};

use crate::db::{to_i32, to_u32};
use crate::error::StoreError;

use super::{ProgressKey, ProgressSnapshot, ProgressStore, QuizAnswer};

#[derive(Debug, Clone)]
pub struct PostgresProgressStore {
    pool: Arc<PgPool>,
}

impl PostgresProgressStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn course_progress_from_row(row: &PgRow) -> Result<CourseProgress, StoreError> {
    let decode = |e: sqlx::Error| StoreError::from_sqlx("decode_course_progress", e);
    Ok(CourseProgress {
        learner_id: LearnerId::from_uuid(row.try_get("learner_id").map_err(decode)?),
        course_id: CourseId::from_uuid(row.try_get("course_id").map_err(decode)?),
        completed_lessons: to_u32(row.try_get("completed_lessons").map_err(decode)?),
        progress_percent: to_u32(row.try_get("progress_percent").map_err(decode)?),
        correct_answers: to_u32(row.try_get("correct_answers").map_err(decode)?),
        quiz_score: to_u32(row.try_get("quiz_score").map_err(decode)?),
        is_completed: row.try_get("is_completed").map_err(decode)?,
        completed_at: row.try_get("completed_at").map_err(decode)?,
    })
}

fn lesson_progress_from_row(row: &PgRow) -> Result<LessonProgress, StoreError> {
    let decode = |e: sqlx::Error| StoreError::from_sqlx("decode_lesson_progress", e);
    let quiz_score: Option<i32> = row.try_get("quiz_score").map_err(decode)?;
    Ok(LessonProgress {
        learner_id: LearnerId::from_uuid(row.try_get("learner_id").map_err(decode)?),
        lesson_id: LessonId::from_uuid(row.try_get("lesson_id").map_err(decode)?),
        course_id: CourseId::from_uuid(row.try_get("course_id").map_err(decode)?),
        is_completed: row.try_get("is_completed").map_err(decode)?,
        completed_at: row.try_get("completed_at").map_err(decode)?,
        quiz_score: quiz_score.map(to_u32),
        quiz_reply: row.try_get("quiz_reply").map_err(decode)?,
    })
}

const COURSE_PROGRESS_COLUMNS: &str = "learner_id, course_id, completed_lessons, progress_percent, \
                                       correct_answers, quiz_score, is_completed, completed_at";
const LESSON_PROGRESS_COLUMNS: &str =
    "learner_id, lesson_id, course_id, is_completed, completed_at, quiz_score, quiz_reply";

/// Create missing rows and lock the course row. Returns whether the course
/// was already complete.
async fn ensure_rows(
    tx: &mut Transaction<'_, Postgres>,
    key: ProgressKey,
) -> Result<bool, StoreError> {
    sqlx::query(
        r#"
        INSERT INTO course_progress (learner_id, course_id)
        VALUES ($1, $2)
        ON CONFLICT (learner_id, course_id) DO NOTHING
        "#,
    )
    .bind(key.learner_id.as_uuid())
    .bind(key.course_id.as_uuid())
    .execute(&mut **tx)
    .await
    .map_err(|e| StoreError::from_sqlx("ensure_course_progress", e))?;

    sqlx::query(
        r#"
        INSERT INTO lesson_progress (learner_id, lesson_id, course_id)
        VALUES ($1, $2, $3)
        ON CONFLICT (learner_id, lesson_id) DO NOTHING
        "#,
    )
    .bind(key.learner_id.as_uuid())
    .bind(key.lesson_id.as_uuid())
    .bind(key.course_id.as_uuid())
    .execute(&mut **tx)
    .await
    .map_err(|e| StoreError::from_sqlx("ensure_lesson_progress", e))?;

    sqlx::query_scalar(
        "SELECT is_completed FROM course_progress WHERE learner_id = $1 AND course_id = $2 FOR UPDATE",
    )
    .bind(key.learner_id.as_uuid())
    .bind(key.course_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| StoreError::from_sqlx("lock_course_progress", e))
}

/// Complete the lesson and bump the course counter if it was not complete.
async fn complete_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    key: ProgressKey,
    total_lessons: u32,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let newly = sqlx::query(
        r#"
        UPDATE lesson_progress
        SET is_completed = TRUE, completed_at = $3
        WHERE learner_id = $1 AND lesson_id = $2 AND NOT is_completed
        "#,
    )
    .bind(key.learner_id.as_uuid())
    .bind(key.lesson_id.as_uuid())
    .bind(now)
    .execute(&mut **tx)
    .await
    .map_err(|e| StoreError::from_sqlx("complete_lesson_progress", e))?
    .rows_affected()
        > 0;

    if newly {
        sqlx::query(
            r#"
            UPDATE course_progress
            SET completed_lessons = LEAST(completed_lessons + 1, $3),
                progress_percent = COALESCE(
                    ROUND(LEAST(completed_lessons + 1, $3) * 100.0 / NULLIF($3, 0))::INTEGER, 0),
                is_completed = is_completed OR ($3 > 0 AND completed_lessons + 1 >= $3),
                completed_at = CASE
                    WHEN NOT is_completed AND $3 > 0 AND completed_lessons + 1 >= $3 THEN $4
                    ELSE completed_at
                END
            WHERE learner_id = $1 AND course_id = $2
            "#,
        )
        .bind(key.learner_id.as_uuid())
        .bind(key.course_id.as_uuid())
        .bind(to_i32(total_lessons))
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| StoreError::from_sqlx("increment_completed_lessons", e))?;
    }
    Ok(newly)
}

async fn snapshot_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    key: ProgressKey,
) -> Result<(CourseProgress, LessonProgress), StoreError> {
    let course = sqlx::query(&format!(
        "SELECT {COURSE_PROGRESS_COLUMNS} FROM course_progress WHERE learner_id = $1 AND course_id = $2"
    ))
    .bind(key.learner_id.as_uuid())
    .bind(key.course_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| StoreError::from_sqlx("read_course_progress", e))?;

    let lesson = sqlx::query(&format!(
        "SELECT {LESSON_PROGRESS_COLUMNS} FROM lesson_progress WHERE learner_id = $1 AND lesson_id = $2"
    ))
    .bind(key.learner_id.as_uuid())
    .bind(key.lesson_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| StoreError::from_sqlx("read_lesson_progress", e))?;

    Ok((
        course_progress_from_row(&course)?,
        lesson_progress_from_row(&lesson)?,
    ))
}

#[async_trait]
impl ProgressStore for PostgresProgressStore {
    #[instrument(skip(self, now), err)]
    async fn complete_lesson(
        &self,
        key: ProgressKey,
        total_lessons: u32,
        now: DateTime<Utc>,
    ) -> Result<ProgressSnapshot, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::from_sqlx("complete_lesson_begin", e))?;

        let was_completed = ensure_rows(&mut tx, key).await?;
        let lesson_newly_completed = complete_in_tx(&mut tx, key, total_lessons, now).await?;
        let (course, lesson) = snapshot_in_tx(&mut tx, key).await?;

        tx.commit()
            .await
            .map_err(|e| StoreError::from_sqlx("complete_lesson_commit", e))?;

        Ok(ProgressSnapshot {
            course_newly_completed: !was_completed && course.is_completed,
            course,
            lesson,
            lesson_newly_completed,
            answer_recorded: false,
        })
    }

    #[instrument(skip(self, answer, now), fields(correct = answer.correct), err)]
    async fn record_quiz_answer(
        &self,
        key: ProgressKey,
        answer: QuizAnswer<'_>,
        total_lessons: u32,
        now: DateTime<Utc>,
    ) -> Result<ProgressSnapshot, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::from_sqlx("record_quiz_answer_begin", e))?;

        let was_completed = ensure_rows(&mut tx, key).await?;

        let answer_recorded = sqlx::query(
            r#"
            UPDATE lesson_progress
            SET quiz_score = $3, quiz_reply = $4
            WHERE learner_id = $1 AND lesson_id = $2 AND quiz_score IS NULL
            "#,
        )
        .bind(key.learner_id.as_uuid())
        .bind(key.lesson_id.as_uuid())
        .bind(if answer.correct { 100_i32 } else { 0_i32 })
        .bind(answer.reply)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::from_sqlx("record_quiz_answer", e))?
        .rows_affected()
            > 0;

        if answer_recorded && answer.correct {
            sqlx::query(
                r#"
                UPDATE course_progress
                SET correct_answers = LEAST(correct_answers + 1, $3),
                    quiz_score = COALESCE(
                        ROUND(LEAST(correct_answers + 1, $3) * 100.0 / NULLIF($3, 0))::INTEGER, 0)
                WHERE learner_id = $1 AND course_id = $2
                "#,
            )
            .bind(key.learner_id.as_uuid())
            .bind(key.course_id.as_uuid())
            .bind(to_i32(answer.total_quizzes))
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::from_sqlx("increment_correct_answers", e))?;
        }

        let lesson_newly_completed = complete_in_tx(&mut tx, key, total_lessons, now).await?;
        let (course, lesson) = snapshot_in_tx(&mut tx, key).await?;

        tx.commit()
            .await
            .map_err(|e| StoreError::from_sqlx("record_quiz_answer_commit", e))?;

        Ok(ProgressSnapshot {
            course_newly_completed: !was_completed && course.is_completed,
            course,
            lesson,
            lesson_newly_completed,
            answer_recorded,
        })
    }

    async fn course_progress(
        &self,
        learner_id: LearnerId,
        course_id: CourseId,
    ) -> Result<Option<CourseProgress>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COURSE_PROGRESS_COLUMNS} FROM course_progress WHERE learner_id = $1 AND course_id = $2"
        ))
        .bind(learner_id.as_uuid())
        .bind(course_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("course_progress", e))?;

        row.as_ref().map(course_progress_from_row).transpose()
    }

    async fn lesson_progress(
        &self,
        learner_id: LearnerId,
        lesson_id: LessonId,
    ) -> Result<Option<LessonProgress>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {LESSON_PROGRESS_COLUMNS} FROM lesson_progress WHERE learner_id = $1 AND lesson_id = $2"
        ))
        .bind(learner_id.as_uuid())
        .bind(lesson_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("lesson_progress", e))?;

        row.as_ref().map(lesson_progress_from_row).transpose()
    }
}
