use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use microlearn_core::{CourseId, LessonId, PhoneNumber, QuizId};

use crate::error::StoreError;

use super::{ReplyContext, ReplyContextStore};

#[derive(Debug, Clone)]
pub struct PostgresReplyContextStore {
    pool: Arc<PgPool>,
}

impl PostgresReplyContextStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

const COLUMNS: &str = "provider_message_id, phone, course_id, lesson_id, quiz_id, created_at, expires_at";

fn context_from_row(row: &PgRow) -> Result<ReplyContext, StoreError> {
    let decode = |e: sqlx::Error| StoreError::from_sqlx("decode_reply_context", e);
    let phone: String = row.try_get("phone").map_err(decode)?;
    let lesson_id: Option<Uuid> = row.try_get("lesson_id").map_err(decode)?;
    let quiz_id: Option<Uuid> = row.try_get("quiz_id").map_err(decode)?;
    Ok(ReplyContext {
        provider_message_id: row.try_get("provider_message_id").map_err(decode)?,
        phone: PhoneNumber::parse(&phone).map_err(|e| StoreError::Serialization(e.to_string()))?,
        course_id: CourseId::from_uuid(row.try_get("course_id").map_err(decode)?),
        lesson_id: lesson_id.map(LessonId::from_uuid),
        quiz_id: quiz_id.map(QuizId::from_uuid),
        created_at: row.try_get("created_at").map_err(decode)?,
        expires_at: row.try_get("expires_at").map_err(decode)?,
    })
}

#[async_trait]
impl ReplyContextStore for PostgresReplyContextStore {
    #[instrument(skip(self, context), fields(provider_message_id = %context.provider_message_id), err)]
    async fn record(&self, context: &ReplyContext) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO reply_contexts
                (provider_message_id, phone, course_id, lesson_id, quiz_id, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (provider_message_id) DO UPDATE
            SET phone = EXCLUDED.phone,
                course_id = EXCLUDED.course_id,
                lesson_id = EXCLUDED.lesson_id,
                quiz_id = EXCLUDED.quiz_id,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(&context.provider_message_id)
        .bind(context.phone.as_str())
        .bind(context.course_id.as_uuid())
        .bind(context.lesson_id.map(|id| *id.as_uuid()))
        .bind(context.quiz_id.map(|id| *id.as_uuid()))
        .bind(context.created_at)
        .bind(context.expires_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("record_reply_context", e))?;
        Ok(())
    }

    async fn find_by_message_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<ReplyContext>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM reply_contexts WHERE provider_message_id = $1"
        ))
        .bind(provider_message_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("find_reply_context", e))?;

        row.as_ref().map(context_from_row).transpose()
    }

    async fn latest_for_phone(
        &self,
        phone: &PhoneNumber,
        now: DateTime<Utc>,
    ) -> Result<Option<ReplyContext>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM reply_contexts
            WHERE phone = $1 AND expires_at > $2
            ORDER BY created_at DESC, provider_message_id DESC
            LIMIT 1
            "#
        ))
        .bind(phone.as_str())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("latest_reply_context", e))?;

        row.as_ref().map(context_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn sweep(
        &self,
        now: DateTime<Utc>,
        created_before: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let result = sqlx::query(
            "DELETE FROM reply_contexts WHERE expires_at <= $1 OR created_at < $2",
        )
        .bind(now)
        .bind(created_before)
        .execute(&*self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("sweep_reply_contexts", e))?;

        Ok(result.rows_affected() as usize)
    }
}
