use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use microlearn_core::{CourseId, LessonId, PhoneNumber};
use microlearn_messaging::{DeliveryStatus, StatusUpdate};

use crate::error::StoreError;

use super::{Direction, MessageLog, MessageLogEntry, StatusOutcome, advance};

#[derive(Debug, Clone)]
pub struct PostgresMessageLog {
    pool: Arc<PgPool>,
}

impl PostgresMessageLog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

const COLUMNS: &str = "provider_message_id, direction, phone, kind, body, course_id, lesson_id, \
                       status, error, created_at, updated_at";

fn entry_from_row(row: &PgRow) -> Result<MessageLogEntry, StoreError> {
    let decode = |e: sqlx::Error| StoreError::from_sqlx("decode_message_log", e);
    let direction: String = row.try_get("direction").map_err(decode)?;
    let phone: String = row.try_get("phone").map_err(decode)?;
    let status: Option<String> = row.try_get("status").map_err(decode)?;
    let course_id: Option<Uuid> = row.try_get("course_id").map_err(decode)?;
    let lesson_id: Option<Uuid> = row.try_get("lesson_id").map_err(decode)?;

    Ok(MessageLogEntry {
        provider_message_id: row.try_get("provider_message_id").map_err(decode)?,
        direction: Direction::parse(&direction)
            .ok_or_else(|| StoreError::Serialization(format!("unknown direction: {direction}")))?,
        phone: PhoneNumber::parse(&phone).map_err(|e| StoreError::Serialization(e.to_string()))?,
        kind: row.try_get("kind").map_err(decode)?,
        body: row.try_get("body").map_err(decode)?,
        course_id: course_id.map(CourseId::from_uuid),
        lesson_id: lesson_id.map(LessonId::from_uuid),
        status: status.as_deref().and_then(DeliveryStatus::parse),
        error: row.try_get("error").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

async fn insert(
    pool: &PgPool,
    entry: &MessageLogEntry,
    operation: &str,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO message_log
            (provider_message_id, direction, phone, kind, body, course_id, lesson_id,
             status, error, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (provider_message_id) DO NOTHING
        "#,
    )
    .bind(&entry.provider_message_id)
    .bind(entry.direction.as_str())
    .bind(entry.phone.as_str())
    .bind(&entry.kind)
    .bind(&entry.body)
    .bind(entry.course_id.map(|id| *id.as_uuid()))
    .bind(entry.lesson_id.map(|id| *id.as_uuid()))
    .bind(entry.status.map(|s| s.as_str()))
    .bind(&entry.error)
    .bind(entry.created_at)
    .bind(entry.updated_at)
    .execute(pool)
    .await
    .map_err(|e| StoreError::from_sqlx(operation, e))?;

    Ok(result.rows_affected() > 0)
}

#[async_trait]
impl MessageLog for PostgresMessageLog {
    async fn record_outbound(&self, entry: &MessageLogEntry) -> Result<(), StoreError> {
        insert(&self.pool, entry, "record_outbound").await.map(|_| ())
    }

    async fn record_inbound(&self, entry: &MessageLogEntry) -> Result<bool, StoreError> {
        insert(&self.pool, entry, "record_inbound").await
    }

    #[instrument(skip(self, update, now), fields(provider_message_id = %update.provider_message_id, status = update.status.as_str()), err)]
    async fn apply_status(
        &self,
        update: &StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<StatusOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::from_sqlx("apply_status_begin", e))?;

        let current: Option<Option<String>> = sqlx::query_scalar(
            r#"
            SELECT status FROM message_log
            WHERE provider_message_id = $1 AND direction = 'outbound'
            FOR UPDATE
            "#,
        )
        .bind(&update.provider_message_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::from_sqlx("apply_status_lock", e))?;

        let Some(current) = current else {
            return Ok(StatusOutcome::Unknown);
        };
        let current = current.as_deref().and_then(DeliveryStatus::parse);
        if !advance(current, update.status) {
            return Ok(StatusOutcome::Ignored);
        }

        sqlx::query(
            r#"
            UPDATE message_log
            SET status = $2, error = COALESCE($3, error), updated_at = $4
            WHERE provider_message_id = $1
            "#,
        )
        .bind(&update.provider_message_id)
        .bind(update.status.as_str())
        .bind(&update.error)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::from_sqlx("apply_status", e))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::from_sqlx("apply_status_commit", e))?;
        Ok(StatusOutcome::Updated)
    }

    async fn get(&self, provider_message_id: &str) -> Result<Option<MessageLogEntry>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM message_log WHERE provider_message_id = $1"
        ))
        .bind(provider_message_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("get_message_log", e))?;

        row.as_ref().map(entry_from_row).transpose()
    }
}
