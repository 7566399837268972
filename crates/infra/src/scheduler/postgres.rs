use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use microlearn_core::{CourseId, PhoneNumber};

use crate::db::{to_i32, to_u32};
use crate::error::StoreError;

use super::rule::ScheduleRule;
use super::store::{CourseSchedule, ScheduleStatus, ScheduleStore};

#[derive(Debug, Clone)]
pub struct PostgresScheduleStore {
    pool: Arc<PgPool>,
}

impl PostgresScheduleStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

const COLUMNS: &str = "course_id, recipients, rule, cursor, total_lessons, last_reminder_index, \
                       status, next_lesson_at, next_reminder_at, created_at, updated_at";

fn schedule_from_row(row: &PgRow) -> Result<CourseSchedule, StoreError> {
    let decode = |e: sqlx::Error| StoreError::from_sqlx("decode_course_schedule", e);
    let recipients: serde_json::Value = row.try_get("recipients").map_err(decode)?;
    let rule: serde_json::Value = row.try_get("rule").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let last_reminder_index: Option<i32> = row.try_get("last_reminder_index").map_err(decode)?;

    Ok(CourseSchedule {
        course_id: CourseId::from_uuid(row.try_get("course_id").map_err(decode)?),
        recipients: serde_json::from_value::<Vec<PhoneNumber>>(recipients)?,
        rule: serde_json::from_value::<ScheduleRule>(rule)?,
        cursor: to_u32(row.try_get("cursor").map_err(decode)?),
        total_lessons: to_u32(row.try_get("total_lessons").map_err(decode)?),
        last_reminder_index: last_reminder_index.map(to_u32),
        status: ScheduleStatus::parse(&status)
            .ok_or_else(|| StoreError::Serialization(format!("unknown schedule status: {status}")))?,
        next_lesson_at: row.try_get("next_lesson_at").map_err(decode)?,
        next_reminder_at: row.try_get("next_reminder_at").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

#[async_trait]
impl ScheduleStore for PostgresScheduleStore {
    #[instrument(skip(self, schedule), fields(course_id = %schedule.course_id, cursor = schedule.cursor), err)]
    async fn upsert(&self, schedule: &CourseSchedule) -> Result<(), StoreError> {
        let recipients = serde_json::to_value(&schedule.recipients)?;
        let rule = serde_json::to_value(&schedule.rule)?;

        sqlx::query(
            r#"
            INSERT INTO course_schedules
                (course_id, recipients, rule, cursor, total_lessons, last_reminder_index,
                 status, next_lesson_at, next_reminder_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (course_id) DO UPDATE
            SET recipients = EXCLUDED.recipients,
                rule = EXCLUDED.rule,
                cursor = EXCLUDED.cursor,
                total_lessons = EXCLUDED.total_lessons,
                last_reminder_index = EXCLUDED.last_reminder_index,
                status = EXCLUDED.status,
                next_lesson_at = EXCLUDED.next_lesson_at,
                next_reminder_at = EXCLUDED.next_reminder_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(schedule.course_id.as_uuid())
        .bind(recipients)
        .bind(rule)
        .bind(to_i32(schedule.cursor))
        .bind(to_i32(schedule.total_lessons))
        .bind(schedule.last_reminder_index.map(to_i32))
        .bind(schedule.status.as_str())
        .bind(schedule.next_lesson_at)
        .bind(schedule.next_reminder_at)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("upsert_course_schedule", e))?;
        Ok(())
    }

    async fn get(&self, course_id: CourseId) -> Result<Option<CourseSchedule>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM course_schedules WHERE course_id = $1"
        ))
        .bind(course_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("get_course_schedule", e))?;

        row.as_ref().map(schedule_from_row).transpose()
    }

    async fn list_active(&self) -> Result<Vec<CourseSchedule>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM course_schedules WHERE status = 'active' ORDER BY created_at"
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("list_active_schedules", e))?;

        rows.iter().map(schedule_from_row).collect()
    }
}
