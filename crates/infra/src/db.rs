//! Postgres connection and schema bootstrap.
//!
//! The schema is created idempotently at startup; every statement is
//! `CREATE ... IF NOT EXISTS`, so running it against an existing database is
//! a no-op.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::error::StoreError;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS courses (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL,
        published_at TIMESTAMPTZ,
        total_lessons INTEGER NOT NULL,
        total_quizzes INTEGER NOT NULL,
        admin_id UUID NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS lessons (
        id UUID PRIMARY KEY,
        course_id UUID NOT NULL REFERENCES courses(id) ON DELETE CASCADE,
        title TEXT NOT NULL,
        content TEXT NOT NULL,
        day INTEGER NOT NULL,
        document TEXT,
        media TEXT,
        external_link TEXT,
        UNIQUE (course_id, day)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS quizzes (
        id UUID PRIMARY KEY,
        lesson_id UUID NOT NULL UNIQUE REFERENCES lessons(id) ON DELETE CASCADE,
        question TEXT NOT NULL,
        options JSONB NOT NULL,
        correct_option TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS learners (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        phone TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS enrollments (
        learner_id UUID NOT NULL REFERENCES learners(id) ON DELETE CASCADE,
        course_id UUID NOT NULL REFERENCES courses(id) ON DELETE CASCADE,
        enrolled_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (learner_id, course_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS course_progress (
        learner_id UUID NOT NULL,
        course_id UUID NOT NULL,
        completed_lessons INTEGER NOT NULL DEFAULT 0,
        progress_percent INTEGER NOT NULL DEFAULT 0,
        correct_answers INTEGER NOT NULL DEFAULT 0,
        quiz_score INTEGER NOT NULL DEFAULT 0,
        is_completed BOOLEAN NOT NULL DEFAULT FALSE,
        completed_at TIMESTAMPTZ,
        PRIMARY KEY (learner_id, course_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS lesson_progress (
        learner_id UUID NOT NULL,
        lesson_id UUID NOT NULL,
        course_id UUID NOT NULL,
        is_completed BOOLEAN NOT NULL DEFAULT FALSE,
        completed_at TIMESTAMPTZ,
        quiz_score INTEGER,
        quiz_reply TEXT,
        PRIMARY KEY (learner_id, lesson_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS reply_contexts (
        provider_message_id TEXT PRIMARY KEY,
        phone TEXT NOT NULL,
        course_id UUID NOT NULL,
        lesson_id UUID,
        quiz_id UUID,
        created_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS reply_contexts_phone_idx ON reply_contexts (phone, created_at DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS message_log (
        provider_message_id TEXT PRIMARY KEY,
        direction TEXT NOT NULL,
        phone TEXT NOT NULL,
        kind TEXT NOT NULL,
        body TEXT,
        course_id UUID,
        lesson_id UUID,
        status TEXT,
        error TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id UUID PRIMARY KEY,
        queue TEXT NOT NULL,
        kind TEXT NOT NULL,
        idempotency_key TEXT,
        payload JSONB NOT NULL,
        status TEXT NOT NULL,
        attempt INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        retry_policy JSONB NOT NULL,
        history JSONB NOT NULL DEFAULT '[]'::jsonb,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        scheduled_at TIMESTAMPTZ
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS jobs_queue_key_idx ON jobs (queue, idempotency_key) WHERE idempotency_key IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS jobs_claim_idx ON jobs (queue, status, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS dead_letter_jobs (
        id UUID PRIMARY KEY,
        queue TEXT NOT NULL,
        job JSONB NOT NULL,
        reason TEXT NOT NULL,
        dead_lettered_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS course_schedules (
        course_id UUID PRIMARY KEY,
        recipients JSONB NOT NULL,
        rule JSONB NOT NULL,
        cursor INTEGER NOT NULL DEFAULT 0,
        total_lessons INTEGER NOT NULL,
        last_reminder_index INTEGER,
        status TEXT NOT NULL,
        next_lesson_at TIMESTAMPTZ,
        next_reminder_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
];

/// Open a connection pool.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .map_err(|e| StoreError::from_sqlx("connect", e))
}

/// Create all tables and indexes if missing.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| StoreError::from_sqlx("ensure_schema", e))?;
    }
    info!(statements = SCHEMA.len(), "database schema ensured");
    Ok(())
}

/// Convert a non-negative count column to `u32`.
pub(crate) fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

/// Convert a `u32` to an `INTEGER` bind value.
pub(crate) fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}
