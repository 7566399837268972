//! Timer-driven lesson scheduler.
//!
//! Each active course owns one timer task that sleeps until the earlier of
//! its next lesson or reminder firing. A lesson firing enqueues one lesson
//! job per recipient and advances the cursor; a reminder firing enqueues one
//! reminder per recipient for the lesson at the cursor and never moves it.
//! Firings for one course are serialized by a per-course lock; different
//! courses never share state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use microlearn_core::{CourseId, LessonId, PhoneNumber};

use crate::catalog::CatalogStore;
use crate::delivery::payloads::{LessonJob, ReminderJob};
use crate::error::StoreError;
use crate::jobs::{JobKind, JobQueue, QueueName};

use super::SchedulerError;
use super::rule::{REMINDER_LEAD, ScheduleParams, ScheduleRule, Timezone};
use super::store::{CourseSchedule, ScheduleStatus, ScheduleStore};

/// Pause after a failed firing before the timer tries again.
const ERROR_BACKOFF: Duration = Duration::from_secs(30);
const MAX_TIMER_WAIT: Duration = Duration::from_secs(3600);

/// What [`LessonScheduler::schedule_delivery`] computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleResult {
    pub course_id: CourseId,
    pub next_execution: Option<DateTime<Utc>>,
    pub next_reminder: Option<DateTime<Utc>>,
    pub total_lessons: u32,
    pub cursor: u32,
    pub status: ScheduleStatus,
}

impl From<&CourseSchedule> for ScheduleResult {
    fn from(schedule: &CourseSchedule) -> Self {
        Self {
            course_id: schedule.course_id,
            next_execution: schedule.next_lesson_at,
            next_reminder: schedule.next_reminder_at,
            total_lessons: schedule.total_lessons,
            cursor: schedule.cursor,
            status: schedule.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FireOutcome {
    /// Lesson jobs were enqueued and the cursor moved past `index`.
    Delivered {
        lesson_id: LessonId,
        index: u32,
        enqueued: usize,
        duplicates: usize,
    },
    /// Reminder jobs were enqueued for the lesson at `index`.
    Reminded {
        lesson_id: LessonId,
        index: u32,
        enqueued: usize,
    },
    /// A reminder for this cursor position already went out.
    AlreadyReminded { index: u32 },
    /// The start date has not been reached.
    Waiting,
    /// Every lesson has been delivered; the timer stops.
    Finished,
}

pub struct LessonScheduler {
    schedules: Arc<dyn ScheduleStore>,
    catalog: Arc<dyn CatalogStore>,
    queue: JobQueue,
    default_timezone: Timezone,
    timers: Mutex<HashMap<CourseId, CancellationToken>>,
    course_locks: Mutex<HashMap<CourseId, Arc<Mutex<()>>>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl LessonScheduler {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        catalog: Arc<dyn CatalogStore>,
        queue: JobQueue,
        default_timezone: Timezone,
    ) -> Self {
        Self {
            schedules,
            catalog,
            queue,
            default_timezone,
            timers: Mutex::new(HashMap::new()),
            course_locks: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Validate raw scheduling parameters with this scheduler's default offset.
    pub fn parse_rule(&self, params: &ScheduleParams) -> Result<ScheduleRule, SchedulerError> {
        params.parse(self.default_timezone)
    }

    /// Create or replace the delivery schedule of a course and arm its timer.
    ///
    /// Re-scheduling keeps the stored cursor, so lessons already handed out
    /// are not sent again.
    #[instrument(skip(self, recipients, params, now), fields(course_id = %course_id, recipients = recipients.len()), err)]
    pub async fn schedule_delivery(
        self: &Arc<Self>,
        course_id: CourseId,
        recipients: Vec<PhoneNumber>,
        params: &ScheduleParams,
        now: DateTime<Utc>,
    ) -> Result<ScheduleResult, SchedulerError> {
        let rule = self.parse_rule(params)?;
        let next_lesson_at = rule
            .next_after(now)
            .ok_or(SchedulerError::NoUpcomingOccurrence)?;
        let next_reminder_at = rule.next_reminder_after(now);

        let course = self
            .catalog
            .get_course(course_id)
            .await?
            .ok_or(SchedulerError::CourseNotFound(course_id))?;

        let mut recipients = recipients;
        recipients.sort();
        recipients.dedup();

        let lock = self.course_lock(course_id).await;
        let guard = lock.lock().await;

        let existing = self.schedules.get(course_id).await?;
        let (cursor, last_reminder_index, created_at) = existing
            .as_ref()
            .map(|s| (s.cursor, s.last_reminder_index, s.created_at))
            .unwrap_or((0, None, now));

        let mut schedule = CourseSchedule {
            course_id,
            recipients,
            rule,
            cursor: cursor.min(course.total_lessons),
            total_lessons: course.total_lessons,
            last_reminder_index,
            status: ScheduleStatus::Active,
            next_lesson_at: Some(next_lesson_at),
            next_reminder_at,
            created_at,
            updated_at: now,
        };
        if schedule.is_finished() {
            schedule.complete(now);
        }
        self.schedules.upsert(&schedule).await?;
        drop(guard);
        drop(lock);

        match schedule.status {
            ScheduleStatus::Active => self.arm(course_id).await,
            ScheduleStatus::Completed => self.disarm(course_id).await,
        }

        info!(
            course_id = %course_id,
            total_lessons = schedule.total_lessons,
            cursor = schedule.cursor,
            frequency = schedule.rule.frequency.as_str(),
            next_execution = ?schedule.next_lesson_at,
            next_reminder = ?schedule.next_reminder_at,
            rescheduled = existing.is_some(),
            "course delivery scheduled"
        );
        Ok(ScheduleResult::from(&schedule))
    }

    pub async fn schedule(&self, course_id: CourseId) -> Result<Option<CourseSchedule>, StoreError> {
        self.schedules.get(course_id).await
    }

    /// Lesson-rule firing.
    #[instrument(skip(self, now), fields(course_id = %course_id), err)]
    pub async fn fire_lesson(
        &self,
        course_id: CourseId,
        now: DateTime<Utc>,
    ) -> Result<FireOutcome, SchedulerError> {
        let lock = self.course_lock(course_id).await;
        let fired = {
            let _guard = lock.lock().await;
            self.advance_lesson(course_id, now).await
        };
        drop(lock);
        self.settle(course_id, fired).await
    }

    async fn advance_lesson(
        &self,
        course_id: CourseId,
        now: DateTime<Utc>,
    ) -> Result<(FireOutcome, ScheduleStatus), SchedulerError> {
        let mut schedule = self.load(course_id).await?;
        if schedule.status == ScheduleStatus::Completed {
            return Ok((FireOutcome::Finished, schedule.status));
        }
        if !schedule.rule.has_started(now) {
            schedule.next_lesson_at = schedule.rule.next_after(now);
            schedule.updated_at = now;
            self.schedules.upsert(&schedule).await?;
            debug!("start date not reached");
            return Ok((FireOutcome::Waiting, schedule.status));
        }
        if schedule.cursor >= schedule.total_lessons {
            return self.finish(schedule, now).await;
        }

        let lessons = self.catalog.lessons_for_course(course_id).await?;
        let index = schedule.cursor;
        let Some(lesson) = lessons.get(index as usize) else {
            warn!(cursor = index, lessons = lessons.len(), "course has fewer lessons than scheduled");
            return self.finish(schedule, now).await;
        };

        let (mut enqueued, mut duplicates) = (0, 0);
        for phone in &schedule.recipients {
            let job = LessonJob {
                course_id,
                lesson_id: lesson.id,
                phone: phone.clone(),
            };
            let outcome = self
                .queue
                .enqueue(QueueName::Lesson, JobKind::SendLesson, &job, job.idempotency_key())
                .await?;
            if outcome.is_duplicate() {
                duplicates += 1;
            } else {
                enqueued += 1;
            }
        }

        schedule.cursor += 1;
        schedule.next_lesson_at = schedule.rule.next_after(now);
        schedule.updated_at = now;
        if schedule.cursor >= schedule.total_lessons {
            schedule.complete(now);
            info!(course_id = %course_id, total_lessons = schedule.total_lessons, "course delivery completed");
        }
        self.schedules.upsert(&schedule).await?;

        info!(
            course_id = %course_id,
            lesson_id = %lesson.id,
            day = lesson.day,
            index,
            enqueued,
            duplicates,
            "lesson firing enqueued deliveries"
        );
        let outcome = FireOutcome::Delivered {
            lesson_id: lesson.id,
            index,
            enqueued,
            duplicates,
        };
        Ok((outcome, schedule.status))
    }

    /// Reminder-rule firing. Sends at most one reminder per cursor position.
    #[instrument(skip(self, now), fields(course_id = %course_id), err)]
    pub async fn fire_reminder(
        &self,
        course_id: CourseId,
        now: DateTime<Utc>,
    ) -> Result<FireOutcome, SchedulerError> {
        let lock = self.course_lock(course_id).await;
        let fired = {
            let _guard = lock.lock().await;
            self.advance_reminder(course_id, now).await
        };
        drop(lock);
        self.settle(course_id, fired).await
    }

    async fn advance_reminder(
        &self,
        course_id: CourseId,
        now: DateTime<Utc>,
    ) -> Result<(FireOutcome, ScheduleStatus), SchedulerError> {
        let mut schedule = self.load(course_id).await?;
        if schedule.status == ScheduleStatus::Completed {
            return Ok((FireOutcome::Finished, schedule.status));
        }
        schedule.next_reminder_at = schedule.rule.next_reminder_after(now);
        schedule.updated_at = now;

        // The first lesson's reminder may fall on the evening before the
        // start date, so the boundary is checked at the lesson's time.
        if !schedule.rule.has_started(now + REMINDER_LEAD) {
            self.schedules.upsert(&schedule).await?;
            return Ok((FireOutcome::Waiting, schedule.status));
        }
        if schedule.cursor >= schedule.total_lessons {
            return self.finish(schedule, now).await;
        }

        let index = schedule.cursor;
        if schedule.last_reminder_index == Some(index) {
            self.schedules.upsert(&schedule).await?;
            debug!(index, "reminder already sent for this lesson");
            return Ok((FireOutcome::AlreadyReminded { index }, schedule.status));
        }

        let lessons = self.catalog.lessons_for_course(course_id).await?;
        let Some(lesson) = lessons.get(index as usize) else {
            return self.finish(schedule, now).await;
        };

        let mut enqueued = 0;
        for phone in &schedule.recipients {
            let job = ReminderJob {
                course_id,
                lesson_id: lesson.id,
                phone: phone.clone(),
                lesson_at: schedule.next_lesson_at,
            };
            let outcome = self
                .queue
                .enqueue(QueueName::Reminder, JobKind::SendReminder, &job, job.idempotency_key())
                .await?;
            if !outcome.is_duplicate() {
                enqueued += 1;
            }
        }

        schedule.last_reminder_index = Some(index);
        self.schedules.upsert(&schedule).await?;

        info!(course_id = %course_id, lesson_id = %lesson.id, index, enqueued, "reminders enqueued");
        let outcome = FireOutcome::Reminded {
            lesson_id: lesson.id,
            index,
            enqueued,
        };
        Ok((outcome, schedule.status))
    }

    /// Fire whatever is due at `now`: the reminder first, then the lesson.
    pub async fn fire_due(
        &self,
        course_id: CourseId,
        now: DateTime<Utc>,
    ) -> Result<Vec<FireOutcome>, SchedulerError> {
        let schedule = self.load(course_id).await?;
        let mut outcomes = Vec::new();
        if schedule.next_reminder_at.is_some_and(|at| at <= now) {
            outcomes.push(self.fire_reminder(course_id, now).await?);
        }
        if schedule.next_lesson_at.is_some_and(|at| at <= now) {
            outcomes.push(self.fire_lesson(course_id, now).await?);
        }
        Ok(outcomes)
    }

    /// Re-arm every active schedule, typically at process start. Firings
    /// missed while the process was down run once, immediately.
    #[instrument(skip(self, now), err)]
    pub async fn restore(self: &Arc<Self>, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let active = self.schedules.list_active().await?;
        let count = active.len();

        for mut schedule in active {
            if schedule.next_lesson_at.is_none() {
                schedule.next_lesson_at = schedule.rule.next_after(now);
                schedule.next_reminder_at = schedule.rule.next_reminder_after(now);
                schedule.updated_at = now;
                self.schedules.upsert(&schedule).await?;
            }
            self.arm(schedule.course_id).await;
        }

        info!(restored = count, "course schedules restored");
        Ok(count)
    }

    /// Number of running course timers.
    pub async fn active_timers(&self) -> usize {
        self.timers
            .lock()
            .await
            .values()
            .filter(|t| !t.is_cancelled())
            .count()
    }

    #[cfg(test)]
    async fn tracked_courses(&self) -> (usize, usize) {
        (self.timers.lock().await.len(), self.course_locks.lock().await.len())
    }

    /// Stop every timer and wait for in-flight firings to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("lesson scheduler stopped");
    }

    async fn load(&self, course_id: CourseId) -> Result<CourseSchedule, SchedulerError> {
        self.schedules
            .get(course_id)
            .await?
            .ok_or(SchedulerError::ScheduleNotFound(course_id))
    }

    async fn finish(
        &self,
        mut schedule: CourseSchedule,
        now: DateTime<Utc>,
    ) -> Result<(FireOutcome, ScheduleStatus), SchedulerError> {
        schedule.complete(now);
        self.schedules.upsert(&schedule).await?;
        info!(course_id = %schedule.course_id, total_lessons = schedule.total_lessons, "course delivery completed");
        Ok((FireOutcome::Finished, schedule.status))
    }

    /// Stop tracking a course once its schedule is complete. Runs after the
    /// course lock is released.
    async fn settle(
        &self,
        course_id: CourseId,
        fired: Result<(FireOutcome, ScheduleStatus), SchedulerError>,
    ) -> Result<FireOutcome, SchedulerError> {
        let (outcome, status) = fired?;
        if status == ScheduleStatus::Completed {
            self.disarm(course_id).await;
        }
        Ok(outcome)
    }

    async fn course_lock(&self, course_id: CourseId) -> Arc<Mutex<()>> {
        self.course_locks
            .lock()
            .await
            .entry(course_id)
            .or_default()
            .clone()
    }

    async fn arm(self: &Arc<Self>, course_id: CourseId) {
        let token = self.shutdown.child_token();
        if let Some(previous) = self.timers.lock().await.insert(course_id, token.clone()) {
            previous.cancel();
        }
        let scheduler = Arc::clone(self);
        self.tasks.spawn(scheduler.run_timer(course_id, token));
    }

    async fn disarm(&self, course_id: CourseId) {
        if let Some(token) = self.timers.lock().await.remove(&course_id) {
            token.cancel();
        }
        self.forget_lock(course_id).await;
    }

    /// Drop the course lock unless a caller holds or waits on it.
    async fn forget_lock(&self, course_id: CourseId) {
        let mut locks = self.course_locks.lock().await;
        if locks.get(&course_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&course_id);
        }
    }

    async fn run_timer(self: Arc<Self>, course_id: CourseId, token: CancellationToken) {
        debug!(course_id = %course_id, "schedule timer armed");
        loop {
            let next_due = match self.schedules.get(course_id).await {
                Ok(Some(schedule)) if schedule.status == ScheduleStatus::Active => schedule.next_due(),
                Ok(_) => None,
                Err(e) => {
                    warn!(course_id = %course_id, error = %e, "failed to load schedule");
                    if !pause(&token, ERROR_BACKOFF).await {
                        break;
                    }
                    continue;
                }
            };
            let Some(due) = next_due else {
                break;
            };

            let wait = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            if wait > MAX_TIMER_WAIT {
                // Re-read the schedule periodically; wall-clock time may drift
                // from the monotonic timer over long waits.
                if !pause(&token, MAX_TIMER_WAIT).await {
                    break;
                }
                continue;
            }
            if !pause(&token, wait).await {
                break;
            }

            match self.fire_due(course_id, Utc::now()).await {
                Ok(outcomes) if outcomes.contains(&FireOutcome::Finished) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(course_id = %course_id, error = %e, "schedule firing failed");
                    if !pause(&token, ERROR_BACKOFF).await {
                        break;
                    }
                }
            }
        }
        token.cancel();
        {
            // A replacement timer may already own the slot.
            let mut timers = self.timers.lock().await;
            if timers.get(&course_id).is_some_and(CancellationToken::is_cancelled) {
                timers.remove(&course_id);
            }
        }
        self.forget_lock(course_id).await;
        debug!(course_id = %course_id, "schedule timer stopped");
    }
}

/// Sleep unless cancelled first. Returns `false` on cancellation.
async fn pause(token: &CancellationToken, wait: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(wait) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalogStore;
    use crate::jobs::{InMemoryJobStore, JobStore, RetryPolicy};
    use crate::scheduler::store::InMemoryScheduleStore;
    use chrono::{NaiveDate, NaiveDateTime};
    use microlearn_core::AdminId;
    use microlearn_courses::{CourseBundle, CourseDraft, LessonDraft};
    use proptest::prelude::*;

    struct Harness {
        scheduler: Arc<LessonScheduler>,
        jobs: Arc<InMemoryJobStore>,
        schedules: Arc<InMemoryScheduleStore>,
        bundle: CourseBundle,
        recipients: Vec<PhoneNumber>,
    }

    async fn harness(lessons: u32) -> Harness {
        let catalog = Arc::new(InMemoryCatalogStore::new());
        let bundle = CourseDraft {
            admin_id: AdminId::new(),
            name: "Node".to_string(),
            description: String::new(),
            lessons: (1..=lessons)
                .map(|day| LessonDraft {
                    title: format!("Day {day}"),
                    content: "content".to_string(),
                    day,
                    document: None,
                    media: None,
                    external_link: None,
                    quiz: None,
                })
                .collect(),
        }
        .build(Utc::now())
        .unwrap();
        catalog.insert_course_bundle(&bundle).await.unwrap();

        let jobs = InMemoryJobStore::arc();
        let schedules = Arc::new(InMemoryScheduleStore::new());
        let queue = JobQueue::new(jobs.clone(), RetryPolicy::default());
        let scheduler = Arc::new(LessonScheduler::new(
            schedules.clone(),
            catalog,
            queue,
            Timezone::utc(),
        ));

        Harness {
            scheduler,
            jobs,
            schedules,
            bundle,
            recipients: vec![
                PhoneNumber::parse("+900000000").unwrap(),
                PhoneNumber::parse("+900000001").unwrap(),
            ],
        }
    }

    fn at(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M")
            .unwrap()
            .and_utc()
    }

    fn params(time: &str, start: &str) -> ScheduleParams {
        ScheduleParams {
            time_of_day: time.to_string(),
            start_date: start.to_string(),
            frequency: "daily".to_string(),
            timezone: None,
        }
    }

    /// Far enough ahead that armed timers never wake during a test.
    const FUTURE_START: &str = "2099-01-01";

    #[tokio::test]
    async fn three_lesson_daily_course_reports_next_execution() {
        let h = harness(3).await;
        let now = Utc::now();
        let today = now.date_naive();

        let result = h
            .scheduler
            .schedule_delivery(
                h.bundle.course.id,
                h.recipients.clone(),
                &params("10:00", &today.format("%Y-%m-%d").to_string()),
                now,
            )
            .await
            .unwrap();

        let ten_today = today.and_hms_opt(10, 0, 0).unwrap().and_utc();
        assert_eq!(result.total_lessons, 3);
        assert_eq!(result.cursor, 0);
        assert!(result.next_execution.unwrap() >= ten_today);
        assert!(result.next_reminder.unwrap() <= result.next_execution.unwrap());
        assert_eq!(h.scheduler.active_timers().await, 1);

        h.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn lesson_firings_walk_the_cursor_then_finish() {
        let h = harness(3).await;
        let course_id = h.bundle.course.id;
        h.scheduler
            .schedule_delivery(course_id, h.recipients.clone(), &params("10:00", FUTURE_START), Utc::now())
            .await
            .unwrap();

        let early = h.scheduler.fire_lesson(course_id, at("2098-12-31 10:00")).await.unwrap();
        assert_eq!(early, FireOutcome::Waiting);

        for (i, when) in ["2099-01-01 10:00", "2099-01-02 10:00", "2099-01-03 10:00"]
            .into_iter()
            .enumerate()
        {
            match h.scheduler.fire_lesson(course_id, at(when)).await.unwrap() {
                FireOutcome::Delivered { lesson_id, index, enqueued, duplicates } => {
                    assert_eq!(index, i as u32);
                    assert_eq!(lesson_id, h.bundle.lessons[i].id);
                    assert_eq!((enqueued, duplicates), (2, 0));
                }
                other => panic!("expected delivery, got {other:?}"),
            }
        }

        let schedule = h.schedules.get(course_id).await.unwrap().unwrap();
        assert_eq!(schedule.cursor, 3);
        assert_eq!(schedule.status, ScheduleStatus::Completed);
        // A completed course keeps neither a timer nor a lock.
        assert_eq!(h.scheduler.active_timers().await, 0);
        assert_eq!(h.scheduler.tracked_courses().await, (0, 0));

        let after = h.scheduler.fire_lesson(course_id, at("2099-01-04 10:00")).await.unwrap();
        assert_eq!(after, FireOutcome::Finished);
        assert_eq!(h.jobs.stats(QueueName::Lesson).await.unwrap().pending, 6);
        assert_eq!(h.scheduler.tracked_courses().await, (0, 0));

        h.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn one_reminder_per_lesson_window() {
        let h = harness(2).await;
        let course_id = h.bundle.course.id;
        h.scheduler
            .schedule_delivery(course_id, h.recipients.clone(), &params("10:00", FUTURE_START), Utc::now())
            .await
            .unwrap();

        let first = h.scheduler.fire_reminder(course_id, at("2099-01-01 08:00")).await.unwrap();
        let repeat = h.scheduler.fire_reminder(course_id, at("2099-01-01 08:30")).await.unwrap();
        h.scheduler.fire_lesson(course_id, at("2099-01-01 10:00")).await.unwrap();
        let second = h.scheduler.fire_reminder(course_id, at("2099-01-02 08:00")).await.unwrap();

        assert!(matches!(first, FireOutcome::Reminded { index: 0, enqueued: 2, .. }));
        assert_eq!(repeat, FireOutcome::AlreadyReminded { index: 0 });
        assert!(matches!(second, FireOutcome::Reminded { index: 1, .. }));
        assert_eq!(h.jobs.stats(QueueName::Reminder).await.unwrap().pending, 4);

        h.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn rescheduling_keeps_cursor_and_replaces_timer() {
        let h = harness(3).await;
        let course_id = h.bundle.course.id;
        h.scheduler
            .schedule_delivery(course_id, h.recipients.clone(), &params("10:00", FUTURE_START), Utc::now())
            .await
            .unwrap();
        h.scheduler.fire_lesson(course_id, at("2099-01-01 10:00")).await.unwrap();

        let again = h
            .scheduler
            .schedule_delivery(course_id, h.recipients.clone(), &params("18:30", FUTURE_START), Utc::now())
            .await
            .unwrap();

        assert_eq!(again.cursor, 1);
        assert_eq!(again.next_execution, Some(at("2099-01-01 18:30")));
        assert_eq!(h.scheduler.active_timers().await, 1);

        h.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_without_state() {
        let h = harness(1).await;
        let course_id = h.bundle.course.id;

        let err = h
            .scheduler
            .schedule_delivery(course_id, h.recipients.clone(), &params("25:00", FUTURE_START), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTimeOfDay(_)));
        assert!(err.is_validation());

        let mut weekly = params("10:00", FUTURE_START);
        weekly.frequency = "fortnightly".to_string();
        let err = h
            .scheduler
            .schedule_delivery(course_id, h.recipients.clone(), &weekly, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidFrequency(_)));

        let err = h
            .scheduler
            .schedule_delivery(CourseId::new(), h.recipients.clone(), &params("10:00", FUTURE_START), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::CourseNotFound(_)));

        assert!(h.schedules.get(course_id).await.unwrap().is_none());
        assert_eq!(h.scheduler.active_timers().await, 0);
    }

    #[tokio::test]
    async fn restore_catches_up_a_missed_firing_once() {
        let h = harness(3).await;
        let course_id = h.bundle.course.id;
        let now = Utc::now();
        let yesterday = now.date_naive().pred_opt().unwrap();

        let rule = h
            .scheduler
            .parse_rule(&params("10:00", &yesterday.format("%Y-%m-%d").to_string()))
            .unwrap();
        h.schedules
            .upsert(&CourseSchedule {
                course_id,
                recipients: h.recipients.clone(),
                rule,
                cursor: 0,
                total_lessons: 3,
                last_reminder_index: None,
                status: ScheduleStatus::Active,
                next_lesson_at: Some(now - chrono::Duration::hours(1)),
                next_reminder_at: Some(now + chrono::Duration::days(1)),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        assert_eq!(h.scheduler.restore(now).await.unwrap(), 1);

        let mut delivered = false;
        for _ in 0..200 {
            if h.jobs.stats(QueueName::Lesson).await.unwrap().pending == 2 {
                delivered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(delivered, "missed lesson was not delivered");

        let schedule = h.schedules.get(course_id).await.unwrap().unwrap();
        assert_eq!(schedule.cursor, 1);
        assert!(schedule.next_lesson_at.unwrap() > now);

        h.scheduler.shutdown().await;
        assert_eq!(h.jobs.stats(QueueName::Lesson).await.unwrap().pending, 2);
    }

    proptest! {
        #[test]
        fn cursor_is_monotonic_and_bounded(
            total in 1u32..6,
            firings in prop::collection::vec(any::<bool>(), 1..30),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let h = harness(total).await;
                let course_id = h.bundle.course.id;
                let start = NaiveDate::from_ymd_opt(2030, 6, 1).unwrap();
                let rule = ScheduleRule {
                    frequency: crate::scheduler::DeliveryFrequency::Daily,
                    time_of_day: "10:00".parse().unwrap(),
                    start_date: start,
                    timezone: Timezone::utc(),
                };
                let created = at("2030-05-31 12:00");
                h.schedules.upsert(&CourseSchedule {
                    course_id,
                    recipients: h.recipients.clone(),
                    rule,
                    cursor: 0,
                    total_lessons: total,
                    last_reminder_index: None,
                    status: ScheduleStatus::Active,
                    next_lesson_at: None,
                    next_reminder_at: None,
                    created_at: created,
                    updated_at: created,
                }).await.unwrap();

                let mut last_cursor = 0;
                for (i, lesson_rule) in firings.into_iter().enumerate() {
                    let now = at("2030-06-01 08:00") + chrono::Duration::hours(12 * i as i64);
                    if lesson_rule {
                        h.scheduler.fire_lesson(course_id, now).await.unwrap();
                    } else {
                        h.scheduler.fire_reminder(course_id, now).await.unwrap();
                    }

                    let schedule = h.schedules.get(course_id).await.unwrap().unwrap();
                    assert!(schedule.cursor >= last_cursor);
                    assert!(schedule.cursor <= total);
                    last_cursor = schedule.cursor;

                    let lesson_jobs = h.jobs.stats(QueueName::Lesson).await.unwrap().pending;
                    assert_eq!(lesson_jobs, schedule.cursor as usize * h.recipients.len());
                }
            });
        }
    }
}
