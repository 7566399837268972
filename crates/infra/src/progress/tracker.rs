//! Progress tracker: applies a correlated learner reply to progress state.
//!
//! Missing learner, course or lesson is reported as a soft outcome so one
//! malformed webhook never aborts the rest of a batch.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument};

use microlearn_core::{CourseId, LessonId, PhoneNumber};
use microlearn_courses::{Course, Learner, Lesson};
use microlearn_progress::{AnswerMatcher, CourseProgress, LessonProgress, QuizReply, QuizVerdict};

use crate::catalog::CatalogStore;
use crate::error::StoreError;

use super::{ProgressKey, ProgressStore, QuizAnswer};

/// Applied progress, plus what feedback needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressUpdate {
    pub learner: Learner,
    pub course: Course,
    pub lesson: Lesson,
    pub course_progress: CourseProgress,
    pub lesson_progress: LessonProgress,
    /// Present on the quiz path.
    pub verdict: Option<QuizVerdict>,
    /// `false` when the reply repeated an already recorded answer or completion.
    pub counted: bool,
    /// The course became complete with this reply.
    pub course_completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProgressOutcome {
    Recorded(Box<ProgressUpdate>),
    LearnerNotFound,
    CourseNotFound,
    LessonNotFound,
}

pub struct ProgressTracker {
    catalog: Arc<dyn CatalogStore>,
    store: Arc<dyn ProgressStore>,
    matcher: AnswerMatcher,
}

impl ProgressTracker {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        store: Arc<dyn ProgressStore>,
        matcher: AnswerMatcher,
    ) -> Self {
        Self {
            catalog,
            store,
            matcher,
        }
    }

    /// Record a quiz answer (`quiz_reply` present) or a lesson-completion
    /// acknowledgement. A reply to a lesson without a quiz completes it.
    #[instrument(skip(self, quiz_reply, now), fields(phone = %phone, course_id = %course_id, lesson_id = %lesson_id))]
    pub async fn record_progress(
        &self,
        phone: &PhoneNumber,
        course_id: CourseId,
        lesson_id: LessonId,
        quiz_reply: Option<QuizReply<'_>>,
        now: DateTime<Utc>,
    ) -> Result<ProgressOutcome, StoreError> {
        let Some(learner) = self.catalog.find_learner_by_phone(phone).await? else {
            return Ok(ProgressOutcome::LearnerNotFound);
        };
        let Some(course) = self.catalog.get_course(course_id).await? else {
            return Ok(ProgressOutcome::CourseNotFound);
        };
        let lesson = match self.catalog.get_lesson(lesson_id).await? {
            Some(lesson) if lesson.course_id == course_id => lesson,
            _ => return Ok(ProgressOutcome::LessonNotFound),
        };

        let key = ProgressKey {
            learner_id: learner.id,
            course_id,
            lesson_id,
        };

        let quiz = match quiz_reply {
            Some(_) => self.catalog.quiz_for_lesson(lesson_id).await?,
            None => None,
        };

        let (snapshot, verdict) = match (quiz, quiz_reply) {
            (Some(quiz), Some(reply)) => {
                let verdict = self.matcher.judge(reply, &quiz.options, &quiz.correct_option);
                let answer = QuizAnswer {
                    reply: reply.text.trim(),
                    correct: verdict.correct,
                    total_quizzes: course.total_quizzes,
                };
                let snapshot = self
                    .store
                    .record_quiz_answer(key, answer, course.total_lessons, now)
                    .await?;
                (snapshot, Some(verdict))
            }
            _ => {
                let snapshot = self
                    .store
                    .complete_lesson(key, course.total_lessons, now)
                    .await?;
                (snapshot, None)
            }
        };

        let counted = match verdict {
            Some(_) => snapshot.answer_recorded,
            None => snapshot.lesson_newly_completed,
        };

        info!(
            learner_id = %learner.id,
            correct = verdict.as_ref().map(|v| v.correct),
            counted,
            progress_percent = snapshot.course.progress_percent,
            quiz_score = snapshot.course.quiz_score,
            course_completed = snapshot.course_newly_completed,
            "progress recorded"
        );

        Ok(ProgressOutcome::Recorded(Box::new(ProgressUpdate {
            learner,
            course,
            lesson,
            course_progress: snapshot.course,
            lesson_progress: snapshot.lesson,
            verdict,
            counted,
            course_completed: snapshot.course_newly_completed,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalogStore;
    use crate::progress::InMemoryProgressStore;
    use microlearn_core::AdminId;
    use microlearn_courses::{CourseBundle, CourseDraft, LessonDraft, QuizDraft};

    const LONG_OPTION: &str = "Introduction to Node.js Runtime";

    async fn setup() -> (ProgressTracker, CourseBundle, PhoneNumber) {
        let catalog = Arc::new(InMemoryCatalogStore::new());
        let quiz = QuizDraft {
            question: "What is Node?".to_string(),
            options: vec!["A browser".to_string(), LONG_OPTION.to_string()],
            correct_option: LONG_OPTION.to_string(),
        };
        let bundle = CourseDraft {
            admin_id: AdminId::new(),
            name: "Node".to_string(),
            description: String::new(),
            lessons: vec![
                LessonDraft {
                    title: "Runtime".to_string(),
                    content: "...".to_string(),
                    day: 1,
                    document: None,
                    media: None,
                    external_link: None,
                    quiz: Some(quiz),
                },
                LessonDraft {
                    title: "Modules".to_string(),
                    content: "...".to_string(),
                    day: 2,
                    document: None,
                    media: None,
                    external_link: None,
                    quiz: None,
                },
            ],
        }
        .build(Utc::now())
        .unwrap();
        catalog.insert_course_bundle(&bundle).await.unwrap();

        let phone = PhoneNumber::parse("+900000000").unwrap();
        catalog.upsert_learner("Ada", &phone).await.unwrap();

        let tracker = ProgressTracker::new(
            catalog,
            Arc::new(InMemoryProgressStore::new()),
            AnswerMatcher::default(),
        );
        (tracker, bundle, phone)
    }

    fn recorded(outcome: ProgressOutcome) -> ProgressUpdate {
        match outcome {
            ProgressOutcome::Recorded(update) => *update,
            other => panic!("expected recorded progress, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn truncated_echo_of_correct_option_scores() {
        let (tracker, bundle, phone) = setup().await;
        let reply = "Introduction to Node.j..";

        let update = recorded(
            tracker
                .record_progress(&phone, bundle.course.id, bundle.lessons[0].id, Some(reply.into()), Utc::now())
                .await
                .unwrap(),
        );

        let verdict = update.verdict.unwrap();
        assert!(verdict.correct);
        assert_eq!(update.course_progress.quiz_score, 100);
        assert_eq!(update.lesson_progress.quiz_score, Some(100));
        assert!(update.lesson_progress.is_completed);
        assert_eq!(update.course_progress.completed_lessons, 1);
    }

    #[tokio::test]
    async fn tapped_option_is_judged_by_its_id() {
        let (tracker, bundle, phone) = setup().await;
        // Title of the correct option, but the id of "A browser".
        let reply = QuizReply {
            text: "Introduction to No..",
            option_id: Some("option_0"),
        };

        let update = recorded(
            tracker
                .record_progress(&phone, bundle.course.id, bundle.lessons[0].id, Some(reply), Utc::now())
                .await
                .unwrap(),
        );

        assert!(!update.verdict.unwrap().correct);
        assert_eq!(update.lesson_progress.quiz_score, Some(0));
    }

    #[tokio::test]
    async fn wrong_answer_returns_correct_option_and_still_completes() {
        let (tracker, bundle, phone) = setup().await;

        let update = recorded(
            tracker
                .record_progress(&phone, bundle.course.id, bundle.lessons[0].id, Some("A browser".into()), Utc::now())
                .await
                .unwrap(),
        );

        let verdict = update.verdict.unwrap();
        assert!(!verdict.correct);
        assert_eq!(verdict.correct_answer, LONG_OPTION);
        assert_eq!(update.lesson_progress.quiz_score, Some(0));
        assert_eq!(update.course_progress.quiz_score, 0);
        assert_eq!(update.course_progress.progress_percent, 50);
    }

    #[tokio::test]
    async fn done_on_every_lesson_completes_course_once() {
        let (tracker, bundle, phone) = setup().await;
        let course_id = bundle.course.id;

        let first = recorded(
            tracker
                .record_progress(&phone, course_id, bundle.lessons[0].id, None, Utc::now())
                .await
                .unwrap(),
        );
        let second = recorded(
            tracker
                .record_progress(&phone, course_id, bundle.lessons[1].id, None, Utc::now())
                .await
                .unwrap(),
        );
        let repeat = recorded(
            tracker
                .record_progress(&phone, course_id, bundle.lessons[1].id, None, Utc::now())
                .await
                .unwrap(),
        );

        assert!(!first.course_completed);
        assert!(second.course_completed);
        assert!(second.course_progress.is_completed);
        assert!(!repeat.counted);
        assert!(!repeat.course_completed);
        assert_eq!(repeat.course_progress.completed_lessons, 2);
        assert_eq!(repeat.course_progress.progress_percent, 100);
    }

    #[tokio::test]
    async fn unknown_references_are_soft_failures() {
        let (tracker, bundle, phone) = setup().await;
        let stranger = PhoneNumber::parse("+911111111").unwrap();

        assert_eq!(
            tracker
                .record_progress(&stranger, bundle.course.id, bundle.lessons[0].id, None, Utc::now())
                .await
                .unwrap(),
            ProgressOutcome::LearnerNotFound
        );
        assert_eq!(
            tracker
                .record_progress(&phone, CourseId::new(), bundle.lessons[0].id, None, Utc::now())
                .await
                .unwrap(),
            ProgressOutcome::CourseNotFound
        );
        assert_eq!(
            tracker
                .record_progress(&phone, bundle.course.id, LessonId::new(), None, Utc::now())
                .await
                .unwrap(),
            ProgressOutcome::LessonNotFound
        );
    }
}
