use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use microlearn_core::{CourseId, LearnerId, LessonId};

/// `round(part / whole * 100)`, clamped to 0..=100. An empty whole is 0%.
pub fn percent_of(part: u32, whole: u32) -> u32 {
    if whole == 0 {
        return 0;
    }
    let pct = (f64::from(part.min(whole)) * 100.0 / f64::from(whole)).round();
    pct as u32
}

/// Cumulative quiz score after `correct_answers` correct answers out of
/// `total_quizzes` quizzes. Each correct answer is worth `100 / total_quizzes`;
/// rounding is applied to the total so a perfect run is exactly 100.
pub fn quiz_score_for(correct_answers: u32, total_quizzes: u32) -> u32 {
    percent_of(correct_answers, total_quizzes)
}

/// Per (learner, course) progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseProgress {
    pub learner_id: LearnerId,
    pub course_id: CourseId,
    pub completed_lessons: u32,
    pub progress_percent: u32,
    pub correct_answers: u32,
    pub quiz_score: u32,
    pub is_completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CourseProgress {
    pub fn new(learner_id: LearnerId, course_id: CourseId) -> Self {
        Self {
            learner_id,
            course_id,
            completed_lessons: 0,
            progress_percent: 0,
            correct_answers: 0,
            quiz_score: 0,
            is_completed: false,
            completed_at: None,
        }
    }

    /// Count one more completed lesson. Never exceeds `total_lessons`.
    ///
    /// Returns `true` when this call completed the course.
    pub fn record_lesson_completed(&mut self, total_lessons: u32, now: DateTime<Utc>) -> bool {
        self.completed_lessons = (self.completed_lessons + 1).min(total_lessons);
        self.progress_percent = percent_of(self.completed_lessons, total_lessons);

        if !self.is_completed && total_lessons > 0 && self.completed_lessons >= total_lessons {
            self.is_completed = true;
            self.completed_at = Some(now);
            return true;
        }
        false
    }

    /// Count one more correct quiz answer. Never exceeds `total_quizzes`.
    pub fn record_correct_answer(&mut self, total_quizzes: u32) {
        self.correct_answers = (self.correct_answers + 1).min(total_quizzes);
        self.quiz_score = quiz_score_for(self.correct_answers, total_quizzes);
    }
}

/// Per (learner, lesson) progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonProgress {
    pub learner_id: LearnerId,
    pub lesson_id: LessonId,
    pub course_id: CourseId,
    pub is_completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    /// `Some(100)` / `Some(0)` once the lesson's quiz was answered.
    pub quiz_score: Option<u32>,
    pub quiz_reply: Option<String>,
}

impl LessonProgress {
    pub fn new(learner_id: LearnerId, lesson_id: LessonId, course_id: CourseId) -> Self {
        Self {
            learner_id,
            lesson_id,
            course_id,
            is_completed: false,
            completed_at: None,
            quiz_score: None,
            quiz_reply: None,
        }
    }

    /// Mark the lesson complete. Returns `true` only on the first completion.
    pub fn complete(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_completed {
            return false;
        }
        self.is_completed = true;
        self.completed_at = Some(now);
        true
    }

    /// Record a quiz answer. Only the first answer is kept; returns `true`
    /// when this call recorded it.
    pub fn record_answer(&mut self, reply: &str, correct: bool) -> bool {
        if self.quiz_score.is_some() {
            return false;
        }
        self.quiz_score = Some(if correct { 100 } else { 0 });
        self.quiz_reply = Some(reply.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn course_progress() -> CourseProgress {
        CourseProgress::new(LearnerId::new(), CourseId::new())
    }

    #[test]
    fn percent_rounds_half_up() {
        assert_eq!(percent_of(1, 3), 33);
        assert_eq!(percent_of(2, 3), 67);
        assert_eq!(percent_of(3, 3), 100);
        assert_eq!(percent_of(1, 0), 0);
    }

    #[test]
    fn completing_last_lesson_completes_course() {
        let mut progress = course_progress();
        let now = Utc::now();
        assert!(!progress.record_lesson_completed(2, now));
        assert_eq!(progress.progress_percent, 50);
        assert!(progress.record_lesson_completed(2, now));
        assert!(progress.is_completed);
        assert_eq!(progress.completed_at, Some(now));
    }

    #[test]
    fn duplicate_completion_is_clamped() {
        let mut progress = course_progress();
        let now = Utc::now();
        for _ in 0..5 {
            progress.record_lesson_completed(3, now);
        }
        assert_eq!(progress.completed_lessons, 3);
        assert_eq!(progress.progress_percent, 100);
    }

    #[test]
    fn lesson_completion_is_idempotent() {
        let mut lesson = LessonProgress::new(LearnerId::new(), LessonId::new(), CourseId::new());
        let now = Utc::now();
        assert!(lesson.complete(now));
        assert!(!lesson.complete(now));
        assert_eq!(lesson.completed_at, Some(now));
    }

    #[test]
    fn first_quiz_answer_wins() {
        let mut lesson = LessonProgress::new(LearnerId::new(), LessonId::new(), CourseId::new());
        assert!(lesson.record_answer("B", false));
        assert!(!lesson.record_answer("A", true));
        assert_eq!(lesson.quiz_score, Some(0));
        assert_eq!(lesson.quiz_reply.as_deref(), Some("B"));
    }

    proptest! {
        #[test]
        fn all_correct_answers_score_one_hundred(total in 1u32..200) {
            let mut progress = course_progress();
            for _ in 0..total {
                progress.record_correct_answer(total);
            }
            prop_assert_eq!(progress.quiz_score, 100);
        }

        #[test]
        fn repeated_done_never_exceeds_totals(total in 1u32..50, repeats in 1u32..200) {
            let mut progress = course_progress();
            let now = Utc::now();
            for _ in 0..repeats {
                progress.record_lesson_completed(total, now);
            }
            prop_assert!(progress.completed_lessons <= total);
            prop_assert!(progress.progress_percent <= 100);
            prop_assert_eq!(progress.is_completed, repeats >= total);
        }

        #[test]
        fn quiz_score_is_monotonic(total in 1u32..100) {
            let mut progress = course_progress();
            let mut last = 0;
            for _ in 0..total {
                progress.record_correct_answer(total);
                prop_assert!(progress.quiz_score >= last);
                last = progress.quiz_score;
            }
        }
    }
}
