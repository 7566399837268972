//! Course authoring: turning admin-supplied drafts into a validated bundle.
//!
//! Validation happens entirely up front; a draft either becomes a complete
//! [`CourseBundle`] (course + lessons + quizzes with consistent totals) or is
//! rejected without anything being written.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use microlearn_core::{AdminId, CourseId, DomainError, LessonId, QuizId};

use crate::course::{Course, CourseStatus};
use crate::lesson::{Lesson, Quiz};

/// Authoring validation failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthoringError {
    #[error("course name must not be empty")]
    EmptyName,

    #[error("a course needs at least one lesson")]
    NoLessons,

    #[error("lesson day must be at least 1")]
    InvalidDay,

    #[error("duplicate lesson day {0}")]
    DuplicateDay(u32),

    #[error("lesson for day {day}: {field} must not be empty")]
    EmptyLessonField { day: u32, field: &'static str },

    #[error("quiz for day {day}: {reason}")]
    InvalidQuiz { day: u32, reason: String },
}

impl From<AuthoringError> for DomainError {
    fn from(value: AuthoringError) -> Self {
        DomainError::validation(value.to_string())
    }
}

/// Admin-supplied course definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseDraft {
    pub admin_id: AdminId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub lessons: Vec<LessonDraft>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonDraft {
    pub title: String,
    pub content: String,
    pub day: u32,
    #[serde(default)]
    pub document: Option<String>,
    #[serde(default)]
    pub media: Option<String>,
    #[serde(default)]
    pub external_link: Option<String>,
    #[serde(default)]
    pub quiz: Option<QuizDraft>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizDraft {
    pub question: String,
    pub options: Vec<String>,
    pub correct_option: String,
}

/// A validated course with its children, lessons sorted by `day`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseBundle {
    pub course: Course,
    pub lessons: Vec<Lesson>,
    pub quizzes: Vec<Quiz>,
}

impl CourseDraft {
    /// Validate the draft and assign identifiers.
    ///
    /// The resulting course is in `DRAFT` status; publishing is a separate step.
    pub fn build(self, now: DateTime<Utc>) -> Result<CourseBundle, AuthoringError> {
        self.validate()?;

        let course_id = CourseId::new();
        let mut drafts = self.lessons;
        drafts.sort_by_key(|l| l.day);

        let mut lessons = Vec::with_capacity(drafts.len());
        let mut quizzes = Vec::new();

        for draft in drafts {
            let lesson_id = LessonId::new();
            if let Some(quiz) = draft.quiz {
                quizzes.push(Quiz {
                    id: QuizId::new(),
                    lesson_id,
                    question: quiz.question.trim().to_string(),
                    options: quiz.options.iter().map(|o| o.trim().to_string()).collect(),
                    correct_option: quiz.correct_option.trim().to_string(),
                });
            }
            lessons.push(Lesson {
                id: lesson_id,
                course_id,
                title: draft.title.trim().to_string(),
                content: draft.content,
                day: draft.day,
                document: non_blank(draft.document),
                media: non_blank(draft.media),
                external_link: non_blank(draft.external_link),
            });
        }

        let course = Course {
            id: course_id,
            name: self.name.trim().to_string(),
            description: self.description,
            status: CourseStatus::Draft,
            published_at: None,
            total_lessons: lessons.len() as u32,
            total_quizzes: quizzes.len() as u32,
            admin_id: self.admin_id,
            created_at: now,
        };

        Ok(CourseBundle {
            course,
            lessons,
            quizzes,
        })
    }

    pub fn validate(&self) -> Result<(), AuthoringError> {
        if self.name.trim().is_empty() {
            return Err(AuthoringError::EmptyName);
        }
        if self.lessons.is_empty() {
            return Err(AuthoringError::NoLessons);
        }

        let mut days = HashSet::with_capacity(self.lessons.len());
        for lesson in &self.lessons {
            if lesson.day == 0 {
                return Err(AuthoringError::InvalidDay);
            }
            if !days.insert(lesson.day) {
                return Err(AuthoringError::DuplicateDay(lesson.day));
            }
            if lesson.title.trim().is_empty() {
                return Err(AuthoringError::EmptyLessonField {
                    day: lesson.day,
                    field: "title",
                });
            }
            if lesson.content.trim().is_empty() {
                return Err(AuthoringError::EmptyLessonField {
                    day: lesson.day,
                    field: "content",
                });
            }
            if let Some(quiz) = &lesson.quiz {
                quiz.validate(lesson.day)?;
            }
        }
        Ok(())
    }
}

impl QuizDraft {
    fn validate(&self, day: u32) -> Result<(), AuthoringError> {
        let invalid = |reason: &str| AuthoringError::InvalidQuiz {
            day,
            reason: reason.to_string(),
        };

        if self.question.trim().is_empty() {
            return Err(invalid("question must not be empty"));
        }
        if self.options.len() < 2 {
            return Err(invalid("at least two options are required"));
        }

        let mut seen = HashSet::with_capacity(self.options.len());
        for option in &self.options {
            let option = option.trim();
            if option.is_empty() {
                return Err(invalid("options must not be empty"));
            }
            if !seen.insert(option) {
                return Err(invalid("options must be distinct"));
            }
        }

        if !seen.contains(self.correct_option.trim()) {
            return Err(invalid("correct option must be one of the options"));
        }
        Ok(())
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn lesson(day: u32, quiz: Option<QuizDraft>) -> LessonDraft {
        LessonDraft {
            title: format!("Lesson {day}"),
            content: "Some content".to_string(),
            day,
            document: None,
            media: Some("  ".to_string()),
            external_link: None,
            quiz,
        }
    }

    fn quiz(correct: &str) -> QuizDraft {
        QuizDraft {
            question: "Which runtime?".to_string(),
            options: vec!["Deno".to_string(), "Introduction to Node.js Runtime".to_string()],
            correct_option: correct.to_string(),
        }
    }

    fn draft(lessons: Vec<LessonDraft>) -> CourseDraft {
        CourseDraft {
            admin_id: AdminId::new(),
            name: "Backend basics".to_string(),
            description: "A short course".to_string(),
            lessons,
        }
    }

    #[test]
    fn build_sorts_lessons_and_counts_children() {
        let bundle = draft(vec![
            lesson(3, None),
            lesson(1, Some(quiz("Deno"))),
            lesson(2, None),
        ])
        .build(Utc::now())
        .unwrap();

        let days: Vec<u32> = bundle.lessons.iter().map(|l| l.day).collect();
        assert_eq!(days, vec![1, 2, 3]);
        assert_eq!(bundle.course.total_lessons, 3);
        assert_eq!(bundle.course.total_quizzes, 1);
        assert_eq!(bundle.course.status, CourseStatus::Draft);
        assert_eq!(bundle.quizzes[0].lesson_id, bundle.lessons[0].id);
        assert!(bundle.lessons.iter().all(|l| l.course_id == bundle.course.id));
        assert_eq!(bundle.lessons[0].media, None);
    }

    #[test]
    fn duplicate_days_are_rejected() {
        let err = draft(vec![lesson(1, None), lesson(1, None)])
            .build(Utc::now())
            .unwrap_err();
        assert_eq!(err, AuthoringError::DuplicateDay(1));
    }

    #[test]
    fn empty_course_is_rejected() {
        assert_eq!(draft(vec![]).validate(), Err(AuthoringError::NoLessons));

        let mut unnamed = draft(vec![lesson(1, None)]);
        unnamed.name = "   ".to_string();
        assert_eq!(unnamed.validate(), Err(AuthoringError::EmptyName));
    }

    #[test]
    fn correct_option_must_be_listed() {
        let err = draft(vec![lesson(1, Some(quiz("Bun")))])
            .validate()
            .unwrap_err();
        assert!(matches!(err, AuthoringError::InvalidQuiz { day: 1, .. }));
    }

    #[test]
    fn correct_option_matching_ignores_surrounding_whitespace() {
        assert!(draft(vec![lesson(1, Some(quiz(" Deno ")))]).validate().is_ok());
    }

    proptest! {
        #[test]
        fn totals_match_children(days in prop::collection::hash_set(1u32..500, 1..30), with_quiz in any::<u64>()) {
            let lessons: Vec<LessonDraft> = days
                .iter()
                .enumerate()
                .map(|(i, day)| {
                    let q = if (with_quiz >> (i % 64)) & 1 == 1 { Some(quiz("Deno")) } else { None };
                    lesson(*day, q)
                })
                .collect();
            let expected_quizzes = lessons.iter().filter(|l| l.quiz.is_some()).count() as u32;

            let bundle = draft(lessons).build(Utc::now()).unwrap();

            prop_assert_eq!(bundle.course.total_lessons as usize, bundle.lessons.len());
            prop_assert_eq!(bundle.course.total_quizzes as usize, bundle.quizzes.len());
            prop_assert_eq!(bundle.course.total_quizzes, expected_quizzes);
            prop_assert!(bundle.lessons.windows(2).all(|w| w[0].day < w[1].day));
        }
    }
}
