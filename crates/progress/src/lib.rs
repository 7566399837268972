//! Learner progress arithmetic.
//!
//! Everything here is a pure state transition on progress rows. Stores apply
//! the same rules atomically (in-memory under a lock, Postgres as single
//! `UPDATE` statements), so the functions double as the reference semantics.

pub mod answer;
pub mod progress;

pub use answer::{AnswerMatcher, QuizReply, QuizVerdict};
pub use progress::{CourseProgress, LessonProgress, percent_of, quiz_score_for};
