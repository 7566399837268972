//! Course catalog domain: courses, lessons, quizzes, learners and enrollments.
//!
//! Pure types and validation only; persistence lives in `microlearn-infra`.

pub mod authoring;
pub mod course;
pub mod learner;
pub mod lesson;

pub use authoring::{AuthoringError, CourseBundle, CourseDraft, LessonDraft, QuizDraft};
pub use course::{Course, CourseStatus};
pub use learner::{Enrollment, Learner};
pub use lesson::{Lesson, MediaKind, Quiz};
