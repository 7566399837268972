//! `microlearn-core` — shared domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the domain error model, phone numbers, and the display limits
//! imposed by the messaging provider.

pub mod entity;
pub mod error;
pub mod id;
pub mod phone;
pub mod text;
pub mod value_object;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{AdminId, CourseId, LearnerId, LessonId, QuizId};
pub use phone::PhoneNumber;
pub use text::{
    ELLIPSIS, ProviderLimits, ellipsized_prefix, option_id, parse_option_id, truncate_label,
};
pub use value_object::ValueObject;
