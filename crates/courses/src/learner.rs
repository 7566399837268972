use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use microlearn_core::{CourseId, Entity, LearnerId, PhoneNumber};

/// A message recipient. Learner management itself happens elsewhere; the
/// delivery core only needs identity, a display name and a phone number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Learner {
    pub id: LearnerId,
    pub name: String,
    pub phone: PhoneNumber,
}

impl Entity for Learner {
    type Id = LearnerId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// A learner's enrollment in a course. Unique per (learner, course).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    pub learner_id: LearnerId,
    pub course_id: CourseId,
    pub enrolled_at: DateTime<Utc>,
}
