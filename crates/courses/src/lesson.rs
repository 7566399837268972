use serde::{Deserialize, Serialize};

use microlearn_core::{CourseId, Entity, LessonId, QuizId};

/// A single lesson. `day` orders delivery within its course.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: LessonId,
    pub course_id: CourseId,
    pub title: String,
    pub content: String,
    pub day: u32,
    pub document: Option<String>,
    pub media: Option<String>,
    pub external_link: Option<String>,
}

impl Lesson {
    pub fn media_kind(&self) -> Option<MediaKind> {
        self.media.as_deref().map(MediaKind::from_url)
    }
}

impl Entity for Lesson {
    type Id = LessonId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Multiple-choice question attached to at most one lesson.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quiz {
    pub id: QuizId,
    pub lesson_id: LessonId,
    pub question: String,
    pub options: Vec<String>,
    pub correct_option: String,
}

impl Entity for Quiz {
    type Id = QuizId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// How a lesson's media attachment is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Classify by file extension; anything that is not a known video
    /// container is sent as an image.
    pub fn from_url(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let ext = path
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "mp4" | "3gp" | "mov" | "m4v" | "webm" => MediaKind::Video,
            _ => MediaKind::Image,
        }
    }
}
