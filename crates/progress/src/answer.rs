//! Quiz answer matching.
//!
//! Quiz options are rendered as reply buttons or list rows, both of which have
//! title length caps. A learner tapping a long option echoes back the shortened
//! title, so a reply is correct when it equals the correct option exactly or
//! equals one of the shortened forms the renderer could have produced.
//!
//! Shortened titles can collide, so a tapped button or row is judged by its
//! option id whenever the reply carries one.

use serde::{Deserialize, Serialize};

use microlearn_core::{ProviderLimits, ellipsized_prefix, parse_option_id, truncate_label};

/// A learner's answer to a quiz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuizReply<'a> {
    /// Typed text or the echoed title.
    pub text: &'a str,
    /// Id of the tapped button or list row, when the reply came from one.
    pub option_id: Option<&'a str>,
}

impl<'a> From<&'a str> for QuizReply<'a> {
    fn from(text: &'a str) -> Self {
        Self {
            text,
            option_id: None,
        }
    }
}

/// Outcome of checking a quiz reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizVerdict {
    pub correct: bool,
    pub correct_answer: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AnswerMatcher {
    limits: ProviderLimits,
}

impl AnswerMatcher {
    pub fn new(limits: ProviderLimits) -> Self {
        Self { limits }
    }

    pub fn is_correct(&self, reply: &str, correct_option: &str) -> bool {
        let reply = reply.trim();
        let correct = correct_option.trim();
        if reply.is_empty() {
            return false;
        }
        if reply == correct {
            return true;
        }

        // Only options that were long enough to be cut can match a cut form.
        let len = correct.chars().count();
        (len > self.limits.answer_prefix_len
            && reply == ellipsized_prefix(correct, self.limits.answer_prefix_len))
            || (len > self.limits.button_title_max
                && reply == truncate_label(correct, self.limits.button_title_max))
    }

    /// Judge a reply against the quiz `options`. A known option id decides on
    /// its own; otherwise the text is matched against the correct option.
    pub fn judge(
        &self,
        reply: QuizReply<'_>,
        options: &[String],
        correct_option: &str,
    ) -> QuizVerdict {
        let selected = reply
            .option_id
            .and_then(parse_option_id)
            .and_then(|index| options.get(index));
        let correct = match selected {
            Some(option) => option.trim() == correct_option.trim(),
            None => self.is_correct(reply.text, correct_option),
        };
        QuizVerdict {
            correct,
            correct_answer: correct_option.to_string(),
        }
    }
}
