//! Display limits imposed by the messaging provider.
//!
//! Interactive messages cap the length of button and list-row titles. Options
//! longer than the cap are shortened with a trailing ellipsis, and a learner's
//! selection is echoed back in that shortened form, so answer matching has to
//! know the same limits that rendering used.

use serde::{Deserialize, Serialize};

/// Suffix appended to a shortened label.
pub const ELLIPSIS: &str = "..";

const OPTION_ID_PREFIX: &str = "option_";

/// Id of the reply button or list row rendered for the option at `index`.
pub fn option_id(index: usize) -> String {
    format!("{OPTION_ID_PREFIX}{index}")
}

/// Inverse of [`option_id`].
pub fn parse_option_id(id: &str) -> Option<usize> {
    id.strip_prefix(OPTION_ID_PREFIX)?.parse().ok()
}

/// Provider display constraints for interactive messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderLimits {
    /// Maximum number of reply buttons in a button message.
    pub max_buttons: usize,
    /// Maximum characters in a reply-button title.
    pub button_title_max: usize,
    /// Maximum characters in a list-row title.
    pub list_row_title_max: usize,
    /// Characters of the original option kept before the ellipsis when a
    /// list-row title is shortened.
    pub answer_prefix_len: usize,
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self {
            max_buttons: 3,
            button_title_max: 20,
            list_row_title_max: 24,
            answer_prefix_len: 22,
        }
    }
}

/// Shorten `text` to at most `max_chars` characters, ending in [`ELLIPSIS`]
/// when it had to be cut. Counts `char`s, not bytes.
pub fn truncate_label(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(ELLIPSIS.len());
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(ELLIPSIS);
    out
}

/// First `prefix_len` characters of `text` followed by [`ELLIPSIS`].
pub fn ellipsized_prefix(text: &str, prefix_len: usize) -> String {
    let mut out: String = text.chars().take(prefix_len).collect();
    out.push_str(ELLIPSIS);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn short_labels_are_untouched() {
        assert_eq!(truncate_label("Yes", 20), "Yes");
    }

    #[test]
    fn list_row_truncation_keeps_answer_prefix() {
        let limits = ProviderLimits::default();
        let option = "Introduction to Node.js Runtime";
        let row = truncate_label(option, limits.list_row_title_max);
        assert_eq!(row, "Introduction to Node.j..");
        assert_eq!(row, ellipsized_prefix(option, limits.answer_prefix_len));
    }

    #[test]
    fn option_ids_round_trip_and_reject_foreign_ids() {
        assert_eq!(option_id(2), "option_2");
        assert_eq!(parse_option_id(&option_id(2)), Some(2));
        assert_eq!(parse_option_id("option_"), None);
        assert_eq!(parse_option_id("btn_1"), None);
    }

    #[test]
    fn multibyte_characters_are_counted_once() {
        let label = truncate_label("ñññññññññññññññññññññññññ", 5);
        assert_eq!(label, "ñññ..");
    }

    proptest! {
        #[test]
        fn truncated_labels_never_exceed_limit(text in ".{0,64}", max in 3usize..40) {
            prop_assert!(truncate_label(&text, max).chars().count() <= max);
        }
    }
}
