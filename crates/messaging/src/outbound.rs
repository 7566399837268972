//! Outbound message model.

use serde::{Deserialize, Serialize};

use microlearn_core::{ProviderLimits, option_id, truncate_label};

use crate::gateway::GatewayError;

/// A pre-approved provider template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateMessage {
    pub name: String,
    pub language: String,
    #[serde(default)]
    pub header_params: Vec<String>,
    #[serde(default)]
    pub body_params: Vec<String>,
    /// Payload for the template's first quick-reply button, if it has one.
    #[serde(default)]
    pub quick_reply: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyButton {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRow {
    pub id: String,
    pub title: String,
    /// Full option text when the title had to be shortened.
    #[serde(default)]
    pub description: Option<String>,
}

/// One message to one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Text {
        body: String,
    },
    Template(TemplateMessage),
    Image {
        url: String,
        caption: Option<String>,
    },
    Document {
        url: String,
        filename: Option<String>,
        caption: Option<String>,
    },
    Video {
        url: String,
        caption: Option<String>,
    },
    Buttons {
        body: String,
        buttons: Vec<ReplyButton>,
    },
    List {
        body: String,
        button_label: String,
        rows: Vec<ListRow>,
    },
}

impl OutboundMessage {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }

    /// Reply buttons, one per option, titles shortened to the provider cap.
    pub fn buttons(body: impl Into<String>, options: &[String], limits: &ProviderLimits) -> Self {
        let buttons = options
            .iter()
            .enumerate()
            .map(|(i, option)| ReplyButton {
                id: option_id(i),
                title: truncate_label(option, limits.button_title_max),
            })
            .collect();
        Self::Buttons {
            body: body.into(),
            buttons,
        }
    }

    /// A list message, one row per option, titles shortened to the row cap.
    pub fn list(
        body: impl Into<String>,
        button_label: impl Into<String>,
        options: &[String],
        limits: &ProviderLimits,
    ) -> Self {
        let rows = options
            .iter()
            .enumerate()
            .map(|(i, option)| {
                let title = truncate_label(option, limits.list_row_title_max);
                let description = (title != *option).then(|| option.clone());
                ListRow {
                    id: option_id(i),
                    title,
                    description,
                }
            })
            .collect();
        Self::List {
            body: body.into(),
            button_label: button_label.into(),
            rows,
        }
    }

    /// Buttons when the options fit, a list otherwise.
    pub fn choice(body: impl Into<String>, options: &[String], limits: &ProviderLimits) -> Self {
        if options.len() <= limits.max_buttons {
            Self::buttons(body, options, limits)
        } else {
            Self::list(body, "Choose an answer", options, limits)
        }
    }

    /// Short name used in logs and the message audit trail.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Template(_) => "template",
            Self::Image { .. } => "image",
            Self::Document { .. } => "document",
            Self::Video { .. } => "video",
            Self::Buttons { .. } => "interactive_button",
            Self::List { .. } => "interactive_list",
        }
    }

    /// Reject messages the provider would refuse outright.
    pub fn validate(&self, limits: &ProviderLimits) -> Result<(), GatewayError> {
        let invalid = |msg: &str| Err(GatewayError::InvalidMessage(msg.to_string()));
        match self {
            Self::Text { body } if body.trim().is_empty() => invalid("text body is empty"),
            Self::Template(t) if t.name.trim().is_empty() => invalid("template name is empty"),
            Self::Image { url, .. } | Self::Document { url, .. } | Self::Video { url, .. }
                if url.trim().is_empty() =>
            {
                invalid("media url is empty")
            }
            Self::Buttons { buttons, .. } if buttons.is_empty() => invalid("no buttons"),
            Self::Buttons { buttons, .. } if buttons.len() > limits.max_buttons => {
                invalid("too many buttons")
            }
            Self::Buttons { buttons, .. }
                if buttons
                    .iter()
                    .any(|b| b.title.chars().count() > limits.button_title_max) =>
            {
                invalid("button title too long")
            }
            Self::List { rows, .. } if rows.is_empty() => invalid("no list rows"),
            Self::List { rows, .. }
                if rows
                    .iter()
                    .any(|r| r.title.chars().count() > limits.list_row_title_max) =>
            {
                invalid("list row title too long")
            }
            _ => Ok(()),
        }
    }
}
