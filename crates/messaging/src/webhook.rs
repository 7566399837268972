//! Inbound webhook model.
//!
//! The provider posts an envelope `{object, entry: [{changes: [{field, value}]}]}`.
//! A change value carries inbound `messages`, delivery `statuses`, or both.
//! Fields the provider may omit are optional here so unknown event shapes
//! still deserialize and can be acknowledged without processing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use microlearn_core::PhoneNumber;

/// Query parameters of the subscription handshake (`GET /webhook`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VerificationParams {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// Echo the challenge back only for a `subscribe` request presenting the
/// expected token. An empty expected token never verifies.
pub fn verify_subscription(params: &VerificationParams, expected_token: &str) -> Option<String> {
    if expected_token.is_empty() {
        return None;
    }
    match (&params.mode, &params.verify_token, &params.challenge) {
        (Some(mode), Some(token), Some(challenge))
            if mode == "subscribe" && token == expected_token =>
        {
            Some(challenge.clone())
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("webhook payload has no entry")]
    MissingEntry,
    #[error("webhook payload has no change")]
    MissingChange,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub entry: Option<Vec<WebhookEntry>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub changes: Option<Vec<WebhookChange>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookChange {
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub value: ChangeValue,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangeValue {
    #[serde(default)]
    pub messages: Vec<InboundPayload>,
    #[serde(default)]
    pub statuses: Vec<StatusPayload>,
}

impl WebhookEnvelope {
    /// All change values, in payload order.
    ///
    /// An envelope without any entry, or whose entries carry no change at all,
    /// is structurally invalid.
    pub fn changes(&self) -> Result<Vec<&ChangeValue>, EnvelopeError> {
        let entries = match &self.entry {
            Some(entries) if !entries.is_empty() => entries,
            _ => return Err(EnvelopeError::MissingEntry),
        };

        let changes: Vec<&ChangeValue> = entries
            .iter()
            .filter_map(|e| e.changes.as_ref())
            .flatten()
            .map(|c| &c.value)
            .collect();

        if changes.is_empty() {
            return Err(EnvelopeError::MissingChange);
        }
        Ok(changes)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundPayload {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<TextPayload>,
    #[serde(default)]
    pub image: Option<MediaPayload>,
    #[serde(default)]
    pub document: Option<MediaPayload>,
    #[serde(default)]
    pub interactive: Option<InteractivePayload>,
    #[serde(default)]
    pub button: Option<ButtonPayload>,
    #[serde(default)]
    pub context: Option<ContextPayload>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TextPayload {
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaPayload {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InteractivePayload {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub button_reply: Option<ReplyPayload>,
    #[serde(default)]
    pub list_reply: Option<ReplyPayload>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplyPayload {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
}

/// Quick-reply button on a template message.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ButtonPayload {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub payload: Option<String>,
}

/// Reference to the message being replied to.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContextPayload {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusPayload {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub errors: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundKind {
    Text,
    Image,
    Document,
    ButtonReply,
    ListReply,
    QuickReply,
}

impl InboundKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboundKind::Text => "text",
            InboundKind::Image => "image",
            InboundKind::Document => "document",
            InboundKind::ButtonReply => "button_reply",
            InboundKind::ListReply => "list_reply",
            InboundKind::QuickReply => "quick_reply",
        }
    }
}

/// A learner message, normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundMessage {
    pub provider_message_id: String,
    pub from: PhoneNumber,
    pub kind: InboundKind,
    /// Text to interpret: the typed text, a caption, or the selected title.
    pub body: String,
    /// Id of the tapped reply button or list row.
    pub selected_id: Option<String>,
    /// Provider id of the message this one replies to, when present.
    pub reply_to: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
}

impl InboundPayload {
    /// Normalize a supported message.
    ///
    /// Returns `None` for message types that are not processed (stickers,
    /// locations, reactions, ...) and for payloads without a usable sender or id.
    pub fn classify(&self) -> Option<InboundMessage> {
        if self.id.is_empty() {
            return None;
        }
        let from = PhoneNumber::parse(&self.from).ok()?;

        let mut selected_id = None;
        let (kind, body) = match self.kind.as_str() {
            "text" => (InboundKind::Text, self.text.as_ref()?.body.trim().to_string()),
            "image" => {
                let image = self.image.as_ref();
                let caption = image.and_then(|m| m.caption.clone());
                (InboundKind::Image, caption.unwrap_or_default())
            }
            "document" => {
                let doc = self.document.as_ref();
                let body = doc
                    .and_then(|m| m.caption.clone().or_else(|| m.filename.clone()))
                    .unwrap_or_default();
                (InboundKind::Document, body)
            }
            "interactive" => {
                let interactive = self.interactive.as_ref()?;
                let (kind, reply) = match interactive.kind.as_str() {
                    "button_reply" => (InboundKind::ButtonReply, interactive.button_reply.as_ref()?),
                    "list_reply" => (InboundKind::ListReply, interactive.list_reply.as_ref()?),
                    _ => return None,
                };
                selected_id = Some(reply.id.clone()).filter(|id| !id.is_empty());
                (kind, reply.title.clone())
            }
            "button" => (InboundKind::QuickReply, self.button.as_ref()?.text.clone()),
            _ => return None,
        };

        Some(InboundMessage {
            provider_message_id: self.id.clone(),
            from,
            kind,
            body: body.trim().to_string(),
            selected_id,
            reply_to: self.context.as_ref().and_then(|c| c.id.clone()),
            received_at: self.timestamp.as_deref().and_then(parse_unix_timestamp),
        })
    }
}

/// Delivery state of an outbound message. Ordered by progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Accepted,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Accepted => "accepted",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "accepted" => Some(DeliveryStatus::Accepted),
            "sent" => Some(DeliveryStatus::Sent),
            "delivered" => Some(DeliveryStatus::Delivered),
            "read" => Some(DeliveryStatus::Read),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }

    /// Whether moving from `self` to `next` is progress.
    ///
    /// Statuses only move forward; `failed` can replace anything but `read`,
    /// and nothing replaces `failed`.
    pub fn can_advance_to(&self, next: DeliveryStatus) -> bool {
        match (self, next) {
            (DeliveryStatus::Failed, _) => false,
            (DeliveryStatus::Read, DeliveryStatus::Failed) => false,
            (_, DeliveryStatus::Failed) => true,
            (current, next) => next > *current,
        }
    }
}

/// A delivery-status update for an outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    pub provider_message_id: String,
    pub status: DeliveryStatus,
    pub recipient_id: Option<String>,
    pub at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl StatusPayload {
    /// `None` for unknown status values or a missing message id.
    pub fn to_update(&self) -> Option<StatusUpdate> {
        if self.id.is_empty() {
            return None;
        }
        let status = DeliveryStatus::parse(&self.status)?;
        let error = self.errors.first().map(|e| {
            e.get("title")
                .or_else(|| e.get("message"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| e.to_string())
        });
        Some(StatusUpdate {
            provider_message_id: self.id.clone(),
            status,
            recipient_id: self.recipient_id.clone(),
            at: self.timestamp.as_deref().and_then(parse_unix_timestamp),
            error,
        })
    }
}

fn parse_unix_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let secs: i64 = value.trim().parse().ok()?;
    DateTime::from_timestamp(secs, 0)
}
