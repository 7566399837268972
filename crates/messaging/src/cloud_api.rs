//! WhatsApp Cloud API client.
//!
//! Every message is a `POST {base}/{phone_number_id}/messages` with a bearer
//! token. The response carries the recipient's `wa_id` and the provider
//! message id used to correlate status webhooks and replies.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use microlearn_core::{PhoneNumber, ProviderLimits};

use crate::gateway::{GatewayError, MessagingGateway, SendReceipt};
use crate::outbound::OutboundMessage;

/// Connection settings for the Cloud API.
#[derive(Debug, Clone)]
pub struct CloudApiConfig {
    /// e.g. `https://graph.facebook.com/v18.0`
    pub base_url: String,
    pub phone_number_id: String,
    pub access_token: String,
    /// Upper bound on a single send, connect included.
    pub timeout: Duration,
    pub limits: ProviderLimits,
}

pub struct CloudApiGateway {
    client: reqwest::Client,
    config: CloudApiConfig,
}

impl CloudApiGateway {
    pub fn new(config: CloudApiConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/{}/messages",
            self.config.base_url.trim_end_matches('/'),
            self.config.phone_number_id
        )
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    contacts: Vec<ContactRef>,
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct ContactRef {
    wa_id: String,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[async_trait]
impl MessagingGateway for CloudApiGateway {
    #[instrument(skip(self, message), fields(to = %to, kind = message.kind()), err)]
    async fn send(
        &self,
        to: &PhoneNumber,
        message: &OutboundMessage,
    ) -> Result<SendReceipt, GatewayError> {
        message.validate(&self.config.limits)?;

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.access_token)
            .json(&request_body(to, message))
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = provider_error_message(&body).unwrap_or(body);
            warn!(status = status.as_u16(), error = %message, "provider rejected message");
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: SendResponse = response.json().await.map_err(map_reqwest_error)?;
        let provider_message_id = parsed
            .messages
            .into_iter()
            .next()
            .map(|m| m.id)
            .ok_or_else(|| GatewayError::Decode("response has no message id".to_string()))?;
        let recipient_id = parsed
            .contacts
            .into_iter()
            .next()
            .map(|c| c.wa_id)
            .unwrap_or_else(|| to.digits().to_string());

        debug!(provider_message_id = %provider_message_id, "message accepted by provider");
        Ok(SendReceipt {
            provider_message_id,
            recipient_id,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout
    } else if err.is_decode() {
        GatewayError::Decode(err.to_string())
    } else {
        GatewayError::Transport(err.to_string())
    }
}

/// `error.message` from a Graph API error body.
fn provider_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("error")?
        .get("message")?
        .as_str()
        .map(str::to_string)
}

/// JSON request body for a message.
pub fn request_body(to: &PhoneNumber, message: &OutboundMessage) -> Value {
    let mut body = json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to.digits(),
    });

    let (kind, content) = match message {
        OutboundMessage::Text { body } => ("text", json!({ "preview_url": true, "body": body })),
        OutboundMessage::Template(t) => {
            let params = |values: &[String]| -> Vec<Value> {
                values
                    .iter()
                    .map(|v| json!({ "type": "text", "text": v }))
                    .collect()
            };
            let mut components = Vec::new();
            if !t.header_params.is_empty() {
                components.push(json!({ "type": "header", "parameters": params(&t.header_params) }));
            }
            if !t.body_params.is_empty() {
                components.push(json!({ "type": "body", "parameters": params(&t.body_params) }));
            }
            if let Some(payload) = &t.quick_reply {
                components.push(json!({
                    "type": "button",
                    "sub_type": "quick_reply",
                    "index": "0",
                    "parameters": [{ "type": "payload", "payload": payload }],
                }));
            }
            (
                "template",
                json!({
                    "name": t.name,
                    "language": { "code": t.language },
                    "components": components,
                }),
            )
        }
        OutboundMessage::Image { url, caption } => {
            ("image", json!({ "link": url, "caption": caption }))
        }
        OutboundMessage::Document {
            url,
            filename,
            caption,
        } => (
            "document",
            json!({ "link": url, "filename": filename, "caption": caption }),
        ),
        OutboundMessage::Video { url, caption } => {
            ("video", json!({ "link": url, "caption": caption }))
        }
        OutboundMessage::Buttons { body, buttons } => {
            let buttons: Vec<Value> = buttons
                .iter()
                .map(|b| json!({ "type": "reply", "reply": { "id": b.id, "title": b.title } }))
                .collect();
            (
                "interactive",
                json!({
                    "type": "button",
                    "body": { "text": body },
                    "action": { "buttons": buttons },
                }),
            )
        }
        OutboundMessage::List {
            body,
            button_label,
            rows,
        } => {
            let rows: Vec<Value> = rows
                .iter()
                .map(|r| {
                    let mut row = json!({ "id": r.id, "title": r.title });
                    if let Some(description) = &r.description {
                        row["description"] = json!(description);
                    }
                    row
                })
                .collect();
            (
                "interactive",
                json!({
                    "type": "list",
                    "body": { "text": body },
                    "action": {
                        "button": button_label,
                        "sections": [{ "title": "Options", "rows": rows }],
                    },
                }),
            )
        }
    };

    body["type"] = json!(kind);
    body[kind] = content;
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::TemplateMessage;

    fn phone() -> PhoneNumber {
        PhoneNumber::parse("+91 98765 43210").unwrap()
    }

    #[test]
    fn text_body_uses_bare_digits() {
        let body = request_body(&phone(), &OutboundMessage::text("hello"));
        assert_eq!(body["to"], "919876543210");
        assert_eq!(body["type"], "text");
        assert_eq!(body["text"]["body"], "hello");
        assert_eq!(body["messaging_product"], "whatsapp");
    }

    #[test]
    fn template_body_includes_components() {
        let msg = OutboundMessage::Template(TemplateMessage {
            name: "course_welcome".to_string(),
            language: "en_US".to_string(),
            header_params: vec![],
            body_params: vec!["Asha".to_string()],
            quick_reply: Some("start".to_string()),
        });
        let body = request_body(&phone(), &msg);
        assert_eq!(body["template"]["language"]["code"], "en_US");
        let components = body["template"]["components"].as_array().unwrap();
        assert_eq!(components.len(), 2);
        assert_eq!(components[0]["type"], "body");
        assert_eq!(components[1]["sub_type"], "quick_reply");
    }

    #[test]
    fn button_body_carries_reply_titles() {
        let options = vec!["Deno".to_string(), "Bun".to_string()];
        let msg = OutboundMessage::buttons("Pick", &options, &ProviderLimits::default());
        let body = request_body(&phone(), &msg);
        assert_eq!(body["type"], "interactive");
        assert_eq!(body["interactive"]["type"], "button");
        assert_eq!(
            body["interactive"]["action"]["buttons"][1]["reply"]["title"],
            "Bun"
        );
    }

    #[test]
    fn list_body_has_one_section() {
        let options: Vec<String> = (0..5).map(|i| format!("Option {i}")).collect();
        let msg = OutboundMessage::choice("Pick", &options, &ProviderLimits::default());
        let body = request_body(&phone(), &msg);
        assert_eq!(body["interactive"]["type"], "list");
        let rows = body["interactive"]["action"]["sections"][0]["rows"]
            .as_array()
            .unwrap();
        assert_eq!(rows.len(), 5);
        assert!(rows[0].get("description").is_none());
    }

    #[test]
    fn provider_error_message_is_extracted() {
        let body = r#"{"error":{"message":"Recipient phone number not in allowed list","code":131030}}"#;
        assert_eq!(
            provider_error_message(body).as_deref(),
            Some("Recipient phone number not in allowed list")
        );
        assert_eq!(provider_error_message("not json"), None);
    }
}
