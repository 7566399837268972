//! Messaging provider boundary.
//!
//! Outbound: a [`MessagingGateway`] sends one [`OutboundMessage`] and returns
//! the provider-assigned message id. Implementations:
//! - [`CloudApiGateway`]: WhatsApp Cloud API over HTTPS
//! - [`RecordingGateway`]: in-memory, for tests
//! - [`LoggingGateway`]: logs instead of sending, for local development
//!
//! Inbound: [`webhook`] models the provider's event envelope and normalizes
//! inbound messages and delivery-status updates.

pub mod cloud_api;
pub mod gateway;
pub mod logging;
pub mod outbound;
pub mod recording;
pub mod webhook;

pub use cloud_api::{CloudApiConfig, CloudApiGateway};
pub use gateway::{GatewayError, MessagingGateway, SendReceipt};
pub use logging::LoggingGateway;
pub use outbound::{ListRow, OutboundMessage, ReplyButton, TemplateMessage};
pub use recording::{RecordingGateway, SentMessage};
pub use webhook::{
    DeliveryStatus, EnvelopeError, InboundKind, InboundMessage, StatusUpdate, VerificationParams,
    WebhookEnvelope, verify_subscription,
};
