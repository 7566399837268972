//! Outbound delivery: job payloads, the outbox that sends and records
//! messages, and the job handlers for every lane.

pub mod handlers;
pub mod outbox;
pub mod payloads;

pub use handlers::{
    DONE_LABEL, DONE_PROMPT, LessonHandler, NotificationHandler, ReminderHandler, TextHandler,
    WelcomeHandler, WelcomeTemplate, register_delivery_handlers,
};
pub use outbox::{Origin, Outbox};
pub use payloads::{LessonJob, NotificationJob, ReminderJob, TextJob, WelcomeJob};
