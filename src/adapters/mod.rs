pub mod webhook;

pub use webhook::{validate_webhook_url, WebhookPayload, WebhookSender};
