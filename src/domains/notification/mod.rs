pub mod webhook;

pub use webhook::{sign, WebhookNotifier, WebhookPayload};
