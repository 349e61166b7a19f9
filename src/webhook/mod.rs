//! Inbound marketplace push notifications

pub mod dispatcher;
pub mod ingress;
pub mod types;

pub use dispatcher::{WebhookDispatcher, dedupe_key};
pub use ingress::{InboundEvent, WebhookIngress, verify_signature};
pub use types::{EventCode, EventLogEntry, EventOutcome, WebhookAck, WebhookPayload};
